//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use fetchq_core::config::MAX_POOL_SIZE;
use url::Url;

/// Prioritized, cached HTTP fetching with resumable downloads.
#[derive(Parser, Debug)]
#[command(name = "fetchq")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// JSON engine config file
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Number of network workers (overrides the config file)
    #[arg(short = 'w', long, global = true, value_parser = parse_workers)]
    pub workers: Option<usize>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Fetch a URL and print the response body
    Get {
        /// The http(s) URL to fetch
        #[arg(value_parser = parse_http_url)]
        url: String,
    },

    /// Download a URL into a file, resuming a previous partial transfer
    Download {
        /// The http(s) URL to download
        #[arg(value_parser = parse_http_url)]
        url: String,

        /// Where to store the file
        path: PathBuf,
    },
}

fn parse_http_url(raw: &str) -> Result<String, String> {
    let url = Url::parse(raw).map_err(|e| format!("invalid URL `{raw}`: {e}"))?;
    match url.scheme() {
        "http" | "https" => Ok(url.to_string()),
        other => Err(format!("unsupported scheme `{other}`, expected http or https")),
    }
}

fn parse_workers(raw: &str) -> Result<usize, String> {
    let workers: usize = raw.parse().map_err(|e| format!("invalid worker count `{raw}`: {e}"))?;
    if (2..=MAX_POOL_SIZE).contains(&workers) {
        Ok(workers)
    } else {
        Err(format!("worker count must be between 2 and {MAX_POOL_SIZE}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_get_parses_url() {
        let args = Args::try_parse_from(["fetchq", "get", "https://example.com/a"]).unwrap();
        assert_eq!(args.verbose, 0);
        assert!(!args.quiet);
        match args.command {
            Command::Get { url } => assert_eq!(url, "https://example.com/a"),
            Command::Download { .. } => panic!("expected get"),
        }
    }

    #[test]
    fn test_cli_download_takes_url_and_path() {
        let args =
            Args::try_parse_from(["fetchq", "download", "http://example.com/f.iso", "/tmp/f.iso"])
                .unwrap();
        match args.command {
            Command::Download { url, path } => {
                assert_eq!(url, "http://example.com/f.iso");
                assert_eq!(path, PathBuf::from("/tmp/f.iso"));
            }
            Command::Get { .. } => panic!("expected download"),
        }
    }

    #[test]
    fn test_cli_global_flags_after_subcommand() {
        let args = Args::try_parse_from([
            "fetchq",
            "get",
            "https://example.com",
            "-vv",
            "--workers",
            "6",
            "--config",
            "/etc/fetchq.json",
        ])
        .unwrap();
        assert_eq!(args.verbose, 2);
        assert_eq!(args.workers, Some(6));
        assert_eq!(args.config, Some(PathBuf::from("/etc/fetchq.json")));
    }

    #[test]
    fn test_cli_rejects_non_http_scheme() {
        let err = Args::try_parse_from(["fetchq", "get", "ftp://example.com/a"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn test_cli_rejects_out_of_range_workers() {
        let err = Args::try_parse_from(["fetchq", "-w", "1", "get", "https://example.com"])
            .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn test_cli_requires_subcommand() {
        assert!(Args::try_parse_from(["fetchq"]).is_err());
    }

    #[test]
    fn test_cli_version_flag_shows_version() {
        let err = Args::try_parse_from(["fetchq", "--version"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayVersion);
    }
}
