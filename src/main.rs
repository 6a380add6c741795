//! CLI entry point for fetchq.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use fetchq_core::request::StringStrategy;
use fetchq_core::{DownloadStatus, Engine, EngineConfig, Listener, RequestError};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};
use tracing::{debug, info, warn};

mod cli;

use cli::{Args, Command};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    let config = load_config(args.config.as_deref(), args.workers)?;
    let engine = Engine::with_default_network(config).context("failed to start engine")?;

    let outcome = match args.command {
        Command::Get { url } => get(&engine, &url).await,
        Command::Download { url, path } => download(&engine, &url, &path, args.quiet).await,
    };
    engine.shutdown().await;
    outcome
}

fn load_config(path: Option<&Path>, workers: Option<usize>) -> Result<EngineConfig> {
    let mut config = match path {
        Some(path) => EngineConfig::from_json_file(path)?,
        None => EngineConfig::default(),
    };
    if let Some(workers) = workers {
        config.network_pool_size = workers;
        config.download_parallelism = config.download_parallelism.min(workers - 1);
    }
    config.validate()?;
    Ok(config)
}

/// Terminal outcome of one request, forwarded from the delivery context.
#[derive(Debug)]
enum Outcome<T> {
    Done(T),
    Failed(RequestError),
    Cancelled,
}

/// Forwards the first terminal callback to the waiting command.
struct Forward<T> {
    tx: UnboundedSender<Outcome<T>>,
    progress: Option<ProgressBar>,
}

impl<T: Send + 'static> Listener<T> for Forward<T> {
    fn on_retry(&self) {
        debug!("retrying");
    }

    fn on_used_cache(&self) {
        debug!("served from cache");
    }

    fn on_success(&self, response: T) {
        let _ = self.tx.send(Outcome::Done(response));
    }

    fn on_error(&self, error: RequestError) {
        let _ = self.tx.send(Outcome::Failed(error));
    }

    fn on_cancel(&self) {
        let _ = self.tx.send(Outcome::Cancelled);
    }

    fn on_progress_change(&self, file_size: u64, downloaded: u64) {
        if let Some(bar) = &self.progress {
            bar.set_length(file_size);
            bar.set_position(downloaded);
        }
    }
}

async fn get(engine: &Engine, url: &str) -> Result<()> {
    let (tx, mut rx) = unbounded_channel();
    let request = engine
        .request(url, StringStrategy::new())
        .listener(Arc::new(Forward { tx, progress: None }))
        .build();
    engine.queue().add(request);

    match rx.recv().await {
        Some(Outcome::Done(body)) => {
            println!("{body}");
            Ok(())
        }
        Some(Outcome::Failed(error)) => Err(error).with_context(|| format!("GET {url} failed")),
        Some(Outcome::Cancelled) | None => bail!("GET {url} did not complete"),
    }
}

async fn download(engine: &Engine, url: &str, path: &Path, quiet: bool) -> Result<()> {
    let progress = (!quiet).then(|| {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template(
                "{spinner} [{elapsed_precise}] {bar:40} {bytes}/{total_bytes} ({bytes_per_sec})",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        bar
    });

    let (tx, mut rx) = unbounded_channel::<Outcome<PathBuf>>();
    let listener = Arc::new(Forward {
        tx,
        progress: progress.clone(),
    });
    let task = engine.downloader().add(path, url, listener);
    info!(url, path = %path.display(), "download started");

    let outcome = tokio::select! {
        outcome = rx.recv() => outcome,
        _ = tokio::signal::ctrl_c() => {
            task.pause();
            warn!(status = %task.status(), "download paused; run again to resume");
            None
        }
    };
    if let Some(bar) = &progress {
        bar.finish_and_clear();
    }

    match outcome {
        Some(Outcome::Done(stored)) => {
            info!(path = %stored.display(), "download complete");
            Ok(())
        }
        Some(Outcome::Failed(error)) => {
            Err(error).with_context(|| format!("download of {url} failed"))
        }
        Some(Outcome::Cancelled) => bail!("download of {url} was cancelled"),
        None if task.status() == DownloadStatus::Paused => Ok(()),
        None => bail!("download of {url} did not complete"),
    }
}
