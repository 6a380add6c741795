//! Resumable file downloads.
//!
//! # Overview
//!
//! Bytes are streamed into `<store>.tmp` and the temporary file is renamed to
//! the store path only after the transfer completes. Every attempt asks for
//! `Range: bytes=<temp length>-`, so a retry after a timeout resumes where the
//! previous attempt stopped. The body is written at the offset that attempt
//! asked for; anything past it in the temporary file is truncated first.
//!
//! A server that does not confirm range support gets a fresh transfer: the
//! temporary file is truncated and written from offset zero. A server whose
//! `Content-Range` disagrees with the resumption point fails the request with
//! [`RequestError::InvalidContentRange`]; the temporary file is left in place
//! for the caller to remove.

use std::ffi::OsString;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::header::{ACCEPT_ENCODING, CONTENT_RANGE, HeaderMap, HeaderValue, RANGE};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, BufWriter};
use tracing::{debug, instrument};

use super::{CachePolicy, NetworkResponse, Priority, RequestStrategy, Response, TransferContext};
use crate::error::RequestError;
use crate::network::RawResponse;
use crate::retry::{DOWNLOAD_MAX_RETRIES, RetryPolicy};

/// Suffix appended to the store path to name the temporary file.
pub const TEMP_SUFFIX: &str = ".tmp";

/// Downloads a URL into a file, resuming partial transfers.
///
/// The delivered value is the store path.
#[derive(Debug, Clone)]
pub struct FileDownloadStrategy {
    store_path: PathBuf,
    temp_path: PathBuf,
}

impl FileDownloadStrategy {
    /// Creates a strategy writing to `store_path` via `<store_path>.tmp`.
    pub fn new(store_path: impl Into<PathBuf>) -> Self {
        let store_path = store_path.into();
        let mut temp = OsString::from(store_path.as_os_str());
        temp.push(TEMP_SUFFIX);
        Self {
            store_path,
            temp_path: PathBuf::from(temp),
        }
    }

    /// Final location of the downloaded file.
    #[must_use]
    pub fn store_path(&self) -> &Path {
        &self.store_path
    }

    /// Location of the partial transfer.
    #[must_use]
    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }
}

#[async_trait]
impl RequestStrategy for FileDownloadStrategy {
    type Output = PathBuf;

    fn priority(&self) -> Priority {
        Priority::Low
    }

    fn cache_policy(&self) -> CachePolicy {
        CachePolicy::Never
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::with_max_retries(DOWNLOAD_MAX_RETRIES)
    }

    async fn prepare(&self, url: &str, headers: &mut HeaderMap) -> Result<(), RequestError> {
        let offset = file_len(&self.temp_path).await?;
        let range = HeaderValue::from_str(&format!("bytes={offset}-"))
            .map_err(|e| RequestError::other(url, e))?;
        headers.insert(RANGE, range);
        // compressed bodies would break byte offsets and progress totals
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
        Ok(())
    }

    #[instrument(skip(self, response, transfer), fields(url = transfer.url(), status = response.status))]
    async fn handle_response(
        &self,
        response: RawResponse,
        transfer: &TransferContext<'_>,
    ) -> Result<Bytes, RequestError> {
        let content_length = response.content_length().unwrap_or(0);
        if content_length == 0 {
            debug!("response has no Content-Length");
        }

        let mut downloaded = requested_offset(transfer);
        let ranged = response.supports_range();
        let mut total = content_length;
        if ranged {
            total += downloaded;

            // absent when the request asked for bytes=0-
            if let Some(actual) = response.header(CONTENT_RANGE).filter(|v| !v.is_empty()) {
                let expected = format!("bytes {downloaded}-{}", total.saturating_sub(1));
                if !actual.contains(&expected) {
                    return Err(RequestError::InvalidContentRange {
                        url: transfer.url().to_string(),
                        expected,
                        actual: actual.to_string(),
                        temp_path: self.temp_path.clone(),
                    });
                }
            }
        }

        if total > 0 && file_len(&self.store_path).await? == total {
            debug!(total, "store file already complete");
            fs::rename(&self.store_path, &self.temp_path)
                .await
                .map_err(|e| RequestError::io(&self.store_path, e))?;
            transfer.report_progress(total, total);
            return Ok(Bytes::new());
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.temp_path)
            .await
            .map_err(|e| RequestError::io(&self.temp_path, e))?;
        if ranged {
            let written = file
                .metadata()
                .await
                .map_err(|e| RequestError::io(&self.temp_path, e))?
                .len();
            if written < downloaded {
                return Err(RequestError::io(
                    &self.temp_path,
                    std::io::Error::other(format!(
                        "temporary file is {written} bytes, shorter than the requested offset {downloaded}"
                    )),
                ));
            }
            file.set_len(downloaded)
                .await
                .map_err(|e| RequestError::io(&self.temp_path, e))?;
            file.seek(SeekFrom::Start(downloaded))
                .await
                .map_err(|e| RequestError::io(&self.temp_path, e))?;
        } else {
            file.set_len(0)
                .await
                .map_err(|e| RequestError::io(&self.temp_path, e))?;
            downloaded = 0;
        }

        let mut writer = BufWriter::new(file);
        let streamed = self
            .stream_body(&mut writer, response, transfer, total, downloaded)
            .await;
        // flush even on failure so the next attempt resumes from the real length
        let flushed = writer
            .flush()
            .await
            .map_err(|e| RequestError::io(&self.temp_path, e));
        streamed?;
        flushed?;
        Ok(Bytes::new())
    }

    async fn parse(
        &self,
        url: &str,
        _response: &NetworkResponse,
    ) -> Result<Response<PathBuf>, RequestError> {
        if file_len(&self.temp_path).await? == 0 {
            return Err(RequestError::parse(url, "download temporary file was invalid"));
        }
        fs::rename(&self.temp_path, &self.store_path)
            .await
            .map_err(|e| RequestError::io(&self.temp_path, e))?;
        Ok(Response::uncached(self.store_path.clone()))
    }
}

impl FileDownloadStrategy {
    async fn stream_body(
        &self,
        writer: &mut BufWriter<fs::File>,
        response: RawResponse,
        transfer: &TransferContext<'_>,
        total: u64,
        mut downloaded: u64,
    ) -> Result<(), RequestError> {
        let mut body = response.body;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            writer
                .write_all(&chunk)
                .await
                .map_err(|e| RequestError::io(&self.temp_path, e))?;

            downloaded += chunk.len() as u64;
            transfer.report_progress(total, downloaded);

            if transfer.is_cancelled() {
                debug!(downloaded, "transfer cancelled");
                return Err(RequestError::cancelled(transfer.url()));
            }
        }
        Ok(())
    }
}

/// Start offset of the `Range: bytes=<n>-` header sent on this attempt.
fn requested_offset(transfer: &TransferContext<'_>) -> u64 {
    transfer
        .request_header(RANGE)
        .and_then(|range| range.strip_prefix("bytes="))
        .and_then(|range| range.strip_suffix('-'))
        .and_then(|start| start.parse().ok())
        .unwrap_or(0)
}

/// Length of the file at `path`, or 0 when it does not exist.
async fn file_len(path: &Path) -> Result<u64, RequestError> {
    match fs::metadata(path).await {
        Ok(metadata) => Ok(metadata.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(RequestError::io(path, e)),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;

    use futures_util::stream;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    use super::*;

    fn raw(headers: &[(&'static str, String)], chunks: Vec<&'static [u8]>) -> RawResponse {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.insert(*name, value.parse().unwrap());
        }
        let body = stream::iter(
            chunks
                .into_iter()
                .map(|c| Ok::<_, RequestError>(Bytes::from_static(c))),
        )
        .boxed();
        RawResponse::new(200, map, body)
    }

    const URL: &str = "http://example.com/f";

    struct Harness {
        cancel: CancellationToken,
        events: Mutex<Vec<(u64, u64)>>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                cancel: CancellationToken::new(),
                events: Mutex::new(Vec::new()),
            }
        }

        /// Prepares headers from the current temp file, then consumes `response`.
        async fn run(
            &self,
            strategy: &FileDownloadStrategy,
            response: RawResponse,
        ) -> Result<Bytes, RequestError> {
            let mut headers = HeaderMap::new();
            strategy.prepare(URL, &mut headers).await?;
            self.run_prepared(strategy, &headers, response).await
        }

        async fn run_prepared(
            &self,
            strategy: &FileDownloadStrategy,
            headers: &HeaderMap,
            response: RawResponse,
        ) -> Result<Bytes, RequestError> {
            let progress = |total: u64, done: u64| self.events.lock().unwrap().push((total, done));
            let transfer = TransferContext::new(URL, headers, &self.cancel, &progress);
            strategy.handle_response(response, &transfer).await
        }
    }

    #[test]
    fn test_temp_path_appends_suffix() {
        let strategy = FileDownloadStrategy::new("/data/movie.mp4");
        assert_eq!(strategy.temp_path(), Path::new("/data/movie.mp4.tmp"));
        assert_eq!(strategy.priority(), Priority::Low);
        assert_eq!(strategy.cache_policy(), CachePolicy::Never);
        assert_eq!(strategy.retry_policy().max_retries(), DOWNLOAD_MAX_RETRIES);
    }

    #[tokio::test]
    async fn test_prepare_sets_range_from_temp_length() {
        let dir = TempDir::new().unwrap();
        let strategy = FileDownloadStrategy::new(dir.path().join("f.bin"));
        let mut headers = HeaderMap::new();

        strategy.prepare("u", &mut headers).await.unwrap();
        assert_eq!(headers.get(RANGE).unwrap(), "bytes=0-");

        std::fs::write(strategy.temp_path(), vec![0u8; 4096]).unwrap();
        strategy.prepare("u", &mut headers).await.unwrap();
        assert_eq!(headers.get(RANGE).unwrap(), "bytes=4096-");
        assert_eq!(headers.get(ACCEPT_ENCODING).unwrap(), "identity");
    }

    #[tokio::test]
    async fn test_fresh_transfer_then_parse_renames() {
        let dir = TempDir::new().unwrap();
        let strategy = FileDownloadStrategy::new(dir.path().join("f.bin"));
        let harness = Harness::new();

        let response = raw(
            &[("content-length", "6".into()), ("accept-ranges", "bytes".into())],
            vec![b"abc", b"def"],
        );
        harness.run(&strategy, response).await.unwrap();
        assert_eq!(*harness.events.lock().unwrap(), vec![(6, 3), (6, 6)]);

        let parsed = strategy
            .parse("u", &NetworkResponse::new(200, Bytes::new(), "UTF-8"))
            .await
            .unwrap();
        assert_eq!(parsed.into_result().unwrap(), strategy.store_path());
        assert_eq!(std::fs::read(strategy.store_path()).unwrap(), b"abcdef");
        assert!(!strategy.temp_path().exists());
    }

    #[tokio::test]
    async fn test_ranged_resume_appends() {
        let dir = TempDir::new().unwrap();
        let strategy = FileDownloadStrategy::new(dir.path().join("f.bin"));
        std::fs::write(strategy.temp_path(), b"abc").unwrap();
        let harness = Harness::new();

        let response = raw(
            &[
                ("content-length", "3".into()),
                ("content-range", "bytes 3-5/6".into()),
            ],
            vec![b"def"],
        );
        harness.run(&strategy, response).await.unwrap();

        assert_eq!(std::fs::read(strategy.temp_path()).unwrap(), b"abcdef");
        assert_eq!(*harness.events.lock().unwrap(), vec![(6, 6)]);
    }

    #[tokio::test]
    async fn test_resume_writes_at_offset_sent_even_if_temp_grew_since() {
        let dir = TempDir::new().unwrap();
        let strategy = FileDownloadStrategy::new(dir.path().join("f.bin"));
        std::fs::write(strategy.temp_path(), b"abc").unwrap();
        let mut headers = HeaderMap::new();
        strategy.prepare(URL, &mut headers).await.unwrap();
        assert_eq!(headers.get(RANGE).unwrap(), "bytes=3-");

        // a previous attempt flushes more bytes after the Range was chosen
        std::fs::write(strategy.temp_path(), b"abcdefgh").unwrap();

        let harness = Harness::new();
        let response = raw(
            &[
                ("content-length", "5".into()),
                ("content-range", "bytes 3-7/8".into()),
            ],
            vec![b"DEFGH"],
        );
        harness.run_prepared(&strategy, &headers, response).await.unwrap();

        assert_eq!(std::fs::read(strategy.temp_path()).unwrap(), b"abcDEFGH");
        assert_eq!(*harness.events.lock().unwrap(), vec![(8, 8)]);
    }

    #[tokio::test]
    async fn test_resume_fails_when_temp_shrank_below_offset() {
        let dir = TempDir::new().unwrap();
        let strategy = FileDownloadStrategy::new(dir.path().join("f.bin"));
        std::fs::write(strategy.temp_path(), b"abcd").unwrap();
        let mut headers = HeaderMap::new();
        strategy.prepare(URL, &mut headers).await.unwrap();
        std::fs::write(strategy.temp_path(), b"ab").unwrap();

        let harness = Harness::new();
        let response = raw(
            &[
                ("content-length", "2".into()),
                ("content-range", "bytes 4-5/6".into()),
            ],
            vec![b"ef"],
        );
        let error = harness
            .run_prepared(&strategy, &headers, response)
            .await
            .unwrap_err();

        assert!(matches!(error, RequestError::Io { .. }));
        assert_eq!(std::fs::read(strategy.temp_path()).unwrap(), b"ab");
    }

    #[tokio::test]
    async fn test_without_range_support_restarts_from_zero() {
        let dir = TempDir::new().unwrap();
        let strategy = FileDownloadStrategy::new(dir.path().join("f.bin"));
        std::fs::write(strategy.temp_path(), b"stale-partial").unwrap();
        let harness = Harness::new();

        let response = raw(&[("content-length", "4".into())], vec![b"full"]);
        harness.run(&strategy, response).await.unwrap();

        assert_eq!(std::fs::read(strategy.temp_path()).unwrap(), b"full");
        assert_eq!(*harness.events.lock().unwrap(), vec![(4, 4)]);
    }

    #[tokio::test]
    async fn test_mismatched_content_range_is_fatal() {
        let dir = TempDir::new().unwrap();
        let strategy = FileDownloadStrategy::new(dir.path().join("f.bin"));
        std::fs::write(strategy.temp_path(), b"abc").unwrap();
        let harness = Harness::new();

        let response = raw(
            &[
                ("content-length", "6".into()),
                ("content-range", "bytes 0-5/6".into()),
            ],
            vec![b"abcdef"],
        );
        let error = harness.run(&strategy, response).await.unwrap_err();

        match error {
            RequestError::InvalidContentRange {
                expected, actual, ..
            } => {
                assert_eq!(expected, "bytes 3-8");
                assert_eq!(actual, "bytes 0-5/6");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(std::fs::read(strategy.temp_path()).unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_complete_store_file_is_not_refetched() {
        let dir = TempDir::new().unwrap();
        let strategy = FileDownloadStrategy::new(dir.path().join("f.bin"));
        std::fs::write(strategy.store_path(), b"12345").unwrap();
        let harness = Harness::new();

        let response = raw(
            &[("content-length", "5".into()), ("accept-ranges", "bytes".into())],
            vec![b"XXXXX"],
        );
        harness.run(&strategy, response).await.unwrap();

        assert_eq!(*harness.events.lock().unwrap(), vec![(5, 5)]);
        assert!(!strategy.store_path().exists());
        assert_eq!(std::fs::read(strategy.temp_path()).unwrap(), b"12345");

        strategy
            .parse("u", &NetworkResponse::new(200, Bytes::new(), "UTF-8"))
            .await
            .unwrap();
        assert_eq!(std::fs::read(strategy.store_path()).unwrap(), b"12345");
    }

    #[tokio::test]
    async fn test_cancel_stops_after_current_chunk() {
        let dir = TempDir::new().unwrap();
        let strategy = FileDownloadStrategy::new(dir.path().join("f.bin"));
        let harness = Harness::new();
        harness.cancel.cancel();

        let response = raw(&[("content-length", "6".into())], vec![b"abc", b"def"]);
        let error = harness.run(&strategy, response).await.unwrap_err();

        assert!(matches!(error, RequestError::Cancelled { .. }));
        assert_eq!(std::fs::read(strategy.temp_path()).unwrap(), b"abc");
        assert!(!strategy.store_path().exists());
    }

    #[tokio::test]
    async fn test_parse_rejects_empty_temp() {
        let dir = TempDir::new().unwrap();
        let strategy = FileDownloadStrategy::new(dir.path().join("f.bin"));
        let error = strategy
            .parse("u", &NetworkResponse::new(200, Bytes::new(), "UTF-8"))
            .await
            .unwrap_err();
        assert!(matches!(error, RequestError::Parse { .. }));
    }
}
