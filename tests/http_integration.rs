//! End-to-end tests through an [`Engine`] over the reqwest transport.
//!
//! These verify charset decoding, caching, error classification and ranged
//! resumption against a wiremock server.

use std::path::PathBuf;
use std::time::Duration;

use fetchq_core::request::StringStrategy;
use fetchq_core::{Engine, EngineConfig};
use tempfile::TempDir;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, ResponseTemplate};

mod support;
use support::socket_guard::start_mock_server_or_skip;
use support::{Event, Recorder, eventually};

fn engine() -> Engine {
    Engine::with_default_network(EngineConfig::default()).unwrap()
}

#[tokio::test]
async fn test_get_decodes_declared_charset() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/latin"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/plain; charset=ISO-8859-1")
                .set_body_bytes(vec![b'c', b'a', b'f', 0xE9]),
        )
        .mount(&server)
        .await;

    let engine = engine();
    let recorder = Recorder::<String>::new();
    engine.queue().add(
        engine
            .request(format!("{}/latin", server.uri()), StringStrategy::new())
            .listener(recorder.clone())
            .build(),
    );
    eventually(|| recorder.finished()).await;

    assert_eq!(recorder.successes(), vec!["café".to_string()]);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_cached_get_hits_server_once() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/cached"))
        .respond_with(ResponseTemplate::new(200).set_body_string("from origin"))
        .expect(1)
        .mount(&server)
        .await;

    let engine = engine();
    let url = format!("{}/cached", server.uri());
    for _ in 0..2 {
        let recorder = Recorder::<String>::new();
        engine.queue().add(
            engine
                .request(&url, StringStrategy::new())
                .cache_ttl(Duration::from_secs(60))
                .listener(recorder.clone())
                .build(),
        );
        eventually(|| recorder.finished()).await;
        assert_eq!(recorder.successes(), vec!["from origin".to_string()]);
    }
    engine.shutdown().await;
}

#[tokio::test]
async fn test_not_found_is_a_final_server_error() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404).set_body_string("nope"))
        .expect(1)
        .mount(&server)
        .await;

    let engine = engine();
    let recorder = Recorder::<String>::new();
    engine.queue().add(
        engine
            .request(format!("{}/missing", server.uri()), StringStrategy::new())
            .listener(recorder.clone())
            .build(),
    );
    eventually(|| recorder.finished()).await;

    assert_eq!(recorder.errors(), vec!["server".to_string()]);
    assert_eq!(recorder.count(|e| matches!(e, Event::Retry)), 0);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_download_resumes_partial_temp_file() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/archive.tar"))
        .and(header("range", "bytes=5-"))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("content-range", "bytes 5-9/10")
                .set_body_bytes(b"56789".to_vec()),
        )
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let store = dir.path().join("archive.tar");
    std::fs::write(dir.path().join("archive.tar.tmp"), b"01234").unwrap();

    let engine = engine();
    let recorder = Recorder::<PathBuf>::new();
    let task = engine.downloader().add(
        &store,
        format!("{}/archive.tar", server.uri()),
        recorder.clone(),
    );
    eventually(|| recorder.finished()).await;

    assert_eq!(recorder.successes(), vec![store.clone()]);
    assert_eq!(std::fs::read(&store).unwrap(), b"0123456789");
    assert!(!dir.path().join("archive.tar.tmp").exists());
    assert_eq!(task.status(), fetchq_core::DownloadStatus::Success);
    engine.shutdown().await;
}
