//! ContentFetcher tests against a mock HTTP server

mod common;

use common::*;
use snapdex_ingest::error::FetchError;
use snapdex_ingest::manifest::ManifestParser;
use snapdex_ingest::{ContentFetcher, ManifestEntry, PayloadKind, RetryPolicy};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fetcher() -> ContentFetcher {
    ContentFetcher::new(
        Duration::from_secs(5),
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
        },
    )
    .expect("fetcher")
}

fn entry(server: &MockServer, route: &str) -> ManifestEntry {
    let parsed = ManifestParser::new()
        .parse(&photo_manifest(server, &[route]))
        .expect("parse");
    parsed.entries.into_iter().next().expect("one entry")
}

#[tokio::test]
async fn test_fetch_image() {
    let server = MockServer::start().await;
    serve(&server, "/img", photo_png(1), "image/png").await;

    let payload = fetcher()
        .fetch(&entry(&server, "/img"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(payload.bytes, photo_png(1));
    assert_eq!(payload.kind, PayloadKind::Image);
    assert_eq!(payload.content_type.as_deref(), Some("image/png"));
    assert_eq!(payload.attempts, 1);
}

#[tokio::test]
async fn test_fetch_detects_archive() {
    let server = MockServer::start().await;
    let zip = bundle(&photo_png(1), &png(&overlay(4, 4, [0, 0, 0, 0])));
    serve(&server, "/bundle", zip, "application/octet-stream").await;

    let payload = fetcher()
        .fetch(&entry(&server, "/bundle"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(payload.kind, PayloadKind::Archive);
}

#[tokio::test]
async fn test_not_found_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/gone"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let err = fetcher()
        .fetch(&entry(&server, "/gone"), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, FetchError::Terminal { status: Some(404), .. }));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_server_error_then_success() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    serve(&server, "/flaky", photo_png(2), "image/png").await;

    let payload = fetcher()
        .fetch(&entry(&server, "/flaky"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(payload.attempts, 2);
    assert_eq!(payload.bytes, photo_png(2));
}

#[tokio::test]
async fn test_rate_limit_exhausts_attempts() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/busy"))
        .respond_with(ResponseTemplate::new(429))
        .expect(3)
        .mount(&server)
        .await;

    let err = fetcher()
        .fetch(&entry(&server, "/busy"), &CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        FetchError::Exhausted { attempts, ref reason } => {
            assert_eq!(attempts, 3);
            assert!(reason.contains("429"));
        },
        other => panic!("expected Exhausted, got {:?}", other),
    }
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let token = CancellationToken::new();
    token.cancel();

    let err = fetcher()
        .fetch(&entry(&server, "/img"), &token)
        .await
        .unwrap_err();
    assert_eq!(err, FetchError::Cancelled);
}

#[tokio::test]
async fn test_cancel_interrupts_backoff() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/down"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;

    let slow_retry = ContentFetcher::new(
        Duration::from_secs(5),
        RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(10),
        },
    )
    .unwrap();

    let token = CancellationToken::new();
    let canceller = {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            token.cancel();
        })
    };

    let err = slow_retry
        .fetch(&entry(&server, "/down"), &token)
        .await
        .unwrap_err();
    canceller.await.unwrap();

    assert_eq!(err, FetchError::Cancelled);
}
