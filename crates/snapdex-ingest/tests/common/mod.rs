//! Shared fixtures for snapdex-ingest integration tests
//!
//! Builds images, layer bundles and manifests in memory, serves them from a
//! wiremock server and wires an orchestrator to a temporary data directory.

#![allow(dead_code)]

use async_trait::async_trait;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage, Rgba, RgbaImage};
use serde_json::{json, Value};
use snapdex_common::ImageIdentity;
use snapdex_ingest::error::StorageError;
use snapdex_ingest::storage::LocalStorage;
use snapdex_ingest::{
    JobOrchestrator, MasterIndex, PipelineConfig, RetryPolicy, StorageLocation, StorageSink,
};
use std::io::{Cursor, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Initialize tracing for tests
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,snapdex_ingest=debug")),
        )
        .with_test_writer()
        .try_init();
}

// ============================================================================
// Images
// ============================================================================

pub fn png(image: &DynamicImage) -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    image
        .write_to(&mut out, ImageFormat::Png)
        .expect("encode png");
    out.into_inner()
}

/// Opaque RGB image with a pattern that varies with `seed`
pub fn photo(seed: u8) -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_fn(24, 16, |x, y| {
        Rgb([
            seed.wrapping_mul(37).wrapping_add(x as u8 * 9),
            seed.wrapping_mul(11).wrapping_add(y as u8 * 13),
            seed,
        ])
    }))
}

pub fn photo_png(seed: u8) -> Vec<u8> {
    png(&photo(seed))
}

/// Uniform RGBA layer
pub fn overlay(width: u32, height: u32, pixel: [u8; 4]) -> DynamicImage {
    DynamicImage::ImageRgba8(RgbaImage::from_pixel(width, height, Rgba(pixel)))
}

/// Uniform RGB image
pub fn solid(width: u32, height: u32, pixel: [u8; 3]) -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb(pixel)))
}

/// ZIP bundle with a `-main` and an `-overlay` layer
pub fn bundle(main: &[u8], overlay: &[u8]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::FileOptions::default();
    writer
        .start_file("0F1E2D3C-main.png", options)
        .expect("start main");
    writer.write_all(main).expect("write main");
    writer
        .start_file("0F1E2D3C-overlay.png", options)
        .expect("start overlay");
    writer.write_all(overlay).expect("write overlay");
    writer.finish().expect("finish zip").into_inner()
}

// ============================================================================
// Manifests
// ============================================================================

/// One manifest record pointing at `url`
pub fn record(url: &str, media_type: &str, minute: u32) -> Value {
    json!({
        "Date": format!("2024-03-15 14:{:02}:00 UTC", minute % 60),
        "Media Type": media_type,
        "Location": "Latitude, Longitude: 37.7749, -122.4194",
        "Media Download Url": url,
    })
}

pub fn manifest(records: Vec<Value>) -> String {
    json!({ "Saved Media": records }).to_string()
}

/// Manifest with one photo record per path on `server`
pub fn photo_manifest(server: &MockServer, paths: &[&str]) -> String {
    manifest(
        paths
            .iter()
            .enumerate()
            .map(|(i, p)| record(&format!("{}{}", server.uri(), p), "Image", i as u32))
            .collect(),
    )
}

/// Serve `body` at `route`
pub async fn serve(server: &MockServer, route: &str, body: Vec<u8>, content_type: &str) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(body)
                .insert_header("content-type", content_type),
        )
        .mount(server)
        .await;
}

/// Respond with `status` at `route`
pub async fn serve_status(server: &MockServer, route: &str, status: u16) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(status))
        .mount(server)
        .await;
}

// ============================================================================
// Pipeline wiring
// ============================================================================

/// Fast retries and short timeouts
pub fn test_config() -> PipelineConfig {
    PipelineConfig {
        fetch_concurrency: 4,
        process_concurrency: 4,
        fetch_timeout: Duration::from_secs(5),
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
        },
        job_timeout: Some(Duration::from_secs(30)),
    }
}

/// Temp data directory with an index and local storage
pub struct TestEnv {
    pub dir: TempDir,
    pub index: Arc<MasterIndex>,
}

impl TestEnv {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("temp dir");
        let index = Arc::new(MasterIndex::open(dir.path().join("index")).expect("open index"));
        Self { dir, index }
    }

    pub fn local_storage(&self) -> LocalStorage {
        LocalStorage::new(self.dir.path().join("storage"))
    }

    pub fn counting_storage(&self) -> Arc<CountingSink<LocalStorage>> {
        Arc::new(CountingSink::new(self.local_storage()))
    }

    pub fn orchestrator<S: StorageSink>(
        &self,
        config: PipelineConfig,
        sink: Arc<S>,
    ) -> JobOrchestrator<S> {
        JobOrchestrator::new(config, Arc::clone(&self.index), sink).expect("orchestrator")
    }

    /// Files written under the local storage root
    pub fn stored_files(&self) -> usize {
        std::fs::read_dir(self.dir.path().join("storage").join("images"))
            .map(|dir| dir.count())
            .unwrap_or(0)
    }
}

// ============================================================================
// Sinks
// ============================================================================

/// Counts calls to `put` on the wrapped sink, delaying each write
pub struct CountingSink<S> {
    inner: S,
    puts: AtomicUsize,
    delay: Duration,
}

impl<S> CountingSink<S> {
    pub fn new(inner: S) -> Self {
        Self::with_delay(inner, Duration::from_millis(5))
    }

    pub fn with_delay(inner: S, delay: Duration) -> Self {
        Self {
            inner,
            puts: AtomicUsize::new(0),
            delay,
        }
    }

    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<S: StorageSink> StorageSink for CountingSink<S> {
    fn backend_name(&self) -> &'static str {
        self.inner.backend_name()
    }

    async fn ensure_ready(&self) -> Result<(), StorageError> {
        self.inner.ensure_ready().await
    }

    async fn put(
        &self,
        identity: &ImageIdentity,
        bytes: Vec<u8>,
    ) -> Result<StorageLocation, StorageError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.inner.put(identity, bytes).await
    }

    async fn exists(&self, identity: &ImageIdentity) -> Result<bool, StorageError> {
        self.inner.exists(identity).await
    }

    async fn get(&self, identity: &ImageIdentity) -> Result<Vec<u8>, StorageError> {
        self.inner.get(identity).await
    }
}

/// A backend that is down: either from the start or on first write
pub struct BrokenSink {
    pub ready: bool,
    pub puts: AtomicUsize,
}

impl BrokenSink {
    pub fn unreachable() -> Self {
        Self {
            ready: false,
            puts: AtomicUsize::new(0),
        }
    }

    pub fn failing_writes() -> Self {
        Self {
            ready: true,
            puts: AtomicUsize::new(0),
        }
    }

    fn down() -> StorageError {
        StorageError::Unavailable {
            backend: "broken",
            reason: "connection refused".to_string(),
        }
    }
}

#[async_trait]
impl StorageSink for BrokenSink {
    fn backend_name(&self) -> &'static str {
        "broken"
    }

    async fn ensure_ready(&self) -> Result<(), StorageError> {
        if self.ready {
            Ok(())
        } else {
            Err(Self::down())
        }
    }

    async fn put(
        &self,
        _identity: &ImageIdentity,
        _bytes: Vec<u8>,
    ) -> Result<StorageLocation, StorageError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        Err(Self::down())
    }

    async fn exists(&self, _identity: &ImageIdentity) -> Result<bool, StorageError> {
        Err(Self::down())
    }

    async fn get(&self, _identity: &ImageIdentity) -> Result<Vec<u8>, StorageError> {
        Err(Self::down())
    }
}
