//! Shared infrastructure for the `stream-download-cache` integration tests.
//!
//! - [`CacheFixture`]: in-memory HTTP server serving media blobs, optionally trickled in chunks.
//! - [`SERVER_RT`]: shared multi-threaded runtime the tests block on.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, LazyLock, Mutex, Once};
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::Path;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use bytes::Bytes;
use futures_util::stream;
use tracing_subscriber::EnvFilter;

/// Runtime shared by all integration tests (fixture servers and cache tasks live on it).
pub static SERVER_RT: LazyLock<tokio::runtime::Runtime> = LazyLock::new(|| {
    init_tracing();
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("failed to build test runtime")
});

/// Install a test-friendly subscriber once. Filter with `RUST_LOG`.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Deterministic, non-repeating-looking test payload.
pub fn payload(len: usize) -> Bytes {
    (0..len)
        .map(|i| (i.wrapping_mul(31) ^ (i >> 8)) as u8)
        .collect::<Vec<u8>>()
        .into()
}

/// Minimal in-memory media server.
///
/// Paths served under base:
/// - `/{name}` for every registered blob, with `Content-Type` guessed from the extension and
///   `Content-Length` always set;
/// - anything else answers `404`.
///
/// Request counters and the last request headers are tracked per path so tests can assert
/// caching behavior (a warm cache must not fetch again).
#[derive(Clone)]
pub struct CacheFixture {
    blobs: Arc<HashMap<String, Bytes>>,
    chunk_size: usize,
    chunk_delay: Duration,
    request_counts: Arc<Mutex<HashMap<String, u64>>>,
    last_headers: Arc<Mutex<HashMap<String, HeaderMap>>>,
}

impl Default for CacheFixture {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheFixture {
    /// Fixture with `track.mp3` (256 KiB) and `short.mp3` (100 bytes).
    pub fn new() -> Self {
        let mut blobs = HashMap::new();
        blobs.insert("track.mp3".to_string(), payload(256 * 1024));
        blobs.insert("short.mp3".to_string(), payload(100));
        Self {
            blobs: Arc::new(blobs),
            chunk_size: 16 * 1024,
            chunk_delay: Duration::ZERO,
            request_counts: Arc::new(Mutex::new(HashMap::new())),
            last_headers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Send bodies in `size`-byte chunks with `delay` before each one.
    pub fn with_chunking(mut self, size: usize, delay: Duration) -> Self {
        self.chunk_size = size.max(1);
        self.chunk_delay = delay;
        self
    }

    /// Bytes served for `name`.
    pub fn blob(&self, name: &str) -> Bytes {
        self.blobs
            .get(name)
            .cloned()
            .unwrap_or_else(|| panic!("fixture has no blob named {name}"))
    }

    /// How many times the fixture served `path` (e.g. `/track.mp3`), 404s included.
    pub fn request_count_for(&self, path: &str) -> Result<u64, String> {
        let lock = self
            .request_counts
            .lock()
            .map_err(|_| "request_counts mutex poisoned".to_string())?;
        Ok(lock.get(path).copied().unwrap_or(0))
    }

    /// Value of header `name` on the most recent request for `path`.
    pub fn last_header(&self, path: &str, name: &str) -> Option<String> {
        let lock = self.last_headers.lock().ok()?;
        lock.get(path)?
            .get(name)?
            .to_str()
            .ok()
            .map(str::to_string)
    }

    /// Start the fixture server and return the base URL (ending with `/`).
    ///
    /// - bind a `std::net::TcpListener` on `127.0.0.1:0`,
    /// - mark it non-blocking,
    /// - hand it off to `tokio::net::TcpListener::from_std`,
    /// - spawn `axum::serve` in the background.
    pub async fn start(&self) -> reqwest::Url {
        let app = self.build_router();

        let listener = std::net::TcpListener::bind("127.0.0.1:0")
            .expect("failed to bind local fixture server");
        listener
            .set_nonblocking(true)
            .expect("failed to set nonblocking on fixture listener");
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let listener = tokio::net::TcpListener::from_std(listener)
                .expect("failed to convert fixture listener to tokio listener");
            axum::serve(listener, app).await.unwrap();
        });

        reqwest::Url::parse(&format!("http://{}/", addr)).expect("failed to build base url")
    }

    fn build_router(&self) -> Router {
        let fixture = self.clone();
        Router::new().route(
            "/{path}",
            get(move |Path(path): Path<String>, headers: HeaderMap| {
                let fixture = fixture.clone();
                async move { fixture.serve_blob(path, headers).await }
            }),
        )
    }

    async fn serve_blob(&self, path: String, headers: HeaderMap) -> Response {
        let key = path.trim_start_matches('/').to_string();
        let req_path = format!("/{key}");

        if let Ok(mut lock) = self.request_counts.lock() {
            *lock.entry(req_path.clone()).or_insert(0) += 1;
        }
        if let Ok(mut lock) = self.last_headers.lock() {
            lock.insert(req_path, headers);
        }

        let Some(bytes) = self.blobs.get(&key).cloned() else {
            return StatusCode::NOT_FOUND.into_response();
        };

        let mut out = HeaderMap::new();
        out.insert(
            axum::http::header::CONTENT_TYPE,
            HeaderValue::from_static(if key.ends_with(".mp3") {
                "audio/mpeg"
            } else {
                "application/octet-stream"
            }),
        );
        out.insert(
            axum::http::header::CONTENT_LENGTH,
            HeaderValue::from(bytes.len() as u64),
        );

        let chunk_size = self.chunk_size;
        let delay = self.chunk_delay;
        let body = stream::unfold(0usize, move |pos| {
            let bytes = bytes.clone();
            async move {
                if pos >= bytes.len() {
                    return None;
                }
                if delay != Duration::ZERO {
                    tokio::time::sleep(delay).await;
                }
                let end = (pos + chunk_size).min(bytes.len());
                Some((Ok::<_, Infallible>(bytes.slice(pos..end)), end))
            }
        });

        (StatusCode::OK, out, Body::from_stream(body)).into_response()
    }
}
