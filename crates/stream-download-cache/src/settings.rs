//! Configuration for the `stream-download-cache` crate.
//!
//! All knobs live in one flat [`CacheSettings`] struct, passed to
//! [`MediaCache::open`](crate::MediaCache::open) and shared read-only by every session.
//!
//! Included configuration domains:
//! - Buffering (in-memory flush threshold, per-read cap)
//! - Download verification (declared length check, size floor)
//! - Cache layout and janitor (cache dir, last-clear marker, purge interval)
//! - Request customization (extra HTTP headers)

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default number of bytes kept in memory before they are appended to the cache file.
pub const DEFAULT_DOWNLOAD_BUFFER_LIMIT: usize = 128 * 1024;

/// Default maximum number of bytes handed out by a single range read.
pub const DEFAULT_READ_DATA_LIMIT: usize = 10 * 1024 * 1024;

/// Default age after which the whole cache directory is purged.
pub const DEFAULT_PURGE_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

const DEFAULT_CACHE_DIR_NAME: &str = "stream-download-cache";

/// Unified settings for the progressive download cache.
#[derive(Clone)]
pub struct CacheSettings {
    // ----------------------------
    // Buffering
    // ----------------------------
    /// How much data is downloaded in memory before it is appended to the cache file.
    /// Default: 128 KiB.
    pub download_buffer_limit: usize,

    /// How much data may be read into memory for a single range response.
    /// Default: 10 MiB.
    pub read_data_limit: usize,

    // ----------------------------
    // Verification
    // ----------------------------
    /// Fail the download when the declared content length differs from the bytes on disk.
    /// Default: false.
    pub verify_downloaded_file_size: bool,

    /// If greater than 0, a finished download smaller than this is treated as failed.
    /// Useful when the server does not declare a content length.
    /// Default: 0 (disabled).
    pub minimum_expected_file_size: u64,

    // ----------------------------
    // Layout / janitor
    // ----------------------------
    /// Directory holding one file per resource.
    /// Default: `<temp_dir>/stream-download-cache`.
    pub cache_dir: PathBuf,

    /// File recording when the cache was last cleared. Must live outside `cache_dir`.
    /// `None` selects `<cache_dir>.last-clear` next to the cache directory.
    pub janitor_marker: Option<PathBuf>,

    /// Age after which the whole cache directory is purged on startup.
    /// Default: 24 hours.
    pub purge_interval: Duration,

    // ----------------------------
    // Requests
    // ----------------------------
    /// Extra headers sent with every resource request (e.g. authorization).
    pub request_headers: HashMap<String, String>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            download_buffer_limit: DEFAULT_DOWNLOAD_BUFFER_LIMIT,
            read_data_limit: DEFAULT_READ_DATA_LIMIT,
            verify_downloaded_file_size: false,
            minimum_expected_file_size: 0,
            cache_dir: std::env::temp_dir().join(DEFAULT_CACHE_DIR_NAME),
            janitor_marker: None,
            purge_interval: DEFAULT_PURGE_INTERVAL,
            request_headers: HashMap::new(),
        }
    }
}

impl fmt::Debug for CacheSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Header values may carry credentials; only print the names.
        let header_names: Vec<&String> = self.request_headers.keys().collect();
        f.debug_struct("CacheSettings")
            .field("download_buffer_limit", &self.download_buffer_limit)
            .field("read_data_limit", &self.read_data_limit)
            .field(
                "verify_downloaded_file_size",
                &self.verify_downloaded_file_size,
            )
            .field(
                "minimum_expected_file_size",
                &self.minimum_expected_file_size,
            )
            .field("cache_dir", &self.cache_dir)
            .field("janitor_marker", &self.janitor_marker)
            .field("purge_interval", &self.purge_interval)
            .field("request_headers", &header_names)
            .finish()
    }
}

impl CacheSettings {
    /// Create default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the cache directory.
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    /// Set the in-memory flush threshold (clamped to at least 1 byte).
    pub fn with_download_buffer_limit(mut self, limit: usize) -> Self {
        self.download_buffer_limit = limit.max(1);
        self
    }

    /// Set the per-read cap (clamped to at least 1 byte).
    pub fn with_read_data_limit(mut self, limit: usize) -> Self {
        self.read_data_limit = limit.max(1);
        self
    }

    /// Enable or disable the declared-length check.
    pub fn with_verify_downloaded_file_size(mut self, enabled: bool) -> Self {
        self.verify_downloaded_file_size = enabled;
        self
    }

    /// Set the minimum size of a finished download (0 disables the check).
    pub fn with_minimum_expected_file_size(mut self, bytes: u64) -> Self {
        self.minimum_expected_file_size = bytes;
        self
    }

    /// Override where the last-clear marker is stored.
    pub fn with_janitor_marker(mut self, path: impl Into<PathBuf>) -> Self {
        self.janitor_marker = Some(path.into());
        self
    }

    /// Override the purge interval.
    pub fn with_purge_interval(mut self, interval: Duration) -> Self {
        self.purge_interval = interval;
        self
    }

    /// Add a header sent with every resource request.
    pub fn with_request_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.request_headers.insert(name.into(), value.into());
        self
    }

    /// Resolved location of the janitor marker.
    pub fn janitor_marker_path(&self) -> PathBuf {
        if let Some(marker) = &self.janitor_marker {
            return marker.clone();
        }
        sibling_marker(&self.cache_dir)
    }
}

fn sibling_marker(cache_dir: &Path) -> PathBuf {
    let name = cache_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| DEFAULT_CACHE_DIR_NAME.to_string());
    let parent = cache_dir.parent().unwrap_or_else(|| Path::new("."));
    parent.join(format!("{name}.last-clear"))
}
