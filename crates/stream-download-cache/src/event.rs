//! Session states and out-of-band notifications.
//!
//! Every fetch session publishes [`CacheEvent`]s on a `tokio::sync::broadcast` channel shared by
//! the owning [`MediaCache`](crate::MediaCache). Subscribers that fall behind may miss
//! `Progress` events (the channel is bounded), but each session emits `Completed` or `Failed`
//! at most once and never both.

use std::path::PathBuf;

use crate::key::ResourceKey;

/// Lifecycle of one fetch session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchState {
    /// Session created, no request sent yet.
    Idle,
    /// Request in flight; bytes are being committed.
    Fetching,
    /// Download finished and verified; the cache file is complete.
    Completed,
    /// Download failed; the partial file was deleted.
    Failed,
    /// Download was cancelled; committed bytes were left in place.
    Cancelled,
}

impl FetchState {
    /// True once no further state changes can happen.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            FetchState::Completed | FetchState::Failed | FetchState::Cancelled
        )
    }
}

/// Response metadata exposed to the playback engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentInfo {
    /// Mime type reported by the server.
    pub mime_type: Option<String>,
    /// Total length of the resource, if known.
    pub total_length: Option<u64>,
    /// Byte-range reads are always served from the cache file.
    pub supports_range_access: bool,
}

/// Notification emitted by a fetch session.
#[derive(Debug, Clone)]
pub enum CacheEvent {
    /// The session moved to a new state.
    StateChanged { key: ResourceKey, state: FetchState },

    /// Response headers arrived.
    ContentInfo { key: ResourceKey, info: ContentInfo },

    /// New bytes were committed to the cache file.
    Progress {
        key: ResourceKey,
        committed: u64,
        expected: Option<u64>,
    },

    /// The download finished and the file is available at `path`.
    Completed { key: ResourceKey, path: PathBuf },

    /// The download failed. The message is the rendered [`CacheError`](crate::CacheError).
    Failed { key: ResourceKey, error: String },
}

impl CacheEvent {
    /// The resource this event is about.
    pub fn key(&self) -> &ResourceKey {
        match self {
            CacheEvent::StateChanged { key, .. }
            | CacheEvent::ContentInfo { key, .. }
            | CacheEvent::Progress { key, .. }
            | CacheEvent::Completed { key, .. }
            | CacheEvent::Failed { key, .. } => key,
        }
    }
}
