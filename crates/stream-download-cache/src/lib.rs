//! Progressive media download cache.
//!
//! Serves arbitrary byte ranges of a remote media file (audio/video) to a playback engine while
//! the file is still being downloaded, and keeps the complete file on disk for later plays.
//!
//! Design goals:
//! - One network request per resource, shared by every range request for it.
//! - Range requests never block: they return a stream that yields bytes as they are committed.
//! - Only verified downloads become cache entries; failures leave nothing behind.
//! - The cache directory is purged wholesale once it gets old (see [`Janitor`]).
//!
//! This crate is composed of several modules:
//! - `digest`: MD5 content digest used to name cache files.
//! - `key`: Resource keys and the on-disk layout derived from them.
//! - `storage`: Append-only file store with random-offset reads.
//! - `source`: Network seam (`reqwest` backed HTTP plus a push-fed channel source).
//! - `fetch`: Fetch state machine and download coordinator.
//! - `resolver`: Pending range requests and their delivery streams.
//! - `janitor`: Age-based purge and startup sweep.
//! - `session` / `cache`: Per-resource sessions and the cache owner.
//! - `settings`, `error`, `event`: Configuration, errors, notifications.
//!
//! ```no_run
//! # async fn run() -> stream_download_cache::CacheResult<()> {
//! use stream_download_cache::{CacheSettings, MediaCache};
//!
//! let cache = MediaCache::open(CacheSettings::default())?;
//! let url = url::Url::parse("https://example.com/track.mp3").expect("valid url");
//! let head = cache.request_range_for_url(&url, 0, 4096)?.collect_bytes().await?;
//! # let _ = head;
//! # Ok(())
//! # }
//! ```

mod cache;
mod digest;
mod error;
mod event;
mod fetch;
mod janitor;
mod key;
mod resolver;
mod session;
mod settings;
mod source;
mod storage;

pub use crate::cache::MediaCache;
pub use crate::digest::{Digest, Md5, md5};
pub use crate::error::{CacheError, CacheResult};
pub use crate::event::{CacheEvent, ContentInfo, FetchState};
pub use crate::fetch::{FetchCoordinator, FetchStatus, verify_download};
pub use crate::janitor::{Janitor, JanitorOutcome};
pub use crate::key::{PARTIAL_SUFFIX, ResourceKey, is_partial_file};
pub use crate::resolver::{PendingRangeRequest, RangeResolver, RangeStream};
pub use crate::session::{CacheEntry, CacheSession};
pub use crate::settings::{
    CacheSettings, DEFAULT_DOWNLOAD_BUFFER_LIMIT, DEFAULT_PURGE_INTERVAL, DEFAULT_READ_DATA_LIMIT,
};
pub use crate::source::{
    ByteSource, ByteStream, ChannelSource, FeedSender, HttpByteSource, ResponseHead,
    SourceResponse,
};
pub use crate::storage::ByteStore;

pub use bytes::Bytes;
