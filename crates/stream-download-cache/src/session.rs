//! Per-resource cache session.
//!
//! A [`CacheSession`] ties together everything that belongs to one resource: its key and
//! paths, the byte store, the range resolver and the fetch state. Sessions are cheap to clone
//! and are handed out by [`MediaCache`](crate::MediaCache), which keeps at most one live
//! session per [`ResourceKey`].
//!
//! The first range request (or an explicit [`CacheSession::start`]) sends the network request;
//! later calls reuse the running fetch.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::error::{CacheError, CacheResult};
use crate::event::{CacheEvent, ContentInfo, FetchState};
use crate::fetch::{FetchCoordinator, FetchStatus};
use crate::key::ResourceKey;
use crate::resolver::{RangeResolver, RangeStream};
use crate::settings::CacheSettings;
use crate::source::ByteSource;
use crate::storage::ByteStore;

/// Snapshot of a resource's cache state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub resource_key: ResourceKey,
    pub file_path: PathBuf,
    pub committed_bytes: u64,
    pub expected_length: Option<u64>,
    pub is_complete: bool,
}

/// Handle to the cache state of one resource.
#[derive(Clone)]
pub struct CacheSession {
    inner: Arc<Inner>,
}

struct Inner {
    key: ResourceKey,
    url: Url,
    partial_path: PathBuf,
    final_path: PathBuf,
    settings: Arc<CacheSettings>,
    source: Arc<dyn ByteSource>,
    runtime: Handle,
    gate: Arc<FetchGate>,
    status: Arc<FetchStatus>,
    resolver: Arc<RangeResolver>,
    store: Mutex<Option<Arc<ByteStore>>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for CacheSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheSession")
            .field("key", &self.inner.key)
            .field("url", &self.inner.url.as_str())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Orders fetch starts against cache-wide purges.
///
/// A start holds the shared side while it moves to `Fetching` and creates its file; a purge
/// holds the exclusive side while it checks for active fetches and deletes the directory.
#[derive(Debug, Default)]
pub(crate) struct FetchGate {
    purge: RwLock<()>,
    active: AtomicUsize,
}

impl FetchGate {
    /// Number of fetches that were started and have not finished yet.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Block new starts until the guard is dropped.
    pub fn exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.purge.write()
    }
}

/// Shared pieces every session of one cache is built from.
pub(crate) struct SessionDeps {
    pub settings: Arc<CacheSettings>,
    pub source: Arc<dyn ByteSource>,
    pub runtime: Handle,
    pub events: broadcast::Sender<CacheEvent>,
    pub gate: Arc<FetchGate>,
}

impl CacheSession {
    /// Session for `url`: `Completed` if its file is already cached, `Idle` otherwise.
    pub(crate) fn open(url: &Url, deps: &SessionDeps) -> CacheResult<Self> {
        let key = ResourceKey::from_url(url);
        let cache_dir = &deps.settings.cache_dir;
        let final_path = key.complete_path(cache_dir);
        let partial_path = key.partial_path(cache_dir);

        let (state, store, resolver) = match ByteStore::open_existing(&final_path)? {
            Some(store) => {
                let size = store.size();
                debug!(key = %key, size, "session: cache hit");
                let info = ContentInfo {
                    mime_type: None,
                    total_length: Some(size),
                    supports_range_access: true,
                };
                let resolver =
                    RangeResolver::completed(deps.settings.read_data_limit, size, info);
                (FetchState::Completed, Some(Arc::new(store)), resolver)
            }
            None => (
                FetchState::Idle,
                None,
                RangeResolver::new(deps.settings.read_data_limit),
            ),
        };

        Ok(Self {
            inner: Arc::new(Inner {
                status: Arc::new(FetchStatus::new(key.clone(), state, deps.events.clone())),
                key,
                url: url.clone(),
                partial_path,
                final_path,
                settings: deps.settings.clone(),
                source: deps.source.clone(),
                runtime: deps.runtime.clone(),
                gate: deps.gate.clone(),
                resolver: Arc::new(resolver),
                store: Mutex::new(store),
                cancel: CancellationToken::new(),
            }),
        })
    }

    pub fn key(&self) -> &ResourceKey {
        &self.inner.key
    }

    pub fn url(&self) -> &Url {
        &self.inner.url
    }

    pub fn state(&self) -> FetchState {
        self.inner.status.state()
    }

    /// Content information, available once response headers arrived.
    pub fn content_info(&self) -> Option<ContentInfo> {
        self.inner.resolver.content_info()
    }

    /// Current cache entry snapshot.
    pub fn entry(&self) -> CacheEntry {
        let state = self.state();
        let file_path = match self.inner.store.lock().as_ref() {
            Some(store) => store.path(),
            None if state == FetchState::Completed => self.inner.final_path.clone(),
            None => self.inner.partial_path.clone(),
        };
        CacheEntry {
            resource_key: self.inner.key.clone(),
            file_path,
            committed_bytes: self.inner.resolver.committed(),
            expected_length: self
                .inner
                .status
                .expected_length()
                .or_else(|| self.content_info().and_then(|i| i.total_length)),
            is_complete: state == FetchState::Completed,
        }
    }

    /// Subscribe to state changes of this session only.
    pub fn subscribe(&self) -> tokio::sync::watch::Receiver<FetchState> {
        self.inner.status.watch()
    }

    /// Wait until the session reaches a terminal state.
    pub async fn finished(&self) -> FetchState {
        let mut rx = self.subscribe();
        match rx.wait_for(|s| s.is_terminal()).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        }
    }

    /// Send the network request if it has not been sent yet.
    ///
    /// Calling this on a session that is already fetching or finished does nothing.
    #[instrument(skip(self), fields(key = %self.inner.key))]
    pub fn start(&self) -> CacheResult<()> {
        let inner = &self.inner;
        // No purge may run between the state change and the file creation.
        let _gate = inner.gate.purge.read();
        // Held until the store is in place so concurrent range requests never see a fetching
        // session without one.
        let mut slot = inner.store.lock();
        if !inner.status.begin() {
            return Ok(());
        }
        inner.gate.active.fetch_add(1, Ordering::AcqRel);

        let store = match self.create_store() {
            Ok(store) => store,
            Err(err) => {
                inner.gate.active.fetch_sub(1, Ordering::AcqRel);
                warn!("session: cannot create cache file: {}", err);
                inner.resolver.fail(err.clone());
                if inner.status.finish(FetchState::Failed) {
                    inner.status.emit(CacheEvent::Failed {
                        key: inner.key.clone(),
                        error: err.to_string(),
                    });
                }
                return Err(err);
            }
        };
        *slot = Some(store.clone());
        drop(slot);

        let coordinator = FetchCoordinator::new(
            inner.url.clone(),
            inner.final_path.clone(),
            inner.settings.clone(),
            inner.source.clone(),
            store,
            inner.resolver.clone(),
            inner.status.clone(),
            inner.cancel.clone(),
        );
        debug!("session: fetch started");
        let gate = inner.gate.clone();
        inner.runtime.spawn(async move {
            coordinator.run().await;
            gate.active.fetch_sub(1, Ordering::AcqRel);
        });
        Ok(())
    }

    /// Request bytes `[offset, offset + length)`.
    ///
    /// Starts the fetch on first use. Returns immediately; the stream yields chunks as they are
    /// committed and ends once the range has been delivered.
    pub fn request_range(&self, offset: u64, length: u64) -> CacheResult<RangeStream> {
        if self.state() == FetchState::Idle {
            self.start()?;
        }

        let store = self.inner.store.lock().clone();
        match store {
            Some(store) => Ok(self.inner.resolver.register(offset, length, &store)),
            None if self.state() == FetchState::Failed => {
                Err(CacheError::msg("cache file could not be created"))
            }
            None => Err(CacheError::Cancelled),
        }
    }

    /// Stop the network operation. Committed bytes stay on disk. Idempotent.
    pub fn cancel(&self) {
        let inner = &self.inner;
        inner.cancel.cancel();
        if inner.status.cancel_idle() {
            inner.resolver.fail(CacheError::Cancelled);
        }
    }

    fn create_store(&self) -> CacheResult<Arc<ByteStore>> {
        let inner = &self.inner;
        // A leftover from an earlier cancelled session would shift every offset.
        match std::fs::remove_file(&inner.partial_path) {
            Ok(()) => debug!("session: removed stale partial file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(CacheError::from(e).with_context("removing stale partial file")),
        }

        Ok(Arc::new(ByteStore::open(&inner.partial_path)?))
    }
}
