//! Cache owner: one session per resource, janitor on startup, shared event channel.
//!
//! [`MediaCache`] is the playback engine's entry point. It is constructed explicitly (there is
//! no global instance) and is meant to be shared behind an `Arc`.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tracing::{debug, instrument, trace};
use url::Url;

use crate::error::{CacheError, CacheResult};
use crate::event::{CacheEvent, ContentInfo, FetchState};
use crate::janitor::{Janitor, JanitorOutcome};
use crate::key::ResourceKey;
use crate::resolver::RangeStream;
use crate::session::{CacheEntry, CacheSession, FetchGate, SessionDeps};
use crate::settings::CacheSettings;
use crate::source::{ByteSource, HttpByteSource};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Progressive download cache.
pub struct MediaCache {
    deps: SessionDeps,
    janitor: Janitor,
    sessions: Mutex<HashMap<ResourceKey, CacheSession>>,
}

impl std::fmt::Debug for MediaCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaCache")
            .field("settings", &self.deps.settings)
            .field("sessions", &self.sessions.lock().len())
            .finish_non_exhaustive()
    }
}

impl MediaCache {
    /// Open a cache that fetches over HTTP.
    ///
    /// Must be called from within a tokio runtime; fetch tasks are spawned onto it.
    pub fn open(settings: CacheSettings) -> CacheResult<Self> {
        Self::with_source(settings, Arc::new(HttpByteSource::new()))
    }

    /// Open a cache that fetches through `source`.
    #[instrument(skip_all, fields(cache_dir = %settings.cache_dir.display()))]
    pub fn with_source(settings: CacheSettings, source: Arc<dyn ByteSource>) -> CacheResult<Self> {
        let runtime = Handle::try_current()
            .map_err(|_| CacheError::msg("MediaCache must be opened inside a tokio runtime"))?;

        fs::create_dir_all(&settings.cache_dir)
            .map_err(|e| CacheError::from(e).with_context("creating cache directory"))?;

        let janitor = Janitor::new(
            settings.cache_dir.clone(),
            settings.janitor_marker_path(),
            settings.purge_interval,
        );
        let outcome = janitor.run()?;
        let swept = janitor.sweep_partial_files();
        debug!(?outcome, swept, "cache: opened");

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            deps: SessionDeps {
                settings: Arc::new(settings),
                source,
                runtime,
                events,
                gate: Arc::new(FetchGate::default()),
            },
            janitor,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.deps.settings
    }

    /// Subscribe to events of every session.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.deps.events.subscribe()
    }

    /// The key `url` is cached under.
    pub fn key_for(url: &Url) -> ResourceKey {
        ResourceKey::from_url(url)
    }

    /// Session for `url`, created if needed.
    ///
    /// At most one live session exists per key. A session that failed or was cancelled is
    /// replaced by a fresh one.
    pub fn session(&self, url: &Url) -> CacheResult<CacheSession> {
        let key = ResourceKey::from_url(url);
        let mut sessions = self.sessions.lock();
        if let Some(existing) = sessions.get(&key) {
            match existing.state() {
                FetchState::Failed | FetchState::Cancelled => {
                    trace!(key = %key, "cache: replacing finished session");
                }
                _ => return Ok(existing.clone()),
            }
        }

        let session = CacheSession::open(url, &self.deps)?;
        sessions.insert(key, session.clone());
        Ok(session)
    }

    /// Existing session for `key`.
    pub fn get(&self, key: &ResourceKey) -> Option<CacheSession> {
        self.sessions.lock().get(key).cloned()
    }

    /// Request bytes `[offset, offset + length)` of a resource that already has a session.
    pub fn request_range(
        &self,
        key: &ResourceKey,
        offset: u64,
        length: u64,
    ) -> CacheResult<RangeStream> {
        let session = self
            .get(key)
            .ok_or_else(|| CacheError::UnknownResource(key.to_string()))?;
        session.request_range(offset, length)
    }

    /// Open (or reuse) the session for `url` and request a range from it.
    pub fn request_range_for_url(
        &self,
        url: &Url,
        offset: u64,
        length: u64,
    ) -> CacheResult<RangeStream> {
        self.session(url)?.request_range(offset, length)
    }

    pub fn content_info(&self, key: &ResourceKey) -> Option<ContentInfo> {
        self.get(key).and_then(|s| s.content_info())
    }

    pub fn entry(&self, key: &ResourceKey) -> Option<CacheEntry> {
        self.get(key).map(|s| s.entry())
    }

    /// Cancel the fetch for `key`. Returns `false` if there is no such session.
    pub fn cancel(&self, key: &ResourceKey) -> bool {
        match self.get(key) {
            Some(session) => {
                session.cancel();
                true
            }
            None => false,
        }
    }

    /// Path of the complete cache file for `url`, if one exists.
    pub fn cached_path(&self, url: &Url) -> Option<PathBuf> {
        let path = ResourceKey::from_url(url).complete_path(&self.deps.settings.cache_dir);
        path.is_file().then_some(path)
    }

    /// True while any fetch started by this cache is still running.
    pub fn is_fetching(&self) -> bool {
        self.deps.gate.active() > 0
    }

    /// Re-run the janitor check.
    ///
    /// Returns `None` without touching anything while a fetch is active, including fetches of
    /// sessions that were cloned out of the cache. Starts wait until the check is over. After a
    /// purge every session is dropped, since their files are gone.
    pub fn purge_if_stale(&self) -> CacheResult<Option<JanitorOutcome>> {
        let mut sessions = self.sessions.lock();
        let _exclusive = self.deps.gate.exclusive();
        if self.deps.gate.active() > 0 {
            debug!("cache: purge skipped, fetch in progress");
            return Ok(None);
        }

        let outcome = self.janitor.run()?;
        if outcome == JanitorOutcome::Purged {
            sessions.clear();
        }
        Ok(Some(outcome))
    }

    /// Cancel every session and forget them. Committed bytes of unfinished downloads are left
    /// as `.part` files for the next startup sweep.
    pub fn shutdown(&self) {
        let sessions: Vec<CacheSession> = self.sessions.lock().drain().map(|(_, s)| s).collect();
        debug!(count = sessions.len(), "cache: shutdown");
        for session in sessions {
            session.cancel();
        }
    }
}
