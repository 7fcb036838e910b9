//! Fetch coordinator: one network request per resource.
//!
//! State machine: `Idle -> Fetching -> {Completed | Failed | Cancelled}`.
//!
//! While fetching:
//! - the response head is captured once as [`ContentInfo`]; a status of 400 or above fails the
//!   session right away;
//! - chunks accumulate in an in-memory buffer that is appended to the [`ByteStore`] whenever it
//!   reaches `download_buffer_limit`; every flush re-evaluates pending range requests and emits
//!   a `Progress` event;
//! - at the end of the body the remainder is flushed, the download is verified and the file is
//!   promoted to its final name.
//!
//! Failures delete the partial file. Cancellation leaves committed bytes alone.

use std::sync::Arc;

use bytes::BytesMut;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};
use url::Url;

use crate::error::{CacheError, CacheResult};
use crate::event::{CacheEvent, ContentInfo, FetchState};
use crate::key::ResourceKey;
use crate::resolver::RangeResolver;
use crate::settings::CacheSettings;
use crate::source::{ByteSource, ResponseHead};
use crate::storage::ByteStore;

/// Shared, observable state of one fetch session.
///
/// Transitions are compare-and-set so that concurrent `start`/`cancel` calls cannot both win,
/// and every successful transition is published as a [`CacheEvent::StateChanged`].
#[derive(Debug)]
pub struct FetchStatus {
    key: ResourceKey,
    state: watch::Sender<FetchState>,
    expected_length: Mutex<Option<u64>>,
    events: broadcast::Sender<CacheEvent>,
}

impl FetchStatus {
    pub fn new(
        key: ResourceKey,
        initial: FetchState,
        events: broadcast::Sender<CacheEvent>,
    ) -> Self {
        let (state, _) = watch::channel(initial);
        Self {
            key,
            state,
            expected_length: Mutex::new(None),
            events,
        }
    }

    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    pub fn state(&self) -> FetchState {
        *self.state.borrow()
    }

    pub fn expected_length(&self) -> Option<u64> {
        *self.expected_length.lock()
    }

    /// Receiver that observes every state change.
    pub fn watch(&self) -> watch::Receiver<FetchState> {
        self.state.subscribe()
    }

    /// `Idle -> Fetching`. Returns `false` if the session was already started or finished.
    pub fn begin(&self) -> bool {
        self.transition_from(|s| s == FetchState::Idle, FetchState::Fetching)
    }

    /// `Idle -> Cancelled`, for sessions cancelled before any request was sent.
    pub fn cancel_idle(&self) -> bool {
        self.transition_from(|s| s == FetchState::Idle, FetchState::Cancelled)
    }

    /// `Idle | Fetching -> to` for a terminal `to`.
    pub fn finish(&self, to: FetchState) -> bool {
        debug_assert!(to.is_terminal());
        self.transition_from(|s| !s.is_terminal(), to)
    }

    pub fn emit(&self, event: CacheEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn set_expected_length(&self, len: Option<u64>) {
        *self.expected_length.lock() = len;
    }

    fn transition_from(&self, allowed: impl Fn(FetchState) -> bool, to: FetchState) -> bool {
        let mut from = None;
        let changed = self.state.send_if_modified(|s| {
            if allowed(*s) {
                from = Some(*s);
                *s = to;
                true
            } else {
                false
            }
        });
        if changed {
            debug!(key = %self.key, ?from, ?to, "fetch: state changed");
            self.emit(CacheEvent::StateChanged {
                key: self.key.clone(),
                state: to,
            });
        }
        changed
    }
}

/// Check a finished download against the response head and the verification settings.
///
/// Checks run in order and the first failure wins:
/// - status >= 400;
/// - with `verify_downloaded_file_size` and a declared length, the size must match exactly;
/// - a non-zero `minimum_expected_file_size` is a floor for the size.
pub fn verify_download(
    head: &ResponseHead,
    url: &Url,
    actual: u64,
    settings: &CacheSettings,
) -> CacheResult<()> {
    if head.is_error_status() {
        return Err(CacheError::HttpStatus {
            status: head.status,
            url: url.to_string(),
        });
    }

    if let Some(expected) = head.content_length {
        if settings.verify_downloaded_file_size && expected != actual {
            return Err(CacheError::SizeMismatch { expected, actual });
        }
    }

    let minimum = settings.minimum_expected_file_size;
    if minimum > 0 && actual < minimum {
        return Err(CacheError::BelowMinimumSize { actual, minimum });
    }
    Ok(())
}

/// Drives one download from request to terminal state.
pub struct FetchCoordinator {
    url: Url,
    final_path: std::path::PathBuf,
    settings: Arc<CacheSettings>,
    source: Arc<dyn ByteSource>,
    store: Arc<ByteStore>,
    resolver: Arc<RangeResolver>,
    status: Arc<FetchStatus>,
    cancel: CancellationToken,
    buffer: BytesMut,
}

impl std::fmt::Debug for FetchCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchCoordinator")
            .field("url", &self.url.as_str())
            .field("buffered", &self.buffer.len())
            .finish_non_exhaustive()
    }
}

impl FetchCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        url: Url,
        final_path: std::path::PathBuf,
        settings: Arc<CacheSettings>,
        source: Arc<dyn ByteSource>,
        store: Arc<ByteStore>,
        resolver: Arc<RangeResolver>,
        status: Arc<FetchStatus>,
        cancel: CancellationToken,
    ) -> Self {
        let buffer = BytesMut::with_capacity(settings.download_buffer_limit);
        Self {
            url,
            final_path,
            settings,
            source,
            store,
            resolver,
            status,
            cancel,
            buffer,
        }
    }

    /// Run the download to completion, failure or cancellation.
    #[instrument(skip(self), fields(key = %self.status.key(), url = %self.url))]
    pub async fn run(mut self) -> FetchState {
        let cancel = self.cancel.clone();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CacheError::Cancelled),
            r = self.fetch() => r,
        };
        self.finish(result)
    }

    async fn fetch(&mut self) -> CacheResult<()> {
        let response = self
            .source
            .open(&self.url, &self.settings.request_headers)
            .await?;
        let head = response.head;
        self.on_head(&head)?;

        let mut body = response.body;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            trace!("fetch: chunk {} bytes", chunk.len());
            self.buffer.extend_from_slice(&chunk);
            if self.buffer.len() >= self.settings.download_buffer_limit {
                self.flush()?;
            }
        }

        self.flush()?;
        self.store.sync()?;
        verify_download(&head, &self.url, self.store.size(), &self.settings)
    }

    fn on_head(&mut self, head: &ResponseHead) -> CacheResult<()> {
        if head.is_error_status() {
            return Err(CacheError::HttpStatus {
                status: head.status,
                url: self.url.to_string(),
            });
        }

        let info = ContentInfo {
            mime_type: head.mime_type.clone(),
            total_length: head.content_length,
            supports_range_access: true,
        };
        self.status.set_expected_length(head.content_length);
        self.resolver.set_content_info(info.clone());
        self.status.emit(CacheEvent::ContentInfo {
            key: self.status.key().clone(),
            info,
        });
        self.resolver.commit(&self.store);
        Ok(())
    }

    fn flush(&mut self) -> CacheResult<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.store.append(&self.buffer)?;
        self.buffer.clear();

        let committed = self.resolver.commit(&self.store);
        trace!("fetch: flushed, committed={}", committed);
        self.status.emit(CacheEvent::Progress {
            key: self.status.key().clone(),
            committed,
            expected: self.status.expected_length(),
        });
        Ok(())
    }

    fn finish(mut self, result: CacheResult<()>) -> FetchState {
        let key = self.status.key().clone();

        let result = result.and_then(|()| self.store.persist(&self.final_path));

        match result {
            Ok(()) => {
                self.resolver.complete(&self.store);
                if self.status.finish(FetchState::Completed) {
                    self.status.emit(CacheEvent::Completed {
                        key,
                        path: self.final_path.clone(),
                    });
                }
                FetchState::Completed
            }
            Err(CacheError::Cancelled) => {
                // Uncommitted bytes are dropped; committed ones stay on disk.
                self.buffer.clear();
                self.resolver.fail(CacheError::Cancelled);
                self.status.finish(FetchState::Cancelled);
                FetchState::Cancelled
            }
            Err(err) => {
                warn!(key = %key, "fetch: download failed: {}", err);
                self.buffer.clear();
                if let Err(e) = self.store.delete() {
                    warn!(key = %key, "fetch: could not delete partial file: {}", e);
                }
                self.resolver.fail(err.clone());
                if self.status.finish(FetchState::Failed) {
                    self.status.emit(CacheEvent::Failed {
                        key,
                        error: err.to_string(),
                    });
                }
                FetchState::Failed
            }
        }
    }
}
