//! Range request resolver.
//!
//! Holds the byte-range requests issued by the playback engine for one resource and serves them
//! from whatever has been committed to the [`ByteStore`] so far.
//!
//! Evaluation rules (applied to every pending request on each new request and each commit):
//! - If `committed > current_offset`, read `min(committed - current_offset, remaining,
//!   read_data_limit)` bytes at `current_offset`, deliver them, advance `current_offset`, and
//!   repeat while more committed bytes are available for the range.
//! - A request is fulfilled (its stream ends) exactly when `committed >= offset + length`.
//! - Requests are independent; evaluation order does not matter.
//!
//! Terminal outcomes:
//! - Completed: requests extending past the final size get what exists, then end.
//! - Failed/cancelled: every pending request receives the error, then ends.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::{CacheError, CacheResult};
use crate::event::ContentInfo;
use crate::storage::ByteStore;

/// A byte-range request that has not been fully served yet.
#[derive(Debug)]
pub struct PendingRangeRequest {
    pub requested_offset: u64,
    pub requested_length: u64,
    pub current_offset: u64,
    tx: mpsc::UnboundedSender<CacheResult<Bytes>>,
}

impl PendingRangeRequest {
    fn end(&self) -> u64 {
        self.requested_offset.saturating_add(self.requested_length)
    }
}

enum Evaluation {
    Pending,
    Fulfilled,
    /// The consumer dropped its stream.
    Abandoned,
}

#[derive(Debug, Clone)]
enum Outcome {
    Complete,
    Failed(CacheError),
}

#[derive(Debug, Default)]
struct State {
    pending: HashMap<u64, PendingRangeRequest>,
    committed: u64,
    content_info: Option<ContentInfo>,
    outcome: Option<Outcome>,
}

/// Pending range requests for one resource.
#[derive(Debug)]
pub struct RangeResolver {
    read_data_limit: usize,
    next_id: AtomicU64,
    state: Mutex<State>,
}

impl RangeResolver {
    pub fn new(read_data_limit: usize) -> Self {
        Self {
            read_data_limit: read_data_limit.max(1),
            next_id: AtomicU64::new(0),
            state: Mutex::new(State::default()),
        }
    }

    /// A resolver for a file that is already complete on disk.
    pub fn completed(read_data_limit: usize, size: u64, content_info: ContentInfo) -> Self {
        let resolver = Self::new(read_data_limit);
        {
            let mut st = resolver.state.lock();
            st.committed = size;
            st.content_info = Some(content_info);
            st.outcome = Some(Outcome::Complete);
        }
        resolver
    }

    /// Bytes committed to the store as last observed.
    pub fn committed(&self) -> u64 {
        self.state.lock().committed
    }

    /// Number of requests still waiting for bytes.
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn content_info(&self) -> Option<ContentInfo> {
        self.state.lock().content_info.clone()
    }

    pub fn set_content_info(&self, info: ContentInfo) {
        self.state.lock().content_info = Some(info);
    }

    /// Register a request for `[offset, offset + length)` and serve what is already available.
    ///
    /// Never blocks on the network: the returned stream yields chunks as they are committed.
    pub fn register(
        self: &Arc<Self>,
        offset: u64,
        length: u64,
        store: &ByteStore,
    ) -> RangeStream {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let stream = RangeStream {
            id,
            offset,
            length,
            rx,
            resolver: Arc::downgrade(self),
        };

        let mut st = self.state.lock();
        if let Some(Outcome::Failed(err)) = &st.outcome {
            let _ = tx.send(Err(err.clone()));
            return stream;
        }

        let mut req = PendingRangeRequest {
            requested_offset: offset,
            requested_length: length,
            current_offset: offset,
            tx,
        };
        let committed = st.committed;
        match self.evaluate(&mut req, committed, store) {
            Evaluation::Fulfilled | Evaluation::Abandoned => {
                trace!("resolver: request #{id} [{offset}, +{length}) served immediately");
            }
            Evaluation::Pending if matches!(st.outcome, Some(Outcome::Complete)) => {
                trace!("resolver: request #{id} [{offset}, +{length}) past end of complete file");
            }
            Evaluation::Pending => {
                trace!(
                    "resolver: request #{id} [{offset}, +{length}) pending committed={committed}"
                );
                st.pending.insert(id, req);
            }
        }
        stream
    }

    /// Record the store's current size and re-evaluate every pending request.
    ///
    /// Returns the committed byte count, which never decreases.
    pub fn commit(&self, store: &ByteStore) -> u64 {
        let mut st = self.state.lock();
        let size = store.size();
        debug_assert!(size >= st.committed, "committed bytes went backwards");
        st.committed = st.committed.max(size);
        self.process(&mut st, store);
        st.committed
    }

    /// The download finished: serve what exists and end every remaining request.
    pub fn complete(&self, store: &ByteStore) {
        let mut st = self.state.lock();
        st.committed = st.committed.max(store.size());
        self.process(&mut st, store);
        let unfinished = st.pending.len();
        if unfinished > 0 {
            trace!("resolver: complete; ending {unfinished} request(s) past end of file");
        }
        st.pending.clear();
        st.outcome = Some(Outcome::Complete);
    }

    /// The download failed or was cancelled: every pending request receives `err`.
    pub fn fail(&self, err: CacheError) {
        let mut st = self.state.lock();
        for (_, req) in st.pending.drain() {
            let _ = req.tx.send(Err(err.clone()));
        }
        st.outcome = Some(Outcome::Failed(err));
    }

    /// Withdraw a request.
    pub fn cancel(&self, id: u64) {
        if self.state.lock().pending.remove(&id).is_some() {
            trace!("resolver: request #{id} cancelled");
        }
    }

    fn process(&self, st: &mut State, store: &ByteStore) {
        let committed = st.committed;
        st.pending
            .retain(|_, req| matches!(self.evaluate(req, committed, store), Evaluation::Pending));
    }

    fn evaluate(
        &self,
        req: &mut PendingRangeRequest,
        committed: u64,
        store: &ByteStore,
    ) -> Evaluation {
        let end = req.end();

        while committed > req.current_offset && req.current_offset < end {
            let available = committed - req.current_offset;
            let remaining = end - req.current_offset;
            let n = available.min(remaining).min(self.read_data_limit as u64) as usize;

            let Some(bytes) = store.read(req.current_offset, n) else {
                return Evaluation::Pending;
            };
            req.current_offset += bytes.len() as u64;
            if req.tx.send(Ok(bytes)).is_err() {
                return Evaluation::Abandoned;
            }
        }

        if committed >= end {
            Evaluation::Fulfilled
        } else {
            Evaluation::Pending
        }
    }
}

/// Asynchronous stream of the bytes of one range request.
///
/// Ends once the range has been delivered (or the file ended). Dropping the stream withdraws
/// the request.
#[derive(Debug)]
pub struct RangeStream {
    id: u64,
    offset: u64,
    length: u64,
    rx: mpsc::UnboundedReceiver<CacheResult<Bytes>>,
    resolver: Weak<RangeResolver>,
}

impl RangeStream {
    /// Requested `(offset, length)`.
    pub fn range(&self) -> (u64, u64) {
        (self.offset, self.length)
    }

    /// Content information for the resource, once headers have arrived.
    pub fn content_info(&self) -> Option<ContentInfo> {
        self.resolver.upgrade().and_then(|r| r.content_info())
    }

    /// Drain the stream into one buffer.
    pub async fn collect_bytes(mut self) -> CacheResult<Bytes> {
        use futures_util::StreamExt;

        let mut out = bytes::BytesMut::new();
        while let Some(chunk) = self.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out.freeze())
    }
}

impl Stream for RangeStream {
    type Item = CacheResult<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for RangeStream {
    fn drop(&mut self) {
        if let Some(resolver) = self.resolver.upgrade() {
            resolver.cancel(self.id);
        }
    }
}
