use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use url::Url;

use super::{ByteSource, ResponseHead, SourceResponse};
use crate::error::{CacheError, CacheResult};

/// A source whose bodies are pushed by the caller.
///
/// Call [`ChannelSource::prepare`] for a URL before the cache opens it; the returned
/// [`FeedSender`] then delivers chunks, a failure, or completion (by being dropped or via
/// [`FeedSender::finish`]).
#[derive(Clone, Default)]
pub struct ChannelSource {
    state: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    feeds: HashMap<String, (ResponseHead, mpsc::UnboundedReceiver<CacheResult<Bytes>>)>,
    opens: HashMap<String, usize>,
}

impl std::fmt::Debug for ChannelSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSource").finish_non_exhaustive()
    }
}

/// Producer side of one prepared response body.
#[derive(Debug)]
pub struct FeedSender {
    tx: mpsc::UnboundedSender<CacheResult<Bytes>>,
}

impl FeedSender {
    /// Deliver one chunk. Returns `false` once the consumer is gone (session cancelled).
    pub fn send(&self, chunk: impl Into<Bytes>) -> bool {
        self.tx.send(Ok(chunk.into())).is_ok()
    }

    /// Deliver a transport failure.
    pub fn fail(self, err: CacheError) {
        let _ = self.tx.send(Err(err));
    }

    /// End the body gracefully.
    pub fn finish(self) {}
}

impl ChannelSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the response for `url`. A later [`ByteSource::open`] for it consumes the feed.
    pub fn prepare(&self, url: &Url, head: ResponseHead) -> FeedSender {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state
            .lock()
            .feeds
            .insert(url.as_str().to_string(), (head, rx));
        FeedSender { tx }
    }

    /// How many times `url` has been opened.
    pub fn open_count(&self, url: &Url) -> usize {
        self.state
            .lock()
            .opens
            .get(url.as_str())
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl ByteSource for ChannelSource {
    async fn open(
        &self,
        url: &Url,
        _headers: &HashMap<String, String>,
    ) -> CacheResult<SourceResponse> {
        let feed = {
            let mut st = self.state.lock();
            *st.opens.entry(url.as_str().to_string()).or_insert(0) += 1;
            st.feeds.remove(url.as_str())
        };
        let Some((head, rx)) = feed else {
            return Err(CacheError::Network(format!("no feed prepared for {url}")));
        };

        let body = stream::unfold(rx, |mut rx| async move {
            let item = rx.recv().await?;
            Some((item, rx))
        })
        .boxed();

        Ok(SourceResponse { head, body })
    }
}
