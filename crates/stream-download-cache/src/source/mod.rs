//! Network seam consumed by the fetch coordinator.
//!
//! A [`ByteSource`] opens one streaming request per call and hands back the response head
//! (status, mime type, declared length) together with a stream of body chunks. The end of the
//! stream is the completion signal; an `Err` item is a transport failure.
//!
//! Two implementations ship with the crate:
//! - [`HttpByteSource`]: `reqwest` based, used in production.
//! - [`ChannelSource`]: chunks are pushed by the caller, for custom transports and for tests that
//!   need to control exactly when each chunk arrives.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use url::Url;

use crate::error::CacheResult;

mod channel;
mod http;

pub use channel::{ChannelSource, FeedSender};
pub use http::HttpByteSource;

/// A boxed stream of body chunks.
pub type ByteStream = BoxStream<'static, CacheResult<Bytes>>;

/// Response metadata, captured once when headers arrive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    /// HTTP-style status code.
    pub status: u16,
    /// Mime type without parameters (e.g. `audio/mpeg`).
    pub mime_type: Option<String>,
    /// Declared body length, if the server sent one.
    pub content_length: Option<u64>,
}

impl ResponseHead {
    /// A `200 OK` head.
    pub fn ok(mime_type: Option<&str>, content_length: Option<u64>) -> Self {
        Self {
            status: 200,
            mime_type: mime_type.map(str::to_string),
            content_length,
        }
    }

    /// True for status codes of 400 and above.
    pub fn is_error_status(&self) -> bool {
        self.status >= 400
    }
}

/// An opened response: head plus body stream.
pub struct SourceResponse {
    pub head: ResponseHead,
    pub body: ByteStream,
}

impl std::fmt::Debug for SourceResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceResponse")
            .field("head", &self.head)
            .finish_non_exhaustive()
    }
}

/// Streaming fetch primitive.
#[async_trait]
pub trait ByteSource: Send + Sync + 'static {
    /// Start a request for `url`, sending `headers` along with it.
    async fn open(
        &self,
        url: &Url,
        headers: &HashMap<String, String>,
    ) -> CacheResult<SourceResponse>;
}
