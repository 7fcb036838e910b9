use std::collections::HashMap;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use tracing::debug;
use url::Url;

use super::{ByteSource, ResponseHead, SourceResponse};
use crate::error::{CacheError, CacheResult};

/// HTTP source backed by a shared `reqwest` client.
///
/// The response status is reported in the head instead of being turned into an error here, so
/// the fetch session decides how to treat it.
#[derive(Debug, Clone, Default)]
pub struct HttpByteSource {
    client: Client,
}

impl HttpByteSource {
    /// Creates a source with a default client.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a source around an existing client (connection pool, proxies, TLS config).
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn build_headers(headers: &HashMap<String, String>) -> CacheResult<HeaderMap> {
        let mut out = HeaderMap::new();
        for (k, v) in headers {
            let name = HeaderName::from_bytes(k.as_bytes())
                .map_err(|e| CacheError::msg(format!("invalid header name '{k}': {e}")))?;
            let value = HeaderValue::from_str(v)
                .map_err(|e| CacheError::msg(format!("invalid header value for '{k}': {e}")))?;
            out.insert(name, value);
        }
        Ok(out)
    }
}

#[async_trait]
impl ByteSource for HttpByteSource {
    async fn open(
        &self,
        url: &Url,
        headers: &HashMap<String, String>,
    ) -> CacheResult<SourceResponse> {
        let headers = Self::build_headers(headers)?;
        let response = self
            .client
            .get(url.clone())
            .headers(headers)
            .send()
            .await?;

        let mime_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(';').next())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        let head = ResponseHead {
            status: response.status().as_u16(),
            mime_type,
            content_length: response.content_length(),
        };
        debug!(
            url = url.as_str(),
            status = head.status,
            content_length = ?head.content_length,
            "http: response head"
        );

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(CacheError::from))
            .boxed();

        Ok(SourceResponse { head, body })
    }
}
