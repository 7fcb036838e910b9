//! Resource keys and on-disk naming.
//!
//! Every cached resource is addressed by a [`ResourceKey`]: the lowercase hex MD5 digest of its
//! identifying string (in practice, the URL). The key doubles as the file name inside the cache
//! directory.
//!
//! Agreed on-disk layout
//! ---------------------
//! - Complete download: `<cache_dir>/<key>`
//! - Download in flight: `<cache_dir>/<key>.part`
//!
//! A file only gets its final name after the download has been verified, so the presence of
//! `<key>` is the completion marker. Leftover `.part` files come from sessions that never
//! finished (crash, kill, cancellation) and are swept by the janitor on startup.
//!
//! This module does **not** perform any IO.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::trace;

use crate::digest::md5;

/// Suffix of a cache file whose download has not completed.
pub const PARTIAL_SUFFIX: &str = "part";

/// Stable, digest-derived identifier of a cached resource.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey(pub Arc<str>);

impl ResourceKey {
    /// Derive the key for an identifying string.
    pub fn from_identifier(identifier: &str) -> Self {
        let key = ResourceKey(md5(identifier.as_bytes()).to_hex().into());
        trace!("cache_key: derived identifier='{}' key='{}'", identifier, key.0);
        key
    }

    /// Derive the key for a URL (its full serialized form, query included).
    pub fn from_url(url: &url::Url) -> Self {
        Self::from_identifier(url.as_str())
    }

    /// The 32-character hex digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path of the completed file for this key.
    pub fn complete_path(&self, cache_dir: &Path) -> PathBuf {
        cache_dir.join(&*self.0)
    }

    /// Path of the in-flight file for this key.
    pub fn partial_path(&self, cache_dir: &Path) -> PathBuf {
        cache_dir.join(format!("{}.{}", self.0, PARTIAL_SUFFIX))
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResourceKey({})", self.0)
    }
}

/// True if `path` looks like an in-flight cache file.
pub fn is_partial_file(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(PARTIAL_SUFFIX)
}
