//! Age-based cache purge.
//!
//! A small marker file records when the cache directory was last cleared. It lives **outside**
//! the cache directory so the purge cannot delete it.
//!
//! Layout:
//! - Cache dir: `<cache_dir>/`
//! - Marker:    `<cache_dir>.last-clear` (overridable), content `cleared_at=<unix seconds>\n`
//!
//! On startup:
//! - no marker: record "now", keep the cache;
//! - marker older than the purge interval: delete the whole cache directory, recreate it, and
//!   record "now";
//! - otherwise: keep the cache.
//!
//! The purge is coarse (no per-entry TTL, no LRU) and must never run while a fetch is active;
//! [`MediaCache`](crate::MediaCache) enforces that. Independently of age, startup also sweeps
//! `*.part` files left behind by sessions that never completed.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, trace, warn};

use crate::error::{CacheError, CacheResult};
use crate::key::is_partial_file;

const MARKER_PREFIX: &str = "cleared_at=";

/// What a janitor run did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JanitorOutcome {
    /// No marker existed; one was written and nothing was deleted.
    Initialized,
    /// The marker was fresh; nothing was deleted.
    Kept,
    /// The cache directory was purged.
    Purged,
}

/// Purges the cache directory once per interval.
#[derive(Debug, Clone)]
pub struct Janitor {
    cache_dir: PathBuf,
    marker: PathBuf,
    interval: Duration,
}

impl Janitor {
    pub fn new(cache_dir: impl Into<PathBuf>, marker: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            marker: marker.into(),
            interval,
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn marker_path(&self) -> &Path {
        &self.marker
    }

    /// Time of the last clear, if a readable marker exists.
    pub fn last_cleared(&self) -> Option<SystemTime> {
        let text = fs::read_to_string(&self.marker).ok()?;
        let secs: u64 = text.trim().strip_prefix(MARKER_PREFIX)?.parse().ok()?;
        Some(UNIX_EPOCH + Duration::from_secs(secs))
    }

    /// Overwrite the marker with `at`.
    pub fn record_cleared(&self, at: SystemTime) -> CacheResult<()> {
        let secs = at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        if let Some(parent) = self.marker.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.marker, format!("{MARKER_PREFIX}{secs}\n"))
            .map_err(|e| CacheError::from(e).with_context("writing janitor marker"))?;
        trace!("janitor: marker written path='{}' secs={}", self.marker.display(), secs);
        Ok(())
    }

    /// Run the startup check against the current time.
    pub fn run(&self) -> CacheResult<JanitorOutcome> {
        self.run_at(SystemTime::now())
    }

    /// Run the startup check as if the current time were `now`.
    pub fn run_at(&self, now: SystemTime) -> CacheResult<JanitorOutcome> {
        let Some(last) = self.last_cleared() else {
            debug!("janitor: no marker; recording first use");
            self.record_cleared(now)?;
            return Ok(JanitorOutcome::Initialized);
        };

        // A marker from the future (clock change) counts as fresh.
        let age = now.duration_since(last).unwrap_or(Duration::ZERO);
        if age <= self.interval {
            trace!("janitor: cache kept age={:?} interval={:?}", age, self.interval);
            return Ok(JanitorOutcome::Kept);
        }

        debug!(
            "janitor: purging cache dir='{}' age={:?}",
            self.cache_dir.display(),
            age
        );
        self.purge()?;
        self.record_cleared(now)?;
        Ok(JanitorOutcome::Purged)
    }

    /// Delete the whole cache directory and recreate it empty.
    pub fn purge(&self) -> CacheResult<()> {
        match fs::remove_dir_all(&self.cache_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(CacheError::from(e).with_context("purging cache directory")),
        }
        fs::create_dir_all(&self.cache_dir)?;
        Ok(())
    }

    /// Delete leftover in-flight files. Returns how many were removed.
    ///
    /// Best-effort: unreadable entries and failed deletions are logged and skipped.
    pub fn sweep_partial_files(&self) -> usize {
        let entries = match fs::read_dir(&self.cache_dir) {
            Ok(e) => e,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return 0,
            Err(e) => {
                warn!(
                    "janitor: cannot list cache dir='{}' err='{}'",
                    self.cache_dir.display(),
                    e
                );
                return 0;
            }
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if !is_partial_file(&path) {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => {
                    trace!("janitor: removed incomplete file='{}'", path.display());
                    removed += 1;
                }
                Err(e) => warn!(
                    "janitor: cannot remove incomplete file='{}' err='{}'",
                    path.display(),
                    e
                ),
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(60 * 60);

    fn janitor(root: &Path) -> Janitor {
        Janitor::new(root.join("cache"), root.join("cache.last-clear"), 24 * HOUR)
    }

    #[test]
    fn first_run_records_marker_and_keeps_files() {
        let root = tempfile::tempdir().unwrap();
        let j = janitor(root.path());
        fs::create_dir_all(j.cache_dir()).unwrap();
        fs::write(j.cache_dir().join("a"), b"x").unwrap();

        assert_eq!(j.run().unwrap(), JanitorOutcome::Initialized);
        assert!(j.last_cleared().is_some());
        assert!(j.cache_dir().join("a").exists());
    }

    #[test]
    fn stale_marker_purges_cache_dir() {
        let root = tempfile::tempdir().unwrap();
        let j = janitor(root.path());
        fs::create_dir_all(j.cache_dir()).unwrap();
        fs::write(j.cache_dir().join("a"), b"x").unwrap();

        let now = SystemTime::now();
        j.record_cleared(now - 25 * HOUR).unwrap();
        assert_eq!(j.run_at(now).unwrap(), JanitorOutcome::Purged);

        assert!(j.cache_dir().exists());
        assert_eq!(fs::read_dir(j.cache_dir()).unwrap().count(), 0);
        assert!(j.marker_path().exists());

        // Marker was reset, so an immediate second run keeps the cache.
        assert_eq!(j.run_at(now).unwrap(), JanitorOutcome::Kept);
    }

    #[test]
    fn fresh_marker_keeps_cache_dir() {
        let root = tempfile::tempdir().unwrap();
        let j = janitor(root.path());
        fs::create_dir_all(j.cache_dir()).unwrap();
        fs::write(j.cache_dir().join("a"), b"x").unwrap();

        let now = SystemTime::now();
        j.record_cleared(now - HOUR).unwrap();
        assert_eq!(j.run_at(now).unwrap(), JanitorOutcome::Kept);
        assert!(j.cache_dir().join("a").exists());
    }

    #[test]
    fn sweep_removes_only_partial_files() {
        let root = tempfile::tempdir().unwrap();
        let j = janitor(root.path());
        fs::create_dir_all(j.cache_dir()).unwrap();
        fs::write(j.cache_dir().join("done"), b"x").unwrap();
        fs::write(j.cache_dir().join("half.part"), b"x").unwrap();

        assert_eq!(j.sweep_partial_files(), 1);
        assert!(j.cache_dir().join("done").exists());
        assert!(!j.cache_dir().join("half.part").exists());
    }

    #[test]
    fn garbage_marker_is_treated_as_missing() {
        let root = tempfile::tempdir().unwrap();
        let j = janitor(root.path());
        fs::write(j.marker_path(), b"nonsense").unwrap();
        assert_eq!(j.last_cleared(), None);
        assert_eq!(j.run().unwrap(), JanitorOutcome::Initialized);
    }
}
