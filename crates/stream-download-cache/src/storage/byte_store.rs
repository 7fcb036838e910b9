//! Storage backed by a single filesystem file.
//!
//! One [`ByteStore`] maps to exactly one file on disk (a single resource). The file grows by
//! appends from the fetch session while range reads are served from it concurrently.
//!
//! Design notes:
//! - Reads and writes share one `Mutex` around one read/write handle, so a read never observes
//!   a torn append.
//! - Writes always go to end-of-file; the store never seeks backward to write.
//! - [`ByteStore::size`] asks the filesystem every time instead of tracking a counter.
//! - The path can change once, when a verified download is promoted to its final name.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::error::{CacheError, CacheResult};

/// Append-only file store with random-offset reads.
#[derive(Debug)]
pub struct ByteStore {
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    path: PathBuf,
    file: Option<File>,
}

impl ByteStore {
    /// Open (or create) the file at `path`.
    ///
    /// An existing non-empty file is kept but logged: appending to a dirty file shifts every
    /// offset the range resolver relies on.
    pub fn open(path: impl AsRef<Path>) -> CacheResult<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| CacheError::from(e).with_context("creating cache directory"))?;
        }

        if let Ok(meta) = fs::metadata(&path) {
            if meta.len() > 0 {
                warn!(
                    "byte_store: file already exists path='{}' len={}; a non-empty file can cause unexpected behavior",
                    path.display(),
                    meta.len()
                );
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| CacheError::from(e).with_context("opening cache file"))?;

        trace!("byte_store: open path='{}'", path.display());
        Ok(Self {
            inner: Mutex::new(Inner {
                path,
                file: Some(file),
            }),
        })
    }

    /// Open a finished file read-only. Returns `None` if nothing exists at `path`.
    pub fn open_existing(path: impl AsRef<Path>) -> CacheResult<Option<Self>> {
        let path = path.as_ref().to_path_buf();
        let file = match OpenOptions::new().read(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CacheError::from(e).with_context("opening cached file")),
        };
        if !file.metadata()?.is_file() {
            return Ok(None);
        }

        trace!("byte_store: open existing path='{}'", path.display());
        Ok(Some(Self {
            inner: Mutex::new(Inner {
                path,
                file: Some(file),
            }),
        }))
    }

    /// Current file path.
    pub fn path(&self) -> PathBuf {
        self.inner.lock().path.clone()
    }

    /// Append `data` at end-of-file.
    pub fn append(&self, data: &[u8]) -> CacheResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        let file = inner.file_mut()?;
        file.seek(SeekFrom::End(0))?;
        file.write_all(data)?;
        trace!("byte_store: append {} bytes", data.len());
        Ok(())
    }

    /// Read up to `length` bytes starting at `offset`.
    ///
    /// Returns a short buffer when the file ends before `offset + length`, and `None` when
    /// `offset` is at or past the end of the file or the read fails.
    pub fn read(&self, offset: u64, length: usize) -> Option<Bytes> {
        let mut inner = self.inner.lock();
        match inner.read_at(offset, length) {
            Ok(Some(bytes)) => Some(bytes),
            Ok(None) => None,
            Err(e) => {
                warn!(
                    "byte_store: read failed path='{}' offset={} len={} err='{}'",
                    inner.path.display(),
                    offset,
                    length,
                    e
                );
                None
            }
        }
    }

    /// Length of the file on disk, queried fresh.
    pub fn size(&self) -> u64 {
        let inner = self.inner.lock();
        inner.current_len()
    }

    /// Flush written bytes to stable storage.
    pub fn sync(&self) -> CacheResult<()> {
        let mut inner = self.inner.lock();
        let file = inner.file_mut()?;
        file.flush()?;
        file.sync_data()?;
        Ok(())
    }

    /// Rename the file to `final_path`. Readers keep working against the same handle.
    pub fn persist(&self, final_path: impl AsRef<Path>) -> CacheResult<()> {
        let final_path = final_path.as_ref();
        let mut inner = self.inner.lock();
        fs::rename(&inner.path, final_path)
            .map_err(|e| CacheError::from(e).with_context("promoting cache file"))?;
        trace!(
            "byte_store: persist '{}' -> '{}'",
            inner.path.display(),
            final_path.display()
        );
        inner.path = final_path.to_path_buf();
        Ok(())
    }

    /// Close the handle and remove the file.
    pub fn delete(&self) -> CacheResult<()> {
        let mut inner = self.inner.lock();
        inner.file = None;
        match fs::remove_file(&inner.path) {
            Ok(()) => {
                trace!("byte_store: deleted path='{}'", inner.path.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!(
                    "byte_store: delete failed path='{}' err='{}'",
                    inner.path.display(),
                    e
                );
                Err(CacheError::from(e).with_context("deleting cache file"))
            }
        }
    }
}

impl Inner {
    fn file_mut(&mut self) -> CacheResult<&mut File> {
        self.file.as_mut().ok_or_else(|| {
            CacheError::from(io::Error::new(
                io::ErrorKind::NotFound,
                "cache file was deleted",
            ))
        })
    }

    fn current_len(&self) -> u64 {
        match &self.file {
            Some(file) => file.metadata().map(|m| m.len()).unwrap_or(0),
            None => 0,
        }
    }

    fn read_at(&mut self, offset: u64, length: usize) -> io::Result<Option<Bytes>> {
        let len = self.current_len();
        if offset >= len || length == 0 {
            return Ok(None);
        }
        let want = (len - offset).min(length as u64) as usize;

        let Some(file) = self.file.as_mut() else {
            return Ok(None);
        };
        file.seek(SeekFrom::Start(offset))?;

        let mut buf = vec![0u8; want];
        let mut filled = 0;
        while filled < want {
            match file.read(&mut buf[filled..])? {
                0 => break,
                n => filled += n,
            }
        }
        buf.truncate(filled);

        if buf.is_empty() {
            Ok(None)
        } else {
            Ok(Some(Bytes::from(buf)))
        }
    }
}
