/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Memory-mapped file with an explicit open, flush and close lifecycle.
//!
//! Both fixed-layout stores sit on top of [`MappedFile`]. Dropping a mapped
//! file flushes it on a best-effort basis; [`MappedFile::close`] flushes and
//! reports failures.

use irongate_core::error::StoreError;
use memmap2::MmapMut;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A file mapped read-write into memory.
#[derive(Debug)]
pub struct MappedFile {
    /// Location of the file.
    path: PathBuf,
    /// Open handle kept for the lifetime of the mapping.
    _file: File,
    /// The mapping itself.
    map: MmapMut,
    /// True when the file did not exist (or was empty) before opening.
    created: bool,
    /// Set once `close` has flushed the mapping.
    closed: bool,
}

impl MappedFile {
    /// Opens or creates a mapped file.
    ///
    /// A new file is sized to `len`. An existing file keeps its size, so a
    /// changed configuration never truncates persisted state.
    ///
    /// # Arguments
    /// * `path` - File to map
    /// * `len` - Size in bytes for a newly created file
    ///
    /// # Errors
    /// Returns `StoreError::Io` if the file cannot be opened, sized or mapped.
    pub fn open(path: &Path, len: u64) -> Result<Self, StoreError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| StoreError::io(path, &e))?;

        let existing = file.metadata().map_err(|e| StoreError::io(path, &e))?.len();
        let created = existing == 0;
        if created {
            file.set_len(len).map_err(|e| StoreError::io(path, &e))?;
        }

        // SAFETY: the file is owned by this engine instance (guarded by the
        // liveness marker) and never truncated while mapped.
        let map = unsafe { MmapMut::map_mut(&file) }.map_err(|e| StoreError::io(path, &e))?;
        debug!(path = %path.display(), len = map.len(), created, "mapped file opened");

        Ok(Self {
            path: path.to_path_buf(),
            _file: file,
            map,
            created,
            closed: false,
        })
    }

    /// Returns true if this open created the file.
    #[inline]
    #[must_use]
    pub const fn created(&self) -> bool {
        self.created
    }

    /// Returns the path of the file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the size of the mapping in bytes.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns true for an empty mapping.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Returns the mapped bytes.
    #[inline]
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.map
    }

    /// Returns the mapped bytes for writing.
    #[inline]
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.map
    }

    /// Reads a little-endian `u64` at `offset`.
    #[inline]
    #[must_use]
    pub fn read_u64(&self, offset: usize) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.map[offset..offset + 8]);
        u64::from_le_bytes(raw)
    }

    /// Writes a little-endian `u64` at `offset`.
    #[inline]
    pub fn write_u64(&mut self, offset: usize, value: u64) {
        self.map[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    /// Reads a little-endian `u32` at `offset`.
    #[inline]
    #[must_use]
    pub fn read_u32(&self, offset: usize) -> u32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.map[offset..offset + 4]);
        u32::from_le_bytes(raw)
    }

    /// Writes a little-endian `u32` at `offset`.
    #[inline]
    pub fn write_u32(&mut self, offset: usize, value: u32) {
        self.map[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Synchronously flushes the whole mapping.
    ///
    /// # Errors
    /// Returns `StoreError::Io` if the flush fails.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.map.flush().map_err(|e| StoreError::io(&self.path, &e))
    }

    /// Synchronously flushes `len` bytes starting at `offset`.
    ///
    /// # Errors
    /// Returns `StoreError::Io` if the flush fails.
    pub fn flush_range(&self, offset: usize, len: usize) -> Result<(), StoreError> {
        self.map
            .flush_range(offset, len)
            .map_err(|e| StoreError::io(&self.path, &e))
    }

    /// Flushes and unmaps the file.
    ///
    /// # Errors
    /// Returns `StoreError::Io` if the final flush fails.
    pub fn close(mut self) -> Result<(), StoreError> {
        self.flush()?;
        self.closed = true;
        debug!(path = %self.path.display(), "mapped file closed");
        Ok(())
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        if !self.closed
            && let Err(e) = self.flush()
        {
            warn!(error = %e, "flush on drop failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_and_sizes_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("mapped");

        let file = MappedFile::open(&path, 4096).unwrap();
        assert!(file.created());
        assert_eq!(file.len(), 4096);
        assert!(file.bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_values_survive_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("mapped");

        let mut file = MappedFile::open(&path, 1024).unwrap();
        file.write_u64(8, 0xDEAD_BEEF);
        file.write_u32(16, 77);
        file.close().unwrap();

        let reopened = MappedFile::open(&path, 2048).unwrap();
        assert!(!reopened.created());
        assert_eq!(reopened.len(), 1024);
        assert_eq!(reopened.read_u64(8), 0xDEAD_BEEF);
        assert_eq!(reopened.read_u32(16), 77);
    }

    #[test]
    fn test_drop_without_close_keeps_writes() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("mapped");

        {
            let mut file = MappedFile::open(&path, 512).unwrap();
            file.write_u64(0, 42);
        }

        let reopened = MappedFile::open(&path, 512).unwrap();
        assert_eq!(reopened.read_u64(0), 42);
    }
}
