//! Memory-Mapped Paged File
//!
//! Maps the whole file and hands out page slices straight from the mapping.
//! The mapping is grown (and remapped) page by page as records are appended.
//!
//! ## Locking
//!
//! A remap invalidates every slice into the old mapping, so all access goes
//! through a single `RwLock`: page reads share it, page writes and remaps
//! take it exclusively.
//!
//! ## File Size
//!
//! While open, the file size is a whole number of pages. On close the file
//! is truncated back to the logical length.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use memmap2::MmapMut;
use parking_lot::RwLock;

use crate::error::{BlobError, Result};

use super::PageStorage;

struct Mapping {
    file: File,
    mmap: MmapMut,
    mapped_len: u64,
}

/// Memory-mapped file storage
pub struct MmapPagedFile {
    path: PathBuf,
    page_size: usize,
    /// `None` once closed
    mapping: RwLock<Option<Mapping>>,
    length: AtomicU64,
    dirty: AtomicBool,
}

impl MmapPagedFile {
    fn closed_error(&self) -> BlobError {
        BlobError::Closed(format!("mmap file {} is closed", self.path.display()))
    }

    /// Grow file and mapping so that `page_index` is mapped
    fn ensure_mapped(&self, mapping: &mut Mapping, page_index: u64) -> Result<()> {
        let needed = (page_index + 1) * self.page_size as u64;
        if needed <= mapping.mapped_len {
            return Ok(());
        }

        mapping.file.set_len(needed)?;
        // SAFETY: MmapMut::map_mut is unsafe because the file could be modified
        // outside this process. The file is owned by this storage for its whole
        // lifetime, and the exclusive lock guarantees no slice of the old
        // mapping is alive while we replace it.
        mapping.mmap = unsafe { MmapMut::map_mut(&mapping.file)? };
        mapping.mapped_len = needed;
        Ok(())
    }
}

impl PageStorage for MmapPagedFile {
    fn open(path: &Path, page_size: usize) -> Result<Self> {
        if page_size == 0 {
            return Err(BlobError::InvalidArgument("page_size must be > 0".to_string()));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let length = file.metadata()?.len();
        // Zero-length mappings are not portable: always map at least one page
        let pages = length.div_ceil(page_size as u64).max(1);
        let mapped_len = pages * page_size as u64;
        file.set_len(mapped_len)?;

        // SAFETY: see ensure_mapped(); nothing else can hold a slice yet.
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        Ok(Self {
            path: path.to_path_buf(),
            page_size,
            mapping: RwLock::new(Some(Mapping {
                file,
                mmap,
                mapped_len,
            })),
            length: AtomicU64::new(length),
            dirty: AtomicBool::new(false),
        })
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn length(&self) -> u64 {
        self.length.load(Ordering::Acquire)
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn read_page<R, F>(&self, page_index: u64, reader: F) -> Result<R>
    where
        F: FnOnce(&[u8]) -> R,
    {
        let guard = self.mapping.read();
        let mapping = guard.as_ref().ok_or_else(|| self.closed_error())?;

        let start = (page_index * self.page_size as u64) as usize;
        if (start + self.page_size) as u64 <= mapping.mapped_len {
            return Ok(reader(&mapping.mmap[start..start + self.page_size]));
        }
        drop(guard);

        // Not mapped yet: the page is all zeros until written
        let zeros = vec![0u8; self.page_size];
        Ok(reader(&zeros))
    }

    fn write_page<R, F>(&self, page_index: u64, writer: F) -> Result<R>
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut guard = self.mapping.write();
        let mapping = guard.as_mut().ok_or_else(|| self.closed_error())?;
        self.ensure_mapped(mapping, page_index)?;

        self.dirty.store(true, Ordering::Release);
        let start = (page_index * self.page_size as u64) as usize;
        Ok(writer(&mut mapping.mmap[start..start + self.page_size]))
    }

    fn extend_length(&self, end_offset: u64) {
        if self.length.fetch_max(end_offset, Ordering::AcqRel) < end_offset {
            self.dirty.store(true, Ordering::Release);
        }
    }

    fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    fn flush(&self) -> Result<()> {
        let guard = self.mapping.read();
        let mapping = guard.as_ref().ok_or_else(|| self.closed_error())?;
        self.dirty.store(false, Ordering::Release);
        mapping.mmap.flush()?;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut guard = self.mapping.write();
        let Some(mapping) = guard.take() else {
            return Ok(());
        };

        mapping.mmap.flush()?;
        // Unmap before truncating: the mapping must never outlive the file end
        drop(mapping.mmap);
        mapping.file.set_len(self.length.load(Ordering::Acquire))?;
        mapping.file.sync_all()?;
        self.dirty.store(false, Ordering::Release);
        Ok(())
    }

    fn remove_file(&self) -> Result<()> {
        self.close()?;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for MmapPagedFile {
    fn drop(&mut self) {
        // Restores the logical file size
        let _ = self.close();
    }
}

impl fmt::Display for MmapPagedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MmapPagedFile[{}]{{page_size: {}, length: {}}}",
            self.path.display(),
            self.page_size,
            self.length()
        )
    }
}
