//! Page Storage Module
//!
//! Byte-addressable, page-locked access to a growable file.
//!
//! ## Responsibilities
//! - Hand out page contents under a read or write lock
//! - Track the logical length of the data written so far
//! - Persist dirty pages on flush/close
//!
//! ## Backends
//! - [`PagedFile`]: bounded page cache over a plain file, one lock per page
//! - [`MmapPagedFile`]: memory-mapped file behind a single coarse lock
//!
//! The blob engine is generic over [`PageStorage`], it never touches the
//! file directly.

mod mmap;
mod paged_file;

use std::path::Path;

use crate::error::Result;

pub use mmap::MmapPagedFile;
pub use paged_file::{PagedFile, DEFAULT_CACHE_PAGES};

/// Contract between the blob engine and a page-addressable backing file
pub trait PageStorage: Send + Sync + Sized {
    /// Open (or create) the backing file with the given page size
    fn open(path: &Path, page_size: usize) -> Result<Self>;

    fn page_size(&self) -> usize;

    /// Logical length: end of the furthest byte reported via [`extend_length`]
    /// (or the file size at open)
    ///
    /// [`extend_length`]: PageStorage::extend_length
    fn length(&self) -> u64;

    fn path(&self) -> &Path;

    /// Run `reader` over the page content, holding the page read lock.
    /// Pages beyond the end of the file read as zeros.
    fn read_page<R, F>(&self, page_index: u64, reader: F) -> Result<R>
    where
        F: FnOnce(&[u8]) -> R;

    /// Run `writer` over the page content, holding the page exclusively
    fn write_page<R, F>(&self, page_index: u64, writer: F) -> Result<R>
    where
        F: FnOnce(&mut [u8]) -> R;

    /// Grow the logical length to at least `end_offset`
    fn extend_length(&self, end_offset: u64);

    /// True if there are page modifications not yet flushed
    fn is_dirty(&self) -> bool;

    fn flush(&self) -> Result<()>;

    /// Flush and release the file. Idempotent; any later access fails
    /// with a closed-state error.
    fn close(&self) -> Result<()>;

    /// Close and delete the backing file
    fn remove_file(&self) -> Result<()>;

    /// Index of the page holding `offset`
    fn page_index(&self, offset: u64) -> u64 {
        offset / self.page_size() as u64
    }

    /// Position of `offset` inside its page
    fn offset_in_page(&self, offset: u64) -> usize {
        (offset % self.page_size() as u64) as usize
    }
}
