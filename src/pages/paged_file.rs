//! Paged File
//!
//! Plain file with a bounded in-memory page cache. Pages are loaded on first
//! access and written back on flush, or when they are evicted.
//!
//! ## Eviction
//!
//! SIEVE-style second chance: a hit marks the page visited, the eviction
//! hand clears visited flags until it finds an unvisited page. A page held
//! by a running read/write closure is pinned and never evicted. When every
//! cached page is pinned the cache grows past its capacity for that miss.

use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::{BlobError, Result};

use super::PageStorage;

/// Pages kept in memory by [`PagedFile::open`]
pub const DEFAULT_CACHE_PAGES: usize = 64;

/// Single cached page, locked independently of the others
struct CachedPage {
    data: RwLock<Box<[u8]>>,
    dirty: AtomicBool,
    visited: AtomicBool,
}

impl CachedPage {
    /// Held outside the cache, i.e. by a closure in progress
    fn is_pinned(self: &Arc<Self>) -> bool {
        Arc::strong_count(self) > 1
    }
}

struct PageCache {
    entries: Vec<(u64, Arc<CachedPage>)>,
    index: HashMap<u64, usize>,
    hand: usize,
    capacity: usize,
}

impl PageCache {
    fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
            hand: 0,
            capacity,
        }
    }

    fn get(&self, page_index: u64) -> Option<&Arc<CachedPage>> {
        self.index.get(&page_index).map(|&slot| &self.entries[slot].1)
    }

    fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    /// Slot of the next page to evict, `None` if every page is pinned
    fn victim(&mut self) -> Option<usize> {
        let len = self.entries.len();
        // Two rounds: the first may only clear visited flags
        for _ in 0..2 * len {
            let page = &self.entries[self.hand].1;
            if !page.is_pinned() && !page.visited.swap(false, Ordering::AcqRel) {
                return Some(self.hand);
            }
            self.hand = (self.hand + 1) % len;
        }
        None
    }

    fn remove(&mut self, slot: usize) {
        let (page_index, _) = self.entries.swap_remove(slot);
        self.index.remove(&page_index);
        if slot < self.entries.len() {
            self.index.insert(self.entries[slot].0, slot);
        }
        if self.hand >= self.entries.len() {
            self.hand = 0;
        }
    }

    fn insert(&mut self, page_index: u64, page: Arc<CachedPage>) {
        self.index.insert(page_index, self.entries.len());
        self.entries.push((page_index, page));
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
        self.hand = 0;
    }
}

/// Page-cached file storage
///
/// ## Concurrency:
/// - `cache`: RwLock over the page cache, held only to look up, insert or
///   evict pages
/// - each page: its own RwLock (readers share, writer exclusive)
/// - `file`: Mutex, held while loading or writing back pages. Always taken
///   before `cache` when both are needed.
pub struct PagedFile {
    path: PathBuf,
    page_size: usize,
    /// `None` once closed
    file: Mutex<Option<File>>,
    cache: RwLock<PageCache>,
    length: AtomicU64,
    dirty: AtomicBool,
    closed: AtomicBool,
}

impl PagedFile {
    /// Open with room for `cache_pages` pages in memory
    pub fn with_cache_capacity(path: &Path, page_size: usize, cache_pages: usize) -> Result<Self> {
        if page_size == 0 {
            return Err(BlobError::InvalidArgument("page_size must be > 0".to_string()));
        }
        if cache_pages == 0 {
            return Err(BlobError::InvalidArgument("cache_pages must be > 0".to_string()));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let length = file.metadata()?.len();

        Ok(Self {
            path: path.to_path_buf(),
            page_size,
            file: Mutex::new(Some(file)),
            cache: RwLock::new(PageCache::new(cache_pages)),
            length: AtomicU64::new(length),
            dirty: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Number of pages currently held in memory
    pub fn cached_pages(&self) -> usize {
        self.cache.read().entries.len()
    }

    fn closed_error(&self) -> BlobError {
        BlobError::Closed(format!("paged file {} is closed", self.path.display()))
    }

    fn check_not_closed(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(self.closed_error());
        }
        Ok(())
    }

    /// Get a page from the cache, loading it from disk on a miss
    fn page(&self, page_index: u64) -> Result<Arc<CachedPage>> {
        self.check_not_closed()?;

        if let Some(page) = self.cache.read().get(page_index) {
            page.visited.store(true, Ordering::Release);
            return Ok(Arc::clone(page));
        }

        let mut guard = self.file.lock();
        let file = guard.as_mut().ok_or_else(|| self.closed_error())?;
        let mut cache = self.cache.write();

        // Another thread may have loaded (and modified) it meanwhile: keep theirs
        if let Some(page) = cache.get(page_index) {
            return Ok(Arc::clone(page));
        }

        if cache.is_full() {
            if let Some(slot) = cache.victim() {
                let (evicted_index, evicted) = &cache.entries[slot];
                if evicted.dirty.swap(false, Ordering::AcqRel) {
                    let written = self.write_page_at(file, *evicted_index, &evicted.data.read());
                    if let Err(e) = written {
                        evicted.dirty.store(true, Ordering::Release);
                        return Err(e);
                    }
                }
                cache.remove(slot);
            }
        }

        let page = Arc::new(CachedPage {
            data: RwLock::new(self.load_page(file, page_index)?),
            dirty: AtomicBool::new(false),
            visited: AtomicBool::new(false),
        });
        cache.insert(page_index, Arc::clone(&page));
        Ok(page)
    }

    fn load_page(&self, file: &mut File, page_index: u64) -> Result<Box<[u8]>> {
        let mut buffer = vec![0u8; self.page_size].into_boxed_slice();

        let file_size = file.metadata()?.len();
        let page_start = page_index * self.page_size as u64;
        if page_start < file_size {
            let available = (file_size - page_start).min(self.page_size as u64) as usize;
            file.seek(SeekFrom::Start(page_start))?;
            file.read_exact(&mut buffer[..available])?;
        }
        Ok(buffer)
    }

    fn write_page_at(&self, file: &mut File, page_index: u64, data: &[u8]) -> Result<()> {
        file.seek(SeekFrom::Start(page_index * self.page_size as u64))?;
        file.write_all(data)?;
        Ok(())
    }

    fn write_back(&self, file: &mut File) -> Result<()> {
        let cache = self.cache.read();
        let mut pages: Vec<&(u64, Arc<CachedPage>)> = cache.entries.iter().collect();
        pages.sort_unstable_by_key(|(index, _)| *index);

        for (index, page) in pages {
            if !page.dirty.swap(false, Ordering::AcqRel) {
                continue;
            }
            self.write_page_at(file, *index, &page.data.read())?;
        }

        // Whole pages were written: cut the file back to the logical length
        file.set_len(self.length.load(Ordering::Acquire))?;
        file.sync_data()?;
        Ok(())
    }
}

impl PageStorage for PagedFile {
    fn open(path: &Path, page_size: usize) -> Result<Self> {
        Self::with_cache_capacity(path, page_size, DEFAULT_CACHE_PAGES)
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
        let page = self.page(page_index)?;
        let data = page.data.read();
        Ok(reader(&data))
    }

    fn write_page<R, F>(&self, page_index: u64, writer: F) -> Result<R>
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let page = self.page(page_index)?;
        let mut data = page.data.write();
        page.dirty.store(true, Ordering::Release);
        self.dirty.store(true, Ordering::Release);
        Ok(writer(&mut data))
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
        self.check_not_closed()?;
        let mut guard = self.file.lock();
        if let Some(file) = guard.as_mut() {
            self.dirty.store(false, Ordering::Release);
            self.write_back(file)?;
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut guard = self.file.lock();
        let Some(mut file) = guard.take() else {
            return Ok(());
        };
        self.closed.store(true, Ordering::Release);

        let result = self.write_back(&mut file);
        self.cache.write().clear();
        self.dirty.store(false, Ordering::Release);
        result
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

impl fmt::Display for PagedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PagedFile[{}]{{page_size: {}, length: {}}}",
            self.path.display(),
            self.page_size,
            self.length()
        )
    }
}
