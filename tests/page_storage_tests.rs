//! Tests for the page storage backends
//!
//! Every test runs against both `PagedFile` and `MmapPagedFile`:
//! - Pages past the end read as zeros
//! - Written pages survive flush/close/reopen
//! - Logical length only grows, and is the file size after close
//! - Close is idempotent, later access fails

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;

use blobstore::pages::{MmapPagedFile, PageStorage, PagedFile};
use blobstore::BlobError;
use tempfile::TempDir;

const PAGE_SIZE: usize = 4096;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_file<S: PageStorage>() -> (TempDir, S) {
    let temp_dir = TempDir::new().unwrap();
    let storage = S::open(&temp_dir.path().join("pages.data"), PAGE_SIZE).unwrap();
    (temp_dir, storage)
}

fn reopen<S: PageStorage>(path: &Path) -> S {
    S::open(path, PAGE_SIZE).unwrap()
}

// =============================================================================
// Shared Checks
// =============================================================================

fn check_new_file_is_empty<S: PageStorage>() {
    let (_temp, storage) = setup_temp_file::<S>();

    assert_eq!(storage.length(), 0);
    assert_eq!(storage.page_size(), PAGE_SIZE);
    assert!(!storage.is_dirty());

    let all_zero = storage
        .read_page(3, |page| page.len() == PAGE_SIZE && page.iter().all(|&b| b == 0))
        .unwrap();
    assert!(all_zero);
}

fn check_pages_persist_across_reopen<S: PageStorage>() {
    let (temp, storage) = setup_temp_file::<S>();
    let path = storage.path().to_path_buf();

    storage.write_page(0, |page| page[..5].copy_from_slice(b"hello")).unwrap();
    storage
        .write_page(2, |page| page[PAGE_SIZE - 5..].copy_from_slice(b"world"))
        .unwrap();
    storage.extend_length(3 * PAGE_SIZE as u64);
    assert!(storage.is_dirty());

    storage.flush().unwrap();
    assert!(!storage.is_dirty());
    storage.close().unwrap();
    drop(storage);

    let storage: S = reopen(&path);
    assert_eq!(storage.length(), 3 * PAGE_SIZE as u64);
    let head = storage.read_page(0, |page| page[..5].to_vec()).unwrap();
    let tail = storage.read_page(2, |page| page[PAGE_SIZE - 5..].to_vec()).unwrap();
    assert_eq!(head, b"hello");
    assert_eq!(tail, b"world");
    storage.close().unwrap();
    drop(temp);
}

fn check_length_is_monotonic_and_trims_file<S: PageStorage>() {
    let (_temp, storage) = setup_temp_file::<S>();
    let path = storage.path().to_path_buf();

    storage.write_page(0, |page| page[0] = 1).unwrap();
    storage.extend_length(100);
    storage.extend_length(50);
    assert_eq!(storage.length(), 100);

    storage.close().unwrap();
    assert_eq!(fs::metadata(&path).unwrap().len(), 100);
}

fn check_close_is_idempotent<S: PageStorage>() {
    let (_temp, storage) = setup_temp_file::<S>();
    storage.write_page(0, |page| page[0] = 42).unwrap();

    storage.close().unwrap();
    storage.close().unwrap();

    assert!(matches!(storage.read_page(0, |_| ()), Err(BlobError::Closed(_))));
    assert!(matches!(storage.write_page(0, |_| ()), Err(BlobError::Closed(_))));
    assert!(matches!(storage.flush(), Err(BlobError::Closed(_))));
}

fn check_remove_file<S: PageStorage>() {
    let (_temp, storage) = setup_temp_file::<S>();
    let path = storage.path().to_path_buf();
    storage.write_page(0, |page| page[0] = 1).unwrap();
    storage.extend_length(8);

    storage.remove_file().unwrap();
    assert!(!path.exists());
    // Already gone: still fine
    storage.remove_file().unwrap();
}

fn check_concurrent_page_writes<S: PageStorage + 'static>() {
    let (_temp, storage) = setup_temp_file::<S>();
    let storage = Arc::new(storage);

    let handles: Vec<_> = (0..4u8)
        .map(|t| {
            let storage = Arc::clone(&storage);
            thread::spawn(move || {
                for i in 0..50u64 {
                    let page_index = i * 4 + t as u64;
                    storage
                        .write_page(page_index, |page| page.fill(t + 1))
                        .unwrap();
                    storage.extend_length((page_index + 1) * PAGE_SIZE as u64);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(storage.length(), 200 * PAGE_SIZE as u64);
    for page_index in 0..200u64 {
        let expected = (page_index % 4) as u8 + 1;
        let ok = storage
            .read_page(page_index, |page| page.iter().all(|&b| b == expected))
            .unwrap();
        assert!(ok, "page {}", page_index);
    }
    storage.close().unwrap();
}

// =============================================================================
// PagedFile Tests
// =============================================================================

#[test]
fn test_paged_file_new_file_is_empty() {
    check_new_file_is_empty::<PagedFile>();
}

#[test]
fn test_paged_file_pages_persist_across_reopen() {
    check_pages_persist_across_reopen::<PagedFile>();
}

#[test]
fn test_paged_file_length_is_monotonic_and_trims_file() {
    check_length_is_monotonic_and_trims_file::<PagedFile>();
}

#[test]
fn test_paged_file_close_is_idempotent() {
    check_close_is_idempotent::<PagedFile>();
}

#[test]
fn test_paged_file_remove_file() {
    check_remove_file::<PagedFile>();
}

#[test]
fn test_paged_file_concurrent_page_writes() {
    check_concurrent_page_writes::<PagedFile>();
}

#[test]
fn test_paged_file_rejects_zero_page_size() {
    let temp_dir = TempDir::new().unwrap();
    assert!(PagedFile::open(&temp_dir.path().join("x"), 0).is_err());
}

#[test]
fn test_paged_file_rejects_zero_cache_capacity() {
    let temp_dir = TempDir::new().unwrap();
    assert!(PagedFile::with_cache_capacity(&temp_dir.path().join("x"), PAGE_SIZE, 0).is_err());
}

#[test]
fn test_paged_file_cache_is_bounded() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("pages.data");
    let storage = PagedFile::with_cache_capacity(&path, PAGE_SIZE, 4).unwrap();

    for page_index in 0..20u64 {
        storage
            .write_page(page_index, |page| page.fill(page_index as u8 + 1))
            .unwrap();
        storage.extend_length((page_index + 1) * PAGE_SIZE as u64);
        assert!(storage.cached_pages() <= 4);
    }

    // Evicted pages come back from disk with their content
    for page_index in 0..20u64 {
        let expected = page_index as u8 + 1;
        let ok = storage
            .read_page(page_index, |page| page.iter().all(|&b| b == expected))
            .unwrap();
        assert!(ok, "page {}", page_index);
    }
    assert!(storage.cached_pages() <= 4);
    storage.close().unwrap();
    drop(storage);

    let storage = PagedFile::with_cache_capacity(&path, PAGE_SIZE, 2).unwrap();
    assert_eq!(storage.length(), 20 * PAGE_SIZE as u64);
    for page_index in 0..20u64 {
        let first = storage.read_page(page_index, |page| page[0]).unwrap();
        assert_eq!(first, page_index as u8 + 1);
    }
    storage.close().unwrap();
}

#[test]
fn test_paged_file_never_evicts_page_in_use() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("pages.data");
    let storage = PagedFile::with_cache_capacity(&path, PAGE_SIZE, 1).unwrap();

    storage
        .write_page(0, |held| {
            held[0] = 7;
            // Misses on other pages while page 0 is held
            for page_index in 1..8u64 {
                storage.write_page(page_index, |page| page[0] = 9).unwrap();
            }
            held[1] = 8;
        })
        .unwrap();
    storage.extend_length(8 * PAGE_SIZE as u64);
    storage.close().unwrap();
    drop(storage);

    let storage: PagedFile = reopen(&path);
    let head = storage.read_page(0, |page| [page[0], page[1]]).unwrap();
    assert_eq!(head, [7, 8]);
    for page_index in 1..8u64 {
        assert_eq!(storage.read_page(page_index, |page| page[0]).unwrap(), 9);
    }
    storage.close().unwrap();
}

// =============================================================================
// MmapPagedFile Tests
// =============================================================================

#[test]
fn test_mmap_new_file_is_empty() {
    check_new_file_is_empty::<MmapPagedFile>();
}

#[test]
fn test_mmap_pages_persist_across_reopen() {
    check_pages_persist_across_reopen::<MmapPagedFile>();
}

#[test]
fn test_mmap_length_is_monotonic_and_trims_file() {
    check_length_is_monotonic_and_trims_file::<MmapPagedFile>();
}

#[test]
fn test_mmap_close_is_idempotent() {
    check_close_is_idempotent::<MmapPagedFile>();
}

#[test]
fn test_mmap_remove_file() {
    check_remove_file::<MmapPagedFile>();
}

#[test]
fn test_mmap_concurrent_page_writes() {
    check_concurrent_page_writes::<MmapPagedFile>();
}

#[test]
fn test_mmap_drop_restores_file_size() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("foreign.data");
    fs::write(&path, b"not a page multiple").unwrap();

    let storage = MmapPagedFile::open(&path, PAGE_SIZE).unwrap();
    assert_eq!(storage.length(), 19);
    drop(storage);

    assert_eq!(fs::read(&path).unwrap(), b"not a page multiple");
}

// =============================================================================
// Cross-Backend Tests
// =============================================================================

#[test]
fn test_backends_share_file_format() {
    let (temp, storage) = setup_temp_file::<PagedFile>();
    let path = storage.path().to_path_buf();
    storage.write_page(1, |page| page[..4].copy_from_slice(b"BLOB")).unwrap();
    storage.extend_length(2 * PAGE_SIZE as u64);
    storage.close().unwrap();

    let mmap: MmapPagedFile = reopen(&path);
    let bytes = mmap.read_page(1, |page| page[..4].to_vec()).unwrap();
    assert_eq!(bytes, b"BLOB");
    mmap.close().unwrap();
    drop(temp);
}
