//! # blobstore
//!
//! A paged storage engine for variable-length binary records with:
//! - Stable 32-bit record ids derived from record offsets
//! - In-place updates, relocation with redirects when a record outgrows its slot
//! - Pluggable space allocation strategies
//! - Clean-shutdown detection and statistics recovery
//! - Single-writer/multi-reader concurrency model
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    BlobStorage<S>                            │
//! │     write_to_record / read_record / delete / for_each       │
//! │            (Single Writer / Multi Reader)                    │
//! └──────┬──────────────────────┬──────────────────────┬────────┘
//!        │                      │                      │
//!        ▼                      ▼                      ▼
//! ┌─────────────┐      ┌────────────────┐      ┌─────────────┐
//! │   Record    │      │   Allocation   │      │   Header    │
//! │   Codec     │      │   Strategy     │      │  + Stats    │
//! └─────────────┘      └────────────────┘      └─────────────┘
//!        │
//!        ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  PageStorage (trait)                         │
//! │      PagedFile (page cache)  │  MmapPagedFile (mmap)         │
//! └─────────────────────────────────────────────────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod record;
pub mod allocation;
pub mod pages;
pub mod header;
pub mod stats;
pub mod engine;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{BlobError, Result};
pub use config::{AllocationConfig, Config};
pub use engine::BlobStorage;
pub use record::{RecordId, NULL_ID};
pub use stats::StorageStats;

/// Blob storage over the page-cached file backend
pub type PagedBlobStorage = BlobStorage<pages::PagedFile>;

/// Blob storage over the memory-mapped file backend
pub type MmapBlobStorage = BlobStorage<pages::MmapPagedFile>;

// =============================================================================
// Version Info
// =============================================================================

/// Current version of blobstore
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
