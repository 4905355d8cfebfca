//! Storage Statistics
//!
//! Record counters kept in memory while the storage is open and persisted in
//! the file header on flush/close.
//!
//! Counters are only modified under the engine write lock, atomics just let
//! readers take consistent-enough snapshots without it.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::header::FileHeader;

/// Live counters of an open storage
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    records_allocated: AtomicU32,
    records_relocated: AtomicU32,
    records_deleted: AtomicU32,
    live_payload_bytes: AtomicU64,
    live_capacity_bytes: AtomicU64,
}

impl StatsCounters {
    pub fn from_header(header: &FileHeader) -> Self {
        Self {
            records_allocated: AtomicU32::new(header.records_allocated),
            records_relocated: AtomicU32::new(header.records_relocated),
            records_deleted: AtomicU32::new(header.records_deleted),
            live_payload_bytes: AtomicU64::new(header.live_payload_bytes),
            live_capacity_bytes: AtomicU64::new(header.live_capacity_bytes),
        }
    }

    /// Copy the counters into `header` before it is written out
    pub fn store_into(&self, header: &mut FileHeader) {
        header.records_allocated = self.records_allocated();
        header.records_relocated = self.records_relocated();
        header.records_deleted = self.records_deleted();
        header.live_payload_bytes = self.live_payload_bytes();
        header.live_capacity_bytes = self.live_capacity_bytes();
    }

    // =========================================================================
    // Updates
    // =========================================================================

    pub fn on_allocated(&self, length: usize, capacity: usize) {
        self.records_allocated.fetch_add(1, Ordering::AcqRel);
        self.add_live(length, capacity);
    }

    /// Payload of a live record rewritten in place
    pub fn on_resized(&self, old_length: usize, new_length: usize) {
        if new_length >= old_length {
            self.live_payload_bytes
                .fetch_add((new_length - old_length) as u64, Ordering::AcqRel);
        } else {
            self.live_payload_bytes
                .fetch_sub((old_length - new_length) as u64, Ordering::AcqRel);
        }
    }

    /// Old slot of a relocated record. Without a redirect the old id is gone
    /// for good and counts as deleted.
    pub fn on_relocated(&self, length: usize, capacity: usize, redirect_left: bool) {
        if redirect_left {
            self.records_relocated.fetch_add(1, Ordering::AcqRel);
        } else {
            self.records_deleted.fetch_add(1, Ordering::AcqRel);
        }
        self.remove_live(length, capacity);
    }

    pub fn on_deleted(&self, length: usize, capacity: usize) {
        self.records_deleted.fetch_add(1, Ordering::AcqRel);
        self.remove_live(length, capacity);
    }

    /// A redirect left by relocation was deleted. Moves the slot from
    /// relocated to deleted, the live count stays the same.
    pub fn on_forwarder_deleted(&self) {
        self.records_relocated.fetch_sub(1, Ordering::AcqRel);
        self.records_deleted.fetch_add(1, Ordering::AcqRel);
    }

    fn add_live(&self, length: usize, capacity: usize) {
        self.live_payload_bytes.fetch_add(length as u64, Ordering::AcqRel);
        self.live_capacity_bytes.fetch_add(capacity as u64, Ordering::AcqRel);
    }

    fn remove_live(&self, length: usize, capacity: usize) {
        self.live_payload_bytes.fetch_sub(length as u64, Ordering::AcqRel);
        self.live_capacity_bytes.fetch_sub(capacity as u64, Ordering::AcqRel);
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn records_allocated(&self) -> u32 {
        self.records_allocated.load(Ordering::Acquire)
    }

    pub fn records_relocated(&self) -> u32 {
        self.records_relocated.load(Ordering::Acquire)
    }

    pub fn records_deleted(&self) -> u32 {
        self.records_deleted.load(Ordering::Acquire)
    }

    /// `allocated - deleted - relocated`
    pub fn live_records(&self) -> u32 {
        self.records_allocated()
            .saturating_sub(self.records_deleted())
            .saturating_sub(self.records_relocated())
    }

    pub fn live_payload_bytes(&self) -> u64 {
        self.live_payload_bytes.load(Ordering::Acquire)
    }

    pub fn live_capacity_bytes(&self) -> u64 {
        self.live_capacity_bytes.load(Ordering::Acquire)
    }

    pub fn snapshot(&self, size_in_bytes: u64) -> StorageStats {
        StorageStats {
            records_allocated: self.records_allocated(),
            records_relocated: self.records_relocated(),
            records_deleted: self.records_deleted(),
            live_records: self.live_records(),
            live_payload_bytes: self.live_payload_bytes(),
            live_capacity_bytes: self.live_capacity_bytes(),
            size_in_bytes,
        }
    }
}

/// Point-in-time copy of the storage statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StorageStats {
    pub records_allocated: u32,
    pub records_relocated: u32,
    pub records_deleted: u32,
    pub live_records: u32,
    pub live_payload_bytes: u64,
    pub live_capacity_bytes: u64,
    /// Logical size of the backing file
    pub size_in_bytes: u64,
}

impl StorageStats {
    /// Share of live record capacity actually used by payload, in `[0, 1]`
    pub fn capacity_utilization(&self) -> f64 {
        if self.live_capacity_bytes == 0 {
            return 0.0;
        }
        self.live_payload_bytes as f64 / self.live_capacity_bytes as f64
    }
}

impl fmt::Display for StorageStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "records: {} live ({} allocated, {} relocated, {} deleted), \
             payload: {} bytes in {} bytes of capacity ({:.1}%), file: {} bytes",
            self.live_records,
            self.records_allocated,
            self.records_relocated,
            self.records_deleted,
            self.live_payload_bytes,
            self.live_capacity_bytes,
            self.capacity_utilization() * 100.0,
            self.size_in_bytes
        )
    }
}
