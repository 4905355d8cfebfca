//! Space Allocation Strategies
//!
//! Decide how much capacity a record gets when it is (re)allocated.
//!
//! A strategy is chosen per storage instance and is otherwise pure: it keeps
//! no state and has no side effects, so the engine may call it from any thread.

use std::fmt;

use crate::error::{BlobError, Result};
use crate::record::LARGE_MAX_CAPACITY;

/// Capacity policy used by the engine for new and relocated records
pub trait SpaceAllocationStrategy: Send + Sync + fmt::Debug {
    /// Scratch buffer size handed to writers of brand new records
    fn default_capacity(&self) -> usize;

    /// Capacity to allocate for a payload of `requested_length` bytes.
    ///
    /// `writer_capacity` is the capacity of the buffer the writer produced,
    /// `is_new_record` is false when an existing record outgrew its slot.
    /// The result is never below `requested_length`.
    fn capacity_for(&self, requested_length: usize, writer_capacity: usize, is_new_record: bool) -> usize;

    /// Upper bound of any capacity this strategy returns
    fn max_capacity(&self) -> usize;
}

// =============================================================================
// Writer Decides
// =============================================================================

/// Allocates exactly the capacity of the buffer the writer returned
#[derive(Debug, Clone)]
pub struct WriterDecides {
    default_capacity: usize,
    max_capacity: usize,
}

impl WriterDecides {
    pub fn new(default_capacity: usize, max_capacity: usize) -> Result<Self> {
        check_max_capacity(max_capacity)?;
        if default_capacity == 0 || default_capacity > max_capacity {
            return Err(BlobError::InvalidArgument(format!(
                "default_capacity({}) must be in [1, {}]",
                default_capacity, max_capacity
            )));
        }
        Ok(Self {
            default_capacity,
            max_capacity,
        })
    }
}

impl SpaceAllocationStrategy for WriterDecides {
    fn default_capacity(&self) -> usize {
        self.default_capacity
    }

    fn capacity_for(&self, requested_length: usize, writer_capacity: usize, _is_new_record: bool) -> usize {
        writer_capacity.min(self.max_capacity).max(requested_length)
    }

    fn max_capacity(&self) -> usize {
        self.max_capacity
    }
}

impl fmt::Display for WriterDecides {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "WriterDecides{{default: {}, max: {}}}",
            self.default_capacity, self.max_capacity
        )
    }
}

// =============================================================================
// Length Plus Fixed Percent
// =============================================================================

/// `length + fixed_headroom + length * percent / 100`, clamped to
/// `[min_capacity, max_capacity]`.
///
/// The fixed part gives small records room to grow a little without
/// relocation, while the percentage keeps huge records from being
/// over-allocated by a constant. Records being relocated have already
/// outgrown a slot once and receive twice the percentage.
#[derive(Debug, Clone)]
pub struct LengthPlusFixedPercent {
    default_capacity: usize,
    min_capacity: usize,
    max_capacity: usize,
    fixed_headroom: usize,
    percent: usize,
}

impl LengthPlusFixedPercent {
    pub fn new(
        default_capacity: usize,
        min_capacity: usize,
        max_capacity: usize,
        fixed_headroom: usize,
        percent: usize,
    ) -> Result<Self> {
        check_max_capacity(max_capacity)?;
        if default_capacity == 0 || default_capacity > max_capacity {
            return Err(BlobError::InvalidArgument(format!(
                "default_capacity({}) must be in [1, {}]",
                default_capacity, max_capacity
            )));
        }
        if min_capacity > default_capacity {
            return Err(BlobError::InvalidArgument(format!(
                "min_capacity({}) must be <= default_capacity({})",
                min_capacity, default_capacity
            )));
        }
        Ok(Self {
            default_capacity,
            min_capacity,
            max_capacity,
            fixed_headroom,
            percent,
        })
    }
}

impl SpaceAllocationStrategy for LengthPlusFixedPercent {
    fn default_capacity(&self) -> usize {
        self.default_capacity
    }

    fn capacity_for(&self, requested_length: usize, _writer_capacity: usize, is_new_record: bool) -> usize {
        let percent = if is_new_record { self.percent } else { self.percent * 2 };
        let advised = requested_length
            .saturating_add(self.fixed_headroom)
            .saturating_add(requested_length.saturating_mul(percent) / 100);

        advised
            .clamp(self.min_capacity, self.max_capacity)
            .max(requested_length)
    }

    fn max_capacity(&self) -> usize {
        self.max_capacity
    }
}

impl fmt::Display for LengthPlusFixedPercent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "LengthPlusFixedPercent{{length + {} + {}%, min: {}, max: {}, default: {}}}",
            self.fixed_headroom, self.percent, self.min_capacity, self.max_capacity, self.default_capacity
        )
    }
}

fn check_max_capacity(max_capacity: usize) -> Result<()> {
    if max_capacity == 0 || max_capacity > LARGE_MAX_CAPACITY {
        return Err(BlobError::InvalidArgument(format!(
            "max_capacity({}) must be in [1, {}]",
            max_capacity, LARGE_MAX_CAPACITY
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writer_decides_uses_buffer_capacity() {
        let strategy = WriterDecides::new(256, 4096).unwrap();

        assert_eq!(strategy.capacity_for(10, 100, true), 100);
        assert_eq!(strategy.capacity_for(10, 100_000, true), 4096);
        // Buffer smaller than the data it holds can't happen, but never go below length
        assert_eq!(strategy.capacity_for(50, 10, true), 50);
    }

    #[test]
    fn test_length_plus_percent_gives_small_records_headroom() {
        let strategy = LengthPlusFixedPercent::new(256, 16, 1 << 20, 8, 25).unwrap();

        assert_eq!(strategy.capacity_for(0, 256, true), 16);
        assert_eq!(strategy.capacity_for(40, 256, true), 40 + 8 + 10);
        assert_eq!(strategy.capacity_for(40, 256, false), 40 + 8 + 20);
    }

    #[test]
    fn test_length_plus_percent_clamps_to_max() {
        let strategy = LengthPlusFixedPercent::new(256, 16, 1000, 8, 50).unwrap();

        assert_eq!(strategy.capacity_for(900, 256, true), 1000);
        assert_eq!(strategy.capacity_for(1000, 256, true), 1000);
    }

    #[test]
    fn test_capacity_never_below_length() {
        let strategy = LengthPlusFixedPercent::new(64, 1, 1 << 16, 0, 0).unwrap();
        for length in [0, 1, 7, 100, 65_535] {
            assert!(strategy.capacity_for(length, 0, true) >= length);
        }
    }

    #[test]
    fn test_invalid_configurations_rejected() {
        assert!(WriterDecides::new(0, 100).is_err());
        assert!(WriterDecides::new(200, 100).is_err());
        assert!(WriterDecides::new(10, LARGE_MAX_CAPACITY + 1).is_err());
        assert!(LengthPlusFixedPercent::new(64, 128, 1024, 0, 10).is_err());
    }
}
