//! Record Layouts
//!
//! Byte-level accessors for the four record header variants. Every accessor
//! takes a `window` that starts at the first byte of the record header.

use crate::error::{BlobError, Result};

use super::{round_up_to_bucket, RecordId, RecordType, NULL_ID};

// =============================================================================
// Format Constants
// =============================================================================

/// Small actual record: [0|capacity:7][length:8]
pub const SMALL_HEADER_SIZE: usize = 2;
pub const SMALL_MAX_CAPACITY: usize = 0x7F;

/// Large actual record: [0x80][capacity:24][length:24]
pub const LARGE_HEADER_SIZE: usize = 7;
pub const LARGE_MAX_CAPACITY: usize = 0xFF_FFFF;

/// Moved record: [0x81][capacity:24][redirect_to:32]
pub const MOVED_HEADER_SIZE: usize = 8;

/// Padding record: [0x82][capacity:24]
pub const PADDING_HEADER_SIZE: usize = 4;

/// Small records are recognized by a cleared top bit, the rest are full tags
const SMALL_TAG_MASK: u8 = 0x80;
const TAG_LARGE: u8 = 0x80;
const TAG_MOVED: u8 = 0x81;
const TAG_PADDING: u8 = 0x82;

/// Capacity field offset, shared by LARGE, MOVED and PADDING
const WIDE_CAPACITY_OFFSET: usize = 1;
const LARGE_LENGTH_OFFSET: usize = 4;
const MOVED_REDIRECT_OFFSET: usize = 4;
const SMALL_LENGTH_OFFSET: usize = 1;

/// Header encoding of a record slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordLayout {
    Small,
    Large,
    Moved,
    Padding,
}

impl RecordLayout {
    /// Determine the layout from the first byte of `window`
    pub fn read(window: &[u8]) -> Result<Self> {
        let tag = *window
            .first()
            .ok_or_else(|| BlobError::Corrupted("empty record window".to_string()))?;

        match tag {
            t if t & SMALL_TAG_MASK == 0 => Ok(RecordLayout::Small),
            TAG_LARGE => Ok(RecordLayout::Large),
            TAG_MOVED => Ok(RecordLayout::Moved),
            TAG_PADDING => Ok(RecordLayout::Padding),
            other => Err(BlobError::Corrupted(format!(
                "unknown record tag 0x{:02X}",
                other
            ))),
        }
    }

    /// Narrowest actual-record layout able to hold `capacity` once the
    /// record is rounded up to the offset bucket
    pub fn for_capacity(capacity: usize) -> Self {
        let rounded = round_up_to_bucket(SMALL_HEADER_SIZE + capacity) - SMALL_HEADER_SIZE;
        if rounded <= SMALL_MAX_CAPACITY {
            RecordLayout::Small
        } else {
            RecordLayout::Large
        }
    }

    pub fn record_type(self) -> RecordType {
        match self {
            RecordLayout::Small | RecordLayout::Large => RecordType::Actual,
            RecordLayout::Moved => RecordType::Moved,
            RecordLayout::Padding => RecordType::Padding,
        }
    }

    pub fn header_size(self) -> usize {
        match self {
            RecordLayout::Small => SMALL_HEADER_SIZE,
            RecordLayout::Large => LARGE_HEADER_SIZE,
            RecordLayout::Moved => MOVED_HEADER_SIZE,
            RecordLayout::Padding => PADDING_HEADER_SIZE,
        }
    }

    pub fn max_capacity(self) -> usize {
        match self {
            RecordLayout::Small => SMALL_MAX_CAPACITY,
            _ => LARGE_MAX_CAPACITY,
        }
    }

    pub fn full_record_size(self, capacity: usize) -> usize {
        self.header_size() + capacity
    }

    // =========================================================================
    // Readers
    // =========================================================================

    pub fn capacity(self, window: &[u8]) -> Result<usize> {
        self.check_window(window, self.header_size())?;
        Ok(match self {
            RecordLayout::Small => (window[0] & !SMALL_TAG_MASK) as usize,
            _ => read_u24(window, WIDE_CAPACITY_OFFSET),
        })
    }

    /// Payload length of an actual record; moved and padding records report 0
    pub fn length(self, window: &[u8]) -> Result<usize> {
        self.check_window(window, self.header_size())?;
        Ok(match self {
            RecordLayout::Small => window[SMALL_LENGTH_OFFSET] as usize,
            RecordLayout::Large => read_u24(window, LARGE_LENGTH_OFFSET),
            RecordLayout::Moved | RecordLayout::Padding => 0,
        })
    }

    pub fn redirect_to(self, window: &[u8]) -> Result<RecordId> {
        if self != RecordLayout::Moved {
            return Err(BlobError::Corrupted(format!(
                "{:?} record has no redirect_to field",
                self
            )));
        }
        self.check_window(window, MOVED_HEADER_SIZE)?;
        let bytes = &window[MOVED_REDIRECT_OFFSET..MOVED_REDIRECT_OFFSET + 4];
        Ok(RecordId::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    // =========================================================================
    // Writers
    // =========================================================================

    /// Write a complete header (and payload, for actual records).
    ///
    /// Everything is validated before the first byte is written, so a
    /// rejected call leaves `window` untouched.
    pub fn put_record(
        self,
        window: &mut [u8],
        capacity: usize,
        length: usize,
        redirect_to: RecordId,
        payload: &[u8],
    ) -> Result<()> {
        if capacity > self.max_capacity() {
            return Err(BlobError::InvalidArgument(format!(
                "{:?} record capacity({}) must be in [0, {}]",
                self,
                capacity,
                self.max_capacity()
            )));
        }
        self.check_window(window, self.full_record_size(capacity))?;

        match self {
            RecordLayout::Small | RecordLayout::Large => {
                if length > capacity {
                    return Err(BlobError::InvalidArgument(format!(
                        "length({}) > capacity({})",
                        length, capacity
                    )));
                }
                if payload.len() != length {
                    return Err(BlobError::InvalidArgument(format!(
                        "payload.len({}) != length({})",
                        payload.len(),
                        length
                    )));
                }
                if redirect_to != NULL_ID {
                    return Err(BlobError::InvalidArgument(format!(
                        "actual record can't redirect to {}",
                        redirect_to
                    )));
                }
            }
            RecordLayout::Moved | RecordLayout::Padding => {
                if length != 0 || !payload.is_empty() {
                    return Err(BlobError::InvalidArgument(format!(
                        "{:?} record carries no payload (length={})",
                        self, length
                    )));
                }
                if self == RecordLayout::Padding && redirect_to != NULL_ID {
                    return Err(BlobError::InvalidArgument(
                        "padding record can't redirect".to_string(),
                    ));
                }
            }
        }

        match self {
            RecordLayout::Small => {
                window[0] = capacity as u8;
                window[SMALL_LENGTH_OFFSET] = length as u8;
            }
            RecordLayout::Large => {
                window[0] = TAG_LARGE;
                write_u24(window, WIDE_CAPACITY_OFFSET, capacity);
                write_u24(window, LARGE_LENGTH_OFFSET, length);
            }
            RecordLayout::Moved => {
                window[0] = TAG_MOVED;
                write_u24(window, WIDE_CAPACITY_OFFSET, capacity);
                window[MOVED_REDIRECT_OFFSET..MOVED_REDIRECT_OFFSET + 4]
                    .copy_from_slice(&redirect_to.to_le_bytes());
            }
            RecordLayout::Padding => {
                window[0] = TAG_PADDING;
                write_u24(window, WIDE_CAPACITY_OFFSET, capacity);
            }
        }

        let payload_start = self.header_size();
        window[payload_start..payload_start + length].copy_from_slice(payload);
        Ok(())
    }

    /// Rewrite the length of an actual record in place
    pub fn put_length(self, window: &mut [u8], length: usize) -> Result<()> {
        let capacity = self.capacity(window)?;
        if length > capacity {
            return Err(BlobError::InvalidArgument(format!(
                "length({}) > capacity({})",
                length, capacity
            )));
        }
        match self {
            RecordLayout::Small => window[SMALL_LENGTH_OFFSET] = length as u8,
            RecordLayout::Large => write_u24(window, LARGE_LENGTH_OFFSET, length),
            RecordLayout::Moved | RecordLayout::Padding => {
                return Err(BlobError::InvalidArgument(format!(
                    "{:?} record has no length field",
                    self
                )))
            }
        }
        Ok(())
    }

    pub fn put_redirect_to(self, window: &mut [u8], redirect_to: RecordId) -> Result<()> {
        if self != RecordLayout::Moved {
            return Err(BlobError::InvalidArgument(format!(
                "{:?} record has no redirect_to field",
                self
            )));
        }
        self.check_window(window, MOVED_HEADER_SIZE)?;
        window[MOVED_REDIRECT_OFFSET..MOVED_REDIRECT_OFFSET + 4]
            .copy_from_slice(&redirect_to.to_le_bytes());
        Ok(())
    }

    fn check_window(self, window: &[u8], needed: usize) -> Result<()> {
        if window.len() < needed {
            return Err(BlobError::Corrupted(format!(
                "{:?} record needs {} bytes, window has only {}",
                self,
                needed,
                window.len()
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Private Helpers
// =============================================================================

fn read_u24(window: &[u8], at: usize) -> usize {
    window[at] as usize | (window[at + 1] as usize) << 8 | (window[at + 2] as usize) << 16
}

fn write_u24(window: &mut [u8], at: usize, value: usize) {
    debug_assert!(value <= LARGE_MAX_CAPACITY, "u24 overflow: {}", value);
    window[at] = value as u8;
    window[at + 1] = (value >> 8) as u8;
    window[at + 2] = (value >> 16) as u8;
}
