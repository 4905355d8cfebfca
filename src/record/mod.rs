//! Record Module
//!
//! Binary codec for record headers stored inside pages.
//!
//! ## Responsibilities
//! - Identify a record variant from its first byte alone
//! - Encode/decode capacity, length and redirect fields per variant
//! - Pick the narrowest header able to hold a given capacity
//!
//! ## Record Formats
//! ```text
//! SMALL actual  ┌──────────────────┬──────────┬───────────────┐
//!  (2 bytes)    │0|capacity (7 bit)│length u8 │ payload ...   │
//!               └──────────────────┴──────────┴───────────────┘
//! LARGE actual  ┌──────┬──────────────┬────────────┬─────────────┐
//!  (7 bytes)    │ 0x80 │ capacity u24 │ length u24 │ payload ... │
//!               └──────┴──────────────┴────────────┴─────────────┘
//! MOVED         ┌──────┬──────────────┬─────────────────┐
//!  (8 bytes)    │ 0x81 │ capacity u24 │ redirect_to u32 │
//!               └──────┴──────────────┴─────────────────┘
//! PADDING       ┌──────┬──────────────┐
//!  (4 bytes)    │ 0x82 │ capacity u24 │
//!               └──────┴──────────────┘
//! ```
//!
//! All multi-byte fields are little-endian. A MOVED record with
//! `redirect_to == NULL_ID` is a deleted record.

mod layout;

pub use layout::{
    RecordLayout, LARGE_HEADER_SIZE, LARGE_MAX_CAPACITY, MOVED_HEADER_SIZE, PADDING_HEADER_SIZE,
    SMALL_HEADER_SIZE, SMALL_MAX_CAPACITY,
};

use crate::error::Result;

/// Record identifier. Derived from the record offset, see [`OFFSET_BUCKET`].
pub type RecordId = u32;

/// Reserved id, never denotes a real record
pub const NULL_ID: RecordId = 0;

/// Records start (and end) at offsets that are multiples of this value
pub const OFFSET_BUCKET: usize = 8;

/// Kind of a record slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    /// Holds live payload
    Actual,
    /// Forwarding pointer (or deleted record, if it points nowhere)
    Moved,
    /// Filler up to the end of a page
    Padding,
}

/// Fully decoded record header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordHeader {
    Actual {
        layout: RecordLayout,
        capacity: usize,
        length: usize,
    },
    Moved {
        capacity: usize,
        redirect_to: RecordId,
    },
    Padding {
        capacity: usize,
    },
}

impl RecordHeader {
    /// Decode the header at the start of `window`
    pub fn decode(window: &[u8]) -> Result<Self> {
        let layout = RecordLayout::read(window)?;
        let capacity = layout.capacity(window)?;
        Ok(match layout {
            RecordLayout::Small | RecordLayout::Large => RecordHeader::Actual {
                layout,
                capacity,
                length: layout.length(window)?,
            },
            RecordLayout::Moved => RecordHeader::Moved {
                capacity,
                redirect_to: layout.redirect_to(window)?,
            },
            RecordLayout::Padding => RecordHeader::Padding { capacity },
        })
    }

    pub fn layout(&self) -> RecordLayout {
        match self {
            RecordHeader::Actual { layout, .. } => *layout,
            RecordHeader::Moved { .. } => RecordLayout::Moved,
            RecordHeader::Padding { .. } => RecordLayout::Padding,
        }
    }

    pub fn record_type(&self) -> RecordType {
        self.layout().record_type()
    }

    pub fn capacity(&self) -> usize {
        match self {
            RecordHeader::Actual { capacity, .. }
            | RecordHeader::Moved { capacity, .. }
            | RecordHeader::Padding { capacity } => *capacity,
        }
    }

    /// Payload length; 0 for non-actual records
    pub fn length(&self) -> usize {
        match self {
            RecordHeader::Actual { length, .. } => *length,
            _ => 0,
        }
    }

    /// Header + capacity: the number of bytes this slot occupies
    pub fn full_record_size(&self) -> usize {
        self.layout().full_record_size(self.capacity())
    }

    /// All-zero bytes decode as a SMALL record of capacity 0. Real records
    /// are bucket-rounded and never have it, so this marks a slot nothing
    /// was ever written to (e.g. the zero tail left by a crash).
    pub fn is_unwritten(&self) -> bool {
        matches!(
            self,
            RecordHeader::Actual {
                layout: RecordLayout::Small,
                capacity: 0,
                ..
            }
        )
    }
}

/// Round `size` up to the next multiple of [`OFFSET_BUCKET`]
pub fn round_up_to_bucket(size: usize) -> usize {
    size.div_ceil(OFFSET_BUCKET) * OFFSET_BUCKET
}
