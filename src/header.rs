//! File Header
//!
//! Fixed-size header at the start of page 0, followed by the records area.
//!
//! ## Layout
//! ```text
//! ┌────────────┬─────────────────┬─────────────┬───────────────────────────┐
//! │ Magic (4)  │ StorageVer u32  │ Status u32  │ Allocated/Relocated/      │
//! │  "BLOB"    │                 │             │ Deleted u32 ×3            │
//! ├────────────┴─────────────────┴─────────────┴───────────────────────────┤
//! │ LivePayload u64 │ LiveCapacity u64 │ DataFormatVer u32 │ (pad to 48)    │
//! └─────────────────┴──────────────────┴───────────────────┴────────────────┘
//! ```
//!
//! Record ids map to offsets in the records area:
//! `offset = RECORDS_START + (id - 1) * OFFSET_BUCKET`.

use bytes::{Buf, BufMut};

use crate::error::{BlobError, Result};
use crate::record::{RecordId, NULL_ID, OFFSET_BUCKET};

// =============================================================================
// Header Constants
// =============================================================================

/// Magic bytes identifying a blobstore file
pub const MAGIC: &[u8; 4] = b"BLOB";

/// Current on-disk format version
pub const STORAGE_VERSION: u32 = 1;

/// Header size: Magic (4) + 6 × u32 + 2 × u64 = 44 bytes
pub const HEADER_SIZE: usize = 44;

/// First record offset: header rounded up to the offset bucket
pub const RECORDS_START: u64 = 48;

/// Largest file length whose every record is still addressable by an id
pub const MAX_FILE_LENGTH: u64 = RECORDS_START + (u32::MAX as u64) * OFFSET_BUCKET as u64;

/// Whether the file was closed properly the last time it was used
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    /// Storage is open, or crashed before close
    Opened,
    SafelyClosed,
}

impl FileStatus {
    const OPENED: u32 = 0;
    const SAFELY_CLOSED: u32 = 1;

    fn from_u32(value: u32) -> Result<Self> {
        match value {
            Self::OPENED => Ok(FileStatus::Opened),
            Self::SAFELY_CLOSED => Ok(FileStatus::SafelyClosed),
            other => Err(BlobError::Format(format!("unknown file status {}", other))),
        }
    }

    fn as_u32(self) -> u32 {
        match self {
            FileStatus::Opened => Self::OPENED,
            FileStatus::SafelyClosed => Self::SAFELY_CLOSED,
        }
    }
}

// =============================================================================
// File Header
// =============================================================================

/// Decoded file header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub storage_version: u32,
    pub file_status: FileStatus,
    pub records_allocated: u32,
    pub records_relocated: u32,
    pub records_deleted: u32,
    pub live_payload_bytes: u64,
    pub live_capacity_bytes: u64,
    pub data_format_version: u32,
}

impl FileHeader {
    /// Header of a brand new, empty storage
    pub fn new() -> Self {
        Self {
            storage_version: STORAGE_VERSION,
            file_status: FileStatus::Opened,
            records_allocated: 0,
            records_relocated: 0,
            records_deleted: 0,
            live_payload_bytes: 0,
            live_capacity_bytes: 0,
            data_format_version: 0,
        }
    }

    /// Decode and validate the header at the start of `page`.
    ///
    /// The magic word is checked first: a foreign file never gets any
    /// further than that.
    pub fn decode(page: &[u8]) -> Result<Self> {
        if page.len() < HEADER_SIZE {
            return Err(BlobError::Format(format!(
                "header needs {} bytes, page has only {}",
                HEADER_SIZE,
                page.len()
            )));
        }
        check_magic(page)?;
        let mut buf = &page[MAGIC.len()..HEADER_SIZE];

        let storage_version = buf.get_u32_le();
        if storage_version != STORAGE_VERSION {
            return Err(BlobError::Format(format!(
                "unsupported storage version {} (expected {})",
                storage_version, STORAGE_VERSION
            )));
        }

        Ok(Self {
            storage_version,
            file_status: FileStatus::from_u32(buf.get_u32_le())?,
            records_allocated: buf.get_u32_le(),
            records_relocated: buf.get_u32_le(),
            records_deleted: buf.get_u32_le(),
            live_payload_bytes: buf.get_u64_le(),
            live_capacity_bytes: buf.get_u64_le(),
            data_format_version: buf.get_u32_le(),
        })
    }

    /// Encode into the first `HEADER_SIZE` bytes of `page`
    pub fn encode(&self, page: &mut [u8]) -> Result<()> {
        if page.len() < HEADER_SIZE {
            return Err(BlobError::InvalidArgument(format!(
                "header needs {} bytes, page has only {}",
                HEADER_SIZE,
                page.len()
            )));
        }
        let mut buf = &mut page[..HEADER_SIZE];
        buf.put_slice(MAGIC);
        buf.put_u32_le(self.storage_version);
        buf.put_u32_le(self.file_status.as_u32());
        buf.put_u32_le(self.records_allocated);
        buf.put_u32_le(self.records_relocated);
        buf.put_u32_le(self.records_deleted);
        buf.put_u64_le(self.live_payload_bytes);
        buf.put_u64_le(self.live_capacity_bytes);
        buf.put_u32_le(self.data_format_version);
        Ok(())
    }
}

/// Fail with a format error unless `bytes` starts with [`MAGIC`]
pub fn check_magic(bytes: &[u8]) -> Result<()> {
    let found = &bytes[..MAGIC.len().min(bytes.len())];
    if found != MAGIC {
        return Err(BlobError::Format(format!(
            "bad magic: expected {:?}, found {:?}",
            MAGIC, found
        )));
    }
    Ok(())
}

impl Default for FileHeader {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Id <-> Offset Mapping
// =============================================================================

/// Id of the record at `RECORDS_START`
pub const FIRST_RECORD_ID: RecordId = 1;

pub fn id_to_offset(id: RecordId) -> u64 {
    debug_assert!(id != NULL_ID, "NULL_ID has no offset");
    RECORDS_START + (id as u64 - 1) * OFFSET_BUCKET as u64
}

pub fn offset_to_id(offset: u64) -> Result<RecordId> {
    if offset < RECORDS_START || (offset - RECORDS_START) % OFFSET_BUCKET as u64 != 0 {
        return Err(BlobError::Corrupted(format!(
            "offset {} is not a record boundary",
            offset
        )));
    }
    let id = (offset - RECORDS_START) / OFFSET_BUCKET as u64 + 1;
    RecordId::try_from(id).map_err(|_| BlobError::StorageFull(offset))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::round_up_to_bucket;

    #[test]
    fn test_records_start_is_bucket_aligned() {
        assert_eq!(RECORDS_START as usize, round_up_to_bucket(HEADER_SIZE));
    }

    #[test]
    fn test_id_offset_mapping() {
        assert_eq!(id_to_offset(FIRST_RECORD_ID), RECORDS_START);
        assert_eq!(id_to_offset(2), RECORDS_START + 8);
        for id in [1, 2, 17, 1 << 20, u32::MAX] {
            assert_eq!(offset_to_id(id_to_offset(id)).unwrap(), id);
        }
        assert!(offset_to_id(RECORDS_START + 3).is_err());
        assert!(offset_to_id(0).is_err());
        assert!(matches!(
            offset_to_id(MAX_FILE_LENGTH),
            Err(BlobError::StorageFull(_))
        ));
    }

    #[test]
    fn test_header_encode_decode() {
        let header = FileHeader {
            storage_version: STORAGE_VERSION,
            file_status: FileStatus::SafelyClosed,
            records_allocated: 10,
            records_relocated: 3,
            records_deleted: 2,
            live_payload_bytes: 1 << 33,
            live_capacity_bytes: (1 << 33) + 5,
            data_format_version: 42,
        };
        let mut page = vec![0u8; 256];
        header.encode(&mut page).unwrap();

        assert_eq!(&page[..4], MAGIC);
        assert_eq!(FileHeader::decode(&page).unwrap(), header);
    }

    #[test]
    fn test_header_rejects_foreign_magic() {
        let mut page = vec![0u8; 256];
        FileHeader::new().encode(&mut page).unwrap();
        page[..4].copy_from_slice(b"ATKV");

        let err = FileHeader::decode(&page).unwrap_err();
        assert!(matches!(err, BlobError::Format(_)));
        assert!(err.to_string().contains("magic"));
    }

    #[test]
    fn test_check_magic_on_short_input() {
        assert!(check_magic(b"BLOB").is_ok());
        assert!(check_magic(b"BL").is_err());
        let err = check_magic(b"PK\x03\x04").unwrap_err();
        assert!(err.to_string().contains("magic"));
    }

    #[test]
    fn test_header_rejects_unknown_status() {
        let mut page = vec![0u8; 256];
        FileHeader::new().encode(&mut page).unwrap();
        page[8] = 7;

        assert!(matches!(FileHeader::decode(&page), Err(BlobError::Format(_))));
    }
}
