//! Engine Module
//!
//! The blob storage engine: variable-length records with stable ids on top
//! of a [`PageStorage`].
//!
//! ## Responsibilities
//! - Allocate records (padding page tails so no record crosses a page)
//! - Rewrite records in place, or relocate them when they outgrow their slot
//! - Follow redirect chains left by relocation on read and write
//! - Delete records, scan all slots
//! - Keep statistics and the file header, detect unclean shutdown

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::allocation::SpaceAllocationStrategy;
use crate::config::{validate_page_size, Config};
use crate::error::{BlobError, Result};
use crate::header::{
    check_magic, id_to_offset, offset_to_id, FileHeader, FileStatus, FIRST_RECORD_ID, HEADER_SIZE,
    MAGIC, MAX_FILE_LENGTH, RECORDS_START, STORAGE_VERSION,
};
use crate::pages::PageStorage;
use crate::record::{
    round_up_to_bucket, RecordHeader, RecordId, RecordLayout, LARGE_HEADER_SIZE,
    LARGE_MAX_CAPACITY, MOVED_HEADER_SIZE, NULL_ID, OFFSET_BUCKET, PADDING_HEADER_SIZE,
};
use crate::stats::{StatsCounters, StorageStats};

/// Longest redirect chain followed before the storage is considered broken
pub const MAX_REDIRECTS: usize = 1024;

/// One step along a redirect chain. Carries the reader back out of the page
/// closure so it can be used on the next page.
enum Hop<T, F> {
    Found(T),
    Redirect(F, RecordId),
}

/// Current state of the slot a write resolved to
enum WriteSlot {
    Actual {
        layout: RecordLayout,
        capacity: usize,
        length: usize,
        content: BytesMut,
    },
    Moved(RecordId),
}

/// The blob storage engine
///
/// ## Concurrency Model: Single-Writer / Multiple-Reader (SWMR)
///
/// - **Writes** (write/delete/flush/close): Serialized by `write_lock`
///   - Only ONE structural mutation at a time
///   - Page contents are modified under the page write lock
///
/// - **Reads** (read/has_record/for_each): No write_lock needed
///   - Only page read locks, concurrent with each other and with writes to
///     other pages
///   - `next_record_id` is published after the record is written, so a
///     reader never sees a half-allocated slot
///
/// ## Consistency
/// Relocation writes the new record first and rewrites the old header
/// second. A crash in between leaves an unreferenced new record behind.
pub struct BlobStorage<S: PageStorage> {
    /// Backing pages
    storage: S,

    /// Capacity policy for new and relocated records
    strategy: Arc<dyn SpaceAllocationStrategy>,

    /// Record counters, persisted in the header
    stats: StatsCounters,

    /// Id the next allocated record gets: every id below is in use
    next_record_id: AtomicU32,

    data_format_version: AtomicU32,

    was_closed_properly: bool,

    /// Largest payload a single record can hold
    max_payload: usize,

    /// Serializes write operations
    write_lock: Mutex<()>,

    closed: AtomicBool,
}

impl<S: PageStorage> BlobStorage<S> {
    /// Open or create a storage described by `config`
    pub fn open(config: &Config) -> Result<Self> {
        config.validate()?;
        let strategy = config.allocation.build()?;
        let storage = S::open(&config.path, config.page_size)?;
        Self::new(storage, strategy)
    }

    /// Open with a path (convenience method)
    ///
    /// Uses default config with the specified file
    pub fn open_path(path: &Path) -> Result<Self> {
        let config = Config::builder().path(path).build();
        Self::open(&config)
    }

    /// Wrap an already opened page storage
    ///
    /// On startup:
    /// 1. Empty file: write a fresh header
    /// 2. Otherwise validate the header (magic first, then version/status)
    /// 3. Not closed properly last time: recover statistics by a full scan
    /// 4. Mark the file as opened until `close()`
    pub fn new(storage: S, strategy: Arc<dyn SpaceAllocationStrategy>) -> Result<Self> {
        let page_size = storage.page_size();
        validate_page_size(page_size)?;

        let max_payload = LARGE_MAX_CAPACITY
            .min(strategy.max_capacity())
            .min(page_size - LARGE_HEADER_SIZE);

        // Step 1/2/3: Read (or create) the header
        let length = storage.length();
        let (header, next_record_id, was_closed_properly) = if length == 0 {
            storage.extend_length(RECORDS_START);
            (FileHeader::new(), FIRST_RECORD_ID, true)
        } else {
            Self::load_header(&storage, length)?
        };

        let engine = Self {
            storage,
            strategy,
            stats: StatsCounters::from_header(&header),
            next_record_id: AtomicU32::new(next_record_id),
            data_format_version: AtomicU32::new(header.data_format_version),
            was_closed_properly,
            max_payload,
            write_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        };

        // Step 4: Persist the OPENED status right away, a crash must be detectable
        engine.write_header(FileStatus::Opened)?;
        engine.storage.flush()?;

        info!(
            path = %engine.storage.path().display(),
            page_size,
            records = engine.stats.live_records(),
            strategy = ?engine.strategy,
            "blob storage opened"
        );
        Ok(engine)
    }

    fn load_header(storage: &S, length: u64) -> Result<(FileHeader, RecordId, bool)> {
        if length < HEADER_SIZE as u64 {
            // Enough bytes for a magic word: a foreign file is reported as such
            if length >= MAGIC.len() as u64 {
                storage.read_page(0, check_magic)??;
            }
            return Err(BlobError::Format(format!(
                "file length {} is shorter than the header ({} bytes)",
                length, HEADER_SIZE
            )));
        }
        let header = storage.read_page(0, FileHeader::decode)??;

        if length > MAX_FILE_LENGTH {
            return Err(BlobError::Format(format!(
                "file is too big: {} > {}",
                length, MAX_FILE_LENGTH
            )));
        }

        match header.file_status {
            FileStatus::SafelyClosed => {
                let next_record_id = offset_to_id(length).map_err(|_| {
                    BlobError::Format(format!("file length {} is not a record boundary", length))
                })?;
                Ok((header, next_record_id, true))
            }
            FileStatus::Opened => {
                warn!(
                    path = %storage.path().display(),
                    "blob storage was not closed properly, recovering statistics"
                );
                let (header, next_record_id) = Self::recover(storage, header)?;
                Ok((header, next_record_id, false))
            }
        }
    }

    /// Recount statistics from the records themselves.
    ///
    /// The scan ends at the logical length, or earlier at the first slot that
    /// was never written. Such a zero tail is filled with padding so that
    /// every id below `next_record_id` is a decodable slot again.
    fn recover(storage: &S, mut header: FileHeader) -> Result<(FileHeader, RecordId)> {
        header.records_allocated = 0;
        header.records_relocated = 0;
        header.records_deleted = 0;
        header.live_payload_bytes = 0;
        header.live_capacity_bytes = 0;

        let length = storage.length().div_ceil(OFFSET_BUCKET as u64) * OFFSET_BUCKET as u64;
        let mut offset = RECORDS_START;
        while offset < length {
            let at = storage.offset_in_page(offset);
            let record = storage.read_page(storage.page_index(offset), |page| -> Result<Option<RecordHeader>> {
                if RecordHeader::decode(&page[at..])?.is_unwritten() {
                    return Ok(None);
                }
                decode_at(page, at).map(Some)
            })??;

            let Some(record) = record else {
                debug!(offset, length, "zero tail found, padding it");
                fill_with_padding(storage, offset, length)?;
                break;
            };

            match record {
                RecordHeader::Actual {
                    capacity,
                    length: payload_length,
                    ..
                } => {
                    header.records_allocated += 1;
                    header.live_payload_bytes += payload_length as u64;
                    header.live_capacity_bytes += capacity as u64;
                }
                RecordHeader::Moved { redirect_to, .. } => {
                    header.records_allocated += 1;
                    if redirect_to == NULL_ID {
                        header.records_deleted += 1;
                    } else {
                        header.records_relocated += 1;
                    }
                }
                RecordHeader::Padding { .. } => {}
            }
            offset += record.full_record_size() as u64;
        }

        // A record may end past the logical length if the crash hit between
        // writing it and extending the length
        let end = offset.max(length);
        storage.extend_length(end);

        info!(
            records = header.records_allocated,
            relocated = header.records_relocated,
            deleted = header.records_deleted,
            "statistics recovered"
        );
        Ok((header, offset_to_id(end)?))
    }

    // =========================================================================
    // Write Path
    // =========================================================================

    /// Write a record through `writer`
    ///
    /// - `id == NULL_ID`: a new record is allocated, its id returned
    /// - otherwise the record (following redirects) is rewritten
    ///
    /// `writer` gets the current payload in a buffer with at least the record
    /// capacity (`max(size_hint, default capacity)` for new records). It may
    /// grow the buffer freely. Returning `false` skips the write (a skipped
    /// new record returns `NULL_ID`).
    ///
    /// If the new payload doesn't fit, the record is relocated and the new id
    /// returned. The old slot then redirects to the new one, or is deleted
    /// outright if `leave_redirect_on_relocation` is false.
    pub fn write_to_record<F>(
        &self,
        id: RecordId,
        writer: F,
        size_hint: usize,
        leave_redirect_on_relocation: bool,
    ) -> Result<RecordId>
    where
        F: FnOnce(&mut BytesMut) -> Result<bool>,
    {
        let _write_guard = self.write_lock.lock();
        self.check_not_closed()?;

        if id == NULL_ID {
            let mut buffer = BytesMut::with_capacity(size_hint.max(self.strategy.default_capacity()));
            if !writer(&mut buffer)? {
                return Ok(NULL_ID);
            }
            self.check_payload_size(buffer.len())?;
            let capacity = self
                .strategy
                .capacity_for(buffer.len(), buffer.capacity(), true);
            return self.write_new_record(&buffer, capacity);
        }

        self.check_record_id_exists(id)?;
        let mut current = id;
        for _ in 0..MAX_REDIRECTS {
            let offset = id_to_offset(current);
            let at = self.storage.offset_in_page(offset);
            let slot = self
                .storage
                .read_page(self.storage.page_index(offset), |page| -> Result<WriteSlot> {
                    let header = decode_at(page, at)?;
                    match header {
                        RecordHeader::Actual {
                            layout,
                            capacity,
                            length,
                        } => {
                            let mut content = BytesMut::with_capacity(capacity.max(size_hint));
                            content.extend_from_slice(payload_of(page, at, &header));
                            Ok(WriteSlot::Actual {
                                layout,
                                capacity,
                                length,
                                content,
                            })
                        }
                        RecordHeader::Moved { redirect_to, .. } => Ok(WriteSlot::Moved(redirect_to)),
                        RecordHeader::Padding { .. } => Err(BlobError::InvalidRecordId(current)),
                    }
                })??;

            match slot {
                WriteSlot::Moved(redirect_to) if redirect_to == NULL_ID => {
                    return Err(BlobError::RecordDeleted(id));
                }
                WriteSlot::Moved(redirect_to) => {
                    self.check_redirect(current, redirect_to)?;
                    current = redirect_to;
                }
                WriteSlot::Actual {
                    layout,
                    capacity,
                    length,
                    mut content,
                } => {
                    // Page lock is released: the writer may take its time
                    if !writer(&mut content)? {
                        return Ok(current);
                    }
                    return self.store_rewritten(
                        current,
                        layout,
                        capacity,
                        length,
                        &content,
                        leave_redirect_on_relocation,
                    );
                }
            }
        }
        Err(self.chain_too_long(id))
    }

    /// Replace the whole payload of `id` (or create a record for `NULL_ID`),
    /// leaving a redirect if the record moves
    pub fn write(&self, id: RecordId, payload: &[u8]) -> Result<RecordId> {
        self.write_to_record(
            id,
            |buffer| {
                buffer.clear();
                buffer.extend_from_slice(payload);
                Ok(true)
            },
            payload.len(),
            true,
        )
    }

    /// `write_to_record` without a size hint, leaving redirects
    pub fn write_with<F>(&self, id: RecordId, writer: F) -> Result<RecordId>
    where
        F: FnOnce(&mut BytesMut) -> Result<bool>,
    {
        self.write_to_record(id, writer, 0, true)
    }

    /// Store a payload produced by a writer into the slot it was read from,
    /// relocating if it grew past the capacity
    fn store_rewritten(
        &self,
        id: RecordId,
        layout: RecordLayout,
        capacity: usize,
        old_length: usize,
        content: &BytesMut,
        leave_redirect: bool,
    ) -> Result<RecordId> {
        let new_length = content.len();
        self.check_payload_size(new_length)?;

        let offset = id_to_offset(id);
        let page_index = self.storage.page_index(offset);
        let at = self.storage.offset_in_page(offset);

        if new_length <= capacity {
            self.storage.write_page(page_index, |page| {
                layout.put_record(&mut page[at..], capacity, new_length, NULL_ID, content)
            })??;
            self.stats.on_resized(old_length, new_length);
            return Ok(id);
        }

        // Doesn't fit: new record first, then turn the old slot into a redirect
        let new_capacity = self
            .strategy
            .capacity_for(new_length, content.capacity(), false);
        let new_id = self.write_new_record(content, new_capacity)?;

        let redirect_to = if leave_redirect { new_id } else { NULL_ID };
        // Slot keeps its full size, only the header variant changes
        let moved_capacity = layout.full_record_size(capacity) - MOVED_HEADER_SIZE;
        self.storage.write_page(page_index, |page| {
            RecordLayout::Moved.put_record(&mut page[at..], moved_capacity, 0, redirect_to, &[])
        })??;
        self.stats.on_relocated(old_length, capacity, leave_redirect);

        debug!(
            from = id,
            to = new_id,
            length = new_length,
            redirect = leave_redirect,
            "record relocated"
        );
        Ok(new_id)
    }

    /// Allocate a slot and write a complete actual record into it
    fn write_new_record(&self, payload: &[u8], requested_capacity: usize) -> Result<RecordId> {
        let capacity = requested_capacity.min(self.max_payload).max(payload.len());
        let layout = RecordLayout::for_capacity(capacity);
        let full_size = round_up_to_bucket(layout.full_record_size(capacity));
        let capacity = full_size - layout.header_size();

        let (id, offset, next_record_id) = self.allocate_slot(full_size)?;
        let at = self.storage.offset_in_page(offset);
        self.storage.write_page(self.storage.page_index(offset), |page| {
            layout.put_record(&mut page[at..], capacity, payload.len(), NULL_ID, payload)
        })??;
        self.storage.extend_length(offset + full_size as u64);

        // Publish only once the record is fully written
        self.next_record_id.store(next_record_id, Ordering::Release);
        self.stats.on_allocated(payload.len(), capacity);
        Ok(id)
    }

    /// Find room for `full_size` bytes at the end of the records area.
    /// Returns `(id, offset, next_record_id)`.
    fn allocate_slot(&self, full_size: usize) -> Result<(RecordId, u64, RecordId)> {
        let page_size = self.storage.page_size() as u64;
        let mut offset = id_to_offset(self.next_record_id.load(Ordering::Acquire));

        let remaining = page_size - offset % page_size;
        if full_size as u64 > remaining {
            // Records never cross a page: pad the rest and start on the next one
            put_padding(&self.storage, offset, remaining as usize)?;
            debug!(offset, size = remaining, "page tail padded");
            offset += remaining;
            self.next_record_id
                .store(offset_to_id(offset)?, Ordering::Release);
        }

        let id = offset_to_id(offset)?;
        let next_record_id = offset_to_id(offset + full_size as u64)?;
        Ok((id, offset, next_record_id))
    }

    // =========================================================================
    // Read Path
    // =========================================================================

    /// Run `reader` over the payload of `id`, following redirects
    pub fn read_record<T, F>(&self, id: RecordId, reader: F) -> Result<T>
    where
        F: FnOnce(&[u8]) -> T,
    {
        self.read_record_redirected(id, reader).map(|(value, _)| value)
    }

    /// Like [`read_record`](Self::read_record), also returning the id the
    /// payload was actually found under
    pub fn read_record_redirected<T, F>(&self, id: RecordId, reader: F) -> Result<(T, RecordId)>
    where
        F: FnOnce(&[u8]) -> T,
    {
        self.check_not_closed()?;
        self.check_record_id_exists(id)?;

        let mut reader = reader;
        let mut current = id;
        for _ in 0..MAX_REDIRECTS {
            let offset = id_to_offset(current);
            let at = self.storage.offset_in_page(offset);
            let hop = self
                .storage
                .read_page(self.storage.page_index(offset), move |page| -> Result<Hop<T, F>> {
                    let header = decode_at(page, at)?;
                    match header {
                        RecordHeader::Actual { .. } => {
                            Ok(Hop::Found(reader(payload_of(page, at, &header))))
                        }
                        RecordHeader::Moved { redirect_to, .. } => Ok(Hop::Redirect(reader, redirect_to)),
                        RecordHeader::Padding { .. } => Err(BlobError::InvalidRecordId(current)),
                    }
                })??;

            match hop {
                Hop::Found(value) => return Ok((value, current)),
                Hop::Redirect(_, redirect_to) if redirect_to == NULL_ID => {
                    return Err(BlobError::RecordDeleted(id));
                }
                Hop::Redirect(next_reader, redirect_to) => {
                    self.check_redirect(current, redirect_to)?;
                    reader = next_reader;
                    current = redirect_to;
                }
            }
        }
        Err(self.chain_too_long(id))
    }

    /// Copy of the payload of `id`
    pub fn read(&self, id: RecordId) -> Result<Vec<u8>> {
        self.read_record(id, |payload| payload.to_vec())
    }

    /// True if `id` leads to a live record. Unallocated ids are simply absent.
    pub fn has_record(&self, id: RecordId) -> Result<bool> {
        self.check_not_closed()?;
        if id == NULL_ID || id >= self.next_record_id.load(Ordering::Acquire) {
            return Ok(false);
        }
        match self.resolve(id) {
            Ok(actual_id) => Ok(actual_id.is_some()),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Id the record currently lives under, `None` if it was deleted
    pub fn resolve(&self, id: RecordId) -> Result<Option<RecordId>> {
        match self.read_record_redirected(id, |_| ()) {
            Ok(((), actual_id)) => Ok(Some(actual_id)),
            Err(BlobError::RecordDeleted(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    // =========================================================================
    // Delete & Scan
    // =========================================================================

    /// Delete the record stored under exactly `id`.
    ///
    /// Redirects are NOT followed: deleting an old id only removes the
    /// redirect, the record it pointed to stays live. The removed redirect
    /// counts as deleted instead of relocated.
    pub fn delete_record(&self, id: RecordId) -> Result<()> {
        let _write_guard = self.write_lock.lock();
        self.check_not_closed()?;
        self.check_record_id_exists(id)?;

        let offset = id_to_offset(id);
        let at = self.storage.offset_in_page(offset);
        let freed = self
            .storage
            .write_page(self.storage.page_index(offset), |page| -> Result<Option<(usize, usize)>> {
                let header = decode_at(page, at)?;
                let window = &mut page[at..];
                match header {
                    RecordHeader::Actual {
                        layout,
                        capacity,
                        length,
                    } => {
                        let moved_capacity = layout.full_record_size(capacity) - MOVED_HEADER_SIZE;
                        RecordLayout::Moved.put_record(window, moved_capacity, 0, NULL_ID, &[])?;
                        Ok(Some((length, capacity)))
                    }
                    RecordHeader::Moved { redirect_to, .. } if redirect_to == NULL_ID => {
                        Err(BlobError::RecordAlreadyDeleted(id))
                    }
                    RecordHeader::Moved { .. } => {
                        RecordLayout::Moved.put_redirect_to(window, NULL_ID)?;
                        Ok(None)
                    }
                    RecordHeader::Padding { .. } => Err(BlobError::InvalidRecordId(id)),
                }
            })??;

        match freed {
            Some((length, capacity)) => {
                self.stats.on_deleted(length, capacity);
                debug!(id, length, "record deleted");
            }
            None => {
                // MOVED(NULL) on disk: counted as deleted from now on
                self.stats.on_forwarder_deleted();
                debug!(id, "redirect removed");
            }
        }
        Ok(())
    }

    /// Visit every slot in storage order: live, moved/deleted and padding.
    ///
    /// `visitor(id, capacity, length, payload)` gets `length == -1` (and an
    /// empty payload) for non-actual slots, see [`is_record_actual`]. The
    /// scan stops early when the visitor returns `false`.
    ///
    /// Returns the number of slots visited.
    ///
    /// [`is_record_actual`]: Self::is_record_actual
    pub fn for_each<F>(&self, mut visitor: F) -> Result<usize>
    where
        F: FnMut(RecordId, usize, i64, &[u8]) -> bool,
    {
        self.check_not_closed()?;
        let end = self.next_record_id.load(Ordering::Acquire);

        let mut visited = 0;
        let mut id = FIRST_RECORD_ID;
        while id < end {
            let offset = id_to_offset(id);
            let at = self.storage.offset_in_page(offset);
            let (full_size, keep_going) =
                self.storage
                    .read_page(self.storage.page_index(offset), |page| -> Result<(usize, bool)> {
                        let header = decode_at(page, at)?;
                        let keep_going = match header {
                            RecordHeader::Actual { length, .. } => visitor(
                                id,
                                header.capacity(),
                                length as i64,
                                payload_of(page, at, &header),
                            ),
                            _ => visitor(id, header.capacity(), -1, &[]),
                        };
                        Ok((header.full_record_size(), keep_going))
                    })??;

            visited += 1;
            if !keep_going {
                break;
            }
            id = offset_to_id(offset + full_size as u64)?;
        }
        Ok(visited)
    }

    /// Interpret the `length` reported by [`for_each`](Self::for_each)
    pub fn is_record_actual(length: i64) -> bool {
        length >= 0
    }

    // =========================================================================
    // Header & Versioning
    // =========================================================================

    pub fn storage_version(&self) -> Result<u32> {
        self.check_not_closed()?;
        Ok(STORAGE_VERSION)
    }

    /// Version of the data the client keeps in the records, opaque to the storage
    pub fn data_format_version(&self) -> Result<u32> {
        self.check_not_closed()?;
        Ok(self.data_format_version.load(Ordering::Acquire))
    }

    pub fn set_data_format_version(&self, version: u32) -> Result<()> {
        let _write_guard = self.write_lock.lock();
        self.check_not_closed()?;
        self.data_format_version.store(version, Ordering::Release);
        self.write_header(FileStatus::Opened)
    }

    /// False if the previous session crashed (statistics were recovered)
    pub fn was_closed_properly(&self) -> Result<bool> {
        self.check_not_closed()?;
        Ok(self.was_closed_properly)
    }

    fn write_header(&self, status: FileStatus) -> Result<()> {
        let mut header = FileHeader {
            file_status: status,
            data_format_version: self.data_format_version.load(Ordering::Acquire),
            ..FileHeader::new()
        };
        self.stats.store_into(&mut header);
        self.storage.write_page(0, |page| header.encode(page))?
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    pub fn records_allocated(&self) -> Result<u32> {
        self.check_not_closed()?;
        Ok(self.stats.records_allocated())
    }

    pub fn records_relocated(&self) -> Result<u32> {
        self.check_not_closed()?;
        Ok(self.stats.records_relocated())
    }

    pub fn records_deleted(&self) -> Result<u32> {
        self.check_not_closed()?;
        Ok(self.stats.records_deleted())
    }

    pub fn live_records_count(&self) -> Result<u32> {
        self.check_not_closed()?;
        Ok(self.stats.live_records())
    }

    pub fn total_live_payload_bytes(&self) -> Result<u64> {
        self.check_not_closed()?;
        Ok(self.stats.live_payload_bytes())
    }

    pub fn total_live_capacity_bytes(&self) -> Result<u64> {
        self.check_not_closed()?;
        Ok(self.stats.live_capacity_bytes())
    }

    pub fn size_in_bytes(&self) -> Result<u64> {
        self.check_not_closed()?;
        Ok(self.storage.length())
    }

    pub fn stats(&self) -> Result<StorageStats> {
        self.check_not_closed()?;
        Ok(self.stats.snapshot(self.storage.length()))
    }

    /// Largest payload a single record accepts
    pub fn max_payload_supported(&self) -> usize {
        self.max_payload
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Persist statistics and all modified pages. The file stays marked as opened.
    pub fn flush(&self) -> Result<()> {
        let _write_guard = self.write_lock.lock();
        self.check_not_closed()?;
        self.write_header(FileStatus::Opened)?;
        self.storage.flush()
    }

    pub fn is_dirty(&self) -> Result<bool> {
        self.check_not_closed()?;
        Ok(self.storage.is_dirty())
    }

    /// Mark the file as safely closed and release it. Idempotent: later
    /// calls are no-ops, every other method then fails with `Closed`.
    pub fn close(&self) -> Result<()> {
        let _write_guard = self.write_lock.lock();
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let header_written = self.write_header(FileStatus::SafelyClosed);
        // Release the file even if the header couldn't be written
        let storage_closed = self.storage.close();
        header_written.and(storage_closed)?;

        info!(
            path = %self.storage.path().display(),
            records = self.stats.live_records(),
            "blob storage closed"
        );
        Ok(())
    }

    /// Close and delete the backing file
    pub fn close_and_clean(&self) -> Result<()> {
        self.close()?;
        self.storage.remove_file()?;
        info!(path = %self.storage.path().display(), "blob storage removed");
        Ok(())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn path(&self) -> &Path {
        self.storage.path()
    }

    pub fn page_size(&self) -> usize {
        self.storage.page_size()
    }

    pub fn strategy(&self) -> &Arc<dyn SpaceAllocationStrategy> {
        &self.strategy
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn check_not_closed(&self) -> Result<()> {
        if self.is_closed() {
            return Err(BlobError::Closed(format!(
                "blob storage {} is closed",
                self.storage.path().display()
            )));
        }
        Ok(())
    }

    fn check_record_id_exists(&self, id: RecordId) -> Result<()> {
        if id == NULL_ID {
            return Err(BlobError::InvalidRecordId(id));
        }
        if id >= self.next_record_id.load(Ordering::Acquire) {
            return Err(BlobError::RecordNotFound(id));
        }
        Ok(())
    }

    fn check_redirect(&self, from: RecordId, redirect_to: RecordId) -> Result<()> {
        if redirect_to >= self.next_record_id.load(Ordering::Acquire) {
            return Err(BlobError::Corrupted(format!(
                "record {} redirects to unallocated id {}",
                from, redirect_to
            )));
        }
        Ok(())
    }

    fn check_payload_size(&self, length: usize) -> Result<()> {
        if length > self.max_payload {
            return Err(BlobError::PayloadTooLarge {
                length,
                max: self.max_payload,
            });
        }
        Ok(())
    }

    fn chain_too_long(&self, id: RecordId) -> BlobError {
        BlobError::Corrupted(format!(
            "record {} redirect chain is longer than {}: circular reference?",
            id, MAX_REDIRECTS
        ))
    }
}

impl<S: PageStorage> Drop for BlobStorage<S> {
    fn drop(&mut self) {
        if self.is_closed() {
            return;
        }
        warn!(
            path = %self.storage.path().display(),
            "blob storage dropped without close(), closing now"
        );
        if let Err(e) = self.close() {
            warn!("failed to close blob storage on drop: {}", e);
        }
    }
}

impl<S: PageStorage> fmt::Display for BlobStorage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BlobStorage[{}]{{page_size: {}, next_record_id: {}, closed: {}}}",
            self.storage.path().display(),
            self.storage.page_size(),
            self.next_record_id.load(Ordering::Acquire),
            self.is_closed()
        )
    }
}

// =============================================================================
// Slot Helpers
// =============================================================================

/// Decode the record header at `at`, checking it stays inside the page
fn decode_at(page: &[u8], at: usize) -> Result<RecordHeader> {
    let window = &page[at..];
    let header = RecordHeader::decode(window)?;

    if header.is_unwritten() {
        return Err(BlobError::Corrupted(format!(
            "unwritten record slot at page offset {}",
            at
        )));
    }
    let full_size = header.full_record_size();
    if full_size > window.len() || full_size % OFFSET_BUCKET != 0 || header.length() > header.capacity() {
        return Err(BlobError::Corrupted(format!(
            "record {:?} at page offset {} is inconsistent (page size {})",
            header,
            at,
            page.len()
        )));
    }
    Ok(header)
}

fn payload_of<'a>(page: &'a [u8], at: usize, header: &RecordHeader) -> &'a [u8] {
    let start = at + header.layout().header_size();
    &page[start..start + header.length()]
}

/// Write a padding record of `size` bytes at `offset` (same page)
fn put_padding<S: PageStorage>(storage: &S, offset: u64, size: usize) -> Result<()> {
    let at = storage.offset_in_page(offset);
    storage.write_page(storage.page_index(offset), |page| {
        RecordLayout::Padding.put_record(&mut page[at..], size - PADDING_HEADER_SIZE, 0, NULL_ID, &[])
    })??;
    storage.extend_length(offset + size as u64);
    Ok(())
}

/// Cover `[offset, end)` with padding, one record per page
fn fill_with_padding<S: PageStorage>(storage: &S, mut offset: u64, end: u64) -> Result<()> {
    let page_size = storage.page_size() as u64;
    while offset < end {
        let page_end = (offset / page_size + 1) * page_size;
        let size = page_end.min(end) - offset;
        put_padding(storage, offset, size as usize)?;
        offset += size;
    }
    Ok(())
}
