/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Replay index.
//!
//! A bounded ring of fixed-size records mapping `(sequence index, sequence
//! number)` to a position in the archive stream. One ring file exists per
//! session and direction. When the ring is full the oldest records are
//! overwritten, so lookups of evicted sequence numbers report them missing.
//!
//! ```text
//! header (64 bytes): [4: magic "IGRI"][4: version][8: capacity][8: session key]
//!                    [8: write cursor][4: crc32 of magic..session key]...
//! record (32 bytes): [8: stream position][8: sequence number]
//!                    [4: sequence index][4: length][4: crc32][4: reserved]
//! ```

use crate::mapped::MappedFile;
use irongate_core::error::StoreError;
use std::path::Path;
use tracing::debug;

const MAGIC: &[u8; 4] = b"IGRI";
const VERSION: u32 = 1;
const HEADER_LEN: usize = 64;
const RECORD_LEN: usize = 32;
const CAPACITY_OFFSET: usize = 8;
const SESSION_KEY_OFFSET: usize = 16;
const CURSOR_OFFSET: usize = 24;
const HEADER_CRC_OFFSET: usize = 32;

const POSITION_OFFSET: usize = 0;
const SEQ_OFFSET: usize = 8;
const INDEX_OFFSET: usize = 16;
const LENGTH_OFFSET: usize = 20;
const RECORD_CRC_OFFSET: usize = 24;

/// Location of one archived message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexRecord {
    /// Reset epoch of the sequence number.
    pub sequence_index: u32,
    /// Sequence number of the message.
    pub sequence_number: u64,
    /// Position of the message in the archive stream.
    pub stream_position: u64,
    /// Length of the archived entry in bytes.
    pub length: u32,
}

/// Result of looking up one sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayLookup {
    /// The message is indexed.
    Found(IndexRecord),
    /// Never indexed, or evicted from the ring.
    Missing(u64),
}

/// Ring-buffer replay index backed by a mapped file.
#[derive(Debug)]
pub struct ReplayIndex {
    file: MappedFile,
    capacity: u64,
    session_key: u64,
    cursor: u64,
    last: Option<(u32, u64)>,
}

impl ReplayIndex {
    /// Opens or creates the index of one session and direction.
    ///
    /// # Arguments
    /// * `path` - Location of the ring file
    /// * `capacity` - Number of records, must be a power of two
    /// * `session_key` - Persistence key of the owning session
    ///
    /// # Errors
    /// Returns `StoreError::InvalidConfiguration` for a capacity that is not a
    /// power of two, `StoreError::Corrupted` if an existing file does not
    /// belong to this session or fails validation, or an I/O error.
    pub fn open(path: &Path, capacity: usize, session_key: u64) -> Result<Self, StoreError> {
        if !capacity.is_power_of_two() {
            return Err(StoreError::InvalidConfiguration(format!(
                "replay index capacity {capacity} is not a power of two"
            )));
        }

        let len = (HEADER_LEN + capacity * RECORD_LEN) as u64;
        let mut file = MappedFile::open(path, len)?;
        let blank = file.len() >= HEADER_LEN && file.bytes()[..HEADER_LEN].iter().all(|&b| b == 0);

        let (capacity, cursor) = if file.created() || blank {
            if file.len() < HEADER_LEN + RECORD_LEN {
                return Err(StoreError::corrupted(path, "file too small for a record"));
            }
            let capacity = capacity.min((file.len() - HEADER_LEN) / RECORD_LEN) as u64;
            write_header(&mut file, capacity, session_key);
            file.flush()?;
            (capacity, 0)
        } else {
            read_header(&file, session_key)?
        };

        let mut index = Self {
            file,
            capacity,
            session_key,
            cursor,
            last: None,
        };
        if cursor > 0 {
            index.last = index
                .read_record(cursor - 1)
                .map(|r| (r.sequence_index, r.sequence_number));
        }
        debug!(
            path = %path.display(),
            capacity,
            cursor,
            "replay index opened"
        );
        Ok(index)
    }

    /// Returns the ring capacity in records.
    #[must_use]
    pub const fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Returns the persistence key of the owning session.
    #[must_use]
    pub const fn session_key(&self) -> u64 {
        self.session_key
    }

    /// Returns the number of records ever appended.
    #[must_use]
    pub const fn appended(&self) -> u64 {
        self.cursor
    }

    /// Appends a record.
    ///
    /// # Errors
    /// Returns `StoreError::OutOfOrder` unless the record is strictly after
    /// the last one of its epoch and not from an older epoch.
    pub fn append(&mut self, record: IndexRecord) -> Result<(), StoreError> {
        if let Some((last_index, last_seq)) = self.last
            && (record.sequence_index < last_index
                || (record.sequence_index == last_index && record.sequence_number <= last_seq))
        {
            return Err(StoreError::OutOfOrder {
                sequence_index: record.sequence_index,
                last: last_seq,
                attempted: record.sequence_number,
            });
        }

        let offset = self.record_offset(self.cursor);
        self.file.write_u64(offset + POSITION_OFFSET, record.stream_position);
        self.file.write_u64(offset + SEQ_OFFSET, record.sequence_number);
        self.file.write_u32(offset + INDEX_OFFSET, record.sequence_index);
        self.file.write_u32(offset + LENGTH_OFFSET, record.length);
        let crc = crc32fast::hash(&self.file.bytes()[offset..offset + RECORD_CRC_OFFSET]);
        self.file.write_u32(offset + RECORD_CRC_OFFSET, crc);

        self.cursor += 1;
        self.file.write_u64(CURSOR_OFFSET, self.cursor);
        self.last = Some((record.sequence_index, record.sequence_number));
        Ok(())
    }

    /// Flushes appended records to disk.
    ///
    /// # Errors
    /// Returns `StoreError::Io` if the flush fails.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.file.flush()
    }

    /// Flushes and closes the index.
    ///
    /// # Errors
    /// Returns `StoreError::Io` if the final flush fails.
    pub fn close(self) -> Result<(), StoreError> {
        self.file.close()
    }

    /// Returns the highest indexed sequence number of an epoch, 0 when none.
    ///
    /// Epochs older than the latest appended one are complete, so they
    /// report `u64::MAX`.
    #[must_use]
    pub fn archived_through(&self, sequence_index: u32) -> u64 {
        match self.last {
            Some((index, seq)) if index == sequence_index => seq,
            Some((index, _)) if index > sequence_index => u64::MAX,
            _ => 0,
        }
    }

    /// Looks up every sequence number in `[begin, end]` of an epoch.
    ///
    /// The iterator is lazy and finite, and yields exactly one
    /// [`ReplayLookup`] per sequence number in ascending order. Calling again
    /// restarts the scan.
    #[must_use]
    pub fn lookup_range(&self, sequence_index: u32, begin: u64, end: u64) -> ReplayIter<'_> {
        let next_seq = begin.max(1);
        ReplayIter {
            index: self,
            sequence_index,
            position: self.seek(sequence_index, next_seq),
            stop: self.cursor,
            next_seq,
            end,
            pending: None,
        }
    }

    /// Returns the first live position whose record is at or after
    /// `(sequence_index, seq)`.
    ///
    /// Records increase strictly across the ring. An unreadable record is
    /// never skipped over, so the result can only be early.
    fn seek(&self, sequence_index: u32, seq: u64) -> u64 {
        let mut low = self.cursor.saturating_sub(self.capacity);
        let mut high = self.cursor;
        while low < high {
            let mid = low + (high - low) / 2;
            match self.read_record(mid) {
                Some(record)
                    if (record.sequence_index, record.sequence_number) < (sequence_index, seq) =>
                {
                    low = mid + 1;
                }
                _ => high = mid,
            }
        }
        low
    }

    fn record_offset(&self, position: u64) -> usize {
        HEADER_LEN + ((position & (self.capacity - 1)) as usize) * RECORD_LEN
    }

    fn read_record(&self, position: u64) -> Option<IndexRecord> {
        let offset = self.record_offset(position);
        let bytes = self.file.bytes();
        let crc = crc32fast::hash(&bytes[offset..offset + RECORD_CRC_OFFSET]);
        if crc != self.file.read_u32(offset + RECORD_CRC_OFFSET) {
            return None;
        }
        Some(IndexRecord {
            sequence_index: self.file.read_u32(offset + INDEX_OFFSET),
            sequence_number: self.file.read_u64(offset + SEQ_OFFSET),
            stream_position: self.file.read_u64(offset + POSITION_OFFSET),
            length: self.file.read_u32(offset + LENGTH_OFFSET),
        })
    }
}

/// Iterator returned by [`ReplayIndex::lookup_range`].
#[derive(Debug)]
pub struct ReplayIter<'a> {
    index: &'a ReplayIndex,
    sequence_index: u32,
    position: u64,
    stop: u64,
    next_seq: u64,
    end: u64,
    pending: Option<IndexRecord>,
}

impl ReplayIter<'_> {
    fn scan_to_candidate(&mut self) {
        while self.pending.is_none() && self.position < self.stop {
            let position = self.position;
            self.position += 1;
            let Some(record) = self.index.read_record(position) else {
                continue;
            };
            if record.sequence_index > self.sequence_index {
                self.position = self.stop;
            } else if record.sequence_index == self.sequence_index
                && record.sequence_number >= self.next_seq
            {
                self.pending = Some(record);
            }
        }
    }
}

impl Iterator for ReplayIter<'_> {
    type Item = ReplayLookup;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_seq > self.end {
            return None;
        }
        self.scan_to_candidate();

        let seq = self.next_seq;
        self.next_seq += 1;
        match self.pending {
            Some(record) if record.sequence_number == seq => {
                self.pending = None;
                Some(ReplayLookup::Found(record))
            }
            _ => Some(ReplayLookup::Missing(seq)),
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.end + 1).saturating_sub(self.next_seq) as usize;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for ReplayIter<'_> {}

fn write_header(file: &mut MappedFile, capacity: u64, session_key: u64) {
    file.bytes_mut()[0..4].copy_from_slice(MAGIC);
    file.write_u32(4, VERSION);
    file.write_u64(CAPACITY_OFFSET, capacity);
    file.write_u64(SESSION_KEY_OFFSET, session_key);
    file.write_u64(CURSOR_OFFSET, 0);
    let crc = crc32fast::hash(&file.bytes()[0..CURSOR_OFFSET]);
    file.write_u32(HEADER_CRC_OFFSET, crc);
}

fn read_header(file: &MappedFile, session_key: u64) -> Result<(u64, u64), StoreError> {
    if file.len() < HEADER_LEN || &file.bytes()[0..4] != MAGIC {
        return Err(StoreError::corrupted(file.path(), "bad replay index header"));
    }
    if crc32fast::hash(&file.bytes()[0..CURSOR_OFFSET]) != file.read_u32(HEADER_CRC_OFFSET) {
        return Err(StoreError::corrupted(file.path(), "header checksum mismatch"));
    }
    if file.read_u32(4) != VERSION {
        return Err(StoreError::corrupted(file.path(), "unsupported version"));
    }
    let capacity = file.read_u64(CAPACITY_OFFSET);
    if !capacity.is_power_of_two() || HEADER_LEN + (capacity as usize) * RECORD_LEN > file.len() {
        return Err(StoreError::corrupted(
            file.path(),
            format!("capacity {capacity} does not fit the file"),
        ));
    }
    let stored_key = file.read_u64(SESSION_KEY_OFFSET);
    if stored_key != session_key {
        return Err(StoreError::corrupted(
            file.path(),
            format!("index belongs to session key {stored_key:016x}"),
        ));
    }
    Ok((capacity, file.read_u64(CURSOR_OFFSET)))
}
