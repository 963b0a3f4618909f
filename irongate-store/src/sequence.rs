/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Persistent sequence number store.
//!
//! A fixed-size memory-mapped table of [`SequenceNumberRecord`]s keyed by the
//! session's persistence hash, with open addressing and linear probing.
//!
//! ```text
//! header (64 bytes): [4: magic "IGSQ"][4: version][8: slot count][4: crc32]...
//! slot   (64 bytes): [8: key hash][8: sent][8: received][4: sequence index]
//!                    [4: reserved][8: session ver id][16: reserved][4: crc32][4]
//! ```
//!
//! Every slot carries its own checksum, so a save only ever rewrites and
//! flushes the 64 bytes of its own slot.

use crate::mapped::MappedFile;
use crate::traits::{SequenceNumberRecord, SequenceNumbers};
use irongate_core::error::StoreError;
use irongate_core::types::SessionId;
use std::path::Path;
use tracing::{error, info};

const MAGIC: &[u8; 4] = b"IGSQ";
const VERSION: u32 = 1;
const HEADER_LEN: usize = 64;
const SLOT_LEN: usize = 64;
const HEADER_CRC_OFFSET: usize = 16;

const KEY_OFFSET: usize = 0;
const SENT_OFFSET: usize = 8;
const RECEIVED_OFFSET: usize = 16;
const INDEX_OFFSET: usize = 24;
const VER_ID_OFFSET: usize = 32;
const CRC_OFFSET: usize = 56;

/// Checks that `next` does not move any counter of `stored` backwards.
///
/// A higher sequence index starts a new epoch and is always accepted.
///
/// # Errors
/// Returns `StoreError::SequenceRegression` naming the offending counter.
pub(crate) fn check_progress(
    stored: &SequenceNumberRecord,
    next: &SequenceNumberRecord,
) -> Result<(), StoreError> {
    let regression = |field: &'static str, stored_value: u64, attempted: u64| {
        StoreError::SequenceRegression {
            session: next.session_id.to_string(),
            field,
            stored: stored_value,
            attempted,
            sequence_index: stored.sequence_index,
        }
    };

    if next.sequence_index > stored.sequence_index {
        return Ok(());
    }
    if next.sequence_index < stored.sequence_index {
        return Err(regression(
            "sequence_index",
            u64::from(stored.sequence_index),
            u64::from(next.sequence_index),
        ));
    }
    if next.sent_seq_num < stored.sent_seq_num {
        return Err(regression("sent", stored.sent_seq_num, next.sent_seq_num));
    }
    if next.received_seq_num < stored.received_seq_num {
        return Err(regression(
            "received",
            stored.received_seq_num,
            next.received_seq_num,
        ));
    }
    Ok(())
}

/// Memory-mapped sequence number table.
#[derive(Debug)]
pub struct SequenceNumberStore {
    /// Backing file.
    file: MappedFile,
    /// Number of slots, a power of two.
    slot_count: usize,
    /// Epoch for sessions without a record.
    initial_sequence_index: u32,
}

impl SequenceNumberStore {
    /// Opens or creates the store.
    ///
    /// A new file is sized to `file_size` and initialised; an existing file is
    /// validated slot by slot.
    ///
    /// # Arguments
    /// * `path` - Location of the table
    /// * `file_size` - Size in bytes used when the file is created
    /// * `initial_sequence_index` - Epoch for sessions without a record
    ///
    /// # Errors
    /// Returns `StoreError::InvalidConfiguration` if `file_size` cannot hold a
    /// single slot, `StoreError::Corrupted` if the header or any slot fails
    /// validation, or an I/O error.
    pub fn open(
        path: &Path,
        file_size: u64,
        initial_sequence_index: u32,
    ) -> Result<Self, StoreError> {
        let requested_slots = slot_count_for(file_size as usize);
        if requested_slots == 0 {
            return Err(StoreError::InvalidConfiguration(format!(
                "sequence number file size {file_size} is too small"
            )));
        }

        let mut file = MappedFile::open(path, file_size)?;
        let blank = file.len() >= HEADER_LEN && file.bytes()[..HEADER_LEN].iter().all(|&b| b == 0);
        let slot_count = if file.created() || blank {
            let slots = slot_count_for(file.len());
            if slots == 0 {
                return Err(StoreError::corrupted(path, "file too small for a single slot"));
            }
            write_header(&mut file, slots);
            file.flush()?;
            slots
        } else {
            read_header(&file)?
        };

        let store = Self {
            file,
            slot_count,
            initial_sequence_index,
        };
        let used = store.verify_slots()?;
        info!(
            path = %path.display(),
            slots = slot_count,
            sessions = used,
            "sequence number store opened"
        );
        Ok(store)
    }

    /// Returns the number of slots in the table.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.slot_count
    }

    /// Returns the number of sessions with a record.
    #[must_use]
    pub fn len(&self) -> usize {
        (0..self.slot_count)
            .filter(|&slot| self.file.read_u64(slot_offset(slot) + KEY_OFFSET) != 0)
            .count()
    }

    /// Returns true if no session has a record.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flushes every slot to disk.
    ///
    /// # Errors
    /// Returns `StoreError::Io` if the flush fails.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.file.flush()
    }

    /// Flushes and closes the store.
    ///
    /// # Errors
    /// Returns `StoreError::Io` if the final flush fails.
    pub fn close(self) -> Result<(), StoreError> {
        self.file.close()
    }

    fn verify_slots(&self) -> Result<usize, StoreError> {
        let mut used = 0;
        for slot in 0..self.slot_count {
            let offset = slot_offset(slot);
            if self.file.read_u64(offset + KEY_OFFSET) == 0 {
                continue;
            }
            if !self.slot_checksum_matches(offset) {
                error!(path = %self.file.path().display(), slot, "sequence slot checksum mismatch");
                return Err(StoreError::corrupted(
                    self.file.path(),
                    format!("checksum mismatch in slot {slot}"),
                ));
            }
            used += 1;
        }
        Ok(used)
    }

    fn slot_checksum_matches(&self, offset: usize) -> bool {
        let bytes = self.file.bytes();
        crc32fast::hash(&bytes[offset..offset + CRC_OFFSET])
            == self.file.read_u32(offset + CRC_OFFSET)
    }

    /// Finds the slot holding `key`, or the free slot where it would go.
    fn probe(&self, key: u64) -> Result<(usize, bool), StoreError> {
        let mask = self.slot_count - 1;
        let start = (key as usize) & mask;
        for step in 0..self.slot_count {
            let slot = (start + step) & mask;
            let stored = self.file.read_u64(slot_offset(slot) + KEY_OFFSET);
            if stored == key {
                return Ok((slot, true));
            }
            if stored == 0 {
                return Ok((slot, false));
            }
        }
        Err(StoreError::CapacityExceeded {
            capacity: self.slot_count,
        })
    }

    fn read_slot(&self, slot: usize, session_id: &SessionId) -> Result<SequenceNumberRecord, StoreError> {
        let offset = slot_offset(slot);
        if !self.slot_checksum_matches(offset) {
            return Err(StoreError::corrupted(
                self.file.path(),
                format!("checksum mismatch in slot {slot}"),
            ));
        }
        Ok(SequenceNumberRecord {
            session_id: session_id.clone(),
            sent_seq_num: self.file.read_u64(offset + SENT_OFFSET),
            received_seq_num: self.file.read_u64(offset + RECEIVED_OFFSET),
            sequence_index: self.file.read_u32(offset + INDEX_OFFSET),
            session_ver_id: self.file.read_u64(offset + VER_ID_OFFSET),
        })
    }

    fn write_slot(&mut self, record: &SequenceNumberRecord, durable: bool) -> Result<(), StoreError> {
        let key = record.session_id.persistence_key();
        let (slot, occupied) = self.probe(key)?;
        if occupied {
            let stored = self.read_slot(slot, &record.session_id)?;
            check_progress(&stored, record)?;
        }

        let offset = slot_offset(slot);
        self.file.write_u64(offset + SENT_OFFSET, record.sent_seq_num);
        self.file
            .write_u64(offset + RECEIVED_OFFSET, record.received_seq_num);
        self.file.write_u32(offset + INDEX_OFFSET, record.sequence_index);
        self.file.write_u64(offset + VER_ID_OFFSET, record.session_ver_id);
        self.file.write_u64(offset + KEY_OFFSET, key);
        let crc = crc32fast::hash(&self.file.bytes()[offset..offset + CRC_OFFSET]);
        self.file.write_u32(offset + CRC_OFFSET, crc);

        if durable {
            self.file.flush_range(offset, SLOT_LEN)?;
        }
        Ok(())
    }
}

impl SequenceNumbers for SequenceNumberStore {
    fn load(&self, session_id: &SessionId) -> Result<Option<SequenceNumberRecord>, StoreError> {
        match self.probe(session_id.persistence_key()) {
            Ok((slot, true)) => self.read_slot(slot, session_id).map(Some),
            Ok((_, false)) | Err(StoreError::CapacityExceeded { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn save(&mut self, record: &SequenceNumberRecord) -> Result<(), StoreError> {
        self.write_slot(record, true)
    }

    fn stage(&mut self, record: &SequenceNumberRecord) -> Result<(), StoreError> {
        self.write_slot(record, false)
    }

    fn reset(&mut self, session_id: &SessionId) -> Result<SequenceNumberRecord, StoreError> {
        let record = match self.load(session_id)? {
            Some(stored) => SequenceNumberRecord::new(session_id.clone(), stored.sequence_index + 1)
                .with_session_ver_id(stored.session_ver_id),
            None => SequenceNumberRecord::new(session_id.clone(), self.initial_sequence_index),
        };
        self.write_slot(&record, true)?;
        info!(
            session = %session_id,
            sequence_index = record.sequence_index,
            "sequence numbers reset"
        );
        Ok(record)
    }
}

const fn slot_offset(slot: usize) -> usize {
    HEADER_LEN + slot * SLOT_LEN
}

/// Largest power of two number of slots that fits into `file_size`.
fn slot_count_for(file_size: usize) -> usize {
    let slots = file_size.saturating_sub(HEADER_LEN) / SLOT_LEN;
    if slots == 0 {
        0
    } else {
        1 << (usize::BITS - 1 - slots.leading_zeros())
    }
}

fn write_header(file: &mut MappedFile, slot_count: usize) {
    file.bytes_mut()[0..4].copy_from_slice(MAGIC);
    file.write_u32(4, VERSION);
    file.write_u64(8, slot_count as u64);
    let crc = crc32fast::hash(&file.bytes()[0..HEADER_CRC_OFFSET]);
    file.write_u32(HEADER_CRC_OFFSET, crc);
}

fn read_header(file: &MappedFile) -> Result<usize, StoreError> {
    if file.len() < HEADER_LEN || &file.bytes()[0..4] != MAGIC {
        return Err(StoreError::corrupted(file.path(), "bad sequence store header"));
    }
    if crc32fast::hash(&file.bytes()[0..HEADER_CRC_OFFSET]) != file.read_u32(HEADER_CRC_OFFSET) {
        return Err(StoreError::corrupted(file.path(), "header checksum mismatch"));
    }
    let version = file.read_u32(4);
    if version != VERSION {
        return Err(StoreError::corrupted(
            file.path(),
            format!("unsupported version {version}"),
        ));
    }
    let slot_count = file.read_u64(8) as usize;
    if !slot_count.is_power_of_two() || slot_offset(slot_count) > file.len() {
        return Err(StoreError::corrupted(
            file.path(),
            format!("slot count {slot_count} does not fit the file"),
        ));
    }
    Ok(slot_count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use irongate_core::types::CompId;
    use std::io::{Seek, SeekFrom, Write};
    use tempfile::TempDir;

    const SIZE: u64 = (HEADER_LEN + 16 * SLOT_LEN) as u64;

    fn fix_id(remote: &str) -> SessionId {
        SessionId::fix(CompId::new("GATEWAY").unwrap(), CompId::new(remote).unwrap())
    }

    #[test]
    fn test_slot_count_is_power_of_two() {
        assert_eq!(slot_count_for(HEADER_LEN), 0);
        assert_eq!(slot_count_for(HEADER_LEN + SLOT_LEN), 1);
        assert_eq!(slot_count_for(HEADER_LEN + 5 * SLOT_LEN), 4);
        assert_eq!(slot_count_for(8 * 1024 * 1024), 65536);
    }

    #[test]
    fn test_fresh_store_has_no_records() {
        let temp = TempDir::new().unwrap();
        let store = SequenceNumberStore::open(&temp.path().join("seq"), SIZE, 0).unwrap();
        assert_eq!(store.capacity(), 16);
        assert!(store.is_empty());
        assert_eq!(store.load(&fix_id("CLIENT")).unwrap(), None);
    }

    #[test]
    fn test_save_then_crash_then_load() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("seq");
        let id = fix_id("CLIENT");
        let record = SequenceNumberRecord::new(id.clone(), 0).with_counters(17, 23);

        {
            let mut store = SequenceNumberStore::open(&path, SIZE, 0).unwrap();
            store.save(&record).unwrap();
            // Dropped without close.
        }

        let store = SequenceNumberStore::open(&path, SIZE, 0).unwrap();
        assert_eq!(store.load(&id).unwrap(), Some(record));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_records_are_independent() {
        let temp = TempDir::new().unwrap();
        let mut store = SequenceNumberStore::open(&temp.path().join("seq"), SIZE, 0).unwrap();
        let a = SequenceNumberRecord::new(fix_id("A"), 0).with_counters(1, 2);
        let b = SequenceNumberRecord::new(SessionId::fixp(42), 0)
            .with_counters(5, 6)
            .with_session_ver_id(3);
        store.save(&a).unwrap();
        store.save(&b).unwrap();

        let a2 = a.clone().with_counters(10, 20);
        store.stage(&a2).unwrap();

        assert_eq!(store.load(&fix_id("A")).unwrap(), Some(a2));
        assert_eq!(store.load(&SessionId::fixp(42)).unwrap(), Some(b));
    }

    #[test]
    fn test_regression_rejected_within_epoch() {
        let temp = TempDir::new().unwrap();
        let mut store = SequenceNumberStore::open(&temp.path().join("seq"), SIZE, 0).unwrap();
        let id = fix_id("CLIENT");
        store
            .save(&SequenceNumberRecord::new(id.clone(), 2).with_counters(8, 8))
            .unwrap();

        let err = store
            .save(&SequenceNumberRecord::new(id.clone(), 2).with_counters(8, 7))
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::SequenceRegression {
                field: "received",
                stored: 8,
                attempted: 7,
                ..
            }
        ));

        let older_epoch = SequenceNumberRecord::new(id, 1).with_counters(9, 9);
        assert!(store.save(&older_epoch).is_err());
    }

    #[test]
    fn test_reset_increments_sequence_index() {
        let temp = TempDir::new().unwrap();
        let mut store = SequenceNumberStore::open(&temp.path().join("seq"), SIZE, 5).unwrap();
        let id = SessionId::fixp(9);

        let first = store.reset(&id).unwrap();
        assert_eq!(first.sequence_index, 5);

        store
            .save(&first.clone().with_counters(4, 4).with_session_ver_id(2))
            .unwrap();
        let second = store.reset(&id).unwrap();
        assert_eq!(second.sequence_index, 6);
        assert_eq!(second.sent_seq_num, 0);
        assert_eq!(second.received_seq_num, 0);
        assert_eq!(second.session_ver_id, 2);
    }

    #[test]
    fn test_capacity_exceeded() {
        let temp = TempDir::new().unwrap();
        let size = (HEADER_LEN + 2 * SLOT_LEN) as u64;
        let mut store = SequenceNumberStore::open(&temp.path().join("seq"), size, 0).unwrap();
        store.save(&SequenceNumberRecord::new(fix_id("A"), 0)).unwrap();
        store.save(&SequenceNumberRecord::new(fix_id("B"), 0)).unwrap();

        let err = store
            .save(&SequenceNumberRecord::new(fix_id("C"), 0))
            .unwrap_err();
        assert_eq!(err, StoreError::CapacityExceeded { capacity: 2 });
        assert_eq!(store.load(&fix_id("C")).unwrap(), None);
    }

    #[test]
    fn test_corrupted_slot_detected_on_open() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("seq");
        let id = fix_id("CLIENT");
        {
            let mut store = SequenceNumberStore::open(&path, SIZE, 0).unwrap();
            store
                .save(&SequenceNumberRecord::new(id.clone(), 0).with_counters(3, 3))
                .unwrap();
            store.close().unwrap();
        }

        let key = id.persistence_key();
        let slot = (key as usize) & 15;
        let mut raw = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        raw.seek(SeekFrom::Start((slot_offset(slot) + SENT_OFFSET) as u64))
            .unwrap();
        raw.write_all(&99u64.to_le_bytes()).unwrap();
        raw.sync_all().unwrap();

        let err = SequenceNumberStore::open(&path, SIZE, 0).unwrap_err();
        assert!(matches!(err, StoreError::Corrupted { .. }));
    }

    #[test]
    fn test_bad_header_detected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("seq");
        std::fs::write(&path, vec![7u8; SIZE as usize]).unwrap();
        assert!(matches!(
            SequenceNumberStore::open(&path, SIZE, 0),
            Err(StoreError::Corrupted { .. })
        ));
    }

    #[test]
    fn test_too_small_file_size_rejected() {
        let temp = TempDir::new().unwrap();
        assert!(matches!(
            SequenceNumberStore::open(&temp.path().join("seq"), 10, 0),
            Err(StoreError::InvalidConfiguration(_))
        ));
    }
}
