/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Store trait definitions.
//!
//! Sessions talk to persistence only through these traits, so the same state
//! machine runs against the file-backed stores or the in-memory [`MemoryStore`].
//!
//! [`MemoryStore`]: crate::memory::MemoryStore

use bytes::Bytes;
use irongate_core::error::StoreError;
use irongate_core::message::MsgType;
use irongate_core::types::{Direction, SessionId};

/// Persistent sequence number state of one session.
///
/// Counters hold the last sent and last received sequence numbers, 0 meaning
/// nothing yet. `sequence_index` increments on every administrative reset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceNumberRecord {
    /// Session the record belongs to.
    pub session_id: SessionId,
    /// Last sent sequence number.
    pub sent_seq_num: u64,
    /// Last received sequence number.
    pub received_seq_num: u64,
    /// Reset epoch.
    pub sequence_index: u32,
    /// Last negotiated FIXP session version, 0 for FIX sessions.
    pub session_ver_id: u64,
}

impl SequenceNumberRecord {
    /// Creates an empty record in the given epoch.
    ///
    /// # Arguments
    /// * `session_id` - The owning session
    /// * `sequence_index` - The epoch of the record
    #[must_use]
    pub const fn new(session_id: SessionId, sequence_index: u32) -> Self {
        Self {
            session_id,
            sent_seq_num: 0,
            received_seq_num: 0,
            sequence_index,
            session_ver_id: 0,
        }
    }

    /// Sets both counters.
    #[must_use]
    pub const fn with_counters(mut self, sent: u64, received: u64) -> Self {
        self.sent_seq_num = sent;
        self.received_seq_num = received;
        self
    }

    /// Sets the FIXP session version.
    #[must_use]
    pub const fn with_session_ver_id(mut self, session_ver_id: u64) -> Self {
        self.session_ver_id = session_ver_id;
        self
    }
}

/// Keyed storage of [`SequenceNumberRecord`]s.
pub trait SequenceNumbers {
    /// Loads the record of a session.
    ///
    /// # Returns
    /// `None` when the session has never been persisted.
    ///
    /// # Errors
    /// Returns `StoreError` if the backing storage cannot be read.
    fn load(&self, session_id: &SessionId) -> Result<Option<SequenceNumberRecord>, StoreError>;

    /// Durably saves a record.
    ///
    /// The write is complete when this returns; callers use it before
    /// acknowledging a logon or establish.
    ///
    /// # Errors
    /// Returns `StoreError::SequenceRegression` if a counter would decrease
    /// within the same sequence index, or an I/O error.
    fn save(&mut self, record: &SequenceNumberRecord) -> Result<(), StoreError>;

    /// Records progress without forcing it to disk.
    ///
    /// The next [`save`](Self::save), flush or close makes it durable.
    ///
    /// # Errors
    /// Same as [`save`](Self::save).
    fn stage(&mut self, record: &SequenceNumberRecord) -> Result<(), StoreError> {
        self.save(record)
    }

    /// Starts a new epoch for the session: bumps the sequence index and
    /// zeroes both counters. Durable on return.
    ///
    /// # Errors
    /// Returns `StoreError` if the record cannot be written.
    fn reset(&mut self, session_id: &SessionId) -> Result<SequenceNumberRecord, StoreError>;
}

/// Range of archived messages to replay.
#[derive(Debug, Clone, Copy)]
pub struct ReplayQuery<'a> {
    /// Session whose messages are replayed.
    pub session_id: &'a SessionId,
    /// Direction of the archived messages.
    pub direction: Direction,
    /// Epoch of the requested sequence numbers.
    pub sequence_index: u32,
    /// First sequence number (inclusive).
    pub begin: u64,
    /// Last sequence number (inclusive).
    pub end: u64,
}

/// An archived message as read back for replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedMessage {
    /// Original sequence number.
    pub seq_num: u64,
    /// Message type recorded at archive time.
    pub msg_type: MsgType,
    /// Archived bytes.
    pub body: Bytes,
}

/// One step of a replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayEntry {
    /// The message is available.
    Found(ArchivedMessage),
    /// The message was never archived or has been evicted.
    Missing(u64),
}

impl ReplayEntry {
    /// Returns the sequence number this entry stands for.
    #[must_use]
    pub const fn seq_num(&self) -> u64 {
        match self {
            Self::Found(message) => message.seq_num,
            Self::Missing(seq_num) => *seq_num,
        }
    }
}

/// What a replay visitor wants to happen next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayControl {
    /// Deliver the next entry.
    Continue,
    /// Stop; the entry just visited was not consumed.
    Abort,
}

/// Read access to archived messages for resend handling.
pub trait MessageArchive {
    /// Visits every sequence number of the query in ascending order.
    ///
    /// Each call rescans from `query.begin`, so a replay aborted by
    /// backpressure is resumed by calling again from the first unconsumed
    /// sequence number.
    ///
    /// # Errors
    /// Returns `StoreError` if an archived entry cannot be read back.
    fn replay(
        &self,
        query: &ReplayQuery<'_>,
        visitor: &mut dyn FnMut(ReplayEntry) -> ReplayControl,
    ) -> Result<(), StoreError>;

    /// Returns the highest sequence number of the epoch that is durably
    /// archived and indexed, 0 when none.
    fn archived_through(
        &self,
        session_id: &SessionId,
        direction: Direction,
        sequence_index: u32,
    ) -> u64;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct MapStore {
        records: HashMap<SessionId, SequenceNumberRecord>,
    }

    impl SequenceNumbers for MapStore {
        fn load(&self, session_id: &SessionId) -> Result<Option<SequenceNumberRecord>, StoreError> {
            Ok(self.records.get(session_id).cloned())
        }

        fn save(&mut self, record: &SequenceNumberRecord) -> Result<(), StoreError> {
            self.records
                .insert(record.session_id.clone(), record.clone());
            Ok(())
        }

        fn reset(&mut self, session_id: &SessionId) -> Result<SequenceNumberRecord, StoreError> {
            let index = self
                .records
                .get(session_id)
                .map_or(0, |r| r.sequence_index + 1);
            let record = SequenceNumberRecord::new(session_id.clone(), index);
            self.save(&record)?;
            Ok(record)
        }
    }

    #[test]
    fn test_stage_defaults_to_save() {
        let mut store = MapStore::default();
        let id = SessionId::fixp(7);
        let record = SequenceNumberRecord::new(id.clone(), 0).with_counters(3, 4);
        store.stage(&record).unwrap();
        assert_eq!(store.load(&id).unwrap(), Some(record));
    }

    #[test]
    fn test_replay_entry_seq_num() {
        assert_eq!(ReplayEntry::Missing(9).seq_num(), 9);
        let found = ReplayEntry::Found(ArchivedMessage {
            seq_num: 4,
            msg_type: MsgType::Heartbeat,
            body: Bytes::new(),
        });
        assert_eq!(found.seq_num(), 4);
    }
}
