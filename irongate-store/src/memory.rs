/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! In-memory store implementation.
//!
//! Implements both [`SequenceNumbers`] and [`MessageArchive`] without touching
//! the file system. Suitable for tests and for transient sessions that do not
//! need to survive a restart.

use crate::sequence::check_progress;
use crate::traits::{
    ArchivedMessage, MessageArchive, ReplayControl, ReplayEntry, ReplayQuery, SequenceNumberRecord,
    SequenceNumbers,
};
use irongate_core::error::StoreError;
use irongate_core::types::{Direction, INITIAL_SEQUENCE_INDEX, SessionId};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

/// Key of an archived message: session, direction, epoch, sequence number.
type MessageKey = (u64, Direction, u32, u64);

/// Key of an archived stream: session, direction, epoch.
type StreamKey = (u64, Direction, u32);

#[derive(Debug, Default)]
struct Archived {
    messages: BTreeMap<MessageKey, ArchivedMessage>,
    /// Highest sequence number ever archived per stream; survives eviction.
    tips: HashMap<StreamKey, u64>,
}

/// In-memory store.
///
/// Messages live in a `BTreeMap` for efficient range scans. Not persistent:
/// all data is lost when the process exits.
#[derive(Debug)]
pub struct MemoryStore {
    /// Archived messages.
    archived: RwLock<Archived>,
    /// Sequence number records by session.
    records: HashMap<SessionId, SequenceNumberRecord>,
    /// Epoch assigned to sessions seen for the first time.
    initial_sequence_index: u32,
}

impl MemoryStore {
    /// Creates a new empty memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::with_initial_sequence_index(INITIAL_SEQUENCE_INDEX)
    }

    /// Creates a store whose new sessions start at the given epoch.
    ///
    /// # Arguments
    /// * `initial_sequence_index` - Epoch for sessions without a record
    #[must_use]
    pub fn with_initial_sequence_index(initial_sequence_index: u32) -> Self {
        Self {
            archived: RwLock::new(Archived::default()),
            records: HashMap::new(),
            initial_sequence_index,
        }
    }

    /// Archives a message so that later replays can find it.
    ///
    /// # Arguments
    /// * `session_id` - Owning session
    /// * `direction` - Direction of the message
    /// * `sequence_index` - Epoch of the sequence number
    /// * `message` - The message to keep
    pub fn archive(
        &self,
        session_id: &SessionId,
        direction: Direction,
        sequence_index: u32,
        message: ArchivedMessage,
    ) {
        let hash = session_id.persistence_key();
        let mut archived = self.archived.write();
        let tip = archived
            .tips
            .entry((hash, direction, sequence_index))
            .or_insert(0);
        *tip = (*tip).max(message.seq_num);
        archived
            .messages
            .insert((hash, direction, sequence_index, message.seq_num), message);
    }

    /// Returns the number of archived messages.
    #[must_use]
    pub fn message_count(&self) -> usize {
        self.archived.read().messages.len()
    }

    /// Removes archived messages of one epoch below `seq_num`, emulating
    /// eviction from a bounded replay index.
    pub fn evict_before(
        &self,
        session_id: &SessionId,
        direction: Direction,
        sequence_index: u32,
        seq_num: u64,
    ) {
        let hash = session_id.persistence_key();
        self.archived.write().messages.retain(|&(key, dir, index, seq), _| {
            !(key == hash && dir == direction && index == sequence_index && seq < seq_num)
        });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SequenceNumbers for MemoryStore {
    fn load(&self, session_id: &SessionId) -> Result<Option<SequenceNumberRecord>, StoreError> {
        Ok(self.records.get(session_id).cloned())
    }

    fn save(&mut self, record: &SequenceNumberRecord) -> Result<(), StoreError> {
        if let Some(stored) = self.records.get(&record.session_id) {
            check_progress(stored, record)?;
        }
        self.records
            .insert(record.session_id.clone(), record.clone());
        Ok(())
    }

    fn reset(&mut self, session_id: &SessionId) -> Result<SequenceNumberRecord, StoreError> {
        let (sequence_index, session_ver_id) = match self.records.get(session_id) {
            Some(stored) => (stored.sequence_index + 1, stored.session_ver_id),
            None => (self.initial_sequence_index, 0),
        };
        let record = SequenceNumberRecord::new(session_id.clone(), sequence_index)
            .with_session_ver_id(session_ver_id);
        self.records.insert(session_id.clone(), record.clone());
        Ok(record)
    }
}

impl MessageArchive for MemoryStore {
    fn replay(
        &self,
        query: &ReplayQuery<'_>,
        visitor: &mut dyn FnMut(ReplayEntry) -> ReplayControl,
    ) -> Result<(), StoreError> {
        if query.begin > query.end {
            return Ok(());
        }
        let hash = query.session_id.persistence_key();
        let archived = self.archived.read();
        for seq_num in query.begin..=query.end {
            let key = (hash, query.direction, query.sequence_index, seq_num);
            let entry = match archived.messages.get(&key) {
                Some(message) => ReplayEntry::Found(message.clone()),
                None => ReplayEntry::Missing(seq_num),
            };
            if visitor(entry) == ReplayControl::Abort {
                break;
            }
        }
        Ok(())
    }

    fn archived_through(
        &self,
        session_id: &SessionId,
        direction: Direction,
        sequence_index: u32,
    ) -> u64 {
        let hash = session_id.persistence_key();
        self.archived
            .read()
            .tips
            .get(&(hash, direction, sequence_index))
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use irongate_core::message::MsgType;

    fn message(seq_num: u64, body: &'static [u8]) -> ArchivedMessage {
        ArchivedMessage {
            seq_num,
            msg_type: MsgType::Application("8".into()),
            body: Bytes::from_static(body),
        }
    }

    fn collect(store: &MemoryStore, id: &SessionId, begin: u64, end: u64) -> Vec<ReplayEntry> {
        let query = ReplayQuery {
            session_id: id,
            direction: Direction::Outbound,
            sequence_index: 0,
            begin,
            end,
        };
        let mut out = Vec::new();
        store
            .replay(&query, &mut |entry| {
                out.push(entry);
                ReplayControl::Continue
            })
            .unwrap();
        out
    }

    #[test]
    fn test_memory_store_new() {
        let store = MemoryStore::new();
        assert_eq!(store.message_count(), 0);
        assert_eq!(store.load(&SessionId::fixp(1)).unwrap(), None);
    }

    #[test]
    fn test_replay_reports_gaps() {
        let store = MemoryStore::new();
        let id = SessionId::fixp(1);
        store.archive(&id, Direction::Outbound, 0, message(1, b"one"));
        store.archive(&id, Direction::Outbound, 0, message(3, b"three"));

        let entries = collect(&store, &id, 1, 4);
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0], ReplayEntry::Found(message(1, b"one")));
        assert_eq!(entries[1], ReplayEntry::Missing(2));
        assert_eq!(entries[2], ReplayEntry::Found(message(3, b"three")));
        assert_eq!(entries[3], ReplayEntry::Missing(4));
        assert_eq!(store.archived_through(&id, Direction::Outbound, 0), 3);
        assert_eq!(store.archived_through(&id, Direction::Inbound, 0), 0);
    }

    #[test]
    fn test_replay_abort_stops_visiting() {
        let store = MemoryStore::new();
        let id = SessionId::fixp(1);
        let query = ReplayQuery {
            session_id: &id,
            direction: Direction::Outbound,
            sequence_index: 0,
            begin: 1,
            end: 10,
        };
        let mut visited = 0;
        store
            .replay(&query, &mut |_| {
                visited += 1;
                if visited == 3 {
                    ReplayControl::Abort
                } else {
                    ReplayControl::Continue
                }
            })
            .unwrap();
        assert_eq!(visited, 3);
    }

    #[test]
    fn test_evicted_messages_become_missing() {
        let store = MemoryStore::new();
        let id = SessionId::fixp(2);
        for seq in 1..=4 {
            store.archive(&id, Direction::Outbound, 0, message(seq, b"m"));
        }
        store.evict_before(&id, Direction::Outbound, 0, 3);
        let entries = collect(&store, &id, 1, 4);
        assert_eq!(entries[0], ReplayEntry::Missing(1));
        assert_eq!(entries[1], ReplayEntry::Missing(2));
        assert!(matches!(entries[2], ReplayEntry::Found(_)));
        assert_eq!(store.archived_through(&id, Direction::Outbound, 0), 4);
    }

    #[test]
    fn test_save_rejects_regression() {
        let mut store = MemoryStore::new();
        let id = SessionId::fixp(3);
        let record = SequenceNumberRecord::new(id.clone(), 0).with_counters(5, 5);
        store.save(&record).unwrap();

        let lower = record.clone().with_counters(4, 5);
        assert!(matches!(
            store.save(&lower),
            Err(StoreError::SequenceRegression { field: "sent", .. })
        ));
    }

    #[test]
    fn test_reset_bumps_index() {
        let mut store = MemoryStore::new();
        let id = SessionId::fixp(4);
        store
            .save(&SequenceNumberRecord::new(id.clone(), 0).with_counters(9, 9))
            .unwrap();

        let reset = store.reset(&id).unwrap();
        assert_eq!(reset.sequence_index, 1);
        assert_eq!(reset.sent_seq_num, 0);
        assert_eq!(store.load(&id).unwrap(), Some(reset));
    }
}
