/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Sequence number management.
//!
//! Sessions are owned by the framer thread, so the manager is plain state.
//! It tracks the last sent and last received sequence numbers of the current
//! sequence index and converts to and from the persisted record.

use irongate_core::types::{SeqNum, SessionId};
use irongate_store::SequenceNumberRecord;

/// Manages sequence numbers for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SequenceManager {
    /// Last sequence number sent, 0 when nothing was sent.
    last_sent: u64,
    /// Last sequence number received, 0 when nothing was received.
    last_received: u64,
    /// Current reset epoch.
    sequence_index: u32,
}

impl SequenceManager {
    /// Creates a manager for a fresh session in the given epoch.
    #[must_use]
    pub const fn new(sequence_index: u32) -> Self {
        Self {
            last_sent: 0,
            last_received: 0,
            sequence_index,
        }
    }

    /// Creates a manager from explicit last sent and received values.
    ///
    /// # Arguments
    /// * `last_sent` - Last sequence number sent
    /// * `last_received` - Last sequence number received
    /// * `sequence_index` - Epoch of both values
    #[must_use]
    pub const fn with_initial(last_sent: u64, last_received: u64, sequence_index: u32) -> Self {
        Self {
            last_sent,
            last_received,
            sequence_index,
        }
    }

    /// Creates a manager from a persisted record.
    #[must_use]
    pub const fn from_record(record: &SequenceNumberRecord) -> Self {
        Self::with_initial(
            record.sent_seq_num,
            record.received_seq_num,
            record.sequence_index,
        )
    }

    /// Builds the record to persist for this state.
    #[must_use]
    pub fn to_record(&self, session_id: &SessionId, session_ver_id: u64) -> SequenceNumberRecord {
        SequenceNumberRecord::new(session_id.clone(), self.sequence_index)
            .with_counters(self.last_sent, self.last_received)
            .with_session_ver_id(session_ver_id)
    }

    /// Returns the sequence number the next outbound message gets.
    #[inline]
    #[must_use]
    pub const fn next_sender_seq(&self) -> SeqNum {
        SeqNum::new(self.last_sent + 1)
    }

    /// Returns the sequence number expected on the next inbound message.
    #[inline]
    #[must_use]
    pub const fn next_target_seq(&self) -> SeqNum {
        SeqNum::new(self.last_received + 1)
    }

    /// Returns the last sent sequence number.
    #[inline]
    #[must_use]
    pub const fn last_sent(&self) -> u64 {
        self.last_sent
    }

    /// Returns the last received sequence number.
    #[inline]
    #[must_use]
    pub const fn last_received(&self) -> u64 {
        self.last_received
    }

    /// Returns the current sequence index.
    #[inline]
    #[must_use]
    pub const fn sequence_index(&self) -> u32 {
        self.sequence_index
    }

    /// Marks `seq` as sent.
    ///
    /// Only called once the frame was accepted by the publication, so a
    /// backpressured frame never consumes a sequence number.
    #[inline]
    pub fn commit_sent(&mut self, seq: SeqNum) {
        self.last_sent = seq.value();
    }

    /// Marks `seq` as received.
    #[inline]
    pub fn commit_received(&mut self, seq: u64) {
        self.last_received = seq;
    }

    /// Sets the next expected inbound sequence number.
    ///
    /// # Arguments
    /// * `seq` - The new expected sequence number
    #[inline]
    pub fn set_target_seq(&mut self, seq: u64) {
        self.last_received = seq.saturating_sub(1);
    }

    /// Starts a new epoch with both counters at zero.
    pub fn reset(&mut self, sequence_index: u32) {
        self.last_sent = 0;
        self.last_received = 0;
        self.sequence_index = sequence_index;
    }

    /// Validates an incoming sequence number.
    ///
    /// # Arguments
    /// * `received` - The received sequence number
    #[must_use]
    pub const fn validate_incoming(&self, received: u64) -> SequenceResult {
        let expected = self.last_received + 1;

        if received == expected {
            SequenceResult::Ok
        } else if received < expected {
            SequenceResult::TooLow { expected, received }
        } else {
            SequenceResult::Gap { expected, received }
        }
    }
}

/// Result of sequence number validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceResult {
    /// Sequence number is as expected.
    Ok,
    /// Sequence number is lower than expected (possible duplicate).
    TooLow {
        /// Expected sequence number.
        expected: u64,
        /// Received sequence number.
        received: u64,
    },
    /// Sequence number is higher than expected (gap detected).
    Gap {
        /// Expected sequence number.
        expected: u64,
        /// Received sequence number.
        received: u64,
    },
}

impl SequenceResult {
    /// Returns true if the sequence is valid.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }

    /// Returns true if there's a gap.
    #[must_use]
    pub const fn is_gap(&self) -> bool {
        matches!(self, Self::Gap { .. })
    }

    /// Returns true if the sequence is too low.
    #[must_use]
    pub const fn is_too_low(&self) -> bool {
        matches!(self, Self::TooLow { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_manager_starts_at_one() {
        let mgr = SequenceManager::new(0);
        assert_eq!(mgr.next_sender_seq().value(), 1);
        assert_eq!(mgr.next_target_seq().value(), 1);
    }

    #[test]
    fn test_commit_sent_only_moves_on_commit() {
        let mut mgr = SequenceManager::new(0);

        let seq = mgr.next_sender_seq();
        assert_eq!(mgr.next_sender_seq(), seq);

        mgr.commit_sent(seq);
        assert_eq!(mgr.last_sent(), 1);
        assert_eq!(mgr.next_sender_seq().value(), 2);
    }

    #[test]
    fn test_validate_incoming() {
        let mut mgr = SequenceManager::new(0);
        assert!(mgr.validate_incoming(1).is_ok());

        mgr.set_target_seq(5);
        assert!(mgr.validate_incoming(4).is_too_low());
        assert!(mgr.validate_incoming(5).is_ok());
        assert_eq!(
            mgr.validate_incoming(10),
            SequenceResult::Gap {
                expected: 5,
                received: 10
            }
        );
    }

    #[test]
    fn test_record_conversion() {
        let id = SessionId::fixp(7);
        let mgr = SequenceManager::with_initial(10, 20, 3);
        let record = mgr.to_record(&id, 2);

        assert_eq!(record.sent_seq_num, 10);
        assert_eq!(record.received_seq_num, 20);
        assert_eq!(record.sequence_index, 3);
        assert_eq!(record.session_ver_id, 2);
        assert_eq!(SequenceManager::from_record(&record), mgr);
    }

    #[test]
    fn test_reset() {
        let mut mgr = SequenceManager::with_initial(100, 200, 0);
        mgr.reset(1);
        assert_eq!(mgr.next_sender_seq().value(), 1);
        assert_eq!(mgr.next_target_seq().value(), 1);
        assert_eq!(mgr.sequence_index(), 1);
    }
}
