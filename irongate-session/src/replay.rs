/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Servicing of resend and retransmit requests.
//!
//! A request becomes a [`ReplayJob`] in the session's [`ReplayQueue`]. Each
//! duty cycle the front job is driven over the archive: originals are resent,
//! while missing messages and message types in the gap-fill set are coalesced
//! into gap-fill runs. When the publication backpressures, the archive scan is
//! aborted and the job remembers the first sequence number not yet serviced.
//! A frame that cannot be encoded fails the job.

use crate::capability::PublishError;
use crate::config::GapFillSet;
use irongate_core::error::SessionError;
use irongate_core::types::{Direction, SessionId};
use irongate_store::{ArchivedMessage, MessageArchive, ReplayControl, ReplayEntry, ReplayQuery};
use smallvec::SmallVec;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// A range of sent messages to replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayJob {
    /// First sequence number not yet serviced.
    next: u64,
    /// Last sequence number to service (inclusive).
    end: u64,
    /// FIXP request timestamp echoed in the Retransmission header.
    request_timestamp_nanos: u64,
    /// When the job started waiting for the archiver.
    waiting_since: Option<Instant>,
}

impl ReplayJob {
    /// Creates a job for `[begin, end]`.
    #[must_use]
    pub const fn new(begin: u64, end: u64) -> Self {
        Self {
            next: begin,
            end,
            request_timestamp_nanos: 0,
            waiting_since: None,
        }
    }

    /// Sets the FIXP request timestamp.
    #[must_use]
    pub const fn with_request_timestamp(mut self, nanos: u64) -> Self {
        self.request_timestamp_nanos = nanos;
        self
    }

    /// Returns the first sequence number not yet serviced.
    #[inline]
    #[must_use]
    pub const fn next(&self) -> u64 {
        self.next
    }

    /// Returns the last sequence number of the job.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.end
    }

    /// Returns the FIXP request timestamp.
    #[must_use]
    pub const fn request_timestamp_nanos(&self) -> u64 {
        self.request_timestamp_nanos
    }

    /// Returns true once every sequence number was serviced.
    #[inline]
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.next > self.end
    }
}

/// Bounded queue of replay jobs of one session.
#[derive(Debug)]
pub struct ReplayQueue {
    jobs: SmallVec<[ReplayJob; 4]>,
    max_jobs: usize,
}

impl ReplayQueue {
    /// Creates a queue accepting at most `max_jobs` jobs.
    #[must_use]
    pub fn new(max_jobs: usize) -> Self {
        Self {
            jobs: SmallVec::new(),
            max_jobs,
        }
    }

    /// Queues a job.
    ///
    /// # Errors
    /// Returns `SessionError::ResendQueueOverflow` if the queue is full.
    pub fn push(&mut self, job: ReplayJob) -> Result<(), SessionError> {
        if self.jobs.len() >= self.max_jobs {
            return Err(SessionError::ResendQueueOverflow {
                max_replays: self.max_jobs,
            });
        }
        self.jobs.push(job);
        Ok(())
    }

    /// Returns the job being serviced.
    #[must_use]
    pub fn front_mut(&mut self) -> Option<&mut ReplayJob> {
        self.jobs.first_mut()
    }

    /// Removes the job being serviced.
    pub fn pop_front(&mut self) -> Option<ReplayJob> {
        if self.jobs.is_empty() {
            None
        } else {
            Some(self.jobs.remove(0))
        }
    }

    /// Returns true if the queue is full.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.jobs.len() >= self.max_jobs
    }

    /// Returns the number of queued jobs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Returns true if no replay is in progress.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Drops all jobs.
    pub fn clear(&mut self) {
        self.jobs.clear();
    }
}

/// One unit of replay output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayItem<'a> {
    /// An archived message resent as is.
    Original(&'a ArchivedMessage),
    /// Skip from `seq_num` to `new_seq_no`.
    GapFill {
        /// First skipped sequence number.
        seq_num: u64,
        /// Sequence number following the skipped run.
        new_seq_no: u64,
    },
}

/// Where a job stands after a duty cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayProgress {
    /// Every sequence number was serviced.
    Complete,
    /// The publication backpressured; resume later.
    Blocked,
    /// The archiver has not caught up with the end of the range yet.
    AwaitingArchive,
}

/// Archive view of the session being replayed.
#[derive(Clone, Copy)]
pub struct ReplaySource<'a> {
    /// The archive.
    pub archive: &'a dyn MessageArchive,
    /// Session whose outbound messages are replayed.
    pub session_id: &'a SessionId,
    /// Current epoch.
    pub sequence_index: u32,
    /// Types replaced by gap fills.
    pub gap_fill_types: &'a GapFillSet,
    /// False when outbound messages were never archived.
    pub logging_enabled: bool,
    /// How long to wait for the archiver before replaying what exists.
    pub archive_wait: Duration,
}

/// Drives `job` as far as the publication allows.
///
/// # Arguments
/// * `job` - The job to advance
/// * `source` - Where archived messages come from
/// * `now` - Current time
/// * `emit` - Publishes one item; backpressure aborts the scan
///
/// # Errors
/// Returns `SessionError::Store` if the archive cannot be read, or
/// `SessionError::Encode` if an item could not be encoded.
pub fn service(
    job: &mut ReplayJob,
    source: &ReplaySource<'_>,
    now: Instant,
    emit: &mut dyn FnMut(ReplayItem<'_>) -> Result<(), PublishError>,
) -> Result<ReplayProgress, SessionError> {
    if job.is_complete() {
        return Ok(ReplayProgress::Complete);
    }

    if !source.logging_enabled {
        let item = ReplayItem::GapFill {
            seq_num: job.next,
            new_seq_no: job.end + 1,
        };
        match emit(item) {
            Ok(()) => {}
            Err(PublishError::Backpressure) => return Ok(ReplayProgress::Blocked),
            Err(PublishError::Encode(e)) => return Err(e.into()),
        }
        job.next = job.end + 1;
        return Ok(ReplayProgress::Complete);
    }

    let archived = source
        .archive
        .archived_through(source.session_id, Direction::Outbound, source.sequence_index);
    if archived < job.end {
        let since = *job.waiting_since.get_or_insert(now);
        if now.saturating_duration_since(since) < source.archive_wait {
            return Ok(ReplayProgress::AwaitingArchive);
        }
        warn!(
            session = %source.session_id,
            archived,
            end = job.end,
            "archiver behind, replaying what is archived"
        );
    }

    let query = ReplayQuery {
        session_id: source.session_id,
        direction: Direction::Outbound,
        sequence_index: source.sequence_index,
        begin: job.next,
        end: job.end,
    };
    let mut next = job.next;
    let mut gap_start: Option<u64> = None;
    let mut halted: Option<PublishError> = None;

    source.archive.replay(&query, &mut |entry| match entry {
        ReplayEntry::Found(message) if !source.gap_fill_types.contains(&message.msg_type) => {
            if let Some(start) = gap_start {
                let fill = ReplayItem::GapFill {
                    seq_num: start,
                    new_seq_no: message.seq_num,
                };
                if let Err(e) = emit(fill) {
                    halted = Some(e);
                    return ReplayControl::Abort;
                }
                gap_start = None;
                next = message.seq_num;
            }
            if let Err(e) = emit(ReplayItem::Original(&message)) {
                halted = Some(e);
                return ReplayControl::Abort;
            }
            next = message.seq_num + 1;
            ReplayControl::Continue
        }
        other => {
            gap_start.get_or_insert(other.seq_num());
            ReplayControl::Continue
        }
    })?;

    if halted.is_none() {
        if let Some(start) = gap_start {
            let fill = ReplayItem::GapFill {
                seq_num: start,
                new_seq_no: job.end + 1,
            };
            halted = emit(fill).err();
        }
        if halted.is_none() {
            next = job.end + 1;
        }
    }

    job.next = next;
    match halted {
        None => Ok(ReplayProgress::Complete),
        Some(PublishError::Backpressure) => {
            debug!(session = %source.session_id, next, "replay backpressured");
            Ok(ReplayProgress::Blocked)
        }
        Some(PublishError::Encode(e)) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use irongate_core::error::EncodeError;
    use irongate_store::MemoryStore;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Out {
        Original(u64),
        GapFill(u64, u64),
    }

    fn archive_all(store: &MemoryStore, id: &SessionId, types: &[&str]) {
        for (i, code) in types.iter().enumerate() {
            store.archive(
                id,
                Direction::Outbound,
                0,
                ArchivedMessage {
                    seq_num: i as u64 + 1,
                    msg_type: code.parse().unwrap(),
                    body: Bytes::from(format!("body-{}", i + 1)),
                },
            );
        }
    }

    fn source<'a>(
        store: &'a MemoryStore,
        id: &'a SessionId,
        types: &'a GapFillSet,
    ) -> ReplaySource<'a> {
        ReplaySource {
            archive: store,
            session_id: id,
            sequence_index: 0,
            gap_fill_types: types,
            logging_enabled: true,
            archive_wait: Duration::from_secs(1),
        }
    }

    fn run(
        job: &mut ReplayJob,
        source: &ReplaySource<'_>,
        now: Instant,
        budget: usize,
        out: &mut Vec<Out>,
    ) -> ReplayProgress {
        let mut remaining = budget;
        service(job, source, now, &mut |item| {
            if remaining == 0 {
                return Err(PublishError::Backpressure);
            }
            remaining -= 1;
            out.push(match item {
                ReplayItem::Original(message) => Out::Original(message.seq_num),
                ReplayItem::GapFill {
                    seq_num,
                    new_seq_no,
                } => Out::GapFill(seq_num, new_seq_no),
            });
            Ok(())
        })
        .unwrap()
    }

    #[test]
    fn test_admin_messages_coalesce_into_gap_fills() {
        let store = MemoryStore::new();
        let id = SessionId::fixp(1);
        archive_all(&store, &id, &["A", "D", "0", "0", "8"]);
        let types = GapFillSet::default();

        let mut job = ReplayJob::new(1, 5);
        let mut out = Vec::new();
        let progress = run(&mut job, &source(&store, &id, &types), Instant::now(), 10, &mut out);

        assert_eq!(progress, ReplayProgress::Complete);
        assert_eq!(
            out,
            vec![
                Out::GapFill(1, 2),
                Out::Original(2),
                Out::GapFill(3, 5),
                Out::Original(5)
            ]
        );
    }

    #[test]
    fn test_evicted_range_gap_fills_every_number() {
        let store = MemoryStore::new();
        let id = SessionId::fixp(1);
        archive_all(&store, &id, &["D", "D", "D", "D"]);
        store.evict_before(&id, Direction::Outbound, 0, 5);
        let types = GapFillSet::default();

        let mut job = ReplayJob::new(1, 4);
        let mut out = Vec::new();
        let progress = run(&mut job, &source(&store, &id, &types), Instant::now(), 10, &mut out);

        assert_eq!(progress, ReplayProgress::Complete);
        assert_eq!(out, vec![Out::GapFill(1, 5)]);
    }

    #[test]
    fn test_backpressure_resumes_at_first_unsent() {
        let store = MemoryStore::new();
        let id = SessionId::fixp(1);
        archive_all(&store, &id, &["D", "D", "D"]);
        let types = GapFillSet::default();
        let src = source(&store, &id, &types);
        let now = Instant::now();

        let mut job = ReplayJob::new(1, 3);
        let mut out = Vec::new();
        assert_eq!(run(&mut job, &src, now, 2, &mut out), ReplayProgress::Blocked);
        assert_eq!(job.next(), 3);

        assert_eq!(run(&mut job, &src, now, 2, &mut out), ReplayProgress::Complete);
        assert_eq!(
            out,
            vec![Out::Original(1), Out::Original(2), Out::Original(3)]
        );
        assert!(job.is_complete());
    }

    #[test]
    fn test_encode_failure_fails_the_job() {
        let store = MemoryStore::new();
        let id = SessionId::fixp(1);
        archive_all(&store, &id, &["D", "D"]);
        let types = GapFillSet::default();

        let mut job = ReplayJob::new(1, 2);
        let mut emitted = 0;
        let result = service(&mut job, &source(&store, &id, &types), Instant::now(), &mut |_| {
            if emitted == 1 {
                return Err(PublishError::Encode(EncodeError::Unsupported("D".to_string())));
            }
            emitted += 1;
            Ok(())
        });

        assert!(matches!(result, Err(SessionError::Encode(_))));
        assert_eq!(job.next(), 2);
    }

    #[test]
    fn test_backpressured_gap_fill_is_retried() {
        let store = MemoryStore::new();
        let id = SessionId::fixp(1);
        archive_all(&store, &id, &["0", "0", "D"]);
        let types = GapFillSet::default();
        let src = source(&store, &id, &types);
        let now = Instant::now();

        let mut job = ReplayJob::new(1, 3);
        let mut out = Vec::new();
        assert_eq!(run(&mut job, &src, now, 0, &mut out), ReplayProgress::Blocked);
        assert_eq!(job.next(), 1);
        assert_eq!(run(&mut job, &src, now, 5, &mut out), ReplayProgress::Complete);
        assert_eq!(out, vec![Out::GapFill(1, 3), Out::Original(3)]);
    }

    #[test]
    fn test_waits_for_archiver_then_proceeds() {
        let store = MemoryStore::new();
        let id = SessionId::fixp(1);
        archive_all(&store, &id, &["D"]);
        let types = GapFillSet::default();
        let src = source(&store, &id, &types);
        let t0 = Instant::now();

        let mut job = ReplayJob::new(1, 2);
        let mut out = Vec::new();
        assert_eq!(run(&mut job, &src, t0, 5, &mut out), ReplayProgress::AwaitingArchive);
        assert!(out.is_empty());

        let later = t0 + Duration::from_secs(1);
        assert_eq!(run(&mut job, &src, later, 5, &mut out), ReplayProgress::Complete);
        assert_eq!(out, vec![Out::Original(1), Out::GapFill(2, 3)]);
    }

    #[test]
    fn test_logging_disabled_gap_fills_whole_range() {
        let store = MemoryStore::new();
        let id = SessionId::fixp(1);
        let types = GapFillSet::default();
        let mut src = source(&store, &id, &types);
        src.logging_enabled = false;

        let mut job = ReplayJob::new(4, 9);
        let mut out = Vec::new();
        assert_eq!(run(&mut job, &src, Instant::now(), 5, &mut out), ReplayProgress::Complete);
        assert_eq!(out, vec![Out::GapFill(4, 10)]);
    }

    #[test]
    fn test_queue_overflow() {
        let mut queue = ReplayQueue::new(2);
        queue.push(ReplayJob::new(1, 2)).unwrap();
        queue.push(ReplayJob::new(3, 4)).unwrap();
        assert!(queue.is_full());
        assert_eq!(
            queue.push(ReplayJob::new(5, 6)),
            Err(SessionError::ResendQueueOverflow { max_replays: 2 })
        );
        assert_eq!(queue.pop_front().map(|job| job.next()), Some(1));
        assert_eq!(queue.len(), 1);
    }
}
