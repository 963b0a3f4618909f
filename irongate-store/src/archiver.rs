/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Archival thread and the file-backed [`MessageArchive`].
//!
//! The framer hands [`ArchiveRequest`]s to the archiver over a bounded
//! channel. For every batch the archiver appends the bytes to the archive
//! stream, syncs it, and only then appends the replay index records. Each
//! durable message is acknowledged with a [`DurabilityAck`] on a second
//! bounded channel that the framer drains without blocking.

use crate::archive::{ArchiveEntry, ArchiveReader, ArchiveWriter};
use crate::replay_index::{IndexRecord, ReplayIndex, ReplayLookup};
use crate::traits::{MessageArchive, ReplayControl, ReplayEntry, ReplayQuery};
use bytes::Bytes;
use crossbeam_channel::{
    Receiver, RecvTimeoutError, SendTimeoutError, Sender, TryRecvError, TrySendError, bounded,
};
use irongate_core::error::StoreError;
use irongate_core::message::MsgType;
use irongate_core::types::{Direction, SessionId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// File name of the archive stream inside the log directory.
pub const ARCHIVE_FILE_NAME: &str = "archive.log";

/// Maximum number of requests written per sync.
const MAX_BATCH: usize = 64;

/// A message the framer wants archived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveRequest {
    /// Owning session.
    pub session_id: SessionId,
    /// Direction of the message.
    pub direction: Direction,
    /// Epoch of the sequence number.
    pub sequence_index: u32,
    /// Sequence number.
    pub seq_num: u64,
    /// Message type.
    pub msg_type: MsgType,
    /// Encoded message bytes.
    pub body: Bytes,
}

/// Confirmation that a message is durably archived and indexed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DurabilityAck {
    /// Owning session.
    pub session_id: SessionId,
    /// Direction of the message.
    pub direction: Direction,
    /// Epoch of the sequence number.
    pub sequence_index: u32,
    /// Sequence number.
    pub seq_num: u64,
    /// Stream position of the archived entry.
    pub position: u64,
}

/// Settings of the archival thread.
#[derive(Debug, Clone)]
pub struct ArchiverConfig {
    /// Directory holding the archive and the replay index files.
    pub log_dir: PathBuf,
    /// Record capacity of newly created replay index files.
    pub replay_index_capacity: usize,
    /// Capacity of the request channel.
    pub request_capacity: usize,
    /// Capacity of the acknowledgement channel.
    pub ack_capacity: usize,
    /// How long the thread waits for work before checking for shutdown.
    pub idle_timeout: Duration,
}

/// Returns the path of the replay index of one session and direction.
#[must_use]
pub fn replay_index_path(log_dir: &Path, direction: Direction, session_key: u64) -> PathBuf {
    log_dir.join(format!("replay-index-{direction}-{session_key:016x}"))
}

/// File-backed archive: replay index files plus the archive stream.
///
/// Shared between the archiver thread, which appends, and the framer, which
/// replays. Each index is guarded by the set's `RwLock` only for the duration
/// of a single append or lookup.
#[derive(Debug)]
pub struct FileArchive {
    log_dir: PathBuf,
    capacity: usize,
    indexes: RwLock<HashMap<(u64, Direction), ReplayIndex>>,
    reader: ArchiveReader,
}

impl FileArchive {
    /// Opens the archive in `log_dir`.
    ///
    /// The archive stream must already exist; [`Archiver::spawn`] creates it.
    ///
    /// # Errors
    /// Returns `StoreError::Io` if the archive stream cannot be opened.
    pub fn open(log_dir: &Path, capacity: usize) -> Result<Self, StoreError> {
        Ok(Self {
            log_dir: log_dir.to_path_buf(),
            capacity,
            indexes: RwLock::new(HashMap::new()),
            reader: ArchiveReader::open(&log_dir.join(ARCHIVE_FILE_NAME))?,
        })
    }

    /// Opens the index for `(session_key, direction)` if it exists on disk or
    /// `create` is set. Returns true if the index is available.
    fn ensure_index(
        &self,
        session_key: u64,
        direction: Direction,
        create: bool,
    ) -> Result<bool, StoreError> {
        if self.indexes.read().contains_key(&(session_key, direction)) {
            return Ok(true);
        }
        let path = replay_index_path(&self.log_dir, direction, session_key);
        if !create && !path.exists() {
            return Ok(false);
        }
        let mut indexes = self.indexes.write();
        if let std::collections::hash_map::Entry::Vacant(slot) =
            indexes.entry((session_key, direction))
        {
            slot.insert(ReplayIndex::open(&path, self.capacity, session_key)?);
        }
        Ok(true)
    }

    fn append_index(
        &self,
        session_key: u64,
        direction: Direction,
        record: IndexRecord,
    ) -> Result<(), StoreError> {
        self.ensure_index(session_key, direction, true)?;
        match self.indexes.write().get_mut(&(session_key, direction)) {
            Some(index) => index.append(record),
            None => Ok(()),
        }
    }

    fn flush_indexes(&self) -> Result<(), StoreError> {
        for index in self.indexes.read().values() {
            index.flush()?;
        }
        Ok(())
    }
}

impl MessageArchive for FileArchive {
    fn replay(
        &self,
        query: &ReplayQuery<'_>,
        visitor: &mut dyn FnMut(ReplayEntry) -> ReplayControl,
    ) -> Result<(), StoreError> {
        if query.begin > query.end {
            return Ok(());
        }
        let key = query.session_id.persistence_key();
        if !self.ensure_index(key, query.direction, false)? {
            for seq_num in query.begin..=query.end {
                if visitor(ReplayEntry::Missing(seq_num)) == ReplayControl::Abort {
                    break;
                }
            }
            return Ok(());
        }

        let indexes = self.indexes.read();
        let Some(index) = indexes.get(&(key, query.direction)) else {
            return Ok(());
        };
        for lookup in index.lookup_range(query.sequence_index, query.begin, query.end) {
            let entry = match lookup {
                ReplayLookup::Found(record) => match self.reader.read(record.stream_position) {
                    Ok((header, message))
                        if header.session_key == key && header.seq_num == record.sequence_number =>
                    {
                        ReplayEntry::Found(message)
                    }
                    Ok(_) | Err(StoreError::NotFound { .. }) => {
                        warn!(
                            session = %query.session_id,
                            position = record.stream_position,
                            "index points at an unexpected archive entry"
                        );
                        ReplayEntry::Missing(record.sequence_number)
                    }
                    Err(e) => return Err(e),
                },
                ReplayLookup::Missing(seq_num) => ReplayEntry::Missing(seq_num),
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
        let key = session_id.persistence_key();
        match self.ensure_index(key, direction, false) {
            Ok(true) => self
                .indexes
                .read()
                .get(&(key, direction))
                .map_or(0, |index| index.archived_through(sequence_index)),
            Ok(false) => 0,
            Err(e) => {
                error!(session = %session_id, error = %e, "replay index unavailable");
                0
            }
        }
    }
}

/// Handle to the running archival thread.
#[derive(Debug)]
pub struct ArchiverHandle {
    requests: Option<Sender<ArchiveRequest>>,
    acks: Receiver<DurabilityAck>,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<Result<(), StoreError>>>,
    archive: Arc<FileArchive>,
}

impl ArchiverHandle {
    /// Hands a request to the archiver without blocking.
    ///
    /// # Errors
    /// Returns the request back when the channel is full or the archiver
    /// has stopped.
    pub fn try_archive(&self, request: ArchiveRequest) -> Result<(), TrySendError<ArchiveRequest>> {
        match &self.requests {
            Some(tx) => tx.try_send(request),
            None => Err(TrySendError::Disconnected(request)),
        }
    }

    /// Returns true when the request channel has no free slot.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.requests.as_ref().is_none_or(Sender::is_full)
    }

    /// Drains every pending acknowledgement.
    ///
    /// # Returns
    /// The number of acknowledgements handled.
    pub fn poll_acks(&self, mut on_ack: impl FnMut(DurabilityAck)) -> usize {
        let mut count = 0;
        loop {
            match self.acks.try_recv() {
                Ok(ack) => {
                    on_ack(ack);
                    count += 1;
                }
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => return count,
            }
        }
    }

    /// Returns true while the archival thread is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Returns the file archive used for replays.
    #[must_use]
    pub fn archive(&self) -> &Arc<FileArchive> {
        &self.archive
    }

    /// Stops the thread after it has archived everything already queued.
    ///
    /// # Errors
    /// Returns the error that stopped the thread, if any.
    pub fn stop(mut self) -> Result<(), StoreError> {
        self.shutdown_and_join()
    }

    fn shutdown_and_join(&mut self) -> Result<(), StoreError> {
        self.shutdown.store(true, Ordering::Release);
        self.requests = None;
        match self.thread.take() {
            Some(thread) => thread.join().unwrap_or_else(|_| {
                Err(StoreError::Io {
                    path: self.archive.log_dir.clone(),
                    reason: "archiver thread panicked".to_string(),
                })
            }),
            None => Ok(()),
        }
    }
}

impl Drop for ArchiverHandle {
    fn drop(&mut self) {
        if self.thread.is_some()
            && let Err(e) = self.shutdown_and_join()
        {
            error!(error = %e, "archiver stopped with error");
        }
    }
}

/// The archival thread.
#[derive(Debug)]
pub struct Archiver {
    writer: ArchiveWriter,
    archive: Arc<FileArchive>,
    requests: Receiver<ArchiveRequest>,
    acks: Sender<DurabilityAck>,
    shutdown: Arc<AtomicBool>,
    idle_timeout: Duration,
}

impl Archiver {
    /// Opens the archive stream and starts the archival thread.
    ///
    /// # Errors
    /// Returns `StoreError` if the archive cannot be opened or the thread
    /// cannot be spawned.
    pub fn spawn(config: &ArchiverConfig) -> Result<ArchiverHandle, StoreError> {
        let writer = ArchiveWriter::open(&config.log_dir.join(ARCHIVE_FILE_NAME))?;
        let archive = Arc::new(FileArchive::open(
            &config.log_dir,
            config.replay_index_capacity,
        )?);
        let (request_tx, request_rx) = bounded(config.request_capacity);
        let (ack_tx, ack_rx) = bounded(config.ack_capacity);
        let shutdown = Arc::new(AtomicBool::new(false));

        let archiver = Self {
            writer,
            archive: Arc::clone(&archive),
            requests: request_rx,
            acks: ack_tx,
            shutdown: Arc::clone(&shutdown),
            idle_timeout: config.idle_timeout,
        };
        let thread = std::thread::Builder::new()
            .name("irongate-archiver".to_string())
            .spawn(move || archiver.run())
            .map_err(|e| StoreError::io(&config.log_dir, &e))?;
        info!(dir = %config.log_dir.display(), "archiver started");

        Ok(ArchiverHandle {
            requests: Some(request_tx),
            acks: ack_rx,
            shutdown,
            thread: Some(thread),
            archive,
        })
    }

    fn run(mut self) -> Result<(), StoreError> {
        let mut batch = Vec::with_capacity(MAX_BATCH);
        loop {
            match self.requests.recv_timeout(self.idle_timeout) {
                Ok(request) => {
                    batch.push(request);
                    while batch.len() < MAX_BATCH {
                        match self.requests.try_recv() {
                            Ok(request) => batch.push(request),
                            Err(_) => break,
                        }
                    }
                    if let Err(e) = self.archive_batch(&mut batch) {
                        error!(error = %e, "archiving failed, stopping archiver");
                        return Err(e);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.shutdown.load(Ordering::Acquire) && self.requests.is_empty() {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.writer.sync()?;
        self.archive.flush_indexes()?;
        info!("archiver stopped");
        Ok(())
    }

    fn archive_batch(&mut self, batch: &mut Vec<ArchiveRequest>) -> Result<(), StoreError> {
        let mut written = Vec::with_capacity(batch.len());
        for request in batch.iter() {
            let session_key = request.session_id.persistence_key();
            let (position, length) = self.writer.append(&ArchiveEntry {
                session_key,
                direction: request.direction,
                sequence_index: request.sequence_index,
                seq_num: request.seq_num,
                msg_type: &request.msg_type,
                body: &request.body,
            })?;
            written.push((session_key, position, length));
        }
        self.writer.sync()?;

        for (request, (session_key, position, length)) in batch.drain(..).zip(written) {
            let record = IndexRecord {
                sequence_index: request.sequence_index,
                sequence_number: request.seq_num,
                stream_position: position,
                length,
            };
            match self.archive.append_index(session_key, request.direction, record) {
                Ok(()) => {}
                Err(StoreError::OutOfOrder { last, attempted, .. }) => {
                    warn!(
                        session = %request.session_id,
                        last,
                        attempted,
                        "skipping out of order index record"
                    );
                    continue;
                }
                Err(e) => return Err(e),
            }
            self.acknowledge(DurabilityAck {
                session_id: request.session_id,
                direction: request.direction,
                sequence_index: request.sequence_index,
                seq_num: request.seq_num,
                position,
            });
        }
        self.archive.flush_indexes()
    }

    /// Sends an acknowledgement, backing off while the framer catches up.
    fn acknowledge(&self, ack: DurabilityAck) {
        let mut wait = Duration::from_micros(50);
        let mut pending = ack;
        loop {
            match self.acks.send_timeout(pending, wait) {
                Ok(()) => return,
                Err(SendTimeoutError::Timeout(ack)) => {
                    if self.shutdown.load(Ordering::Acquire) {
                        debug!(seq_num = ack.seq_num, "dropping ack during shutdown");
                        return;
                    }
                    pending = ack;
                    wait = (wait * 2).min(self.idle_timeout);
                }
                Err(SendTimeoutError::Disconnected(_)) => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tempfile::TempDir;

    fn config(dir: &Path) -> ArchiverConfig {
        ArchiverConfig {
            log_dir: dir.to_path_buf(),
            replay_index_capacity: 8,
            request_capacity: 16,
            ack_capacity: 16,
            idle_timeout: Duration::from_millis(5),
        }
    }

    fn request(session_id: &SessionId, seq_num: u64, body: &'static [u8]) -> ArchiveRequest {
        ArchiveRequest {
            session_id: session_id.clone(),
            direction: Direction::Outbound,
            sequence_index: 0,
            seq_num,
            msg_type: MsgType::Application("8".into()),
            body: Bytes::from_static(body),
        }
    }

    fn wait_for_acks(handle: &ArchiverHandle, expected: usize) -> Vec<DurabilityAck> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut acks = Vec::new();
        while acks.len() < expected && Instant::now() < deadline {
            handle.poll_acks(|ack| acks.push(ack));
            std::thread::sleep(Duration::from_millis(1));
        }
        acks
    }

    fn replay_all(archive: &FileArchive, id: &SessionId, begin: u64, end: u64) -> Vec<ReplayEntry> {
        let query = ReplayQuery {
            session_id: id,
            direction: Direction::Outbound,
            sequence_index: 0,
            begin,
            end,
        };
        let mut entries = Vec::new();
        archive
            .replay(&query, &mut |entry| {
                entries.push(entry);
                ReplayControl::Continue
            })
            .unwrap();
        entries
    }

    #[test]
    fn test_archived_messages_replay_byte_identical() {
        let temp = TempDir::new().unwrap();
        let handle = Archiver::spawn(&config(temp.path())).unwrap();
        let id = SessionId::fixp(42);

        handle.try_archive(request(&id, 1, b"first")).unwrap();
        handle.try_archive(request(&id, 2, b"second")).unwrap();
        let acks = wait_for_acks(&handle, 2);
        assert_eq!(acks.len(), 2);
        assert_eq!(acks[1].seq_num, 2);

        let archive = Arc::clone(handle.archive());
        assert_eq!(archive.archived_through(&id, Direction::Outbound, 0), 2);
        let entries = replay_all(&archive, &id, 1, 3);
        match &entries[0] {
            ReplayEntry::Found(message) => assert_eq!(&message.body[..], b"first"),
            other => panic!("unexpected {other:?}"),
        }
        match &entries[1] {
            ReplayEntry::Found(message) => assert_eq!(&message.body[..], b"second"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(entries[2], ReplayEntry::Missing(3));
        handle.stop().unwrap();
    }

    #[test]
    fn test_unknown_session_replays_as_missing() {
        let temp = TempDir::new().unwrap();
        let handle = Archiver::spawn(&config(temp.path())).unwrap();
        let entries = replay_all(handle.archive(), &SessionId::fixp(1), 1, 3);
        assert_eq!(
            entries,
            vec![
                ReplayEntry::Missing(1),
                ReplayEntry::Missing(2),
                ReplayEntry::Missing(3)
            ]
        );
    }

    #[test]
    fn test_archive_survives_restart() {
        let temp = TempDir::new().unwrap();
        let id = SessionId::fixp(5);
        {
            let handle = Archiver::spawn(&config(temp.path())).unwrap();
            handle.try_archive(request(&id, 1, b"kept")).unwrap();
            assert_eq!(wait_for_acks(&handle, 1).len(), 1);
            handle.stop().unwrap();
        }

        let handle = Archiver::spawn(&config(temp.path())).unwrap();
        let entries = replay_all(handle.archive(), &id, 1, 1);
        assert!(matches!(&entries[0], ReplayEntry::Found(m) if &m.body[..] == b"kept"));
    }

    #[test]
    fn test_stop_drains_queued_requests() {
        let temp = TempDir::new().unwrap();
        let id = SessionId::fixp(9);
        let handle = Archiver::spawn(&config(temp.path())).unwrap();
        for seq_num in 1..=3 {
            handle.try_archive(request(&id, seq_num, b"queued")).unwrap();
        }
        assert!(!handle.is_full());
        handle.stop().unwrap();

        let archive = FileArchive::open(temp.path(), 8).unwrap();
        assert_eq!(archive.archived_through(&id, Direction::Outbound, 0), 3);
        assert_eq!(archive.archived_through(&id, Direction::Inbound, 0), 0);
    }
}
