/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Append-only archive stream.
//!
//! Every logged message is appended to a single archive file. The byte offset
//! of an entry is its stream position, which the replay index records.
//!
//! ```text
//! entry header (40 bytes):
//!   [4: magic][4: entry length][8: session key][8: sequence number]
//!   [4: sequence index][1: direction][1: reserved][2: msg type length]
//!   [4: crc32 of header[0..32] + msg type + body][4: reserved]
//! followed by the msg type bytes and the body bytes
//! ```

use crate::traits::ArchivedMessage;
use bytes::Bytes;
use irongate_core::error::StoreError;
use irongate_core::message::MsgType;
use irongate_core::types::Direction;
use num_traits::FromPrimitive;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const MAGIC: u32 = 0x4947_4152;
/// Size of the fixed entry header in bytes.
pub const ENTRY_HEADER_LEN: usize = 40;
const CRC_OFFSET: usize = 32;

/// A message to append to the archive.
#[derive(Debug, Clone, Copy)]
pub struct ArchiveEntry<'a> {
    /// Persistence key of the owning session.
    pub session_key: u64,
    /// Direction of the message.
    pub direction: Direction,
    /// Epoch of the sequence number.
    pub sequence_index: u32,
    /// Sequence number of the message.
    pub seq_num: u64,
    /// Message type.
    pub msg_type: &'a MsgType,
    /// Encoded message bytes.
    pub body: &'a [u8],
}

/// Header fields of an archived entry, as read back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHeader {
    /// Total entry length including the header.
    pub length: u32,
    /// Persistence key of the owning session.
    pub session_key: u64,
    /// Sequence number.
    pub seq_num: u64,
    /// Epoch of the sequence number.
    pub sequence_index: u32,
    /// Direction of the message.
    pub direction: Direction,
}

fn encode_entry(entry: &ArchiveEntry<'_>) -> Vec<u8> {
    let msg_type = entry.msg_type.as_str().as_bytes();
    let length = ENTRY_HEADER_LEN + msg_type.len() + entry.body.len();
    let mut buf = Vec::with_capacity(length);
    buf.extend_from_slice(&MAGIC.to_le_bytes());
    buf.extend_from_slice(&(length as u32).to_le_bytes());
    buf.extend_from_slice(&entry.session_key.to_le_bytes());
    buf.extend_from_slice(&entry.seq_num.to_le_bytes());
    buf.extend_from_slice(&entry.sequence_index.to_le_bytes());
    buf.push(entry.direction as u8);
    buf.push(0);
    buf.extend_from_slice(&(msg_type.len() as u16).to_le_bytes());

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&buf[..CRC_OFFSET]);
    hasher.update(msg_type);
    hasher.update(entry.body);
    buf.extend_from_slice(&hasher.finalize().to_le_bytes());
    buf.extend_from_slice(&0u32.to_le_bytes());
    buf.extend_from_slice(msg_type);
    buf.extend_from_slice(entry.body);
    buf
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(raw)
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(raw)
}

/// Parses the fixed header. Returns `None` if it is not a valid header.
fn parse_header(header: &[u8]) -> Option<(EntryHeader, usize, u32)> {
    if header.len() < ENTRY_HEADER_LEN || read_u32(header, 0) != MAGIC {
        return None;
    }
    let length = read_u32(header, 4);
    let msg_type_len = u16::from_le_bytes([header[30], header[31]]) as usize;
    if (length as usize) < ENTRY_HEADER_LEN + msg_type_len {
        return None;
    }
    let direction = Direction::from_u8(header[28])?;
    Some((
        EntryHeader {
            length,
            session_key: read_u64(header, 8),
            seq_num: read_u64(header, 16),
            sequence_index: read_u32(header, 24),
            direction,
        },
        msg_type_len,
        read_u32(header, CRC_OFFSET),
    ))
}

fn checksum(header: &[u8], rest: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&header[..CRC_OFFSET]);
    hasher.update(rest);
    hasher.finalize()
}

/// Writer side of the archive, owned by the archiver thread.
#[derive(Debug)]
pub struct ArchiveWriter {
    path: PathBuf,
    file: File,
    position: u64,
}

impl ArchiveWriter {
    /// Opens or creates the archive for appending.
    ///
    /// Entries left incomplete by a crash are truncated away, so the stream
    /// always ends on an entry boundary.
    ///
    /// # Errors
    /// Returns `StoreError::Io` if the file cannot be opened or repaired.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| StoreError::io(path, &e))?;

        let len = file.metadata().map_err(|e| StoreError::io(path, &e))?.len();
        let valid = scan_valid_prefix(&mut file, len).map_err(|e| StoreError::io(path, &e))?;
        if valid < len {
            warn!(
                path = %path.display(),
                valid,
                len,
                "truncating incomplete archive tail"
            );
            file.set_len(valid).map_err(|e| StoreError::io(path, &e))?;
        }
        file.seek(SeekFrom::Start(valid))
            .map_err(|e| StoreError::io(path, &e))?;
        info!(path = %path.display(), position = valid, "archive opened");

        Ok(Self {
            path: path.to_path_buf(),
            file,
            position: valid,
        })
    }

    /// Returns the position the next entry will be written at.
    #[must_use]
    pub const fn position(&self) -> u64 {
        self.position
    }

    /// Appends an entry without syncing it.
    ///
    /// # Returns
    /// The stream position and length of the written entry.
    ///
    /// # Errors
    /// Returns `StoreError::Io` if the write fails.
    pub fn append(&mut self, entry: &ArchiveEntry<'_>) -> Result<(u64, u32), StoreError> {
        let buf = encode_entry(entry);
        self.file
            .write_all(&buf)
            .map_err(|e| StoreError::io(&self.path, &e))?;
        let position = self.position;
        self.position += buf.len() as u64;
        Ok((position, buf.len() as u32))
    }

    /// Makes every appended entry durable.
    ///
    /// # Errors
    /// Returns `StoreError::Io` if the sync fails.
    pub fn sync(&mut self) -> Result<(), StoreError> {
        self.file
            .sync_data()
            .map_err(|e| StoreError::io(&self.path, &e))
    }
}

/// Walks the archive from the start and returns the length of the valid prefix.
fn scan_valid_prefix(file: &mut File, len: u64) -> std::io::Result<u64> {
    let mut position = 0u64;
    let mut header = [0u8; ENTRY_HEADER_LEN];
    file.seek(SeekFrom::Start(0))?;
    while position + ENTRY_HEADER_LEN as u64 <= len {
        file.read_exact(&mut header)?;
        let Some((parsed, _, crc)) = parse_header(&header) else {
            break;
        };
        let end = position + u64::from(parsed.length);
        if end > len {
            break;
        }
        let mut rest = vec![0u8; parsed.length as usize - ENTRY_HEADER_LEN];
        file.read_exact(&mut rest)?;
        if checksum(&header, &rest) != crc {
            break;
        }
        position = end;
    }
    Ok(position)
}

/// Reader side of the archive, used by replays on the framer thread.
#[derive(Debug)]
pub struct ArchiveReader {
    path: PathBuf,
    file: Mutex<File>,
}

impl ArchiveReader {
    /// Opens the archive for reading.
    ///
    /// # Errors
    /// Returns `StoreError::Io` if the file cannot be opened.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let file = File::open(path).map_err(|e| StoreError::io(path, &e))?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    /// Reads the entry at `position`.
    ///
    /// # Errors
    /// Returns `StoreError::NotFound` if no complete entry starts there and
    /// `StoreError::Corrupted` if its checksum does not match.
    pub fn read(&self, position: u64) -> Result<(EntryHeader, ArchivedMessage), StoreError> {
        let mut file = self.file.lock();
        let mut header = [0u8; ENTRY_HEADER_LEN];
        file.seek(SeekFrom::Start(position))
            .map_err(|e| StoreError::io(&self.path, &e))?;
        if file.read_exact(&mut header).is_err() {
            return Err(StoreError::NotFound { position });
        }
        let Some((parsed, msg_type_len, crc)) = parse_header(&header) else {
            return Err(StoreError::NotFound { position });
        };

        let mut rest = vec![0u8; parsed.length as usize - ENTRY_HEADER_LEN];
        if file.read_exact(&mut rest).is_err() {
            return Err(StoreError::NotFound { position });
        }
        if checksum(&header, &rest) != crc {
            return Err(StoreError::corrupted(
                &self.path,
                format!("archive entry checksum mismatch at position {position}"),
            ));
        }

        let msg_type = String::from_utf8_lossy(&rest[..msg_type_len])
            .parse::<MsgType>()
            .unwrap_or_else(|never| match never {});
        let mut rest = Bytes::from(rest);
        let body = rest.split_off(msg_type_len);
        Ok((
            parsed,
            ArchivedMessage {
                seq_num: parsed.seq_num,
                msg_type,
                body,
            },
        ))
    }
}
