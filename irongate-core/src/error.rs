/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Error types for the IronGate gateway.
//!
//! Errors are split by layer. [`SessionError`] values are session-fatal: the
//! offending session is logged out or terminated and the rest of the engine
//! keeps running. [`EngineError`] values stop the engine from starting.
//! Backpressure and missing replay entries are not errors at all.

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result type alias using [`GatewayError`] as the error type.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Top-level error type for all IronGate operations.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Error during message decoding.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Error during message encoding.
    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),

    /// Error in session layer operations.
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Error in the persistent stores.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Engine level failure.
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// I/O error from an underlying resource.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors reported by a codec while turning bytes into session messages.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Message buffer is incomplete, need more data.
    #[error("incomplete message, need more data")]
    Incomplete,

    /// The message type is not understood by the codec.
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    /// A field the session layer relies on is absent.
    #[error("missing required field: {field}")]
    MissingRequiredField {
        /// Name of the missing field.
        field: &'static str,
    },

    /// A field carries a value that cannot be interpreted.
    #[error("invalid value for {field}: {reason}")]
    InvalidFieldValue {
        /// Name of the field.
        field: &'static str,
        /// Description of why the value is invalid.
        reason: String,
    },
}

/// Errors reported by a codec while encoding an outbound frame.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Buffer capacity exceeded during encoding.
    #[error("buffer overflow: need {needed} bytes, have {available}")]
    BufferOverflow {
        /// Bytes needed to complete encoding.
        needed: usize,
        /// Bytes available in buffer.
        available: usize,
    },

    /// The codec does not support this frame.
    #[error("unsupported frame: {0}")]
    Unsupported(String),
}

/// Session-fatal conditions.
///
/// Every variant results in a Logout (FIX) or Terminate (FIXP) carrying the
/// `Display` text of the error as its reason.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Session is not in the correct state for the operation.
    #[error("invalid session state: expected {expected}, current {current}")]
    InvalidState {
        /// Expected state for the operation.
        expected: String,
        /// Current session state.
        current: String,
    },

    /// The authentication strategy rejected the logon or negotiate.
    #[error("authentication rejected: {reason}")]
    AuthenticationRejected {
        /// Reason given by the strategy.
        reason: String,
    },

    /// The authentication strategy did not answer in time.
    #[error("authentication timed out after {timeout_ms} ms")]
    AuthenticationTimeout {
        /// Configured authentication timeout.
        timeout_ms: u64,
    },

    /// A library-side reply (connection ownership) did not arrive in time.
    #[error("session reply timed out after {timeout_ms} ms")]
    SessionReplyTimeout {
        /// Configured reply timeout.
        timeout_ms: u64,
    },

    /// Received sequence number is lower than expected and not a duplicate.
    #[error("MsgSeqNum too low, expecting {expected} but received {received}")]
    MsgSeqNumTooLow {
        /// Next expected sequence number.
        expected: u64,
        /// Received sequence number.
        received: u64,
    },

    /// A gap-fill tried to move the expected sequence number backwards.
    #[error("invalid sequence reset: expected {expected}, new sequence number {new_seq_no}")]
    InvalidSequenceReset {
        /// Next expected sequence number.
        expected: u64,
        /// NewSeqNo carried by the reset.
        new_seq_no: u64,
    },

    /// The inbound gap is wider than the configured resend range.
    #[error("sequence gap too large: expected {expected}, received {received}, max range {max_range}")]
    GapTooLarge {
        /// Next expected sequence number.
        expected: u64,
        /// Received sequence number.
        received: u64,
        /// Configured maximum resend range.
        max_range: u64,
    },

    /// A retransmission request asked for more than the configured range.
    #[error("retransmission range {requested} exceeds maximum {max_range}")]
    RetransmissionRangeExceeded {
        /// Number of messages requested.
        requested: u64,
        /// Configured maximum.
        max_range: u64,
    },

    /// Too many resend requests are being serviced concurrently.
    #[error("too many concurrent resend requests, limit is {max_replays}")]
    ResendQueueOverflow {
        /// Configured maximum of concurrent replays.
        max_replays: usize,
    },

    /// The counterparty stopped answering heartbeats and test requests.
    #[error("heartbeat timeout after {elapsed_ms} ms")]
    HeartbeatTimeout {
        /// Time since the last inbound message.
        elapsed_ms: u64,
    },

    /// No logon (or establish) arrived in time on a new connection.
    #[error("no logon received within {timeout_ms} ms")]
    NoLogonTimeout {
        /// Configured no-logon timeout.
        timeout_ms: u64,
    },

    /// The logout or terminate handshake was not answered in time.
    #[error("logout not acknowledged within {timeout_ms} ms")]
    LogoutTimeout {
        /// Configured wait.
        timeout_ms: u64,
    },

    /// Another connection already owns this session.
    #[error("session {session} is already bound to another connection")]
    DuplicateSession {
        /// Display form of the session id.
        session: String,
    },

    /// No connection of this engine is bound to the session.
    #[error("session {session} is not bound to this engine")]
    UnknownSession {
        /// Display form of the session id.
        session: String,
    },

    /// An outbound frame could not be encoded.
    #[error("outbound encode failure: {0}")]
    Encode(#[from] EncodeError),

    /// The persistent stores failed underneath the session.
    #[error("store failure: {0}")]
    Store(#[from] StoreError),
}

/// Errors in the persistent stores.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A persisted file failed its integrity checks.
    #[error("store corrupted at {path}: {reason}")]
    Corrupted {
        /// File that failed validation.
        path: PathBuf,
        /// Description of the corruption.
        reason: String,
    },

    /// The fixed-capacity table has no free slot.
    #[error("store full: all {capacity} slots in use")]
    CapacityExceeded {
        /// Number of slots in the table.
        capacity: usize,
    },

    /// A save would move a counter backwards within the same sequence index.
    #[error(
        "sequence regression for {session}: {field} {stored} -> {attempted} in index {sequence_index}"
    )]
    SequenceRegression {
        /// Display form of the session id.
        session: String,
        /// Which counter regressed.
        field: &'static str,
        /// Value currently stored.
        stored: u64,
        /// Value that was rejected.
        attempted: u64,
        /// Sequence index of both values.
        sequence_index: u32,
    },

    /// A replay index append was not strictly increasing.
    #[error("out of order index append in index {sequence_index}: {last} then {attempted}")]
    OutOfOrder {
        /// Sequence index of the append.
        sequence_index: u32,
        /// Last appended sequence number.
        last: u64,
        /// Rejected sequence number.
        attempted: u64,
    },

    /// Nothing stored at the requested archive position.
    #[error("no archived message at position {position}")]
    NotFound {
        /// Requested stream position.
        position: u64,
    },

    /// Invalid parameters when creating a store.
    #[error("invalid store configuration: {0}")]
    InvalidConfiguration(String),

    /// I/O error in a persistent store.
    #[error("store i/o error at {path}: {reason}")]
    Io {
        /// File being accessed.
        path: PathBuf,
        /// Underlying error text.
        reason: String,
    },
}

impl StoreError {
    /// Wraps an I/O error together with the path it happened on.
    ///
    /// # Arguments
    /// * `path` - File being accessed
    /// * `error` - The underlying I/O error
    #[must_use]
    pub fn io(path: &Path, error: &std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            reason: error.to_string(),
        }
    }

    /// Builds a corruption error for the given file.
    #[must_use]
    pub fn corrupted(path: &Path, reason: impl Into<String>) -> Self {
        Self::Corrupted {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }
}

/// Errors that prevent the engine from starting or keep it from running.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Another engine refreshed the liveness marker recently.
    #[error("duplicate engine detected: {path} was modified {age_ms} ms ago")]
    DuplicateEngine {
        /// Liveness marker file.
        path: PathBuf,
        /// Age of the marker at startup.
        age_ms: u64,
    },

    /// The configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A store could not be opened or is corrupted.
    #[error("store failure: {0}")]
    Store(#[from] StoreError),

    /// The archiver thread is no longer running.
    #[error("archiver stopped: {0}")]
    ArchiverStopped(String),
}
