/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Core types shared by every IronGate crate.
//!
//! - [`SeqNum`]: Session-layer sequence number
//! - [`Timestamp`]: Epoch timestamp with nanosecond precision
//! - [`CompId`]: Component identifier (SenderCompID, TargetCompID)
//! - [`SessionId`]: Stable composite identity of a FIX or FIXP session
//! - [`Direction`]: Inbound or outbound message flow
//! - [`CancelOnDisconnectType`]: Cancel-on-disconnect policy carried on logon/establish

use arrayvec::ArrayString;
use chrono::{DateTime, Utc};
use num_derive::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use xxhash_rust::xxh3::xxh3_64;

/// Maximum length for CompID strings in bytes.
pub const COMP_ID_MAX_LEN: usize = 32;

/// Sequence index assigned to a session that has never been reset.
pub const INITIAL_SEQUENCE_INDEX: u32 = 0;

/// Session-layer message sequence number.
///
/// Sequence numbers start at 1 and increment for each sequenced message.
/// The value 0 means "nothing sent or received yet".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct SeqNum(u64);

impl SeqNum {
    /// Creates a new sequence number.
    ///
    /// # Arguments
    /// * `value` - The sequence number value
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw sequence number value.
    #[inline]
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Returns the next sequence number.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Checks if this sequence number is valid (>= 1).
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 >= 1
    }
}

impl Default for SeqNum {
    fn default() -> Self {
        Self(1)
    }
}

impl From<u64> for SeqNum {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<SeqNum> for u64 {
    fn from(seq: SeqNum) -> Self {
        seq.0
    }
}

impl fmt::Display for SeqNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Timestamp with nanosecond precision.
///
/// Used for FIXP request timestamps and for the engine liveness marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    /// Nanoseconds since Unix epoch (1970-01-01 00:00:00 UTC).
    nanos_since_epoch: u64,
}

impl Timestamp {
    /// Creates a timestamp from nanoseconds since Unix epoch.
    ///
    /// # Arguments
    /// * `nanos` - Nanoseconds since 1970-01-01 00:00:00 UTC
    #[inline]
    #[must_use]
    pub const fn from_nanos(nanos: u64) -> Self {
        Self {
            nanos_since_epoch: nanos,
        }
    }

    /// Creates a timestamp from milliseconds since Unix epoch.
    ///
    /// # Arguments
    /// * `millis` - Milliseconds since 1970-01-01 00:00:00 UTC
    #[inline]
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self {
            nanos_since_epoch: millis * 1_000_000,
        }
    }

    /// Returns the current UTC timestamp.
    #[inline]
    #[must_use]
    pub fn now() -> Self {
        let dt = Utc::now();
        Self {
            nanos_since_epoch: dt.timestamp_nanos_opt().unwrap_or(0) as u64,
        }
    }

    /// Returns nanoseconds since Unix epoch.
    #[inline]
    #[must_use]
    pub const fn as_nanos(self) -> u64 {
        self.nanos_since_epoch
    }

    /// Returns milliseconds since Unix epoch.
    #[inline]
    #[must_use]
    pub const fn as_millis(self) -> u64 {
        self.nanos_since_epoch / 1_000_000
    }

    /// Converts to a chrono `DateTime<Utc>`.
    #[must_use]
    pub fn to_datetime(self) -> DateTime<Utc> {
        DateTime::from_timestamp_nanos(self.nanos_since_epoch as i64)
    }

    /// Formats the timestamp with millisecond precision.
    ///
    /// Format: `YYYYMMDD-HH:MM:SS.sss`
    #[must_use]
    pub fn format_millis(self) -> ArrayString<21> {
        let dt = self.to_datetime();
        let mut buf = ArrayString::new();
        let _ = std::fmt::write(
            &mut buf,
            format_args!("{}", dt.format("%Y%m%d-%H:%M:%S%.3f")),
        );
        buf
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Self::now()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format_millis())
    }
}

/// Component identifier for FIX sessions.
///
/// Used for SenderCompID (tag 49), TargetCompID (tag 56) and the sub ids.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct CompId(ArrayString<COMP_ID_MAX_LEN>);

impl CompId {
    /// Creates a new CompId from a string slice.
    ///
    /// # Arguments
    /// * `s` - The component identifier string
    ///
    /// # Returns
    /// `Some(CompId)` if the string fits within the maximum length, `None` otherwise.
    #[must_use]
    pub fn new(s: &str) -> Option<Self> {
        ArrayString::from(s).ok().map(Self)
    }

    /// Returns the CompId as a string slice.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Returns true if the CompId is empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl AsRef<str> for CompId {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for CompId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CompId {
    type Err = arrayvec::CapacityError<()>;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ArrayString::try_from(s)
            .map(Self)
            .map_err(|_| arrayvec::CapacityError::new(()))
    }
}

/// Stable, process-independent identity of a session.
///
/// FIX sessions are identified by the counterparty identifiers as seen from
/// this engine. FIXP sessions are identified by the numeric session id; the
/// session version id is a qualifier tracked alongside the persisted record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionId {
    /// Textual FIX session.
    Fix {
        /// Our CompID (SenderCompID on outbound messages).
        local_comp_id: CompId,
        /// Counterparty CompID (TargetCompID on outbound messages).
        remote_comp_id: CompId,
        /// Optional local sub id.
        local_sub_id: Option<CompId>,
        /// Optional counterparty sub id.
        remote_sub_id: Option<CompId>,
    },
    /// Binary FIXP session.
    FixP {
        /// Counterparty assigned session identifier.
        session_id: u64,
    },
}

impl SessionId {
    /// Creates a FIX session id without sub ids.
    ///
    /// # Arguments
    /// * `local_comp_id` - Our CompID
    /// * `remote_comp_id` - The counterparty CompID
    #[must_use]
    pub const fn fix(local_comp_id: CompId, remote_comp_id: CompId) -> Self {
        Self::Fix {
            local_comp_id,
            remote_comp_id,
            local_sub_id: None,
            remote_sub_id: None,
        }
    }

    /// Creates a FIXP session id.
    #[must_use]
    pub const fn fixp(session_id: u64) -> Self {
        Self::FixP { session_id }
    }

    /// Returns true for FIXP sessions.
    #[inline]
    #[must_use]
    pub const fn is_fixp(&self) -> bool {
        matches!(self, Self::FixP { .. })
    }

    /// Encodes the identity as bytes that never change between processes.
    #[must_use]
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 * COMP_ID_MAX_LEN + 8);
        match self {
            Self::Fix {
                local_comp_id,
                remote_comp_id,
                local_sub_id,
                remote_sub_id,
            } => {
                out.extend_from_slice(b"FIX\0");
                for part in [
                    Some(local_comp_id),
                    Some(remote_comp_id),
                    local_sub_id.as_ref(),
                    remote_sub_id.as_ref(),
                ] {
                    if let Some(id) = part {
                        out.extend_from_slice(id.as_str().as_bytes());
                    }
                    out.push(0);
                }
            }
            Self::FixP { session_id } => {
                out.extend_from_slice(b"FIXP\0");
                out.extend_from_slice(&session_id.to_le_bytes());
            }
        }
        out
    }

    /// Returns the 64-bit key used to address persisted state for this session.
    ///
    /// Never returns 0, which marks an empty slot in the persisted tables.
    #[must_use]
    pub fn persistence_key(&self) -> u64 {
        match xxh3_64(&self.canonical_bytes()) {
            0 => 1,
            hash => hash,
        }
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fix {
                local_comp_id,
                remote_comp_id,
                local_sub_id,
                remote_sub_id,
            } => {
                write!(f, "{local_comp_id}")?;
                if let Some(sub) = local_sub_id {
                    write!(f, "/{sub}")?;
                }
                write!(f, "->{remote_comp_id}")?;
                if let Some(sub) = remote_sub_id {
                    write!(f, "/{sub}")?;
                }
                Ok(())
            }
            Self::FixP { session_id } => write!(f, "fixp:{session_id}"),
        }
    }
}

/// Identifier the transport assigns to an accepted or initiated connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Direction of a message relative to this engine.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    FromPrimitive,
    ToPrimitive,
)]
#[repr(u8)]
pub enum Direction {
    /// Received from the counterparty.
    Inbound = 1,
    /// Sent to the counterparty.
    Outbound = 2,
}

impl Direction {
    /// Returns the short lowercase name used in file names.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Inbound => "in",
            Self::Outbound => "out",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cancel-on-disconnect policy requested by the counterparty.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    FromPrimitive,
    ToPrimitive,
)]
#[repr(u8)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CancelOnDisconnectType {
    /// Cancel when the transport drops without a terminate.
    CancelOnDisconnectOnly = 0,
    /// Cancel when a terminate is exchanged.
    CancelOnTerminateOnly = 1,
    /// Cancel on either event.
    CancelOnDisconnectOrTerminate = 2,
    /// Never cancel.
    #[default]
    DoNotCancelOnDisconnectOrTerminate = 3,
}

impl CancelOnDisconnectType {
    /// Returns true if a transport disconnect should arm the timer.
    #[must_use]
    pub const fn cancels_on_disconnect(self) -> bool {
        matches!(
            self,
            Self::CancelOnDisconnectOnly | Self::CancelOnDisconnectOrTerminate
        )
    }

    /// Returns true if a terminate exchange should arm the timer.
    #[must_use]
    pub const fn cancels_on_terminate(self) -> bool {
        matches!(
            self,
            Self::CancelOnTerminateOnly | Self::CancelOnDisconnectOrTerminate
        )
    }
}
