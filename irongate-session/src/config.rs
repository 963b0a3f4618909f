/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Session configuration.
//!
//! This module provides the per-session protocol settings shared by FIX
//! sessions and FIXP connections. The engine builds one [`SessionConfig`]
//! from its configuration and shares it with every session.

use irongate_core::message::MsgType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// Default message types replaced by a gap fill when resent.
pub const DEFAULT_GAP_FILL_TYPES: [&str; 6] = ["A", "5", "2", "0", "1", "4"];

/// Set of message types that are gap filled instead of resent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapFillSet {
    codes: BTreeSet<String>,
}

impl GapFillSet {
    /// Creates a set from message type codes.
    #[must_use]
    pub fn new<I, S>(codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            codes: codes.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns true if messages of this type are gap filled.
    #[inline]
    #[must_use]
    pub fn contains(&self, msg_type: &MsgType) -> bool {
        self.codes.contains(msg_type.as_str())
    }

    /// Returns the number of message types in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.codes.len()
    }

    /// Returns true if nothing is gap filled by type.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }
}

impl Default for GapFillSet {
    fn default() -> Self {
        Self::new(DEFAULT_GAP_FILL_TYPES)
    }
}

/// Configuration shared by FIX sessions and FIXP connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Heartbeat interval used until the counterparty proposes one.
    pub heartbeat_interval: Duration,
    /// Extra time granted before a TestRequest is sent.
    pub test_request_grace: Duration,
    /// Whether an inbound Logon may reset sequence numbers.
    pub accept_reset_seq_num: bool,
    /// Disconnect connections that have not logged on or established in time.
    pub no_logon_timeout: Duration,
    /// Deadline for an asynchronous authentication decision.
    pub authentication_timeout: Duration,
    /// Deadline for asynchronous capability replies such as ownership.
    pub reply_timeout: Duration,
    /// Time to wait for the counterparty's Logout or Terminate.
    pub logout_timeout: Duration,
    /// Maximum number of queued resend requests per session.
    pub max_concurrent_replays: usize,
    /// Largest inbound gap answered with a ResendRequest.
    pub max_resend_range: u64,
    /// Largest FIXP RetransmitRequest count served.
    pub fixp_max_retransmission_range: u64,
    /// Message types gap filled on resend.
    pub gap_fill_types: GapFillSet,
    /// Whether inbound messages are archived.
    pub log_inbound: bool,
    /// Whether outbound messages are archived.
    pub log_outbound: bool,
    /// Upper bound of a cancel-on-disconnect window.
    pub cod_max_timeout: Duration,
    /// Sequence index given to sessions seen for the first time.
    pub initial_sequence_index: u32,
}

impl SessionConfig {
    /// Creates a configuration with the default values.
    #[must_use]
    pub fn new() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            test_request_grace: Duration::from_secs(1),
            accept_reset_seq_num: true,
            no_logon_timeout: Duration::from_secs(5),
            authentication_timeout: Duration::from_secs(60),
            reply_timeout: Duration::from_secs(10),
            logout_timeout: Duration::from_secs(10),
            max_concurrent_replays: 5,
            max_resend_range: 100_000,
            fixp_max_retransmission_range: u64::MAX,
            gap_fill_types: GapFillSet::default(),
            log_inbound: true,
            log_outbound: true,
            cod_max_timeout: Duration::from_secs(60),
            initial_sequence_index: irongate_core::types::INITIAL_SEQUENCE_INDEX,
        }
    }

    /// Sets the heartbeat interval.
    #[must_use]
    pub const fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Sets whether an inbound ResetSeqNumFlag is honoured.
    #[must_use]
    pub const fn with_accept_reset_seq_num(mut self, accept: bool) -> Self {
        self.accept_reset_seq_num = accept;
        self
    }

    /// Sets the no-logon disconnect timeout.
    #[must_use]
    pub const fn with_no_logon_timeout(mut self, timeout: Duration) -> Self {
        self.no_logon_timeout = timeout;
        self
    }

    /// Sets the authentication timeout.
    #[must_use]
    pub const fn with_authentication_timeout(mut self, timeout: Duration) -> Self {
        self.authentication_timeout = timeout;
        self
    }

    /// Sets the capability reply timeout.
    #[must_use]
    pub const fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Sets the logout timeout.
    #[must_use]
    pub const fn with_logout_timeout(mut self, timeout: Duration) -> Self {
        self.logout_timeout = timeout;
        self
    }

    /// Sets the maximum number of queued replays.
    #[must_use]
    pub const fn with_max_concurrent_replays(mut self, max: usize) -> Self {
        self.max_concurrent_replays = max;
        self
    }

    /// Sets the largest inbound gap that is requested for resend.
    #[must_use]
    pub const fn with_max_resend_range(mut self, range: u64) -> Self {
        self.max_resend_range = range;
        self
    }

    /// Sets the largest FIXP retransmission served.
    #[must_use]
    pub const fn with_fixp_max_retransmission_range(mut self, range: u64) -> Self {
        self.fixp_max_retransmission_range = range;
        self
    }

    /// Sets the gap-filled message types.
    #[must_use]
    pub fn with_gap_fill_types(mut self, types: GapFillSet) -> Self {
        self.gap_fill_types = types;
        self
    }

    /// Sets the logging switches.
    #[must_use]
    pub const fn with_logging(mut self, inbound: bool, outbound: bool) -> Self {
        self.log_inbound = inbound;
        self.log_outbound = outbound;
        self
    }

    /// Sets the cancel-on-disconnect ceiling.
    #[must_use]
    pub const fn with_cod_max_timeout(mut self, timeout: Duration) -> Self {
        self.cod_max_timeout = timeout;
        self
    }

    /// Sets the sequence index of new sessions.
    #[must_use]
    pub const fn with_initial_sequence_index(mut self, index: u32) -> Self {
        self.initial_sequence_index = index;
        self
    }

    /// Returns the heartbeat interval in seconds.
    #[must_use]
    pub const fn heartbeat_interval_secs(&self) -> u64 {
        self.heartbeat_interval.as_secs()
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new()
    }
}
