/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Session lifecycle states.
//!
//! A FIX session moves through
//! `Connected → LoggingOn/AwaitingAuthentication → Active →
//! {AwaitingResend, AwaitingLogout} → Disconnected → Unbound`.
//! A session that ends while the publication is backpressured passes
//! through `LoggingOut` (FIXP: `Closing`) until its last message is out.
//! A FIXP connection additionally negotiates before it establishes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// State of a FIX session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    /// Transport connected, no Logon yet.
    Connected,
    /// Initiator sent its Logon and waits for the reply.
    LoggingOn,
    /// Acceptor waits for an asynchronous authentication decision.
    AwaitingAuthentication,
    /// Logged on and in sequence.
    Active,
    /// Logged on, waiting for the counterparty to fill an inbound gap.
    AwaitingResend,
    /// Logout sent, waiting for the counterparty's Logout.
    AwaitingLogout,
    /// A session-ending Logout waits for the publication.
    LoggingOut,
    /// Ended; the transport is about to be closed.
    Disconnected,
    /// Released from its connection. Terminal.
    Unbound,
}

impl SessionState {
    /// Returns the state name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connected => "Connected",
            Self::LoggingOn => "LoggingOn",
            Self::AwaitingAuthentication => "AwaitingAuthentication",
            Self::Active => "Active",
            Self::AwaitingResend => "AwaitingResend",
            Self::AwaitingLogout => "AwaitingLogout",
            Self::LoggingOut => "LoggingOut",
            Self::Disconnected => "Disconnected",
            Self::Unbound => "Unbound",
        }
    }

    /// Returns true once the Logon exchange completed.
    #[inline]
    #[must_use]
    pub const fn is_logged_on(self) -> bool {
        matches!(
            self,
            Self::Active | Self::AwaitingResend | Self::AwaitingLogout
        )
    }

    /// Returns true if application messages may be sent.
    #[inline]
    #[must_use]
    pub const fn can_send_application(self) -> bool {
        matches!(self, Self::Active | Self::AwaitingResend)
    }

    /// Returns true if the session has ended.
    #[inline]
    #[must_use]
    pub const fn is_ended(self) -> bool {
        matches!(self, Self::Disconnected | Self::Unbound)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of a FIXP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FixPState {
    /// Transport connected, nothing negotiated.
    Connected,
    /// A Negotiate or Establish awaits authentication or ownership.
    Handshaking,
    /// Negotiated, waiting for Establish.
    Negotiated,
    /// Established; application traffic flows.
    Established,
    /// Terminate sent, waiting for the counterparty's Terminate.
    Terminating,
    /// A connection-ending Terminate or reject waits for the publication.
    Closing,
    /// Ended; the transport is about to be closed.
    Disconnected,
    /// Released from its connection. Terminal.
    Unbound,
}

impl FixPState {
    /// Returns the state name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connected => "Connected",
            Self::Handshaking => "Handshaking",
            Self::Negotiated => "Negotiated",
            Self::Established => "Established",
            Self::Terminating => "Terminating",
            Self::Closing => "Closing",
            Self::Disconnected => "Disconnected",
            Self::Unbound => "Unbound",
        }
    }

    /// Returns true if the connection has ended.
    #[inline]
    #[must_use]
    pub const fn is_ended(self) -> bool {
        matches!(self, Self::Disconnected | Self::Unbound)
    }

    /// Returns true if inbound messages are still processed.
    #[inline]
    #[must_use]
    pub const fn accepts_input(self) -> bool {
        !matches!(self, Self::Closing | Self::Disconnected | Self::Unbound)
    }
}

impl fmt::Display for FixPState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
