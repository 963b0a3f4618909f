/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Capabilities injected into sessions.
//!
//! Everything a session needs from the outside world (authentication,
//! ownership arbitration, outbound publication and application callbacks)
//! arrives through these traits. All of them are called on the framer
//! thread; asynchronous answers come back as a [`Reply`].

use crate::cod::CodContext;
use crate::reply::Reply;
use bytes::Bytes;
use irongate_core::error::{EncodeError, SessionError};
use irongate_core::message::{MsgType, OutboundFrame};
use irongate_core::types::{ConnectionId, SessionId};
use std::fmt;
use thiserror::Error;

/// The publication cannot take the frame right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("publication backpressured")]
pub struct Backpressure;

/// Why a publication did not take a frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    /// Not now; the caller keeps the frame and retries.
    #[error("publication backpressured")]
    Backpressure,

    /// The codec cannot encode the frame. Retrying will not help.
    #[error("frame could not be encoded: {0}")]
    Encode(#[from] EncodeError),
}

impl From<Backpressure> for PublishError {
    fn from(_: Backpressure) -> Self {
        Self::Backpressure
    }
}

/// Stream a frame belongs to.
#[derive(Debug, Clone, Copy)]
pub struct PublishContext<'a> {
    /// Connection the frame is written to.
    pub connection_id: ConnectionId,
    /// Owning session, once known.
    pub session_id: Option<&'a SessionId>,
    /// Epoch of the frame's sequence number.
    pub sequence_index: u32,
}

/// Non-blocking outbound sink.
pub trait Publication {
    /// Publishes a frame.
    ///
    /// # Errors
    /// Returns [`PublishError::Backpressure`] if the frame was not taken;
    /// the caller keeps it and retries on a later duty cycle.
    /// [`PublishError::Encode`] means the frame never reached the wire and
    /// its sequence number must not be consumed.
    fn publish(
        &mut self,
        context: &PublishContext<'_>,
        frame: &OutboundFrame<'_>,
    ) -> Result<(), PublishError>;

    /// Records an inbound application message accepted in sequence.
    fn record_inbound(
        &mut self,
        _context: &PublishContext<'_>,
        _seq_num: u64,
        _msg_type: &MsgType,
        _body: &Bytes,
    ) {
    }
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// We initiated a Logout or Terminate that was answered or timed out.
    LocalLogout,
    /// The counterparty initiated a Logout or Terminate.
    RemoteLogout,
    /// The transport closed without a session-level goodbye.
    TransportClosed,
    /// A session-fatal protocol error.
    Error(SessionError),
}

impl DisconnectReason {
    /// Returns true if the session ended with an orderly goodbye.
    #[must_use]
    pub const fn is_orderly(&self) -> bool {
        matches!(self, Self::LocalLogout | Self::RemoteLogout)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalLogout => f.write_str("local logout"),
            Self::RemoteLogout => f.write_str("remote logout"),
            Self::TransportClosed => f.write_str("transport closed"),
            Self::Error(e) => write!(f, "{e}"),
        }
    }
}

/// Application callbacks.
pub trait SessionHandler {
    /// Called once a session is logged on or established.
    fn on_established(&mut self, _session_id: &SessionId, _connection_id: ConnectionId) {}

    /// Called for every application message, in sequence order.
    fn on_message(&mut self, session_id: &SessionId, seq_num: u64, msg_type: &MsgType, body: &Bytes);

    /// Called when a bound session ends.
    fn on_disconnect(&mut self, _session_id: &SessionId, _reason: &DisconnectReason) {}
}

/// Data an authentication strategy decides on.
#[derive(Debug, Clone, Copy)]
pub struct AuthenticationContext<'a> {
    /// Connection the request arrived on.
    pub connection_id: ConnectionId,
    /// Session being logged on.
    pub session_id: &'a SessionId,
    /// FIX Username, if present.
    pub username: Option<&'a str>,
    /// FIX Password, if present.
    pub password: Option<&'a str>,
    /// FIXP credentials, if present.
    pub credentials: Option<&'a Bytes>,
}

/// Final authentication answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Credentials accepted.
    Accept,
    /// Credentials rejected with a reason.
    Reject(String),
}

/// Answer of [`AuthenticationStrategy::authenticate`].
#[derive(Debug)]
pub enum AuthDecision {
    /// Accepted immediately.
    Accept,
    /// Rejected immediately.
    Reject(String),
    /// Decided later through the reply.
    Pending(Reply<AuthOutcome>),
}

/// Decides whether a logon or negotiate is authentic.
pub trait AuthenticationStrategy {
    /// Authenticates a logon or negotiate.
    fn authenticate(&mut self, context: &AuthenticationContext<'_>) -> AuthDecision;
}

/// Accepts every logon.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl AuthenticationStrategy for AcceptAll {
    fn authenticate(&mut self, _context: &AuthenticationContext<'_>) -> AuthDecision {
        AuthDecision::Accept
    }
}

/// Identity presented by a FIXP Negotiate or Establish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiationContext {
    /// Connection the request arrived on.
    pub connection_id: ConnectionId,
    /// FIXP session id.
    pub session_id: u64,
    /// FIXP session version id.
    pub session_ver_id: u64,
    /// Entering firm, if present.
    pub entering_firm: Option<String>,
    /// Client request timestamp in nanoseconds.
    pub request_timestamp_nanos: u64,
    /// Opaque credentials.
    pub credentials: Option<Bytes>,
}

/// Final ownership answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnershipStatus {
    /// This engine owns the session.
    Owned,
    /// The session belongs elsewhere.
    Rejected(String),
}

/// Answer of [`ConnectionOwnership::connection_exists`].
#[derive(Debug)]
pub enum OwnershipDecision {
    /// Owned, proceed.
    Owned,
    /// Rejected immediately.
    Rejected(String),
    /// Decided later through the reply.
    Pending(Reply<OwnershipStatus>),
}

/// Arbitrates which engine or library owns a FIXP session.
pub trait ConnectionOwnership {
    /// Called for every Negotiate and re-establish.
    fn connection_exists(&mut self, context: &NegotiationContext) -> OwnershipDecision;
}

/// Owns every session.
#[derive(Debug, Clone, Copy, Default)]
pub struct OwnAll;

impl ConnectionOwnership for OwnAll {
    fn connection_exists(&mut self, _context: &NegotiationContext) -> OwnershipDecision {
        OwnershipDecision::Owned
    }
}

/// Observes messages resent from the archive.
pub trait RetransmitObserver {
    /// Called for every original message resent.
    fn on_retransmitted_message(&mut self, msg_type: &MsgType, bytes: &Bytes);
}

/// Ignores retransmissions.
#[derive(Debug, Clone, Copy, Default)]
pub struct IgnoreRetransmits;

impl RetransmitObserver for IgnoreRetransmits {
    fn on_retransmitted_message(&mut self, _msg_type: &MsgType, _bytes: &Bytes) {}
}

/// Receives cancel-on-disconnect timeouts.
pub trait CancelOnDisconnectHandler {
    /// Called exactly once per armed timeout that was not cancelled.
    fn on_cancel_on_disconnect_timeout(&mut self, session_id: &SessionId, context: &CodContext);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reply::{ReplyPoll, reply_channel};
    use std::time::Instant;

    #[test]
    fn test_disconnect_reason_display() {
        let reason = DisconnectReason::Error(SessionError::MsgSeqNumTooLow {
            expected: 5,
            received: 3,
        });
        assert_eq!(
            reason.to_string(),
            "MsgSeqNum too low, expecting 5 but received 3"
        );
        assert!(!reason.is_orderly());
        assert!(DisconnectReason::RemoteLogout.is_orderly());
    }

    #[test]
    fn test_publish_error_from_backpressure() {
        assert_eq!(PublishError::from(Backpressure), PublishError::Backpressure);
        let err = PublishError::from(EncodeError::Unsupported("Logon".to_string()));
        assert_eq!(
            err.to_string(),
            "frame could not be encoded: unsupported frame: Logon"
        );
    }

    #[test]
    fn test_pending_authentication_completes() {
        struct Deferred(Option<crate::reply::Responder<AuthOutcome>>);
        impl AuthenticationStrategy for Deferred {
            fn authenticate(&mut self, _context: &AuthenticationContext<'_>) -> AuthDecision {
                let (responder, reply) = reply_channel();
                self.0 = Some(responder);
                AuthDecision::Pending(reply)
            }
        }

        let id = SessionId::fixp(1);
        let mut strategy = Deferred(None);
        let decision = strategy.authenticate(&AuthenticationContext {
            connection_id: ConnectionId(1),
            session_id: &id,
            username: None,
            password: None,
            credentials: None,
        });
        let AuthDecision::Pending(mut reply) = decision else {
            panic!("expected pending decision");
        };
        strategy.0.take().unwrap().send(AuthOutcome::Accept).unwrap();
        assert_eq!(reply.poll(Instant::now()), ReplyPoll::Ready(AuthOutcome::Accept));
    }
}
