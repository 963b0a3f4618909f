/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! FIXP acceptor connection.
//!
//! A [`FixPConnection`] composes the generic connection machinery (sequence
//! numbers, keep-alive, retransmission, pending sends and terminate) with a
//! handshake sub-machine that walks a Negotiate or Establish through
//! authentication and ownership arbitration before it is answered. The
//! handshake is only reachable before the connection is established.

use crate::capability::{
    AuthDecision, AuthOutcome, AuthenticationContext, DisconnectReason, NegotiationContext,
    OwnershipDecision, OwnershipStatus, Publication, PublishContext, PublishError,
    RetransmitObserver,
};
use crate::cod::{CodConfig, CodTrigger};
use crate::config::SessionConfig;
use crate::heartbeat::HeartbeatManager;
use crate::replay::{self, ReplayItem, ReplayJob, ReplayProgress, ReplayQueue, ReplaySource};
use crate::reply::{Reply, ReplyPoll};
use crate::session::{SendOutcome, SessionContext, SessionSummary, millis};
use crate::sequence::{SequenceManager, SequenceResult};
use crate::state::FixPState;
use bytes::Bytes;
use irongate_core::error::SessionError;
use irongate_core::message::{
    CodRequest, EstablishRejectCode, FixPApplication, FixPMessage, MsgType, NegotiateRejectCode,
    OutboundFrame, RetransmitRejectCode, TerminationCode,
};
use irongate_core::types::{ConnectionId, SessionId};
use irongate_store::{SequenceNumberRecord, SequenceNumbers};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Publishes one replay item as FIXP frames.
fn emit_fixp_replay(
    publication: &mut dyn Publication,
    observer: &mut dyn RetransmitObserver,
    context: &PublishContext<'_>,
    item: ReplayItem<'_>,
) -> Result<(), PublishError> {
    match item {
        ReplayItem::Original(message) => {
            publication.publish(
                context,
                &OutboundFrame::Replay {
                    seq_num: message.seq_num,
                    msg_type: &message.msg_type,
                    body: &message.body,
                },
            )?;
            observer.on_retransmitted_message(&message.msg_type, &message.body);
        }
        ReplayItem::GapFill { new_seq_no, .. } => {
            let sequence = FixPMessage::Sequence {
                next_seq_no: new_seq_no,
            };
            publication.publish(context, &OutboundFrame::FixP(&sequence))?;
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeKind {
    Negotiate,
    Establish,
}

/// Identity fields echoed on every handshake answer.
#[derive(Debug, Clone, Copy)]
struct Identity {
    kind: HandshakeKind,
    session_id: u64,
    session_ver_id: u64,
    timestamp_nanos: u64,
}

impl Identity {
    fn of(request: &FixPMessage) -> Option<Self> {
        match *request {
            FixPMessage::Negotiate {
                session_id,
                session_ver_id,
                timestamp_nanos,
                ..
            } => Some(Self {
                kind: HandshakeKind::Negotiate,
                session_id,
                session_ver_id,
                timestamp_nanos,
            }),
            FixPMessage::Establish {
                session_id,
                session_ver_id,
                timestamp_nanos,
                ..
            } => Some(Self {
                kind: HandshakeKind::Establish,
                session_id,
                session_ver_id,
                timestamp_nanos,
            }),
            _ => None,
        }
    }

    fn rejection(
        &self,
        negotiate: NegotiateRejectCode,
        establish: EstablishRejectCode,
        reason: String,
    ) -> FixPMessage {
        match self.kind {
            HandshakeKind::Negotiate => FixPMessage::NegotiateReject {
                session_id: self.session_id,
                session_ver_id: self.session_ver_id,
                request_timestamp_nanos: self.timestamp_nanos,
                code: negotiate,
                reason,
            },
            HandshakeKind::Establish => FixPMessage::EstablishReject {
                session_id: self.session_id,
                session_ver_id: self.session_ver_id,
                request_timestamp_nanos: self.timestamp_nanos,
                code: establish,
                reason,
            },
        }
    }
}

fn negotiation_context(connection_id: ConnectionId, request: &FixPMessage) -> Option<NegotiationContext> {
    match request {
        FixPMessage::Negotiate {
            session_id,
            session_ver_id,
            entering_firm,
            timestamp_nanos,
            credentials,
        } => Some(NegotiationContext {
            connection_id,
            session_id: *session_id,
            session_ver_id: *session_ver_id,
            entering_firm: entering_firm.clone(),
            request_timestamp_nanos: *timestamp_nanos,
            credentials: credentials.clone(),
        }),
        FixPMessage::Establish {
            session_id,
            session_ver_id,
            timestamp_nanos,
            credentials,
            ..
        } => Some(NegotiationContext {
            connection_id,
            session_id: *session_id,
            session_ver_id: *session_ver_id,
            entering_firm: None,
            request_timestamp_nanos: *timestamp_nanos,
            credentials: credentials.clone(),
        }),
        _ => None,
    }
}

enum Handshake {
    Idle,
    Authenticating {
        request: FixPMessage,
        reply: Reply<AuthOutcome>,
    },
    AwaitingOwnership {
        request: FixPMessage,
        reply: Reply<OwnershipStatus>,
    },
}

/// Parameters of an Establish once its identity was checked.
#[derive(Debug, Clone, Copy)]
struct EstablishTerms {
    keep_alive_interval_ms: u64,
    next_seq_no: u64,
    cod: CodRequest,
}

/// A FIXP acceptor connection.
pub struct FixPConnection {
    connection_id: ConnectionId,
    config: Arc<SessionConfig>,
    state: FixPState,
    handshake: Handshake,
    session_id: Option<SessionId>,
    fixp_session_id: u64,
    session_ver_id: u64,
    previous_uuid: u64,
    sequence: SequenceManager,
    sequence_loaded: bool,
    established: bool,
    keepalive: HeartbeatManager,
    cod: CodConfig,
    connected_at: Instant,
    replays: ReplayQueue,
    pending: VecDeque<FixPMessage>,
    pending_app: VecDeque<(MsgType, Bytes)>,
    terminate_sent_at: Option<Instant>,
    disconnect: Option<DisconnectReason>,
}

impl FixPConnection {
    /// Creates a connection that waits for a Negotiate or Establish.
    #[must_use]
    pub fn acceptor(connection_id: ConnectionId, config: Arc<SessionConfig>, now: Instant) -> Self {
        Self {
            connection_id,
            state: FixPState::Connected,
            handshake: Handshake::Idle,
            session_id: None,
            fixp_session_id: 0,
            session_ver_id: 0,
            previous_uuid: 0,
            sequence: SequenceManager::new(config.initial_sequence_index),
            sequence_loaded: false,
            established: false,
            keepalive: HeartbeatManager::new(config.heartbeat_interval, Duration::ZERO, now),
            cod: CodConfig::default(),
            connected_at: now,
            replays: ReplayQueue::new(config.max_concurrent_replays),
            pending: VecDeque::new(),
            pending_app: VecDeque::new(),
            terminate_sent_at: None,
            disconnect: None,
            config,
        }
    }

    /// Returns the connection id.
    #[must_use]
    pub const fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Returns the session id once negotiated or re-established.
    #[must_use]
    pub const fn session_id(&self) -> Option<&SessionId> {
        self.session_id.as_ref()
    }

    /// Returns the session version id in use.
    #[must_use]
    pub const fn session_ver_id(&self) -> u64 {
        self.session_ver_id
    }

    /// Returns the current state.
    #[must_use]
    pub const fn state(&self) -> FixPState {
        self.state
    }

    /// Returns the sequence counters.
    #[must_use]
    pub const fn sequence(&self) -> &SequenceManager {
        &self.sequence
    }

    /// Returns the negotiated cancel-on-disconnect settings.
    #[must_use]
    pub const fn cod(&self) -> &CodConfig {
        &self.cod
    }

    /// Returns true while retransmissions are being serviced.
    #[must_use]
    pub fn is_replaying(&self) -> bool {
        !self.replays.is_empty()
    }

    /// Returns the reason the connection ended, once it has.
    #[must_use]
    pub const fn disconnect_reason(&self) -> Option<&DisconnectReason> {
        self.disconnect.as_ref()
    }

    /// Returns true once the transport should be closed.
    #[must_use]
    pub const fn wants_disconnect(&self) -> bool {
        matches!(self.state, FixPState::Disconnected)
    }

    /// Processes one inbound FIXP session message.
    pub fn on_message(&mut self, ctx: &mut SessionContext<'_>, message: FixPMessage) {
        if !self.state.accepts_input() {
            return;
        }
        self.keepalive.on_message_received(ctx.now, None);
        if let Err(e) = self.handle_message(ctx, message) {
            self.fail(ctx, e);
        }
    }

    /// Processes one inbound business message.
    pub fn on_application(&mut self, ctx: &mut SessionContext<'_>, message: FixPApplication) {
        if !self.state.accepts_input() {
            return;
        }
        self.keepalive.on_message_received(ctx.now, None);
        if let Err(e) = self.handle_application(ctx, message) {
            self.fail(ctx, e);
        }
    }

    /// Runs timers, retries queued output and services retransmissions.
    ///
    /// # Returns
    /// The amount of work done, zero when idle.
    pub fn poll(&mut self, ctx: &mut SessionContext<'_>) -> usize {
        if self.state.is_ended() {
            return 0;
        }
        match self.poll_inner(ctx) {
            Ok(work) => work,
            Err(e) => {
                self.fail(ctx, e);
                1
            }
        }
    }

    /// Sends a business message.
    ///
    /// # Errors
    /// Returns `SessionError::InvalidState` unless the connection is
    /// established, or `SessionError::Store` if staging fails.
    pub fn send_application(
        &mut self,
        ctx: &mut SessionContext<'_>,
        msg_type: MsgType,
        body: Bytes,
    ) -> Result<SendOutcome, SessionError> {
        if self.state != FixPState::Established {
            return Err(self.invalid_state("Established"));
        }
        if !self.replays.is_empty() || !self.pending.is_empty() || !self.pending_app.is_empty() {
            self.pending_app.push_back((msg_type, body));
            return Ok(SendOutcome::Queued);
        }
        match self.publish_application(ctx, &msg_type, &body)? {
            Some(seq_num) => Ok(SendOutcome::Sent(seq_num)),
            None => {
                self.pending_app.push_back((msg_type, body));
                Ok(SendOutcome::Queued)
            }
        }
    }

    /// Starts an orderly Terminate.
    ///
    /// # Errors
    /// Returns `SessionError::InvalidState` unless the connection is
    /// negotiated or established.
    pub fn initiate_terminate(
        &mut self,
        ctx: &mut SessionContext<'_>,
        reason: impl Into<String>,
    ) -> Result<(), SessionError> {
        if !matches!(self.state, FixPState::Negotiated | FixPState::Established) {
            return Err(self.invalid_state("Established"));
        }
        let terminate = FixPMessage::Terminate {
            session_id: self.fixp_session_id,
            session_ver_id: self.session_ver_id,
            code: TerminationCode::Finished,
            reason: reason.into(),
        };
        self.send(ctx, terminate)?;
        self.state = FixPState::Terminating;
        self.terminate_sent_at = Some(ctx.now);
        info!(connection = %self.connection_id, session_id = self.fixp_session_id, "terminate sent");
        Ok(())
    }

    /// Unbinds the connection after its transport closed.
    ///
    /// # Returns
    /// A summary for the registry if the connection had been established.
    pub fn on_disconnect(&mut self, ctx: &mut SessionContext<'_>) -> Option<SessionSummary> {
        if self.state == FixPState::Unbound {
            return None;
        }
        let reason = self
            .disconnect
            .take()
            .unwrap_or(DisconnectReason::TransportClosed);
        if self.sequence_loaded
            && let Err(e) = self.save(ctx)
        {
            warn!(connection = %self.connection_id, error = %e, "failed to save sequence numbers on disconnect");
        }
        self.state = FixPState::Unbound;
        self.handshake = Handshake::Idle;
        self.replays.clear();
        self.pending.clear();
        self.pending_app.clear();

        let session_id = self.session_id.clone()?;
        info!(session = %session_id, connection = %self.connection_id, %reason, "fixp connection unbound");
        if !self.established {
            return None;
        }
        ctx.handler.on_disconnect(&session_id, &reason);
        Some(SessionSummary {
            session_id,
            connection_id: self.connection_id,
            last_sent: self.sequence.last_sent(),
            last_received: self.sequence.last_received(),
            sequence_index: self.sequence.sequence_index(),
            session_ver_id: self.session_ver_id,
            cod: self.cod,
            trigger: if reason.is_orderly() {
                CodTrigger::Terminate
            } else {
                CodTrigger::Disconnect
            },
            reason,
        })
    }

    fn invalid_state(&self, expected: &str) -> SessionError {
        SessionError::InvalidState {
            expected: expected.to_string(),
            current: self.state.as_str().to_string(),
        }
    }

    fn handle_message(
        &mut self,
        ctx: &mut SessionContext<'_>,
        message: FixPMessage,
    ) -> Result<(), SessionError> {
        match (self.state, message) {
            (
                FixPState::Connected,
                request @ (FixPMessage::Negotiate { .. } | FixPMessage::Establish { .. }),
            ) => self.begin_handshake(ctx, request),
            (FixPState::Handshaking, message) => {
                debug!(connection = %self.connection_id, msg_type = %message.msg_type(), "message during handshake dropped");
                Ok(())
            }
            (
                FixPState::Negotiated,
                request @ FixPMessage::Establish {
                    keep_alive_interval_ms,
                    next_seq_no,
                    cod,
                    ..
                },
            ) => {
                let Some(identity) = Identity::of(&request) else {
                    return Ok(());
                };
                if identity.session_id != self.fixp_session_id
                    || identity.session_ver_id != self.session_ver_id
                {
                    let error = SessionError::InvalidState {
                        expected: format!("session {} version {}", self.fixp_session_id, self.session_ver_id),
                        current: format!("session {} version {}", identity.session_id, identity.session_ver_id),
                    };
                    self.reject(ctx, identity, NegotiateRejectCode::InvalidSessionVerId, EstablishRejectCode::InvalidSessionVerId, error);
                    return Ok(());
                }
                self.complete_establish(
                    ctx,
                    identity,
                    EstablishTerms {
                        keep_alive_interval_ms,
                        next_seq_no,
                        cod,
                    },
                )
            }
            (
                FixPState::Negotiated | FixPState::Established | FixPState::Terminating,
                request @ FixPMessage::Negotiate { .. },
            ) => {
                if let Some(identity) = Identity::of(&request) {
                    self.send(
                        ctx,
                        identity.rejection(
                            NegotiateRejectCode::AlreadyNegotiated,
                            EstablishRejectCode::Unspecified,
                            "already negotiated".to_string(),
                        ),
                    )?;
                }
                Ok(())
            }
            (
                FixPState::Established | FixPState::Terminating,
                request @ FixPMessage::Establish { .. },
            ) => {
                if let Some(identity) = Identity::of(&request) {
                    self.send(
                        ctx,
                        identity.rejection(
                            NegotiateRejectCode::Unspecified,
                            EstablishRejectCode::AlreadyEstablished,
                            "already established".to_string(),
                        ),
                    )?;
                }
                Ok(())
            }
            (
                FixPState::Established | FixPState::Terminating,
                FixPMessage::Sequence { next_seq_no },
            ) => self.on_sequence(ctx, next_seq_no),
            (
                FixPState::Established,
                FixPMessage::RetransmitRequest {
                    from_seq_no,
                    count,
                    timestamp_nanos,
                    ..
                },
            ) => self.on_retransmit_request(ctx, from_seq_no, count, timestamp_nanos),
            (
                FixPState::Negotiated | FixPState::Established | FixPState::Terminating,
                FixPMessage::Terminate { code, reason, .. },
            ) => {
                self.on_terminate(ctx, code, &reason);
                Ok(())
            }
            (state, message) => {
                debug!(
                    connection = %self.connection_id,
                    %state,
                    msg_type = %message.msg_type(),
                    "unexpected fixp message ignored"
                );
                Ok(())
            }
        }
    }

    fn begin_handshake(
        &mut self,
        ctx: &mut SessionContext<'_>,
        request: FixPMessage,
    ) -> Result<(), SessionError> {
        let (Some(identity), Some(negotiation)) = (
            Identity::of(&request),
            negotiation_context(self.connection_id, &request),
        ) else {
            return Ok(());
        };
        let session_id = SessionId::fixp(identity.session_id);
        let decision = ctx.authentication.authenticate(&AuthenticationContext {
            connection_id: self.connection_id,
            session_id: &session_id,
            username: None,
            password: None,
            credentials: negotiation.credentials.as_ref(),
        });
        match decision {
            AuthDecision::Accept => self.check_ownership(ctx, request),
            AuthDecision::Reject(reason) => {
                self.reject(
                    ctx,
                    identity,
                    NegotiateRejectCode::Credentials,
                    EstablishRejectCode::Credentials,
                    SessionError::AuthenticationRejected { reason },
                );
                Ok(())
            }
            AuthDecision::Pending(reply) => {
                let deadline = ctx.now + self.config.authentication_timeout;
                self.handshake = Handshake::Authenticating {
                    request,
                    reply: reply.with_deadline(deadline),
                };
                self.state = FixPState::Handshaking;
                debug!(connection = %self.connection_id, session_id = identity.session_id, "awaiting authentication");
                Ok(())
            }
        }
    }

    fn check_ownership(
        &mut self,
        ctx: &mut SessionContext<'_>,
        request: FixPMessage,
    ) -> Result<(), SessionError> {
        let (Some(identity), Some(negotiation)) = (
            Identity::of(&request),
            negotiation_context(self.connection_id, &request),
        ) else {
            return Ok(());
        };
        match ctx.ownership.connection_exists(&negotiation) {
            OwnershipDecision::Owned => self.finish_handshake(ctx, request),
            OwnershipDecision::Rejected(reason) => {
                self.reject_ownership(ctx, identity, reason);
                Ok(())
            }
            OwnershipDecision::Pending(reply) => {
                let deadline = ctx.now + self.config.reply_timeout;
                self.handshake = Handshake::AwaitingOwnership {
                    request,
                    reply: reply.with_deadline(deadline),
                };
                self.state = FixPState::Handshaking;
                Ok(())
            }
        }
    }

    fn finish_handshake(
        &mut self,
        ctx: &mut SessionContext<'_>,
        request: FixPMessage,
    ) -> Result<(), SessionError> {
        let Some(identity) = Identity::of(&request) else {
            return Ok(());
        };
        match request {
            FixPMessage::Negotiate { .. } => self.finish_negotiate(ctx, identity),
            FixPMessage::Establish {
                keep_alive_interval_ms,
                next_seq_no,
                cod,
                ..
            } => self.reestablish(
                ctx,
                identity,
                EstablishTerms {
                    keep_alive_interval_ms,
                    next_seq_no,
                    cod,
                },
            ),
            _ => Ok(()),
        }
    }

    fn finish_negotiate(
        &mut self,
        ctx: &mut SessionContext<'_>,
        identity: Identity,
    ) -> Result<(), SessionError> {
        let session_id = SessionId::fixp(identity.session_id);
        if ctx.bound_sessions.contains(&session_id) {
            let error = SessionError::DuplicateSession {
                session: session_id.to_string(),
            };
            self.reject(ctx, identity, NegotiateRejectCode::DuplicateId, EstablishRejectCode::Unspecified, error);
            return Ok(());
        }

        let (record, previous_uuid, previous_seq_no) = match ctx.sequence_numbers.load(&session_id)? {
            None => (
                SequenceNumberRecord::new(session_id.clone(), self.config.initial_sequence_index)
                    .with_session_ver_id(identity.session_ver_id),
                0,
                0,
            ),
            Some(stored) if identity.session_ver_id < stored.session_ver_id => {
                let error = SessionError::InvalidState {
                    expected: format!("session version above {}", stored.session_ver_id),
                    current: format!("session version {}", identity.session_ver_id),
                };
                self.reject(ctx, identity, NegotiateRejectCode::InvalidSessionVerId, EstablishRejectCode::InvalidSessionVerId, error);
                return Ok(());
            }
            Some(stored) if identity.session_ver_id == stored.session_ver_id => {
                let error = SessionError::InvalidState {
                    expected: format!("session version above {}", stored.session_ver_id),
                    current: "already negotiated".to_string(),
                };
                self.reject(ctx, identity, NegotiateRejectCode::AlreadyNegotiated, EstablishRejectCode::Unspecified, error);
                return Ok(());
            }
            Some(stored) => {
                let fresh = ctx
                    .sequence_numbers
                    .reset(&session_id)?
                    .with_session_ver_id(identity.session_ver_id);
                info!(
                    session = %session_id,
                    previous_version = stored.session_ver_id,
                    session_ver_id = identity.session_ver_id,
                    sequence_index = fresh.sequence_index,
                    "new session version, sequence numbers reset"
                );
                (fresh, stored.session_ver_id, stored.sent_seq_num)
            }
        };
        ctx.sequence_numbers.save(&record)?;

        self.bind(session_id, identity, &record);
        self.previous_uuid = previous_uuid;
        self.send(
            ctx,
            FixPMessage::NegotiateResponse {
                session_id: identity.session_id,
                session_ver_id: identity.session_ver_id,
                request_timestamp_nanos: identity.timestamp_nanos,
                previous_uuid,
                previous_seq_no,
            },
        )?;
        self.state = FixPState::Negotiated;
        info!(
            connection = %self.connection_id,
            session_id = identity.session_id,
            session_ver_id = identity.session_ver_id,
            "session negotiated"
        );
        Ok(())
    }

    fn reestablish(
        &mut self,
        ctx: &mut SessionContext<'_>,
        identity: Identity,
        terms: EstablishTerms,
    ) -> Result<(), SessionError> {
        let session_id = SessionId::fixp(identity.session_id);
        if ctx.bound_sessions.contains(&session_id) {
            let error = SessionError::DuplicateSession {
                session: session_id.to_string(),
            };
            self.reject(ctx, identity, NegotiateRejectCode::DuplicateId, EstablishRejectCode::Unspecified, error);
            return Ok(());
        }
        match ctx.sequence_numbers.load(&session_id)? {
            None => {
                let error = SessionError::InvalidState {
                    expected: "negotiated session".to_string(),
                    current: "unknown session".to_string(),
                };
                self.reject(ctx, identity, NegotiateRejectCode::Unspecified, EstablishRejectCode::Unnegotiated, error);
                Ok(())
            }
            Some(stored) if stored.session_ver_id != identity.session_ver_id => {
                let error = SessionError::InvalidState {
                    expected: format!("session version {}", stored.session_ver_id),
                    current: format!("session version {}", identity.session_ver_id),
                };
                self.reject(ctx, identity, NegotiateRejectCode::InvalidSessionVerId, EstablishRejectCode::InvalidSessionVerId, error);
                Ok(())
            }
            Some(stored) => {
                self.bind(session_id, identity, &stored);
                self.complete_establish(ctx, identity, terms)
            }
        }
    }

    fn bind(&mut self, session_id: SessionId, identity: Identity, record: &SequenceNumberRecord) {
        self.session_id = Some(session_id);
        self.fixp_session_id = identity.session_id;
        self.session_ver_id = identity.session_ver_id;
        self.sequence = SequenceManager::from_record(record);
        self.sequence_loaded = true;
    }

    fn complete_establish(
        &mut self,
        ctx: &mut SessionContext<'_>,
        identity: Identity,
        terms: EstablishTerms,
    ) -> Result<(), SessionError> {
        if terms.keep_alive_interval_ms == 0 {
            let error = SessionError::InvalidState {
                expected: "positive keep-alive interval".to_string(),
                current: "0 ms".to_string(),
            };
            self.reject(ctx, identity, NegotiateRejectCode::Unspecified, EstablishRejectCode::InvalidKeepAliveInterval, error);
            return Ok(());
        }
        let Some(session_id) = self.session_id.clone() else {
            return Err(self.invalid_state("Negotiated"));
        };

        let previous_seq_no = self.sequence.last_received();
        let expected = self.sequence.next_target_seq().value();
        let mut skipped = None;
        if terms.next_seq_no > expected {
            self.sequence.set_target_seq(terms.next_seq_no);
            skipped = Some((expected, terms.next_seq_no - expected));
        } else if terms.next_seq_no < expected {
            warn!(
                session = %session_id,
                expected,
                next_seq_no = terms.next_seq_no,
                "client next sequence number below expected, keeping ours"
            );
        }

        self.cod = CodConfig::normalize(terms.cod, self.config.cod_max_timeout);
        self.keepalive
            .set_interval(Duration::from_millis(terms.keep_alive_interval_ms));
        self.keepalive.reset(ctx.now);
        self.save(ctx)?;

        self.send(
            ctx,
            FixPMessage::EstablishAck {
                session_id: identity.session_id,
                session_ver_id: identity.session_ver_id,
                request_timestamp_nanos: identity.timestamp_nanos,
                next_seq_no: self.sequence.next_sender_seq().value(),
                previous_seq_no,
                previous_uuid: self.previous_uuid,
                keep_alive_interval_ms: terms.keep_alive_interval_ms,
            },
        )?;
        self.state = FixPState::Established;
        self.established = true;
        info!(
            session = %session_id,
            connection = %self.connection_id,
            session_ver_id = self.session_ver_id,
            last_sent = self.sequence.last_sent(),
            last_received = previous_seq_no,
            "fixp session established"
        );
        ctx.handler.on_established(&session_id, self.connection_id);

        if let Some((from_seq_no, count)) = skipped {
            self.send(ctx, FixPMessage::NotApplied { from_seq_no, count })?;
        }
        Ok(())
    }

    fn handle_application(
        &mut self,
        ctx: &mut SessionContext<'_>,
        message: FixPApplication,
    ) -> Result<(), SessionError> {
        if !matches!(self.state, FixPState::Established | FixPState::Terminating) {
            return Err(self.invalid_state("Established"));
        }
        match self.sequence.validate_incoming(message.seq_num) {
            SequenceResult::TooLow { expected, received } if message.poss_retrans => {
                debug!(expected, received, "retransmitted message below expected ignored");
                return Ok(());
            }
            SequenceResult::TooLow { expected, received } => {
                return Err(SessionError::MsgSeqNumTooLow { expected, received });
            }
            SequenceResult::Gap { expected, received } => {
                self.send(
                    ctx,
                    FixPMessage::NotApplied {
                        from_seq_no: expected,
                        count: received - expected,
                    },
                )?;
            }
            SequenceResult::Ok => {}
        }

        self.sequence.commit_received(message.seq_num);
        if let Some(session_id) = &self.session_id {
            let context = PublishContext {
                connection_id: self.connection_id,
                session_id: Some(session_id),
                sequence_index: self.sequence.sequence_index(),
            };
            ctx.publication
                .record_inbound(&context, message.seq_num, &message.msg_type, &message.body);
            ctx.handler
                .on_message(session_id, message.seq_num, &message.msg_type, &message.body);
        }
        self.stage(ctx)
    }

    fn on_sequence(&mut self, ctx: &mut SessionContext<'_>, next_seq_no: u64) -> Result<(), SessionError> {
        let expected = self.sequence.next_target_seq().value();
        if next_seq_no < expected {
            return Err(SessionError::MsgSeqNumTooLow {
                expected,
                received: next_seq_no,
            });
        }
        if next_seq_no > expected {
            self.send(
                ctx,
                FixPMessage::NotApplied {
                    from_seq_no: expected,
                    count: next_seq_no - expected,
                },
            )?;
            self.sequence.set_target_seq(next_seq_no);
            self.stage(ctx)?;
        }
        Ok(())
    }

    fn on_retransmit_request(
        &mut self,
        ctx: &mut SessionContext<'_>,
        from_seq_no: u64,
        count: u64,
        timestamp_nanos: u64,
    ) -> Result<(), SessionError> {
        let max_range = self.config.fixp_max_retransmission_range;
        let last_sent = self.sequence.last_sent();
        let code = if count > max_range {
            let error = SessionError::RetransmissionRangeExceeded {
                requested: count,
                max_range,
            };
            warn!(connection = %self.connection_id, %error, "retransmit request rejected");
            Some(RetransmitRejectCode::RequestLimitExceeded)
        } else if from_seq_no == 0
            || count == 0
            || from_seq_no.saturating_add(count - 1) > last_sent
        {
            Some(RetransmitRejectCode::OutOfRange)
        } else if self.replays.is_full() {
            Some(RetransmitRejectCode::InProgress)
        } else {
            None
        };
        if let Some(code) = code {
            debug!(connection = %self.connection_id, from_seq_no, count, ?code, "retransmit rejected");
            self.send(
                ctx,
                FixPMessage::RetransmitReject {
                    session_id: self.fixp_session_id,
                    request_timestamp_nanos: timestamp_nanos,
                    code,
                },
            )?;
            return Ok(());
        }

        info!(connection = %self.connection_id, from_seq_no, count, "retransmission requested");
        self.send(
            ctx,
            FixPMessage::Retransmission {
                session_id: self.fixp_session_id,
                request_timestamp_nanos: timestamp_nanos,
                next_seq_no: from_seq_no,
                count,
            },
        )?;
        self.replays
            .push(ReplayJob::new(from_seq_no, from_seq_no + count - 1).with_request_timestamp(timestamp_nanos))?;
        self.service_replays(ctx)?;
        Ok(())
    }

    fn on_terminate(&mut self, ctx: &mut SessionContext<'_>, code: TerminationCode, reason: &str) {
        if self.state == FixPState::Terminating {
            info!(connection = %self.connection_id, ?code, "terminate acknowledged");
            self.end(DisconnectReason::LocalLogout);
            return;
        }
        info!(connection = %self.connection_id, ?code, reason, "counterparty terminated");
        let answer = FixPMessage::Terminate {
            session_id: self.fixp_session_id,
            session_ver_id: self.session_ver_id,
            code: TerminationCode::Finished,
            reason: String::new(),
        };
        self.end_with(ctx, answer, DisconnectReason::RemoteLogout);
    }

    fn service_replays(&mut self, ctx: &mut SessionContext<'_>) -> Result<usize, SessionError> {
        if self.replays.is_empty() || !self.pending.is_empty() {
            return Ok(0);
        }
        let Some(session_id) = self.session_id.as_ref() else {
            return Ok(0);
        };
        let sequence_index = self.sequence.sequence_index();
        let source = ReplaySource {
            archive: ctx.archive,
            session_id,
            sequence_index,
            gap_fill_types: &self.config.gap_fill_types,
            logging_enabled: self.config.log_outbound,
            archive_wait: self.config.reply_timeout,
        };
        let context = PublishContext {
            connection_id: self.connection_id,
            session_id: Some(session_id),
            sequence_index,
        };
        let now = ctx.now;
        let publication = &mut *ctx.publication;
        let observer = &mut *ctx.retransmit_observer;
        let mut emitted = 0;

        while let Some(job) = self.replays.front_mut() {
            let progress = replay::service(job, &source, now, &mut |item| {
                emit_fixp_replay(&mut *publication, &mut *observer, &context, item)?;
                emitted += 1;
                Ok(())
            })?;
            if progress != ReplayProgress::Complete {
                break;
            }
            self.replays.pop_front();
        }
        if emitted > 0 {
            self.keepalive.on_message_sent(now);
        }
        Ok(emitted)
    }

    fn poll_inner(&mut self, ctx: &mut SessionContext<'_>) -> Result<usize, SessionError> {
        let now = ctx.now;
        let mut work = 0;
        if self.state == FixPState::Closing {
            return Ok(self.poll_closing(ctx));
        }
        match self.state {
            FixPState::Connected | FixPState::Negotiated => {
                if now.saturating_duration_since(self.connected_at) >= self.config.no_logon_timeout {
                    return Err(SessionError::NoLogonTimeout {
                        timeout_ms: millis(self.config.no_logon_timeout),
                    });
                }
            }
            FixPState::Handshaking => work += self.poll_handshake(ctx)?,
            _ => {}
        }

        work += self.flush_pending(ctx)?;
        if !matches!(self.state, FixPState::Established | FixPState::Terminating) {
            return Ok(work);
        }
        work += self.service_replays(ctx)?;
        work += self.flush_application(ctx)?;

        if self.keepalive.is_keepalive_expired(now) {
            return Err(SessionError::HeartbeatTimeout {
                elapsed_ms: millis(self.keepalive.time_since_last_received(now)),
            });
        }
        if self.pending.is_empty() && self.keepalive.should_send_heartbeat(now) {
            let next_seq_no = self.sequence.next_sender_seq().value();
            self.send(ctx, FixPMessage::Sequence { next_seq_no })?;
            work += 1;
        }

        if self.state == FixPState::Terminating
            && let Some(sent_at) = self.terminate_sent_at
            && now.saturating_duration_since(sent_at) >= self.config.logout_timeout
        {
            warn!(
                connection = %self.connection_id,
                timeout_ms = millis(self.config.logout_timeout),
                "terminate not acknowledged, disconnecting"
            );
            self.end(DisconnectReason::LocalLogout);
            work += 1;
        }
        Ok(work)
    }

    fn poll_handshake(&mut self, ctx: &mut SessionContext<'_>) -> Result<usize, SessionError> {
        let now = ctx.now;
        match std::mem::replace(&mut self.handshake, Handshake::Idle) {
            Handshake::Idle => Ok(0),
            Handshake::Authenticating { request, mut reply } => {
                let Some(identity) = Identity::of(&request) else {
                    return Ok(0);
                };
                let error = match reply.poll(now) {
                    ReplyPoll::Pending => {
                        self.handshake = Handshake::Authenticating { request, reply };
                        return Ok(0);
                    }
                    ReplyPoll::Ready(AuthOutcome::Accept) => {
                        self.check_ownership(ctx, request)?;
                        return Ok(1);
                    }
                    ReplyPoll::Ready(AuthOutcome::Reject(reason)) => {
                        SessionError::AuthenticationRejected { reason }
                    }
                    ReplyPoll::TimedOut => SessionError::AuthenticationTimeout {
                        timeout_ms: millis(self.config.authentication_timeout),
                    },
                    ReplyPoll::Dropped => SessionError::AuthenticationRejected {
                        reason: "authentication abandoned".to_string(),
                    },
                };
                self.reject(ctx, identity, NegotiateRejectCode::Credentials, EstablishRejectCode::Credentials, error);
                Ok(1)
            }
            Handshake::AwaitingOwnership { request, mut reply } => {
                let Some(identity) = Identity::of(&request) else {
                    return Ok(0);
                };
                match reply.poll(now) {
                    ReplyPoll::Pending => {
                        self.handshake = Handshake::AwaitingOwnership { request, reply };
                        Ok(0)
                    }
                    ReplyPoll::Ready(OwnershipStatus::Owned) => {
                        self.finish_handshake(ctx, request)?;
                        Ok(1)
                    }
                    ReplyPoll::Ready(OwnershipStatus::Rejected(reason)) => {
                        self.reject_ownership(ctx, identity, reason);
                        Ok(1)
                    }
                    ReplyPoll::TimedOut | ReplyPoll::Dropped => {
                        let error = SessionError::SessionReplyTimeout {
                            timeout_ms: millis(self.config.reply_timeout),
                        };
                        self.reject(ctx, identity, NegotiateRejectCode::Unspecified, EstablishRejectCode::Unspecified, error);
                        Ok(1)
                    }
                }
            }
        }
    }

    fn reject_ownership(&mut self, ctx: &mut SessionContext<'_>, identity: Identity, reason: String) {
        warn!(connection = %self.connection_id, session_id = identity.session_id, %reason, "session owned elsewhere");
        let message = identity.rejection(
            NegotiateRejectCode::DuplicateId,
            EstablishRejectCode::Unspecified,
            reason,
        );
        let error = SessionError::DuplicateSession {
            session: SessionId::fixp(identity.session_id).to_string(),
        };
        self.end_with(ctx, message, DisconnectReason::Error(error));
    }

    /// Answers a handshake with a reject and ends the connection.
    fn reject(
        &mut self,
        ctx: &mut SessionContext<'_>,
        identity: Identity,
        negotiate: NegotiateRejectCode,
        establish: EstablishRejectCode,
        error: SessionError,
    ) {
        warn!(
            connection = %self.connection_id,
            session_id = identity.session_id,
            session_ver_id = identity.session_ver_id,
            %error,
            "fixp handshake rejected"
        );
        let message = identity.rejection(negotiate, establish, error.to_string());
        self.end_with(ctx, message, DisconnectReason::Error(error));
    }

    fn fail(&mut self, ctx: &mut SessionContext<'_>, error: SessionError) {
        warn!(
            connection = %self.connection_id,
            session_id = self.fixp_session_id,
            state = %self.state,
            %error,
            "fixp connection failed"
        );
        if matches!(
            self.state,
            FixPState::Negotiated | FixPState::Established | FixPState::Terminating
        ) {
            let code = match error {
                SessionError::HeartbeatTimeout { .. } => TerminationCode::KeepaliveExpired,
                _ => TerminationCode::Unspecified,
            };
            let terminate = FixPMessage::Terminate {
                session_id: self.fixp_session_id,
                session_ver_id: self.session_ver_id,
                code,
                reason: error.to_string(),
            };
            self.end_with(ctx, terminate, DisconnectReason::Error(error));
        } else {
            self.end(DisconnectReason::Error(error));
        }
    }

    fn end(&mut self, reason: DisconnectReason) {
        self.state = FixPState::Disconnected;
        self.disconnect = Some(reason);
        self.handshake = Handshake::Idle;
        self.replays.clear();
    }

    fn publish_context(&self) -> PublishContext<'_> {
        PublishContext {
            connection_id: self.connection_id,
            session_id: if self.sequence_loaded {
                self.session_id.as_ref()
            } else {
                None
            },
            sequence_index: self.sequence.sequence_index(),
        }
    }

    /// Publishes a message that ends the connection, then ends it.
    ///
    /// Under backpressure the message is queued and the connection waits in
    /// `Closing`; [`FixPConnection::poll`] publishes it and ends the
    /// connection.
    fn end_with(&mut self, ctx: &mut SessionContext<'_>, message: FixPMessage, reason: DisconnectReason) {
        self.replays.clear();
        self.pending.clear();
        self.pending_app.clear();
        match ctx
            .publication
            .publish(&self.publish_context(), &OutboundFrame::FixP(&message))
        {
            Ok(()) => self.end(reason),
            Err(PublishError::Backpressure) => {
                debug!(connection = %self.connection_id, msg_type = %message.msg_type(), "final message queued, publication backpressured");
                self.pending.push_back(message);
                self.handshake = Handshake::Idle;
                self.state = FixPState::Closing;
                self.disconnect = Some(reason);
                self.terminate_sent_at = Some(ctx.now);
            }
            Err(PublishError::Encode(e)) => {
                warn!(connection = %self.connection_id, msg_type = %message.msg_type(), error = %e, "final message could not be encoded");
                self.end(reason);
            }
        }
    }

    fn poll_closing(&mut self, ctx: &mut SessionContext<'_>) -> usize {
        let sent = self.flush_pending(ctx).unwrap_or_else(|e| {
            warn!(connection = %self.connection_id, error = %e, "final message could not be encoded");
            self.pending.clear();
            0
        });
        if !self.pending.is_empty() {
            let expired = self.terminate_sent_at.is_none_or(|queued_at| {
                ctx.now.saturating_duration_since(queued_at) >= self.config.logout_timeout
            });
            if !expired {
                return sent;
            }
            warn!(
                connection = %self.connection_id,
                timeout_ms = millis(self.config.logout_timeout),
                "final message still backpressured, disconnecting"
            );
        }
        let reason = self
            .disconnect
            .take()
            .unwrap_or(DisconnectReason::LocalLogout);
        self.end(reason);
        sent + 1
    }

    fn send(&mut self, ctx: &mut SessionContext<'_>, message: FixPMessage) -> Result<(), SessionError> {
        if self.pending.is_empty() {
            match ctx
                .publication
                .publish(&self.publish_context(), &OutboundFrame::FixP(&message))
            {
                Ok(()) => {
                    self.keepalive.on_message_sent(ctx.now);
                    return Ok(());
                }
                Err(PublishError::Backpressure) => {}
                Err(PublishError::Encode(e)) => return Err(e.into()),
            }
        }
        debug!(connection = %self.connection_id, msg_type = %message.msg_type(), "fixp message queued");
        self.pending.push_back(message);
        Ok(())
    }

    fn flush_pending(&mut self, ctx: &mut SessionContext<'_>) -> Result<usize, SessionError> {
        let mut sent = 0;
        while let Some(message) = self.pending.pop_front() {
            match ctx
                .publication
                .publish(&self.publish_context(), &OutboundFrame::FixP(&message))
            {
                Ok(()) => {}
                Err(PublishError::Backpressure) => {
                    self.pending.push_front(message);
                    break;
                }
                Err(PublishError::Encode(e)) => return Err(e.into()),
            }
            self.keepalive.on_message_sent(ctx.now);
            sent += 1;
        }
        Ok(sent)
    }

    fn publish_application(
        &mut self,
        ctx: &mut SessionContext<'_>,
        msg_type: &MsgType,
        body: &Bytes,
    ) -> Result<Option<u64>, SessionError> {
        let seq_num = self.sequence.next_sender_seq();
        let frame = OutboundFrame::Application {
            seq_num: seq_num.value(),
            msg_type,
            body,
        };
        match ctx.publication.publish(&self.publish_context(), &frame) {
            Ok(()) => {}
            Err(PublishError::Backpressure) => return Ok(None),
            Err(PublishError::Encode(e)) => return Err(e.into()),
        }
        self.sequence.commit_sent(seq_num);
        self.keepalive.on_message_sent(ctx.now);
        self.stage(ctx)?;
        Ok(Some(seq_num.value()))
    }

    fn flush_application(&mut self, ctx: &mut SessionContext<'_>) -> Result<usize, SessionError> {
        if !self.replays.is_empty() || !self.pending.is_empty() {
            return Ok(0);
        }
        let mut sent = 0;
        while let Some((msg_type, body)) = self.pending_app.pop_front() {
            if self.publish_application(ctx, &msg_type, &body)?.is_none() {
                self.pending_app.push_front((msg_type, body));
                break;
            }
            sent += 1;
        }
        Ok(sent)
    }

    fn record(&self) -> Option<SequenceNumberRecord> {
        match (self.sequence_loaded, &self.session_id) {
            (true, Some(session_id)) => Some(self.sequence.to_record(session_id, self.session_ver_id)),
            _ => None,
        }
    }

    fn stage(&self, ctx: &mut SessionContext<'_>) -> Result<(), SessionError> {
        if let Some(record) = self.record() {
            ctx.sequence_numbers.stage(&record)?;
        }
        Ok(())
    }

    fn save(&self, ctx: &mut SessionContext<'_>) -> Result<(), SessionError> {
        if let Some(record) = self.record() {
            ctx.sequence_numbers.save(&record)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::ConnectionOwnership;
    use crate::test_support::{Harness, Sent};
    use irongate_core::types::CancelOnDisconnectType;

    fn negotiate(session_id: u64, session_ver_id: u64) -> FixPMessage {
        FixPMessage::Negotiate {
            session_id,
            session_ver_id,
            entering_firm: Some("FIRM".to_string()),
            timestamp_nanos: 100,
            credentials: None,
        }
    }

    fn establish(session_id: u64, session_ver_id: u64, next_seq_no: u64) -> FixPMessage {
        establish_with_keepalive(session_id, session_ver_id, next_seq_no, 1_000)
    }

    fn establish_with_keepalive(
        session_id: u64,
        session_ver_id: u64,
        next_seq_no: u64,
        keep_alive_interval_ms: u64,
    ) -> FixPMessage {
        FixPMessage::Establish {
            session_id,
            session_ver_id,
            timestamp_nanos: 200,
            keep_alive_interval_ms,
            next_seq_no,
            cod: CodRequest::default(),
            credentials: None,
        }
    }

    fn connection(now: Instant) -> FixPConnection {
        FixPConnection::acceptor(ConnectionId(7), Arc::new(SessionConfig::new()), now)
    }

    fn established(h: &mut Harness, now: Instant) -> FixPConnection {
        let mut conn = connection(now);
        conn.on_message(&mut h.ctx(now), negotiate(42, 1));
        conn.on_message(&mut h.ctx(now), establish(42, 1, 1));
        assert_eq!(conn.state(), FixPState::Established);
        conn
    }

    fn persist(h: &mut Harness, session_ver_id: u64, sent: u64, received: u64) {
        h.sequence_numbers
            .save(
                &SequenceNumberRecord::new(SessionId::fixp(42), 0)
                    .with_counters(sent, received)
                    .with_session_ver_id(session_ver_id),
            )
            .unwrap();
    }

    fn app(seq_num: u64) -> FixPApplication {
        FixPApplication {
            seq_num,
            poss_retrans: false,
            msg_type: MsgType::Application("NewOrderSingle".into()),
            body: Bytes::from_static(b"order"),
        }
    }

    #[test]
    fn test_negotiate_then_establish() {
        let t0 = Instant::now();
        let mut h = Harness::new();
        let mut conn = connection(t0);

        conn.on_message(&mut h.ctx(t0), negotiate(42, 1));
        assert_eq!(conn.state(), FixPState::Negotiated);
        assert_eq!(
            h.fixp_sent(),
            vec![FixPMessage::NegotiateResponse {
                session_id: 42,
                session_ver_id: 1,
                request_timestamp_nanos: 100,
                previous_uuid: 0,
                previous_seq_no: 0,
            }]
        );

        conn.on_message(&mut h.ctx(t0), establish(42, 1, 1));
        assert_eq!(conn.state(), FixPState::Established);
        assert_eq!(
            h.fixp_sent().pop(),
            Some(FixPMessage::EstablishAck {
                session_id: 42,
                session_ver_id: 1,
                request_timestamp_nanos: 200,
                next_seq_no: 1,
                previous_seq_no: 0,
                previous_uuid: 0,
                keep_alive_interval_ms: 1_000,
            })
        );
        assert_eq!(h.handler.established, vec![(SessionId::fixp(42), ConnectionId(7))]);
        let record = h.sequence_numbers.load(&SessionId::fixp(42)).unwrap().unwrap();
        assert_eq!(record.session_ver_id, 1);
    }

    #[test]
    fn test_lower_session_version_rejected() {
        let t0 = Instant::now();
        let mut h = Harness::new();
        persist(&mut h, 5, 0, 0);
        let mut conn = connection(t0);

        conn.on_message(&mut h.ctx(t0), negotiate(42, 3));

        assert!(matches!(
            h.fixp_sent()[0],
            FixPMessage::NegotiateReject {
                code: NegotiateRejectCode::InvalidSessionVerId,
                ..
            }
        ));
        assert!(conn.wants_disconnect());
    }

    #[test]
    fn test_equal_session_version_already_negotiated() {
        let t0 = Instant::now();
        let mut h = Harness::new();
        persist(&mut h, 1, 3, 3);
        let mut conn = connection(t0);

        conn.on_message(&mut h.ctx(t0), negotiate(42, 1));

        assert!(matches!(
            h.fixp_sent()[0],
            FixPMessage::NegotiateReject {
                code: NegotiateRejectCode::AlreadyNegotiated,
                ..
            }
        ));
    }

    #[test]
    fn test_higher_session_version_starts_new_epoch() {
        let t0 = Instant::now();
        let mut h = Harness::new();
        persist(&mut h, 1, 10, 7);
        let mut conn = connection(t0);

        conn.on_message(&mut h.ctx(t0), negotiate(42, 2));

        assert_eq!(
            h.fixp_sent()[0],
            FixPMessage::NegotiateResponse {
                session_id: 42,
                session_ver_id: 2,
                request_timestamp_nanos: 100,
                previous_uuid: 1,
                previous_seq_no: 10,
            }
        );
        let record = h.sequence_numbers.load(&SessionId::fixp(42)).unwrap().unwrap();
        assert_eq!(record.sequence_index, 1);
        assert_eq!(record.session_ver_id, 2);
        assert_eq!((record.sent_seq_num, record.received_seq_num), (0, 0));
    }

    #[test]
    fn test_establish_unknown_session_unnegotiated() {
        let t0 = Instant::now();
        let mut h = Harness::new();
        let mut conn = connection(t0);

        conn.on_message(&mut h.ctx(t0), establish(42, 1, 1));

        assert!(matches!(
            h.fixp_sent()[0],
            FixPMessage::EstablishReject {
                code: EstablishRejectCode::Unnegotiated,
                ..
            }
        ));
        assert!(conn.wants_disconnect());
    }

    #[test]
    fn test_reestablish_resumes_persisted_numbers() {
        let t0 = Instant::now();
        let mut h = Harness::new();
        persist(&mut h, 1, 4, 6);
        let mut conn = connection(t0);

        conn.on_message(&mut h.ctx(t0), establish(42, 1, 7));

        assert_eq!(conn.state(), FixPState::Established);
        assert!(matches!(
            h.fixp_sent()[0],
            FixPMessage::EstablishAck {
                next_seq_no: 5,
                previous_seq_no: 6,
                ..
            }
        ));
    }

    #[test]
    fn test_client_ahead_gets_not_applied() {
        let t0 = Instant::now();
        let mut h = Harness::new();
        persist(&mut h, 1, 4, 6);
        let mut conn = connection(t0);

        conn.on_message(&mut h.ctx(t0), establish(42, 1, 9));

        assert_eq!(
            h.fixp_sent().pop(),
            Some(FixPMessage::NotApplied {
                from_seq_no: 7,
                count: 2
            })
        );
        assert_eq!(conn.sequence().next_target_seq().value(), 9);
    }

    #[test]
    fn test_zero_keep_alive_rejected() {
        let t0 = Instant::now();
        let mut h = Harness::new();
        let mut conn = connection(t0);
        conn.on_message(&mut h.ctx(t0), negotiate(42, 1));

        conn.on_message(&mut h.ctx(t0), establish_with_keepalive(42, 1, 1, 0));

        assert!(matches!(
            h.fixp_sent().pop(),
            Some(FixPMessage::EstablishReject {
                code: EstablishRejectCode::InvalidKeepAliveInterval,
                ..
            })
        ));
    }

    #[test]
    fn test_duplicate_session_rejected() {
        let t0 = Instant::now();
        let mut h = Harness::new();
        h.bound.insert(SessionId::fixp(42));
        let mut conn = connection(t0);

        conn.on_message(&mut h.ctx(t0), negotiate(42, 1));

        assert!(matches!(
            h.fixp_sent()[0],
            FixPMessage::NegotiateReject {
                code: NegotiateRejectCode::DuplicateId,
                ..
            }
        ));
        assert!(matches!(
            conn.disconnect_reason(),
            Some(DisconnectReason::Error(SessionError::DuplicateSession { .. }))
        ));
    }

    #[test]
    fn test_inbound_application_dispatched_and_gap_not_applied() {
        let t0 = Instant::now();
        let mut h = Harness::new();
        let mut conn = established(&mut h, t0);

        conn.on_application(&mut h.ctx(t0), app(1));
        conn.on_application(&mut h.ctx(t0), app(4));

        assert_eq!(
            h.handler.messages.iter().map(|(seq, _)| *seq).collect::<Vec<_>>(),
            vec![1, 4]
        );
        assert_eq!(
            h.fixp_sent().pop(),
            Some(FixPMessage::NotApplied {
                from_seq_no: 2,
                count: 2
            })
        );
        assert_eq!(conn.sequence().last_received(), 4);
    }

    #[test]
    fn test_retransmit_request_replays() {
        let t0 = Instant::now();
        let mut h = Harness::new();
        let mut conn = established(&mut h, t0);
        for _ in 0..3 {
            conn.send_application(
                &mut h.ctx(t0),
                MsgType::Application("ExecutionReport".into()),
                Bytes::from_static(b"report"),
            )
            .unwrap();
        }
        let before = h.publication.sent.len();

        conn.on_message(
            &mut h.ctx(t0),
            FixPMessage::RetransmitRequest {
                session_id: 42,
                from_seq_no: 2,
                count: 2,
                timestamp_nanos: 77,
            },
        );

        assert_eq!(
            h.publication.sent[before..],
            [
                Sent::FixP(FixPMessage::Retransmission {
                    session_id: 42,
                    request_timestamp_nanos: 77,
                    next_seq_no: 2,
                    count: 2,
                }),
                Sent::Replay { seq_num: 2 },
                Sent::Replay { seq_num: 3 },
            ]
        );
        assert!(!conn.is_replaying());
    }

    #[test]
    fn test_retransmit_over_limit_rejected() {
        let t0 = Instant::now();
        let mut h = Harness::new();
        let mut conn = FixPConnection::acceptor(
            ConnectionId(7),
            Arc::new(SessionConfig::new().with_fixp_max_retransmission_range(10)),
            t0,
        );
        conn.on_message(&mut h.ctx(t0), negotiate(42, 1));
        conn.on_message(&mut h.ctx(t0), establish(42, 1, 1));

        conn.on_message(
            &mut h.ctx(t0),
            FixPMessage::RetransmitRequest {
                session_id: 42,
                from_seq_no: 1,
                count: 11,
                timestamp_nanos: 5,
            },
        );

        assert_eq!(
            h.fixp_sent().pop(),
            Some(FixPMessage::RetransmitReject {
                session_id: 42,
                request_timestamp_nanos: 5,
                code: RetransmitRejectCode::RequestLimitExceeded,
            })
        );
        assert_eq!(conn.state(), FixPState::Established);
    }

    #[test]
    fn test_retransmit_out_of_range_rejected() {
        let t0 = Instant::now();
        let mut h = Harness::new();
        let mut conn = established(&mut h, t0);

        conn.on_message(
            &mut h.ctx(t0),
            FixPMessage::RetransmitRequest {
                session_id: 42,
                from_seq_no: 1,
                count: 1,
                timestamp_nanos: 5,
            },
        );

        assert!(matches!(
            h.fixp_sent().pop(),
            Some(FixPMessage::RetransmitReject {
                code: RetransmitRejectCode::OutOfRange,
                ..
            })
        ));
    }

    #[test]
    fn test_keepalive_then_expiry() {
        let t0 = Instant::now();
        let mut h = Harness::new();
        let mut conn = established(&mut h, t0);

        conn.poll(&mut h.ctx(t0 + Duration::from_secs(1)));
        assert_eq!(
            h.fixp_sent().pop(),
            Some(FixPMessage::Sequence { next_seq_no: 1 })
        );

        conn.poll(&mut h.ctx(t0 + Duration::from_secs(2)));
        assert!(matches!(
            h.fixp_sent().pop(),
            Some(FixPMessage::Terminate {
                code: TerminationCode::KeepaliveExpired,
                ..
            })
        ));
        assert!(matches!(
            conn.disconnect_reason(),
            Some(DisconnectReason::Error(SessionError::HeartbeatTimeout { .. }))
        ));
    }

    #[test]
    fn test_remote_terminate_is_answered() {
        let t0 = Instant::now();
        let mut h = Harness::new();
        let mut conn = established(&mut h, t0);

        conn.on_message(
            &mut h.ctx(t0),
            FixPMessage::Terminate {
                session_id: 42,
                session_ver_id: 1,
                code: TerminationCode::Finished,
                reason: String::new(),
            },
        );

        assert!(matches!(
            h.fixp_sent().pop(),
            Some(FixPMessage::Terminate {
                code: TerminationCode::Finished,
                ..
            })
        ));
        assert_eq!(conn.disconnect_reason(), Some(&DisconnectReason::RemoteLogout));
        let summary = conn.on_disconnect(&mut h.ctx(t0)).unwrap();
        assert_eq!(summary.trigger, CodTrigger::Terminate);
        assert_eq!(summary.session_ver_id, 1);
    }

    fn terminates(h: &Harness) -> usize {
        h.fixp_sent()
            .iter()
            .filter(|message| matches!(message, FixPMessage::Terminate { .. }))
            .count()
    }

    #[test]
    fn test_terminate_answer_waits_out_backpressure() {
        let t0 = Instant::now();
        let mut h = Harness::new();
        let mut conn = established(&mut h, t0);

        h.publication.blocked = true;
        conn.on_message(
            &mut h.ctx(t0),
            FixPMessage::Terminate {
                session_id: 42,
                session_ver_id: 1,
                code: TerminationCode::Finished,
                reason: String::new(),
            },
        );
        assert_eq!(conn.state(), FixPState::Closing);
        assert!(!conn.wants_disconnect());
        conn.on_application(&mut h.ctx(t0), app(1));
        assert!(h.handler.messages.is_empty());

        h.publication.blocked = false;
        conn.poll(&mut h.ctx(t0));

        assert_eq!(terminates(&h), 1);
        assert!(conn.wants_disconnect());
        assert_eq!(conn.disconnect_reason(), Some(&DisconnectReason::RemoteLogout));
    }

    #[test]
    fn test_failure_terminate_waits_out_backpressure() {
        let t0 = Instant::now();
        let mut h = Harness::new();
        let mut conn = established(&mut h, t0);
        conn.on_application(&mut h.ctx(t0), app(1));

        h.publication.blocked = true;
        conn.on_application(&mut h.ctx(t0), app(1));
        assert_eq!(conn.state(), FixPState::Closing);

        h.publication.blocked = false;
        conn.poll(&mut h.ctx(t0));

        assert!(matches!(
            h.fixp_sent().pop(),
            Some(FixPMessage::Terminate {
                code: TerminationCode::Unspecified,
                ..
            })
        ));
        assert_eq!(
            conn.disconnect_reason(),
            Some(&DisconnectReason::Error(SessionError::MsgSeqNumTooLow {
                expected: 2,
                received: 1
            }))
        );
    }

    #[test]
    fn test_backpressured_terminate_given_up_after_logout_timeout() {
        let t0 = Instant::now();
        let mut h = Harness::new();
        let mut conn = established(&mut h, t0);

        h.publication.blocked = true;
        conn.on_application(&mut h.ctx(t0), app(5));
        conn.on_application(&mut h.ctx(t0), app(1));
        assert_eq!(conn.state(), FixPState::Closing);

        conn.poll(&mut h.ctx(t0 + Duration::from_secs(1)));
        assert!(!conn.wants_disconnect());
        conn.poll(&mut h.ctx(t0 + SessionConfig::new().logout_timeout));

        assert!(conn.wants_disconnect());
        assert_eq!(terminates(&h), 0);
        let summary = conn.on_disconnect(&mut h.ctx(t0)).unwrap();
        assert_eq!(summary.trigger, CodTrigger::Disconnect);
    }

    #[test]
    fn test_backpressured_reject_sent_before_close() {
        let t0 = Instant::now();
        let mut h = Harness::new();
        let mut conn = connection(t0);

        h.publication.blocked = true;
        conn.on_message(&mut h.ctx(t0), establish(42, 1, 1));
        assert_eq!(conn.state(), FixPState::Closing);

        h.publication.blocked = false;
        conn.poll(&mut h.ctx(t0));

        assert!(matches!(
            h.fixp_sent().as_slice(),
            [FixPMessage::EstablishReject {
                code: EstablishRejectCode::Unnegotiated,
                ..
            }]
        ));
        assert!(conn.wants_disconnect());
    }

    #[test]
    fn test_unencodable_message_fails_connection() {
        let t0 = Instant::now();
        let mut h = Harness::new();
        let mut conn = established(&mut h, t0);

        h.publication.unencodable = Some(MsgType::NotApplied);
        conn.on_application(&mut h.ctx(t0), app(3));

        assert!(matches!(
            conn.disconnect_reason(),
            Some(DisconnectReason::Error(SessionError::Encode(_)))
        ));
        assert!(h.handler.messages.is_empty());
        assert_eq!(terminates(&h), 1);
    }

    #[test]
    fn test_local_terminate_acknowledged() {
        let t0 = Instant::now();
        let mut h = Harness::new();
        let mut conn = established(&mut h, t0);

        conn.initiate_terminate(&mut h.ctx(t0), "done").unwrap();
        assert_eq!(conn.state(), FixPState::Terminating);
        conn.on_message(
            &mut h.ctx(t0),
            FixPMessage::Terminate {
                session_id: 42,
                session_ver_id: 1,
                code: TerminationCode::Finished,
                reason: String::new(),
            },
        );

        assert_eq!(conn.disconnect_reason(), Some(&DisconnectReason::LocalLogout));
    }

    #[test]
    fn test_no_establish_timeout() {
        let t0 = Instant::now();
        let mut h = Harness::new();
        let mut conn = connection(t0);
        conn.on_message(&mut h.ctx(t0), negotiate(42, 1));

        conn.poll(&mut h.ctx(t0 + Duration::from_secs(5)));

        assert_eq!(
            conn.disconnect_reason(),
            Some(&DisconnectReason::Error(SessionError::NoLogonTimeout {
                timeout_ms: 5_000
            }))
        );
        assert_eq!(conn.on_disconnect(&mut h.ctx(t0)), None);
    }

    struct NeverAnswers(Vec<crate::reply::Responder<OwnershipStatus>>);

    impl ConnectionOwnership for NeverAnswers {
        fn connection_exists(&mut self, _context: &NegotiationContext) -> OwnershipDecision {
            let (responder, reply) = crate::reply::reply_channel();
            self.0.push(responder);
            OwnershipDecision::Pending(reply)
        }
    }

    #[test]
    fn test_ownership_reply_timeout() {
        let t0 = Instant::now();
        let mut h = Harness::new();
        h.ownership = Box::new(NeverAnswers(Vec::new()));
        let mut conn = connection(t0);

        conn.on_message(&mut h.ctx(t0), negotiate(42, 1));
        assert_eq!(conn.state(), FixPState::Handshaking);
        assert_eq!(conn.poll(&mut h.ctx(t0 + Duration::from_secs(1))), 0);

        conn.poll(&mut h.ctx(t0 + Duration::from_secs(10)));

        assert!(matches!(
            h.fixp_sent()[0],
            FixPMessage::NegotiateReject {
                code: NegotiateRejectCode::Unspecified,
                ..
            }
        ));
        assert_eq!(
            conn.disconnect_reason(),
            Some(&DisconnectReason::Error(SessionError::SessionReplyTimeout {
                timeout_ms: 10_000
            }))
        );
    }

    #[test]
    fn test_establish_normalizes_cod() {
        let t0 = Instant::now();
        let mut h = Harness::new();
        let mut conn = connection(t0);
        conn.on_message(&mut h.ctx(t0), negotiate(42, 1));
        conn.on_message(
            &mut h.ctx(t0),
            FixPMessage::Establish {
                session_id: 42,
                session_ver_id: 1,
                timestamp_nanos: 200,
                keep_alive_interval_ms: 1_000,
                next_seq_no: 1,
                cod: CodRequest {
                    cod_type: CancelOnDisconnectType::CancelOnDisconnectOnly,
                    window_ms: Some(120_000),
                },
                credentials: None,
            },
        );

        assert_eq!(conn.cod().window, Some(Duration::from_secs(60)));
    }
}
