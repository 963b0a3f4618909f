/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! FIX session state machine.
//!
//! A [`Session`] is driven by the framer through [`Session::on_message`] and
//! [`Session::poll`] and reaches the outside world only through the
//! capabilities lent to it in a [`SessionContext`]. It owns sequence
//! numbering, gap recovery and resend servicing along with the heartbeat,
//! logon and logout handshakes.
//!
//! Outbound sequence numbers are committed only after the publication took
//! the frame. Admin messages that hit backpressure wait in a queue and keep
//! their place; application messages sent while a resend is in flight are
//! queued behind it. A session-ending Logout that hits backpressure keeps the
//! session in `LoggingOut` until it is published or the logout timeout
//! passes.

use crate::capability::{
    AuthDecision, AuthOutcome, AuthenticationContext, AuthenticationStrategy,
    ConnectionOwnership, DisconnectReason, Publication, PublishContext, PublishError,
    RetransmitObserver, SessionHandler,
};
use crate::cod::{CodConfig, CodTrigger};
use crate::config::SessionConfig;
use crate::heartbeat::HeartbeatManager;
use crate::replay::{self, ReplayItem, ReplayJob, ReplayProgress, ReplayQueue, ReplaySource};
use crate::reply::{Reply, ReplyPoll};
use crate::sequence::{SequenceManager, SequenceResult};
use crate::state::SessionState;
use bytes::Bytes;
use irongate_core::error::SessionError;
use irongate_core::message::{
    AdminMessage, CodRequest, InboundBody, InboundMessage, Logon, MsgType, OutboundFrame,
};
use irongate_core::types::{ConnectionId, SessionId};
use irongate_store::{MessageArchive, SequenceNumberRecord, SequenceNumbers};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Side of the connection this engine plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    /// Waits for the counterparty's Logon.
    Acceptor,
    /// Sends the first Logon.
    Initiator,
}

/// Where a session's sequence numbers start from at logon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SeedStrategy {
    /// Resume the persisted numbers; unknown sessions start at 1.
    #[default]
    Persisted,
    /// Start a new sequence index on every logon.
    ResetOnLogon,
    /// Use explicit values, starting a new sequence index if they are lower
    /// than the persisted ones.
    Explicit {
        /// Last sequence number sent.
        last_sent: u64,
        /// Last sequence number received.
        last_received: u64,
    },
}

/// Capabilities lent to a session for one call.
pub struct SessionContext<'a> {
    /// Time of the current duty cycle.
    pub now: Instant,
    /// Sequence number persistence.
    pub sequence_numbers: &'a mut dyn SequenceNumbers,
    /// Outbound message archive used for resends.
    pub archive: &'a dyn MessageArchive,
    /// Outbound sink.
    pub publication: &'a mut dyn Publication,
    /// Application callbacks.
    pub handler: &'a mut dyn SessionHandler,
    /// Logon and negotiate authentication.
    pub authentication: &'a mut dyn AuthenticationStrategy,
    /// FIXP connection ownership arbitration.
    pub ownership: &'a mut dyn ConnectionOwnership,
    /// Notified of every message resent from the archive.
    pub retransmit_observer: &'a mut dyn RetransmitObserver,
    /// Sessions currently bound to a connection of this engine.
    pub bound_sessions: &'a HashSet<SessionId>,
}

/// Result of an application send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Published with this sequence number.
    Sent(u64),
    /// Queued behind a resend or backpressure, sent on a later poll.
    Queued,
}

/// What the registry keeps about a session that left its connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    /// The session.
    pub session_id: SessionId,
    /// Connection it was bound to.
    pub connection_id: ConnectionId,
    /// Last sequence number sent.
    pub last_sent: u64,
    /// Last sequence number received.
    pub last_received: u64,
    /// Sequence index at disconnect.
    pub sequence_index: u32,
    /// FIXP session version id, 0 for FIX.
    pub session_ver_id: u64,
    /// Negotiated cancel-on-disconnect settings.
    pub cod: CodConfig,
    /// Whether the session ended with a goodbye or just dropped.
    pub trigger: CodTrigger,
    /// Why the session ended.
    pub reason: DisconnectReason,
}

pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Publishes one replay item as FIX frames.
fn emit_fix_replay(
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
        ReplayItem::GapFill {
            seq_num,
            new_seq_no,
        } => {
            let fill = AdminMessage::SequenceReset {
                new_seq_no,
                gap_fill: true,
            };
            publication.publish(
                context,
                &OutboundFrame::Admin {
                    seq_num,
                    poss_dup: true,
                    message: &fill,
                },
            )?;
        }
    }
    Ok(())
}

struct PendingLogon {
    seq_num: u64,
    logon: Logon,
    reply: Reply<AuthOutcome>,
}

/// A FIX session bound to one connection.
pub struct Session {
    connection_id: ConnectionId,
    role: SessionRole,
    seed: SeedStrategy,
    config: Arc<SessionConfig>,
    session_id: Option<SessionId>,
    state: SessionState,
    sequence: SequenceManager,
    sequence_loaded: bool,
    logged_on: bool,
    heartbeat: HeartbeatManager,
    cod: CodConfig,
    connected_at: Instant,
    username: Option<String>,
    password: Option<String>,
    cod_request: Option<CodRequest>,
    pending_logon: Option<PendingLogon>,
    inbound_buffer: BTreeMap<u64, InboundMessage>,
    resend_requested_through: u64,
    replays: ReplayQueue,
    pending_admin: VecDeque<AdminMessage>,
    pending_app: VecDeque<(MsgType, Bytes)>,
    logout_sent_at: Option<Instant>,
    disconnect: Option<DisconnectReason>,
}

impl Session {
    fn new(
        connection_id: ConnectionId,
        role: SessionRole,
        session_id: Option<SessionId>,
        config: Arc<SessionConfig>,
        seed: SeedStrategy,
        now: Instant,
    ) -> Self {
        Self {
            connection_id,
            role,
            seed,
            session_id,
            state: SessionState::Connected,
            sequence: SequenceManager::new(config.initial_sequence_index),
            sequence_loaded: false,
            logged_on: false,
            heartbeat: HeartbeatManager::new(
                config.heartbeat_interval,
                config.test_request_grace,
                now,
            ),
            cod: CodConfig::default(),
            connected_at: now,
            username: None,
            password: None,
            cod_request: None,
            pending_logon: None,
            inbound_buffer: BTreeMap::new(),
            resend_requested_through: 0,
            replays: ReplayQueue::new(config.max_concurrent_replays),
            pending_admin: VecDeque::new(),
            pending_app: VecDeque::new(),
            logout_sent_at: None,
            disconnect: None,
            config,
        }
    }

    /// Creates a session for an accepted connection.
    ///
    /// The session id is learnt from the counterparty's Logon.
    ///
    /// # Arguments
    /// * `connection_id` - The connection the session runs on
    /// * `config` - Session configuration
    /// * `seed` - Where sequence numbers start from
    /// * `now` - Time the connection was accepted
    #[must_use]
    pub fn acceptor(
        connection_id: ConnectionId,
        config: Arc<SessionConfig>,
        seed: SeedStrategy,
        now: Instant,
    ) -> Self {
        Self::new(connection_id, SessionRole::Acceptor, None, config, seed, now)
    }

    /// Creates a session for an outbound connection.
    #[must_use]
    pub fn initiator(
        connection_id: ConnectionId,
        session_id: SessionId,
        config: Arc<SessionConfig>,
        seed: SeedStrategy,
        now: Instant,
    ) -> Self {
        Self::new(
            connection_id,
            SessionRole::Initiator,
            Some(session_id),
            config,
            seed,
            now,
        )
    }

    /// Sets the Username and Password sent on the initiator's Logon.
    #[must_use]
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Sets the cancel-on-disconnect request sent on the initiator's Logon.
    #[must_use]
    pub const fn with_cod_request(mut self, request: CodRequest) -> Self {
        self.cod_request = Some(request);
        self
    }

    /// Returns the connection id.
    #[must_use]
    pub const fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Returns the role.
    #[must_use]
    pub const fn role(&self) -> SessionRole {
        self.role
    }

    /// Returns the session id once known.
    #[must_use]
    pub const fn session_id(&self) -> Option<&SessionId> {
        self.session_id.as_ref()
    }

    /// Returns the current state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
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

    /// Returns the heartbeat interval in effect.
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        self.heartbeat.interval()
    }

    /// Returns true while resend requests are being serviced.
    #[must_use]
    pub fn is_replaying(&self) -> bool {
        !self.replays.is_empty()
    }

    /// Returns the number of inbound messages held above a gap.
    #[must_use]
    pub fn buffered_count(&self) -> usize {
        self.inbound_buffer.len()
    }

    /// Returns the reason the session ended, once it has.
    #[must_use]
    pub const fn disconnect_reason(&self) -> Option<&DisconnectReason> {
        self.disconnect.as_ref()
    }

    /// Returns true once the transport should be closed.
    #[must_use]
    pub const fn wants_disconnect(&self) -> bool {
        matches!(self.state, SessionState::Disconnected)
    }

    /// Sends the initiator's Logon.
    ///
    /// # Errors
    /// Returns `SessionError::InvalidState` unless this is an initiator that
    /// has not logged on yet, or `SessionError::Store` if the persisted
    /// sequence numbers cannot be read.
    pub fn initiate_logon(&mut self, ctx: &mut SessionContext<'_>) -> Result<(), SessionError> {
        if self.role != SessionRole::Initiator || self.state != SessionState::Connected {
            return Err(self.invalid_state("Connected initiator"));
        }
        let Some(session_id) = self.session_id.clone() else {
            return Err(self.invalid_state("known session"));
        };
        let SessionId::Fix {
            local_comp_id,
            remote_comp_id,
            local_sub_id,
            remote_sub_id,
        } = &session_id
        else {
            return Err(self.invalid_state("FIX session"));
        };

        let reset = matches!(self.seed, SeedStrategy::ResetOnLogon);
        self.load_sequence(ctx, &session_id, reset)?;

        let logon = Logon {
            sender_comp_id: local_comp_id.clone(),
            target_comp_id: remote_comp_id.clone(),
            sender_sub_id: local_sub_id.clone(),
            target_sub_id: remote_sub_id.clone(),
            heartbeat_interval_secs: u32::try_from(self.config.heartbeat_interval_secs())
                .unwrap_or(u32::MAX),
            reset_seq_num: reset,
            username: self.username.clone(),
            password: self.password.clone(),
            cod: self.cod_request,
        };
        self.send_admin(ctx, AdminMessage::Logon(logon))?;
        self.state = SessionState::LoggingOn;
        info!(session = %session_id, connection = %self.connection_id, "logon sent");
        Ok(())
    }

    /// Processes one decoded inbound message.
    ///
    /// Session-fatal errors send a Logout carrying the error text and move
    /// the session to `Disconnected`, by way of `LoggingOut` if the Logout
    /// is backpressured.
    pub fn on_message(&mut self, ctx: &mut SessionContext<'_>, message: InboundMessage) {
        if self.state.is_ended() {
            debug!(connection = %self.connection_id, seq_num = message.seq_num, "message after session end dropped");
            return;
        }
        if let Err(e) = self.handle_message(ctx, message) {
            self.fail(ctx, e);
        }
    }

    /// Runs timers, retries queued output and services resends.
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

    /// Sends an application message.
    ///
    /// # Errors
    /// Returns `SessionError::InvalidState` unless the session is logged on,
    /// or `SessionError::Store` if staging the sequence numbers fails.
    pub fn send_application(
        &mut self,
        ctx: &mut SessionContext<'_>,
        msg_type: MsgType,
        body: Bytes,
    ) -> Result<SendOutcome, SessionError> {
        if !self.state.can_send_application() {
            return Err(self.invalid_state("Active"));
        }
        if !self.replays.is_empty() || !self.pending_app.is_empty() || !self.pending_admin.is_empty() {
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

    /// Starts an orderly logout.
    ///
    /// # Errors
    /// Returns `SessionError::InvalidState` unless the session is logged on.
    pub fn initiate_logout(
        &mut self,
        ctx: &mut SessionContext<'_>,
        text: Option<String>,
    ) -> Result<(), SessionError> {
        if !matches!(self.state, SessionState::Active | SessionState::AwaitingResend) {
            return Err(self.invalid_state("Active"));
        }
        self.send_admin(ctx, AdminMessage::Logout { text })?;
        self.state = SessionState::AwaitingLogout;
        self.logout_sent_at = Some(ctx.now);
        info!(connection = %self.connection_id, "logout sent");
        Ok(())
    }

    /// Unbinds the session after its transport closed.
    ///
    /// Saves the sequence numbers durably and notifies the handler.
    ///
    /// # Returns
    /// A summary for the registry if the session had logged on.
    pub fn on_disconnect(&mut self, ctx: &mut SessionContext<'_>) -> Option<SessionSummary> {
        if self.state == SessionState::Unbound {
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
        self.state = SessionState::Unbound;
        self.replays.clear();
        self.pending_admin.clear();
        self.pending_app.clear();
        self.inbound_buffer.clear();
        self.pending_logon = None;

        let session_id = self.session_id.clone()?;
        info!(session = %session_id, connection = %self.connection_id, %reason, "session unbound");
        if !self.logged_on {
            return None;
        }
        ctx.handler.on_disconnect(&session_id, &reason);
        Some(SessionSummary {
            session_id,
            connection_id: self.connection_id,
            last_sent: self.sequence.last_sent(),
            last_received: self.sequence.last_received(),
            sequence_index: self.sequence.sequence_index(),
            session_ver_id: 0,
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
        message: InboundMessage,
    ) -> Result<(), SessionError> {
        let echoed = match &message.body {
            InboundBody::Admin(AdminMessage::Heartbeat { test_req_id }) => test_req_id.clone(),
            _ => None,
        };
        self.heartbeat.on_message_received(ctx.now, echoed.as_deref());

        match self.state {
            SessionState::Connected => match message.body {
                InboundBody::Admin(AdminMessage::Logon(logon))
                    if self.role == SessionRole::Acceptor =>
                {
                    self.on_logon(ctx, message.seq_num, logon)
                }
                _ => Err(self.invalid_state("Logon")),
            },
            SessionState::LoggingOn => match message.body {
                InboundBody::Admin(AdminMessage::Logon(logon)) => {
                    self.complete_logon(ctx, message.seq_num, logon)
                }
                _ => Err(self.invalid_state("Logon")),
            },
            SessionState::AwaitingAuthentication => Err(self.invalid_state("Active")),
            SessionState::Active | SessionState::AwaitingResend | SessionState::AwaitingLogout => {
                self.on_sequenced(ctx, message)
            }
            SessionState::LoggingOut | SessionState::Disconnected | SessionState::Unbound => {
                Ok(())
            }
        }
    }

    fn on_logon(
        &mut self,
        ctx: &mut SessionContext<'_>,
        seq_num: u64,
        logon: Logon,
    ) -> Result<(), SessionError> {
        let session_id = SessionId::Fix {
            local_comp_id: logon.target_comp_id.clone(),
            remote_comp_id: logon.sender_comp_id.clone(),
            local_sub_id: logon.target_sub_id.clone(),
            remote_sub_id: logon.sender_sub_id.clone(),
        };
        self.session_id = Some(session_id.clone());
        if ctx.bound_sessions.contains(&session_id) {
            return Err(SessionError::DuplicateSession {
                session: session_id.to_string(),
            });
        }

        let decision = ctx.authentication.authenticate(&AuthenticationContext {
            connection_id: self.connection_id,
            session_id: &session_id,
            username: logon.username.as_deref(),
            password: logon.password.as_deref(),
            credentials: None,
        });
        match decision {
            AuthDecision::Accept => self.complete_logon(ctx, seq_num, logon),
            AuthDecision::Reject(reason) => Err(SessionError::AuthenticationRejected { reason }),
            AuthDecision::Pending(reply) => {
                let deadline = ctx.now + self.config.authentication_timeout;
                self.pending_logon = Some(PendingLogon {
                    seq_num,
                    logon,
                    reply: reply.with_deadline(deadline),
                });
                self.state = SessionState::AwaitingAuthentication;
                debug!(connection = %self.connection_id, "awaiting authentication");
                Ok(())
            }
        }
    }

    fn complete_logon(
        &mut self,
        ctx: &mut SessionContext<'_>,
        seq_num: u64,
        logon: Logon,
    ) -> Result<(), SessionError> {
        let Some(session_id) = self.session_id.clone() else {
            return Err(self.invalid_state("known session"));
        };
        if ctx.bound_sessions.contains(&session_id) {
            return Err(SessionError::DuplicateSession {
                session: session_id.to_string(),
            });
        }

        let reset = logon.reset_seq_num && self.config.accept_reset_seq_num;
        if logon.reset_seq_num && !reset {
            warn!(session = %session_id, "ResetSeqNumFlag ignored by configuration");
        }
        if !self.sequence_loaded {
            self.load_sequence(ctx, &session_id, reset)?;
        }
        if logon.heartbeat_interval_secs > 0 {
            self.heartbeat
                .set_interval(Duration::from_secs(u64::from(logon.heartbeat_interval_secs)));
        }
        self.heartbeat.reset(ctx.now);
        self.cod = logon
            .cod
            .map(|request| CodConfig::normalize(request, self.config.cod_max_timeout))
            .unwrap_or_default();

        self.save(ctx)?;
        if self.role == SessionRole::Acceptor {
            let reply = Logon {
                sender_comp_id: logon.target_comp_id.clone(),
                target_comp_id: logon.sender_comp_id.clone(),
                sender_sub_id: logon.target_sub_id.clone(),
                target_sub_id: logon.sender_sub_id.clone(),
                heartbeat_interval_secs: logon.heartbeat_interval_secs,
                reset_seq_num: reset,
                username: None,
                password: None,
                cod: None,
            };
            self.send_admin(ctx, AdminMessage::Logon(reply))?;
        }
        self.state = SessionState::Active;
        self.logged_on = true;
        info!(
            session = %session_id,
            connection = %self.connection_id,
            last_sent = self.sequence.last_sent(),
            last_received = self.sequence.last_received(),
            sequence_index = self.sequence.sequence_index(),
            "session logged on"
        );
        ctx.handler.on_established(&session_id, self.connection_id);

        self.on_sequenced(ctx, InboundMessage::admin(seq_num, AdminMessage::Logon(logon)))
    }

    fn load_sequence(
        &mut self,
        ctx: &mut SessionContext<'_>,
        session_id: &SessionId,
        reset: bool,
    ) -> Result<(), SessionError> {
        let reset = reset || matches!(self.seed, SeedStrategy::ResetOnLogon);
        let explicit = match self.seed {
            SeedStrategy::Explicit {
                last_sent,
                last_received,
            } => Some((last_sent, last_received)),
            _ => None,
        };

        let mut record = ctx
            .sequence_numbers
            .load(session_id)?
            .unwrap_or_else(|| {
                SequenceNumberRecord::new(session_id.clone(), self.config.initial_sequence_index)
            });
        let used = record.sent_seq_num > 0 || record.received_seq_num > 0;
        let lowered = explicit.is_some_and(|(sent, received)| {
            sent < record.sent_seq_num || received < record.received_seq_num
        });
        if used && (reset || lowered) {
            record = ctx.sequence_numbers.reset(session_id)?;
            info!(
                session = %session_id,
                sequence_index = record.sequence_index,
                "sequence numbers reset"
            );
        }

        self.sequence = match explicit {
            Some((sent, received)) => {
                SequenceManager::with_initial(sent, received, record.sequence_index)
            }
            None => SequenceManager::from_record(&record),
        };
        self.sequence_loaded = true;
        Ok(())
    }

    fn on_sequenced(
        &mut self,
        ctx: &mut SessionContext<'_>,
        message: InboundMessage,
    ) -> Result<(), SessionError> {
        if let InboundBody::Admin(AdminMessage::SequenceReset {
            new_seq_no,
            gap_fill: false,
        }) = message.body
        {
            return self.on_sequence_reset(ctx, new_seq_no);
        }

        match self.sequence.validate_incoming(message.seq_num) {
            SequenceResult::TooLow { expected, received } if message.poss_dup => {
                debug!(expected, received, "possible duplicate below expected ignored");
                Ok(())
            }
            SequenceResult::TooLow { expected, received } => {
                Err(SessionError::MsgSeqNumTooLow { expected, received })
            }
            result => {
                if let InboundBody::Admin(AdminMessage::ResendRequest { begin, end }) = message.body {
                    self.on_resend_request(ctx, begin, end)?;
                }
                if let SequenceResult::Gap { expected, received } = result {
                    self.on_gap(ctx, expected, received, message)
                } else {
                    self.process_in_sequence(ctx, message)?;
                    self.drain_buffer(ctx)
                }
            }
        }
    }

    fn on_gap(
        &mut self,
        ctx: &mut SessionContext<'_>,
        expected: u64,
        received: u64,
        message: InboundMessage,
    ) -> Result<(), SessionError> {
        if received - expected > self.config.max_resend_range {
            return Err(SessionError::GapTooLarge {
                expected,
                received,
                max_range: self.config.max_resend_range,
            });
        }
        self.inbound_buffer.entry(received).or_insert(message);

        let end = received - 1;
        if self.resend_requested_through < end {
            let begin = expected.max(self.resend_requested_through + 1);
            info!(connection = %self.connection_id, begin, end, "sequence gap detected, requesting resend");
            self.send_admin(ctx, AdminMessage::ResendRequest { begin, end })?;
            self.resend_requested_through = end;
        }
        if self.state == SessionState::Active {
            self.state = SessionState::AwaitingResend;
        }
        Ok(())
    }

    fn drain_buffer(&mut self, ctx: &mut SessionContext<'_>) -> Result<(), SessionError> {
        while let Some(entry) = self.inbound_buffer.first_entry() {
            let expected = self.sequence.next_target_seq().value();
            if *entry.key() > expected {
                break;
            }
            let message = entry.remove();
            if message.seq_num < expected {
                continue;
            }
            self.process_in_sequence(ctx, message)?;
            if self.state.is_ended() {
                return Ok(());
            }
        }
        if self.inbound_buffer.is_empty() && self.state == SessionState::AwaitingResend {
            self.state = SessionState::Active;
            info!(
                connection = %self.connection_id,
                last_received = self.sequence.last_received(),
                "sequence gap closed"
            );
        }
        Ok(())
    }

    fn process_in_sequence(
        &mut self,
        ctx: &mut SessionContext<'_>,
        message: InboundMessage,
    ) -> Result<(), SessionError> {
        let seq_num = message.seq_num;
        match message.body {
            InboundBody::Admin(AdminMessage::SequenceReset {
                new_seq_no,
                gap_fill: true,
            }) => {
                if new_seq_no <= seq_num {
                    return Err(SessionError::InvalidSequenceReset {
                        expected: seq_num + 1,
                        new_seq_no,
                    });
                }
                self.sequence.set_target_seq(new_seq_no);
                self.stage(ctx)
            }
            InboundBody::Admin(AdminMessage::SequenceReset {
                new_seq_no,
                gap_fill: false,
            }) => self.on_sequence_reset(ctx, new_seq_no),
            InboundBody::Admin(admin) => {
                self.sequence.commit_received(seq_num);
                self.stage(ctx)?;
                self.on_admin(ctx, admin)
            }
            InboundBody::Application { msg_type, body } => {
                self.sequence.commit_received(seq_num);
                if let Some(session_id) = &self.session_id {
                    let context = PublishContext {
                        connection_id: self.connection_id,
                        session_id: Some(session_id),
                        sequence_index: self.sequence.sequence_index(),
                    };
                    ctx.publication
                        .record_inbound(&context, seq_num, &msg_type, &body);
                    ctx.handler.on_message(session_id, seq_num, &msg_type, &body);
                }
                self.stage(ctx)
            }
        }
    }

    fn on_sequence_reset(
        &mut self,
        ctx: &mut SessionContext<'_>,
        new_seq_no: u64,
    ) -> Result<(), SessionError> {
        let expected = self.sequence.next_target_seq().value();
        if new_seq_no == 0 {
            return Err(SessionError::InvalidSequenceReset {
                expected,
                new_seq_no,
            });
        }

        if new_seq_no >= expected {
            self.sequence.set_target_seq(new_seq_no);
            self.inbound_buffer.retain(|&seq_num, _| seq_num >= new_seq_no);
            self.resend_requested_through = self.resend_requested_through.max(new_seq_no - 1);
            self.stage(ctx)?;
        } else {
            let Some(session_id) = self.session_id.clone() else {
                return Err(self.invalid_state("known session"));
            };
            let last_sent = self.sequence.last_sent();
            let record = ctx.sequence_numbers.reset(&session_id)?;
            self.sequence =
                SequenceManager::with_initial(last_sent, new_seq_no - 1, record.sequence_index);
            self.inbound_buffer.clear();
            self.resend_requested_through = 0;
            self.save(ctx)?;
            warn!(
                session = %session_id,
                new_seq_no,
                sequence_index = record.sequence_index,
                "sequence reset lowered the expected sequence number, new sequence index started"
            );
        }
        self.drain_buffer(ctx)
    }

    fn on_admin(
        &mut self,
        ctx: &mut SessionContext<'_>,
        admin: AdminMessage,
    ) -> Result<(), SessionError> {
        match admin {
            AdminMessage::TestRequest { test_req_id } => self.send_admin(
                ctx,
                AdminMessage::Heartbeat {
                    test_req_id: Some(test_req_id),
                },
            ),
            AdminMessage::Logout { text } => {
                if self.state == SessionState::AwaitingLogout {
                    info!(connection = %self.connection_id, "logout acknowledged");
                    self.end(DisconnectReason::LocalLogout);
                } else {
                    info!(connection = %self.connection_id, text = text.as_deref().unwrap_or(""), "counterparty logged out");
                    self.end_with_logout(ctx, None, DisconnectReason::RemoteLogout);
                }
                Ok(())
            }
            AdminMessage::Reject { ref_seq_num, text } => {
                warn!(connection = %self.connection_id, ref_seq_num, %text, "session level reject received");
                Ok(())
            }
            AdminMessage::Heartbeat { .. }
            | AdminMessage::Logon(_)
            | AdminMessage::ResendRequest { .. }
            | AdminMessage::SequenceReset { .. } => Ok(()),
        }
    }

    fn on_resend_request(
        &mut self,
        ctx: &mut SessionContext<'_>,
        begin: u64,
        end: u64,
    ) -> Result<(), SessionError> {
        let last_sent = self.sequence.last_sent();
        let end = if end == 0 || end > last_sent { last_sent } else { end };
        if begin == 0 || begin > end {
            debug!(connection = %self.connection_id, begin, end, "nothing to resend");
            return Ok(());
        }
        info!(connection = %self.connection_id, begin, end, "resend requested");
        self.replays.push(ReplayJob::new(begin, end))?;
        self.service_replays(ctx)?;
        Ok(())
    }

    fn service_replays(&mut self, ctx: &mut SessionContext<'_>) -> Result<usize, SessionError> {
        if self.replays.is_empty() || !self.sequence_loaded {
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
                emit_fix_replay(&mut *publication, &mut *observer, &context, item)?;
                emitted += 1;
                Ok(())
            })?;
            if progress != ReplayProgress::Complete {
                break;
            }
            self.replays.pop_front();
        }
        if emitted > 0 {
            self.heartbeat.on_message_sent(now);
        }
        Ok(emitted)
    }

    fn poll_inner(&mut self, ctx: &mut SessionContext<'_>) -> Result<usize, SessionError> {
        let now = ctx.now;
        let mut work = 0;
        if self.state == SessionState::LoggingOut {
            return Ok(self.poll_logging_out(ctx));
        }
        match self.state {
            SessionState::Connected | SessionState::LoggingOn => {
                if now.saturating_duration_since(self.connected_at) >= self.config.no_logon_timeout {
                    return Err(SessionError::NoLogonTimeout {
                        timeout_ms: millis(self.config.no_logon_timeout),
                    });
                }
            }
            SessionState::AwaitingAuthentication => work += self.poll_authentication(ctx)?,
            _ => {}
        }
        if !self.state.is_logged_on() {
            return Ok(work);
        }

        work += self.flush_admin(ctx)?;
        work += self.service_replays(ctx)?;
        work += self.flush_application(ctx)?;
        work += self.check_heartbeat(ctx)?;

        if self.state == SessionState::AwaitingLogout
            && let Some(sent_at) = self.logout_sent_at
            && now.saturating_duration_since(sent_at) >= self.config.logout_timeout
        {
            warn!(
                connection = %self.connection_id,
                timeout_ms = millis(self.config.logout_timeout),
                "logout not acknowledged, disconnecting"
            );
            self.end(DisconnectReason::LocalLogout);
            work += 1;
        }
        Ok(work)
    }

    fn poll_authentication(&mut self, ctx: &mut SessionContext<'_>) -> Result<usize, SessionError> {
        let outcome = match self.pending_logon.as_mut() {
            Some(pending) => pending.reply.poll(ctx.now),
            None => return Ok(0),
        };
        match outcome {
            ReplyPoll::Pending => Ok(0),
            ReplyPoll::Ready(AuthOutcome::Accept) => {
                let Some(pending) = self.pending_logon.take() else {
                    return Ok(0);
                };
                self.complete_logon(ctx, pending.seq_num, pending.logon)?;
                Ok(1)
            }
            ReplyPoll::Ready(AuthOutcome::Reject(reason)) => {
                Err(SessionError::AuthenticationRejected { reason })
            }
            ReplyPoll::TimedOut => Err(SessionError::AuthenticationTimeout {
                timeout_ms: millis(self.config.authentication_timeout),
            }),
            ReplyPoll::Dropped => Err(SessionError::AuthenticationRejected {
                reason: "authentication abandoned".to_string(),
            }),
        }
    }

    fn check_heartbeat(&mut self, ctx: &mut SessionContext<'_>) -> Result<usize, SessionError> {
        let now = ctx.now;
        if self.heartbeat.is_timed_out(now) {
            return Err(SessionError::HeartbeatTimeout {
                elapsed_ms: millis(self.heartbeat.time_since_last_received(now)),
            });
        }
        if !self.pending_admin.is_empty() {
            return Ok(0);
        }
        if self.heartbeat.should_send_test_request(now) {
            let test_req_id = self.heartbeat.next_test_req_id();
            self.send_admin(
                ctx,
                AdminMessage::TestRequest {
                    test_req_id: test_req_id.clone(),
                },
            )?;
            self.heartbeat.on_test_request_sent(test_req_id, now);
            return Ok(1);
        }
        if self.heartbeat.should_send_heartbeat(now) {
            self.send_admin(ctx, AdminMessage::Heartbeat { test_req_id: None })?;
            return Ok(1);
        }
        Ok(0)
    }

    fn fail(&mut self, ctx: &mut SessionContext<'_>, error: SessionError) {
        warn!(
            connection = %self.connection_id,
            session = ?self.session_id,
            state = %self.state,
            %error,
            "session failed"
        );
        if self.session_id.is_some() {
            let text = Some(error.to_string());
            self.end_with_logout(ctx, text, DisconnectReason::Error(error));
        } else {
            self.end(DisconnectReason::Error(error));
        }
    }

    /// Sends a session-ending Logout, then ends the session.
    ///
    /// Under backpressure the Logout is queued and the session waits in
    /// `LoggingOut`; [`Session::poll`] publishes it and ends the session.
    fn end_with_logout(
        &mut self,
        ctx: &mut SessionContext<'_>,
        text: Option<String>,
        reason: DisconnectReason,
    ) {
        let logout = AdminMessage::Logout { text };
        self.replays.clear();
        self.pending_app.clear();
        self.pending_admin.clear();
        match self.publish_admin(ctx, &logout) {
            Ok(true) => self.end(reason),
            Ok(false) => {
                debug!(connection = %self.connection_id, "logout queued, publication backpressured");
                self.pending_admin.push_back(logout);
                self.pending_logon = None;
                self.state = SessionState::LoggingOut;
                self.disconnect = Some(reason);
                self.logout_sent_at = Some(ctx.now);
            }
            Err(e) => {
                warn!(connection = %self.connection_id, error = %e, "failed to send logout");
                self.end(reason);
            }
        }
    }

    fn poll_logging_out(&mut self, ctx: &mut SessionContext<'_>) -> usize {
        let sent = self.flush_admin(ctx).unwrap_or_else(|e| {
            warn!(connection = %self.connection_id, error = %e, "failed to send logout");
            self.pending_admin.clear();
            0
        });
        if !self.pending_admin.is_empty() {
            let expired = self.logout_sent_at.is_none_or(|queued_at| {
                ctx.now.saturating_duration_since(queued_at) >= self.config.logout_timeout
            });
            if !expired {
                return sent;
            }
            warn!(
                connection = %self.connection_id,
                timeout_ms = millis(self.config.logout_timeout),
                "logout still backpressured, disconnecting"
            );
        }
        let reason = self
            .disconnect
            .take()
            .unwrap_or(DisconnectReason::LocalLogout);
        self.end(reason);
        sent + 1
    }

    fn end(&mut self, reason: DisconnectReason) {
        self.state = SessionState::Disconnected;
        self.disconnect = Some(reason);
        self.replays.clear();
        self.pending_logon = None;
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

    /// Publishes an admin message with the next sequence number.
    ///
    /// # Returns
    /// False if the publication backpressured; nothing was consumed.
    ///
    /// # Errors
    /// Returns `SessionError::Encode` if the frame cannot be encoded, again
    /// without consuming the sequence number.
    fn publish_admin(
        &mut self,
        ctx: &mut SessionContext<'_>,
        message: &AdminMessage,
    ) -> Result<bool, SessionError> {
        let seq_num = self.sequence.next_sender_seq();
        let frame = OutboundFrame::Admin {
            seq_num: seq_num.value(),
            poss_dup: false,
            message,
        };
        match ctx.publication.publish(&self.publish_context(), &frame) {
            Ok(()) => {}
            Err(PublishError::Backpressure) => return Ok(false),
            Err(PublishError::Encode(e)) => return Err(e.into()),
        }
        self.sequence.commit_sent(seq_num);
        self.heartbeat.on_message_sent(ctx.now);
        self.stage(ctx)?;
        Ok(true)
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
        self.heartbeat.on_message_sent(ctx.now);
        self.stage(ctx)?;
        Ok(Some(seq_num.value()))
    }

    fn send_admin(
        &mut self,
        ctx: &mut SessionContext<'_>,
        message: AdminMessage,
    ) -> Result<(), SessionError> {
        if self.pending_admin.is_empty() && self.publish_admin(ctx, &message)? {
            return Ok(());
        }
        debug!(connection = %self.connection_id, msg_type = %message.msg_type(), "admin message queued");
        self.pending_admin.push_back(message);
        Ok(())
    }

    fn flush_admin(&mut self, ctx: &mut SessionContext<'_>) -> Result<usize, SessionError> {
        let mut sent = 0;
        while let Some(message) = self.pending_admin.pop_front() {
            if !self.publish_admin(ctx, &message)? {
                self.pending_admin.push_front(message);
                break;
            }
            sent += 1;
        }
        Ok(sent)
    }

    fn flush_application(&mut self, ctx: &mut SessionContext<'_>) -> Result<usize, SessionError> {
        if !self.replays.is_empty() || !self.pending_admin.is_empty() {
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

    fn stage(&self, ctx: &mut SessionContext<'_>) -> Result<(), SessionError> {
        if let (true, Some(session_id)) = (self.sequence_loaded, &self.session_id) {
            ctx.sequence_numbers
                .stage(&self.sequence.to_record(session_id, 0))?;
        }
        Ok(())
    }

    fn save(&self, ctx: &mut SessionContext<'_>) -> Result<(), SessionError> {
        if let (true, Some(session_id)) = (self.sequence_loaded, &self.session_id) {
            ctx.sequence_numbers
                .save(&self.sequence.to_record(session_id, 0))?;
        }
        Ok(())
    }
}
