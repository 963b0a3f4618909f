/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! The framer: owner of every connection on the engine thread.
//!
//! Transport events are pushed in through [`Framer::on_connect`],
//! [`Framer::on_bytes`] and [`Framer::on_disconnect`]; timers, archiving and
//! cancel-on-disconnect advance in [`Framer::poll`]. Each call lends the
//! connection a [`SessionContext`] built from the framer's own capabilities,
//! so nothing here is shared or locked.

use crate::application::Application;
use crate::codec::{Codec, Transport};
use crate::config::EngineConfiguration;
use crate::idle::Backoff;
use crate::publication::{ArchiveQueue, FramerPublication};
use crate::registry::SessionRegistry;
use bytes::Bytes;
use crossbeam_channel::TrySendError;
use irongate_core::error::{EngineError, GatewayError, SessionError};
use irongate_core::message::{InboundFrame, MsgType};
use irongate_core::types::{ConnectionId, SessionId, Timestamp};
use irongate_session::capability::{
    AcceptAll, AuthenticationStrategy, ConnectionOwnership, IgnoreRetransmits, OwnAll,
    Publication, RetransmitObserver,
};
use irongate_session::cod::CancelOnDisconnectScheduler;
use irongate_session::config::SessionConfig;
use irongate_session::fixp::FixPConnection;
use irongate_session::session::{SeedStrategy, SendOutcome, Session, SessionContext, SessionSummary};
use irongate_session::state::FixPState;
use irongate_store::{ArchiverHandle, LivenessMarker, MessageArchive, SequenceNumbers};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// Session protocol spoken on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// FIX tag=value session layer.
    Fix,
    /// FIXP binary session layer.
    FixP,
}

/// Pluggable parts of an engine.
pub struct Capabilities<C, T, A> {
    codec: C,
    transport: T,
    application: A,
    authentication: Box<dyn AuthenticationStrategy>,
    ownership: Box<dyn ConnectionOwnership>,
    retransmit_observer: Box<dyn RetransmitObserver>,
}

impl<C, T, A> Capabilities<C, T, A> {
    /// Creates capabilities that accept every logon and own every session.
    ///
    /// # Arguments
    /// * `codec` - Wire codec
    /// * `transport` - Byte sink for the connections
    /// * `application` - Application callbacks
    #[must_use]
    pub fn new(codec: C, transport: T, application: A) -> Self {
        Self {
            codec,
            transport,
            application,
            authentication: Box::new(AcceptAll),
            ownership: Box::new(OwnAll),
            retransmit_observer: Box::new(IgnoreRetransmits),
        }
    }

    /// Sets the authentication strategy.
    #[must_use]
    pub fn with_authentication(mut self, strategy: impl AuthenticationStrategy + 'static) -> Self {
        self.authentication = Box::new(strategy);
        self
    }

    /// Sets the FIXP connection ownership arbiter.
    #[must_use]
    pub fn with_ownership(mut self, ownership: impl ConnectionOwnership + 'static) -> Self {
        self.ownership = Box::new(ownership);
        self
    }

    /// Sets the observer of retransmitted messages.
    #[must_use]
    pub fn with_retransmit_observer(mut self, observer: impl RetransmitObserver + 'static) -> Self {
        self.retransmit_observer = Box::new(observer);
        self
    }
}

enum Connection {
    Fix(Session),
    FixP(FixPConnection),
}

impl Connection {
    const fn protocol(&self) -> Protocol {
        match self {
            Self::Fix(_) => Protocol::Fix,
            Self::FixP(_) => Protocol::FixP,
        }
    }

    const fn session_id(&self) -> Option<&SessionId> {
        match self {
            Self::Fix(session) => session.session_id(),
            Self::FixP(connection) => connection.session_id(),
        }
    }

    fn is_bound(&self) -> bool {
        match self {
            Self::Fix(session) => session.state().is_logged_on(),
            Self::FixP(connection) => matches!(
                connection.state(),
                FixPState::Negotiated | FixPState::Established | FixPState::Terminating
            ),
        }
    }

    const fn wants_disconnect(&self) -> bool {
        match self {
            Self::Fix(session) => session.wants_disconnect(),
            Self::FixP(connection) => connection.wants_disconnect(),
        }
    }

    fn on_frame(&mut self, ctx: &mut SessionContext<'_>, frame: InboundFrame) {
        match (self, frame) {
            (Self::Fix(session), InboundFrame::Fix(message)) => session.on_message(ctx, message),
            (Self::FixP(connection), InboundFrame::FixP(message)) => {
                connection.on_message(ctx, message);
            }
            (Self::FixP(connection), InboundFrame::FixPApplication(message)) => {
                connection.on_application(ctx, message);
            }
            (connection, frame) => warn!(
                protocol = ?connection.protocol(),
                ?frame,
                "frame does not match the connection protocol"
            ),
        }
    }

    fn poll(&mut self, ctx: &mut SessionContext<'_>) -> usize {
        match self {
            Self::Fix(session) => session.poll(ctx),
            Self::FixP(connection) => connection.poll(ctx),
        }
    }

    fn send_application(
        &mut self,
        ctx: &mut SessionContext<'_>,
        msg_type: MsgType,
        body: Bytes,
    ) -> Result<SendOutcome, SessionError> {
        match self {
            Self::Fix(session) => session.send_application(ctx, msg_type, body),
            Self::FixP(connection) => connection.send_application(ctx, msg_type, body),
        }
    }

    fn logout(&mut self, ctx: &mut SessionContext<'_>, reason: String) -> Result<(), SessionError> {
        match self {
            Self::Fix(session) => session.initiate_logout(ctx, Some(reason)),
            Self::FixP(connection) => connection.initiate_terminate(ctx, reason),
        }
    }

    fn on_disconnect(&mut self, ctx: &mut SessionContext<'_>) -> Option<SessionSummary> {
        match self {
            Self::Fix(session) => session.on_disconnect(ctx),
            Self::FixP(connection) => connection.on_disconnect(ctx),
        }
    }
}

struct Io<C, T> {
    codec: C,
    transport: T,
    archive_queue: ArchiveQueue,
    archiving: bool,
    log_inbound: bool,
    log_outbound: bool,
}

impl<C: Codec, T: Transport> Io<C, T> {
    fn publication(&mut self) -> FramerPublication<'_, C, T> {
        let archive = self.archiving.then_some(&mut self.archive_queue);
        FramerPublication::new(
            &mut self.codec,
            &mut self.transport,
            archive,
            self.log_inbound,
            self.log_outbound,
        )
    }
}

struct Resources<A> {
    sequence_numbers: Box<dyn SequenceNumbers>,
    archive: Arc<dyn MessageArchive>,
    application: A,
    authentication: Box<dyn AuthenticationStrategy>,
    ownership: Box<dyn ConnectionOwnership>,
    retransmit_observer: Box<dyn RetransmitObserver>,
}

impl<A: Application> Resources<A> {
    fn context<'a>(
        &'a mut self,
        now: Instant,
        publication: &'a mut dyn Publication,
        bound_sessions: &'a HashSet<SessionId>,
    ) -> SessionContext<'a> {
        SessionContext {
            now,
            sequence_numbers: self.sequence_numbers.as_mut(),
            archive: self.archive.as_ref(),
            publication,
            handler: &mut self.application,
            authentication: self.authentication.as_mut(),
            ownership: self.ownership.as_mut(),
            retransmit_observer: self.retransmit_observer.as_mut(),
            bound_sessions,
        }
    }
}

/// Single-threaded owner of connections, timers and the archive queue.
pub struct Framer<C, T, A> {
    config: Arc<EngineConfiguration>,
    session_config: Arc<SessionConfig>,
    io: Io<C, T>,
    resources: Resources<A>,
    connections: HashMap<ConnectionId, Connection>,
    bindings: HashMap<ConnectionId, SessionId>,
    bound: HashSet<SessionId>,
    cod: CancelOnDisconnectScheduler,
    registry: SessionRegistry,
    archiver: Option<ArchiverHandle>,
    liveness: Option<LivenessMarker>,
    backoff: Backoff,
}

impl<C: Codec, T: Transport, A: Application> Framer<C, T, A> {
    /// Creates a framer over the given stores.
    ///
    /// Nothing is archived until an archiver is attached; sessions still
    /// replay from `archive`.
    ///
    /// # Arguments
    /// * `config` - Validated engine configuration
    /// * `capabilities` - Codec, transport, application and arbiters
    /// * `sequence_numbers` - Persistent sequence numbers
    /// * `archive` - Archive read by resends
    #[must_use]
    pub fn new(
        config: Arc<EngineConfiguration>,
        capabilities: Capabilities<C, T, A>,
        sequence_numbers: Box<dyn SequenceNumbers>,
        archive: Arc<dyn MessageArchive>,
    ) -> Self {
        let Capabilities {
            codec,
            transport,
            application,
            authentication,
            ownership,
            retransmit_observer,
        } = capabilities;
        Self {
            session_config: Arc::new(config.session.clone()),
            io: Io {
                codec,
                transport,
                archive_queue: ArchiveQueue::new(config.archiver_channel_capacity),
                archiving: false,
                log_inbound: config.session.log_inbound,
                log_outbound: config.session.log_outbound,
            },
            resources: Resources {
                sequence_numbers,
                archive,
                application,
                authentication,
                ownership,
                retransmit_observer,
            },
            connections: HashMap::new(),
            bindings: HashMap::new(),
            bound: HashSet::new(),
            cod: CancelOnDisconnectScheduler::new(),
            registry: SessionRegistry::new(),
            archiver: None,
            liveness: None,
            backoff: Backoff::default(),
            config,
        }
    }

    pub(crate) fn with_archiver(mut self, archiver: ArchiverHandle) -> Self {
        self.io.archiving = true;
        self.archiver = Some(archiver);
        self
    }

    pub(crate) fn with_liveness(mut self, marker: LivenessMarker) -> Self {
        self.liveness = Some(marker);
        self
    }

    /// Returns the engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfiguration {
        &self.config
    }

    /// Registers a connection accepted by the transport.
    ///
    /// # Errors
    /// Returns `EngineError::InvalidConfiguration` for a FIXP connection when
    /// the engine does not accept FIXP.
    pub fn on_connect(
        &mut self,
        connection_id: ConnectionId,
        protocol: Protocol,
        now: Instant,
    ) -> Result<(), EngineError> {
        let connection = match protocol {
            Protocol::Fix => Connection::Fix(Session::acceptor(
                connection_id,
                Arc::clone(&self.session_config),
                SeedStrategy::Persisted,
                now,
            )),
            Protocol::FixP if self.config.accept_fixp => Connection::FixP(FixPConnection::acceptor(
                connection_id,
                Arc::clone(&self.session_config),
                now,
            )),
            Protocol::FixP => {
                self.io.transport.close(connection_id);
                return Err(EngineError::InvalidConfiguration(
                    "FIXP connections are not accepted".to_string(),
                ));
            }
        };
        debug!(connection = %connection_id, ?protocol, "connection accepted");
        self.connections.insert(connection_id, connection);
        Ok(())
    }

    /// Starts a FIX session on a connection the transport opened and sends
    /// its Logon.
    ///
    /// # Errors
    /// Returns `SessionError` if the Logon could not be started; the
    /// connection is closed.
    pub fn initiate(
        &mut self,
        connection_id: ConnectionId,
        session_id: SessionId,
        seed: SeedStrategy,
        now: Instant,
    ) -> Result<(), SessionError> {
        let session = Session::initiator(
            connection_id,
            session_id,
            Arc::clone(&self.session_config),
            seed,
            now,
        );
        self.connections.insert(connection_id, Connection::Fix(session));
        let result = self
            .with_connection(connection_id, now, |connection, ctx| match connection {
                Connection::Fix(session) => session.initiate_logon(ctx),
                Connection::FixP(_) => Ok(()),
            })
            .unwrap_or(Ok(()));
        if let Err(e) = &result {
            warn!(connection = %connection_id, error = %e, "logon could not be initiated");
            self.io.transport.close(connection_id);
            self.on_disconnect(connection_id, now);
        }
        result
    }

    /// Decodes and dispatches one complete inbound message.
    ///
    /// # Errors
    /// Returns `GatewayError::Decode` if the codec rejects the bytes; the
    /// connection stays open.
    pub fn on_bytes(
        &mut self,
        connection_id: ConnectionId,
        bytes: &[u8],
        now: Instant,
    ) -> Result<(), GatewayError> {
        let frame = self.io.codec.decode(bytes).inspect_err(|e| {
            warn!(connection = %connection_id, error = %e, "undecodable message dropped");
        })?;
        self.on_frame(connection_id, frame, now);
        Ok(())
    }

    /// Dispatches a decoded inbound frame.
    pub fn on_frame(&mut self, connection_id: ConnectionId, frame: InboundFrame, now: Instant) {
        let handled = self.with_connection(connection_id, now, |connection, ctx| {
            connection.on_frame(ctx, frame);
        });
        if handled.is_none() {
            debug!(connection = %connection_id, "frame for unknown connection dropped");
            return;
        }
        self.after_dispatch(connection_id, now);
    }

    /// Handles a connection the transport lost or closed.
    ///
    /// The session is unbound, its summary filed in the registry and
    /// cancel-on-disconnect armed if the session asked for it.
    ///
    /// # Returns
    /// The summary of a session that had logged on.
    pub fn on_disconnect(&mut self, connection_id: ConnectionId, now: Instant) -> Option<SessionSummary> {
        let summary = self
            .with_connection(connection_id, now, |connection, ctx| connection.on_disconnect(ctx))
            .flatten();
        self.connections.remove(&connection_id);
        if let Some(session_id) = self.bindings.remove(&connection_id) {
            self.bound.remove(&session_id);
        }

        let summary = summary?;
        self.cod.arm(
            &summary.session_id,
            connection_id,
            &summary.cod,
            summary.trigger,
            now,
        );
        info!(
            session = %summary.session_id,
            connection = %connection_id,
            reason = %summary.reason,
            "session filed in registry"
        );
        self.registry.record(summary.clone());
        Some(summary)
    }

    /// Sends an application message on a bound session.
    ///
    /// # Errors
    /// Returns `SessionError::UnknownSession` if the session is not bound
    /// here, or the session's own error if it cannot send.
    pub fn send(
        &mut self,
        session_id: &SessionId,
        msg_type: MsgType,
        body: Bytes,
        now: Instant,
    ) -> Result<SendOutcome, SessionError> {
        let connection_id = self.connection_of(session_id)?;
        let result = self
            .with_connection(connection_id, now, |connection, ctx| {
                connection.send_application(ctx, msg_type, body)
            })
            .unwrap_or_else(|| Err(unknown_session(session_id)));
        self.after_dispatch(connection_id, now);
        result
    }

    /// Starts an orderly Logout or Terminate of a bound session.
    ///
    /// # Errors
    /// Returns `SessionError::UnknownSession` if the session is not bound
    /// here, or the session's own error if it is not in a state to leave.
    pub fn logout(
        &mut self,
        session_id: &SessionId,
        reason: impl Into<String>,
        now: Instant,
    ) -> Result<(), SessionError> {
        let connection_id = self.connection_of(session_id)?;
        let reason = reason.into();
        let result = self
            .with_connection(connection_id, now, |connection, ctx| connection.logout(ctx, reason))
            .unwrap_or_else(|| Err(unknown_session(session_id)));
        self.after_dispatch(connection_id, now);
        result
    }

    /// Runs one duty cycle.
    ///
    /// # Returns
    /// The amount of work done; zero means the caller may idle.
    pub fn poll(&mut self, now: Instant) -> usize {
        let mut work = self.drain_acks();
        work += self.flush_archive_queue(now);
        work += self.refresh_liveness();

        let connection_ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        for connection_id in connection_ids {
            work += self
                .with_connection(connection_id, now, |connection, ctx| connection.poll(ctx))
                .unwrap_or(0);
            self.after_dispatch(connection_id, now);
        }

        work + self.cod.poll(now, &mut self.resources.application)
    }

    /// Returns true if a session is bound to one of this engine's connections.
    #[must_use]
    pub fn is_bound(&self, session_id: &SessionId) -> bool {
        self.bound.contains(session_id)
    }

    /// Returns the number of open connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Returns the summaries of disconnected sessions.
    #[must_use]
    pub const fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Returns the cancel-on-disconnect scheduler.
    #[must_use]
    pub const fn cod_scheduler(&self) -> &CancelOnDisconnectScheduler {
        &self.cod
    }

    /// Returns the application.
    #[must_use]
    pub const fn application(&self) -> &A {
        &self.resources.application
    }

    /// Returns the application mutably.
    pub fn application_mut(&mut self) -> &mut A {
        &mut self.resources.application
    }

    /// Returns the transport.
    #[must_use]
    pub const fn transport(&self) -> &T {
        &self.io.transport
    }

    /// Returns the transport mutably.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.io.transport
    }

    /// Returns the codec mutably.
    pub fn codec_mut(&mut self) -> &mut C {
        &mut self.io.codec
    }

    /// Returns the number of archive requests waiting for the archiver.
    #[must_use]
    pub fn archive_backlog(&self) -> usize {
        self.io.archive_queue.len()
    }

    /// Disconnects every connection, drains the archive queue and stops
    /// the archiver.
    ///
    /// # Errors
    /// Returns `EngineError::Store` if the archiver failed while stopping.
    pub(crate) fn shutdown(&mut self, now: Instant) -> Result<(), EngineError> {
        let connection_ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        for connection_id in connection_ids {
            self.io.transport.close(connection_id);
            self.on_disconnect(connection_id, now);
        }

        let result = match self.archiver.take() {
            Some(archiver) => {
                self.drain_archive_queue(&archiver);
                archiver.stop().map_err(EngineError::from)
            }
            None => Ok(()),
        };
        if let Some(marker) = self.liveness.take() {
            marker.release();
        }
        info!(dir = %self.config.log_file_dir.display(), "framer shut down");
        result
    }

    fn with_connection<R>(
        &mut self,
        connection_id: ConnectionId,
        now: Instant,
        f: impl FnOnce(&mut Connection, &mut SessionContext<'_>) -> R,
    ) -> Option<R> {
        let Self {
            io,
            resources,
            connections,
            bound,
            ..
        } = self;
        let connection = connections.get_mut(&connection_id)?;
        let mut publication = io.publication();
        let mut ctx = resources.context(now, &mut publication, bound);
        Some(f(connection, &mut ctx))
    }

    fn connection_of(&self, session_id: &SessionId) -> Result<ConnectionId, SessionError> {
        self.bindings
            .iter()
            .find_map(|(connection_id, bound)| (bound == session_id).then_some(*connection_id))
            .ok_or_else(|| unknown_session(session_id))
    }

    fn after_dispatch(&mut self, connection_id: ConnectionId, now: Instant) {
        let Some(connection) = self.connections.get(&connection_id) else {
            return;
        };
        if !self.bindings.contains_key(&connection_id)
            && connection.is_bound()
            && let Some(session_id) = connection.session_id().cloned()
        {
            self.cod.cancel(&session_id);
            self.registry.remove(&session_id);
            self.bound.insert(session_id.clone());
            self.bindings.insert(connection_id, session_id);
        }
        if connection.wants_disconnect() {
            self.io.transport.close(connection_id);
            self.on_disconnect(connection_id, now);
        }
    }

    fn drain_acks(&self) -> usize {
        self.archiver.as_ref().map_or(0, |archiver| {
            archiver.poll_acks(|ack| {
                trace!(
                    session = %ack.session_id,
                    direction = ?ack.direction,
                    seq_num = ack.seq_num,
                    position = ack.position,
                    "archived"
                );
            })
        })
    }

    fn flush_archive_queue(&mut self, now: Instant) -> usize {
        if self.io.archive_queue.is_empty() || !self.backoff.is_ready(now) {
            return 0;
        }
        let Some(archiver) = self.archiver.as_ref() else {
            return 0;
        };
        let mut flushed = 0;
        while let Some(request) = self.io.archive_queue.pop_front() {
            match archiver.try_archive(request) {
                Ok(()) => flushed += 1,
                Err(TrySendError::Full(request)) => {
                    self.io.archive_queue.push_front(request);
                    let delay = self.backoff.on_failure(now);
                    debug!(
                        queued = self.io.archive_queue.len(),
                        delay_us = delay.as_micros(),
                        "archiver channel full, backing off"
                    );
                    return flushed;
                }
                Err(TrySendError::Disconnected(_)) => {
                    error!(
                        dropped = self.io.archive_queue.len() + 1,
                        "archiver stopped, archiving disabled"
                    );
                    self.io.archive_queue.clear();
                    self.io.archiving = false;
                    return flushed;
                }
            }
        }
        self.backoff.reset();
        flushed
    }

    fn drain_archive_queue(&mut self, archiver: &ArchiverHandle) {
        let mut backoff = Backoff::default();
        while let Some(request) = self.io.archive_queue.pop_front() {
            match archiver.try_archive(request) {
                Ok(()) => backoff.reset(),
                Err(TrySendError::Full(request)) => {
                    self.io.archive_queue.push_front(request);
                    archiver.poll_acks(|_| {});
                    std::thread::sleep(backoff.on_failure(Instant::now()));
                }
                Err(TrySendError::Disconnected(_)) => {
                    error!(
                        dropped = self.io.archive_queue.len() + 1,
                        "archiver stopped before the queue drained"
                    );
                    self.io.archive_queue.clear();
                }
            }
        }
    }

    fn refresh_liveness(&mut self) -> usize {
        let Some(marker) = self.liveness.as_mut() else {
            return 0;
        };
        let now = Timestamp::now();
        if !marker.refresh_due(now) {
            return 0;
        }
        if let Err(e) = marker.refresh(now) {
            error!(error = %e, "failed to refresh the liveness marker");
        }
        1
    }
}

fn unknown_session(session_id: &SessionId) -> SessionError {
    SessionError::UnknownSession {
        session: session_id.to_string(),
    }
}
