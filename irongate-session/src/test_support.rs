/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Recording capabilities shared by the session and FIXP tests.

use crate::capability::{
    AcceptAll, AuthenticationStrategy, ConnectionOwnership, DisconnectReason, IgnoreRetransmits,
    OwnAll, Publication, PublishContext, PublishError, SessionHandler,
};
use crate::session::SessionContext;
use bytes::Bytes;
use irongate_core::error::EncodeError;
use irongate_core::message::{AdminMessage, FixPMessage, MsgType, OutboundFrame};
use irongate_core::types::{ConnectionId, Direction, SessionId};
use irongate_store::{ArchivedMessage, MemoryStore, SequenceNumbers};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

/// An owned copy of a published frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Admin {
        seq_num: u64,
        poss_dup: bool,
        message: AdminMessage,
    },
    FixP(FixPMessage),
    Application {
        seq_num: u64,
        msg_type: MsgType,
    },
    Replay {
        seq_num: u64,
    },
}

/// Publication that records frames and archives them synchronously.
///
/// Refuses everything while `blocked`; frames of the `unencodable` type
/// fail to encode.
pub struct RecordingPublication {
    pub sent: Vec<Sent>,
    pub blocked: bool,
    pub unencodable: Option<MsgType>,
    pub archive: Arc<MemoryStore>,
}

impl Publication for RecordingPublication {
    fn publish(
        &mut self,
        context: &PublishContext<'_>,
        frame: &OutboundFrame<'_>,
    ) -> Result<(), PublishError> {
        if self.blocked {
            return Err(PublishError::Backpressure);
        }
        let msg_type = frame.msg_type();
        if self.unencodable.as_ref() == Some(&msg_type) {
            return Err(EncodeError::Unsupported(msg_type.to_string()).into());
        }
        if frame.is_archivable()
            && let (Some(session_id), Some(seq_num)) = (context.session_id, frame.seq_num())
        {
            let body = match frame {
                OutboundFrame::Application { body, .. } => (*body).clone(),
                other => Bytes::from(format!("{other:?}")),
            };
            self.archive.archive(
                session_id,
                Direction::Outbound,
                context.sequence_index,
                ArchivedMessage {
                    seq_num,
                    msg_type,
                    body,
                },
            );
        }
        self.sent.push(match *frame {
            OutboundFrame::Admin {
                seq_num,
                poss_dup,
                message,
            } => Sent::Admin {
                seq_num,
                poss_dup,
                message: message.clone(),
            },
            OutboundFrame::FixP(message) => Sent::FixP(message.clone()),
            OutboundFrame::Application {
                seq_num, msg_type, ..
            } => Sent::Application {
                seq_num,
                msg_type: msg_type.clone(),
            },
            OutboundFrame::Replay { seq_num, .. } => Sent::Replay { seq_num },
        });
        Ok(())
    }
}

/// Handler that records every callback.
#[derive(Default)]
pub struct RecordingHandler {
    pub established: Vec<(SessionId, ConnectionId)>,
    pub messages: Vec<(u64, MsgType)>,
    pub disconnects: Vec<DisconnectReason>,
}

impl SessionHandler for RecordingHandler {
    fn on_established(&mut self, session_id: &SessionId, connection_id: ConnectionId) {
        self.established.push((session_id.clone(), connection_id));
    }

    fn on_message(&mut self, _session_id: &SessionId, seq_num: u64, msg_type: &MsgType, _body: &Bytes) {
        self.messages.push((seq_num, msg_type.clone()));
    }

    fn on_disconnect(&mut self, _session_id: &SessionId, reason: &DisconnectReason) {
        self.disconnects.push(reason.clone());
    }
}

/// Everything a session context borrows.
pub struct Harness {
    pub sequence_numbers: MemoryStore,
    pub archive: Arc<MemoryStore>,
    pub publication: RecordingPublication,
    pub handler: RecordingHandler,
    pub authentication: Box<dyn AuthenticationStrategy>,
    pub ownership: Box<dyn ConnectionOwnership>,
    pub observer: IgnoreRetransmits,
    pub bound: HashSet<SessionId>,
}

impl Harness {
    pub fn new() -> Self {
        let archive = Arc::new(MemoryStore::new());
        Self {
            sequence_numbers: MemoryStore::new(),
            archive: Arc::clone(&archive),
            publication: RecordingPublication {
                sent: Vec::new(),
                blocked: false,
                unencodable: None,
                archive,
            },
            handler: RecordingHandler::default(),
            authentication: Box::new(AcceptAll),
            ownership: Box::new(OwnAll),
            observer: IgnoreRetransmits,
            bound: HashSet::new(),
        }
    }

    pub fn ctx(&mut self, now: Instant) -> SessionContext<'_> {
        SessionContext {
            now,
            sequence_numbers: &mut self.sequence_numbers,
            archive: &*self.archive,
            publication: &mut self.publication,
            handler: &mut self.handler,
            authentication: &mut *self.authentication,
            ownership: &mut *self.ownership,
            retransmit_observer: &mut self.observer,
            bound_sessions: &self.bound,
        }
    }

    /// Same as [`Harness::ctx`] over another sequence number store.
    pub fn ctx_with<'a>(
        &'a mut self,
        now: Instant,
        sequence_numbers: &'a mut dyn SequenceNumbers,
    ) -> SessionContext<'a> {
        SessionContext {
            now,
            sequence_numbers,
            archive: &*self.archive,
            publication: &mut self.publication,
            handler: &mut self.handler,
            authentication: &mut *self.authentication,
            ownership: &mut *self.ownership,
            retransmit_observer: &mut self.observer,
            bound_sessions: &self.bound,
        }
    }

    /// Returns the admin messages sent so far.
    pub fn admin_sent(&self) -> Vec<(u64, bool, AdminMessage)> {
        self.publication
            .sent
            .iter()
            .filter_map(|sent| match sent {
                Sent::Admin {
                    seq_num,
                    poss_dup,
                    message,
                } => Some((*seq_num, *poss_dup, message.clone())),
                _ => None,
            })
            .collect()
    }

    /// Returns the FIXP messages sent so far.
    pub fn fixp_sent(&self) -> Vec<FixPMessage> {
        self.publication
            .sent
            .iter()
            .filter_map(|sent| match sent {
                Sent::FixP(message) => Some(message.clone()),
                _ => None,
            })
            .collect()
    }
}
