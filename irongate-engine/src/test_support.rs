/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! In-memory codec, transport and application for engine tests.

use crate::codec::{Codec, Transport};
use bytes::Bytes;
use irongate_core::error::{DecodeError, EncodeError};
use irongate_core::message::{InboundFrame, MsgType, OutboundFrame};
use irongate_core::types::{ConnectionId, SessionId};
use irongate_session::capability::{
    Backpressure, CancelOnDisconnectHandler, DisconnectReason, SessionHandler,
};
use irongate_session::cod::CodContext;
use std::collections::VecDeque;

/// Encodes frames as their debug text and decodes from a queue of frames.
///
/// Frames of the `unencodable` type fail to encode.
#[derive(Debug, Default)]
pub struct TextCodec {
    pub inbound: VecDeque<InboundFrame>,
    pub unencodable: Option<MsgType>,
}

impl Codec for TextCodec {
    fn encode(&mut self, frame: &OutboundFrame<'_>) -> Result<Bytes, EncodeError> {
        let msg_type = frame.msg_type();
        if self.unencodable.as_ref() == Some(&msg_type) {
            return Err(EncodeError::Unsupported(msg_type.to_string()));
        }
        Ok(Bytes::from(format!("{frame:?}")))
    }

    fn decode(&mut self, _bytes: &[u8]) -> Result<InboundFrame, DecodeError> {
        self.inbound.pop_front().ok_or(DecodeError::Incomplete)
    }
}

/// Records everything sent; refuses bytes while `blocked`.
#[derive(Debug, Default)]
pub struct VecTransport {
    pub sent: Vec<(ConnectionId, Bytes)>,
    pub closed: Vec<ConnectionId>,
    pub blocked: bool,
}

impl VecTransport {
    /// Returns the encoded frames sent to a connection.
    pub fn sent_to(&self, connection_id: ConnectionId) -> Vec<String> {
        self.sent
            .iter()
            .filter(|(id, _)| *id == connection_id)
            .map(|(_, bytes)| String::from_utf8_lossy(bytes).into_owned())
            .collect()
    }
}

impl Transport for VecTransport {
    fn try_send(&mut self, connection_id: ConnectionId, bytes: &Bytes) -> Result<(), Backpressure> {
        if self.blocked {
            return Err(Backpressure);
        }
        self.sent.push((connection_id, bytes.clone()));
        Ok(())
    }

    fn close(&mut self, connection_id: ConnectionId) {
        self.closed.push(connection_id);
    }
}

/// Application that records every callback.
#[derive(Debug, Default)]
pub struct RecordingApplication {
    pub established: Vec<SessionId>,
    pub messages: Vec<(SessionId, u64, MsgType)>,
    pub disconnects: Vec<(SessionId, DisconnectReason)>,
    pub cod_timeouts: Vec<(SessionId, CodContext)>,
}

impl SessionHandler for RecordingApplication {
    fn on_established(&mut self, session_id: &SessionId, _connection_id: ConnectionId) {
        self.established.push(session_id.clone());
    }

    fn on_message(&mut self, session_id: &SessionId, seq_num: u64, msg_type: &MsgType, _body: &Bytes) {
        self.messages.push((session_id.clone(), seq_num, msg_type.clone()));
    }

    fn on_disconnect(&mut self, session_id: &SessionId, reason: &DisconnectReason) {
        self.disconnects.push((session_id.clone(), reason.clone()));
    }
}

impl CancelOnDisconnectHandler for RecordingApplication {
    fn on_cancel_on_disconnect_timeout(&mut self, session_id: &SessionId, context: &CodContext) {
        self.cod_timeouts.push((session_id.clone(), context.clone()));
    }
}
