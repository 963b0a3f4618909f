/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Application callback interface.
//!
//! The engine calls the application on the framer thread for session events,
//! inbound business messages and cancel-on-disconnect timeouts.

use bytes::Bytes;
use irongate_core::message::MsgType;
use irongate_core::types::{ConnectionId, SessionId};
use irongate_session::capability::{CancelOnDisconnectHandler, DisconnectReason, SessionHandler};
use irongate_session::cod::CodContext;
use tracing::{debug, info};

/// Everything the engine calls back into.
pub trait Application: SessionHandler + CancelOnDisconnectHandler {}

impl<T: SessionHandler + CancelOnDisconnectHandler> Application for T {}

/// Application that logs events and drops messages.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpApplication;

impl SessionHandler for NoOpApplication {
    fn on_established(&mut self, session_id: &SessionId, connection_id: ConnectionId) {
        info!(session = %session_id, connection = %connection_id, "session established");
    }

    fn on_message(&mut self, session_id: &SessionId, seq_num: u64, msg_type: &MsgType, _body: &Bytes) {
        debug!(session = %session_id, seq_num, %msg_type, "message dropped");
    }

    fn on_disconnect(&mut self, session_id: &SessionId, reason: &DisconnectReason) {
        info!(session = %session_id, %reason, "session disconnected");
    }
}

impl CancelOnDisconnectHandler for NoOpApplication {
    fn on_cancel_on_disconnect_timeout(&mut self, session_id: &SessionId, context: &CodContext) {
        info!(
            session = %session_id,
            connection = %context.connection_id,
            cod_type = ?context.cod_type,
            "cancel on disconnect timeout"
        );
    }
}
