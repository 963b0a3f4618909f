/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Wire codec and transport seams.
//!
//! The engine never touches wire formats or sockets. A [`Codec`] turns
//! session-layer frames into bytes and back, and a [`Transport`] moves those
//! bytes without blocking the framer.

use bytes::Bytes;
use irongate_core::error::{DecodeError, EncodeError};
use irongate_core::message::{InboundFrame, OutboundFrame};
use irongate_core::types::ConnectionId;
use irongate_session::capability::Backpressure;

/// Converts between frames and wire bytes.
pub trait Codec {
    /// Encodes an outbound frame.
    ///
    /// A [`OutboundFrame::Replay`] carries the archived bytes; the codec
    /// marks them as a possible duplicate.
    ///
    /// # Errors
    /// Returns `EncodeError` if the frame cannot be represented.
    fn encode(&mut self, frame: &OutboundFrame<'_>) -> Result<Bytes, EncodeError>;

    /// Decodes one complete inbound message.
    ///
    /// # Errors
    /// Returns `DecodeError` if the bytes are not a valid message.
    fn decode(&mut self, bytes: &[u8]) -> Result<InboundFrame, DecodeError>;
}

/// Non-blocking byte sink for established connections.
pub trait Transport {
    /// Queues bytes for a connection.
    ///
    /// # Errors
    /// Returns [`Backpressure`] if the bytes were not taken.
    fn try_send(&mut self, connection_id: ConnectionId, bytes: &Bytes) -> Result<(), Backpressure>;

    /// Closes a connection.
    fn close(&mut self, connection_id: ConnectionId);
}
