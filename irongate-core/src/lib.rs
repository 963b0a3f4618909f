/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! # IronGate Core
//!
//! Identifiers, the logical message model, and error definitions shared by
//! every IronGate crate.
//!
//! - **Error types**: Layered error handling with `thiserror`
//! - **Message model**: [`AdminMessage`], [`FixPMessage`], [`InboundFrame`], [`OutboundFrame`]
//! - **Core types**: [`SessionId`], [`SeqNum`], [`Timestamp`], [`CompId`]

pub mod error;
pub mod message;
pub mod types;

pub use error::{
    DecodeError, EncodeError, EngineError, GatewayError, Result, SessionError, StoreError,
};
pub use message::{
    AdminMessage, CodRequest, EstablishRejectCode, FixPApplication, FixPMessage, InboundBody,
    InboundFrame, InboundMessage, Logon, MsgType, NegotiateRejectCode, OutboundFrame,
    RetransmitRejectCode, TerminationCode,
};
pub use types::{
    CancelOnDisconnectType, CompId, ConnectionId, Direction, INITIAL_SEQUENCE_INDEX, SeqNum,
    SessionId, Timestamp,
};
