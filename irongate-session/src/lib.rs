/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! # IronGate Session
//!
//! FIX and FIXP session layer protocol implementation for the IronGate gateway.
//!
//! This crate provides:
//! - **Session**: FIX state machine covering logon, gap recovery, heartbeats and logout
//! - **FixPConnection**: FIXP acceptor with Negotiate/Establish handshakes and retransmission
//! - **Capabilities**: Pluggable authentication, ownership, publication and handler traits
//! - **Cancel-on-disconnect**: Per-session timeout scheduling
//! - **Sequence management**: Counters, validation and persistence records
//! - **Configuration**: Session configuration options

pub mod capability;
pub mod cod;
pub mod config;
pub mod fixp;
pub mod heartbeat;
pub mod replay;
pub mod reply;
pub mod sequence;
pub mod session;
pub mod state;

#[cfg(test)]
mod test_support;

pub use capability::{
    AcceptAll, AuthDecision, AuthOutcome, AuthenticationContext, AuthenticationStrategy,
    Backpressure, CancelOnDisconnectHandler, ConnectionOwnership, DisconnectReason,
    IgnoreRetransmits, NegotiationContext, OwnAll, OwnershipDecision, OwnershipStatus,
    Publication, PublishContext, PublishError, RetransmitObserver, SessionHandler,
};
pub use cod::{CancelOnDisconnectScheduler, CodConfig, CodContext, CodTrigger, TimeoutHandle};
pub use config::{GapFillSet, SessionConfig};
pub use fixp::FixPConnection;
pub use heartbeat::HeartbeatManager;
pub use replay::{ReplayJob, ReplayQueue};
pub use reply::{Reply, ReplyPoll, Responder, reply_channel};
pub use sequence::{SequenceManager, SequenceResult};
pub use session::{
    SeedStrategy, SendOutcome, Session, SessionContext, SessionRole, SessionSummary,
};
pub use state::{FixPState, SessionState};
