/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! # IronGate
//!
//! The session core of a FIX and FIXP trading gateway.
//!
//! IronGate accepts FIX tag=value sessions and FIXP binary connections,
//! keeps their sequence numbers durable across restarts, archives every
//! outbound message for replay and arms cancel-on-disconnect timers when a
//! counterparty drops.
//!
//! ## Features
//!
//! - **Session layer**: Logon, heartbeats, gap detection and resend for FIX;
//!   Negotiate, Establish, retransmission and keepalive for FIXP
//! - **Durable numbering**: Memory-mapped sequence number table with
//!   checksummed records
//! - **Archive and replay**: A dedicated archiver thread and a ring-buffer
//!   replay index per session
//! - **Non-blocking**: Backpressure instead of blocking sends, one framer
//!   thread owning every connection
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use irongate::prelude::*;
//!
//! let config = EngineBuilder::new()
//!     .with_log_file_dir("logs")
//!     .with_accept_fixp(true)
//!     .build()?;
//! let mut engine = Engine::launch(config, Capabilities::new(codec, transport, MyApplication))?;
//! engine.framer_mut().on_connect(ConnectionId(1), Protocol::Fix, Instant::now())?;
//! loop {
//!     engine.poll(Instant::now());
//! }
//! ```
//!
//! ## Crate Organization
//!
//! - [`core`]: Identifiers, messages and error types
//! - [`session`]: FIX sessions, FIXP connections and capabilities
//! - [`store`]: Sequence number table, archive and replay index
//! - [`engine`]: Framer, configuration and lifecycle

pub mod core {
    //! Identifiers, messages and error types.
    pub use irongate_core::*;
}

pub mod session {
    //! FIX sessions, FIXP connections and capabilities.
    pub use irongate_session::*;
}

pub mod store {
    //! Sequence number table, archive and replay index.
    pub use irongate_store::*;
}

pub mod engine {
    //! Framer, configuration and lifecycle.
    pub use irongate_engine::*;
}

/// Prelude module for convenient imports.
pub mod prelude {
    // Core types
    pub use irongate_core::{
        AdminMessage, CancelOnDisconnectType, CodRequest, CompId, ConnectionId, DecodeError,
        EncodeError, EngineError, FixPApplication, FixPMessage, GatewayError, InboundFrame,
        InboundMessage, Logon, MsgType, OutboundFrame, Result, SessionError, SessionId,
        StoreError, TerminationCode, Timestamp,
    };

    // Session
    pub use irongate_session::{
        AuthDecision, AuthenticationContext, AuthenticationStrategy, Backpressure,
        CancelOnDisconnectHandler, CodContext, ConnectionOwnership, DisconnectReason,
        NegotiationContext, OwnershipDecision, PublishError, RetransmitObserver, SeedStrategy,
        SendOutcome, SessionConfig, SessionHandler,
    };

    // Store
    pub use irongate_store::{MemoryStore, MessageArchive, SequenceNumbers};

    // Engine
    pub use irongate_engine::{
        Application, Capabilities, Codec, Engine, EngineBuilder, EngineConfiguration, Framer,
        NoOpApplication, Protocol, Transport,
    };
}
