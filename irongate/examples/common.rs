//! Common utilities shared across examples.

#![allow(dead_code)]

use irongate::prelude::{CompId, SessionId};

/// CompID of the gateway.
pub const GATEWAY: &str = "GATEWAY";

/// CompID of the demo client.
pub const CLIENT: &str = "CLIENT";

/// Initializes logging for examples.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .try_init();
}

/// Builds a CompID, panicking on an oversized literal.
pub fn comp(id: &str) -> CompId {
    CompId::new(id).unwrap_or_else(|| panic!("comp id too long: {id}"))
}

/// Session id of the demo FIX client as seen by the gateway.
pub fn fix_session() -> SessionId {
    SessionId::fix(comp(GATEWAY), comp(CLIENT))
}
