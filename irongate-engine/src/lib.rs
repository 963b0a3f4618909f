/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! # IronGate Engine
//!
//! Engine runtime for the IronGate FIX/FIXP gateway.
//!
//! This crate provides:
//! - **Framer**: Single-threaded owner of connections, timers and archiving
//! - **Engine**: Launch and close over a log directory
//! - **Configuration**: Validated `EngineConfiguration` and its builder
//! - **Seams**: `Codec`, `Transport` and `Application` traits

pub mod application;
pub mod codec;
pub mod config;
pub mod engine;
pub mod framer;
pub mod idle;
pub mod publication;
pub mod registry;

#[cfg(test)]
mod test_support;

pub use application::{Application, NoOpApplication};
pub use codec::{Codec, Transport};
pub use config::{EngineBuilder, EngineConfiguration};
pub use engine::Engine;
pub use framer::{Capabilities, Framer, Protocol};
pub use idle::Backoff;
pub use publication::{ArchiveQueue, FramerPublication};
pub use registry::SessionRegistry;
