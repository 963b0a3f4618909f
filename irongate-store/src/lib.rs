/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! # IronGate Store
//!
//! Persistence for the IronGate FIX/FIXP gateway.
//!
//! This crate provides:
//! - **SequenceNumberStore**: Crash-safe, memory-mapped sequence numbers per session
//! - **ReplayIndex**: Fixed-capacity ring index from sequence numbers to archive positions
//! - **Archiver**: Background archival thread with durability acknowledgements
//! - **LivenessMarker**: Duplicate engine detection on a shared log directory
//! - **MemoryStore**: In-memory store for tests and logging-disabled sessions

pub mod archive;
pub mod archiver;
pub mod liveness;
pub mod mapped;
pub mod memory;
pub mod replay_index;
pub mod sequence;
pub mod traits;

pub use archive::{ArchiveReader, ArchiveWriter};
pub use archiver::{
    ArchiveRequest, Archiver, ArchiverConfig, ArchiverHandle, DurabilityAck, FileArchive,
};
pub use liveness::LivenessMarker;
pub use memory::MemoryStore;
pub use replay_index::{IndexRecord, ReplayIndex, ReplayLookup};
pub use sequence::SequenceNumberStore;
pub use traits::{
    ArchivedMessage, MessageArchive, ReplayControl, ReplayEntry, ReplayQuery,
    SequenceNumberRecord, SequenceNumbers,
};
