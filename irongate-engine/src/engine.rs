/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Engine launch and close.
//!
//! Launching claims the log directory with a liveness marker, opens the
//! sequence number table and starts the archiver thread. Closing undoes it
//! in reverse order.

use crate::application::Application;
use crate::codec::{Codec, Transport};
use crate::config::EngineConfiguration;
use crate::framer::{Capabilities, Framer};
use irongate_core::error::{EngineError, StoreError};
use irongate_core::types::Timestamp;
use irongate_store::{
    Archiver, LivenessMarker, MemoryStore, MessageArchive, SequenceNumberStore,
};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

/// A running engine.
///
/// Dropping an engine without [`Engine::close`] shuts it down and logs any
/// failure.
pub struct Engine<C: Codec, T: Transport, A: Application> {
    framer: Framer<C, T, A>,
    closed: bool,
}

impl<C: Codec, T: Transport, A: Application> Engine<C, T, A> {
    /// Launches an engine on the configured log directory.
    ///
    /// # Arguments
    /// * `config` - Validated engine configuration
    /// * `capabilities` - Codec, transport, application and arbiters
    ///
    /// # Errors
    /// Returns `EngineError::DuplicateEngine` if another engine recently
    /// used the directory, or `EngineError::Store` if the stores cannot be
    /// opened.
    pub fn launch(
        config: Arc<EngineConfiguration>,
        capabilities: Capabilities<C, T, A>,
    ) -> Result<Self, EngineError> {
        let dir = config.log_file_dir.clone();
        std::fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, &e))?;

        let liveness = LivenessMarker::acquire(
            &dir,
            config.duplicate_engine_timeout,
            config.error_if_duplicate_engine_detected,
            Timestamp::now(),
        )?;
        let sequence_numbers = SequenceNumberStore::open(
            &config.sequence_numbers_path(),
            config.sequence_numbers_file_size,
            config.session.initial_sequence_index,
        )?;

        let framer = if config.is_archiving() {
            let archiver = Archiver::spawn(&config.archiver_config())?;
            let archive: Arc<dyn MessageArchive> = Arc::clone(archiver.archive()) as _;
            Framer::new(Arc::clone(&config), capabilities, Box::new(sequence_numbers), archive)
                .with_archiver(archiver)
        } else {
            Framer::new(
                Arc::clone(&config),
                capabilities,
                Box::new(sequence_numbers),
                Arc::new(MemoryStore::new()),
            )
        };

        info!(
            dir = %dir.display(),
            archiving = config.is_archiving(),
            accept_fixp = config.accept_fixp,
            "engine launched"
        );
        Ok(Self {
            framer: framer.with_liveness(liveness),
            closed: false,
        })
    }

    /// Returns the framer.
    #[must_use]
    pub const fn framer(&self) -> &Framer<C, T, A> {
        &self.framer
    }

    /// Returns the framer for pushing transport events.
    pub fn framer_mut(&mut self) -> &mut Framer<C, T, A> {
        &mut self.framer
    }

    /// Runs one duty cycle of the framer.
    pub fn poll(&mut self, now: Instant) -> usize {
        self.framer.poll(now)
    }

    /// Disconnects every session, flushes the archive and releases the log
    /// directory.
    ///
    /// # Errors
    /// Returns `EngineError::Store` if the archiver failed while stopping.
    pub fn close(mut self) -> Result<(), EngineError> {
        self.closed = true;
        let result = self.framer.shutdown(Instant::now());
        info!("engine closed");
        result
    }
}

impl<C: Codec, T: Transport, A: Application> Drop for Engine<C, T, A> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(e) = self.framer.shutdown(Instant::now()) {
            error!(error = %e, "engine shutdown failed");
        }
    }
}
