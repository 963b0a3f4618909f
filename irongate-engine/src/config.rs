/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Engine configuration and its builder.
//!
//! An [`EngineConfiguration`] is built and validated once by
//! [`EngineBuilder::build`] and shared read-only afterwards.

use irongate_core::error::EngineError;
use irongate_session::config::SessionConfig;
use irongate_store::ArchiverConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// File name of the sequence number table inside the log directory.
pub const SEQUENCE_NUMBERS_FILE_NAME: &str = "sequence_numbers";

/// Validated engine settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfiguration {
    /// Directory of every persisted file.
    pub log_file_dir: PathBuf,
    /// Record capacity of each replay index file, a power of two.
    pub replay_index_capacity: usize,
    /// Size of a newly created sequence number file.
    pub sequence_numbers_file_size: u64,
    /// Capacity of the archiver request and acknowledgement channels.
    pub archiver_channel_capacity: usize,
    /// How long the archiver waits for work before checking for shutdown.
    pub archiver_idle_timeout: Duration,
    /// Age below which a liveness marker means another engine is running.
    pub duplicate_engine_timeout: Duration,
    /// Fail the launch instead of warning when a live engine is detected.
    pub error_if_duplicate_engine_detected: bool,
    /// Accept FIXP connections.
    pub accept_fixp: bool,
    /// Settings applied to every session.
    pub session: SessionConfig,
}

impl EngineConfiguration {
    /// Returns the path of the sequence number table.
    #[must_use]
    pub fn sequence_numbers_path(&self) -> PathBuf {
        self.log_file_dir.join(SEQUENCE_NUMBERS_FILE_NAME)
    }

    /// Returns true when any message direction is archived.
    #[must_use]
    pub const fn is_archiving(&self) -> bool {
        self.session.log_inbound || self.session.log_outbound
    }

    /// Returns the settings of the archival thread.
    #[must_use]
    pub fn archiver_config(&self) -> ArchiverConfig {
        ArchiverConfig {
            log_dir: self.log_file_dir.clone(),
            replay_index_capacity: self.replay_index_capacity,
            request_capacity: self.archiver_channel_capacity,
            ack_capacity: self.archiver_channel_capacity,
            idle_timeout: self.archiver_idle_timeout,
        }
    }

    fn validate(&self) -> Result<(), EngineError> {
        if !self.replay_index_capacity.is_power_of_two() {
            return Err(invalid(format!(
                "replay index capacity {} is not a power of two",
                self.replay_index_capacity
            )));
        }
        if self.accept_fixp && !(self.session.log_inbound && self.session.log_outbound) {
            return Err(invalid(
                "FIXP requires both inbound and outbound logging".to_string(),
            ));
        }
        if self.archiver_channel_capacity == 0 {
            return Err(invalid("archiver channel capacity must be positive".to_string()));
        }
        if self.sequence_numbers_file_size == 0 {
            return Err(invalid("sequence number file size must be positive".to_string()));
        }
        if self.duplicate_engine_timeout.is_zero() {
            return Err(invalid("duplicate engine timeout must be positive".to_string()));
        }
        if self.session.heartbeat_interval.is_zero() {
            return Err(invalid("heartbeat interval must be positive".to_string()));
        }
        if self.session.max_concurrent_replays == 0 {
            return Err(invalid("at least one concurrent replay is required".to_string()));
        }
        Ok(())
    }
}

fn invalid(reason: String) -> EngineError {
    EngineError::InvalidConfiguration(reason)
}

/// Builder for [`EngineConfiguration`].
#[derive(Debug, Clone)]
pub struct EngineBuilder {
    config: EngineConfiguration,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBuilder {
    /// Creates a builder with the default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: EngineConfiguration {
                log_file_dir: PathBuf::from("logs"),
                replay_index_capacity: 65_536,
                sequence_numbers_file_size: 1 << 20,
                archiver_channel_capacity: 4_096,
                archiver_idle_timeout: Duration::from_millis(10),
                duplicate_engine_timeout: Duration::from_secs(10),
                error_if_duplicate_engine_detected: true,
                accept_fixp: false,
                session: SessionConfig::new(),
            },
        }
    }

    /// Sets the log directory.
    #[must_use]
    pub fn with_log_file_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.config.log_file_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Sets the replay index record capacity.
    #[must_use]
    pub const fn with_replay_index_capacity(mut self, capacity: usize) -> Self {
        self.config.replay_index_capacity = capacity;
        self
    }

    /// Sets the size of a new sequence number file.
    #[must_use]
    pub const fn with_sequence_numbers_file_size(mut self, size: u64) -> Self {
        self.config.sequence_numbers_file_size = size;
        self
    }

    /// Sets the archiver channel capacity.
    #[must_use]
    pub const fn with_archiver_channel_capacity(mut self, capacity: usize) -> Self {
        self.config.archiver_channel_capacity = capacity;
        self
    }

    /// Sets the duplicate engine detection timeout.
    #[must_use]
    pub const fn with_duplicate_engine_timeout(mut self, timeout: Duration) -> Self {
        self.config.duplicate_engine_timeout = timeout;
        self
    }

    /// Sets whether a live duplicate engine fails the launch.
    #[must_use]
    pub const fn with_error_if_duplicate_engine_detected(mut self, error: bool) -> Self {
        self.config.error_if_duplicate_engine_detected = error;
        self
    }

    /// Enables FIXP connections.
    #[must_use]
    pub const fn with_accept_fixp(mut self, accept: bool) -> Self {
        self.config.accept_fixp = accept;
        self
    }

    /// Sets the session settings.
    #[must_use]
    pub fn with_session_config(mut self, session: SessionConfig) -> Self {
        self.config.session = session;
        self
    }

    /// Returns the settings built so far.
    #[must_use]
    pub const fn config(&self) -> &EngineConfiguration {
        &self.config
    }

    /// Validates the settings.
    ///
    /// # Errors
    /// Returns `EngineError::InvalidConfiguration` if a setting is out of
    /// range or FIXP is enabled without full-duplex logging.
    pub fn build(self) -> Result<Arc<EngineConfiguration>, EngineError> {
        self.config.validate()?;
        Ok(Arc::new(self.config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let config = EngineBuilder::new().build().unwrap();
        assert_eq!(config.log_file_dir, PathBuf::from("logs"));
        assert_eq!(config.replay_index_capacity, 65_536);
        assert_eq!(config.duplicate_engine_timeout, Duration::from_secs(10));
        assert!(config.error_if_duplicate_engine_detected);
        assert!(!config.accept_fixp);
        assert_eq!(config.session.no_logon_timeout, Duration::from_secs(5));
        assert_eq!(config.sequence_numbers_path(), PathBuf::from("logs/sequence_numbers"));
    }

    #[test]
    fn test_replay_capacity_must_be_power_of_two() {
        let result = EngineBuilder::new().with_replay_index_capacity(1000).build();
        assert!(matches!(result, Err(EngineError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_fixp_requires_full_duplex_logging() {
        let result = EngineBuilder::new()
            .with_accept_fixp(true)
            .with_session_config(SessionConfig::new().with_logging(true, false))
            .build();
        assert!(matches!(result, Err(EngineError::InvalidConfiguration(_))));

        let config = EngineBuilder::new().with_accept_fixp(true).build().unwrap();
        assert!(config.accept_fixp);
    }

    #[test]
    fn test_archiver_config() {
        let config = EngineBuilder::new()
            .with_log_file_dir("/tmp/gateway")
            .with_archiver_channel_capacity(16)
            .build()
            .unwrap();
        let archiver = config.archiver_config();
        assert_eq!(archiver.log_dir, PathBuf::from("/tmp/gateway"));
        assert_eq!(archiver.request_capacity, 16);
        assert_eq!(archiver.replay_index_capacity, 65_536);
        assert!(config.is_archiving());
    }
}
