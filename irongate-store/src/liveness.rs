/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Duplicate engine detection.
//!
//! A running engine keeps a liveness marker in its log directory fresh. A
//! second engine starting against the same directory finds a marker younger
//! than the duplicate engine timeout and refuses to start, or only warns when
//! so configured.

use irongate_core::error::EngineError;
use irongate_core::types::Timestamp;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// File name of the marker inside the log directory.
pub const LIVENESS_FILE_NAME: &str = "engine-liveness";

/// Marker content: millisecond timestamp followed by the process id.
const MARKER_LEN: usize = 12;

/// Liveness marker owned by the running engine.
#[derive(Debug)]
pub struct LivenessMarker {
    path: PathBuf,
    timeout: Duration,
    last_refresh: Timestamp,
    released: bool,
}

impl LivenessMarker {
    /// Checks for a live engine in `dir` and takes over the marker.
    ///
    /// # Arguments
    /// * `dir` - Log directory shared by the engines
    /// * `timeout` - Age below which an existing marker means a live engine
    /// * `error_if_duplicate` - Fail instead of warning on a live marker
    /// * `now` - Current wall clock time
    ///
    /// # Errors
    /// Returns `EngineError::DuplicateEngine` if another engine looks alive
    /// and `error_if_duplicate` is set, or `EngineError::InvalidConfiguration`
    /// if the marker cannot be written.
    pub fn acquire(
        dir: &Path,
        timeout: Duration,
        error_if_duplicate: bool,
        now: Timestamp,
    ) -> Result<Self, EngineError> {
        let path = dir.join(LIVENESS_FILE_NAME);
        if let Some(written) = read_marker_time(&path) {
            let age_ms = now.as_millis().saturating_sub(written.as_millis());
            if u128::from(age_ms) < timeout.as_millis() {
                if error_if_duplicate {
                    return Err(EngineError::DuplicateEngine {
                        path: path.clone(),
                        age_ms,
                    });
                }
                warn!(
                    path = %path.display(),
                    age_ms,
                    "another engine appears to be running against this directory"
                );
            } else {
                debug!(path = %path.display(), age_ms, "stale liveness marker");
            }
        }

        let mut marker = Self {
            path,
            timeout,
            last_refresh: now,
            released: false,
        };
        marker.write(now)?;
        info!(path = %marker.path.display(), "liveness marker acquired");
        Ok(marker)
    }

    /// Returns true once half the timeout has passed since the last refresh.
    #[must_use]
    pub fn refresh_due(&self, now: Timestamp) -> bool {
        let elapsed = now.as_millis().saturating_sub(self.last_refresh.as_millis());
        u128::from(elapsed) * 2 >= self.timeout.as_millis()
    }

    /// Rewrites the marker with `now`.
    ///
    /// # Errors
    /// Returns `EngineError::InvalidConfiguration` if the marker cannot be
    /// written.
    pub fn refresh(&mut self, now: Timestamp) -> Result<(), EngineError> {
        self.write(now)?;
        self.last_refresh = now;
        Ok(())
    }

    /// Returns the marker path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Removes the marker so a successor can start immediately.
    pub fn release(mut self) {
        self.remove();
    }

    fn write(&self, now: Timestamp) -> Result<(), EngineError> {
        let mut content = [0u8; MARKER_LEN];
        content[..8].copy_from_slice(&now.as_millis().to_le_bytes());
        content[8..].copy_from_slice(&std::process::id().to_le_bytes());
        fs::write(&self.path, content).map_err(|e| {
            EngineError::InvalidConfiguration(format!(
                "cannot write liveness marker {}: {e}",
                self.path.display()
            ))
        })
    }

    fn remove(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove liveness marker");
        }
    }
}

impl Drop for LivenessMarker {
    fn drop(&mut self) {
        self.remove();
    }
}

/// Reads the time a marker was last written.
///
/// Falls back to the file modification time when the content is unreadable.
fn read_marker_time(path: &Path) -> Option<Timestamp> {
    let content = fs::read(path).ok()?;
    if content.len() == MARKER_LEN {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&content[..8]);
        return Some(Timestamp::from_millis(u64::from_le_bytes(raw)));
    }
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    let millis = modified
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis();
    Some(Timestamp::from_millis(u64::try_from(millis).unwrap_or(u64::MAX)))
}
