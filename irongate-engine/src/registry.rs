/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Summaries of sessions that left their connection.
//!
//! When a logged-on session disconnects the framer files its summary here.
//! A reconnect of the same session removes it again.

use irongate_core::types::SessionId;
use irongate_session::session::SessionSummary;
use std::collections::HashMap;

/// Sessions currently without a connection.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<SessionId, SessionSummary>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Files a summary, replacing the previous one of the same session.
    pub fn record(&mut self, summary: SessionSummary) -> Option<SessionSummary> {
        self.sessions.insert(summary.session_id.clone(), summary)
    }

    /// Returns the summary of a disconnected session.
    #[must_use]
    pub fn get(&self, session_id: &SessionId) -> Option<&SessionSummary> {
        self.sessions.get(session_id)
    }

    /// Removes the summary of a session that reconnected.
    pub fn remove(&mut self, session_id: &SessionId) -> Option<SessionSummary> {
        self.sessions.remove(session_id)
    }

    /// Returns the number of disconnected sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Returns true if no session is disconnected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Iterates over the summaries.
    pub fn iter(&self) -> impl Iterator<Item = &SessionSummary> {
        self.sessions.values()
    }
}
