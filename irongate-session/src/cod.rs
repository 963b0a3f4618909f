/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Cancel-on-disconnect timeout scheduling.
//!
//! A session that asked for cancel-on-disconnect gets a timeout armed when it
//! disconnects or terminates. If it logs on or establishes again before the
//! deadline, the timeout is cancelled; otherwise the handler fires exactly
//! once.

use crate::capability::CancelOnDisconnectHandler;
use irongate_core::message::CodRequest;
use irongate_core::types::{CancelOnDisconnectType, ConnectionId, SessionId};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Normalised cancel-on-disconnect settings of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CodConfig {
    /// Policy.
    pub cod_type: CancelOnDisconnectType,
    /// Window between the trigger and the cancel, `None` when disabled.
    pub window: Option<Duration>,
}

impl CodConfig {
    /// Normalises a request.
    ///
    /// An absent or non-positive window disables cancel-on-disconnect. A
    /// window above `max_timeout` is clamped to it. A `DoNotCancel` policy
    /// keeps its clamped window but never arms a timeout.
    ///
    /// # Arguments
    /// * `request` - The policy and window asked for
    /// * `max_timeout` - The configured ceiling
    #[must_use]
    pub fn normalize(request: CodRequest, max_timeout: Duration) -> Self {
        let window = match request.window_ms {
            Some(ms) if ms > 0 => Duration::from_millis(ms.unsigned_abs()),
            _ => return Self::default(),
        };
        Self {
            cod_type: request.cod_type,
            window: Some(window.min(max_timeout)),
        }
    }

    /// Returns the window if `trigger` should arm a timeout.
    #[must_use]
    pub const fn window_for(&self, trigger: CodTrigger) -> Option<Duration> {
        let applies = match trigger {
            CodTrigger::Disconnect => self.cod_type.cancels_on_disconnect(),
            CodTrigger::Terminate => self.cod_type.cancels_on_terminate(),
        };
        if applies { self.window } else { None }
    }
}

/// Event that may arm a timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodTrigger {
    /// The transport dropped without a goodbye.
    Disconnect,
    /// The session ended with a Logout or Terminate exchange.
    Terminate,
}

/// Details handed to the handler when a timeout fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodContext {
    /// Connection the session was on.
    pub connection_id: ConnectionId,
    /// Policy that armed the timeout.
    pub cod_type: CancelOnDisconnectType,
    /// What armed the timeout.
    pub trigger: CodTrigger,
    /// Configured window.
    pub window: Duration,
    /// When the timeout was armed.
    pub armed_at: Instant,
}

/// An armed timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutHandle {
    /// Session the timeout belongs to.
    pub session_id: SessionId,
    /// Time the timeout fires.
    pub deadline: Instant,
    /// Context passed to the handler.
    pub context: CodContext,
}

/// Per-engine cancel-on-disconnect scheduler.
#[derive(Debug, Default)]
pub struct CancelOnDisconnectScheduler {
    handles: HashMap<SessionId, TimeoutHandle>,
}

impl CancelOnDisconnectScheduler {
    /// Creates an empty scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms a timeout if `config` applies to `trigger`.
    ///
    /// Arming replaces any earlier timeout of the same session.
    ///
    /// # Returns
    /// True if a timeout was armed.
    pub fn arm(
        &mut self,
        session_id: &SessionId,
        connection_id: ConnectionId,
        config: &CodConfig,
        trigger: CodTrigger,
        now: Instant,
    ) -> bool {
        let Some(window) = config.window_for(trigger) else {
            return false;
        };
        let handle = TimeoutHandle {
            session_id: session_id.clone(),
            deadline: now + window,
            context: CodContext {
                connection_id,
                cod_type: config.cod_type,
                trigger,
                window,
                armed_at: now,
            },
        };
        debug!(
            session = %session_id,
            window_ms = window.as_millis(),
            ?trigger,
            "cancel on disconnect armed"
        );
        self.handles.insert(session_id.clone(), handle);
        true
    }

    /// Cancels the timeout of a session that came back.
    ///
    /// # Returns
    /// True if a timeout was pending.
    pub fn cancel(&mut self, session_id: &SessionId) -> bool {
        let cancelled = self.handles.remove(session_id).is_some();
        if cancelled {
            debug!(session = %session_id, "cancel on disconnect cancelled");
        }
        cancelled
    }

    /// Fires every timeout whose deadline has passed.
    ///
    /// Each handle is removed before its handler runs, so it fires once.
    ///
    /// # Returns
    /// The number of timeouts fired.
    pub fn poll(&mut self, now: Instant, handler: &mut dyn CancelOnDisconnectHandler) -> usize {
        let due: Vec<SessionId> = self
            .handles
            .iter()
            .filter(|(_, handle)| now >= handle.deadline)
            .map(|(id, _)| id.clone())
            .collect();

        let mut fired = 0;
        for session_id in due {
            if let Some(handle) = self.handles.remove(&session_id) {
                info!(session = %session_id, "cancel on disconnect timeout fired");
                handler.on_cancel_on_disconnect_timeout(&handle.session_id, &handle.context);
                fired += 1;
            }
        }
        fired
    }

    /// Returns true if the session has an armed timeout.
    #[must_use]
    pub fn is_armed(&self, session_id: &SessionId) -> bool {
        self.handles.contains_key(session_id)
    }

    /// Returns the earliest pending deadline.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.handles.values().map(|handle| handle.deadline).min()
    }

    /// Returns the number of armed timeouts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Returns true if nothing is armed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: Duration = Duration::from_secs(60);

    #[derive(Default)]
    struct Recorder {
        fired: Vec<(SessionId, CodContext)>,
    }

    impl CancelOnDisconnectHandler for Recorder {
        fn on_cancel_on_disconnect_timeout(&mut self, session_id: &SessionId, context: &CodContext) {
            self.fired.push((session_id.clone(), context.clone()));
        }
    }

    fn request(cod_type: CancelOnDisconnectType, window_ms: Option<i64>) -> CodRequest {
        CodRequest {
            cod_type,
            window_ms,
        }
    }

    #[test]
    fn test_normalize_clamps_to_max() {
        let config = CodConfig::normalize(
            request(CancelOnDisconnectType::CancelOnDisconnectOnly, Some(120_000)),
            MAX,
        );
        assert_eq!(config.window, Some(MAX));
        assert_eq!(config.cod_type, CancelOnDisconnectType::CancelOnDisconnectOnly);
    }

    #[test]
    fn test_normalize_absent_or_non_positive_window_disables() {
        for window in [None, Some(0), Some(-5)] {
            let config = CodConfig::normalize(
                request(CancelOnDisconnectType::CancelOnDisconnectOrTerminate, window),
                MAX,
            );
            assert_eq!(config, CodConfig::default());
        }
    }

    #[test]
    fn test_do_not_cancel_keeps_window_but_never_arms() {
        let config = CodConfig::normalize(
            request(
                CancelOnDisconnectType::DoNotCancelOnDisconnectOrTerminate,
                Some(120_000),
            ),
            MAX,
        );
        assert_eq!(
            config,
            CodConfig {
                cod_type: CancelOnDisconnectType::DoNotCancelOnDisconnectOrTerminate,
                window: Some(MAX),
            }
        );
        assert_eq!(config.window_for(CodTrigger::Disconnect), None);
        assert_eq!(config.window_for(CodTrigger::Terminate), None);

        let mut scheduler = CancelOnDisconnectScheduler::new();
        let armed = scheduler.arm(
            &SessionId::fixp(1),
            ConnectionId(1),
            &config,
            CodTrigger::Disconnect,
            Instant::now(),
        );
        assert!(!armed);
    }

    #[test]
    fn test_absent_window_arms_nothing() {
        let mut scheduler = CancelOnDisconnectScheduler::new();
        let config = CodConfig::normalize(
            request(CancelOnDisconnectType::CancelOnDisconnectOnly, None),
            MAX,
        );
        let armed = scheduler.arm(
            &SessionId::fixp(1),
            ConnectionId(1),
            &config,
            CodTrigger::Disconnect,
            Instant::now(),
        );
        assert!(!armed);
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_fires_once_after_deadline() {
        let t0 = Instant::now();
        let id = SessionId::fixp(1);
        let mut scheduler = CancelOnDisconnectScheduler::new();
        let config = CodConfig::normalize(
            request(CancelOnDisconnectType::CancelOnDisconnectOnly, Some(1_000)),
            MAX,
        );
        assert!(scheduler.arm(&id, ConnectionId(3), &config, CodTrigger::Disconnect, t0));

        let mut handler = Recorder::default();
        assert_eq!(scheduler.poll(t0 + Duration::from_millis(999), &mut handler), 0);
        assert_eq!(scheduler.poll(t0 + Duration::from_millis(1_000), &mut handler), 1);
        assert_eq!(scheduler.poll(t0 + Duration::from_secs(10), &mut handler), 0);

        assert_eq!(handler.fired.len(), 1);
        let (fired_id, context) = &handler.fired[0];
        assert_eq!(fired_id, &id);
        assert_eq!(context.connection_id, ConnectionId(3));
        assert!(context.armed_at + context.window <= t0 + Duration::from_millis(1_000));
    }

    #[test]
    fn test_cancel_before_deadline_never_fires() {
        let t0 = Instant::now();
        let id = SessionId::fixp(2);
        let mut scheduler = CancelOnDisconnectScheduler::new();
        let config = CodConfig::normalize(
            request(CancelOnDisconnectType::CancelOnDisconnectOrTerminate, Some(500)),
            MAX,
        );
        scheduler.arm(&id, ConnectionId(1), &config, CodTrigger::Terminate, t0);
        assert!(scheduler.cancel(&id));

        let mut handler = Recorder::default();
        assert_eq!(scheduler.poll(t0 + Duration::from_secs(5), &mut handler), 0);
        assert!(handler.fired.is_empty());
    }

    #[test]
    fn test_trigger_must_match_policy() {
        let config = CodConfig::normalize(
            request(CancelOnDisconnectType::CancelOnTerminateOnly, Some(500)),
            MAX,
        );
        assert_eq!(config.window_for(CodTrigger::Disconnect), None);
        assert_eq!(
            config.window_for(CodTrigger::Terminate),
            Some(Duration::from_millis(500))
        );
    }
}
