/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Heartbeat, TestRequest and keep-alive timing.
//!
//! This module handles liveness for both protocols:
//! - FIX heartbeats at the negotiated interval
//! - TestRequest when nothing was received for interval plus grace
//! - Heartbeat timeout one interval after an unanswered TestRequest
//! - FIXP keep-alive expiry after two lapsed intervals
//!
//! All checks take the duty cycle's `now` instead of reading the clock.

use std::time::{Duration, Instant};

/// Manages heartbeat timing for a session.
#[derive(Debug)]
pub struct HeartbeatManager {
    /// Heartbeat interval.
    interval: Duration,
    /// Grace period before a TestRequest.
    grace: Duration,
    /// Time of last message sent.
    last_sent: Instant,
    /// Time of last message received.
    last_received: Instant,
    /// Pending TestRequest ID, if any.
    test_request_pending: Option<String>,
    /// Time when TestRequest was sent.
    test_request_sent_at: Option<Instant>,
    /// Counter for generated TestReqIDs.
    test_request_counter: u64,
}

impl HeartbeatManager {
    /// Creates a new heartbeat manager.
    ///
    /// # Arguments
    /// * `interval` - The heartbeat interval
    /// * `grace` - Extra time before a TestRequest is sent
    /// * `now` - Current time
    #[must_use]
    pub const fn new(interval: Duration, grace: Duration, now: Instant) -> Self {
        Self {
            interval,
            grace,
            last_sent: now,
            last_received: now,
            test_request_pending: None,
            test_request_sent_at: None,
            test_request_counter: 0,
        }
    }

    /// Records that a message was sent.
    #[inline]
    pub fn on_message_sent(&mut self, now: Instant) {
        self.last_sent = now;
    }

    /// Records that a message was received.
    ///
    /// Any inbound traffic proves liveness, so a pending TestRequest is
    /// cleared. A Heartbeat echoing a different TestReqID still counts.
    ///
    /// # Arguments
    /// * `now` - Current time
    /// * `test_req_id` - The TestReqID echoed by a Heartbeat, if present
    pub fn on_message_received(&mut self, now: Instant, test_req_id: Option<&str>) {
        self.last_received = now;

        if let (Some(pending), Some(received)) = (&self.test_request_pending, test_req_id)
            && pending != received
        {
            tracing::debug!(pending, received, "heartbeat echoed unexpected TestReqID");
        }
        self.test_request_pending = None;
        self.test_request_sent_at = None;
    }

    /// Checks if a heartbeat should be sent.
    #[must_use]
    pub fn should_send_heartbeat(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_sent) >= self.interval
    }

    /// Checks if a TestRequest should be sent.
    #[must_use]
    pub fn should_send_test_request(&self, now: Instant) -> bool {
        if self.test_request_pending.is_some() {
            return false;
        }
        now.saturating_duration_since(self.last_received) >= self.interval + self.grace
    }

    /// Checks if the session has timed out.
    ///
    /// A timeout occurs if a TestRequest was sent but nothing was received
    /// within the interval.
    #[must_use]
    pub fn is_timed_out(&self, now: Instant) -> bool {
        self.test_request_sent_at
            .is_some_and(|sent_at| now.saturating_duration_since(sent_at) >= self.interval)
    }

    /// Checks if two keep-alive intervals passed without inbound traffic.
    #[must_use]
    pub fn is_keepalive_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_received) >= self.interval * 2
    }

    /// Allocates the next TestReqID.
    pub fn next_test_req_id(&mut self) -> String {
        self.test_request_counter += 1;
        format!("TEST{}", self.test_request_counter)
    }

    /// Records that a TestRequest was sent.
    ///
    /// # Arguments
    /// * `test_req_id` - The TestReqID that was sent
    /// * `now` - Current time
    pub fn on_test_request_sent(&mut self, test_req_id: String, now: Instant) {
        self.test_request_pending = Some(test_req_id);
        self.test_request_sent_at = Some(now);
        self.last_sent = now;
    }

    /// Returns the pending TestRequest ID, if any.
    #[must_use]
    pub fn pending_test_request(&self) -> Option<&str> {
        self.test_request_pending.as_deref()
    }

    /// Returns the time since the last message was received.
    #[must_use]
    pub fn time_since_last_received(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_received)
    }

    /// Returns the heartbeat interval.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Changes the interval, e.g. to the one the counterparty proposed.
    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    /// Resets the manager state.
    pub fn reset(&mut self, now: Instant) {
        self.last_sent = now;
        self.last_received = now;
        self.test_request_pending = None;
        self.test_request_sent_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_secs(30);
    const GRACE: Duration = Duration::from_secs(1);

    #[test]
    fn test_heartbeat_manager_new() {
        let mgr = HeartbeatManager::new(INTERVAL, GRACE, Instant::now());
        assert_eq!(mgr.interval(), INTERVAL);
        assert!(mgr.pending_test_request().is_none());
    }

    #[test]
    fn test_should_send_heartbeat() {
        let t0 = Instant::now();
        let mut mgr = HeartbeatManager::new(INTERVAL, GRACE, t0);
        assert!(!mgr.should_send_heartbeat(t0 + Duration::from_secs(29)));
        assert!(mgr.should_send_heartbeat(t0 + INTERVAL));

        mgr.on_message_sent(t0 + INTERVAL);
        assert!(!mgr.should_send_heartbeat(t0 + INTERVAL));
    }

    #[test]
    fn test_test_request_then_timeout() {
        let t0 = Instant::now();
        let mut mgr = HeartbeatManager::new(INTERVAL, GRACE, t0);
        assert!(!mgr.should_send_test_request(t0 + INTERVAL));

        let t1 = t0 + INTERVAL + GRACE;
        assert!(mgr.should_send_test_request(t1));
        let id = mgr.next_test_req_id();
        mgr.on_test_request_sent(id, t1);
        assert!(!mgr.should_send_test_request(t1));
        assert!(!mgr.is_timed_out(t1 + Duration::from_secs(29)));
        assert!(mgr.is_timed_out(t1 + INTERVAL));
    }

    #[test]
    fn test_response_clears_pending_test_request() {
        let t0 = Instant::now();
        let mut mgr = HeartbeatManager::new(INTERVAL, GRACE, t0);

        mgr.on_test_request_sent("TEST1".to_string(), t0);
        assert_eq!(mgr.pending_test_request(), Some("TEST1"));

        mgr.on_message_received(t0 + GRACE, Some("TEST1"));
        assert!(mgr.pending_test_request().is_none());
        assert!(!mgr.is_timed_out(t0 + INTERVAL * 3));
    }

    #[test]
    fn test_keepalive_expiry() {
        let t0 = Instant::now();
        let mut mgr = HeartbeatManager::new(Duration::from_millis(500), GRACE, t0);
        assert!(!mgr.is_keepalive_expired(t0 + Duration::from_millis(999)));
        assert!(mgr.is_keepalive_expired(t0 + Duration::from_millis(1_000)));

        mgr.on_message_received(t0 + Duration::from_millis(900), None);
        assert!(!mgr.is_keepalive_expired(t0 + Duration::from_millis(1_000)));
    }

    #[test]
    fn test_test_req_ids_are_unique() {
        let mut mgr = HeartbeatManager::new(INTERVAL, GRACE, Instant::now());
        assert_eq!(mgr.next_test_req_id(), "TEST1");
        assert_eq!(mgr.next_test_req_id(), "TEST2");
    }
}
