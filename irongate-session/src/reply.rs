/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Asynchronous capability replies.
//!
//! Capabilities that cannot decide immediately hand back a [`Reply`] and
//! complete it later through the paired [`Responder`], from any thread. The
//! framer polls the reply once per duty cycle without blocking.

use std::time::Instant;
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;

/// Creates a connected responder and reply.
#[must_use]
pub fn reply_channel<T>() -> (Responder<T>, Reply<T>) {
    let (tx, rx) = oneshot::channel();
    (
        Responder { tx },
        Reply {
            rx,
            deadline: None,
        },
    )
}

/// Completing side of a [`Reply`].
#[derive(Debug)]
pub struct Responder<T> {
    tx: oneshot::Sender<T>,
}

impl<T> Responder<T> {
    /// Completes the reply.
    ///
    /// # Errors
    /// Returns the value back if the reply was dropped, e.g. because the
    /// connection has gone away.
    pub fn send(self, value: T) -> Result<(), T> {
        self.tx.send(value)
    }
}

/// Outcome of polling a [`Reply`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyPoll<T> {
    /// The value arrived.
    Ready(T),
    /// Still waiting.
    Pending,
    /// The deadline passed first.
    TimedOut,
    /// The responder was dropped without answering.
    Dropped,
}

/// Pending result of an asynchronous capability call.
#[derive(Debug)]
pub struct Reply<T> {
    rx: oneshot::Receiver<T>,
    deadline: Option<Instant>,
}

impl<T> Reply<T> {
    /// Sets the deadline of the reply.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Returns the deadline, if one was set.
    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Polls for the value without blocking.
    ///
    /// A value that arrived is returned even if the deadline has passed.
    pub fn poll(&mut self, now: Instant) -> ReplyPoll<T> {
        match self.rx.try_recv() {
            Ok(value) => ReplyPoll::Ready(value),
            Err(TryRecvError::Empty) => match self.deadline {
                Some(deadline) if now >= deadline => ReplyPoll::TimedOut,
                _ => ReplyPoll::Pending,
            },
            Err(TryRecvError::Closed) => ReplyPoll::Dropped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_reply_ready() {
        let (responder, mut reply) = reply_channel();
        let now = Instant::now();
        assert_eq!(reply.poll(now), ReplyPoll::Pending);

        responder.send(7u32).unwrap();
        assert_eq!(reply.poll(now), ReplyPoll::Ready(7));
    }

    #[test]
    fn test_reply_times_out() {
        let now = Instant::now();
        let (_responder, reply) = reply_channel::<u32>();
        let mut reply = reply.with_deadline(now + Duration::from_secs(1));

        assert_eq!(reply.poll(now), ReplyPoll::Pending);
        assert_eq!(reply.poll(now + Duration::from_secs(1)), ReplyPoll::TimedOut);
    }

    #[test]
    fn test_dropped_responder() {
        let (responder, mut reply) = reply_channel::<u32>();
        drop(responder);
        assert_eq!(reply.poll(Instant::now()), ReplyPoll::Dropped);
    }

    #[test]
    fn test_responder_from_other_thread() {
        let (responder, mut reply) = reply_channel();
        std::thread::spawn(move || responder.send("ok").unwrap())
            .join()
            .unwrap();
        assert_eq!(reply.poll(Instant::now()), ReplyPoll::Ready("ok"));
    }
}
