/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! The framer's outbound publication.
//!
//! Frames are encoded, handed to the transport and, when archiving is on,
//! queued for the archiver thread. The queue is bounded for outbound frames:
//! once it is full, archivable frames are backpressured so a session never
//! sends a message that could not be archived for replay.

use crate::codec::{Codec, Transport};
use bytes::Bytes;
use irongate_core::message::{MsgType, OutboundFrame};
use irongate_core::types::Direction;
use irongate_session::capability::{Publication, PublishContext, PublishError};
use irongate_store::ArchiveRequest;
use std::collections::VecDeque;
use tracing::{debug, error};

/// Archive requests waiting for a free slot in the archiver channel.
#[derive(Debug)]
pub struct ArchiveQueue {
    requests: VecDeque<ArchiveRequest>,
    capacity: usize,
}

impl ArchiveQueue {
    /// Creates a queue that backpressures outbound frames at `capacity`.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            requests: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Returns true once outbound frames should be backpressured.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.requests.len() >= self.capacity
    }

    /// Returns the number of queued requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub(crate) fn push_back(&mut self, request: ArchiveRequest) {
        self.requests.push_back(request);
    }

    pub(crate) fn push_front(&mut self, request: ArchiveRequest) {
        self.requests.push_front(request);
    }

    pub(crate) fn pop_front(&mut self) -> Option<ArchiveRequest> {
        self.requests.pop_front()
    }

    pub(crate) fn clear(&mut self) {
        self.requests.clear();
    }
}

/// Publication lent to a session for one call.
pub struct FramerPublication<'a, C, T> {
    codec: &'a mut C,
    transport: &'a mut T,
    archive: Option<&'a mut ArchiveQueue>,
    log_inbound: bool,
    log_outbound: bool,
}

impl<'a, C: Codec, T: Transport> FramerPublication<'a, C, T> {
    /// Creates a publication.
    ///
    /// # Arguments
    /// * `codec` - Encodes frames
    /// * `transport` - Sends the encoded bytes
    /// * `archive` - Queue for the archiver, `None` when nothing is archived
    /// * `log_inbound` - Archive inbound application messages
    /// * `log_outbound` - Archive outbound sequenced frames
    #[must_use]
    pub fn new(
        codec: &'a mut C,
        transport: &'a mut T,
        archive: Option<&'a mut ArchiveQueue>,
        log_inbound: bool,
        log_outbound: bool,
    ) -> Self {
        Self {
            codec,
            transport,
            archive,
            log_inbound,
            log_outbound,
        }
    }

    fn queue(
        &mut self,
        context: &PublishContext<'_>,
        direction: Direction,
        seq_num: u64,
        msg_type: MsgType,
        body: Bytes,
    ) {
        let (Some(archive), Some(session_id)) = (self.archive.as_deref_mut(), context.session_id)
        else {
            return;
        };
        archive.push_back(ArchiveRequest {
            session_id: session_id.clone(),
            direction,
            sequence_index: context.sequence_index,
            seq_num,
            msg_type,
            body,
        });
    }
}

impl<C: Codec, T: Transport> Publication for FramerPublication<'_, C, T> {
    fn publish(
        &mut self,
        context: &PublishContext<'_>,
        frame: &OutboundFrame<'_>,
    ) -> Result<(), PublishError> {
        let archivable = self.log_outbound && frame.is_archivable() && context.session_id.is_some();
        if archivable
            && let Some(archive) = self.archive.as_deref()
            && archive.is_full()
        {
            debug!(connection = %context.connection_id, queued = archive.len(), "archive queue full");
            return Err(PublishError::Backpressure);
        }

        let bytes = self.codec.encode(frame).map_err(|e| {
            error!(
                connection = %context.connection_id,
                msg_type = %frame.msg_type(),
                error = %e,
                "frame could not be encoded"
            );
            PublishError::Encode(e)
        })?;
        self.transport.try_send(context.connection_id, &bytes)?;

        if archivable && let Some(seq_num) = frame.seq_num() {
            self.queue(context, Direction::Outbound, seq_num, frame.msg_type(), bytes);
        }
        Ok(())
    }

    fn record_inbound(
        &mut self,
        context: &PublishContext<'_>,
        seq_num: u64,
        msg_type: &MsgType,
        body: &Bytes,
    ) {
        if self.log_inbound {
            self.queue(context, Direction::Inbound, seq_num, msg_type.clone(), body.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{TextCodec, VecTransport};
    use irongate_core::error::EncodeError;
    use irongate_core::message::AdminMessage;
    use irongate_core::types::{ConnectionId, SessionId};

    fn context(session_id: &SessionId) -> PublishContext<'_> {
        PublishContext {
            connection_id: ConnectionId(1),
            session_id: Some(session_id),
            sequence_index: 2,
        }
    }

    #[test]
    fn test_publish_sends_and_queues_archive() {
        let mut codec = TextCodec::default();
        let mut transport = VecTransport::default();
        let mut queue = ArchiveQueue::new(4);
        let session_id = SessionId::fixp(9);
        let body = Bytes::from_static(b"order");
        let msg_type = MsgType::Application("D".into());

        let mut publication =
            FramerPublication::new(&mut codec, &mut transport, Some(&mut queue), true, true);
        publication
            .publish(
                &context(&session_id),
                &OutboundFrame::Application {
                    seq_num: 1,
                    msg_type: &msg_type,
                    body: &body,
                },
            )
            .unwrap();

        assert_eq!(transport.sent.len(), 1);
        let request = queue.pop_front().unwrap();
        assert_eq!(request.seq_num, 1);
        assert_eq!(request.sequence_index, 2);
        assert_eq!(request.direction, Direction::Outbound);
        assert_eq!(request.body, transport.sent[0].1);
    }

    #[test]
    fn test_unarchivable_frames_are_not_queued() {
        let mut codec = TextCodec::default();
        let mut transport = VecTransport::default();
        let mut queue = ArchiveQueue::new(4);
        let session_id = SessionId::fixp(9);
        let heartbeat = AdminMessage::Heartbeat { test_req_id: None };

        let mut publication =
            FramerPublication::new(&mut codec, &mut transport, Some(&mut queue), true, true);
        publication
            .publish(
                &context(&session_id),
                &OutboundFrame::Admin {
                    seq_num: 4,
                    poss_dup: true,
                    message: &heartbeat,
                },
            )
            .unwrap();

        assert_eq!(transport.sent.len(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_full_archive_queue_backpressures() {
        let mut codec = TextCodec::default();
        let mut transport = VecTransport::default();
        let mut queue = ArchiveQueue::new(1);
        let session_id = SessionId::fixp(9);
        let body = Bytes::from_static(b"x");
        let msg_type = MsgType::Application("D".into());
        let frame = |seq_num| OutboundFrame::Application {
            seq_num,
            msg_type: &msg_type,
            body: &body,
        };

        let mut publication =
            FramerPublication::new(&mut codec, &mut transport, Some(&mut queue), true, true);
        publication.publish(&context(&session_id), &frame(1)).unwrap();
        assert_eq!(
            publication.publish(&context(&session_id), &frame(2)),
            Err(PublishError::Backpressure)
        );
        drop(publication);
        assert_eq!(transport.sent.len(), 1);
    }

    #[test]
    fn test_transport_backpressure_propagates() {
        let mut codec = TextCodec::default();
        let mut transport = VecTransport {
            blocked: true,
            ..VecTransport::default()
        };
        let mut queue = ArchiveQueue::new(4);
        let session_id = SessionId::fixp(9);
        let body = Bytes::from_static(b"x");
        let msg_type = MsgType::Application("D".into());

        let mut publication =
            FramerPublication::new(&mut codec, &mut transport, Some(&mut queue), true, true);
        let result = publication.publish(
            &context(&session_id),
            &OutboundFrame::Application {
                seq_num: 1,
                msg_type: &msg_type,
                body: &body,
            },
        );

        assert_eq!(result, Err(PublishError::Backpressure));
        drop(publication);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_encode_failure_is_reported_and_nothing_sent() {
        let msg_type = MsgType::Application("D".into());
        let mut codec = TextCodec {
            unencodable: Some(msg_type.clone()),
            ..TextCodec::default()
        };
        let mut transport = VecTransport::default();
        let mut queue = ArchiveQueue::new(4);
        let session_id = SessionId::fixp(9);
        let body = Bytes::from_static(b"x");

        let mut publication =
            FramerPublication::new(&mut codec, &mut transport, Some(&mut queue), true, true);
        let result = publication.publish(
            &context(&session_id),
            &OutboundFrame::Application {
                seq_num: 1,
                msg_type: &msg_type,
                body: &body,
            },
        );

        assert!(matches!(result, Err(PublishError::Encode(EncodeError::Unsupported(_)))));
        drop(publication);
        assert!(transport.sent.is_empty());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_inbound_recorded_when_enabled() {
        let mut codec = TextCodec::default();
        let mut transport = VecTransport::default();
        let mut queue = ArchiveQueue::new(4);
        let session_id = SessionId::fixp(9);

        let mut publication =
            FramerPublication::new(&mut codec, &mut transport, Some(&mut queue), true, false);
        publication.record_inbound(
            &context(&session_id),
            3,
            &MsgType::Application("8".into()),
            &Bytes::from_static(b"fill"),
        );
        drop(publication);

        let request = queue.pop_front().unwrap();
        assert_eq!(request.direction, Direction::Inbound);
        assert_eq!(request.seq_num, 3);
    }
}
