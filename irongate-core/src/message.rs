/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Logical session-layer message model.
//!
//! The gateway never sees wire bytes of a concrete schema. A codec turns bytes
//! into the values defined here and turns [`OutboundFrame`]s back into bytes.
//!
//! - [`MsgType`]: Session-level message types plus opaque application types
//! - [`AdminMessage`]: FIX session messages (Logon, ResendRequest, ...)
//! - [`FixPMessage`]: FIXP session messages (Negotiate, Establish, ...)
//! - [`InboundFrame`]: What a codec hands to the gateway
//! - [`OutboundFrame`]: What the gateway hands to a publication

use crate::types::{CancelOnDisconnectType, CompId};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Message types the session layer distinguishes.
///
/// Everything that is not a session message is carried as
/// `Application(String)` and passed through untouched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MsgType {
    /// Heartbeat (0).
    Heartbeat,
    /// Test Request (1).
    TestRequest,
    /// Resend Request (2).
    ResendRequest,
    /// Reject (3).
    Reject,
    /// Sequence Reset (4).
    SequenceReset,
    /// Logout (5).
    Logout,
    /// Logon (A).
    Logon,
    /// FIXP Negotiate.
    Negotiate,
    /// FIXP NegotiationResponse.
    NegotiateResponse,
    /// FIXP NegotiationReject.
    NegotiateReject,
    /// FIXP Establish.
    Establish,
    /// FIXP EstablishmentAck.
    EstablishAck,
    /// FIXP EstablishmentReject.
    EstablishReject,
    /// FIXP Terminate.
    Terminate,
    /// FIXP Sequence (keep-alive and gap fill).
    Sequence,
    /// FIXP RetransmitRequest.
    RetransmitRequest,
    /// FIXP Retransmission.
    Retransmission,
    /// FIXP RetransmitReject.
    RetransmitReject,
    /// FIXP NotApplied.
    NotApplied,
    /// Any business message.
    Application(String),
}

impl MsgType {
    /// Returns the wire code (FIX) or template name (FIXP).
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Heartbeat => "0",
            Self::TestRequest => "1",
            Self::ResendRequest => "2",
            Self::Reject => "3",
            Self::SequenceReset => "4",
            Self::Logout => "5",
            Self::Logon => "A",
            Self::Negotiate => "Negotiate",
            Self::NegotiateResponse => "NegotiateResponse",
            Self::NegotiateReject => "NegotiateReject",
            Self::Establish => "Establish",
            Self::EstablishAck => "EstablishAck",
            Self::EstablishReject => "EstablishReject",
            Self::Terminate => "Terminate",
            Self::Sequence => "Sequence",
            Self::RetransmitRequest => "RetransmitRequest",
            Self::Retransmission => "Retransmission",
            Self::RetransmitReject => "RetransmitReject",
            Self::NotApplied => "NotApplied",
            Self::Application(code) => code,
        }
    }

    /// Returns true for session-level (administrative) message types.
    #[must_use]
    pub const fn is_admin(&self) -> bool {
        !matches!(self, Self::Application(_))
    }
}

impl std::str::FromStr for MsgType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "0" => Self::Heartbeat,
            "1" => Self::TestRequest,
            "2" => Self::ResendRequest,
            "3" => Self::Reject,
            "4" => Self::SequenceReset,
            "5" => Self::Logout,
            "A" => Self::Logon,
            "Negotiate" => Self::Negotiate,
            "NegotiateResponse" => Self::NegotiateResponse,
            "NegotiateReject" => Self::NegotiateReject,
            "Establish" => Self::Establish,
            "EstablishAck" => Self::EstablishAck,
            "EstablishReject" => Self::EstablishReject,
            "Terminate" => Self::Terminate,
            "Sequence" => Self::Sequence,
            "RetransmitRequest" => Self::RetransmitRequest,
            "Retransmission" => Self::Retransmission,
            "RetransmitReject" => Self::RetransmitReject,
            "NotApplied" => Self::NotApplied,
            other => Self::Application(other.to_string()),
        })
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cancel-on-disconnect request as carried on a logon or establish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CodRequest {
    /// Requested policy.
    pub cod_type: CancelOnDisconnectType,
    /// Requested window in milliseconds; absent or non-positive means none.
    pub window_ms: Option<i64>,
}

/// Contents of a FIX Logon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Logon {
    /// SenderCompID of the message (the counterparty for an acceptor).
    pub sender_comp_id: CompId,
    /// TargetCompID of the message.
    pub target_comp_id: CompId,
    /// SenderSubID, if present.
    pub sender_sub_id: Option<CompId>,
    /// TargetSubID, if present.
    pub target_sub_id: Option<CompId>,
    /// HeartBtInt in seconds.
    pub heartbeat_interval_secs: u32,
    /// ResetSeqNumFlag.
    pub reset_seq_num: bool,
    /// Username, if present.
    pub username: Option<String>,
    /// Password, if present.
    pub password: Option<String>,
    /// Cancel-on-disconnect request, if present.
    pub cod: Option<CodRequest>,
}

/// FIX session-level messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdminMessage {
    /// Logon (A).
    Logon(Logon),
    /// Logout (5).
    Logout {
        /// Human readable reason.
        text: Option<String>,
    },
    /// Heartbeat (0).
    Heartbeat {
        /// Echoed TestReqID.
        test_req_id: Option<String>,
    },
    /// Test Request (1).
    TestRequest {
        /// TestReqID to echo.
        test_req_id: String,
    },
    /// Resend Request (2).
    ResendRequest {
        /// BeginSeqNo.
        begin: u64,
        /// EndSeqNo, 0 meaning "through the latest".
        end: u64,
    },
    /// Sequence Reset (4).
    SequenceReset {
        /// NewSeqNo.
        new_seq_no: u64,
        /// GapFillFlag.
        gap_fill: bool,
    },
    /// Reject (3).
    Reject {
        /// RefSeqNum.
        ref_seq_num: u64,
        /// Text.
        text: String,
    },
}

impl AdminMessage {
    /// Returns the message type of this admin message.
    #[must_use]
    pub const fn msg_type(&self) -> MsgType {
        match self {
            Self::Logon(_) => MsgType::Logon,
            Self::Logout { .. } => MsgType::Logout,
            Self::Heartbeat { .. } => MsgType::Heartbeat,
            Self::TestRequest { .. } => MsgType::TestRequest,
            Self::ResendRequest { .. } => MsgType::ResendRequest,
            Self::SequenceReset { .. } => MsgType::SequenceReset,
            Self::Reject { .. } => MsgType::Reject,
        }
    }
}

/// Reason codes for a FIXP NegotiationReject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NegotiateRejectCode {
    /// The authentication strategy refused the credentials.
    Credentials,
    /// The session version id is lower than the persisted one.
    InvalidSessionVerId,
    /// This session version was already negotiated.
    AlreadyNegotiated,
    /// The session is bound to another connection.
    DuplicateId,
    /// Anything else.
    Unspecified,
}

/// Reason codes for a FIXP EstablishmentReject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EstablishRejectCode {
    /// No negotiation happened for this session version.
    Unnegotiated,
    /// The session is already established on this connection.
    AlreadyEstablished,
    /// The session version id does not match the negotiated one.
    InvalidSessionVerId,
    /// The keep-alive interval is not acceptable.
    InvalidKeepAliveInterval,
    /// The authentication strategy refused the credentials.
    Credentials,
    /// Anything else.
    Unspecified,
}

/// Reason codes for a FIXP Terminate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TerminationCode {
    /// Normal end of the session.
    Finished,
    /// No traffic within the keep-alive window.
    KeepaliveExpired,
    /// A protocol rule was broken.
    Unspecified,
}

/// Reason codes for a FIXP RetransmitReject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RetransmitRejectCode {
    /// More messages requested than allowed.
    RequestLimitExceeded,
    /// The range starts beyond the last sent message.
    OutOfRange,
    /// Another retransmission is still in flight.
    InProgress,
}

/// FIXP session-level messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FixPMessage {
    /// Negotiate.
    Negotiate {
        /// Session id.
        session_id: u64,
        /// Session version id.
        session_ver_id: u64,
        /// Entering firm.
        entering_firm: Option<String>,
        /// Client request timestamp (nanoseconds since epoch).
        timestamp_nanos: u64,
        /// Opaque credentials for the authentication strategy.
        credentials: Option<Bytes>,
    },
    /// NegotiationResponse.
    NegotiateResponse {
        /// Session id.
        session_id: u64,
        /// Session version id.
        session_ver_id: u64,
        /// Echoed request timestamp.
        request_timestamp_nanos: u64,
        /// Previous session version id, 0 when none.
        previous_uuid: u64,
        /// Last sequence number sent on the previous version.
        previous_seq_no: u64,
    },
    /// NegotiationReject.
    NegotiateReject {
        /// Session id.
        session_id: u64,
        /// Session version id.
        session_ver_id: u64,
        /// Echoed request timestamp.
        request_timestamp_nanos: u64,
        /// Reason code.
        code: NegotiateRejectCode,
        /// Human readable reason.
        reason: String,
    },
    /// Establish.
    Establish {
        /// Session id.
        session_id: u64,
        /// Session version id.
        session_ver_id: u64,
        /// Client request timestamp.
        timestamp_nanos: u64,
        /// Requested keep-alive interval in milliseconds.
        keep_alive_interval_ms: u64,
        /// Next sequence number the client will send.
        next_seq_no: u64,
        /// Cancel-on-disconnect request.
        cod: CodRequest,
        /// Opaque credentials.
        credentials: Option<Bytes>,
    },
    /// EstablishmentAck.
    EstablishAck {
        /// Session id.
        session_id: u64,
        /// Session version id.
        session_ver_id: u64,
        /// Echoed request timestamp.
        request_timestamp_nanos: u64,
        /// Next sequence number this engine will send.
        next_seq_no: u64,
        /// Last sequence number received from the client.
        previous_seq_no: u64,
        /// Previous session version id, 0 when none.
        previous_uuid: u64,
        /// Accepted keep-alive interval in milliseconds.
        keep_alive_interval_ms: u64,
    },
    /// EstablishmentReject.
    EstablishReject {
        /// Session id.
        session_id: u64,
        /// Session version id.
        session_ver_id: u64,
        /// Echoed request timestamp.
        request_timestamp_nanos: u64,
        /// Reason code.
        code: EstablishRejectCode,
        /// Human readable reason.
        reason: String,
    },
    /// Terminate.
    Terminate {
        /// Session id.
        session_id: u64,
        /// Session version id.
        session_ver_id: u64,
        /// Reason code.
        code: TerminationCode,
        /// Human readable reason.
        reason: String,
    },
    /// Sequence, used as keep-alive and to skip unreplayable messages.
    Sequence {
        /// Next sequence number of the sender.
        next_seq_no: u64,
    },
    /// RetransmitRequest.
    RetransmitRequest {
        /// Session id.
        session_id: u64,
        /// First sequence number requested.
        from_seq_no: u64,
        /// Number of messages requested.
        count: u64,
        /// Client request timestamp.
        timestamp_nanos: u64,
    },
    /// Retransmission header preceding replayed messages.
    Retransmission {
        /// Session id.
        session_id: u64,
        /// Echoed request timestamp.
        request_timestamp_nanos: u64,
        /// First replayed sequence number.
        next_seq_no: u64,
        /// Number of replayed messages.
        count: u64,
    },
    /// RetransmitReject.
    RetransmitReject {
        /// Session id.
        session_id: u64,
        /// Echoed request timestamp.
        request_timestamp_nanos: u64,
        /// Reason code.
        code: RetransmitRejectCode,
    },
    /// NotApplied, telling the client which messages were skipped.
    NotApplied {
        /// First skipped sequence number.
        from_seq_no: u64,
        /// Number of skipped messages.
        count: u64,
    },
}

impl FixPMessage {
    /// Returns the message type of this FIXP message.
    #[must_use]
    pub const fn msg_type(&self) -> MsgType {
        match self {
            Self::Negotiate { .. } => MsgType::Negotiate,
            Self::NegotiateResponse { .. } => MsgType::NegotiateResponse,
            Self::NegotiateReject { .. } => MsgType::NegotiateReject,
            Self::Establish { .. } => MsgType::Establish,
            Self::EstablishAck { .. } => MsgType::EstablishAck,
            Self::EstablishReject { .. } => MsgType::EstablishReject,
            Self::Terminate { .. } => MsgType::Terminate,
            Self::Sequence { .. } => MsgType::Sequence,
            Self::RetransmitRequest { .. } => MsgType::RetransmitRequest,
            Self::Retransmission { .. } => MsgType::Retransmission,
            Self::RetransmitReject { .. } => MsgType::RetransmitReject,
            Self::NotApplied { .. } => MsgType::NotApplied,
        }
    }
}

/// Payload of an inbound sequenced message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundBody {
    /// Session-level message.
    Admin(AdminMessage),
    /// Business message, opaque to the session layer.
    Application {
        /// Message type.
        msg_type: MsgType,
        /// Raw message bytes as received.
        body: Bytes,
    },
}

/// A decoded inbound FIX message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// MsgSeqNum.
    pub seq_num: u64,
    /// PossDupFlag.
    pub poss_dup: bool,
    /// Decoded payload.
    pub body: InboundBody,
}

impl InboundMessage {
    /// Creates an inbound admin message.
    #[must_use]
    pub const fn admin(seq_num: u64, message: AdminMessage) -> Self {
        Self {
            seq_num,
            poss_dup: false,
            body: InboundBody::Admin(message),
        }
    }

    /// Creates an inbound application message.
    #[must_use]
    pub fn application(seq_num: u64, msg_type: impl Into<String>, body: Bytes) -> Self {
        Self {
            seq_num,
            poss_dup: false,
            body: InboundBody::Application {
                msg_type: MsgType::Application(msg_type.into()),
                body,
            },
        }
    }

    /// Marks the message as a possible duplicate.
    #[must_use]
    pub const fn with_poss_dup(mut self, poss_dup: bool) -> Self {
        self.poss_dup = poss_dup;
        self
    }

    /// Returns the message type.
    #[must_use]
    pub fn msg_type(&self) -> MsgType {
        match &self.body {
            InboundBody::Admin(admin) => admin.msg_type(),
            InboundBody::Application { msg_type, .. } => msg_type.clone(),
        }
    }
}

/// A decoded inbound FIXP business message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixPApplication {
    /// Sequence number of the message.
    pub seq_num: u64,
    /// True when the message is a retransmission.
    pub poss_retrans: bool,
    /// Message type (template name).
    pub msg_type: MsgType,
    /// Raw message bytes.
    pub body: Bytes,
}

/// What a codec produces from inbound bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// A FIX message.
    Fix(InboundMessage),
    /// A FIXP session message.
    FixP(FixPMessage),
    /// A FIXP business message.
    FixPApplication(FixPApplication),
}

/// A frame the session layer asks a publication to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundFrame<'a> {
    /// A sequenced FIX admin message.
    Admin {
        /// MsgSeqNum to stamp.
        seq_num: u64,
        /// PossDupFlag to stamp.
        poss_dup: bool,
        /// Message contents.
        message: &'a AdminMessage,
    },
    /// An unsequenced FIXP session message.
    FixP(&'a FixPMessage),
    /// A freshly sent business message.
    Application {
        /// Sequence number to stamp.
        seq_num: u64,
        /// Message type.
        msg_type: &'a MsgType,
        /// Message bytes provided by the application.
        body: &'a Bytes,
    },
    /// A previously archived message being resent; the codec sets the
    /// possible-duplicate marker on the original bytes.
    Replay {
        /// Original sequence number.
        seq_num: u64,
        /// Message type.
        msg_type: &'a MsgType,
        /// Archived bytes.
        body: &'a Bytes,
    },
}

impl OutboundFrame<'_> {
    /// Returns the sequence number carried by the frame, if sequenced.
    #[must_use]
    pub const fn seq_num(&self) -> Option<u64> {
        match self {
            Self::Admin { seq_num, .. }
            | Self::Application { seq_num, .. }
            | Self::Replay { seq_num, .. } => Some(*seq_num),
            Self::FixP(_) => None,
        }
    }

    /// Returns the message type of the frame.
    #[must_use]
    pub fn msg_type(&self) -> MsgType {
        match self {
            Self::Admin { message, .. } => message.msg_type(),
            Self::FixP(message) => message.msg_type(),
            Self::Application { msg_type, .. } | Self::Replay { msg_type, .. } => {
                (*msg_type).clone()
            }
        }
    }

    /// Returns true for frames that must be archived for later replay.
    ///
    /// Replays, resent gap fills and unsequenced FIXP messages are not
    /// archived again.
    #[must_use]
    pub const fn is_archivable(&self) -> bool {
        matches!(
            self,
            Self::Admin {
                poss_dup: false,
                ..
            } | Self::Application { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_msg_type_codes() {
        assert_eq!(MsgType::Logon.as_str(), "A");
        assert_eq!(MsgType::SequenceReset.as_str(), "4");
        assert_eq!("2".parse::<MsgType>().unwrap(), MsgType::ResendRequest);
        assert_eq!(
            "D".parse::<MsgType>().unwrap(),
            MsgType::Application("D".to_string())
        );
        assert_eq!("Terminate".parse::<MsgType>().unwrap(), MsgType::Terminate);
    }

    #[test]
    fn test_msg_type_admin_flag() {
        assert!(MsgType::Heartbeat.is_admin());
        assert!(MsgType::Establish.is_admin());
        assert!(!MsgType::Application("8".into()).is_admin());
    }

    #[test]
    fn test_inbound_message_type() {
        let msg = InboundMessage::admin(3, AdminMessage::TestRequest {
            test_req_id: "T1".into(),
        });
        assert_eq!(msg.msg_type(), MsgType::TestRequest);

        let app = InboundMessage::application(4, "D", Bytes::from_static(b"order"))
            .with_poss_dup(true);
        assert!(app.poss_dup);
        assert_eq!(app.msg_type().as_str(), "D");
    }

    #[test]
    fn test_outbound_frame_archivable() {
        let heartbeat = AdminMessage::Heartbeat { test_req_id: None };
        let admin = OutboundFrame::Admin {
            seq_num: 7,
            poss_dup: false,
            message: &heartbeat,
        };
        assert!(admin.is_archivable());
        assert_eq!(admin.seq_num(), Some(7));

        let body = Bytes::from_static(b"x");
        let msg_type = MsgType::Application("8".into());
        let replay = OutboundFrame::Replay {
            seq_num: 2,
            msg_type: &msg_type,
            body: &body,
        };
        assert!(!replay.is_archivable());

        let sequence = FixPMessage::Sequence { next_seq_no: 3 };
        let fixp = OutboundFrame::FixP(&sequence);
        assert_eq!(fixp.seq_num(), None);
        assert_eq!(fixp.msg_type(), MsgType::Sequence);
    }
}
