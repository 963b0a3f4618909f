//! Gateway walkthrough driven entirely in memory.
//!
//! A FIX client logs on with cancel-on-disconnect, sends an order, gets an
//! execution report and then drops its connection; the cancel-on-disconnect
//! timer fires afterwards. A FIXP client negotiates, establishes, trades and
//! terminates on a second connection.

use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use tracing::info;

use irongate::prelude::*;

mod common;
use common::{CLIENT, GATEWAY, comp, fix_session, init_logging};

const FIX: ConnectionId = ConnectionId(1);
const FIXP: ConnectionId = ConnectionId(2);
const FIXP_SESSION: u64 = 42;

/// Renders frames as text; inbound frames arrive already decoded.
struct DebugCodec;

impl Codec for DebugCodec {
    fn encode(&mut self, frame: &OutboundFrame<'_>) -> std::result::Result<Bytes, EncodeError> {
        Ok(Bytes::from(format!("{frame:?}")))
    }

    fn decode(&mut self, _bytes: &[u8]) -> std::result::Result<InboundFrame, DecodeError> {
        Err(DecodeError::UnknownMessageType("walkthrough frames arrive decoded".into()))
    }
}

/// Hands outbound bytes to the client side over a bounded channel.
struct ChannelTransport {
    outbound: Sender<(ConnectionId, Bytes)>,
}

impl Transport for ChannelTransport {
    fn try_send(&mut self, connection_id: ConnectionId, bytes: &Bytes) -> std::result::Result<(), Backpressure> {
        match self.outbound.try_send((connection_id, bytes.clone())) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => Err(Backpressure),
        }
    }

    fn close(&mut self, connection_id: ConnectionId) {
        info!(connection = %connection_id, "transport closed");
    }
}

/// Trading desk: remembers orders to answer and cancels on timeout.
#[derive(Default)]
struct Desk {
    orders: Vec<(SessionId, u64)>,
}

impl SessionHandler for Desk {
    fn on_established(&mut self, session_id: &SessionId, connection_id: ConnectionId) {
        info!(session = %session_id, connection = %connection_id, "desk open for session");
    }

    fn on_message(&mut self, session_id: &SessionId, seq_num: u64, msg_type: &MsgType, body: &Bytes) {
        info!(
            session = %session_id,
            seq_num,
            %msg_type,
            body = %String::from_utf8_lossy(body),
            "order received"
        );
        self.orders.push((session_id.clone(), seq_num));
    }

    fn on_disconnect(&mut self, session_id: &SessionId, reason: &DisconnectReason) {
        info!(session = %session_id, %reason, "desk closed for session");
    }
}

impl CancelOnDisconnectHandler for Desk {
    fn on_cancel_on_disconnect_timeout(&mut self, session_id: &SessionId, context: &CodContext) {
        info!(
            session = %session_id,
            window_ms = context.window.as_millis(),
            "cancelling every open order of the session"
        );
    }
}

type Gateway = Engine<DebugCodec, ChannelTransport, Desk>;

fn drain(client: &Receiver<(ConnectionId, Bytes)>) {
    while let Ok((connection_id, bytes)) = client.try_recv() {
        info!(connection = %connection_id, "<- {}", String::from_utf8_lossy(&bytes));
    }
}

fn answer_orders(engine: &mut Gateway, now: Instant) -> anyhow::Result<()> {
    let orders = std::mem::take(&mut engine.framer_mut().application_mut().orders);
    for (session_id, seq_num) in orders {
        let report = Bytes::from(format!("ExecType=New|OrderSeq={seq_num}"));
        let outcome = engine
            .framer_mut()
            .send(&session_id, MsgType::Application("8".into()), report, now)?;
        info!(session = %session_id, ?outcome, "execution report sent");
    }
    Ok(())
}

fn fix_logon() -> InboundFrame {
    InboundFrame::Fix(InboundMessage::admin(
        1,
        AdminMessage::Logon(Logon {
            sender_comp_id: comp(CLIENT),
            target_comp_id: comp(GATEWAY),
            sender_sub_id: None,
            target_sub_id: None,
            heartbeat_interval_secs: 30,
            reset_seq_num: false,
            username: Some("demo".into()),
            password: None,
            cod: Some(CodRequest {
                cod_type: CancelOnDisconnectType::CancelOnDisconnectOnly,
                window_ms: Some(500),
            }),
        }),
    ))
}

fn run_fix(engine: &mut Gateway, client: &Receiver<(ConnectionId, Bytes)>, start: Instant) -> anyhow::Result<()> {
    let framer = engine.framer_mut();
    framer.on_connect(FIX, Protocol::Fix, start)?;
    framer.on_frame(FIX, fix_logon(), start);
    framer.on_frame(
        FIX,
        InboundFrame::Fix(InboundMessage::application(
            2,
            "D",
            Bytes::from_static(b"Symbol=ACME|Side=Buy|Qty=100"),
        )),
        start,
    );
    answer_orders(engine, start)?;
    engine.poll(start);
    drain(client);

    info!("client connection drops");
    if let Some(summary) = engine.framer_mut().on_disconnect(FIX, start) {
        info!(
            session = %summary.session_id,
            last_sent = summary.last_sent,
            last_received = summary.last_received,
            "session filed"
        );
    }
    engine.poll(start + Duration::from_millis(250));
    engine.poll(start + Duration::from_millis(600));
    Ok(())
}

fn run_fixp(engine: &mut Gateway, client: &Receiver<(ConnectionId, Bytes)>, start: Instant) -> anyhow::Result<()> {
    let framer = engine.framer_mut();
    framer.on_connect(FIXP, Protocol::FixP, start)?;
    framer.on_frame(
        FIXP,
        InboundFrame::FixP(FixPMessage::Negotiate {
            session_id: FIXP_SESSION,
            session_ver_id: 1,
            entering_firm: Some("FIRM".into()),
            timestamp_nanos: Timestamp::now().as_nanos(),
            credentials: None,
        }),
        start,
    );
    framer.on_frame(
        FIXP,
        InboundFrame::FixP(FixPMessage::Establish {
            session_id: FIXP_SESSION,
            session_ver_id: 1,
            timestamp_nanos: Timestamp::now().as_nanos(),
            keep_alive_interval_ms: 1_000,
            next_seq_no: 1,
            cod: CodRequest::default(),
            credentials: None,
        }),
        start,
    );
    framer.on_frame(
        FIXP,
        InboundFrame::FixPApplication(FixPApplication {
            seq_num: 1,
            poss_retrans: false,
            msg_type: MsgType::Application("NewOrderSingle".into()),
            body: Bytes::from_static(b"Symbol=ACME|Side=Sell|Qty=50"),
        }),
        start,
    );
    answer_orders(engine, start)?;
    drain(client);

    let session_id = SessionId::fixp(FIXP_SESSION);
    engine.framer_mut().logout(&session_id, "end of day", start)?;
    engine.framer_mut().on_frame(
        FIXP,
        InboundFrame::FixP(FixPMessage::Terminate {
            session_id: FIXP_SESSION,
            session_ver_id: 1,
            code: TerminationCode::Finished,
            reason: "end of day".into(),
        }),
        start,
    );
    engine.poll(start);
    drain(client);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    init_logging();
    let dir = tempfile::TempDir::new()?;
    let config = EngineBuilder::new()
        .with_log_file_dir(dir.path())
        .with_accept_fixp(true)
        .build()?;
    info!(dir = %dir.path().display(), "starting gateway");

    let (outbound, client) = bounded(256);
    let mut engine = Engine::launch(
        config,
        Capabilities::new(DebugCodec, ChannelTransport { outbound }, Desk::default()),
    )?;

    let start = Instant::now();
    run_fix(&mut engine, &client, start)?;
    run_fixp(&mut engine, &client, start + Duration::from_secs(1))?;
    info!(registry = engine.framer().registry().len(), "sessions awaiting reconnect");

    engine.close()?;
    info!("gateway closed");
    Ok(())
}
