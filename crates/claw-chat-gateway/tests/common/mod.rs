//! Shared test harness: an in-memory connector and a scripted gateway end.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use claw_chat_gateway::error::Result;
use claw_chat_gateway::{
    ConnectRequest, Connector, GatewayConfig, GatewayError, GatewayEvent, ReconnectPolicy,
    Transport,
};
use futures::channel::mpsc as frames;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

pub const TOKEN: &str = "test-token";
pub const HOST: &str = "gateway.test";

// ============================================================================
// Fake Connector
// ============================================================================

/// Connector that hands the server side of every dial to the test.
#[derive(Clone)]
pub struct FakeConnector {
    dials: Arc<AtomicU32>,
    refuse: Arc<AtomicBool>,
    accepted: mpsc::UnboundedSender<ServerEnd>,
}

impl FakeConnector {
    pub fn new() -> (Self, Accepts) {
        let (accepted, rx) = mpsc::unbounded_channel();
        let connector = Self {
            dials: Arc::new(AtomicU32::new(0)),
            refuse: Arc::new(AtomicBool::new(false)),
            accepted,
        };
        (connector, Accepts { rx })
    }

    /// Number of dials attempted so far.
    pub fn dials(&self) -> u32 {
        self.dials.load(Ordering::SeqCst)
    }

    /// Make every dial fail with a transport error.
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }
}

impl Connector for FakeConnector {
    async fn connect(&self, request: &ConnectRequest) -> Result<Transport> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(GatewayError::Transport("connection refused".to_string()));
        }

        let (to_client, client_inbound) = frames::unbounded();
        let (client_outbound, from_client) = frames::unbounded();
        let server = ServerEnd {
            request: request.clone(),
            to_client,
            from_client,
        };
        self.accepted
            .send(server)
            .map_err(|_| GatewayError::Transport("test harness gone".to_string()))?;

        Ok(Transport::new(
            client_outbound.sink_map_err(|e| GatewayError::Transport(e.to_string())),
            client_inbound,
        ))
    }
}

/// Receives the server side of each successful dial.
pub struct Accepts {
    rx: mpsc::UnboundedReceiver<ServerEnd>,
}

impl Accepts {
    pub async fn next(&mut self) -> ServerEnd {
        self.rx.recv().await.expect("connector dropped")
    }

    pub fn try_next(&mut self) -> Option<ServerEnd> {
        self.rx.try_recv().ok()
    }
}

// ============================================================================
// Server End
// ============================================================================

/// The gateway's side of one transport. Dropping it closes the connection.
pub struct ServerEnd {
    pub request: ConnectRequest,
    to_client: frames::UnboundedSender<Result<Message>>,
    from_client: frames::UnboundedReceiver<Message>,
}

impl ServerEnd {
    pub fn send(&self, payload: &Value) {
        self.send_raw(&payload.to_string());
    }

    pub fn send_raw(&self, text: &str) {
        self.to_client
            .unbounded_send(Ok(Message::text(text.to_string())))
            .expect("client gone");
    }

    pub fn hello(&self, heartbeat_interval_ms: u64) {
        self.send(&json!({"op": 10, "d": {"heartbeat_interval": heartbeat_interval_ms}}));
    }

    pub fn ack(&self) {
        self.send(&json!({"op": 11, "d": null}));
    }

    pub fn dispatch(&self, event: &str, seq: u64, d: Value) {
        self.send(&json!({"op": 0, "s": seq, "t": event, "d": d}));
    }

    pub fn ready(&self, session_id: &str, seq: u64) {
        self.dispatch("READY", seq, json!({"session_id": session_id}));
    }

    pub fn message(&self, id: &str, seq: u64) {
        self.dispatch("MESSAGE_CREATE", seq, json!({"id": id, "content": "hello"}));
    }

    /// Fail the transport with a read error.
    pub fn fail(&self, reason: &str) {
        self.to_client
            .unbounded_send(Err(GatewayError::Transport(reason.to_string())))
            .expect("client gone");
    }

    /// Next frame written by the client, or `None` once it closed the transport.
    pub async fn next_frame(&mut self) -> Option<Message> {
        self.from_client.next().await
    }

    /// Next text frame written by the client, parsed as JSON.
    pub async fn next_payload(&mut self) -> Value {
        loop {
            match self.next_frame().await {
                Some(Message::Text(text)) => {
                    return serde_json::from_str(text.as_str()).expect("client sent invalid JSON");
                }
                Some(_) => {}
                None => panic!("client closed the transport"),
            }
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

pub fn test_config() -> GatewayConfig {
    GatewayConfig::new(TOKEN, HOST).with_reconnect_policy(ReconnectPolicy {
        base_delay_ms: 100,
        max_delay_ms: 10_000,
        max_attempts: 5,
        invalid_session_delay_ms: 2_500,
    })
}

/// Answer a dial with Hello, check the Identify, and send Ready.
pub async fn handshake(accepts: &mut Accepts, heartbeat_interval_ms: u64, session_id: &str) -> ServerEnd {
    let mut server = accepts.next().await;
    server.hello(heartbeat_interval_ms);

    let identify = server.next_payload().await;
    assert_eq!(identify["op"], 2);
    assert_eq!(identify["d"]["token"], TOKEN);

    server.ready(session_id, 1);
    server
}

/// Wait for the next event matching `pred`, skipping others.
pub async fn next_matching(
    events: &mut mpsc::Receiver<GatewayEvent>,
    pred: impl Fn(&GatewayEvent) -> bool,
) -> GatewayEvent {
    loop {
        let event = events.recv().await.expect("event channel closed");
        if pred(&event) {
            return event;
        }
    }
}

/// Drain everything currently queued.
pub fn drain(events: &mut mpsc::Receiver<GatewayEvent>) -> Vec<GatewayEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}
