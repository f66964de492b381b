//! Gateway event types.

use std::time::Duration;

use serde_json::Value;

use crate::error::GatewayError;

/// Session data delivered when the handshake completes.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadyEvent {
    /// Session identifier.
    pub session_id: String,
    /// URL the server offered for resuming this session.
    pub resume_url: Option<String>,
    /// Raw `READY` data.
    pub data: Value,
}

/// A message dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEvent {
    /// Event name, e.g. `MESSAGE_CREATE`.
    pub event: String,
    /// Sequence number of the dispatch.
    pub sequence: Option<u64>,
    /// Raw event data.
    pub data: Value,
}

impl MessageEvent {
    /// Message id, if the data carries one.
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.data.get("id").and_then(Value::as_str)
    }

    /// Message text, if the data carries one.
    #[must_use]
    pub fn content(&self) -> Option<&str> {
        self.data.get("content").and_then(Value::as_str)
    }
}

/// Events emitted by a gateway connection.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    /// Handshake completed; fires once per successful Identify.
    Ready(ReadyEvent),
    /// A previous session was resumed.
    Resumed,
    /// A message was received.
    Message(MessageEvent),
    /// Something went wrong. Recovery, if any, is reported separately.
    Error(GatewayError),
    /// The transport went away.
    Disconnected {
        /// Reason for disconnection.
        reason: String,
        /// Whether a reconnect will be attempted.
        will_reconnect: bool,
    },
    /// A reconnect is scheduled.
    Reconnecting {
        /// Attempt number.
        attempt: u32,
        /// Delay before the attempt.
        delay: Duration,
    },
}
