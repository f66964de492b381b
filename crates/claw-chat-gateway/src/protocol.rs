//! Gateway wire protocol: the `{op, d, s, t}` envelope and its builders.
//!
//! Everything here is pure (de)serialization. The connection driver decides
//! what to do with a payload; this module only knows how it looks on the wire.

use std::ops::BitOr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// Gateway protocol version, sent as the `v` query parameter.
pub const GATEWAY_VERSION: u32 = 1;

/// Gateway opcodes.
pub mod opcode {
    /// Server → client: a named event with a sequence number.
    pub const DISPATCH: u64 = 0;
    /// Both directions: keepalive carrying the last sequence number.
    pub const HEARTBEAT: u64 = 1;
    /// Client → server: credentials and intents.
    pub const IDENTIFY: u64 = 2;
    /// Client → server: continue a previous session.
    pub const RESUME: u64 = 6;
    /// Server → client: reconnect now.
    pub const RECONNECT: u64 = 7;
    /// Server → client: the session is no longer valid.
    pub const INVALID_SESSION: u64 = 9;
    /// Server → client: first frame, carries the heartbeat interval.
    pub const HELLO: u64 = 10;
    /// Server → client: heartbeat acknowledged.
    pub const HEARTBEAT_ACK: u64 = 11;
}

/// Dispatch event names the client reacts to.
pub mod event {
    /// Handshake completed, carries the session id.
    pub const READY: &str = "READY";
    /// Resume completed.
    pub const RESUMED: &str = "RESUMED";
    /// A new message was posted.
    pub const MESSAGE_CREATE: &str = "MESSAGE_CREATE";
}

/// Errors produced while decoding or encoding frames.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The frame is not valid JSON or does not match the envelope.
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The frame is valid JSON but not an object.
    #[error("frame is not a JSON object")]
    NotAnObject,

    /// The frame has no integer `op` field.
    #[error("frame has no opcode")]
    MissingOpcode,

    /// The payload data does not fit what the opcode requires.
    #[error("invalid data for op {op}: {reason}")]
    InvalidData {
        /// Opcode of the offending payload.
        op: u64,
        /// What was wrong.
        reason: String,
    },
}

/// Gateway intents bitmask, selecting which event categories the server sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Intents(u32);

impl Intents {
    /// Guild-style channel messages.
    pub const GUILD_MESSAGES: Self = Self(1 << 0);
    /// Direct messages.
    pub const DIRECT_MESSAGES: Self = Self(1 << 9);
    /// Channel messages plus direct messages (`513`).
    pub const DEFAULT: Self = Self(Self::GUILD_MESSAGES.0 | Self::DIRECT_MESSAGES.0);

    /// Build from raw bits.
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw bits as sent on the wire.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether every bit of `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl Default for Intents {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl BitOr for Intents {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Client properties reported in Identify.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifyProperties {
    /// Operating system.
    pub os: String,
    /// Library name.
    pub browser: String,
    /// Device name.
    pub device: String,
}

impl Default for IdentifyProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: env!("CARGO_PKG_NAME").to_string(),
            device: env!("CARGO_PKG_NAME").to_string(),
        }
    }
}

/// The gateway envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    /// Opcode.
    pub op: u64,
    /// Opcode-specific data.
    #[serde(default)]
    pub d: Option<Value>,
    /// Sequence number, dispatch only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    /// Event name, dispatch only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

impl Payload {
    /// Create a non-dispatch payload.
    #[must_use]
    pub const fn new(op: u64, d: Option<Value>) -> Self {
        Self {
            op,
            d,
            s: None,
            t: None,
        }
    }

    /// Create a dispatch payload.
    #[must_use]
    pub fn dispatch(event: impl Into<String>, seq: u64, d: Value) -> Self {
        Self {
            op: opcode::DISPATCH,
            d: Some(d),
            s: Some(seq),
            t: Some(event.into()),
        }
    }

    /// Event name of a dispatch payload.
    #[must_use]
    pub fn event_name(&self) -> Option<&str> {
        self.t.as_deref()
    }

    /// Deserialize `d` into a typed structure.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidData`] if `d` is absent or has the wrong shape.
    pub fn data<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        let d = self.d.clone().ok_or_else(|| CodecError::InvalidData {
            op: self.op,
            reason: "missing data".to_string(),
        })?;
        serde_json::from_value(d).map_err(|e| CodecError::InvalidData {
            op: self.op,
            reason: e.to_string(),
        })
    }
}

/// Data of a Hello payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct HelloData {
    /// Heartbeat interval in milliseconds.
    pub heartbeat_interval: u64,
}

/// Data of a `READY` dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReadyData {
    /// Session identifier for this connection.
    pub session_id: String,
    /// URL to use when resuming this session.
    #[serde(default)]
    pub resume_gateway_url: Option<String>,
}

/// Decode a text frame into a payload.
///
/// # Errors
///
/// Rejects malformed JSON, non-object frames, and frames without an integer `op`.
pub fn decode(text: &str) -> Result<Payload, CodecError> {
    let value: Value = serde_json::from_str(text)?;
    let Value::Object(map) = value else {
        return Err(CodecError::NotAnObject);
    };
    if !map.get("op").is_some_and(Value::is_u64) {
        return Err(CodecError::MissingOpcode);
    }
    Ok(serde_json::from_value(Value::Object(map))?)
}

/// Encode a payload into a text frame.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode(payload: &Payload) -> Result<String, CodecError> {
    Ok(serde_json::to_string(payload)?)
}

/// Build an Identify payload.
#[must_use]
pub fn identify(token: &str, intents: Intents, properties: &IdentifyProperties) -> Payload {
    Payload::new(
        opcode::IDENTIFY,
        Some(json!({
            "token": token,
            "intents": intents.bits(),
            "properties": {
                "os": properties.os,
                "browser": properties.browser,
                "device": properties.device,
            },
        })),
    )
}

/// Build a Heartbeat payload carrying the last observed sequence, or `null`.
#[must_use]
pub fn heartbeat(sequence: Option<u64>) -> Payload {
    Payload::new(opcode::HEARTBEAT, Some(sequence.map_or(Value::Null, Value::from)))
}

/// Build a Resume payload.
#[must_use]
pub fn resume(token: &str, session_id: &str, sequence: Option<u64>) -> Payload {
    Payload::new(
        opcode::RESUME,
        Some(json!({
            "token": token,
            "session_id": session_id,
            "seq": sequence,
        })),
    )
}
