//! Connection lifecycle state.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle state of a gateway connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    /// Not connected.
    Disconnected = 0,
    /// Dialing the transport.
    Connecting = 1,
    /// Transport open, waiting for Hello.
    AwaitingHello = 2,
    /// Identify (or Resume) sent, waiting for Ready.
    Identifying = 3,
    /// Ready received; events are flowing.
    Connected = 4,
    /// Closing the transport at the caller's request.
    Closing = 5,
    /// Waiting out a backoff delay before dialing again.
    Reconnecting = 6,
    /// Reconnect attempts exhausted; no automatic recovery.
    Failed = 7,
}

impl ConnectionState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Disconnected,
            1 => Self::Connecting,
            2 => Self::AwaitingHello,
            3 => Self::Identifying,
            4 => Self::Connected,
            5 => Self::Closing,
            6 => Self::Reconnecting,
            _ => Self::Failed,
        }
    }

    /// Whether a transport is (or is being) established.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::AwaitingHello | Self::Identifying | Self::Connected
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::AwaitingHello => "awaiting_hello",
            Self::Identifying => "identifying",
            Self::Connected => "connected",
            Self::Closing => "closing",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Atomic wrapper for connection state.
#[derive(Debug)]
pub struct AtomicConnectionState(AtomicU8);

impl AtomicConnectionState {
    /// Create a new atomic state.
    #[must_use]
    pub const fn new(state: ConnectionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    /// Load the current state.
    #[must_use]
    pub fn load(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Store a new state.
    pub fn store(&self, state: ConnectionState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }
}

impl Default for AtomicConnectionState {
    fn default() -> Self {
        Self::new(ConnectionState::Disconnected)
    }
}
