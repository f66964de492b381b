//! Per-session protocol state.

use crate::protocol::ReadyData;

/// State of one gateway session: what the server has told us so far.
///
/// Owned by the connection driver; nothing else mutates it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    sequence: Option<u64>,
    session_id: Option<String>,
    resume_url: Option<String>,
}

impl SessionState {
    /// Create an empty session.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            sequence: None,
            session_id: None,
            resume_url: None,
        }
    }

    /// Create a fresh session from a `READY` dispatch.
    #[must_use]
    pub fn from_ready(ready: ReadyData, sequence: Option<u64>) -> Self {
        Self {
            sequence,
            session_id: Some(ready.session_id),
            resume_url: ready.resume_gateway_url,
        }
    }

    /// Last observed sequence number.
    #[must_use]
    pub const fn sequence(&self) -> Option<u64> {
        self.sequence
    }

    /// Session identifier, once Ready has arrived.
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// URL to dial when resuming.
    #[must_use]
    pub fn resume_url(&self) -> Option<&str> {
        self.resume_url.as_deref()
    }

    /// Record a dispatch sequence number.
    ///
    /// Keeps the highest value seen, so a stale frame can never move the
    /// heartbeat sequence backwards. Returns `true` if the value advanced.
    pub fn observe_sequence(&mut self, seq: u64) -> bool {
        match self.sequence {
            Some(current) if current >= seq => false,
            _ => {
                self.sequence = Some(seq);
                true
            }
        }
    }

    /// Whether enough is known to attempt a resume.
    #[must_use]
    pub const fn can_resume(&self) -> bool {
        self.session_id.is_some()
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        *self = Self::new();
    }
}
