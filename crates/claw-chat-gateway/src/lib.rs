//! # claw-chat-gateway
//!
//! Client for a real-time chat gateway. Keeps one long-lived WebSocket
//! session per bot identity: authenticates after the server's Hello, keeps
//! the session alive with heartbeats, tracks dispatch sequence numbers, and
//! reconnects with exponential backoff when the connection drops.
//!
//! ```no_run
//! use claw_chat_gateway::{GatewayConfig, GatewayConnection, GatewayEvent};
//!
//! # async fn run() -> claw_chat_gateway::Result<()> {
//! let config = GatewayConfig::new("bot-token", "gateway.example.com");
//! let (gateway, mut events) = GatewayConnection::websocket(config);
//! gateway.connect().await?;
//!
//! while let Some(event) = events.recv().await {
//!     if let GatewayEvent::Message(message) = event {
//!         println!("{:?}", message.content());
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod heartbeat;
pub mod protocol;
pub mod reconnect;
pub mod session;
pub mod state;
pub mod transport;

pub use config::GatewayConfig;
pub use connection::GatewayConnection;
pub use error::{GatewayError, Result};
pub use events::{GatewayEvent, MessageEvent, ReadyEvent};
pub use protocol::{Intents, Payload};
pub use reconnect::ReconnectPolicy;
pub use state::ConnectionState;
pub use transport::{ConnectRequest, Connector, Transport, WsConnector};
