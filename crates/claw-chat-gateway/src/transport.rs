//! Transport seam between the connection driver and the network.
//!
//! The driver only sees a sink and a stream of WebSocket messages, so tests
//! can substitute in-memory channels for a real socket.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use crate::error::{GatewayError, Result};

/// Outbound half of a transport.
pub type FrameSink = Pin<Box<dyn Sink<Message, Error = GatewayError> + Send>>;

/// Inbound half of a transport.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Message>> + Send>>;

/// Where to dial and how to authenticate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    /// Gateway URL including the version marker.
    pub url: String,
    /// Value of the `Authorization` header.
    pub authorization: String,
}

impl ConnectRequest {
    /// Build a request authenticating with a bot token.
    #[must_use]
    pub fn new(url: impl Into<String>, token: &str) -> Self {
        Self {
            url: url.into(),
            authorization: format!("Bot {token}"),
        }
    }
}

/// An open duplex connection.
pub struct Transport {
    /// Outbound frames.
    pub sink: FrameSink,
    /// Inbound frames.
    pub stream: FrameStream,
}

impl Transport {
    /// Wrap a sink/stream pair.
    pub fn new<S, St>(sink: S, stream: St) -> Self
    where
        S: Sink<Message, Error = GatewayError> + Send + 'static,
        St: Stream<Item = Result<Message>> + Send + 'static,
    {
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}

/// Opens transports.
pub trait Connector: Send + Sync + 'static {
    /// Dial the gateway.
    fn connect(&self, request: &ConnectRequest) -> impl Future<Output = Result<Transport>> + Send;
}

/// WebSocket connector backed by tokio-tungstenite.
#[derive(Debug, Clone)]
pub struct WsConnector {
    dial_timeout: Duration,
}

impl WsConnector {
    /// Create a connector with the given dial timeout.
    #[must_use]
    pub const fn new(dial_timeout: Duration) -> Self {
        Self { dial_timeout }
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl Connector for WsConnector {
    async fn connect(&self, request: &ConnectRequest) -> Result<Transport> {
        let mut http = request.url.as_str().into_client_request()?;
        let auth = HeaderValue::from_str(&request.authorization)
            .map_err(|e| GatewayError::Config(format!("invalid authorization header: {e}")))?;
        http.headers_mut().insert(AUTHORIZATION, auth);

        debug!(url = %request.url, "dialing gateway");
        let (ws_stream, _response) = timeout(self.dial_timeout, connect_async(http))
            .await
            .map_err(|_| GatewayError::Transport("connection timeout".to_string()))??;

        let (write, read) = ws_stream.split();
        Ok(Transport::new(
            write.sink_map_err(GatewayError::from),
            read.map(|frame| frame.map_err(GatewayError::from)),
        ))
    }
}
