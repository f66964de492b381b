//! Gateway connection: the public handle and the driver task behind it.
//!
//! Each `connect()` that finds no live lifecycle spawns one driver task. The
//! driver owns the transport, the heartbeat scheduler, the session state and
//! the backoff counter, and consumes every trigger (inbound frames, heartbeat
//! ticks, reconnect timers, caller commands, cancellation) from a single
//! `select!` loop, so none of that state is ever touched concurrently.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::{versioned_url, GatewayConfig};
use crate::error::{GatewayError, Result};
use crate::events::{GatewayEvent, MessageEvent, ReadyEvent};
use crate::heartbeat::{Beat, HeartbeatScheduler};
use crate::protocol::{self, event, opcode, HelloData, Payload, ReadyData};
use crate::reconnect::{Backoff, ReconnectTrigger, RetryDecision};
use crate::session::SessionState;
use crate::state::{AtomicConnectionState, ConnectionState};
use crate::transport::{ConnectRequest, Connector, FrameSink, FrameStream, WsConnector};

/// How long to wait for the close frame to flush.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Close code used when dropping a session we intend to resume.
const RESUMABLE_CLOSE_CODE: u16 = 4000;

/// A real-time gateway connection for one bot identity.
///
/// Instances are fully independent; run one per account.
pub struct GatewayConnection<C: Connector = WsConnector> {
    config: Arc<GatewayConfig>,
    connector: Arc<C>,
    events: mpsc::Sender<GatewayEvent>,
    driver: Mutex<Option<DriverHandle>>,
}

impl GatewayConnection<WsConnector> {
    /// Create a connection that dials over WebSocket.
    #[must_use]
    pub fn websocket(config: GatewayConfig) -> (Self, mpsc::Receiver<GatewayEvent>) {
        Self::new(config, WsConnector::default())
    }
}

impl<C: Connector> GatewayConnection<C> {
    /// Create a connection. Does not connect yet.
    ///
    /// Returns the receiving end of the event channel.
    #[must_use]
    pub fn new(config: GatewayConfig, connector: C) -> (Self, mpsc::Receiver<GatewayEvent>) {
        let (events, rx) = mpsc::channel(config.event_buffer.max(1));
        let connection = Self {
            config: Arc::new(config),
            connector: Arc::new(connector),
            events,
            driver: Mutex::new(None),
        };
        (connection, rx)
    }

    /// Connect and wait until the gateway reports Ready.
    ///
    /// Returns immediately when already connected. When a connection attempt
    /// or reconnect is already under way, waits for it instead of dialing
    /// again.
    ///
    /// # Errors
    ///
    /// Fails if the gateway is disabled, the transport fails before Ready,
    /// reconnect attempts run out, `disconnect()` is called meanwhile, or
    /// Ready does not arrive within the configured timeout.
    pub async fn connect(&self) -> Result<()> {
        if !self.config.enabled {
            return Err(GatewayError::Disabled);
        }

        let ready = {
            let mut slot = self.driver.lock();
            if slot.as_ref().is_some_and(DriverHandle::is_finished) {
                *slot = None;
            }

            if let Some(driver) = slot.as_ref() {
                if driver.shared.state.load() == ConnectionState::Connected {
                    debug!("already connected to gateway");
                    return Ok(());
                }
            }

            match slot.as_ref().and_then(DriverHandle::wait_ready) {
                Some(rx) => rx,
                None => {
                    let (handle, rx) = self.spawn_driver();
                    *slot = Some(handle);
                    rx
                }
            }
        };

        match timeout(self.config.connect_timeout(), ready).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(GatewayError::Disconnected),
            Err(_) => {
                warn!(
                    timeout_ms = self.config.connect_timeout_ms,
                    "gateway did not become ready in time"
                );
                Err(GatewayError::ConnectTimeout(self.config.connect_timeout_ms))
            }
        }
    }

    /// Close the connection and cancel any pending reconnect.
    ///
    /// Safe to call at any time, any number of times. Does not wait for the
    /// transport to finish closing.
    pub fn disconnect(&self) {
        let Some(driver) = self.driver.lock().take() else {
            debug!("disconnect requested while not connected");
            return;
        };
        info!("disconnecting from gateway");
        driver.shutdown.cancel();
    }

    /// Whether the gateway session is established.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.driver
            .lock()
            .as_ref()
            .map_or(ConnectionState::Disconnected, |d| d.shared.state.load())
    }

    /// Session id of the current session.
    #[must_use]
    pub fn session_id(&self) -> Option<String> {
        self.with_session(|s| s.session_id().map(str::to_owned))
    }

    /// Last sequence number observed in the current session.
    #[must_use]
    pub fn sequence(&self) -> Option<u64> {
        self.with_session(SessionState::sequence)
    }

    fn with_session<T>(&self, f: impl FnOnce(&SessionState) -> Option<T>) -> Option<T> {
        self.driver
            .lock()
            .as_ref()
            .and_then(|d| f(&d.shared.session.read()))
    }

    fn spawn_driver(&self) -> (DriverHandle, oneshot::Receiver<Result<()>>) {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let shared = Arc::new(Shared::default());

        let driver = Driver {
            config: Arc::clone(&self.config),
            connector: Arc::clone(&self.connector),
            events: self.events.clone(),
            commands: commands_rx,
            shutdown: shutdown.clone(),
            shared: Arc::clone(&shared),
            session: SessionState::new(),
            backoff: Backoff::new(self.config.reconnect.clone()),
            waiters: vec![ready_tx],
            dropped_events: 0,
        };
        let task = tokio::spawn(driver.run());

        let handle = DriverHandle {
            shared,
            commands: commands_tx,
            shutdown,
            task,
        };
        (handle, ready_rx)
    }
}

/// Snapshot of driver state readable by callers. Written only by the driver.
#[derive(Debug, Default)]
struct Shared {
    state: AtomicConnectionState,
    session: RwLock<SessionState>,
}

enum Command {
    WaitReady(oneshot::Sender<Result<()>>),
}

struct DriverHandle {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl DriverHandle {
    fn is_finished(&self) -> bool {
        self.task.is_finished() || self.shared.state.load() == ConnectionState::Failed
    }

    fn wait_ready(&self) -> Option<oneshot::Receiver<Result<()>>> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(Command::WaitReady(tx)).ok()?;
        Some(rx)
    }
}

impl Drop for DriverHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Why a transport session ended.
enum SessionEnd {
    /// The caller disconnected.
    Shutdown,
    /// The connection should be re-established.
    Reconnect {
        reason: String,
        trigger: ReconnectTrigger,
        error: Option<GatewayError>,
        opened: bool,
    },
}

impl SessionEnd {
    fn reconnect(reason: impl Into<String>, trigger: ReconnectTrigger) -> Self {
        Self::Reconnect {
            reason: reason.into(),
            trigger,
            error: None,
            opened: true,
        }
    }

    fn transport_failure(reason: impl Into<String>, error: GatewayError) -> Self {
        Self::Reconnect {
            reason: reason.into(),
            trigger: ReconnectTrigger::Backoff,
            error: Some(error),
            opened: true,
        }
    }
}

/// Outbound half of an open transport.
struct Outbound {
    sink: FrameSink,
    open: bool,
}

impl Outbound {
    const fn new(sink: FrameSink) -> Self {
        Self { sink, open: true }
    }

    const fn is_open(&self) -> bool {
        self.open
    }

    async fn send(&mut self, payload: &Payload) -> Result<()> {
        if !self.open {
            warn!(op = payload.op, "transport not open, dropping outbound payload");
            return Ok(());
        }
        let text = protocol::encode(payload)?;
        if let Err(e) = self.sink.send(Message::text(text)).await {
            self.open = false;
            return Err(e);
        }
        Ok(())
    }

    async fn close(&mut self, code: CloseCode, reason: &str) {
        if !self.open {
            return;
        }
        self.open = false;

        let frame = CloseFrame {
            code,
            reason: reason.to_string().into(),
        };
        let sink = &mut self.sink;
        let flushed = timeout(CLOSE_TIMEOUT, async {
            sink.send(Message::Close(Some(frame))).await?;
            sink.close().await
        })
        .await;
        match flushed {
            Ok(Ok(())) => trace!("close frame sent"),
            Ok(Err(e)) => debug!(error = %e, "failed to send close frame"),
            Err(_) => debug!("timed out sending close frame"),
        }
    }
}

/// Per-transport state.
struct Link {
    outbound: Outbound,
    heartbeat: Option<HeartbeatScheduler>,
    identified: bool,
    resuming: bool,
}

struct Driver<C: Connector> {
    config: Arc<GatewayConfig>,
    connector: Arc<C>,
    events: mpsc::Sender<GatewayEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    shutdown: CancellationToken,
    shared: Arc<Shared>,
    session: SessionState,
    backoff: Backoff,
    waiters: Vec<oneshot::Sender<Result<()>>>,
    dropped_events: u64,
}

impl<C: Connector> Driver<C> {
    async fn run(mut self) {
        loop {
            let (reason, trigger, error, opened) = match self.connect_once().await {
                SessionEnd::Shutdown => {
                    self.finish_shutdown();
                    return;
                }
                SessionEnd::Reconnect {
                    reason,
                    trigger,
                    error,
                    opened,
                } => (reason, trigger, error, opened),
            };

            if let Some(err) = error {
                warn!(error = %err, "gateway transport error");
                self.fail_waiters(&err);
                self.emit(GatewayEvent::Error(err));
            }
            if !self.config.resume {
                self.session.clear();
                self.publish_session();
            }

            match self.backoff.next(trigger) {
                RetryDecision::Exhausted { attempts } => {
                    error!(attempts, "reconnect attempts exhausted, giving up");
                    self.shared.state.store(ConnectionState::Failed);
                    self.session.clear();
                    self.publish_session();

                    let err = GatewayError::ReconnectExhausted { attempts };
                    self.fail_waiters(&err);
                    self.emit(GatewayEvent::Disconnected {
                        reason,
                        will_reconnect: false,
                    });
                    self.emit(GatewayEvent::Error(err));
                    return;
                }
                RetryDecision::Retry { attempt, delay } => {
                    self.shared.state.store(ConnectionState::Reconnecting);
                    info!(
                        attempt,
                        delay = ?delay,
                        reason = %reason,
                        "reconnecting to gateway"
                    );
                    if opened {
                        self.emit(GatewayEvent::Disconnected {
                            reason,
                            will_reconnect: true,
                        });
                    }
                    self.emit(GatewayEvent::Reconnecting { attempt, delay });

                    if !self.sleep_or_shutdown(delay).await {
                        self.finish_shutdown();
                        return;
                    }
                }
            }
        }
    }

    /// Dial once and run the session until it ends.
    async fn connect_once(&mut self) -> SessionEnd {
        let resuming = self.config.resume && self.session.can_resume();
        let url = if resuming {
            self.resume_url()
        } else {
            self.config.gateway_url()
        };
        let request = ConnectRequest::new(url, &self.config.token);

        self.shared.state.store(ConnectionState::Connecting);
        info!(url = %request.url, resuming, "connecting to gateway");

        let connector = Arc::clone(&self.connector);
        let dial = connector.connect(&request);
        tokio::pin!(dial);

        let transport = loop {
            tokio::select! {
                biased;

                () = self.shutdown.cancelled() => return SessionEnd::Shutdown,

                Some(command) = self.commands.recv() => self.handle_command(command),

                result = &mut dial => match result {
                    Ok(transport) => break transport,
                    Err(e) => {
                        return SessionEnd::Reconnect {
                            reason: format!("connect failed: {e}"),
                            trigger: ReconnectTrigger::Backoff,
                            error: Some(e),
                            opened: false,
                        };
                    }
                },
            }
        };

        self.shared.state.store(ConnectionState::AwaitingHello);
        debug!("transport open, awaiting hello");

        let mut link = Link {
            outbound: Outbound::new(transport.sink),
            heartbeat: None,
            identified: false,
            resuming,
        };
        let end = self.drive(&mut link, transport.stream).await;

        if let Some(heartbeat) = link.heartbeat.as_mut() {
            heartbeat.stop();
        }
        let code = match &end {
            SessionEnd::Reconnect { .. } if self.config.resume => {
                CloseCode::from(RESUMABLE_CLOSE_CODE)
            }
            SessionEnd::Shutdown => {
                self.shared.state.store(ConnectionState::Closing);
                CloseCode::Normal
            }
            SessionEnd::Reconnect { .. } => CloseCode::Normal,
        };
        link.outbound.close(code, "client closing").await;

        end
    }

    fn resume_url(&self) -> String {
        match self.session.resume_url().map(versioned_url) {
            Some(Ok(url)) => url,
            Some(Err(e)) => {
                warn!(error = %e, "invalid resume URL, using default gateway");
                self.config.gateway_url()
            }
            None => self.config.gateway_url(),
        }
    }

    /// Event loop for one open transport.
    async fn drive(&mut self, link: &mut Link, mut stream: FrameStream) -> SessionEnd {
        loop {
            tokio::select! {
                biased;

                () = self.shutdown.cancelled() => return SessionEnd::Shutdown,

                Some(command) = self.commands.recv() => self.handle_command(command),

                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => match protocol::decode(text.as_str()) {
                        Ok(payload) => {
                            if let Some(end) = self.handle_payload(payload, link).await {
                                return end;
                            }
                        }
                        Err(e) => warn!(error = %e, "dropping undecodable gateway frame"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = frame.as_ref().map_or((1005, String::new()), |f| {
                            (u16::from(f.code), f.reason.as_str().to_owned())
                        });
                        info!(code, reason = %reason, "gateway closed connection");
                        link.outbound.open = false;
                        let error = (self.shared.state.load() != ConnectionState::Connected)
                            .then(|| GatewayError::Transport(format!("closed by server before ready (code {code})")));
                        return SessionEnd::Reconnect {
                            reason: format!("closed by server (code {code})"),
                            trigger: ReconnectTrigger::Backoff,
                            error,
                            opened: true,
                        };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return SessionEnd::transport_failure(format!("transport error: {e}"), e),
                    None => {
                        return SessionEnd::transport_failure(
                            "connection lost",
                            GatewayError::Transport("connection closed unexpectedly".to_string()),
                        );
                    }
                },

                Some(()) = next_tick(&mut link.heartbeat) => {
                    if let Some(end) = self.on_heartbeat_tick(link).await {
                        return end;
                    }
                }
            }
        }
    }

    async fn handle_payload(&mut self, payload: Payload, link: &mut Link) -> Option<SessionEnd> {
        match payload.op {
            opcode::HELLO => self.on_hello(&payload, link).await,
            opcode::HEARTBEAT_ACK => {
                if let Some(heartbeat) = link.heartbeat.as_mut() {
                    heartbeat.ack();
                    trace!(latency = ?heartbeat.latency(), "heartbeat acknowledged");
                }
                None
            }
            opcode::HEARTBEAT => {
                debug!("server requested heartbeat");
                if let Some(heartbeat) = link.heartbeat.as_mut() {
                    heartbeat.mark_sent();
                }
                self.send_heartbeat(link).await
            }
            opcode::DISPATCH => {
                self.on_dispatch(payload, link);
                self.publish_session();
                None
            }
            opcode::RECONNECT => {
                info!("server requested reconnect (op 7)");
                Some(SessionEnd::reconnect(
                    "server requested reconnect",
                    ReconnectTrigger::Backoff,
                ))
            }
            opcode::INVALID_SESSION => {
                let resumable = payload.d.as_ref().and_then(Value::as_bool).unwrap_or(false);
                info!(resumable, "session invalidated by server (op 9)");
                if !(resumable && self.config.resume) {
                    self.session.clear();
                    self.publish_session();
                }
                Some(SessionEnd::reconnect(
                    "invalid session",
                    ReconnectTrigger::InvalidSession,
                ))
            }
            op => {
                debug!(op, "ignoring unknown gateway opcode");
                None
            }
        }
    }

    async fn on_hello(&mut self, payload: &Payload, link: &mut Link) -> Option<SessionEnd> {
        let hello = match payload.data::<HelloData>() {
            Ok(hello) if hello.heartbeat_interval > 0 => hello,
            Ok(_) => {
                warn!("dropping hello with zero heartbeat interval");
                return None;
            }
            Err(e) => {
                warn!(error = %e, "dropping malformed hello");
                return None;
            }
        };

        let interval = Duration::from_millis(hello.heartbeat_interval);
        if let Some(mut previous) = link.heartbeat.take() {
            previous.stop();
        }
        link.heartbeat = Some(HeartbeatScheduler::start(
            interval,
            self.shutdown.child_token(),
        ));
        info!(interval_ms = hello.heartbeat_interval, "received hello");

        if link.identified {
            debug!("repeated hello, heartbeat re-armed");
            return None;
        }
        self.identify(link).await
    }

    async fn identify(&mut self, link: &mut Link) -> Option<SessionEnd> {
        if !link.outbound.is_open() {
            warn!("transport not open, not sending identify");
            return None;
        }

        let token = &self.config.token;
        let payload = match self.session.session_id() {
            Some(session_id) if link.resuming => {
                info!(session_id, seq = ?self.session.sequence(), "resuming gateway session");
                protocol::resume(token, session_id, self.session.sequence())
            }
            _ => {
                debug!(intents = self.config.intents.bits(), "sending identify");
                protocol::identify(token, self.config.intents, &self.config.properties)
            }
        };

        self.shared.state.store(ConnectionState::Identifying);
        if let Err(e) = link.outbound.send(&payload).await {
            return Some(SessionEnd::transport_failure(
                format!("failed to send identify: {e}"),
                e,
            ));
        }
        link.identified = true;
        None
    }

    async fn on_heartbeat_tick(&mut self, link: &mut Link) -> Option<SessionEnd> {
        let heartbeat = link.heartbeat.as_mut()?;
        match heartbeat.beat() {
            Beat::Zombie => {
                warn!("previous heartbeat was not acknowledged, reconnecting");
                Some(SessionEnd::reconnect(
                    "heartbeat not acknowledged",
                    ReconnectTrigger::Backoff,
                ))
            }
            Beat::Send => self.send_heartbeat(link).await,
        }
    }

    async fn send_heartbeat(&self, link: &mut Link) -> Option<SessionEnd> {
        let seq = self.session.sequence();
        trace!(seq = ?seq, "sending heartbeat");
        let result = link.outbound.send(&protocol::heartbeat(seq)).await;
        result.err().map(|e| {
            SessionEnd::transport_failure(format!("failed to send heartbeat: {e}"), e)
        })
    }

    /// Apply a dispatch to the session and emit its event.
    fn on_dispatch(&mut self, payload: Payload, link: &Link) {
        if let Some(seq) = payload.s {
            if !self.session.observe_sequence(seq) {
                debug!(seq, current = ?self.session.sequence(), "dispatch sequence did not advance");
            }
        }

        let Payload { s, t, d, .. } = payload;
        let name = t.unwrap_or_default();
        match name.as_str() {
            event::READY => {
                let data = d.unwrap_or(Value::Null);
                let ready: ReadyData = match serde_json::from_value(data.clone()) {
                    Ok(ready) => ready,
                    Err(e) => {
                        warn!(error = %e, "dropping malformed READY");
                        return;
                    }
                };
                info!(session_id = %ready.session_id, "gateway session ready");
                let event = ReadyEvent {
                    session_id: ready.session_id.clone(),
                    resume_url: ready.resume_gateway_url.clone(),
                    data,
                };
                self.session = SessionState::from_ready(ready, s);
                self.mark_connected();
                self.emit(GatewayEvent::Ready(event));
            }
            event::RESUMED => {
                if link.resuming {
                    info!("gateway session resumed");
                } else {
                    warn!("RESUMED received without a resume attempt");
                }
                self.mark_connected();
                self.emit(GatewayEvent::Resumed);
            }
            event::MESSAGE_CREATE => {
                self.emit(GatewayEvent::Message(MessageEvent {
                    event: event::MESSAGE_CREATE.to_string(),
                    sequence: s,
                    data: d.unwrap_or(Value::Null),
                }));
            }
            other => trace!(event = other, "ignoring dispatch"),
        }
    }

    fn mark_connected(&mut self) {
        self.shared.state.store(ConnectionState::Connected);
        self.backoff.reset();
        self.resolve_waiters();
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::WaitReady(tx) => {
                if self.shared.state.load() == ConnectionState::Connected {
                    let _ = tx.send(Ok(()));
                } else {
                    self.waiters.push(tx);
                }
            }
        }
    }

    fn resolve_waiters(&mut self) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
    }

    fn fail_waiters(&mut self, error: &GatewayError) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(error.clone()));
        }
    }

    fn publish_session(&self) {
        *self.shared.session.write() = self.session.clone();
    }

    /// Deliver an event without waiting on the receiver.
    ///
    /// The driver also services heartbeats, so a slow consumer loses events
    /// rather than stalling the connection.
    fn emit(&mut self, event: GatewayEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                self.dropped_events += 1;
                warn!(
                    event = event_kind(&event),
                    dropped = self.dropped_events,
                    "event channel full, dropping event"
                );
            }
            Err(TrySendError::Closed(_)) => trace!("event receiver dropped"),
        }
    }

    /// Wait out a reconnect delay. Returns `false` if shut down meanwhile.
    async fn sleep_or_shutdown(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => return false,
                Some(command) = self.commands.recv() => self.handle_command(command),
                () = &mut sleep => return true,
            }
        }
    }

    fn finish_shutdown(&mut self) {
        self.session.clear();
        self.publish_session();
        self.shared.state.store(ConnectionState::Disconnected);
        self.fail_waiters(&GatewayError::Disconnected);
        self.emit(GatewayEvent::Disconnected {
            reason: "client disconnect".to_string(),
            will_reconnect: false,
        });
        info!("gateway connection closed");
    }
}

fn event_kind(event: &GatewayEvent) -> &'static str {
    match event {
        GatewayEvent::Ready(_) => "ready",
        GatewayEvent::Resumed => "resumed",
        GatewayEvent::Message(_) => "message",
        GatewayEvent::Error(_) => "error",
        GatewayEvent::Disconnected { .. } => "disconnected",
        GatewayEvent::Reconnecting { .. } => "reconnecting",
    }
}

async fn next_tick(heartbeat: &mut Option<HeartbeatScheduler>) -> Option<()> {
    match heartbeat {
        Some(heartbeat) => heartbeat.tick().await,
        None => std::future::pending().await,
    }
}
