//! One physical connection: acknowledgment handshake, driver task and handle.
//!
//! [`Connector::connect`] opens a transport session, waits for the
//! acknowledgment, then hands the socket to a background driver task and
//! returns the triple `(ConnectionHandle, Completer, Terminal)`:
//!
//! - [`ConnectionHandle`] sends envelopes and attaches inbound routes,
//! - [`Completer`] closes the connection gracefully (idempotent),
//! - [`Terminal`] settles once with the final close outcome.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use futures_util::{SinkExt, Stream, StreamExt, stream::SplitSink};
use tokio::{
    net::TcpStream,
    sync::mpsc,
    time::{Instant, Interval, sleep_until, timeout},
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        Message,
        protocol::{CloseFrame, frame::coding::CloseCode},
    },
};
use tracing::{debug, info, warn};

use crate::{
    config::MuxConfig,
    envelope::{Envelope, SubscriptionId},
    error::{
        ABNORMAL_CLOSURE, MuxError, MuxResult, NO_STATUS_RECEIVED, NORMAL_CLOSURE, PROTOCOL_ERROR,
    },
    routes::{Route, RouteTable},
    terminal::{Terminal, TerminalSetter, TerminalState},
};

/// An acknowledged connection: handle, graceful completer and terminal signal.
pub type Connected = (ConnectionHandle, Completer, Terminal);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Performs one connection attempt.
///
/// No retry happens at this layer; a failed attempt is reported as is.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a transport session and wait for the acknowledgment.
    async fn connect(&self) -> MuxResult<Connected>;
}

/// [`Connector`] over `tokio-tungstenite`.
#[derive(Clone, Debug)]
pub struct WsConnector {
    config: Arc<MuxConfig>,
}

impl WsConnector {
    /// Create a connector for the configured URL.
    pub fn new(config: MuxConfig) -> MuxResult<Self> {
        config.validate().map_err(MuxError::config)?;
        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// The configuration this connector dials with.
    pub fn config(&self) -> &MuxConfig {
        &self.config
    }

    async fn open_and_acknowledge(&self) -> MuxResult<Connected> {
        let (ws, _response) = connect_async(self.config.url.as_str())
            .await
            .map_err(|e| MuxError::websocket(format!("Failed to open {}: {e}", self.config.url)))?;
        debug!(url = %self.config.url, "Transport open, waiting for acknowledgment");

        let (ws_write, ws_read) = ws.split();
        let ws_read = ws_read.map(|result| result.map_err(MuxError::from));
        establish(Arc::clone(&self.config), ws_read, ws_write).await
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> MuxResult<Connected> {
        match self.config.connect_timeout {
            Some(limit) => timeout(limit, self.open_and_acknowledge())
                .await
                .map_err(|_| MuxError::timeout(limit))?,
            None => self.open_and_acknowledge().await,
        }
    }
}

/// Open a connection to `config.url` and wait for its acknowledgment.
pub async fn connect(config: &MuxConfig) -> MuxResult<Connected> {
    WsConnector::new(config.clone())?.connect().await
}

/// Outbound side of the transport.
#[async_trait]
pub(crate) trait FrameWriter: Send {
    async fn send_frame(&mut self, message: Message) -> MuxResult<()>;
}

#[async_trait]
impl FrameWriter for SplitSink<WsStream, Message> {
    async fn send_frame(&mut self, message: Message) -> MuxResult<()> {
        self.send(message).await.map_err(MuxError::from)
    }
}

pub(crate) fn close_message(code: u16, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::from(code),
        reason: reason.to_string().into(),
    }))
}

fn message_to_text(message: Message) -> Option<String> {
    match message {
        Message::Text(text) => Some(text.as_str().to_owned()),
        Message::Binary(data) => match String::from_utf8(data.to_vec()) {
            Ok(text) => Some(text),
            Err(err) => {
                warn!(error = %err, "Dropping non UTF-8 binary message");
                None
            }
        },
        _ => None,
    }
}

/// Wait for the acknowledgment, then spawn the driver task.
pub(crate) async fn establish<R, W>(
    config: Arc<MuxConfig>,
    mut ws_read: R,
    mut ws_write: W,
) -> MuxResult<Connected>
where
    R: Stream<Item = MuxResult<Message>> + Unpin + Send + 'static,
    W: FrameWriter + 'static,
{
    loop {
        match ws_read.next().await {
            Some(Ok(Message::Close(frame))) => {
                let (code, reason) = frame
                    .map(|f| (u16::from(f.code), f.reason.as_str().to_owned()))
                    .unwrap_or((NO_STATUS_RECEIVED, String::new()));
                return Err(MuxError::closed(code, reason));
            }
            Some(Ok(message @ (Message::Text(_) | Message::Binary(_)))) => {
                let text = message_to_text(message).unwrap_or_default();
                if text == config.ack_message {
                    break;
                }
                let _ = ws_write
                    .send_frame(close_message(PROTOCOL_ERROR, "Didn't acknowledge!"))
                    .await;
                return Err(MuxError::NotAcknowledged { received: text });
            }
            Some(Ok(_)) => continue,
            Some(Err(err)) => return Err(err),
            None => return Err(MuxError::abrupt("Connection lost before acknowledgment")),
        }
    }

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (setter, terminal) = Terminal::channel();
    let routes = Arc::new(RouteTable::new());

    let handle = ConnectionHandle {
        inner: Arc::new(ConnectionShared {
            cmd_tx,
            routes: Arc::clone(&routes),
            terminal: terminal.clone(),
        }),
    };
    let completer = Completer {
        handle: handle.clone(),
        fired: Arc::new(AtomicBool::new(false)),
    };

    info!(url = %config.url, "Connection acknowledged");
    tokio::spawn(connection_task(
        config, ws_read, ws_write, cmd_rx, routes, setter,
    ));

    Ok((handle, completer, terminal))
}

#[derive(Debug)]
enum Command {
    Send(String),
    Close { code: u16, reason: String },
}

#[derive(Debug)]
struct ConnectionShared {
    cmd_tx: mpsc::UnboundedSender<Command>,
    routes: Arc<RouteTable>,
    terminal: Terminal,
}

/// Shared reference to one open connection. Cheap to clone.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    inner: Arc<ConnectionShared>,
}

impl ConnectionHandle {
    /// Queue a text frame.
    pub fn send_text(&self, text: impl Into<String>) -> MuxResult<()> {
        match self.inner.terminal.state() {
            TerminalState::Alive => {}
            TerminalState::Completed => {
                return Err(MuxError::closed(NORMAL_CLOSURE, "Connection completed"));
            }
            TerminalState::Closed(info) => return Err(MuxError::closed(info.code, info.reason)),
        }
        self.inner
            .cmd_tx
            .send(Command::Send(text.into()))
            .map_err(|_| MuxError::abrupt("Connection task shut down"))
    }

    /// Encode and queue an envelope.
    pub fn send(&self, envelope: &Envelope) -> MuxResult<()> {
        self.send_text(envelope.encode()?)
    }

    /// Close the connection with the given code and reason.
    ///
    /// Closing an already closed connection is a no-op.
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        let _ = self.inner.cmd_tx.send(Command::Close {
            code,
            reason: reason.into(),
        });
    }

    /// Attach an inbound route for `id`.
    pub fn route(&self, id: SubscriptionId) -> MuxResult<Route> {
        self.inner
            .routes
            .register(id)
            .ok_or_else(|| MuxError::internal(format!("subscription {id} is already routed")))
    }

    /// Terminal signal of this connection.
    pub fn terminal(&self) -> Terminal {
        self.inner.terminal.clone()
    }

    /// Whether the connection has not reached its final state yet.
    pub fn is_open(&self) -> bool {
        !self.inner.terminal.is_settled()
    }

    /// Whether two handles refer to the same physical connection.
    pub fn same_connection(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Graceful close trigger for one connection. Only the first call has effect.
#[derive(Clone, Debug)]
pub struct Completer {
    handle: ConnectionHandle,
    fired: Arc<AtomicBool>,
}

impl Completer {
    /// Close with [`NORMAL_CLOSURE`].
    pub fn complete(&self) {
        if self.fired.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("Completing connection");
        self.handle.close(NORMAL_CLOSURE, "Normal closure");
    }

    /// Whether [`Completer::complete`] has been called.
    pub fn is_completed(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

fn lost(err: &MuxError) -> TerminalState {
    match err {
        MuxError::Closed { code, reason } => TerminalState::from_close(*code, reason.clone()),
        other => TerminalState::from_close(ABNORMAL_CLOSURE, other.to_string()),
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn tick_opt(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Local close that is waiting for the peer's close frame.
struct LocalClose {
    code: u16,
    reason: String,
    deadline: Instant,
}

impl LocalClose {
    fn state(&self) -> TerminalState {
        TerminalState::from_close(self.code, self.reason.clone())
    }
}

async fn connection_task<R, W>(
    config: Arc<MuxConfig>,
    ws_read: R,
    ws_write: W,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    routes: Arc<RouteTable>,
    terminal: TerminalSetter,
) where
    R: Stream<Item = MuxResult<Message>> + Unpin,
    W: FrameWriter,
{
    let state = drive(&config, ws_read, ws_write, cmd_rx, &routes).await;
    match &state {
        TerminalState::Closed(info) => {
            info!(code = info.code, reason = %info.reason, "Connection closed");
        }
        _ => info!("Connection completed"),
    }
    terminal.settle(state);
}

async fn drive<R, W>(
    config: &MuxConfig,
    mut ws_read: R,
    mut ws_write: W,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    routes: &RouteTable,
) -> TerminalState
where
    R: Stream<Item = MuxResult<Message>> + Unpin,
    W: FrameWriter,
{
    let mut keepalive = config.keepalive_interval.map(|period| {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval
    });
    let silence_limit = config
        .keepalive_interval
        .map(|period| period + config.keepalive_timeout);
    let mut last_seen = Instant::now();
    let mut local_close: Option<LocalClose> = None;

    loop {
        let deadline = local_close.as_ref().map(|close| close.deadline);

        // Inbound frames come first so a peer close is not starved by queued sends.
        tokio::select! {
            biased;
            msg = ws_read.next() => {
                match msg {
                    Some(Ok(Message::Close(frame))) => {
                        return match (frame, &local_close) {
                            (Some(frame), _) => TerminalState::from_close(
                                u16::from(frame.code),
                                frame.reason.as_str().to_owned(),
                            ),
                            (None, Some(close)) => close.state(),
                            (None, None) => TerminalState::from_close(NO_STATUS_RECEIVED, ""),
                        };
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                        last_seen = Instant::now();
                    }
                    Some(Ok(message)) => {
                        last_seen = Instant::now();
                        let size = match &message {
                            Message::Text(text) => text.len(),
                            Message::Binary(data) => data.len(),
                            _ => 0,
                        };
                        if config.max_message_size > 0 && size > config.max_message_size {
                            warn!(
                                size = size,
                                max = config.max_message_size,
                                "Dropping oversized message"
                            );
                            continue;
                        }
                        let Some(text) = message_to_text(message) else {
                            continue;
                        };
                        if local_close.is_some() {
                            continue;
                        }
                        match Envelope::decode(&text) {
                            Ok(envelope) => {
                                routes.dispatch(envelope);
                            }
                            Err(err) if config.strict_envelopes => {
                                warn!(error = %err, "Closing connection on malformed envelope");
                                let reason = "Invalid envelope".to_string();
                                if ws_write.send_frame(close_message(PROTOCOL_ERROR, &reason)).await.is_err() {
                                    return TerminalState::from_close(PROTOCOL_ERROR, reason);
                                }
                                local_close = Some(LocalClose {
                                    code: PROTOCOL_ERROR,
                                    reason,
                                    deadline: Instant::now() + config.close_timeout,
                                });
                            }
                            Err(err) => {
                                warn!(error = %err, "Dropping malformed envelope");
                            }
                        }
                    }
                    Some(Err(err)) => {
                        if let Some(close) = &local_close {
                            return close.state();
                        }
                        warn!(error = %err, "Connection read error");
                        return lost(&err);
                    }
                    None => {
                        if let Some(close) = &local_close {
                            return close.state();
                        }
                        return TerminalState::from_close(
                            ABNORMAL_CLOSURE,
                            "Connection reset without closing handshake",
                        );
                    }
                }
            }
            cmd = cmd_rx.recv(), if local_close.is_none() => {
                let (code, reason) = match cmd {
                    Some(Command::Send(text)) => {
                        if let Err(err) = ws_write.send_frame(Message::text(text)).await {
                            warn!(error = %err, "Failed to send frame");
                            return lost(&err);
                        }
                        continue;
                    }
                    Some(Command::Close { code, reason }) => (code, reason),
                    // Every handle is gone; nobody can observe the connection anymore.
                    None => (NORMAL_CLOSURE, "Connection dropped".to_string()),
                };
                if let Err(err) = ws_write.send_frame(close_message(code, &reason)).await {
                    debug!(error = %err, "Failed to send close frame");
                    return TerminalState::from_close(code, reason);
                }
                local_close = Some(LocalClose {
                    code,
                    reason,
                    deadline: Instant::now() + config.close_timeout,
                });
            }
            () = sleep_until_opt(deadline) => {
                if let Some(close) = &local_close {
                    debug!(code = close.code, "Peer did not answer close frame in time");
                    return close.state();
                }
            }
            () = tick_opt(&mut keepalive) => {
                if silence_limit.is_some_and(|limit| last_seen.elapsed() > limit) {
                    warn!("Keepalive timeout");
                    return TerminalState::from_close(ABNORMAL_CLOSURE, "Keepalive timeout");
                }
                if let Err(err) = ws_write.send_frame(Message::Ping(Default::default())).await {
                    return lost(&err);
                }
            }
        }
    }
}
