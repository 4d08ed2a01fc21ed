//! In-memory transport for driving connections in unit tests.

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use futures_util::{Stream, stream};
use parking_lot::Mutex;
use tokio::{
    sync::{mpsc, watch},
    time::timeout,
};
use tokio_tungstenite::tungstenite::Message;

use crate::{
    config::MuxConfig,
    connection::{Connected, Connector, FrameWriter, close_message, establish},
    envelope::Envelope,
    error::{MuxError, MuxResult},
};

const WAIT: Duration = Duration::from_secs(2);

pub(crate) struct ChannelWriter {
    pub(crate) tx: mpsc::UnboundedSender<Message>,
}

#[async_trait]
impl FrameWriter for ChannelWriter {
    async fn send_frame(&mut self, message: Message) -> MuxResult<()> {
        self.tx
            .send(message)
            .map_err(|_| MuxError::abrupt("writer closed"))
    }
}

pub(crate) fn inbound_stream(
    rx: mpsc::UnboundedReceiver<MuxResult<Message>>,
) -> impl Stream<Item = MuxResult<Message>> + Unpin + Send + 'static {
    Box::pin(stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    }))
}

pub(crate) fn close_code(message: &Message) -> Option<u16> {
    match message {
        Message::Close(Some(frame)) => Some(u16::from(frame.code)),
        _ => None,
    }
}

/// Server side of one in-memory connection.
pub(crate) struct MemoryPeer {
    inbound: mpsc::UnboundedSender<MuxResult<Message>>,
    outbound: mpsc::UnboundedReceiver<Message>,
}

impl MemoryPeer {
    pub(crate) fn send_text(&self, text: &str) {
        let _ = self.inbound.send(Ok(Message::text(text)));
    }

    pub(crate) fn send_envelope(&self, envelope: &Envelope) {
        self.send_text(&envelope.encode().expect("encode"));
    }

    pub(crate) fn close(&self, code: u16, reason: &str) {
        let _ = self.inbound.send(Ok(close_message(code, reason)));
    }

    /// Drop the connection without a closing handshake.
    pub(crate) fn reset(self) {
        drop(self);
    }

    pub(crate) async fn recv(&mut self) -> Message {
        timeout(WAIT, self.outbound.recv())
            .await
            .expect("frame in time")
            .expect("client still connected")
    }

    pub(crate) async fn recv_envelope(&mut self) -> Envelope {
        match self.recv().await {
            Message::Text(text) => Envelope::decode(text.as_str()).expect("envelope"),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    /// Wait for the client's close frame and echo it back.
    pub(crate) async fn answer_close(&mut self) -> u16 {
        loop {
            let message = self.recv().await;
            if let Some(code) = close_code(&message) {
                self.close(code, "echo");
                return code;
            }
        }
    }

    pub(crate) fn try_recv(&mut self) -> Option<Message> {
        self.outbound.try_recv().ok()
    }
}

#[derive(Default)]
struct ServerShared {
    attempts: AtomicUsize,
    failures: Mutex<VecDeque<MuxError>>,
}

/// [`Connector`] that hands every accepted connection to a [`MemoryServer`].
pub(crate) struct MemoryConnector {
    config: Arc<MuxConfig>,
    shared: Arc<ServerShared>,
    gate: watch::Receiver<bool>,
    peers: mpsc::UnboundedSender<MemoryPeer>,
}

/// Test-side control over a [`MemoryConnector`].
pub(crate) struct MemoryServer {
    shared: Arc<ServerShared>,
    gate: watch::Sender<bool>,
    peers: mpsc::UnboundedReceiver<MemoryPeer>,
}

pub(crate) fn memory_server(config: MuxConfig) -> (MemoryConnector, MemoryServer) {
    let shared = Arc::new(ServerShared::default());
    let (gate_tx, gate_rx) = watch::channel(true);
    let (peers_tx, peers_rx) = mpsc::unbounded_channel();
    (
        MemoryConnector {
            config: Arc::new(config),
            shared: Arc::clone(&shared),
            gate: gate_rx,
            peers: peers_tx,
        },
        MemoryServer {
            shared,
            gate: gate_tx,
            peers: peers_rx,
        },
    )
}

impl MemoryServer {
    pub(crate) fn attempts(&self) -> usize {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    /// Make the next connection attempt fail with `err`.
    pub(crate) fn fail_next(&self, err: MuxError) {
        self.shared.failures.lock().push_back(err);
    }

    /// Keep connection attempts pending until [`MemoryServer::open`].
    pub(crate) fn hold(&self) {
        self.gate.send_replace(false);
    }

    pub(crate) fn open(&self) {
        self.gate.send_replace(true);
    }

    pub(crate) async fn accept(&mut self) -> MemoryPeer {
        timeout(WAIT, self.peers.recv())
            .await
            .expect("connection in time")
            .expect("connector alive")
    }

    pub(crate) fn try_accept(&mut self) -> Option<MemoryPeer> {
        self.peers.try_recv().ok()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> MuxResult<Connected> {
        self.shared.attempts.fetch_add(1, Ordering::SeqCst);
        let mut gate = self.gate.clone();
        let _ = gate.wait_for(|open| *open).await;

        let failure = self.shared.failures.lock().pop_front();
        if let Some(err) = failure {
            return Err(err);
        }

        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let _ = in_tx.send(Ok(Message::text(self.config.ack_message.clone())));
        let connected = establish(
            Arc::clone(&self.config),
            inbound_stream(in_rx),
            ChannelWriter { tx: out_tx },
        )
        .await?;
        let _ = self.peers.send(MemoryPeer {
            inbound: in_tx,
            outbound: out_rx,
        });
        Ok(connected)
    }
}
