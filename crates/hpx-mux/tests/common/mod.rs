#![allow(dead_code)]

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use hpx_mux::{Envelope, MuxConfig};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
    time::timeout,
};
use tokio_tungstenite::{
    accept_async,
    tungstenite::{
        Message,
        protocol::{CloseFrame, frame::coding::CloseCode},
    },
};

const WAIT: Duration = Duration::from_secs(3);

/// Frame the test server received from the client.
#[derive(Debug, PartialEq, Eq)]
pub enum Received {
    Text(String),
    Close(Option<u16>),
}

enum ServerCmd {
    Text(String),
    Close(u16, String),
    Drop,
}

/// Server side of one accepted WebSocket connection.
pub struct ServerConn {
    frames: mpsc::UnboundedReceiver<Received>,
    commands: mpsc::UnboundedSender<ServerCmd>,
}

impl ServerConn {
    pub fn send_text(&self, text: impl Into<String>) {
        let _ = self.commands.send(ServerCmd::Text(text.into()));
    }

    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.commands.send(ServerCmd::Close(code, reason.to_string()));
    }

    /// Drop the TCP connection without a closing handshake.
    pub fn drop_connection(&self) {
        let _ = self.commands.send(ServerCmd::Drop);
    }

    pub async fn recv(&mut self) -> Received {
        timeout(WAIT, self.frames.recv())
            .await
            .expect("frame in time")
            .expect("connection alive")
    }

    pub async fn recv_envelope(&mut self) -> Envelope {
        match self.recv().await {
            Received::Text(text) => Envelope::decode(&text).expect("envelope"),
            other => panic!("expected envelope, got {other:?}"),
        }
    }

    pub async fn expect_close(&mut self) -> Option<u16> {
        match self.recv().await {
            Received::Close(code) => code,
            other => panic!("expected close frame, got {other:?}"),
        }
    }

    pub async fn assert_silent(&mut self, duration: Duration) {
        if let Ok(Some(frame)) = timeout(duration, self.frames.recv()).await {
            panic!("unexpected frame: {frame:?}");
        }
    }
}

/// Local WebSocket server that greets every connection with `greeting`.
pub struct TestServer {
    url: String,
    connections: mpsc::UnboundedReceiver<ServerConn>,
}

impl TestServer {
    pub async fn start() -> std::io::Result<Self> {
        Self::with_greeting(vec![Message::text("ack")]).await
    }

    pub async fn with_greeting(greeting: Vec<Message>) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => return,
                };
                tokio::spawn(serve(stream, greeting.clone(), conn_tx.clone()));
            }
        });

        Ok(Self {
            url: format!("ws://{addr}"),
            connections: conn_rx,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn config(&self) -> MuxConfig {
        MuxConfig::new(self.url.clone())
            .close_timeout(Duration::from_millis(500))
            .retry_initial_delay(Duration::from_millis(10))
    }

    pub async fn accept(&mut self) -> ServerConn {
        timeout(WAIT, self.connections.recv())
            .await
            .expect("connection in time")
            .expect("server running")
    }

    pub async fn assert_no_connection(&mut self, duration: Duration) {
        if timeout(duration, self.connections.recv()).await.is_ok() {
            panic!("unexpected connection");
        }
    }
}

pub fn close_message(code: u16, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::from(code),
        reason: reason.to_string().into(),
    }))
}

async fn serve(
    stream: TcpStream,
    greeting: Vec<Message>,
    connections: mpsc::UnboundedSender<ServerConn>,
) {
    let Ok(ws) = accept_async(stream).await else {
        return;
    };
    let (mut write, mut read) = ws.split();
    for message in greeting {
        if write.send(message).await.is_err() {
            return;
        }
    }

    let (frames_tx, frames_rx) = mpsc::unbounded_channel();
    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
    let _ = connections.send(ServerConn {
        frames: frames_rx,
        commands: cmd_tx,
    });

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(ServerCmd::Text(text)) => {
                    let _ = write.send(Message::text(text)).await;
                }
                Some(ServerCmd::Close(code, reason)) => {
                    let _ = write.send(close_message(code, &reason)).await;
                }
                Some(ServerCmd::Drop) | None => return,
            },
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let _ = frames_tx.send(Received::Text(text.as_str().to_owned()));
                }
                Some(Ok(Message::Close(frame))) => {
                    let _ = frames_tx.send(Received::Close(frame.map(|f| u16::from(f.code))));
                }
                Some(Ok(_)) => {}
                Some(Err(_)) | None => return,
            },
        }
    }
}
