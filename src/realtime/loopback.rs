//! In-process socket transport.
//!
//! Connects a [`ClientSocket`] to the connection handler over channels, for
//! embedding the streaming core without a network listener.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::connection::{SocketReader, SocketWriter};
use super::messages::StartupMsg;
use crate::stream::{PreparedMessage, StreamError, StreamResult};

/// A frame sent by the server
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    Text(String),
    Close { code: u16, reason: String },
}

/// Client end of a loopback socket
#[derive(Debug)]
pub struct ClientSocket {
    outgoing: Option<mpsc::UnboundedSender<String>>,
    incoming: mpsc::UnboundedReceiver<ServerFrame>,
}

impl ClientSocket {
    /// Send a startup message
    pub fn send_startup(&self, msg: &StartupMsg) {
        if let Ok(text) = serde_json::to_string(msg) {
            self.send_text(&text);
        }
    }

    /// Send a raw text frame
    pub fn send_text(&self, text: &str) {
        if let Some(tx) = &self.outgoing {
            let _ = tx.send(text.to_string());
        }
    }

    /// Close the client side; the server reader sees end of stream
    pub fn close(&mut self) {
        self.outgoing = None;
    }

    /// Next frame from the server, `None` once the server side is gone
    pub async fn recv(&mut self) -> Option<ServerFrame> {
        self.incoming.recv().await
    }
}

/// Server-side reader of a loopback socket
#[derive(Debug)]
pub struct LoopbackReader {
    incoming: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl SocketReader for LoopbackReader {
    async fn read_startup(&mut self) -> StreamResult<Option<StartupMsg>> {
        match self.incoming.recv().await {
            Some(text) => StartupMsg::parse(&text).map(Some),
            None => Ok(None),
        }
    }
}

/// Server-side writer of a loopback socket
#[derive(Debug)]
pub struct LoopbackWriter {
    outgoing: mpsc::UnboundedSender<ServerFrame>,
}

impl LoopbackWriter {
    fn send(&self, frame: ServerFrame) -> StreamResult<()> {
        self.outgoing
            .send(frame)
            .map_err(|_| StreamError::Transport("loopback client dropped".to_string()))
    }
}

#[async_trait]
impl SocketWriter for LoopbackWriter {
    async fn write(&mut self, msg: &PreparedMessage) -> StreamResult<()> {
        self.send(ServerFrame::Text(msg.text().to_string()))
    }

    async fn close(&mut self, code: u16, reason: &str) -> StreamResult<()> {
        self.send(ServerFrame::Close {
            code,
            reason: reason.to_string(),
        })
    }
}

/// Create a connected client socket and server halves
pub fn socket_pair() -> (ClientSocket, LoopbackReader, LoopbackWriter) {
    let (client_tx, server_rx) = mpsc::unbounded_channel();
    let (server_tx, client_rx) = mpsc::unbounded_channel();
    (
        ClientSocket {
            outgoing: Some(client_tx),
            incoming: client_rx,
        },
        LoopbackReader {
            incoming: server_rx,
        },
        LoopbackWriter {
            outgoing: server_tx,
        },
    )
}
