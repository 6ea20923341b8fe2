//! Stream WebSocket Endpoint
//!
//! `GET /stream?token=<username>` upgrades to a WebSocket served by the
//! supervisor. Client text frames are startup messages; server text frames
//! are upserts, deletions, and sync brackets.

use std::borrow::Cow;
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::server::AppState;
use crate::realtime::{SocketReader, SocketWriter, StartupMsg};
use crate::stream::{PreparedMessage, StreamError, StreamResult};

// Close frame reasons must fit in a control frame
const MAX_CLOSE_REASON: usize = 120;

#[derive(Debug, Deserialize)]
pub struct StreamParams {
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: u16,
}

impl ErrorResponse {
    pub fn response(status: StatusCode, error: impl Into<String>) -> Response {
        let body = ErrorResponse {
            error: error.into(),
            code: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}

/// Create the stream route
pub fn stream_routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/stream", get(stream_handler))
        .with_state(state)
}

async fn stream_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<StreamParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let Some(user) = state.authenticate(&params.token) else {
        return ErrorResponse::response(StatusCode::UNAUTHORIZED, "unknown stream token");
    };

    ws.on_upgrade(move |socket| async move {
        let (sink, stream) = socket.split();
        let token = state.shutdown.child_token();
        let username = user.username.clone();
        info!(user = %username, "stream socket opened");
        let result = state
            .supervisor
            .serve_connection(user, WsReader { stream }, WsWriter { sink }, token)
            .await;
        match result {
            Ok(()) => info!(user = %username, "stream socket closed"),
            Err(e) if e.is_protocol_error() => {
                warn!(user = %username, error = %e, "stream socket closed on protocol error")
            }
            Err(e) => warn!(user = %username, error = %e, "stream socket failed"),
        }
    })
    .into_response()
}

/// Reading half of a client WebSocket
pub struct WsReader {
    stream: SplitStream<WebSocket>,
}

#[async_trait]
impl SocketReader for WsReader {
    async fn read_startup(&mut self) -> StreamResult<Option<StartupMsg>> {
        while let Some(frame) = self.stream.next().await {
            match frame.map_err(|e| StreamError::Transport(e.to_string()))? {
                Message::Text(text) => return StartupMsg::parse(&text).map(Some),
                Message::Binary(_) => {
                    return Err(StreamError::InvalidMessage(
                        "binary frames are not supported".to_string(),
                    ))
                }
                Message::Close(frame) => {
                    debug!(?frame, "client closed stream socket");
                    return Ok(None);
                }
                Message::Ping(_) | Message::Pong(_) => {}
            }
        }
        Ok(None)
    }
}

/// Writing half of a client WebSocket
pub struct WsWriter {
    sink: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl SocketWriter for WsWriter {
    async fn write(&mut self, msg: &PreparedMessage) -> StreamResult<()> {
        self.sink
            .send(Message::Text(msg.text().to_string()))
            .await
            .map_err(|e| StreamError::Transport(e.to_string()))
    }

    async fn close(&mut self, code: u16, reason: &str) -> StreamResult<()> {
        let frame = CloseFrame {
            code,
            reason: Cow::Owned(truncate_reason(reason).to_string()),
        };
        self.sink
            .send(Message::Close(Some(frame)))
            .await
            .map_err(|e| StreamError::Transport(e.to_string()))
    }
}

fn truncate_reason(reason: &str) -> &str {
    if reason.len() <= MAX_CLOSE_REASON {
        return reason;
    }
    let mut end = MAX_CLOSE_REASON;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}
