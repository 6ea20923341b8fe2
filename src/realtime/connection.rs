//! # Connection Handler
//!
//! Drives one client socket through its lifecycle:
//!
//! ```text
//! Connecting -> Syncing -> Streaming -> (SoftReset -> Syncing) -> Closed
//! ```
//!
//! A reader task hands every startup message to the connection's streamer.
//! The writer (this task) owns the state machine and is the only writer to
//! the socket. A watcher task closes the streamer when the connection is
//! cancelled, the publisher set goes down, or permissions change; the client
//! sees the same close in every case and reconnects.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::messages::{StartupMsg, SyncMsg};
use super::publisher_set::PublisherSet;
use super::queries::QuerySet;
use super::scopes::{AuthzStrategy, User};
use super::subscription_set::SubscriptionSet;
use crate::observability::StreamMetrics;
use crate::stream::{Outbox, PreparedMessage, StreamResult, Streamer, Wakeup};

/// Inbound half of a client socket.
#[async_trait]
pub trait SocketReader: Send + 'static {
    /// Next startup message, or `None` once the client closed the socket
    async fn read_startup(&mut self) -> StreamResult<Option<StartupMsg>>;
}

/// Outbound half of a client socket.
#[async_trait]
pub trait SocketWriter: Send {
    /// Write one frame
    async fn write(&mut self, msg: &PreparedMessage) -> StreamResult<()>;

    /// Send a close frame
    async fn close(&mut self, code: u16, reason: &str) -> StreamResult<()>;
}

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Syncing,
    Streaming,
    SoftReset,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Syncing => "syncing",
            ConnectionState::Streaming => "streaming",
            ConnectionState::SoftReset => "soft_reset",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

type ConnStreamer = Streamer<StartupMsg>;

/// Everything one connection needs once a ready publisher set is chosen.
pub struct Connection {
    id: Uuid,
    user: User,
    publishers: Arc<PublisherSet>,
    queries: QuerySet,
    authz: Arc<AuthzStrategy>,
    boot: watch::Receiver<u64>,
    token: CancellationToken,
    metrics: Arc<StreamMetrics>,
    state: ConnectionState,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user", &self.user.username)
            .field("generation", &self.publishers.generation())
            .field("state", &self.state)
            .finish()
    }
}

impl Connection {
    /// `boot` must be subscribed before the publisher set was chosen, so a
    /// permission change in between still closes this connection.
    pub fn new(
        user: User,
        publishers: Arc<PublisherSet>,
        queries: QuerySet,
        authz: Arc<AuthzStrategy>,
        boot: watch::Receiver<u64>,
        token: CancellationToken,
        metrics: Arc<StreamMetrics>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user,
            publishers,
            queries,
            authz,
            boot,
            token,
            metrics,
            state: ConnectionState::Connecting,
        }
    }

    /// Connection id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    fn transition(&mut self, next: ConnectionState) {
        trace!(connection_id = %self.id, from = %self.state, to = %next, "connection state");
        self.state = next;
    }

    /// Serve the socket until it closes.
    ///
    /// Returns an error only for failures the client should hear about in
    /// the close frame: protocol errors from the reader and query or write
    /// failures from the writer.
    pub async fn run<R: SocketReader, W: SocketWriter>(
        mut self,
        mut reader: R,
        writer: &mut W,
    ) -> StreamResult<()> {
        let streamer: Arc<ConnStreamer> = Arc::new(Streamer::new());

        let reader_task = {
            let streamer = Arc::clone(&streamer);
            tokio::spawn(async move {
                let result = loop {
                    match reader.read_startup().await {
                        Ok(Some(msg)) => streamer.push_inbound(msg),
                        Ok(None) => break Ok(()),
                        Err(e) => break Err(e),
                    }
                };
                streamer.close();
                result
            })
        };

        let watcher = {
            let streamer = Arc::clone(&streamer);
            let token = self.token.clone();
            let publishers_token = self.publishers.token().clone();
            let mut boot = self.boot.clone();
            let id = self.id;
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => debug!(connection_id = %id, "connection cancelled"),
                    _ = publishers_token.cancelled() => debug!(connection_id = %id, "publisher set down"),
                    _ = boot.changed() => debug!(connection_id = %id, "booted by permission change"),
                }
                streamer.close();
            })
        };

        let mut outcome = Ok(());
        let mut next = match streamer.wait().await {
            Wakeup::Inbound(msg) => Some(msg),
            _ => None,
        };
        while let Some(startup) = next.take() {
            match self.process_stream(&streamer, writer, startup).await {
                Ok(following) => next = following,
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }
        self.transition(ConnectionState::Closed);

        streamer.close();
        watcher.abort();
        reader_task.abort();
        if let Ok(Err(e)) = reader_task.await {
            if e.is_protocol_error() {
                warn!(connection_id = %self.id, error = %e, "protocol error from client");
                if outcome.is_ok() {
                    outcome = Err(e);
                }
            } else {
                debug!(connection_id = %self.id, error = %e, "socket read ended");
            }
        }
        outcome
    }

    /// One Syncing + Streaming cycle. Returns the next startup message on a
    /// soft reset, `None` once the streamer is closed.
    async fn process_stream<W: SocketWriter>(
        &mut self,
        streamer: &Arc<ConnStreamer>,
        writer: &mut W,
        startup: StartupMsg,
    ) -> StreamResult<Option<StartupMsg>> {
        self.transition(ConnectionState::Syncing);
        let outbox: Arc<dyn Outbox> = Arc::clone(streamer) as Arc<dyn Outbox>;
        let mut subscriptions = SubscriptionSet::new(
            outbox,
            &self.publishers,
            &self.authz,
            &self.user,
            &startup.subscribe,
        )
        .await?;

        let result = self
            .stream_subscriptions(&mut subscriptions, streamer, writer, &startup)
            .await;
        subscriptions.unregister_all();

        if matches!(result, Ok(Some(_))) {
            self.transition(ConnectionState::SoftReset);
            self.metrics.increment_soft_resets();
            let dropped = streamer.discard_pending();
            debug!(connection_id = %self.id, dropped, "soft reset");
        }
        result
    }

    async fn stream_subscriptions<W: SocketWriter>(
        &mut self,
        subscriptions: &mut SubscriptionSet,
        streamer: &ConnStreamer,
        writer: &mut W,
        startup: &StartupMsg,
    ) -> StreamResult<Option<StartupMsg>> {
        let mut batch = vec![SyncMsg::begin(&startup.sync_id).prepare()];
        batch.extend(subscriptions.startup(&self.queries, &startup.known).await?);
        batch.push(SyncMsg::complete(&startup.sync_id).prepare());
        write_all(writer, &batch).await?;
        self.metrics.increment_startup_syncs();
        debug!(
            connection_id = %self.id,
            sync_id = %startup.sync_id,
            frames = batch.len(),
            "startup sync written"
        );

        self.transition(ConnectionState::Streaming);
        loop {
            match streamer.wait().await {
                Wakeup::Closed => return Ok(None),
                Wakeup::Inbound(next) => return Ok(Some(next)),
                Wakeup::Messages(msgs) => write_all(writer, &msgs).await?,
            }
        }
    }
}

async fn write_all<W: SocketWriter>(writer: &mut W, msgs: &[PreparedMessage]) -> StreamResult<()> {
    for msg in msgs {
        writer.write(msg).await?;
    }
    Ok(())
}
