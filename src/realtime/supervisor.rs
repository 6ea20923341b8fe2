//! # Supervisor
//!
//! Owns the current publisher set and keeps one running.
//!
//! When a set fails, the supervisor waits out a backoff and builds a fresh
//! one; connections attached to the old set see its token cancelled and
//! close. New connections block until a ready set exists. A permission
//! change bumps the boot version, which closes every live connection so
//! each reconnects with freshly computed scopes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::connection::{Connection, SocketReader, SocketWriter};
use super::listener::{permission_loop, ChangeSource};
use super::publisher_set::PublisherSet;
use super::queries::QuerySet;
use super::scopes::{AuthzStrategy, User};
use crate::observability::StreamMetrics;
use crate::stream::{StreamError, StreamResult};

/// Supervisor timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Interval between listener keepalive pings
    pub keepalive: Duration,
    /// Delay before restarting a failed publisher set
    pub restart_backoff: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            keepalive: Duration::from_secs(30),
            restart_backoff: Duration::from_secs(2),
        }
    }
}

struct SupervisorInner {
    source: Arc<dyn ChangeSource>,
    queries: QuerySet,
    authz: Arc<AuthzStrategy>,
    config: SupervisorConfig,
    current: watch::Sender<Option<Arc<PublisherSet>>>,
    boot: watch::Sender<u64>,
    generation: AtomicU64,
    metrics: Arc<StreamMetrics>,
}

/// Restarting owner of the publisher set. Cheap to clone.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("generation", &self.generation())
            .field("boot_version", &self.boot_version())
            .field("config", &self.inner.config)
            .finish()
    }
}

impl Supervisor {
    pub fn new(
        source: Arc<dyn ChangeSource>,
        queries: QuerySet,
        authz: Arc<AuthzStrategy>,
        config: SupervisorConfig,
    ) -> Self {
        let (current, _) = watch::channel(None);
        let (boot, _) = watch::channel(0);
        Self {
            inner: Arc::new(SupervisorInner {
                source,
                queries,
                authz,
                config,
                current,
                boot,
                generation: AtomicU64::new(0),
                metrics: Arc::new(StreamMetrics::new()),
            }),
        }
    }

    /// Number of publisher sets started so far
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    /// Number of permission-change boots so far
    pub fn boot_version(&self) -> u64 {
        *self.inner.boot.borrow()
    }

    /// Service counters
    pub fn metrics(&self) -> &StreamMetrics {
        &self.inner.metrics
    }

    /// The current publisher set, ready or not
    pub fn current_set(&self) -> Option<Arc<PublisherSet>> {
        self.inner.current.borrow().clone()
    }

    /// Close every live connection so it resyncs with fresh permissions
    pub fn boot_streamers(&self) {
        self.inner.boot.send_modify(|version| *version += 1);
        info!(version = self.boot_version(), "booting all streamers");
    }

    /// Keep a publisher set running until `token` is cancelled.
    pub async fn run(&self, token: CancellationToken) -> StreamResult<()> {
        loop {
            let result = self.run_one(&token).await;
            if token.is_cancelled() {
                self.inner.current.send_replace(None);
                info!("stream supervisor stopped");
                return Ok(());
            }
            match result {
                Err(e) => {
                    self.inner.metrics.increment_publisher_set_failures();
                    error!(error = %e, "publisher set crashed, restarting");
                }
                Ok(()) => warn!("publisher set exited, restarting"),
            }
            tokio::select! {
                _ = token.cancelled() => {
                    self.inner.current.send_replace(None);
                    return Ok(());
                }
                _ = tokio::time::sleep(self.inner.config.restart_backoff) => {}
            }
        }
    }

    async fn run_one(&self, token: &CancellationToken) -> StreamResult<()> {
        let inner = &self.inner;
        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let publishers = Arc::new(PublisherSet::new(token.child_token(), generation));
        inner.current.send_replace(Some(Arc::clone(&publishers)));
        inner.metrics.increment_publisher_sets_started();
        info!(generation, "starting publisher set");

        let set_token = publishers.token().clone();
        // the set is not ready until permission changes can be heard
        let (permissions_ready, permissions_listening) = oneshot::channel();
        let permissions = async {
            let result = match inner.authz.permission_channel() {
                Some(channel) => {
                    permission_loop(
                        set_token.clone(),
                        Arc::clone(&inner.source),
                        channel,
                        &inner.boot,
                        permissions_ready,
                        inner.config.keepalive,
                    )
                    .await
                }
                None => {
                    let _ = permissions_ready.send(());
                    set_token.cancelled().await;
                    Ok(())
                }
            };
            if let Err(e) = &result {
                error!(generation, error = %e, "permission listener failed, stopping publisher set");
                set_token.cancel();
            }
            result
        };

        let (published, permissions) = tokio::join!(
            publishers.run_gated(
                Arc::clone(&inner.source),
                inner.config.keepalive,
                vec![permissions_listening],
            ),
            permissions
        );
        published.and(permissions)
    }

    /// Wait for a ready publisher set.
    ///
    /// Fails with [`StreamError::ConnectionClosed`] if `token` is cancelled
    /// first.
    pub async fn current(&self, token: &CancellationToken) -> StreamResult<Arc<PublisherSet>> {
        let mut current = self.inner.current.subscribe();
        loop {
            let candidate = current.borrow_and_update().clone();
            if let Some(publishers) = candidate {
                tokio::select! {
                    _ = token.cancelled() => return Err(StreamError::ConnectionClosed),
                    ready = publishers.wait_ready() => {
                        if ready.is_ok() {
                            return Ok(publishers);
                        }
                    }
                }
            }
            tokio::select! {
                _ = token.cancelled() => return Err(StreamError::ConnectionClosed),
                changed = current.changed() => {
                    changed.map_err(|_| StreamError::Internal("supervisor dropped".to_string()))?;
                }
            }
        }
    }

    /// Serve one client socket against the current publisher set, then send
    /// the close frame.
    pub async fn serve_connection<R: SocketReader, W: SocketWriter>(
        &self,
        user: User,
        reader: R,
        mut writer: W,
        token: CancellationToken,
    ) -> StreamResult<()> {
        let boot = self.inner.boot.subscribe();
        let result = match self.current(&token).await {
            Ok(publishers) => {
                let conn = Connection::new(
                    user,
                    publishers,
                    self.inner.queries.clone(),
                    Arc::clone(&self.inner.authz),
                    boot,
                    token,
                    Arc::clone(&self.inner.metrics),
                );
                self.inner.metrics.increment_connections_opened();
                let id = conn.id();
                debug!(connection_id = %id, ?conn, "stream connection opened");
                let result = conn.run(reader, &mut writer).await;
                self.inner.metrics.increment_connections_closed();
                debug!(connection_id = %id, ok = result.is_ok(), "stream connection closed");
                result
            }
            Err(e) => Err(e),
        };

        let (code, reason) = match &result {
            Ok(()) => (1000, String::new()),
            Err(e) => {
                if e.is_protocol_error() {
                    self.inner.metrics.increment_protocol_errors();
                }
                (e.close_code(), e.to_string())
            }
        };
        if let Err(e) = writer.close(code, &reason).await {
            debug!(error = %e, "unable to send close frame");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryDatabase;
    use crate::realtime::scopes::{AuthzMode, RoleAssignments};

    fn supervisor(db: &Arc<MemoryDatabase>, mode: AuthzMode) -> Supervisor {
        Supervisor::new(
            db.change_source(),
            db.queries(),
            Arc::new(AuthzStrategy::new(mode, RoleAssignments::default())),
            SupervisorConfig {
                keepalive: Duration::from_secs(30),
                restart_backoff: Duration::from_millis(10),
            },
        )
    }

    #[tokio::test]
    async fn test_current_waits_for_ready_set() {
        let db = Arc::new(MemoryDatabase::new());
        let sup = supervisor(&db, AuthzMode::Basic);
        let token = CancellationToken::new();

        let waiter = {
            let sup = sup.clone();
            let token = token.clone();
            tokio::spawn(async move { sup.current(&token).await })
        };
        let runner = {
            let sup = sup.clone();
            let token = token.clone();
            tokio::spawn(async move { sup.run(token).await })
        };

        let publishers = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(publishers.is_ready());
        assert_eq!(publishers.generation(), 1);

        token.cancel();
        runner.await.unwrap().unwrap();
        assert!(sup.current_set().is_none());
    }

    #[tokio::test]
    async fn test_restart_after_crash() {
        let db = Arc::new(MemoryDatabase::new());
        let sup = supervisor(&db, AuthzMode::Basic);
        let token = CancellationToken::new();
        let runner = {
            let sup = sup.clone();
            let token = token.clone();
            tokio::spawn(async move { sup.run(token).await })
        };

        let first = sup.current(&token).await.unwrap();
        db.drop_listeners();
        first.token().cancelled().await;

        let second = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                let set = sup.current(&token).await.unwrap();
                if set.generation() > first.generation() {
                    return set;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(second.is_ready());

        token.cancel();
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_permission_change_bumps_boot() {
        let db = Arc::new(MemoryDatabase::new());
        let sup = supervisor(&db, AuthzMode::Rbac);
        let token = CancellationToken::new();
        let runner = {
            let sup = sup.clone();
            let token = token.clone();
            tokio::spawn(async move { sup.run(token).await })
        };
        sup.current(&token).await.unwrap();

        // a ready set is already listening for permission changes
        assert!(db.has_listener(crate::realtime::scopes::PERMISSION_CHANNEL));
        let mut boot = sup.inner.boot.subscribe();
        db.notify_permissions_changed();

        tokio::time::timeout(Duration::from_secs(1), boot.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sup.boot_version(), 1);

        token.cancel();
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_current_cancelled() {
        let db = Arc::new(MemoryDatabase::new());
        let sup = supervisor(&db, AuthzMode::Basic);
        let token = CancellationToken::new();
        token.cancel();
        assert!(matches!(
            sup.current(&token).await,
            Err(StreamError::ConnectionClosed)
        ));
    }
}
