//! # Publisher Set
//!
//! One publisher per streamable type plus the group of publish loops that
//! feed them. The loops share a cancellation token: the first one to fail
//! cancels the rest, and every connection attached to the set observes the
//! same token.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::entities::{
    CheckpointMsg, ExperimentMsg, MetricMsg, ProjectMsg, Streamable, TrialMsg,
};
use super::listener::{publish_loop, ChangeSource};
use crate::stream::{Publisher, StreamError, StreamResult};

/// Publishers for every streamable type.
#[derive(Debug)]
pub struct PublisherSet {
    pub projects: Arc<Publisher<ProjectMsg>>,
    pub experiments: Arc<Publisher<ExperimentMsg>>,
    pub trials: Arc<Publisher<TrialMsg>>,
    pub checkpoints: Arc<Publisher<CheckpointMsg>>,
    pub metrics: Arc<Publisher<MetricMsg>>,
    generation: u64,
    token: CancellationToken,
    ready: watch::Sender<bool>,
}

impl PublisherSet {
    /// Create a set whose loops stop when `token` is cancelled
    pub fn new(token: CancellationToken, generation: u64) -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            projects: Arc::new(Publisher::new()),
            experiments: Arc::new(Publisher::new()),
            trials: Arc::new(Publisher::new()),
            checkpoints: Arc::new(Publisher::new()),
            metrics: Arc::new(Publisher::new()),
            generation,
            token,
            ready,
        }
    }

    /// Restart counter of the supervisor that built this set
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Token cancelled when this set goes down
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Whether every publish loop has its listener
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Wait until every publish loop has its listener.
    ///
    /// Fails with [`StreamError::PublisherSetDown`] if the set stops first.
    pub async fn wait_ready(&self) -> StreamResult<()> {
        let mut ready = self.ready.subscribe();
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(StreamError::PublisherSetDown),
            result = ready.wait_for(|ready| *ready) => {
                result.map(|_| ()).map_err(|_| StreamError::PublisherSetDown)
            }
        }
    }

    /// Close the streamer of every connection subscribed to any publisher
    pub fn close_all_streamers(&self) {
        self.projects.close_all_streamers();
        self.experiments.close_all_streamers();
        self.trials.close_all_streamers();
        self.checkpoints.close_all_streamers();
        self.metrics.close_all_streamers();
    }

    fn spawn_loop<T: Streamable>(
        &self,
        tasks: &mut JoinSet<StreamResult<()>>,
        source: &Arc<dyn ChangeSource>,
        keepalive: Duration,
    ) -> oneshot::Receiver<()> {
        let (ready_tx, ready_rx) = oneshot::channel();
        tasks.spawn(publish_loop::<T>(
            self.token.clone(),
            Arc::clone(source),
            Arc::clone(T::publisher(self)),
            ready_tx,
            keepalive,
        ));
        ready_rx
    }

    /// Run every publish loop until one fails or the token is cancelled.
    ///
    /// Returns the first error. The token is always cancelled on return.
    pub async fn run(&self, source: Arc<dyn ChangeSource>, keepalive: Duration) -> StreamResult<()> {
        self.run_gated(source, keepalive, Vec::new()).await
    }

    /// Like [`PublisherSet::run`], but the set only becomes ready once every
    /// receiver in `also_ready` has fired too. A dropped sender keeps the set
    /// from ever becoming ready.
    pub async fn run_gated(
        &self,
        source: Arc<dyn ChangeSource>,
        keepalive: Duration,
        also_ready: Vec<oneshot::Receiver<()>>,
    ) -> StreamResult<()> {
        let mut tasks = JoinSet::new();
        let mut waiting = vec![
            self.spawn_loop::<ProjectMsg>(&mut tasks, &source, keepalive),
            self.spawn_loop::<ExperimentMsg>(&mut tasks, &source, keepalive),
            self.spawn_loop::<TrialMsg>(&mut tasks, &source, keepalive),
            self.spawn_loop::<CheckpointMsg>(&mut tasks, &source, keepalive),
            self.spawn_loop::<MetricMsg>(&mut tasks, &source, keepalive),
        ];
        waiting.extend(also_ready);

        let ready = self.ready.clone();
        let generation = self.generation;
        let gate = tokio::spawn(async move {
            for rx in waiting {
                if rx.await.is_err() {
                    return;
                }
            }
            ready.send_replace(true);
            info!(generation, "publisher set ready");
        });

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined.unwrap_or_else(|e| {
                Err(StreamError::Internal(format!("publish loop panicked: {}", e)))
            });
            if let Err(e) = result {
                if first_error.is_none() {
                    error!(generation, error = %e, "publish loop failed, stopping publisher set");
                    first_error = Some(e);
                } else {
                    warn!(generation, error = %e, "publish loop failed during shutdown");
                }
            }
            self.token.cancel();
        }

        gate.abort();
        self.close_all_streamers();
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryDatabase;

    fn trial(id: i64) -> TrialMsg {
        TrialMsg {
            id,
            experiment_id: 1,
            state: "ACTIVE".to_string(),
            total_batches: 0,
            start_time: None,
            end_time: None,
            workspace_id: 1,
            seq: 0,
        }
    }

    #[tokio::test]
    async fn test_ready_then_cancel() {
        let db = Arc::new(MemoryDatabase::new());
        let token = CancellationToken::new();
        let set = Arc::new(PublisherSet::new(token.clone(), 1));

        let runner = {
            let set = Arc::clone(&set);
            let source = db.change_source();
            tokio::spawn(async move { set.run(source, Duration::from_secs(30)).await })
        };

        tokio::time::timeout(Duration::from_secs(1), set.wait_ready())
            .await
            .expect("set never became ready")
            .unwrap();
        assert!(set.is_ready());

        token.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), runner)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_extra_gate_holds_readiness() {
        let db = Arc::new(MemoryDatabase::new());
        let set = Arc::new(PublisherSet::new(CancellationToken::new(), 1));
        let (listening_tx, listening_rx) = oneshot::channel();

        let runner = {
            let set = Arc::clone(&set);
            let source = db.change_source();
            tokio::spawn(async move {
                set.run_gated(source, Duration::from_secs(30), vec![listening_rx])
                    .await
            })
        };

        // every publish loop listens, but the extra gate has not fired
        tokio::time::timeout(Duration::from_secs(1), async {
            while !db.has_listener(MetricMsg::KIND.channel()) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        let early = tokio::time::timeout(Duration::from_millis(100), set.wait_ready()).await;
        assert!(early.is_err());
        assert!(!set.is_ready());

        listening_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), set.wait_ready())
            .await
            .unwrap()
            .unwrap();
        assert!(set.is_ready());

        set.token().cancel();
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_undecodable_payload_stops_set() {
        let db = Arc::new(MemoryDatabase::new());
        let set = Arc::new(PublisherSet::new(CancellationToken::new(), 1));

        let runner = {
            let set = Arc::clone(&set);
            let source = db.change_source();
            tokio::spawn(async move { set.run(source, Duration::from_secs(30)).await })
        };
        set.wait_ready().await.unwrap();

        db.notify_raw(TrialMsg::KIND.channel(), "{not json");
        let result = tokio::time::timeout(Duration::from_secs(1), runner)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(StreamError::Decode { .. })));
        assert!(set.token().is_cancelled());
        assert!(set.wait_ready().await.is_err());
    }

    #[tokio::test]
    async fn test_lost_listener_stops_set() {
        let db = Arc::new(MemoryDatabase::new());
        let set = Arc::new(PublisherSet::new(CancellationToken::new(), 1));

        let runner = {
            let set = Arc::clone(&set);
            let source = db.change_source();
            tokio::spawn(async move { set.run(source, Duration::from_secs(30)).await })
        };
        set.wait_ready().await.unwrap();

        db.drop_listeners();
        let result = tokio::time::timeout(Duration::from_secs(1), runner)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(StreamError::ListenerClosed(_))));
    }

    #[tokio::test]
    async fn test_failed_ping_stops_set() {
        let db = Arc::new(MemoryDatabase::new());
        let set = Arc::new(PublisherSet::new(CancellationToken::new(), 1));

        let runner = {
            let set = Arc::clone(&set);
            let source = db.change_source();
            tokio::spawn(async move { set.run(source, Duration::from_millis(20)).await })
        };
        set.wait_ready().await.unwrap();

        db.fail_pings(true);
        let result = tokio::time::timeout(Duration::from_secs(1), runner)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(StreamError::PingFailed { .. })));
    }

    #[tokio::test]
    async fn test_changes_reach_publishers() {
        use crate::stream::{filter_fn, Outbox, Streamer, Subscription, Wakeup};

        let db = Arc::new(MemoryDatabase::new());
        let set = Arc::new(PublisherSet::new(CancellationToken::new(), 1));
        let runner = {
            let set = Arc::clone(&set);
            let source = db.change_source();
            tokio::spawn(async move { set.run(source, Duration::from_secs(30)).await })
        };
        set.wait_ready().await.unwrap();

        let streamer: Arc<Streamer<()>> = Arc::new(Streamer::new());
        let mut sub = Subscription::new(
            Arc::clone(&streamer) as Arc<dyn Outbox>,
            Arc::clone(&set.trials),
            filter_fn(|_: &TrialMsg| true),
            filter_fn(|_: &TrialMsg| true),
        );
        sub.register();

        db.trials.upsert(trial(1));
        let wakeup = tokio::time::timeout(Duration::from_secs(1), streamer.wait())
            .await
            .unwrap();
        match wakeup {
            Wakeup::Messages(msgs) => assert_eq!(msgs[0].to_json()["trial"]["id"], 1),
            other => panic!("unexpected wakeup: {:?}", other),
        }

        set.token().cancel();
        runner.await.unwrap().unwrap();
        assert!(streamer.is_closed());
    }
}
