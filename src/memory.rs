//! # In-Memory Database
//!
//! Row tables for every streamable type plus a notification bus that
//! behaves like a database's LISTEN/NOTIFY: every committed change emits a
//! before/after event on the type's channel, in commit order.
//!
//! Used by the server as its backing store and by tests to drive changes,
//! drop listener connections, and fail keepalive pings on demand.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::realtime::entities::{
    CheckpointMsg, EntityKind, ExperimentMsg, MetricMsg, ProjectMsg, Streamable, TrialMsg,
};
use crate::realtime::listener::{ChangeListener, ChangeSource};
use crate::realtime::queries::{EntityQueries, QuerySet};
use crate::realtime::scopes::{AccessScopes, PERMISSION_CHANNEL};
use crate::stream::{Event, StreamError, StreamResult};

// ==================
// Notification bus
// ==================

#[derive(Debug, Default)]
struct BusState {
    listeners: HashMap<String, Vec<mpsc::UnboundedSender<String>>>,
}

/// Channel-addressed notification bus.
#[derive(Debug, Default)]
pub struct MemoryChangeSource {
    state: Mutex<BusState>,
    fail_pings: Arc<AtomicBool>,
}

impl MemoryChangeSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Deliver `payload` to every listener on `channel`
    pub fn notify(&self, channel: &str, payload: &str) {
        let mut state = self.lock();
        if let Some(senders) = state.listeners.get_mut(channel) {
            senders.retain(|tx| tx.send(payload.to_string()).is_ok());
        }
    }

    /// Sever every listener connection
    pub fn drop_listeners(&self) {
        let dropped: usize = self.lock().listeners.drain().map(|(_, s)| s.len()).sum();
        debug!(dropped, "dropped change listeners");
    }

    /// Make every keepalive ping fail (or succeed again)
    pub fn fail_pings(&self, fail: bool) {
        self.fail_pings.store(fail, Ordering::SeqCst);
    }

    /// Whether anyone is listening on `channel`
    pub fn has_listener(&self, channel: &str) -> bool {
        self.lock()
            .listeners
            .get(channel)
            .map(|senders| senders.iter().any(|tx| !tx.is_closed()))
            .unwrap_or(false)
    }
}

#[async_trait]
impl ChangeSource for MemoryChangeSource {
    async fn listen(&self, channel: &str) -> StreamResult<Box<dyn ChangeListener>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock()
            .listeners
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(Box::new(MemoryListener {
            channel: channel.to_string(),
            rx,
            fail_pings: Arc::clone(&self.fail_pings),
        }))
    }
}

struct MemoryListener {
    channel: String,
    rx: mpsc::UnboundedReceiver<String>,
    fail_pings: Arc<AtomicBool>,
}

#[async_trait]
impl ChangeListener for MemoryListener {
    async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    fn try_recv(&mut self) -> StreamResult<Option<String>> {
        match self.rx.try_recv() {
            Ok(payload) => Ok(Some(payload)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => {
                Err(StreamError::ListenerClosed(self.channel.clone()))
            }
        }
    }

    async fn ping(&mut self) -> StreamResult<()> {
        if self.fail_pings.load(Ordering::SeqCst) {
            return Err(StreamError::PingFailed {
                channel: self.channel.clone(),
                reason: "listener connection unresponsive".to_string(),
            });
        }
        Ok(())
    }
}

// ==================
// Tables
// ==================

/// A row type the memory tables can store.
pub trait StoredRow: Streamable + Serialize {
    fn set_seq(&mut self, seq: i64);
}

impl StoredRow for ProjectMsg {
    fn set_seq(&mut self, seq: i64) {
        self.seq = seq;
    }
}

impl StoredRow for ExperimentMsg {
    fn set_seq(&mut self, seq: i64) {
        self.seq = seq;
    }
}

impl StoredRow for TrialMsg {
    fn set_seq(&mut self, seq: i64) {
        self.seq = seq;
    }
}

impl StoredRow for CheckpointMsg {
    fn set_seq(&mut self, seq: i64) {
        self.seq = seq;
    }
}

impl StoredRow for MetricMsg {
    fn set_seq(&mut self, seq: i64) {
        self.seq = seq;
    }
}

#[derive(Debug)]
struct TableState<T> {
    rows: BTreeMap<i64, T>,
    seq: i64,
}

/// Rows of one type, ordered by id.
#[derive(Debug)]
pub struct MemoryTable<T> {
    state: RwLock<TableState<T>>,
    source: Arc<MemoryChangeSource>,
}

impl<T: StoredRow> MemoryTable<T> {
    fn new(source: Arc<MemoryChangeSource>) -> Self {
        Self {
            state: RwLock::new(TableState {
                rows: BTreeMap::new(),
                seq: 0,
            }),
            source,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, TableState<T>> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, TableState<T>> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // Called with the write lock held so notifications follow commit order
    fn publish(&self, event: &Event<T>) {
        match serde_json::to_string(event) {
            Ok(payload) => self.source.notify(T::KIND.channel(), &payload),
            Err(e) => error!(kind = %T::KIND, error = %e, "unable to encode change event"),
        }
    }

    /// Insert or replace a row, stamping it with the next seq
    pub fn upsert(&self, mut row: T) -> T {
        let mut state = self.write();
        state.seq += 1;
        row.set_seq(state.seq);
        let event = match state.rows.insert(row.id(), row.clone()) {
            Some(before) => Event::update(before, row.clone()),
            None => Event::insert(row.clone()),
        };
        self.publish(&event);
        row
    }

    /// Remove a row
    pub fn delete(&self, id: i64) -> Option<T> {
        let mut state = self.write();
        let before = state.rows.remove(&id)?;
        self.publish(&Event::delete(before.clone()));
        Some(before)
    }

    /// Load rows without emitting notifications. Rows without a seq get
    /// the next one.
    pub fn seed(&self, rows: impl IntoIterator<Item = T>) {
        let mut state = self.write();
        for mut row in rows {
            if row.seq_num() <= 0 {
                state.seq += 1;
                row.set_seq(state.seq);
            } else {
                state.seq = state.seq.max(row.seq_num());
            }
            state.rows.insert(row.id(), row);
        }
    }

    /// Current copy of a row
    pub fn get(&self, id: i64) -> Option<T> {
        self.read().rows.get(&id).cloned()
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        self.read().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().rows.is_empty()
    }

    /// Last seq handed out
    pub fn last_seq(&self) -> i64 {
        self.read().seq
    }
}

#[async_trait]
impl<T: StoredRow> EntityQueries<T> for MemoryTable<T> {
    async fn existing_ids(&self, spec: &T::Spec, scopes: &AccessScopes) -> StreamResult<Vec<i64>> {
        Ok(self
            .read()
            .rows
            .values()
            .filter(|row| row.matches_spec(spec) && scopes.allows(row.scope_id()))
            .map(|row| row.id())
            .collect())
    }

    async fn hydrate(
        &self,
        spec: &T::Spec,
        ids: &[i64],
        since: Option<i64>,
        scopes: &AccessScopes,
    ) -> StreamResult<Vec<T>> {
        let wanted: BTreeSet<i64> = ids.iter().copied().collect();
        Ok(self
            .read()
            .rows
            .values()
            .filter(|row| row.matches_spec(spec) && scopes.allows(row.scope_id()))
            .filter(|row| {
                wanted.contains(&row.id()) || since.map_or(false, |since| row.seq_num() > since)
            })
            .cloned()
            .collect())
    }
}

// ==================
// Database
// ==================

/// Initial contents of a memory database
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Fixture {
    pub projects: Vec<ProjectMsg>,
    pub experiments: Vec<ExperimentMsg>,
    pub trials: Vec<TrialMsg>,
    pub checkpoints: Vec<CheckpointMsg>,
    pub metrics: Vec<MetricMsg>,
}

impl Fixture {
    /// Read a fixture file
    pub fn load(path: &Path) -> StreamResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| StreamError::Config(format!("reading {}: {}", path.display(), e)))?;
        serde_json::from_str(&text)
            .map_err(|e| StreamError::Config(format!("parsing {}: {}", path.display(), e)))
    }
}

/// Tables for every streamable type sharing one notification bus.
#[derive(Debug)]
pub struct MemoryDatabase {
    pub projects: Arc<MemoryTable<ProjectMsg>>,
    pub experiments: Arc<MemoryTable<ExperimentMsg>>,
    pub trials: Arc<MemoryTable<TrialMsg>>,
    pub checkpoints: Arc<MemoryTable<CheckpointMsg>>,
    pub metrics: Arc<MemoryTable<MetricMsg>>,
    source: Arc<MemoryChangeSource>,
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDatabase {
    /// Create an empty database
    pub fn new() -> Self {
        let source = Arc::new(MemoryChangeSource::new());
        Self {
            projects: Arc::new(MemoryTable::new(Arc::clone(&source))),
            experiments: Arc::new(MemoryTable::new(Arc::clone(&source))),
            trials: Arc::new(MemoryTable::new(Arc::clone(&source))),
            checkpoints: Arc::new(MemoryTable::new(Arc::clone(&source))),
            metrics: Arc::new(MemoryTable::new(Arc::clone(&source))),
            source,
        }
    }

    /// Create a database holding `fixture`
    pub fn with_fixture(fixture: Fixture) -> Self {
        let db = Self::new();
        db.projects.seed(fixture.projects);
        db.experiments.seed(fixture.experiments);
        db.trials.seed(fixture.trials);
        db.checkpoints.seed(fixture.checkpoints);
        db.metrics.seed(fixture.metrics);
        db
    }

    /// The notification bus as a change source
    pub fn change_source(&self) -> Arc<dyn ChangeSource> {
        Arc::clone(&self.source) as Arc<dyn ChangeSource>
    }

    /// Startup queries over these tables
    pub fn queries(&self) -> QuerySet {
        QuerySet {
            projects: Arc::clone(&self.projects) as Arc<dyn EntityQueries<ProjectMsg>>,
            experiments: Arc::clone(&self.experiments) as Arc<dyn EntityQueries<ExperimentMsg>>,
            trials: Arc::clone(&self.trials) as Arc<dyn EntityQueries<TrialMsg>>,
            checkpoints: Arc::clone(&self.checkpoints) as Arc<dyn EntityQueries<CheckpointMsg>>,
            metrics: Arc::clone(&self.metrics) as Arc<dyn EntityQueries<MetricMsg>>,
        }
    }

    /// Send an arbitrary payload on a channel
    pub fn notify_raw(&self, channel: &str, payload: &str) {
        self.source.notify(channel, payload);
    }

    /// Announce that roles or assignments changed
    pub fn notify_permissions_changed(&self) {
        self.source.notify(PERMISSION_CHANNEL, "{}");
    }

    /// Sever every listener connection
    pub fn drop_listeners(&self) {
        self.source.drop_listeners();
    }

    /// Make keepalive pings fail
    pub fn fail_pings(&self, fail: bool) {
        self.source.fail_pings(fail);
    }

    /// Whether anyone is listening on `channel`
    pub fn has_listener(&self, channel: &str) -> bool {
        self.source.has_listener(channel)
    }

    /// Insert or replace a row given as JSON; the path id wins over the body
    pub fn upsert_json(&self, kind: EntityKind, id: i64, row: Value) -> StreamResult<Value> {
        match kind {
            EntityKind::Projects => upsert_value(&self.projects, id, row),
            EntityKind::Experiments => upsert_value(&self.experiments, id, row),
            EntityKind::Trials => upsert_value(&self.trials, id, row),
            EntityKind::Checkpoints => upsert_value(&self.checkpoints, id, row),
            EntityKind::Metrics => upsert_value(&self.metrics, id, row),
        }
    }

    /// Delete a row, returning its last image as JSON
    pub fn delete_json(&self, kind: EntityKind, id: i64) -> StreamResult<Option<Value>> {
        match kind {
            EntityKind::Projects => delete_value(&self.projects, id),
            EntityKind::Experiments => delete_value(&self.experiments, id),
            EntityKind::Trials => delete_value(&self.trials, id),
            EntityKind::Checkpoints => delete_value(&self.checkpoints, id),
            EntityKind::Metrics => delete_value(&self.metrics, id),
        }
    }

    /// Row counts per type
    pub fn counts(&self) -> BTreeMap<EntityKind, usize> {
        BTreeMap::from([
            (EntityKind::Projects, self.projects.len()),
            (EntityKind::Experiments, self.experiments.len()),
            (EntityKind::Trials, self.trials.len()),
            (EntityKind::Checkpoints, self.checkpoints.len()),
            (EntityKind::Metrics, self.metrics.len()),
        ])
    }
}

fn upsert_value<T: StoredRow>(table: &MemoryTable<T>, id: i64, mut row: Value) -> StreamResult<Value> {
    if let Value::Object(fields) = &mut row {
        fields.insert("id".to_string(), Value::from(id));
    }
    let row: T = serde_json::from_value(row)
        .map_err(|e| StreamError::InvalidMessage(format!("{} row: {}", T::KIND, e)))?;
    let stored = table.upsert(row);
    serde_json::to_value(&stored).map_err(|e| StreamError::Internal(e.to_string()))
}

fn delete_value<T: StoredRow>(table: &MemoryTable<T>, id: i64) -> StreamResult<Option<Value>> {
    table
        .delete(id)
        .map(|row| serde_json::to_value(&row).map_err(|e| StreamError::Internal(e.to_string())))
        .transpose()
}
