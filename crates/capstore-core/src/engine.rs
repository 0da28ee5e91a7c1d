//! Storage engine
//!
//! Owns the single live handle and everything that touches it: recovery on
//! startup, the write queue, the checkpoint and retention schedulers.
//!
//! ```text
//!  Uninitialized ─► Loading ─┬─► RestoredPrimary ─┐
//!                            ├─► RestoredBackup ──┼─► Migrating ─► Ready ─► Closing ─► Closed
//!                            └─► CreatedFresh ────┘
//!
//!  (retries exhausted) ─────────────────────────────► Degraded ──► Closing ─► Closed
//! ```
//!
//! Recovery tries backends in priority order. The first is the durable
//! backend; the rest are backups. A backend that fails to load, or whose
//! bytes do not open as a database, is skipped. A restore from a backup
//! re-persists the image to every higher-priority backend that came up
//! empty. With nothing to restore, a fresh handle is created and written to
//! every backend; if none accepts it the attempt fails and the whole chain
//! is retried with backoff. When the retries run out the engine keeps
//! working in memory only (degraded).

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::backend::BackendSet;
use crate::checkpoint::{CheckpointReport, Checkpointer};
use crate::config::EngineConfig;
use crate::database::{Database, ResultSet, SqlValue, Statement};
use crate::error::{InitializationError, Result, StoreError};
use crate::events::{EngineEvent, EventBus};
use crate::migration::{self, MigrationRegistry, MigrationReport, VersionRecord};
use crate::queue::{SharedDatabase, WriteQueue};
use crate::retention::{PurgeSettings, RetentionManager};
use crate::retry::RetryExhausted;

/// Lifecycle state of a [`StorageEngine`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Uninitialized,
    Loading,
    RestoredPrimary,
    RestoredBackup,
    CreatedFresh,
    Migrating,
    Ready,
    Degraded,
    Closing,
    Closed,
}

impl EngineState {
    /// Whether the engine accepts operations in this state
    pub fn is_serving(&self) -> bool {
        matches!(self, EngineState::Ready | EngineState::Degraded)
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EngineState::Uninitialized => "uninitialized",
            EngineState::Loading => "loading",
            EngineState::RestoredPrimary => "restored_primary",
            EngineState::RestoredBackup => "restored_backup",
            EngineState::CreatedFresh => "created_fresh",
            EngineState::Migrating => "migrating",
            EngineState::Ready => "ready",
            EngineState::Degraded => "degraded",
            EngineState::Closing => "closing",
            EngineState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Where the live handle came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitOrigin {
    Primary,
    Backup,
    Fresh,
    Degraded,
}

/// A backend skipped during recovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendFailure {
    pub backend: String,
    pub reason: String,
}

/// How initialization went
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitReport {
    pub origin: InitOrigin,
    /// Backend the image was restored from
    pub source: Option<String>,
    /// Recovery attempts made
    pub attempts: u32,
    /// Backends skipped on the successful attempt
    pub skipped: Vec<BackendFailure>,
    /// Backends written during initialization (self-heal or fresh seed)
    pub seeded: Vec<String>,
    pub migration: MigrationReport,
    pub degraded_reason: Option<String>,
}

struct Recovered {
    db: Database,
    origin: InitOrigin,
    source: Option<String>,
    attempt: u32,
    skipped: Vec<BackendFailure>,
    seeded: Vec<String>,
}

fn transition(state: &watch::Sender<EngineState>, events: &EventBus, to: EngineState) {
    let from = state.send_replace(to);
    if from != to {
        tracing::info!("Storage engine: {} -> {}", from, to);
        events.publish(EngineEvent::StateChanged { from, to });
    }
}

/// One pass over the strategy chain
async fn recover(
    backends: &BackendSet,
    state: &watch::Sender<EngineState>,
    events: &EventBus,
    attempt: u32,
) -> std::result::Result<Recovered, InitializationError> {
    transition(state, events, EngineState::Loading);

    let mut skipped = Vec::new();
    let mut stale = Vec::new();

    for index in 0..backends.len() {
        let Some(backend) = backends.get(index) else {
            continue;
        };
        let name = backend.name().to_string();

        let reason = match backend.load().await {
            Ok(Some(bytes)) => match Database::from_bytes(&bytes) {
                Ok(db) => {
                    let (origin, restored) = if index == 0 {
                        (InitOrigin::Primary, EngineState::RestoredPrimary)
                    } else {
                        (InitOrigin::Backup, EngineState::RestoredBackup)
                    };
                    transition(state, events, restored);
                    tracing::info!("Restored {} bytes from backend '{}'", bytes.len(), name);

                    let seeded = if stale.is_empty() {
                        Vec::new()
                    } else {
                        let outcome = backends.save_to(&stale, &bytes).await;
                        if !outcome.persisted.is_empty() {
                            tracing::info!("Self-healed backends {:?}", outcome.persisted);
                        }
                        outcome.persisted
                    };

                    return Ok(Recovered {
                        db,
                        origin,
                        source: Some(name),
                        attempt,
                        skipped,
                        seeded,
                    });
                }
                Err(e) => InitializationError::CorruptSnapshot {
                    backend: name.clone(),
                    reason: e.to_string(),
                }
                .to_string(),
            },
            Ok(None) => {
                tracing::debug!("Backend '{}' holds no image", name);
                stale.push(index);
                continue;
            }
            Err(e) => e.to_string(),
        };

        tracing::warn!("Skipping backend '{}': {}", name, reason);
        events.publish(EngineEvent::Error {
            category: "backend".to_string(),
            message: reason.clone(),
        });
        skipped.push(BackendFailure {
            backend: name,
            reason,
        });
        stale.push(index);
    }

    let db = Database::fresh().map_err(|e| InitializationError::FreshCreate(e.to_string()))?;
    transition(state, events, EngineState::CreatedFresh);

    let bytes = db
        .export()
        .map_err(|e| InitializationError::FreshCreate(e.to_string()))?;
    let outcome = backends.save_all(&bytes).await;
    if !outcome.any_succeeded() {
        return Err(InitializationError::NoDurableBacking {
            attempted: backends.len(),
        });
    }

    Ok(Recovered {
        db,
        origin: InitOrigin::Fresh,
        source: None,
        attempt,
        skipped,
        seeded: outcome.persisted,
    })
}

/// Crash-tolerant embedded store over one in-memory SQLite handle
pub struct StorageEngine {
    config: EngineConfig,
    db: SharedDatabase,
    queue: Arc<WriteQueue>,
    backends: Arc<BackendSet>,
    events: EventBus,
    state: watch::Sender<EngineState>,
    report: InitReport,
    checkpointer: Checkpointer,
    retention: RetentionManager,
    shutdown: watch::Sender<bool>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    close_lock: tokio::sync::Mutex<()>,
}

impl StorageEngine {
    /// Recover or create the live handle, migrate it and start the schedulers.
    ///
    /// Only an invalid configuration, a failed migration or a handle that
    /// cannot be created at all are errors. Running out of recovery attempts
    /// yields a degraded engine.
    pub async fn initialize(
        config: EngineConfig,
        backends: BackendSet,
        registry: MigrationRegistry,
        events: EventBus,
    ) -> Result<Self> {
        config.validate()?;
        let backends = Arc::new(backends);
        let (state, _) = watch::channel(EngineState::Uninitialized);

        tracing::info!(
            "Initializing storage engine over backends {:?}",
            backends.names()
        );

        let recovered = if backends.is_empty() {
            Err(RetryExhausted {
                attempts: 0,
                last_error: InitializationError::NoDurableBacking { attempted: 0 },
            })
        } else {
            let (set, st, ev) = (&*backends, &state, &events);
            config
                .retry_policy()
                .run(move |attempt| recover(set, st, ev, attempt))
                .await
        };

        let (mut db, mut report) = match recovered {
            Ok(recovered) => {
                let report = InitReport {
                    origin: recovered.origin,
                    source: recovered.source,
                    attempts: recovered.attempt,
                    skipped: recovered.skipped,
                    seeded: recovered.seeded,
                    migration: MigrationReport::default(),
                    degraded_reason: None,
                };
                (recovered.db, report)
            }
            Err(exhausted) => {
                let reason = if exhausted.attempts == 0 {
                    "no backends configured".to_string()
                } else {
                    InitializationError::RetriesExhausted {
                        attempts: exhausted.attempts,
                        last_error: exhausted.last_error.to_string(),
                    }
                    .to_string()
                };
                tracing::error!("Storage engine running without durable backing: {}", reason);

                let db = Database::fresh()
                    .map_err(|e| InitializationError::FreshCreate(e.to_string()))?;
                db.log_error("initialization", &reason, None);
                let report = InitReport {
                    origin: InitOrigin::Degraded,
                    source: None,
                    attempts: exhausted.attempts,
                    skipped: Vec::new(),
                    seeded: Vec::new(),
                    migration: MigrationReport::default(),
                    degraded_reason: Some(reason),
                };
                (db, report)
            }
        };

        let degraded = report.origin == InitOrigin::Degraded;
        if !degraded {
            transition(&state, &events, EngineState::Migrating);
        }
        report.migration = match registry.migrate(&mut db) {
            Ok(migration) => migration,
            Err(e) => {
                tracing::error!("Migration failed, aborting startup: {}", e);
                events.publish(EngineEvent::Error {
                    category: "migration".to_string(),
                    message: e.to_string(),
                });
                return Err(e.into());
            }
        };
        for version in &report.migration.applied {
            events.publish(EngineEvent::MigrationApplied { version: *version });
        }

        if !degraded && !report.migration.is_noop() {
            match db.export() {
                Ok(bytes) => {
                    let outcome = backends.save_all(&bytes).await;
                    if !outcome.any_succeeded() {
                        tracing::warn!("Migrated image reached no backend; next checkpoint retries");
                    }
                }
                Err(e) => tracing::warn!("Could not export migrated image: {}", e),
            }
        }

        let shared: SharedDatabase = Arc::new(Mutex::new(Some(db)));
        let queue = Arc::new(WriteQueue::start(shared.clone()));
        let checkpointer = Checkpointer::new(queue.clone(), backends.clone(), events.clone());
        let retention =
            RetentionManager::new(queue.clone(), events.clone(), PurgeSettings::from(&config));
        let (shutdown, _) = watch::channel(false);

        let mut tasks = Vec::new();
        if !degraded {
            tasks.push(checkpointer.spawn_scheduler(config.checkpoint_interval(), shutdown.subscribe()));
        }
        if !config.retention.is_empty() {
            tasks.push(retention.spawn_scheduler(
                config.retention.clone(),
                config.retention_interval(),
                shutdown.subscribe(),
            ));
        }

        if degraded {
            transition(&state, &events, EngineState::Degraded);
            events.publish(EngineEvent::Degraded {
                reason: report.degraded_reason.clone().unwrap_or_default(),
            });
        } else {
            transition(&state, &events, EngineState::Ready);
            events.publish(EngineEvent::Ready {
                origin: report.origin,
                schema_version: report.migration.to_version,
            });
        }

        Ok(Self {
            config,
            db: shared,
            queue,
            backends,
            events,
            state,
            report,
            checkpointer,
            retention,
            shutdown,
            tasks: tokio::sync::Mutex::new(tasks),
            close_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Current lifecycle state
    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions
    pub fn subscribe_state(&self) -> watch::Receiver<EngineState> {
        self.state.subscribe()
    }

    pub fn is_degraded(&self) -> bool {
        self.report.origin == InitOrigin::Degraded
    }

    pub fn init_report(&self) -> &InitReport {
        &self.report
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn backends(&self) -> &BackendSet {
        &self.backends
    }

    pub fn retention(&self) -> &RetentionManager {
        &self.retention
    }

    /// Writes queued but not yet applied
    pub fn pending_writes(&self) -> usize {
        self.queue.pending()
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state() {
            EngineState::Closing | EngineState::Closed => Err(StoreError::Closed),
            _ => Ok(()),
        }
    }

    /// Run `f` against the live handle without queueing. The connection is
    /// `query_only` while `f` runs, so any write it attempts fails.
    pub async fn read<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
    {
        self.ensure_open()?;
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock();
            match guard.as_ref() {
                Some(db) => {
                    let view = db.read_only()?;
                    f(&*view)
                }
                None => Err(StoreError::Closed),
            }
        })
        .await
        .map_err(|e| StoreError::QueueClosed(format!("read task failed: {e}")))?
    }

    /// Queue `f` behind every write submitted before it
    pub async fn write<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Database) -> Result<T> + Send + 'static,
    {
        self.ensure_open()?;
        self.queue.submit(f).await
    }

    /// Read-only statement, run directly
    pub async fn query(&self, sql: impl Into<String>, params: Vec<SqlValue>) -> Result<ResultSet> {
        let sql = sql.into();
        self.read(move |db| Ok(db.query(&sql, &params)?)).await
    }

    /// Any single statement, queued
    pub async fn execute(&self, sql: impl Into<String>, params: Vec<SqlValue>) -> Result<ResultSet> {
        let sql = sql.into();
        self.write(move |db| Ok(db.execute(&sql, &params)?)).await
    }

    /// Statements applied all-or-nothing, queued
    pub async fn execute_transaction(&self, statements: Vec<Statement>) -> Result<bool> {
        self.write(move |db| {
            let changes = db.execute_transaction(&statements)?;
            tracing::debug!(
                "Transaction of {} statements committed ({} changes)",
                statements.len(),
                changes
            );
            Ok(true)
        })
        .await
    }

    /// Native byte image, consistent with the queue position it was taken at
    pub async fn export(&self) -> Result<Vec<u8>> {
        self.write(|db| Ok(db.export()?)).await
    }

    /// Force a checkpoint. Degraded engines have nowhere to write and
    /// return an empty report.
    pub async fn checkpoint(&self) -> Result<CheckpointReport> {
        self.ensure_open()?;
        if self.is_degraded() {
            tracing::debug!("Checkpoint skipped in degraded mode");
            return Ok(CheckpointReport::default());
        }
        self.checkpointer.checkpoint().await
    }

    /// Recorded schema versions, oldest first
    pub async fn version_history(&self) -> Result<Vec<VersionRecord>> {
        self.read(|db| Ok(migration::history(db)?)).await
    }

    /// Stop the schedulers, drain the queue, write a final checkpoint and
    /// drop the handle. Calling it again is a no-op.
    pub async fn close(&self) -> Result<()> {
        let _guard = self.close_lock.lock().await;
        if self.state() == EngineState::Closed {
            return Ok(());
        }
        transition(&self.state, &self.events, EngineState::Closing);

        self.shutdown.send_replace(true);
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!("Scheduler task ended abnormally: {}", e);
            }
        }

        let mut result = Ok(());
        if !self.is_degraded() {
            match self.checkpointer.checkpoint().await {
                Ok(report) if report.persisted.is_empty() => {
                    tracing::warn!("Final checkpoint reached no backend");
                }
                Ok(report) => {
                    tracing::debug!("Final checkpoint persisted to {:?}", report.persisted);
                }
                Err(e) => {
                    tracing::error!("Final checkpoint failed: {}", e);
                    result = Err(e.context("Final checkpoint before close"));
                }
            }
        }

        self.queue.close().await;
        let db = self.db.lock().take();
        if let Some(db) = db {
            if let Err(e) = db.close() {
                tracing::warn!("Closing the live handle reported: {}", e);
            }
        }

        transition(&self.state, &self.events, EngineState::Closed);
        self.events.publish(EngineEvent::Closed);
        result
    }
}

impl Drop for StorageEngine {
    fn drop(&mut self) {
        // Lets background schedulers exit if close() was never called
        self.shutdown.send_replace(true);
    }
}

impl std::fmt::Debug for StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageEngine")
            .field("state", &self.state())
            .field("origin", &self.report.origin)
            .field("backends", &self.backends)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::error::{QueryError, TransactionError};
    use std::time::Duration;

    async fn engine_over(backends: BackendSet) -> StorageEngine {
        StorageEngine::initialize(
            EngineConfig::default().with_retries(2, Duration::from_millis(1)),
            backends,
            MigrationRegistry::builtin(),
            EventBus::default(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_fresh_engine_is_ready_and_seeded() {
        let primary = Arc::new(MemoryBackend::new("primary", 0));
        let engine = engine_over(BackendSet::new().with_shared(primary.clone())).await;

        assert_eq!(engine.state(), EngineState::Ready);
        let report = engine.init_report();
        assert_eq!(report.origin, InitOrigin::Fresh);
        assert_eq!(report.seeded, vec!["primary"]);
        assert_eq!(report.migration.applied, vec![1, 2, 3, 4]);
        assert!(primary.bytes().is_some());
        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_state_transitions_are_published() {
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let engine = StorageEngine::initialize(
            EngineConfig::default(),
            BackendSet::new().with(MemoryBackend::new("primary", 0)),
            MigrationRegistry::builtin(),
            events,
        )
        .await
        .unwrap();

        let mut visited = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let EngineEvent::StateChanged { to, .. } = event {
                visited.push(to);
            }
        }
        assert_eq!(
            visited,
            vec![
                EngineState::Loading,
                EngineState::CreatedFresh,
                EngineState::Migrating,
                EngineState::Ready
            ]
        );
        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_query_rejects_writes_and_bad_sql() {
        let engine = engine_over(BackendSet::new().with(MemoryBackend::new("primary", 0))).await;

        let err = engine.query("DELETE FROM requests", vec![]).await.unwrap_err();
        assert!(matches!(err, StoreError::Query(QueryError::NotReadOnly(_))));

        let err = engine.query("SELECT FROM WHERE", vec![]).await.unwrap_err();
        assert!(matches!(err, StoreError::Query(QueryError::Sql(_))));
        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_read_closures_cannot_write() {
        let engine = engine_over(BackendSet::new().with(MemoryBackend::new("primary", 0))).await;
        engine
            .execute(
                "INSERT INTO requests (id, url, method, timestamp) VALUES ('a', 'https://a.test/', 'GET', 1)",
                vec![],
            )
            .await
            .unwrap();

        let attempt = engine
            .read(|db| Ok(db.connection().execute("DELETE FROM requests", [])?))
            .await;
        assert!(attempt.is_err());

        let count = engine.query("SELECT COUNT(*) FROM requests", vec![]).await.unwrap();
        assert_eq!(count.scalar(), Some(&SqlValue::Integer(1)));

        // Queued writes still go through afterwards
        let deleted = engine.execute("DELETE FROM requests", vec![]).await.unwrap();
        assert_eq!(deleted.changes, 1);
        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_execute_transaction_rolls_back() {
        let engine = engine_over(BackendSet::new().with(MemoryBackend::new("primary", 0))).await;

        let ok = engine
            .execute_transaction(vec![Statement::new(
                "INSERT INTO requests (id, url, method, timestamp) VALUES (?1, ?2, 'GET', 1)",
                vec![SqlValue::Text("a".into()), SqlValue::Text("https://a.test/".into())],
            )])
            .await
            .unwrap();
        assert!(ok);

        let err = engine
            .execute_transaction(vec![
                Statement::bare(
                    "INSERT INTO requests (id, url, method, timestamp) VALUES ('b', 'x', 'GET', 2)",
                ),
                Statement::bare("INSERT INTO requests (id) VALUES ('a')"),
            ])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Transaction(TransactionError::StatementFailed { index: 1, .. })
        ));

        let count = engine.query("SELECT COUNT(*) FROM requests", vec![]).await.unwrap();
        assert_eq!(count.scalar(), Some(&SqlValue::Integer(1)));
        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_no_backends_means_degraded() {
        let engine = engine_over(BackendSet::new()).await;

        assert!(engine.is_degraded());
        assert_eq!(engine.state(), EngineState::Degraded);
        assert_eq!(engine.init_report().attempts, 0);
        // Still migrated and writable
        engine
            .execute(
                "INSERT INTO requests (id, url, method, timestamp) VALUES ('a', 'u', 'GET', 1)",
                vec![],
            )
            .await
            .unwrap();
        assert_eq!(engine.checkpoint().await.unwrap(), CheckpointReport::default());
        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_final() {
        let primary = Arc::new(MemoryBackend::new("primary", 0));
        let engine = engine_over(BackendSet::new().with_shared(primary.clone())).await;
        engine
            .execute(
                "INSERT INTO requests (id, url, method, timestamp) VALUES ('a', 'u', 'GET', 1)",
                vec![],
            )
            .await
            .unwrap();

        engine.close().await.unwrap();
        engine.close().await.unwrap();
        assert_eq!(engine.state(), EngineState::Closed);
        assert!(matches!(
            engine.query("SELECT 1", vec![]).await,
            Err(StoreError::Closed)
        ));

        // The final checkpoint carried the write
        let db = Database::from_bytes(&primary.bytes().unwrap()).unwrap();
        let count = db.query("SELECT COUNT(*) FROM requests", &[]).unwrap();
        assert_eq!(count.scalar(), Some(&SqlValue::Integer(1)));
    }

    #[tokio::test]
    async fn test_subscribe_state_sees_close() {
        let engine = engine_over(BackendSet::new().with(MemoryBackend::new("primary", 0))).await;
        let mut rx = engine.subscribe_state();
        assert_eq!(*rx.borrow_and_update(), EngineState::Ready);

        engine.close().await.unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), EngineState::Closed);
    }
}
