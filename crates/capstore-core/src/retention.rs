//! Retention and purging
//!
//! Every purge is one queued operation running in one transaction. Child
//! rows (headers, timings, metrics) are deleted before their requests. When
//! a purge removes a large enough share of the rows it saw, a `VACUUM` is
//! queued behind it.

use rusqlite::{params_from_iter, Connection};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::database::{now_ms, Database, SqlValue};
use crate::error::{Result, RetentionError, StoreError};
use crate::events::{EngineEvent, EventBus};
use crate::query::RequestFilter;
use crate::queue::WriteQueue;

/// Limits the retention scheduler enforces. Unset limits are not enforced.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    /// Drop requests older than this
    #[serde(
        rename = "max_age_secs",
        with = "duration_secs",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_age: Option<Duration>,

    /// Keep the used size of the image under this many bytes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_size_bytes: Option<u64>,

    /// Keep at most this many requests
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_rows: Option<u64>,
}

impl RetentionPolicy {
    pub fn is_empty(&self) -> bool {
        self.max_age.is_none() && self.max_size_bytes.is_none() && self.max_rows.is_none()
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_secs))
    }
}

/// Kind of purge, used in reports, events and logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurgeKind {
    Age,
    Size,
    Count,
    Filter,
}

impl PurgeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PurgeKind::Age => "age",
            PurgeKind::Size => "size",
            PurgeKind::Count => "count",
            PurgeKind::Filter => "filter",
        }
    }
}

impl std::fmt::Display for PurgeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What one purge did
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurgeReport {
    pub kind: PurgeKind,
    pub rows_before: u64,
    pub rows_deleted: u64,
    pub batches: u32,
    pub vacuumed: bool,
    /// Bytes released by the vacuum, when one ran
    #[serde(default)]
    pub freed_bytes: u64,
}

impl PurgeReport {
    fn new(kind: PurgeKind, rows_before: u64) -> Self {
        Self {
            kind,
            rows_before,
            rows_deleted: 0,
            batches: 0,
            vacuumed: false,
            freed_bytes: 0,
        }
    }

    /// Share of the rows seen that were removed
    pub fn removed_fraction(&self) -> f64 {
        if self.rows_before == 0 {
            0.0
        } else {
            self.rows_deleted as f64 / self.rows_before as f64
        }
    }
}

/// Batch and vacuum settings taken from [`EngineConfig`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PurgeSettings {
    pub batch_size: u32,
    pub max_iterations: u32,
    pub vacuum_threshold: f64,
}

impl From<&EngineConfig> for PurgeSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            batch_size: config.purge_batch_size,
            max_iterations: config.max_purge_iterations,
            vacuum_threshold: config.vacuum_threshold,
        }
    }
}

impl Default for PurgeSettings {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Synchronous purge bodies (run inside queued operations)
// ─────────────────────────────────────────────────────────────────────────────

const CHILD_TABLES: [&str; 3] = ["request_headers", "request_timings", "performance_metrics"];

fn count_requests(conn: &Connection) -> rusqlite::Result<u64> {
    let n: i64 = conn.query_row("SELECT COUNT(*) FROM requests", [], |row| row.get(0))?;
    Ok(n.max(0) as u64)
}

/// Delete requests matching `predicate` together with their children
fn delete_matching(
    conn: &Connection,
    predicate: &str,
    params: &[SqlValue],
) -> rusqlite::Result<u64> {
    for table in CHILD_TABLES {
        conn.execute(
            &format!(
                "DELETE FROM {table} WHERE request_id IN (SELECT id FROM requests WHERE {predicate})"
            ),
            params_from_iter(params.iter()),
        )?;
    }
    let deleted = conn.execute(
        &format!("DELETE FROM requests WHERE {predicate}"),
        params_from_iter(params.iter()),
    )?;
    Ok(deleted as u64)
}

fn purge_with(
    db: &mut Database,
    kind: PurgeKind,
    predicate: &str,
    params: &[SqlValue],
) -> rusqlite::Result<PurgeReport> {
    let tx = db.connection_mut().transaction()?;
    let mut report = PurgeReport::new(kind, count_requests(&tx)?);
    report.rows_deleted = delete_matching(&tx, predicate, params)?;
    report.batches = 1;
    tx.commit()?;
    Ok(report)
}

pub(crate) fn purge_old_data(db: &mut Database, cutoff_ms: i64) -> rusqlite::Result<PurgeReport> {
    purge_with(
        db,
        PurgeKind::Age,
        "timestamp < ?1",
        &[SqlValue::Integer(cutoff_ms)],
    )
}

pub(crate) fn purge_by_count(db: &mut Database, max_rows: u64) -> rusqlite::Result<PurgeReport> {
    purge_with(
        db,
        PurgeKind::Count,
        "id IN (SELECT id FROM requests ORDER BY timestamp DESC, id DESC LIMIT -1 OFFSET ?1)",
        &[SqlValue::Integer(max_rows.min(i64::MAX as u64) as i64)],
    )
}

pub(crate) fn purge_by_filter(
    db: &mut Database,
    filter: &RequestFilter,
) -> rusqlite::Result<PurgeReport> {
    let clause = filter.predicate();
    purge_with(db, PurgeKind::Filter, &clause.sql, &clause.params)
}

pub(crate) fn purge_by_size(
    db: &mut Database,
    max_bytes: u64,
    settings: &PurgeSettings,
) -> rusqlite::Result<PurgeReport> {
    let before = db.size_estimate()?.used_bytes();
    let tx = db.connection_mut().transaction()?;
    let mut report = PurgeReport::new(PurgeKind::Size, count_requests(&tx)?);

    let mut used = before;
    while used > max_bytes && report.batches < settings.max_iterations {
        let deleted = delete_matching(
            &tx,
            "id IN (SELECT id FROM requests ORDER BY timestamp ASC, id ASC LIMIT ?1)",
            &[SqlValue::Integer(i64::from(settings.batch_size))],
        )?;
        report.batches += 1;
        report.rows_deleted += deleted;
        if deleted == 0 {
            break;
        }
        used = used_bytes(&tx)?;
    }
    tx.commit()?;

    if used > max_bytes {
        tracing::warn!(
            "Size purge stopped after {} batches with {} bytes used (budget {})",
            report.batches,
            used,
            max_bytes
        );
    }

    // Freed pages stay in the exported image until the file is rewritten
    if report.rows_deleted > 0 && db.size_estimate()?.image_bytes() > max_bytes {
        report.freed_bytes = vacuum(db)?;
        report.vacuumed = true;
    }
    Ok(report)
}

fn used_bytes(conn: &Connection) -> rusqlite::Result<u64> {
    let pragma = |name: &str| -> rusqlite::Result<u64> {
        let v: i64 = conn.query_row(&format!("PRAGMA {}", name), [], |row| row.get(0))?;
        Ok(v.max(0) as u64)
    };
    let page_size = pragma("page_size")?;
    Ok(page_size * pragma("page_count")?.saturating_sub(pragma("freelist_count")?))
}

/// Compact the image, returning the bytes released
pub(crate) fn vacuum(db: &mut Database) -> rusqlite::Result<u64> {
    let before = db.size_estimate()?.image_bytes();
    db.vacuum()?;
    let after = db.size_estimate()?.image_bytes();
    Ok(before.saturating_sub(after))
}

// ─────────────────────────────────────────────────────────────────────────────
// Manager
// ─────────────────────────────────────────────────────────────────────────────

/// Runs purges through the write queue and reports them on the event bus
#[derive(Debug, Clone)]
pub struct RetentionManager {
    queue: Arc<WriteQueue>,
    events: EventBus,
    settings: PurgeSettings,
}

impl RetentionManager {
    pub fn new(queue: Arc<WriteQueue>, events: EventBus, settings: PurgeSettings) -> Self {
        Self {
            queue,
            events,
            settings,
        }
    }

    pub fn settings(&self) -> &PurgeSettings {
        &self.settings
    }

    /// Delete requests captured before `cutoff_ms` (epoch milliseconds)
    pub async fn purge_old_data(&self, cutoff_ms: i64) -> Result<PurgeReport> {
        self.run(PurgeKind::Age, move |db, _| purge_old_data(db, cutoff_ms))
            .await
    }

    /// Delete the oldest requests until the used size fits `max_bytes`
    pub async fn purge_by_size(&self, max_bytes: u64) -> Result<PurgeReport> {
        self.run(PurgeKind::Size, move |db, settings| {
            purge_by_size(db, max_bytes, settings)
        })
        .await
    }

    /// Keep only the newest `max_rows` requests
    pub async fn purge_by_count(&self, max_rows: u64) -> Result<PurgeReport> {
        self.run(PurgeKind::Count, move |db, _| purge_by_count(db, max_rows))
            .await
    }

    /// Delete requests matching `filter`; pagination fields are ignored
    pub async fn purge_by_custom_filter(&self, filter: &RequestFilter) -> Result<PurgeReport> {
        if filter.is_unconstrained() {
            return Err(RetentionError::EmptyFilter.into());
        }
        let filter = filter.clone();
        self.run(PurgeKind::Filter, move |db, _| purge_by_filter(db, &filter))
            .await
    }

    /// Run every purge the policy sets: age, then count, then size
    pub async fn enforce(&self, policy: &RetentionPolicy) -> Result<Vec<PurgeReport>> {
        let mut reports = Vec::new();
        if let Some(max_age) = policy.max_age {
            let cutoff = now_ms() - i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
            reports.push(self.purge_old_data(cutoff).await?);
        }
        if let Some(max_rows) = policy.max_rows {
            reports.push(self.purge_by_count(max_rows).await?);
        }
        if let Some(max_bytes) = policy.max_size_bytes {
            reports.push(self.purge_by_size(max_bytes).await?);
        }
        Ok(reports)
    }

    async fn run<F>(&self, kind: PurgeKind, op: F) -> Result<PurgeReport>
    where
        F: FnOnce(&mut Database, &PurgeSettings) -> rusqlite::Result<PurgeReport> + Send + 'static,
    {
        let settings = self.settings;
        let outcome = self
            .queue
            .submit(move |db| {
                op(db, &settings).map_err(|e| {
                    let err = RetentionError::PurgeFailed {
                        purge: kind.to_string(),
                        reason: e.to_string(),
                    };
                    db.log_error("retention", &err.to_string(), None);
                    StoreError::from(err)
                })
            })
            .await;

        let mut report = match outcome {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!("{} purge failed: {}", kind, e);
                self.events.publish(EngineEvent::Error {
                    category: e.category().to_string(),
                    message: e.to_string(),
                });
                return Err(e);
            }
        };

        tracing::debug!(
            "{} purge removed {}/{} rows in {} batches",
            kind,
            report.rows_deleted,
            report.rows_before,
            report.batches
        );
        if report.rows_deleted > 0 {
            self.events.publish(EngineEvent::Purged {
                purge: kind.to_string(),
                rows_deleted: report.rows_deleted,
            });
        }

        if report.vacuumed {
            self.events.publish(EngineEvent::Vacuumed {
                freed_bytes: report.freed_bytes,
            });
        } else if report.rows_deleted > 0
            && report.removed_fraction() >= settings.vacuum_threshold
        {
            if let Ok(freed_bytes) = self.vacuum().await {
                report.vacuumed = true;
                report.freed_bytes = freed_bytes;
            }
        }
        Ok(report)
    }

    /// Queue a `VACUUM` and report the bytes it released
    pub async fn vacuum(&self) -> Result<u64> {
        let freed = self
            .queue
            .submit(|db| vacuum(db).map_err(|e| RetentionError::Vacuum(e.to_string()).into()))
            .await;
        match freed {
            Ok(freed_bytes) => {
                tracing::debug!("Vacuum released {} bytes", freed_bytes);
                self.events.publish(EngineEvent::Vacuumed { freed_bytes });
                Ok(freed_bytes)
            }
            Err(e) => {
                tracing::warn!("Vacuum failed: {}", e);
                Err(e)
            }
        }
    }

    /// Enforce `policy` every `period` until `shutdown` flips to true
    pub fn spawn_scheduler(
        &self,
        policy: RetentionPolicy,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match manager.enforce(&policy).await {
                            Ok(reports) => {
                                let removed: u64 = reports.iter().map(|r| r.rows_deleted).sum();
                                tracing::debug!("Retention cycle removed {} rows", removed);
                            }
                            Err(e) => tracing::warn!("Retention cycle failed, retrying next cycle: {}", e),
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("Retention scheduler stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::MigrationRegistry;
    use crate::queue::SharedDatabase;

    fn migrated() -> Database {
        let mut db = Database::fresh().unwrap();
        MigrationRegistry::builtin().migrate(&mut db).unwrap();
        db
    }

    fn insert(db: &mut Database, id: &str, timestamp: i64, domain: &str, payload: &str) {
        db.execute(
            "INSERT INTO requests (id, url, method, domain, timestamp, error)
             VALUES (?1, ?2, 'GET', ?3, ?4, ?5)",
            &[
                SqlValue::Text(id.into()),
                SqlValue::Text(format!("https://{domain}/{id}")),
                SqlValue::Text(domain.into()),
                SqlValue::Integer(timestamp),
                SqlValue::Text(payload.into()),
            ],
        )
        .unwrap();
        db.execute(
            "INSERT INTO request_headers (request_id, direction, name, value)
             VALUES (?1, 'request', 'accept', '*/*')",
            &[SqlValue::Text(id.into())],
        )
        .unwrap();
    }

    fn count(db: &Database, sql: &str) -> i64 {
        match db.query(sql, &[]).unwrap().scalar() {
            Some(SqlValue::Integer(n)) => *n,
            _ => -1,
        }
    }

    #[test]
    fn test_count_purge_keeps_newest() {
        let mut db = migrated();
        for i in 0..150 {
            insert(&mut db, &format!("r{i:03}"), 1_000 + i, "a.test", "");
        }

        let report = purge_by_count(&mut db, 100).unwrap();
        assert_eq!(report.rows_before, 150);
        assert_eq!(report.rows_deleted, 50);

        assert_eq!(count(&db, "SELECT COUNT(*) FROM requests"), 100);
        assert_eq!(count(&db, "SELECT MIN(timestamp) FROM requests"), 1_050);
        // Orphaned headers went with their requests
        assert_eq!(count(&db, "SELECT COUNT(*) FROM request_headers"), 100);
    }

    #[test]
    fn test_count_purge_breaks_timestamp_ties_by_id() {
        let mut db = migrated();
        for id in ["a", "b", "c"] {
            insert(&mut db, id, 5_000, "a.test", "");
        }

        purge_by_count(&mut db, 2).unwrap();
        let rs = db.query("SELECT id FROM requests ORDER BY id", &[]).unwrap();
        let ids: Vec<_> = rs.rows.iter().map(|r| r[0].clone()).collect();
        assert_eq!(ids, vec![SqlValue::Text("b".into()), SqlValue::Text("c".into())]);
    }

    #[test]
    fn test_age_purge_uses_cutoff() {
        let mut db = migrated();
        insert(&mut db, "old", 100, "a.test", "");
        insert(&mut db, "new", 900, "a.test", "");

        let report = purge_old_data(&mut db, 500).unwrap();
        assert_eq!(report.rows_deleted, 1);
        assert_eq!(count(&db, "SELECT COUNT(*) FROM requests WHERE id = 'new'"), 1);
    }

    #[test]
    fn test_filter_purge_matches_read_predicate() {
        let mut db = migrated();
        insert(&mut db, "1", 100, "keep.test", "");
        insert(&mut db, "2", 200, "drop.test", "");
        insert(&mut db, "3", 300, "drop.test", "");

        let filter = RequestFilter {
            domain: Some("drop.test".into()),
            ..RequestFilter::default()
        };
        let report = purge_by_filter(&mut db, &filter).unwrap();
        assert_eq!(report.rows_deleted, 2);
        assert_eq!(count(&db, "SELECT COUNT(*) FROM requests"), 1);
    }

    #[test]
    fn test_size_purge_drops_oldest_until_under_budget() {
        let mut db = migrated();
        let payload = "x".repeat(4096);
        for i in 0..200 {
            insert(&mut db, &format!("r{i:03}"), i, "a.test", &payload);
        }
        let budget = 256 * 1024;
        assert!(db.size_estimate().unwrap().used_bytes() > budget);

        let settings = PurgeSettings {
            batch_size: 10,
            ..PurgeSettings::default()
        };
        let report = purge_by_size(&mut db, budget, &settings).unwrap();

        assert!(report.rows_deleted > 0);
        assert!(db.size_estimate().unwrap().used_bytes() <= budget);
        let remaining = count(&db, "SELECT COUNT(*) FROM requests");
        assert!(remaining > 0);
        // Survivors are the newest rows
        assert_eq!(
            count(&db, "SELECT MIN(timestamp) FROM requests"),
            200 - remaining
        );
    }

    #[test]
    fn test_size_purge_respects_iteration_cap() {
        let mut db = migrated();
        let payload = "x".repeat(4096);
        for i in 0..50 {
            insert(&mut db, &format!("r{i:03}"), i, "a.test", &payload);
        }

        let settings = PurgeSettings {
            batch_size: 1,
            max_iterations: 3,
            vacuum_threshold: 0.25,
        };
        let report = purge_by_size(&mut db, 0, &settings).unwrap();
        assert_eq!(report.batches, 3);
        assert_eq!(report.rows_deleted, 3);
    }

    #[test]
    fn test_policy_serializes_age_in_seconds() {
        let policy = RetentionPolicy {
            max_age: Some(Duration::from_secs(3600)),
            max_rows: Some(10),
            ..RetentionPolicy::default()
        };
        let json = serde_json::to_value(&policy).unwrap();
        assert_eq!(json["max_age_secs"], 3600);
        assert!(json.get("max_size_bytes").is_none());

        let back: RetentionPolicy = serde_json::from_value(json).unwrap();
        assert_eq!(back, policy);
        assert!(RetentionPolicy::default().is_empty());
    }

    fn manager(db: Database, events: &EventBus) -> (RetentionManager, SharedDatabase) {
        let shared: SharedDatabase = Arc::new(parking_lot::Mutex::new(Some(db)));
        let queue = Arc::new(WriteQueue::start(shared.clone()));
        (
            RetentionManager::new(queue, events.clone(), PurgeSettings::default()),
            shared,
        )
    }

    #[tokio::test]
    async fn test_manager_rejects_empty_filter() {
        let events = EventBus::default();
        let (manager, _db) = manager(migrated(), &events);

        let err = manager
            .purge_by_custom_filter(&RequestFilter::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Retention(RetentionError::EmptyFilter)));
    }

    #[tokio::test]
    async fn test_large_purge_queues_vacuum() {
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let mut db = migrated();
        for i in 0..20 {
            insert(&mut db, &format!("r{i:02}"), i, "a.test", &"y".repeat(2048));
        }
        let (manager, _db) = manager(db, &events);

        let report = manager.purge_by_count(5).await.unwrap();
        assert_eq!(report.rows_deleted, 15);
        assert!(report.vacuumed);

        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.push(event.name());
        }
        assert_eq!(names, vec!["purged", "vacuumed"]);
    }

    #[tokio::test]
    async fn test_enforce_runs_only_configured_limits() {
        let events = EventBus::default();
        let mut db = migrated();
        for i in 0..30 {
            insert(&mut db, &format!("r{i:02}"), now_ms() + i, "a.test", "");
        }
        let (manager, shared) = manager(db, &events);

        let reports = manager
            .enforce(&RetentionPolicy {
                max_rows: Some(10),
                ..RetentionPolicy::default()
            })
            .await
            .unwrap();

        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].kind, PurgeKind::Count);
        let guard = shared.lock();
        assert_eq!(count(guard.as_ref().unwrap(), "SELECT COUNT(*) FROM requests"), 10);
    }

    #[tokio::test]
    async fn test_failed_purge_is_logged() {
        let events = EventBus::default();
        // Base schema only: no requests table to purge
        let (manager, shared) = manager(Database::fresh().unwrap(), &events);

        let err = manager.purge_old_data(0).await.unwrap_err();
        assert_eq!(err.category(), "retention");

        let guard = shared.lock();
        assert_eq!(
            count(
                guard.as_ref().unwrap(),
                "SELECT COUNT(*) FROM engine_errors WHERE category = 'retention'"
            ),
            1
        );
    }

    async fn next_purge(rx: &mut tokio::sync::broadcast::Receiver<EngineEvent>) -> u64 {
        loop {
            if let EngineEvent::Purged { rows_deleted, .. } = rx.recv().await.unwrap() {
                return rows_deleted;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_purges_once_the_period_elapses() {
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let mut db = migrated();
        for i in 0..30 {
            insert(&mut db, &format!("r{i:02}"), now_ms() + i, "a.test", "");
        }
        let (manager, shared) = manager(db, &events);
        let (stop, shutdown) = watch::channel(false);
        let policy = RetentionPolicy {
            max_rows: Some(10),
            ..RetentionPolicy::default()
        };
        let started = tokio::time::Instant::now();
        let task = manager.spawn_scheduler(policy, Duration::from_secs(60), shutdown);

        // Nothing runs before the first period
        tokio::time::sleep(Duration::from_secs(30)).await;
        {
            let guard = shared.lock();
            assert_eq!(count(guard.as_ref().unwrap(), "SELECT COUNT(*) FROM requests"), 30);
        }

        assert_eq!(next_purge(&mut rx).await, 20);
        assert!(started.elapsed() >= Duration::from_secs(60));
        {
            let guard = shared.lock();
            assert_eq!(count(guard.as_ref().unwrap(), "SELECT COUNT(*) FROM requests"), 10);
        }

        stop.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_retries_after_a_failed_cycle() {
        let events = EventBus::default();
        let mut rx = events.subscribe();
        // Base schema only: the first cycle has no requests table
        let (manager, shared) = manager(Database::fresh().unwrap(), &events);
        let (stop, shutdown) = watch::channel(false);
        let policy = RetentionPolicy {
            max_rows: Some(5),
            ..RetentionPolicy::default()
        };
        let task = manager.spawn_scheduler(policy, Duration::from_secs(60), shutdown);

        match rx.recv().await.unwrap() {
            EngineEvent::Error { category, .. } => assert_eq!(category, "retention"),
            other => panic!("expected a failed cycle, got {other:?}"),
        }
        assert!(!task.is_finished());

        {
            let mut guard = shared.lock();
            let db = guard.as_mut().unwrap();
            MigrationRegistry::builtin().migrate(db).unwrap();
            for i in 0..12 {
                insert(db, &format!("r{i:02}"), now_ms() + i, "a.test", "");
            }
        }

        assert_eq!(next_purge(&mut rx).await, 7);
        {
            let guard = shared.lock();
            let db = guard.as_ref().unwrap();
            assert_eq!(count(db, "SELECT COUNT(*) FROM requests"), 5);
            assert_eq!(
                count(db, "SELECT COUNT(*) FROM engine_errors WHERE category = 'retention'"),
                1
            );
        }

        stop.send(true).unwrap();
        task.await.unwrap();
    }
}
