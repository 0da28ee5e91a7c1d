//! Schema migrations
//!
//! Migrations are registered at build time as an ordered list. A migration
//! pass runs in one outer transaction with a savepoint per step, so a failing
//! step leaves both the schema and `schema_versions` exactly where they were
//! before the pass started.
//!
//! Every step must be idempotent (`IF NOT EXISTS`, column checks): running
//! the registry again over a migrated database changes nothing.

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::database::{now_ms, Database};
use crate::error::MigrationError;

/// Tables every handle carries, migrated or not
pub const BASE_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS schema_versions (
        version      INTEGER PRIMARY KEY,
        description  TEXT NOT NULL,
        applied_at   INTEGER NOT NULL,
        status       TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS engine_errors (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        occurred_at  INTEGER NOT NULL,
        category     TEXT NOT NULL,
        message      TEXT NOT NULL,
        context      TEXT
    );
";

/// Status written for every successfully applied step
pub const STATUS_APPLIED: &str = "applied";

pub(crate) fn apply_base_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(BASE_SCHEMA)
}

/// Highest version recorded in `schema_versions`, 0 when empty
pub(crate) fn current_version(conn: &Connection) -> rusqlite::Result<u32> {
    let version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_versions",
        [],
        |row| row.get(0),
    )?;
    Ok(version.max(0) as u32)
}

/// Function applying one migration inside its savepoint
pub type ApplyFn = fn(&Connection) -> rusqlite::Result<()>;

/// A single registered migration step
#[derive(Clone, Copy)]
pub struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub apply: ApplyFn,
}

impl Migration {
    pub const fn new(version: u32, description: &'static str, apply: ApplyFn) -> Self {
        Self {
            version,
            description,
            apply,
        }
    }
}

impl std::fmt::Debug for Migration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migration")
            .field("version", &self.version)
            .field("description", &self.description)
            .finish()
    }
}

/// Audit row for one applied migration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub version: u32,
    pub description: String,
    pub applied_at: i64,
    pub status: String,
}

/// Outcome of a migration pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationReport {
    pub from_version: u32,
    pub to_version: u32,
    pub applied: Vec<u32>,
}

impl MigrationReport {
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty()
    }
}

/// Ordered set of migrations
#[derive(Debug, Clone)]
pub struct MigrationRegistry {
    steps: Vec<Migration>,
}

impl MigrationRegistry {
    /// Build a registry, rejecting unordered or duplicate versions
    pub fn new(steps: Vec<Migration>) -> Result<Self, MigrationError> {
        let mut previous = 0u32;
        for step in &steps {
            if step.version <= previous {
                return Err(MigrationError::InvalidOrder {
                    previous,
                    found: step.version,
                });
            }
            previous = step.version;
        }
        Ok(Self { steps })
    }

    /// The capture schema
    pub fn builtin() -> Self {
        Self {
            steps: builtin().to_vec(),
        }
    }

    /// Registry holding only the steps up to and including `version`
    pub fn up_to(&self, version: u32) -> Self {
        Self {
            steps: self
                .steps
                .iter()
                .copied()
                .filter(|s| s.version <= version)
                .collect(),
        }
    }

    pub fn steps(&self) -> &[Migration] {
        &self.steps
    }

    /// Highest version this registry defines
    pub fn latest_version(&self) -> u32 {
        self.steps.last().map(|s| s.version).unwrap_or(0)
    }

    /// Apply every step newer than the recorded version
    pub fn migrate(&self, db: &mut Database) -> Result<MigrationReport, MigrationError> {
        let conn = db.connection_mut();
        apply_base_schema(conn).map_err(|e| MigrationError::VersionTable(e.to_string()))?;

        let from_version =
            current_version(conn).map_err(|e| MigrationError::VersionTable(e.to_string()))?;

        if from_version > self.latest_version() {
            tracing::warn!(
                "Database records schema version {} beyond the newest known ({}); leaving it as is",
                from_version,
                self.latest_version()
            );
        }

        let pending: Vec<&Migration> = self
            .steps
            .iter()
            .filter(|s| s.version > from_version)
            .collect();

        let mut report = MigrationReport {
            from_version,
            to_version: from_version,
            applied: Vec::new(),
        };
        if pending.is_empty() {
            return Ok(report);
        }

        let mut tx = conn
            .transaction()
            .map_err(|e| MigrationError::VersionTable(e.to_string()))?;

        for step in pending {
            let failed = |reason: String| MigrationError::StepFailed {
                version: step.version,
                description: step.description.to_string(),
                reason,
            };

            let sp = tx.savepoint().map_err(|e| failed(e.to_string()))?;
            (step.apply)(&sp).map_err(|e| failed(e.to_string()))?;
            sp.execute(
                "INSERT INTO schema_versions (version, description, applied_at, status)
                 VALUES (?1, ?2, ?3, ?4)",
                params![step.version, step.description, now_ms(), STATUS_APPLIED],
            )
            .map_err(|e| failed(e.to_string()))?;
            sp.commit().map_err(|e| failed(e.to_string()))?;

            tracing::debug!("Migration {} applied: {}", step.version, step.description);
            report.applied.push(step.version);
            report.to_version = step.version;
        }

        tx.commit().map_err(|e| MigrationError::StepFailed {
            version: report.to_version,
            description: "commit".to_string(),
            reason: e.to_string(),
        })?;

        tracing::info!(
            "Schema migrated from version {} to {}",
            report.from_version,
            report.to_version
        );
        Ok(report)
    }
}

/// All version records, oldest first
pub fn history(db: &Database) -> rusqlite::Result<Vec<VersionRecord>> {
    let mut stmt = db.connection().prepare(
        "SELECT version, description, applied_at, status
         FROM schema_versions ORDER BY version ASC",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(VersionRecord {
            version: row.get(0)?,
            description: row.get(1)?,
            applied_at: row.get(2)?,
            status: row.get(3)?,
        })
    })?;
    rows.collect()
}

/// Whether `table` has a column named `column`
fn has_column(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

fn create_requests(tx: &Connection) -> rusqlite::Result<()> {
    tx.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS requests (
            id           TEXT PRIMARY KEY,
            url          TEXT NOT NULL,
            method       TEXT NOT NULL,
            type         TEXT,
            status       INTEGER,
            status_text  TEXT,
            domain       TEXT,
            path         TEXT,
            start_time   INTEGER,
            end_time     INTEGER,
            duration     REAL,
            size         INTEGER,
            timestamp    INTEGER NOT NULL,
            tab_id       INTEGER,
            error        TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_requests_timestamp
            ON requests(timestamp DESC);
        ",
    )
}

fn create_request_children(tx: &Connection) -> rusqlite::Result<()> {
    tx.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS request_headers (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            request_id  TEXT NOT NULL REFERENCES requests(id) ON DELETE CASCADE,
            direction   TEXT NOT NULL,
            name        TEXT NOT NULL,
            value       TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_headers_request
            ON request_headers(request_id);

        CREATE TABLE IF NOT EXISTS request_timings (
            request_id  TEXT PRIMARY KEY REFERENCES requests(id) ON DELETE CASCADE,
            dns         REAL,
            tcp         REAL,
            ssl         REAL,
            ttfb        REAL,
            download    REAL
        );
        ",
    )
}

fn add_page_url(tx: &Connection) -> rusqlite::Result<()> {
    if !has_column(tx, "requests", "page_url")? {
        tx.execute_batch("ALTER TABLE requests ADD COLUMN page_url TEXT;")?;
    }
    tx.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_requests_domain
             ON requests(domain, timestamp DESC);",
    )
}

fn create_performance_metrics(tx: &Connection) -> rusqlite::Result<()> {
    tx.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS performance_metrics (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            request_id   TEXT REFERENCES requests(id) ON DELETE CASCADE,
            metric       TEXT NOT NULL,
            value        REAL NOT NULL,
            recorded_at  INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_metrics_recorded
            ON performance_metrics(recorded_at DESC);
        ",
    )
}

static BUILTIN: [Migration; 4] = [
    Migration::new(1, "create requests table", create_requests),
    Migration::new(2, "create request headers and timings", create_request_children),
    Migration::new(3, "add page_url column and domain index", add_page_url),
    Migration::new(4, "create performance metrics table", create_performance_metrics),
];

/// The built-in migration chain
pub fn builtin() -> &'static [Migration] {
    &BUILTIN
}
