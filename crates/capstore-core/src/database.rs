//! The live SQLite handle
//!
//! [`Database`] wraps a single in-memory `rusqlite::Connection`. It can be
//! created empty (base schema only) or opened from a byte image produced by
//! [`Database::export`], which is what backends store.

use std::ptr::NonNull;

use rusqlite::serialize::OwnedData;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, DatabaseName};
use serde::{Deserialize, Serialize};

use crate::error::{QueryError, TransactionError};
use crate::migration;

/// Re-exported SQL value type used for parameters and result cells
pub type SqlValue = Value;

/// Milliseconds since the Unix epoch
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// One parameterized SQL statement
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl Statement {
    pub fn new(sql: impl Into<String>, params: Vec<SqlValue>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }

    /// A statement without parameters
    pub fn bare(sql: impl Into<String>) -> Self {
        Self::new(sql, Vec::new())
    }
}

/// Rows returned by a statement, plus the number of rows it changed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
    pub changes: u64,
}

impl ResultSet {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// First column of the first row, if any
    pub fn scalar(&self) -> Option<&SqlValue> {
        self.rows.first().and_then(|row| row.first())
    }

    /// Rows as JSON objects keyed by column name
    pub fn to_json(&self) -> serde_json::Value {
        let rows = self
            .rows
            .iter()
            .map(|row| {
                let object = self
                    .columns
                    .iter()
                    .zip(row.iter())
                    .map(|(name, value)| (name.clone(), value_to_json(value)))
                    .collect::<serde_json::Map<_, _>>();
                serde_json::Value::Object(object)
            })
            .collect();
        serde_json::Value::Array(rows)
    }
}

/// Convert a SQL value into JSON. Blobs become hex strings.
pub fn value_to_json(value: &SqlValue) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Integer(i) => serde_json::Value::from(*i),
        Value::Real(f) => serde_json::Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::Text(s) => serde_json::Value::String(s.clone()),
        Value::Blob(b) => serde_json::Value::String(hex::encode(b)),
    }
}

/// Size figures for the live image
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeEstimate {
    pub page_size: u64,
    pub page_count: u64,
    pub freelist_count: u64,
}

impl SizeEstimate {
    /// Bytes a full export would take
    pub fn image_bytes(&self) -> u64 {
        self.page_size * self.page_count
    }

    /// Bytes actually holding data (what a compacted export would take)
    pub fn used_bytes(&self) -> u64 {
        self.page_size * self.page_count.saturating_sub(self.freelist_count)
    }
}

/// The single live database handle
#[derive(Debug)]
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Create an empty in-memory database carrying the base schema
    pub fn fresh() -> rusqlite::Result<Self> {
        let conn = Connection::open_in_memory()?;
        configure(&conn)?;
        migration::apply_base_schema(&conn)?;
        Ok(Self { conn })
    }

    /// Open a database from an exported byte image.
    ///
    /// The image is integrity-checked before it is handed back, so garbage
    /// bytes fail here instead of on the first query.
    pub fn from_bytes(bytes: &[u8]) -> rusqlite::Result<Self> {
        if bytes.is_empty() {
            return Err(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_NOTADB),
                Some("empty database image".to_string()),
            ));
        }

        let mut conn = Connection::open_in_memory()?;
        conn.deserialize(DatabaseName::Main, owned_image(bytes)?, false)?;
        configure(&conn)?;

        let verdict: String = conn.query_row("PRAGMA quick_check", [], |row| row.get(0))?;
        if verdict != "ok" {
            return Err(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CORRUPT),
                Some(verdict),
            ));
        }
        Ok(Self { conn })
    }

    /// Export the native byte image
    pub fn export(&self) -> rusqlite::Result<Vec<u8>> {
        let data = self.conn.serialize(DatabaseName::Main)?;
        Ok(data.to_vec())
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Run a read-only statement
    pub fn query(&self, sql: &str, params: &[SqlValue]) -> Result<ResultSet, QueryError> {
        let mut stmt = self.conn.prepare(sql)?;
        if !stmt.readonly() {
            return Err(QueryError::NotReadOnly(sql.to_string()));
        }
        collect_rows(&mut stmt, params)
    }

    /// Run any single statement
    pub fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<ResultSet, QueryError> {
        let mut stmt = self.conn.prepare(sql)?;
        let readonly = stmt.readonly();
        let mut result = collect_rows(&mut stmt, params)?;
        drop(stmt);
        if !readonly {
            result.changes = self.conn.changes() as u64;
        }
        Ok(result)
    }

    /// Run statements all-or-nothing
    pub fn execute_transaction(&mut self, statements: &[Statement]) -> Result<u64, TransactionError> {
        let tx = self
            .conn
            .transaction()
            .map_err(|e| TransactionError::Begin(e.to_string()))?;

        let mut changes = 0u64;
        for (index, statement) in statements.iter().enumerate() {
            let outcome = tx.prepare(&statement.sql).and_then(|mut stmt| {
                let readonly = stmt.readonly();
                let mut rows = stmt.query(params_from_iter(statement.params.iter()))?;
                while rows.next()?.is_some() {}
                Ok(readonly)
            });
            match outcome {
                Ok(false) => changes += tx.changes() as u64,
                Ok(true) => {}
                Err(e) => {
                    // Dropping `tx` rolls everything back
                    return Err(TransactionError::StatementFailed {
                        index,
                        reason: e.to_string(),
                    });
                }
            }
        }

        tx.commit()
            .map_err(|e| TransactionError::Commit(e.to_string()))?;
        Ok(changes)
    }

    /// Page accounting for the live image
    pub fn size_estimate(&self) -> rusqlite::Result<SizeEstimate> {
        let pragma = |name: &str| -> rusqlite::Result<u64> {
            let v: i64 = self
                .conn
                .query_row(&format!("PRAGMA {}", name), [], |row| row.get(0))?;
            Ok(v.max(0) as u64)
        };
        Ok(SizeEstimate {
            page_size: pragma("page_size")?,
            page_count: pragma("page_count")?,
            freelist_count: pragma("freelist_count")?,
        })
    }

    /// Rewrite the image, releasing free pages
    pub(crate) fn vacuum(&mut self) -> rusqlite::Result<()> {
        self.conn.execute_batch("VACUUM")
    }

    /// Highest recorded schema version, 0 when none
    pub fn schema_version(&self) -> rusqlite::Result<u32> {
        migration::current_version(&self.conn)
    }

    /// Record an engine-level failure in `engine_errors`. Best effort.
    pub(crate) fn log_error(&self, category: &str, message: &str, context: Option<&str>) {
        let outcome = self.conn.execute(
            "INSERT INTO engine_errors (occurred_at, category, message, context)
             VALUES (?1, ?2, ?3, ?4)",
            params![now_ms(), category, message, context],
        );
        if let Err(e) = outcome {
            tracing::debug!("engine_errors insert skipped: {}", e);
        }
    }

    /// Refuse writes on this connection until the returned guard drops
    pub(crate) fn read_only(&self) -> rusqlite::Result<ReadOnly<'_>> {
        self.conn.execute_batch("PRAGMA query_only = ON")?;
        Ok(ReadOnly { db: self })
    }

    /// Close the connection, surfacing any error SQLite reports
    pub fn close(self) -> rusqlite::Result<()> {
        self.conn.close().map_err(|(_, e)| e)
    }
}

/// Borrow of the handle with `query_only` set
pub(crate) struct ReadOnly<'a> {
    db: &'a Database,
}

impl std::ops::Deref for ReadOnly<'_> {
    type Target = Database;

    fn deref(&self) -> &Database {
        self.db
    }
}

impl Drop for ReadOnly<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.db.conn.execute_batch("PRAGMA query_only = OFF") {
            tracing::error!("Could not leave query_only mode: {}", e);
        }
    }
}

fn configure(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")
}

fn collect_rows(
    stmt: &mut rusqlite::Statement<'_>,
    params: &[SqlValue],
) -> Result<ResultSet, QueryError> {
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let width = columns.len();

    let mut rows = stmt.query(params_from_iter(params.iter()))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(width);
        for i in 0..width {
            values.push(row.get::<_, Value>(i)?);
        }
        out.push(values);
    }

    Ok(ResultSet {
        columns,
        rows: out,
        changes: 0,
    })
}

/// Copy `bytes` into an `sqlite3_malloc` buffer so SQLite can own it.
#[allow(unsafe_code)]
fn owned_image(bytes: &[u8]) -> rusqlite::Result<OwnedData> {
    let len = bytes.len();
    // SAFETY: the buffer comes from sqlite3_malloc64 with exactly `len` bytes,
    // is fully initialised by the copy, and ownership moves into OwnedData,
    // which hands it to sqlite3_deserialize (freed by SQLite on close).
    unsafe {
        let raw = rusqlite::ffi::sqlite3_malloc64(len as u64) as *mut u8;
        let ptr = NonNull::new(raw).ok_or_else(|| {
            rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_NOMEM),
                None,
            )
        })?;
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.as_ptr(), len);
        Ok(OwnedData::from_raw_nonnull(ptr, len))
    }
}
