//! Query and export façade
//!
//! Typed access to captured requests on top of the engine. Reads go straight
//! to the live handle; anything that writes is queued.
//!
//! ```text
//!   RequestFilter ──► FilterClause { sql, params }
//!                          │
//!            ┌─────────────┼──────────────┐
//!            ▼             ▼              ▼
//!       data query    count query    purge predicate
//! ```

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::database::{now_ms, Database, SizeEstimate, SqlValue};
use crate::engine::StorageEngine;
use crate::error::{BackendError, QueryError, Result};
use crate::events::EngineEvent;

/// Default page size for [`RequestFilter`]
pub const DEFAULT_PAGE_LIMIT: u32 = 100;

const REQUEST_COLUMNS: &str = "id, url, method, type, status, status_text, domain, path, \
     start_time, end_time, duration, size, timestamp, tab_id, error, page_url";

// ─────────────────────────────────────────────────────────────────────────────
// Models
// ─────────────────────────────────────────────────────────────────────────────

/// Which side of the exchange a header belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeaderDirection {
    Request,
    Response,
}

impl HeaderDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            HeaderDirection::Request => "request",
            HeaderDirection::Response => "response",
        }
    }
}

impl FromStr for HeaderDirection {
    type Err = QueryError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "request" => Ok(HeaderDirection::Request),
            "response" => Ok(HeaderDirection::Response),
            other => Err(QueryError::Sql(format!("unknown header direction '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestHeader {
    pub direction: HeaderDirection,
    pub name: String,
    pub value: Option<String>,
}

/// Phase timings in milliseconds
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestTiming {
    pub dns: Option<f64>,
    pub tcp: Option<f64>,
    pub ssl: Option<f64>,
    pub ttfb: Option<f64>,
    pub download: Option<f64>,
}

/// A captured HTTP request with its headers and timings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedRequest {
    pub id: String,
    pub url: String,
    pub method: String,
    #[serde(rename = "type")]
    pub request_type: Option<String>,
    pub status: Option<i64>,
    pub status_text: Option<String>,
    pub domain: Option<String>,
    pub path: Option<String>,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub duration: Option<f64>,
    pub size: Option<i64>,
    /// Capture time, epoch milliseconds
    pub timestamp: i64,
    pub tab_id: Option<i64>,
    pub error: Option<String>,
    pub page_url: Option<String>,
    #[serde(default)]
    pub headers: Vec<RequestHeader>,
    #[serde(default)]
    pub timings: Option<RequestTiming>,
}

impl CapturedRequest {
    /// New request captured now, with domain and path taken from `url`
    pub fn new(url: impl Into<String>, method: impl Into<String>) -> Self {
        let url = url.into();
        let parsed = url::Url::parse(&url).ok();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            domain: parsed
                .as_ref()
                .and_then(|u| u.host_str().map(str::to_string)),
            path: parsed.as_ref().map(|u| u.path().to_string()),
            url,
            method: method.into(),
            request_type: None,
            status: None,
            status_text: None,
            start_time: None,
            end_time: None,
            duration: None,
            size: None,
            timestamp: now_ms(),
            tab_id: None,
            error: None,
            page_url: None,
            headers: Vec::new(),
            timings: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_type(mut self, request_type: impl Into<String>) -> Self {
        self.request_type = Some(request_type.into());
        self
    }

    pub fn with_status(mut self, status: i64, status_text: impl Into<String>) -> Self {
        self.status = Some(status);
        self.status_text = Some(status_text.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_header(
        mut self,
        direction: HeaderDirection,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.headers.push(RequestHeader {
            direction,
            name: name.into(),
            value: Some(value.into()),
        });
        self
    }

    pub fn with_timings(mut self, timings: RequestTiming) -> Self {
        self.timings = Some(timings);
        self
    }
}

/// Fields set once a request completes. Unset fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestUpdate {
    pub status: Option<i64>,
    pub status_text: Option<String>,
    pub end_time: Option<i64>,
    pub duration: Option<f64>,
    pub size: Option<i64>,
    pub error: Option<String>,
    pub timings: Option<RequestTiming>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetric {
    pub request_id: Option<String>,
    pub metric: String,
    pub value: f64,
    pub recorded_at: i64,
}

impl PerformanceMetric {
    pub fn new(metric: impl Into<String>, value: f64) -> Self {
        Self {
            request_id: None,
            metric: metric.into(),
            value,
            recorded_at: now_ms(),
        }
    }

    pub fn for_request(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Filters
// ─────────────────────────────────────────────────────────────────────────────

/// Request selection plus pagination (1-based `page`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestFilter {
    pub domain: Option<String>,
    pub request_type: Option<String>,
    pub status: Option<i64>,
    pub method: Option<String>,
    pub url_contains: Option<String>,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub page: u32,
    pub limit: u32,
}

impl Default for RequestFilter {
    fn default() -> Self {
        Self {
            domain: None,
            request_type: None,
            status: None,
            method: None,
            url_contains: None,
            start_time: None,
            end_time: None,
            page: 1,
            limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

/// A compiled predicate with positional parameters `?1..?n`
#[derive(Debug, Clone, PartialEq)]
pub struct FilterClause {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl FilterClause {
    /// `" WHERE <sql>"`, or nothing for an unconstrained clause
    pub fn where_sql(&self) -> String {
        if self.params.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.sql)
        }
    }
}

impl RequestFilter {
    pub fn for_domain(domain: impl Into<String>) -> Self {
        Self {
            domain: Some(domain.into()),
            ..Self::default()
        }
    }

    /// True when no column is constrained (pagination aside)
    pub fn is_unconstrained(&self) -> bool {
        self.predicate().params.is_empty()
    }

    /// Compile the column constraints into one predicate
    pub fn predicate(&self) -> FilterClause {
        let mut conditions = Vec::new();
        let mut params = Vec::new();
        let mut push = |condition: &str, value: SqlValue| {
            params.push(value);
            conditions.push(condition.replace('?', &format!("?{}", params.len())));
        };

        if let Some(domain) = &self.domain {
            push("domain = ?", SqlValue::Text(domain.clone()));
        }
        if let Some(request_type) = &self.request_type {
            push("type = ?", SqlValue::Text(request_type.clone()));
        }
        if let Some(status) = self.status {
            push("status = ?", SqlValue::Integer(status));
        }
        if let Some(method) = &self.method {
            push("method = ? COLLATE NOCASE", SqlValue::Text(method.clone()));
        }
        if let Some(fragment) = &self.url_contains {
            push(
                "url LIKE ? ESCAPE '\\'",
                SqlValue::Text(format!("%{}%", escape_like(fragment))),
            );
        }
        if let Some(start) = self.start_time {
            push("timestamp >= ?", SqlValue::Integer(start));
        }
        if let Some(end) = self.end_time {
            push("timestamp <= ?", SqlValue::Integer(end));
        }

        let sql = if conditions.is_empty() {
            "1 = 1".to_string()
        } else {
            conditions.join(" AND ")
        };
        FilterClause { sql, params }
    }

    fn validate_page(&self) -> std::result::Result<(), QueryError> {
        if self.page == 0 {
            return Err(QueryError::InvalidFilter("page is 1-based".into()));
        }
        if self.limit == 0 {
            return Err(QueryError::InvalidFilter("limit must be > 0".into()));
        }
        Ok(())
    }
}

fn escape_like(fragment: &str) -> String {
    let mut out = String::with_capacity(fragment.len());
    for c in fragment.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// One page of results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub rows: Vec<T>,
    pub total_count: u64,
    pub page: u32,
    pub limit: u32,
}

impl<T> Page<T> {
    pub fn total_pages(&self) -> u64 {
        self.total_count.div_ceil(u64::from(self.limit.max(1)))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Export
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Json,
    Csv,
    Sqlite,
}

impl FromStr for ExportFormat {
    type Err = QueryError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            "sqlite" | "db" => Ok(ExportFormat::Sqlite),
            other => Err(QueryError::InvalidFilter(format!("unknown export format '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportSpec {
    pub format: ExportFormat,
    #[serde(default)]
    pub filter: RequestFilter,
}

impl ExportSpec {
    pub fn new(format: ExportFormat) -> Self {
        Self {
            format,
            filter: RequestFilter::default(),
        }
    }

    pub fn with_filter(mut self, filter: RequestFilter) -> Self {
        self.filter = filter;
        self
    }
}

/// Counts and breakdowns over the live handle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseStats {
    pub total_requests: u64,
    pub total_headers: u64,
    pub total_timings: u64,
    pub total_metrics: u64,
    pub engine_errors: u64,
    /// Request count per status code (`"none"` for pending requests)
    pub by_status: BTreeMap<String, u64>,
    pub by_type: BTreeMap<String, u64>,
    pub avg_duration: Option<f64>,
    pub oldest_timestamp: Option<i64>,
    pub newest_timestamp: Option<i64>,
    pub size: SizeEstimate,
    pub schema_version: u32,
    pub degraded: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Synchronous bodies
// ─────────────────────────────────────────────────────────────────────────────

fn request_from_row(row: &Row<'_>) -> rusqlite::Result<CapturedRequest> {
    Ok(CapturedRequest {
        id: row.get(0)?,
        url: row.get(1)?,
        method: row.get(2)?,
        request_type: row.get(3)?,
        status: row.get(4)?,
        status_text: row.get(5)?,
        domain: row.get(6)?,
        path: row.get(7)?,
        start_time: row.get(8)?,
        end_time: row.get(9)?,
        duration: row.get(10)?,
        size: row.get(11)?,
        timestamp: row.get(12)?,
        tab_id: row.get(13)?,
        error: row.get(14)?,
        page_url: row.get(15)?,
        headers: Vec::new(),
        timings: None,
    })
}

fn load_children(conn: &Connection, request: &mut CapturedRequest) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare_cached(
        "SELECT direction, name, value FROM request_headers WHERE request_id = ?1 ORDER BY id",
    )?;
    request.headers = stmt
        .query_map([&request.id], |row| {
            let direction: String = row.get(0)?;
            let direction = direction.parse::<HeaderDirection>().map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    0,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?;
            Ok(RequestHeader {
                direction,
                name: row.get(1)?,
                value: row.get(2)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut stmt = conn.prepare_cached(
        "SELECT dns, tcp, ssl, ttfb, download FROM request_timings WHERE request_id = ?1",
    )?;
    request.timings = stmt
        .query_row([&request.id], |row| {
            Ok(RequestTiming {
                dns: row.get(0)?,
                tcp: row.get(1)?,
                ssl: row.get(2)?,
                ttfb: row.get(3)?,
                download: row.get(4)?,
            })
        })
        .optional()?;
    Ok(())
}

fn write_timings(conn: &Connection, id: &str, timings: &RequestTiming) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO request_timings (request_id, dns, tcp, ssl, ttfb, download)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(request_id) DO UPDATE SET
            dns = excluded.dns, tcp = excluded.tcp, ssl = excluded.ssl,
            ttfb = excluded.ttfb, download = excluded.download",
        params![
            id,
            timings.dns,
            timings.tcp,
            timings.ssl,
            timings.ttfb,
            timings.download
        ],
    )?;
    Ok(())
}

pub(crate) fn save_request(db: &mut Database, request: &CapturedRequest) -> rusqlite::Result<()> {
    let tx = db.connection_mut().transaction()?;
    tx.execute(
        "INSERT INTO requests (id, url, method, type, status, status_text, domain, path,
            start_time, end_time, duration, size, timestamp, tab_id, error, page_url)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
         ON CONFLICT(id) DO UPDATE SET
            url = excluded.url, method = excluded.method, type = excluded.type,
            status = excluded.status, status_text = excluded.status_text,
            domain = excluded.domain, path = excluded.path,
            start_time = excluded.start_time, end_time = excluded.end_time,
            duration = excluded.duration, size = excluded.size,
            timestamp = excluded.timestamp, tab_id = excluded.tab_id,
            error = excluded.error, page_url = excluded.page_url",
        params![
            request.id,
            request.url,
            request.method,
            request.request_type,
            request.status,
            request.status_text,
            request.domain,
            request.path,
            request.start_time,
            request.end_time,
            request.duration,
            request.size,
            request.timestamp,
            request.tab_id,
            request.error,
            request.page_url,
        ],
    )?;

    tx.execute(
        "DELETE FROM request_headers WHERE request_id = ?1",
        [&request.id],
    )?;
    {
        let mut insert = tx.prepare_cached(
            "INSERT INTO request_headers (request_id, direction, name, value)
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        for header in &request.headers {
            insert.execute(params![
                request.id,
                header.direction.as_str(),
                header.name,
                header.value
            ])?;
        }
    }

    match &request.timings {
        Some(timings) => write_timings(&tx, &request.id, timings)?,
        None => {
            tx.execute(
                "DELETE FROM request_timings WHERE request_id = ?1",
                [&request.id],
            )?;
        }
    }
    tx.commit()
}

pub(crate) fn update_request(
    db: &mut Database,
    id: &str,
    update: &RequestUpdate,
) -> Result<()> {
    let tx = db.connection_mut().transaction()?;
    let changed = tx.execute(
        "UPDATE requests SET
            status = COALESCE(?2, status),
            status_text = COALESCE(?3, status_text),
            end_time = COALESCE(?4, end_time),
            duration = COALESCE(?5, duration),
            size = COALESCE(?6, size),
            error = COALESCE(?7, error)
         WHERE id = ?1",
        params![
            id,
            update.status,
            update.status_text,
            update.end_time,
            update.duration,
            update.size,
            update.error
        ],
    )?;
    if changed == 0 {
        return Err(QueryError::NotFound(id.to_string()).into());
    }
    if let Some(timings) = &update.timings {
        write_timings(&tx, id, timings)?;
    }
    tx.commit()?;
    Ok(())
}

pub(crate) fn delete_request(db: &mut Database, id: &str) -> rusqlite::Result<bool> {
    let tx = db.connection_mut().transaction()?;
    for table in ["request_headers", "request_timings", "performance_metrics"] {
        tx.execute(&format!("DELETE FROM {table} WHERE request_id = ?1"), [id])?;
    }
    let deleted = tx.execute("DELETE FROM requests WHERE id = ?1", [id])?;
    tx.commit()?;
    Ok(deleted > 0)
}

pub(crate) fn get_request(db: &Database, id: &str) -> rusqlite::Result<Option<CapturedRequest>> {
    let conn = db.connection();
    let request = conn
        .query_row(
            &format!("SELECT {REQUEST_COLUMNS} FROM requests WHERE id = ?1"),
            [id],
            request_from_row,
        )
        .optional()?;
    match request {
        Some(mut request) => {
            load_children(conn, &mut request)?;
            Ok(Some(request))
        }
        None => Ok(None),
    }
}

fn select_requests(
    conn: &Connection,
    clause: &FilterClause,
    paging: Option<(u32, u32)>,
) -> rusqlite::Result<Vec<CapturedRequest>> {
    let mut sql = format!(
        "SELECT {REQUEST_COLUMNS} FROM requests{} ORDER BY timestamp DESC, id DESC",
        clause.where_sql()
    );
    let mut params = clause.params.clone();
    if let Some((page, limit)) = paging {
        let n = params.len();
        sql.push_str(&format!(" LIMIT ?{} OFFSET ?{}", n + 1, n + 2));
        params.push(SqlValue::Integer(i64::from(limit)));
        params.push(SqlValue::Integer(
            i64::from(page.saturating_sub(1)) * i64::from(limit),
        ));
    }

    let mut stmt = conn.prepare(&sql)?;
    let mut requests = stmt
        .query_map(rusqlite::params_from_iter(params.iter()), request_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    for request in &mut requests {
        load_children(conn, request)?;
    }
    Ok(requests)
}

pub(crate) fn get_requests(db: &Database, filter: &RequestFilter) -> Result<Page<CapturedRequest>> {
    filter.validate_page()?;
    let conn = db.connection();
    let clause = filter.predicate();

    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM requests{}", clause.where_sql()),
        rusqlite::params_from_iter(clause.params.iter()),
        |row| row.get(0),
    )?;
    let rows = select_requests(conn, &clause, Some((filter.page, filter.limit)))?;

    Ok(Page {
        rows,
        total_count: total.max(0) as u64,
        page: filter.page,
        limit: filter.limit,
    })
}

pub(crate) fn save_performance_metric(
    db: &mut Database,
    metric: &PerformanceMetric,
) -> rusqlite::Result<i64> {
    let conn = db.connection();
    conn.execute(
        "INSERT INTO performance_metrics (request_id, metric, value, recorded_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            metric.request_id,
            metric.metric,
            metric.value,
            metric.recorded_at
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn count_table(conn: &Connection, table: &str) -> rusqlite::Result<u64> {
    let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
        row.get(0)
    })?;
    Ok(n.max(0) as u64)
}

fn breakdown(conn: &Connection, column: &str) -> rusqlite::Result<BTreeMap<String, u64>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT COALESCE(CAST({column} AS TEXT), 'none'), COUNT(*) FROM requests GROUP BY 1"
    ))?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?.max(0) as u64))
    })?;
    rows.collect()
}

pub(crate) fn database_stats(db: &Database, degraded: bool) -> rusqlite::Result<DatabaseStats> {
    let conn = db.connection();
    let (avg_duration, oldest, newest): (Option<f64>, Option<i64>, Option<i64>) = conn.query_row(
        "SELECT AVG(duration), MIN(timestamp), MAX(timestamp) FROM requests",
        [],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )?;

    Ok(DatabaseStats {
        total_requests: count_table(conn, "requests")?,
        total_headers: count_table(conn, "request_headers")?,
        total_timings: count_table(conn, "request_timings")?,
        total_metrics: count_table(conn, "performance_metrics")?,
        engine_errors: count_table(conn, "engine_errors")?,
        by_status: breakdown(conn, "status")?,
        by_type: breakdown(conn, "type")?,
        avg_duration,
        oldest_timestamp: oldest,
        newest_timestamp: newest,
        size: db.size_estimate()?,
        schema_version: db.schema_version()?,
        degraded,
    })
}

pub(crate) fn clear_all(db: &mut Database) -> rusqlite::Result<u64> {
    let tx = db.connection_mut().transaction()?;
    for table in ["request_headers", "request_timings", "performance_metrics"] {
        tx.execute(&format!("DELETE FROM {table}"), [])?;
    }
    let deleted = tx.execute("DELETE FROM requests", [])?;
    tx.commit()?;
    Ok(deleted as u64)
}

const CSV_HEADER: [&str; 16] = [
    "id",
    "url",
    "method",
    "type",
    "status",
    "status_text",
    "domain",
    "path",
    "start_time",
    "end_time",
    "duration",
    "size",
    "timestamp",
    "tab_id",
    "error",
    "page_url",
];

/// Quote a field per RFC 4180 when it needs it
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\r', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn opt<T: ToString>(value: &Option<T>) -> String {
    value.as_ref().map(ToString::to_string).unwrap_or_default()
}

fn to_csv(requests: &[CapturedRequest]) -> String {
    let mut out = CSV_HEADER.join(",");
    out.push_str("\r\n");
    for r in requests {
        let fields = [
            r.id.clone(),
            r.url.clone(),
            r.method.clone(),
            opt(&r.request_type),
            opt(&r.status),
            opt(&r.status_text),
            opt(&r.domain),
            opt(&r.path),
            opt(&r.start_time),
            opt(&r.end_time),
            opt(&r.duration),
            opt(&r.size),
            r.timestamp.to_string(),
            opt(&r.tab_id),
            opt(&r.error),
            opt(&r.page_url),
        ];
        let line: Vec<String> = fields.iter().map(|f| csv_field(f)).collect();
        out.push_str(&line.join(","));
        out.push_str("\r\n");
    }
    out
}

pub(crate) fn export_database(db: &Database, spec: &ExportSpec) -> Result<Vec<u8>> {
    match spec.format {
        ExportFormat::Sqlite => {
            if !spec.filter.is_unconstrained() {
                return Err(QueryError::InvalidFilter(
                    "sqlite exports always contain the whole database".into(),
                )
                .into());
            }
            Ok(db.export()?)
        }
        ExportFormat::Json => {
            let requests = select_requests(db.connection(), &spec.filter.predicate(), None)?;
            Ok(serde_json::to_vec_pretty(&requests)?)
        }
        ExportFormat::Csv => {
            let requests = select_requests(db.connection(), &spec.filter.predicate(), None)?;
            Ok(to_csv(&requests).into_bytes())
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine façade
// ─────────────────────────────────────────────────────────────────────────────

impl StorageEngine {
    /// Insert or replace a request together with its headers and timings
    pub async fn save_request(&self, request: CapturedRequest) -> Result<()> {
        self.write(move |db| Ok(save_request(db, &request)?)).await
    }

    pub async fn update_request(&self, id: impl Into<String>, update: RequestUpdate) -> Result<()> {
        let id = id.into();
        self.write(move |db| update_request(db, &id, &update)).await
    }

    /// Remove a request and its children. Returns whether it existed.
    pub async fn delete_request(&self, id: impl Into<String>) -> Result<bool> {
        let id = id.into();
        self.write(move |db| Ok(delete_request(db, &id)?)).await
    }

    pub async fn get_request(&self, id: impl Into<String>) -> Result<Option<CapturedRequest>> {
        let id = id.into();
        self.read(move |db| Ok(get_request(db, &id)?)).await
    }

    pub async fn get_requests(&self, filter: RequestFilter) -> Result<Page<CapturedRequest>> {
        self.read(move |db| get_requests(db, &filter)).await
    }

    pub async fn save_performance_metric(&self, metric: PerformanceMetric) -> Result<i64> {
        self.write(move |db| Ok(save_performance_metric(db, &metric)?))
            .await
    }

    pub async fn get_database_stats(&self) -> Result<DatabaseStats> {
        let degraded = self.is_degraded();
        self.read(move |db| Ok(database_stats(db, degraded)?)).await
    }

    /// Serialize requests (or the whole image) in the requested format
    pub async fn export_database(&self, spec: ExportSpec) -> Result<Vec<u8>> {
        self.read(move |db| export_database(db, &spec)).await
    }

    /// Delete every captured row, then compact
    pub async fn clear_database(&self) -> Result<u64> {
        let deleted = self.write(|db| Ok(clear_all(db)?)).await?;
        tracing::info!("Cleared {} requests", deleted);
        if let Err(e) = self.retention().vacuum().await {
            tracing::warn!("Vacuum after clear failed: {}", e);
        }
        Ok(deleted)
    }

    /// Force a checkpoint and announce each backend that took it
    pub async fn backup_database(&self) -> Result<Vec<String>> {
        if self.is_degraded() {
            return Err(BackendError::Unavailable {
                backend: "all".into(),
                reason: "engine is running in degraded mode".into(),
            }
            .into());
        }
        let report = self.checkpoint().await?;
        for backend in &report.persisted {
            self.events().publish(EngineEvent::BackupCreated {
                backend: backend.clone(),
                bytes: report.bytes,
            });
        }
        Ok(report.persisted)
    }
}
