//! Error types for capstore
//!
//! One `thiserror` enum per failure class, folded into [`StoreError`].
//! Engine-level failures (initialization exhaustion, migration failure) are
//! fatal to startup; per-operation failures (one write, one backend save)
//! stay local to the caller.

use thiserror::Error;

/// Result type alias for capstore operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Main error type for capstore operations
#[derive(Error, Debug)]
pub enum StoreError {
    /// Recovery protocol failed (retried with backoff, then degrades)
    #[error("Initialization error: {0}")]
    Initialization(#[from] InitializationError),

    /// Schema migration failed; nothing from the pass was kept
    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),

    /// A single statement failed
    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    /// A multi-statement transaction failed and was rolled back
    #[error("Transaction error: {0}")]
    Transaction(#[from] TransactionError),

    /// A backend load/save failed
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// A purge failed; retried on the next retention cycle
    #[error("Retention error: {0}")]
    Retention(#[from] RetentionError),

    /// The engine has been closed
    #[error("Storage engine is closed")]
    Closed,

    /// The write queue stopped before the operation settled
    #[error("Write queue closed: {0}")]
    QueueClosed(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        source: Box<StoreError>,
    },
}

/// Errors raised while opening or creating the live handle
#[derive(Error, Debug, Clone)]
pub enum InitializationError {
    #[error("Snapshot from backend '{backend}' could not be opened: {reason}")]
    CorruptSnapshot { backend: String, reason: String },

    #[error("Could not create a fresh database: {0}")]
    FreshCreate(String),

    #[error("No backend accepted the fresh database ({attempted} attempted)")]
    NoDurableBacking { attempted: usize },

    #[error("Recovery failed after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
}

/// Errors raised by the migration registry
#[derive(Error, Debug, Clone)]
pub enum MigrationError {
    #[error("Migration {version} ({description}) failed: {reason}")]
    StepFailed {
        version: u32,
        description: String,
        reason: String,
    },

    #[error("Migrations must have strictly ascending non-zero versions, found {found} after {previous}")]
    InvalidOrder { previous: u32, found: u32 },

    #[error("Version table could not be read: {0}")]
    VersionTable(String),
}

/// Errors raised by single statements
#[derive(Error, Debug, Clone)]
pub enum QueryError {
    #[error("SQL error: {0}")]
    Sql(String),

    #[error("Statement is not read-only: {0}")]
    NotReadOnly(String),

    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    #[error("Request not found: {0}")]
    NotFound(String),
}

/// Errors raised by multi-statement transactions
#[derive(Error, Debug, Clone)]
pub enum TransactionError {
    #[error("Statement {index} failed, transaction rolled back: {reason}")]
    StatementFailed { index: usize, reason: String },

    #[error("Commit failed: {0}")]
    Commit(String),

    #[error("Transaction could not start: {0}")]
    Begin(String),
}

/// Errors raised by persistence backends
#[derive(Error, Debug, Clone)]
pub enum BackendError {
    #[error("Backend '{backend}' unavailable: {reason}")]
    Unavailable { backend: String, reason: String },

    #[error("Backend '{backend}' I/O failure: {reason}")]
    Io { backend: String, reason: String },

    #[error("Backend '{backend}' holds a corrupted snapshot: {reason}")]
    Corrupted { backend: String, reason: String },

    #[error("Backend '{backend}' quota exceeded: {size} bytes > {quota} bytes")]
    QuotaExceeded {
        backend: String,
        size: usize,
        quota: usize,
    },
}

/// Errors raised by the retention manager
#[derive(Error, Debug, Clone)]
pub enum RetentionError {
    #[error("Purge '{purge}' failed: {reason}")]
    PurgeFailed { purge: String, reason: String },

    #[error("Custom purge filter must constrain at least one column")]
    EmptyFilter,

    #[error("Vacuum failed: {0}")]
    Vacuum(String),
}

impl From<rusqlite::Error> for QueryError {
    fn from(e: rusqlite::Error) -> Self {
        QueryError::Sql(e.to_string())
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Query(e.into())
    }
}

impl StoreError {
    /// Add context to an error
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Category name used in the engine error log
    pub fn category(&self) -> &'static str {
        match self {
            StoreError::Initialization(_) => "initialization",
            StoreError::Migration(_) => "migration",
            StoreError::Query(_) => "query",
            StoreError::Transaction(_) => "transaction",
            StoreError::Backend(_) => "backend",
            StoreError::Retention(_) => "retention",
            StoreError::Closed | StoreError::QueueClosed(_) => "lifecycle",
            StoreError::Config(_) => "config",
            StoreError::Serialization(_) => "serialization",
            StoreError::Io(_) => "io",
            StoreError::WithContext { source, .. } => source.category(),
        }
    }
}

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to a Result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add lazy context to a Result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.context(f()))
    }
}
