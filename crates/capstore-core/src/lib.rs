//! Capstore Core - crash-tolerant storage for captured HTTP requests
//!
//! The whole database lives in one in-memory SQLite handle. Its native byte
//! image is periodically written to one or more persistence backends and
//! restored from them on startup.
//!
//! # Architecture
//!
//! 1. **Engine** (`engine`): recovery protocol, lifecycle state machine, degraded mode
//! 2. **Migrations** (`migration`): ordered, idempotent, atomic schema steps
//! 3. **Write queue** (`queue`): FIFO serializer for every mutation
//! 4. **Checkpoints** (`checkpoint`): queued export fanned out to all backends
//! 5. **Retention** (`retention`): age, count, size and filter purges
//! 6. **Query façade** (`query`): typed requests, pagination, JSON/CSV/SQLite export
//!
//! # Quick Start
//!
//! ```
//! use capstore_core::backend::{BackendSet, MemoryBackend};
//! use capstore_core::query::{CapturedRequest, RequestFilter};
//! use capstore_core::{EngineConfig, EventBus, MigrationRegistry, StorageEngine};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let runtime = tokio::runtime::Runtime::new()?;
//! runtime.block_on(async {
//!     let engine = StorageEngine::initialize(
//!         EngineConfig::default(),
//!         BackendSet::new().with(MemoryBackend::new("primary", 0)),
//!         MigrationRegistry::builtin(),
//!         EventBus::default(),
//!     )
//!     .await?;
//!
//!     engine
//!         .save_request(CapturedRequest::new("https://example.com/api", "GET").with_status(200, "OK"))
//!         .await?;
//!
//!     let page = engine.get_requests(RequestFilter::for_domain("example.com")).await?;
//!     assert_eq!(page.total_count, 1);
//!
//!     engine.close().await
//! })?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(rust_2018_idioms, missing_debug_implementations, clippy::all)]

pub mod backend;
pub mod checkpoint;
pub mod config;
pub mod database;
pub mod engine;
pub mod error;
pub mod events;
pub mod migration;
pub mod query;
pub mod queue;
pub mod retention;
pub mod retry;

// Re-exports for convenience
pub use backend::{Backend, BackendSet, DirectoryBackend, KeyValueBackend, MemoryBackend};
pub use checkpoint::CheckpointReport;
pub use config::EngineConfig;
pub use database::{Database, ResultSet, SqlValue, Statement};
pub use engine::{EngineState, InitOrigin, InitReport, StorageEngine};
pub use error::{Result, StoreError};
pub use events::{EngineEvent, EventBus};
pub use migration::{Migration, MigrationRegistry, MigrationReport};
pub use retention::{PurgeReport, RetentionPolicy};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
