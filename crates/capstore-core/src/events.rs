//! Engine lifecycle events
//!
//! The engine owns an [`EventBus`]; collaborators subscribe to it. Publishing
//! never blocks and never fails, whether or not anyone is listening.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::config::EngineConfig;
use crate::engine::{EngineState, InitOrigin};

/// Events the storage engine publishes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// State machine transition
    StateChanged { from: EngineState, to: EngineState },

    /// Engine is ready to serve
    Ready { origin: InitOrigin, schema_version: u32 },

    /// Engine is running without durable backing
    Degraded { reason: String },

    /// One migration step committed
    MigrationApplied { version: u32 },

    /// A checkpoint finished (some backends may have failed)
    CheckpointCompleted {
        bytes: usize,
        persisted: Vec<String>,
        failed: Vec<String>,
    },

    /// One backend rejected a checkpoint
    BackendPersistFailed { backend: String, error: String },

    /// A manual backup reached a backend
    BackupCreated { backend: String, bytes: usize },

    /// Rows were removed by a purge
    Purged { purge: String, rows_deleted: u64 },

    /// The image was compacted
    Vacuumed { freed_bytes: u64 },

    /// A non-fatal engine failure
    Error { category: String, message: String },

    /// Engine closed; no further events follow
    Closed,
}

impl EngineEvent {
    /// Short name, used in logs
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::StateChanged { .. } => "state_changed",
            EngineEvent::Ready { .. } => "ready",
            EngineEvent::Degraded { .. } => "degraded",
            EngineEvent::MigrationApplied { .. } => "migration_applied",
            EngineEvent::CheckpointCompleted { .. } => "checkpoint_completed",
            EngineEvent::BackendPersistFailed { .. } => "backend_persist_failed",
            EngineEvent::BackupCreated { .. } => "backup_created",
            EngineEvent::Purged { .. } => "purged",
            EngineEvent::Vacuumed { .. } => "vacuumed",
            EngineEvent::Error { .. } => "error",
            EngineEvent::Closed => "closed",
        }
    }
}

/// Broadcast channel for [`EngineEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Publish an event to whoever is listening
    pub fn publish(&self, event: EngineEvent) {
        tracing::trace!("event: {}", event.name());
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Bus sized by `event_capacity`
impl From<&EngineConfig> for EventBus {
    fn from(config: &EngineConfig) -> Self {
        Self::new(config.event_capacity)
    }
}
