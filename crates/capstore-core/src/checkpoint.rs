//! Checkpoints
//!
//! A checkpoint exports the live handle and writes the bytes to every
//! backend. The export is a queued operation, so the image always matches a
//! point between two writes. One checkpoint runs at a time: the timer skips a
//! tick while another is in flight, forced checkpoints wait their turn.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::backend::BackendSet;
use crate::error::Result;
use crate::events::{EngineEvent, EventBus};
use crate::queue::WriteQueue;

/// What one checkpoint wrote where
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointReport {
    /// Size of the exported image
    pub bytes: usize,
    /// Backends that accepted the image
    pub persisted: Vec<String>,
    /// Backends that rejected it, with the reason
    pub failed: Vec<(String, String)>,
}

impl CheckpointReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && !self.persisted.is_empty()
    }
}

/// Runs checkpoints for one engine
#[derive(Debug, Clone)]
pub struct Checkpointer {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    queue: Arc<WriteQueue>,
    backends: Arc<BackendSet>,
    events: EventBus,
    in_flight: Mutex<()>,
}

impl Checkpointer {
    pub fn new(queue: Arc<WriteQueue>, backends: Arc<BackendSet>, events: EventBus) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue,
                backends,
                events,
                in_flight: Mutex::new(()),
            }),
        }
    }

    /// Run a checkpoint, waiting for one already in flight
    pub async fn checkpoint(&self) -> Result<CheckpointReport> {
        let _guard = self.inner.in_flight.lock().await;
        self.run().await
    }

    /// Run a checkpoint unless one is already in flight
    pub async fn try_checkpoint(&self) -> Option<Result<CheckpointReport>> {
        let _guard = self.inner.in_flight.try_lock().ok()?;
        Some(self.run().await)
    }

    async fn run(&self) -> Result<CheckpointReport> {
        let inner = &self.inner;
        let bytes = inner.queue.submit(|db| Ok(db.export()?)).await?;
        let outcome = inner.backends.save_all(&bytes).await;

        let mut report = CheckpointReport {
            bytes: bytes.len(),
            persisted: outcome.persisted,
            failed: Vec::with_capacity(outcome.failed.len()),
        };
        for (backend, error) in outcome.failed {
            let message = error.to_string();
            inner.events.publish(EngineEvent::BackendPersistFailed {
                backend: backend.clone(),
                error: message.clone(),
            });
            // Recorded behind the export; fire and forget
            let context = backend.clone();
            let logged = message.clone();
            drop(inner.queue.submit(move |db| {
                db.log_error("backend", &logged, Some(&context));
                Ok(())
            }));
            report.failed.push((backend, message));
        }

        tracing::debug!(
            "Checkpoint wrote {} bytes to {:?} ({} failed)",
            report.bytes,
            report.persisted,
            report.failed.len()
        );
        inner.events.publish(EngineEvent::CheckpointCompleted {
            bytes: report.bytes,
            persisted: report.persisted.clone(),
            failed: report.failed.iter().map(|(name, _)| name.clone()).collect(),
        });
        Ok(report)
    }

    /// Checkpoint every `period` (first tick one period from now) until
    /// `shutdown` flips to true. A checkpoint in progress is finished first.
    pub fn spawn_scheduler(
        &self,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let checkpointer = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match checkpointer.try_checkpoint().await {
                            None => tracing::debug!("Checkpoint already running, skipping tick"),
                            Some(Ok(_)) => {}
                            Some(Err(e)) => tracing::warn!("Scheduled checkpoint failed: {}", e),
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("Checkpoint scheduler stopped");
        })
    }
}
