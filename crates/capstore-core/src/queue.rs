//! Write queue
//!
//! Every mutation of the live handle goes through one FIFO channel drained by
//! one worker task. An operation runs to completion (on the blocking pool,
//! with the handle locked) before the next one starts, and its result is sent
//! back on its own oneshot, so operations settle in exactly the order they
//! were submitted. A failing or panicking operation only settles its own
//! future.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::database::Database;
use crate::error::{Result, StoreError};

/// The live handle, shared between the queue worker and direct readers.
/// `None` once the engine has closed.
pub type SharedDatabase = Arc<Mutex<Option<Database>>>;

type Job = Box<dyn FnOnce(Option<&mut Database>) + Send + 'static>;

/// FIFO serializer for operations on the live handle
#[derive(Debug)]
pub struct WriteQueue {
    tx: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    pending: Arc<AtomicUsize>,
}

impl WriteQueue {
    /// Spawn the worker. Must be called inside a Tokio runtime.
    pub fn start(db: SharedDatabase) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let pending = Arc::new(AtomicUsize::new(0));

        let worker_pending = pending.clone();
        let worker = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let db = db.clone();
                let outcome = tokio::task::spawn_blocking(move || {
                    let mut guard = db.lock();
                    job(guard.as_mut());
                })
                .await;
                if let Err(e) = outcome {
                    tracing::error!("Queued operation panicked: {}", e);
                }
                worker_pending.fetch_sub(1, Ordering::SeqCst);
            }
            tracing::debug!("Write queue drained and stopped");
        });

        Self {
            tx: Mutex::new(Some(tx)),
            worker: tokio::sync::Mutex::new(Some(worker)),
            pending,
        }
    }

    /// Append an operation. It is enqueued before this returns; the future
    /// settles once the operation has run.
    pub fn submit<T, F>(&self, op: F) -> impl Future<Output = Result<T>> + Send + 'static
    where
        T: Send + 'static,
        F: FnOnce(&mut Database) -> Result<T> + Send + 'static,
    {
        let (resp_tx, resp_rx) = oneshot::channel::<Result<T>>();
        let job: Job = Box::new(move |db| {
            let result = match db {
                Some(db) => op(db),
                None => Err(StoreError::Closed),
            };
            let _ = resp_tx.send(result);
        });

        let enqueued = self.enqueue(job);
        async move {
            enqueued?;
            resp_rx
                .await
                .map_err(|_| StoreError::QueueClosed("operation dropped before settling".into()))?
        }
    }

    fn enqueue(&self, job: Job) -> Result<()> {
        let guard = self.tx.lock();
        let tx = guard.as_ref().ok_or(StoreError::Closed)?;
        self.pending.fetch_add(1, Ordering::SeqCst);
        tx.send(job).map_err(|_| {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            StoreError::QueueClosed("worker stopped".into())
        })
    }

    /// Operations submitted but not yet finished
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.lock().is_none()
    }

    /// Stop accepting work and wait until everything already queued has run
    pub async fn close(&self) {
        self.tx.lock().take();
        let worker = self.worker.lock().await.take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                tracing::error!("Write queue worker failed: {}", e);
            }
        }
    }
}
