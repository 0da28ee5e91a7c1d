//! Shared fixtures for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use capstore_core::backend::{Backend, BackendSet, MemoryBackend};
use capstore_core::error::BackendError;
use capstore_core::{EngineConfig, EventBus, MigrationRegistry, StorageEngine};

/// Backend that fails every call and counts them
pub struct FailingBackend {
    name: String,
    priority: u8,
    pub loads: AtomicU32,
    pub saves: AtomicU32,
}

impl FailingBackend {
    pub fn new(name: &str, priority: u8) -> Self {
        Self {
            name: name.to_string(),
            priority,
            loads: AtomicU32::new(0),
            saves: AtomicU32::new(0),
        }
    }

    fn error(&self) -> BackendError {
        BackendError::Unavailable {
            backend: self.name.clone(),
            reason: "simulated outage".to_string(),
        }
    }
}

#[async_trait]
impl Backend for FailingBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> u8 {
        self.priority
    }

    async fn load(&self) -> Result<Option<Vec<u8>>, BackendError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Err(self.error())
    }

    async fn save(&self, _bytes: &[u8]) -> Result<(), BackendError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        Err(self.error())
    }
}

/// Fast retries so degraded-mode tests do not sleep for seconds
pub fn fast_config() -> EngineConfig {
    EngineConfig::default().with_retries(3, Duration::from_millis(1))
}

pub async fn open(backends: BackendSet) -> StorageEngine {
    StorageEngine::initialize(
        fast_config(),
        backends,
        MigrationRegistry::builtin(),
        EventBus::default(),
    )
    .await
    .expect("engine should initialize")
}

/// A fully migrated image holding `rows` requests
pub async fn seeded_image(rows: usize) -> Vec<u8> {
    let engine = open(BackendSet::new().with(MemoryBackend::new("scratch", 0))).await;
    for i in 0..rows {
        engine
            .execute(
                "INSERT INTO requests (id, url, method, timestamp) VALUES (?1, ?2, 'GET', ?3)",
                vec![
                    format!("seed-{i}").into(),
                    format!("https://seed.test/{i}").into(),
                    (i as i64).into(),
                ],
            )
            .await
            .unwrap();
    }
    let bytes = engine.export().await.unwrap();
    engine.close().await.unwrap();
    bytes
}
