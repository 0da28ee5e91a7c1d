//! End-to-end: create, write, checkpoint, close, reopen.

mod common;

use std::sync::Arc;

use capstore_core::backend::{
    BackendSet, DirectoryBackend, JsonFileKeyValueStore, KeyValueBackend, MemoryBackend,
};
use capstore_core::migration::history;
use capstore_core::query::{
    CapturedRequest, ExportFormat, ExportSpec, HeaderDirection, RequestFilter, RequestUpdate,
};
use capstore_core::{
    Database, EngineConfig, EngineEvent, EventBus, InitOrigin, MigrationRegistry, RetentionPolicy,
    SqlValue, Statement, StorageEngine,
};
use common::{fast_config, open};

fn directory_backends(dir: &std::path::Path) -> BackendSet {
    BackendSet::new()
        .with(DirectoryBackend::new(dir.join("data")))
        .with(KeyValueBackend::new(JsonFileKeyValueStore::new(
            dir.join("backup.json"),
        )))
}

#[tokio::test]
async fn fresh_migrate_reopen_reports_latest_version() {
    let registry = MigrationRegistry::builtin();
    let latest = registry.latest_version();

    let engine = open(BackendSet::new().with(MemoryBackend::new("primary", 0))).await;
    assert_eq!(engine.init_report().origin, InitOrigin::Fresh);
    let applied = &engine.init_report().migration.applied;
    assert_eq!(applied, &(1..=latest).collect::<Vec<_>>());

    let bytes = engine.export().await.unwrap();
    engine.close().await.unwrap();

    let reopened = Database::from_bytes(&bytes).unwrap();
    let records = history(&reopened).unwrap();
    assert_eq!(records.iter().map(|r| r.version).max(), Some(latest));
    assert!(records.iter().all(|r| r.status == "applied"));
}

#[tokio::test]
async fn data_survives_restart_on_disk() {
    let dir = tempfile::tempdir().unwrap();

    let engine = open(directory_backends(dir.path())).await;
    engine
        .save_request(
            CapturedRequest::new("https://api.test/users", "GET")
                .with_id("req-1")
                .with_status(200, "OK")
                .with_header(HeaderDirection::Response, "content-type", "application/json"),
        )
        .await
        .unwrap();
    engine.close().await.unwrap();

    let engine = open(directory_backends(dir.path())).await;
    assert_eq!(engine.init_report().origin, InitOrigin::Primary);
    let request = engine.get_request("req-1").await.unwrap().unwrap();
    assert_eq!(request.domain.as_deref(), Some("api.test"));
    assert_eq!(request.headers.len(), 1);
    engine.close().await.unwrap();
}

#[tokio::test]
async fn deleted_image_recovers_from_backup_file() {
    let dir = tempfile::tempdir().unwrap();

    let engine = open(directory_backends(dir.path())).await;
    engine
        .save_request(CapturedRequest::new("https://a.test/", "GET").with_id("keep-me"))
        .await
        .unwrap();
    engine.close().await.unwrap();

    let durable = DirectoryBackend::new(dir.path().join("data"));
    std::fs::remove_file(durable.image_path()).unwrap();

    let engine = open(directory_backends(dir.path())).await;
    assert_eq!(engine.init_report().origin, InitOrigin::Backup);
    assert!(engine.get_request("keep-me").await.unwrap().is_some());
    assert!(durable.image_path().exists());
    engine.close().await.unwrap();
}

#[tokio::test]
async fn writes_apply_in_submission_order_through_the_engine() {
    let engine = open(BackendSet::new().with(MemoryBackend::new("primary", 0))).await;

    // Each write reports how many rows it found before adding its own
    let writes = (0..20i64).map(|i| {
        engine.write(move |db| {
            let seen = match db.query("SELECT COUNT(*) FROM requests", &[])?.scalar() {
                Some(SqlValue::Integer(n)) => *n,
                _ => -1,
            };
            db.execute(
                "INSERT INTO requests (id, url, method, timestamp) VALUES (?1, ?2, 'POST', ?3)",
                &[
                    format!("r{i:02}").into(),
                    format!("https://load.test/{i}").into(),
                    SqlValue::Integer(i),
                ],
            )?;
            Ok(seen)
        })
    });
    let seen: Vec<i64> = futures::future::join_all(writes)
        .await
        .into_iter()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(seen, (0..20).collect::<Vec<_>>());
    assert_eq!(engine.pending_writes(), 0);

    let page = engine
        .get_requests(RequestFilter {
            limit: 50,
            ..RequestFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(page.total_count, 20);
    engine.close().await.unwrap();
}

#[tokio::test]
async fn forced_checkpoint_captures_queued_write() {
    let primary = Arc::new(MemoryBackend::new("primary", 0));
    let engine = open(BackendSet::new().with_shared(primary.clone())).await;

    let save = engine.save_request(CapturedRequest::new("https://c.test/", "GET").with_id("c1"));
    let checkpoint = engine.checkpoint();
    let (saved, report) = tokio::join!(save, checkpoint);
    saved.unwrap();
    let report = report.unwrap();
    assert_eq!(report.persisted, vec!["primary"]);

    // Whatever the checkpoint saw, it opens cleanly
    let image = Database::from_bytes(&primary.bytes().unwrap()).unwrap();
    assert!(image.schema_version().unwrap() > 0);
    engine.close().await.unwrap();

    let after_close = Database::from_bytes(&primary.bytes().unwrap()).unwrap();
    let rs = after_close
        .query("SELECT id FROM requests", &[])
        .unwrap();
    assert_eq!(rs.rows.len(), 1);
}

#[tokio::test]
async fn update_and_delete_requests() {
    let engine = open(BackendSet::new().with(MemoryBackend::new("primary", 0))).await;
    engine
        .save_request(CapturedRequest::new("https://u.test/", "GET").with_id("u1"))
        .await
        .unwrap();

    engine
        .update_request(
            "u1",
            RequestUpdate {
                status: Some(503),
                error: Some("upstream timeout".into()),
                ..RequestUpdate::default()
            },
        )
        .await
        .unwrap();
    let request = engine.get_request("u1").await.unwrap().unwrap();
    assert_eq!(request.status, Some(503));
    assert_eq!(request.error.as_deref(), Some("upstream timeout"));

    assert!(engine.delete_request("u1").await.unwrap());
    assert!(engine.get_request("u1").await.unwrap().is_none());
    assert!(engine
        .update_request("u1", RequestUpdate::default())
        .await
        .is_err());
    engine.close().await.unwrap();
}

#[tokio::test]
async fn purges_and_stats_through_the_engine() {
    let engine = open(BackendSet::new().with(MemoryBackend::new("primary", 0))).await;
    for i in 0..150 {
        let domain = if i < 10 { "ads.test" } else { "app.test" };
        engine
            .save_request(
                CapturedRequest::new(format!("https://{domain}/{i}"), "GET")
                    .with_id(format!("r{i:03}"))
                    .with_timestamp(1_000 + i),
            )
            .await
            .unwrap();
    }

    let report = engine
        .retention()
        .purge_by_custom_filter(&RequestFilter::for_domain("ads.test"))
        .await
        .unwrap();
    assert_eq!(report.rows_deleted, 10);

    let report = engine.retention().purge_by_count(100).await.unwrap();
    assert_eq!(report.rows_before, 140);
    assert_eq!(report.rows_deleted, 40);

    let stats = engine.get_database_stats().await.unwrap();
    assert_eq!(stats.total_requests, 100);
    assert_eq!(stats.oldest_timestamp, Some(1_050));
    assert!(!stats.degraded);

    assert_eq!(engine.clear_database().await.unwrap(), 100);
    assert_eq!(engine.get_database_stats().await.unwrap().total_requests, 0);
    engine.close().await.unwrap();
}

#[tokio::test]
async fn size_purge_shrinks_the_exported_image() {
    let engine = open(BackendSet::new().with(MemoryBackend::new("primary", 0))).await;
    let payload = "p".repeat(1024);
    let inserts = (0..1000)
        .map(|i| {
            Statement::new(
                "INSERT INTO requests (id, url, method, timestamp, error) VALUES (?1, ?2, 'GET', ?3, ?4)",
                vec![
                    format!("r{i:04}").into(),
                    format!("https://size.test/{i}").into(),
                    SqlValue::Integer(i),
                    payload.clone().into(),
                ],
            )
        })
        .collect();
    engine.execute_transaction(inserts).await.unwrap();

    let before = engine.export().await.unwrap().len() as u64;
    let budget = before * 95 / 100;
    let report = engine.retention().purge_by_size(budget).await.unwrap();

    // A small share of rows, well under the vacuum threshold
    assert!(report.rows_deleted > 0);
    assert!(report.removed_fraction() < engine.config().vacuum_threshold);
    assert!(report.vacuumed);
    let after = engine.export().await.unwrap().len() as u64;
    assert!(after <= budget, "image {after} bytes over budget {budget}");
    engine.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn configured_retention_runs_on_its_interval() {
    let events = EventBus::default();
    let mut rx = events.subscribe();
    let config = EngineConfig {
        retention_interval_secs: 60,
        ..fast_config().with_retention(RetentionPolicy {
            max_rows: Some(5),
            ..RetentionPolicy::default()
        })
    };
    let engine = StorageEngine::initialize(
        config,
        BackendSet::new().with(MemoryBackend::new("primary", 0)),
        MigrationRegistry::builtin(),
        events,
    )
    .await
    .unwrap();
    for i in 0..12 {
        engine
            .save_request(
                CapturedRequest::new(format!("https://r.test/{i}"), "GET")
                    .with_id(format!("r{i:02}")),
            )
            .await
            .unwrap();
    }

    let rows_deleted = loop {
        if let EngineEvent::Purged { rows_deleted, .. } = rx.recv().await.unwrap() {
            break rows_deleted;
        }
    };
    assert_eq!(rows_deleted, 7);
    assert_eq!(engine.get_database_stats().await.unwrap().total_requests, 5);
    engine.close().await.unwrap();
}

#[tokio::test]
async fn backup_database_announces_each_backend() {
    let events = EventBus::default();
    let mut rx = events.subscribe();
    let engine = StorageEngine::initialize(
        fast_config(),
        BackendSet::new()
            .with(MemoryBackend::new("primary", 0))
            .with(MemoryBackend::new("backup", 1)),
        MigrationRegistry::builtin(),
        events,
    )
    .await
    .unwrap();
    while rx.try_recv().is_ok() {}

    let mut persisted = engine.backup_database().await.unwrap();
    persisted.sort();
    assert_eq!(persisted, vec!["backup", "primary"]);

    let mut announced = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let EngineEvent::BackupCreated { backend, .. } = event {
            announced.push(backend);
        }
    }
    announced.sort();
    assert_eq!(announced, vec!["backup", "primary"]);
    engine.close().await.unwrap();
}

#[tokio::test]
async fn exports_in_every_format() {
    let engine = open(BackendSet::new().with(MemoryBackend::new("primary", 0))).await;
    engine
        .save_request(CapturedRequest::new("https://e.test/a,b", "GET").with_id("e1"))
        .await
        .unwrap();

    let csv = engine
        .export_database(ExportSpec::new(ExportFormat::Csv))
        .await
        .unwrap();
    assert!(String::from_utf8(csv).unwrap().contains("\"https://e.test/a,b\""));

    let json = engine
        .export_database(ExportSpec::new(ExportFormat::Json))
        .await
        .unwrap();
    let value: serde_json::Value = serde_json::from_slice(&json).unwrap();
    assert_eq!(value[0]["id"], "e1");

    let image = engine
        .export_database(ExportSpec::new(ExportFormat::Sqlite))
        .await
        .unwrap();
    assert!(Database::from_bytes(&image).is_ok());
    engine.close().await.unwrap();
}
