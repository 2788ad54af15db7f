#![allow(clippy::unwrap_used, clippy::expect_used)]
//! End-to-end properties of the catalog store over a real directory.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use instrux_catalog::kv::{FsRecordStore, LoadReport, RecordStore};
use instrux_catalog::{
    CatalogConfig, CatalogError, CatalogStore, CreateOutcome, GroomMode, InstructionEntry,
    InstructionRecord, NoopResolver, OwnerResolver, OwnershipMap, PriorityTier, sha256_hex,
};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

fn mutable_config(tmp: &TempDir) -> CatalogConfig {
    let mut cfg = CatalogConfig::for_dir(tmp.path().join("instructions"));
    cfg.mutation_enabled = true;
    cfg
}

async fn open_store(tmp: &TempDir) -> CatalogStore {
    let store = CatalogStore::open(mutable_config(tmp)).await.unwrap();
    store.load().await.unwrap();
    store
}

fn record_path(tmp: &TempDir, id: &str) -> std::path::PathBuf {
    tmp.path().join("instructions").join(format!("{id}.json"))
}

fn read_disk(tmp: &TempDir, id: &str) -> InstructionRecord {
    let raw = std::fs::read_to_string(record_path(tmp, id)).unwrap();
    serde_json::from_str(&raw).unwrap()
}

/// Delegates to a real directory but can be told to fail or slow down writes.
struct FlakyStore {
    inner: FsRecordStore,
    fail_writes: AtomicBool,
    write_delay_ms: AtomicU64,
}

impl FlakyStore {
    async fn open(tmp: &TempDir) -> Arc<Self> {
        Arc::new(Self {
            inner: FsRecordStore::open(tmp.path().join("instructions")).await.unwrap(),
            fail_writes: AtomicBool::new(false),
            write_delay_ms: AtomicU64::new(0),
        })
    }
}

#[async_trait]
impl RecordStore for FlakyStore {
    async fn load_all(&self) -> instrux_catalog::Result<LoadReport> {
        self.inner.load_all().await
    }

    async fn put(&self, record: &InstructionRecord) -> instrux_catalog::Result<()> {
        let delay = self.write_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CatalogError::io(
                "injected write failure",
                std::io::Error::other("disk full"),
            ));
        }
        self.inner.put(record).await
    }

    async fn delete(&self, id: &str) -> instrux_catalog::Result<bool> {
        self.inner.delete(id).await
    }

    async fn list_keys(&self) -> instrux_catalog::Result<Vec<String>> {
        self.inner.list_keys().await
    }
}

#[tokio::test]
async fn x1_lifecycle() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;

    let outcome = store
        .create(InstructionEntry::new("x1", "hello").with_priority(5), false)
        .await
        .unwrap();
    let CreateOutcome::Created(record) = outcome else {
        panic!("expected Created, got {outcome:?}");
    };
    assert_eq!(record.priority_tier, PriorityTier::P4);
    assert!(record_path(&tmp, "x1").exists());

    let report = store.remove(&["x1".to_string()], false).await.unwrap();
    assert_eq!(report.removed, vec!["x1".to_string()]);
    assert!(!record_path(&tmp, "x1").exists());
    assert!(matches!(store.get("x1"), Err(CatalogError::NotFound { .. })));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn created_ids_are_visible_when_the_call_resolves() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(open_store(&tmp).await);

    let mut handles = Vec::new();
    for i in 0..24 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            let id = format!("item-{i:02}");
            store
                .create(InstructionEntry::new(id.clone(), format!("body {i}")), false)
                .await
                .unwrap();
            assert!(store.get(&id).is_ok());
            assert!(store.list(&Default::default()).unwrap().iter().any(|r| r.id == id));
        }));
    }
    for h in handles {
        h.await.unwrap();
    }
    assert_eq!(store.len(), 24);
}

#[tokio::test]
async fn stored_source_hash_matches_body() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;
    store
        .create(InstructionEntry::new("h", "original"), false)
        .await
        .unwrap();
    let mut patch = InstructionEntry::patch("h");
    patch.body = Some("edited body".to_string());
    store.update(patch).await.unwrap();

    let on_disk = read_disk(&tmp, "h");
    assert_eq!(on_disk.source_hash, sha256_hex("edited body"));
    assert_eq!(on_disk.version, "1.0.1");
    assert_eq!(store.get("h").unwrap(), on_disk);
    assert!(store.audit().mismatches.is_empty());
}

#[tokio::test]
async fn governance_hash_tracks_projection_only() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;
    store
        .create(InstructionEntry::new("g", "v1").with_priority(80), false)
        .await
        .unwrap();
    let before = store.governance_hash().unwrap();

    // Body-only edit with the version pinned: projection unchanged.
    let mut body_only = InstructionEntry::patch("g").with_version("1.0.0");
    body_only.body = Some("v2".to_string());
    let outcome = store.update(body_only).await.unwrap();
    assert_eq!(outcome.version, "1.0.0");
    assert_eq!(store.governance_hash().unwrap(), before);

    // Owner edit: projection changed.
    store
        .update(InstructionEntry::patch("g").with_owner("platform"))
        .await
        .unwrap();
    let after = store.governance_hash().unwrap();
    assert_ne!(after, before);

    let items: Vec<InstructionRecord> = store.list(&Default::default()).unwrap();
    assert_eq!(after, instrux_catalog::governance_hash(&items).unwrap());
}

#[tokio::test]
async fn duplicate_add_is_skipped_and_file_untouched() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;
    store
        .create(InstructionEntry::new("d", "first"), false)
        .await
        .unwrap();
    let before = std::fs::read_to_string(record_path(&tmp, "d")).unwrap();

    let outcome = store
        .create(InstructionEntry::new("d", "second"), false)
        .await
        .unwrap();
    assert_eq!(outcome, CreateOutcome::Skipped { id: "d".to_string() });
    assert_eq!(std::fs::read_to_string(record_path(&tmp, "d")).unwrap(), before);

    let outcome = store
        .create(InstructionEntry::new("d", "second"), true)
        .await
        .unwrap();
    let CreateOutcome::Overwritten(record) = outcome else {
        panic!("expected Overwritten");
    };
    assert_eq!(record.body, "second");
    assert_eq!(record.version, "1.0.1");
    assert_eq!(record.change_log.len(), 2);
}

#[tokio::test]
async fn bootstrap_ids_never_reach_the_index() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;
    store.create(InstructionEntry::new("real", "r"), false).await.unwrap();

    // Plant a bootstrap record behind the store's back.
    let mut seed = store.get("real").unwrap();
    seed.id = "000-bootstrapper".to_string();
    std::fs::write(
        record_path(&tmp, "000-bootstrapper"),
        serde_json::to_string_pretty(&seed).unwrap(),
    )
    .unwrap();

    let summary = store.rescan().await.unwrap();
    assert_eq!(summary.reserved_skipped, vec!["000-bootstrapper".to_string()]);
    assert!(store.get("000-bootstrapper").is_err());

    let health = store.health().await;
    assert_eq!(health.recursion_risk, "none");
    assert!(health.leakage.leaked_ids.is_empty());
    assert_eq!(health.status, "ok");

    let err = store
        .create(InstructionEntry::new("001-lifecycle-bootstrap", "x"), false)
        .await
        .unwrap_err();
    assert!(matches!(err, CatalogError::ValidationFailed { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_updates_to_one_id_are_serialized() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(open_store(&tmp).await);
    store.create(InstructionEntry::new("hot", "v0"), false).await.unwrap();

    let mut handles = Vec::new();
    for i in 1..=10 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            let mut patch = InstructionEntry::patch("hot");
            patch.body = Some(format!("v{i}"));
            store.update(patch).await.unwrap()
        }));
    }
    let mut versions = Vec::new();
    for h in handles {
        versions.push(h.await.unwrap().version);
    }
    versions.sort_by_key(|v| v.rsplit('.').next().unwrap().parse::<u32>().unwrap());

    let expected: Vec<String> = (1..=10).map(|p| format!("1.0.{p}")).collect();
    assert_eq!(versions, expected);

    let record = store.get("hot").unwrap();
    assert_eq!(record.version, "1.0.10");
    assert_eq!(record.change_log.len(), 11);
    assert_eq!(read_disk(&tmp, "hot"), record);
}

#[tokio::test]
async fn failed_write_leaves_index_unchanged() {
    let tmp = TempDir::new().unwrap();
    let backend = FlakyStore::open(&tmp).await;
    let store = CatalogStore::with_backend(mutable_config(&tmp), backend.clone(), Arc::new(NoopResolver));
    store.load().await.unwrap();
    store.create(InstructionEntry::new("stable", "keep me"), false).await.unwrap();
    let hash_before = store.governance_hash().unwrap();

    backend.fail_writes.store(true, Ordering::SeqCst);
    let err = store
        .create(InstructionEntry::new("doomed", "never lands"), false)
        .await
        .unwrap_err();
    assert!(matches!(err, CatalogError::Io { .. }));
    assert!(store.get("doomed").is_err());

    let err = store
        .update(InstructionEntry::patch("stable").with_owner("someone"))
        .await
        .unwrap_err();
    assert!(matches!(err, CatalogError::Io { .. }));
    assert_eq!(store.get("stable").unwrap().owner, "unowned");
    assert_eq!(store.governance_hash().unwrap(), hash_before);

    // Locks were released: the same ids are writable again.
    backend.fail_writes.store(false, Ordering::SeqCst);
    store.create(InstructionEntry::new("doomed", "lands now"), false).await.unwrap();
    store
        .update(InstructionEntry::patch("stable").with_owner("someone"))
        .await
        .unwrap();
    assert_eq!(store.get("stable").unwrap().owner, "someone");
}

#[tokio::test]
async fn corrupted_files_are_reported_not_fatal() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;
    store.create(InstructionEntry::new("ok", "fine"), false).await.unwrap();
    std::fs::write(record_path(&tmp, "broken"), "{\"id\": \"broken\", ").unwrap();

    let summary = store.rescan().await.unwrap();
    assert_eq!(summary.loaded, 1);
    assert_eq!(summary.corrupted.len(), 1);
    assert_eq!(summary.corrupted[0].id, "broken");
    assert_eq!(summary.corrupted[0].code, "CORRUPTED_RECORD");

    let health = store.health().await;
    assert_eq!(health.extra, vec!["broken".to_string()]);
    assert_eq!(health.status, "drift");
}

#[tokio::test]
async fn groom_dry_run_reports_without_writing() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;
    store.create(InstructionEntry::new("drift", "body"), false).await.unwrap();

    let mut tampered = read_disk(&tmp, "drift");
    tampered.body = "edited by hand".to_string();
    let tampered_json = serde_json::to_string_pretty(&tampered).unwrap();
    std::fs::write(record_path(&tmp, "drift"), &tampered_json).unwrap();
    store.rescan().await.unwrap();

    let audit = store.audit();
    assert_eq!(audit.mismatches.len(), 1);
    // Auditing never repairs.
    assert_eq!(std::fs::read_to_string(record_path(&tmp, "drift")).unwrap(), tampered_json);

    let dry = store.groom(GroomMode { dry_run: true }).await.unwrap();
    assert_eq!(dry.changes.len(), 1);
    assert_eq!(dry.changes[0].fields, vec!["sourceHash".to_string()]);
    assert_eq!(std::fs::read_to_string(record_path(&tmp, "drift")).unwrap(), tampered_json);

    let applied = store.groom(GroomMode { dry_run: false }).await.unwrap();
    assert_eq!(applied.changes, dry.changes);
    let repaired = read_disk(&tmp, "drift");
    assert_eq!(repaired.source_hash, sha256_hex("edited by hand"));
    assert_eq!(repaired.version, tampered.version);
    assert_eq!(repaired.change_log.len(), tampered.change_log.len() + 1);
    assert!(store.audit().mismatches.is_empty());
}

#[tokio::test]
async fn owner_resolution_on_load_moves_the_hash() {
    let tmp = TempDir::new().unwrap();
    {
        let store = open_store(&tmp).await;
        store.create(InstructionEntry::new("api-errors", "x"), false).await.unwrap();
        store.create(InstructionEntry::new("ui-colors", "y"), false).await.unwrap();
    }

    let plain = open_store(&tmp).await;
    let unresolved = plain.governance_hash().unwrap();

    let resolver: Arc<dyn OwnerResolver> = Arc::new(OwnershipMap::new([("api-*", "api-guild")]));
    let backend = Arc::new(FsRecordStore::open(tmp.path().join("instructions")).await.unwrap());
    let store = CatalogStore::with_backend(mutable_config(&tmp), backend, resolver);
    let summary = store.load().await.unwrap();

    assert_eq!(summary.owners_resolved, 1);
    assert_eq!(store.get("api-errors").unwrap().owner, "api-guild");
    assert_eq!(read_disk(&tmp, "api-errors").owner, "api-guild");
    assert_eq!(store.get("ui-colors").unwrap().owner, "unowned");
    assert_ne!(store.governance_hash().unwrap(), unresolved);
}

#[tokio::test]
async fn health_reports_files_removed_behind_the_store() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;
    store.create(InstructionEntry::new("a", "1"), false).await.unwrap();
    store.create(InstructionEntry::new("b", "2"), false).await.unwrap();
    std::fs::remove_file(record_path(&tmp, "b")).unwrap();

    let health = store.health().await;
    assert_eq!(health.missing, vec!["b".to_string()]);
    assert!(health.extra.is_empty());
    assert_eq!(health.count, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reads_do_not_wait_for_a_slow_write() {
    let tmp = TempDir::new().unwrap();
    let backend = FlakyStore::open(&tmp).await;
    let store = Arc::new(CatalogStore::with_backend(
        mutable_config(&tmp),
        backend.clone(),
        Arc::new(NoopResolver),
    ));
    store.load().await.unwrap();
    store.create(InstructionEntry::new("settled", "s"), false).await.unwrap();
    let hash_before = store.governance_hash().unwrap();

    backend.write_delay_ms.store(2_000, Ordering::SeqCst);
    let writer = {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            store
                .create(InstructionEntry::new("pending", "p"), false)
                .await
                .unwrap()
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    assert_eq!(store.get("settled").unwrap().body, "s");
    assert!(store.get("pending").is_err());
    assert_eq!(store.list(&Default::default()).unwrap().len(), 1);
    assert_eq!(store.governance_hash().unwrap(), hash_before);
    assert!(started.elapsed() < Duration::from_millis(500));
    assert!(!writer.is_finished(), "write should still be pending");

    writer.await.unwrap();
    assert!(store.get("pending").is_ok());
    assert_ne!(store.governance_hash().unwrap(), hash_before);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn groom_pass_excludes_per_id_writes() {
    let tmp = TempDir::new().unwrap();
    let backend = FlakyStore::open(&tmp).await;
    let store = Arc::new(CatalogStore::with_backend(
        mutable_config(&tmp),
        backend.clone(),
        Arc::new(NoopResolver),
    ));
    store.load().await.unwrap();
    store.create(InstructionEntry::new("stale", "body"), false).await.unwrap();

    let mut tampered = read_disk(&tmp, "stale");
    tampered.body = "hand edit".to_string();
    std::fs::write(
        record_path(&tmp, "stale"),
        serde_json::to_string_pretty(&tampered).unwrap(),
    )
    .unwrap();
    store.rescan().await.unwrap();

    backend.write_delay_ms.store(1_000, Ordering::SeqCst);
    let groom = {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            let report = store.groom(GroomMode { dry_run: false }).await.unwrap();
            let late_visible = store.get("late").is_ok();
            (report, late_visible, Instant::now())
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    let create = {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            store
                .create(InstructionEntry::new("late", "arrived mid-groom"), false)
                .await
                .unwrap();
            Instant::now()
        })
    };

    let (report, late_visible, groom_done) = groom.await.unwrap();
    let create_done = create.await.unwrap();

    assert_eq!(report.examined, 1);
    assert_eq!(report.changes.len(), 1);
    assert_eq!(report.changes[0].id, "stale");
    assert!(!late_visible, "create landed before the groom pass finished");
    assert!(create_done > groom_done);
    assert!(store.get("late").is_ok());
}

#[tokio::test]
async fn groom_reports_record_with_unrepresentable_review_date() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;
    store.create(InstructionEntry::new("ok", "fine"), false).await.unwrap();
    store.create(InstructionEntry::new("far", "body"), false).await.unwrap();

    let mut edited = read_disk(&tmp, "far");
    edited.review_interval_days = Some(u32::MAX);
    std::fs::write(
        record_path(&tmp, "far"),
        serde_json::to_string_pretty(&edited).unwrap(),
    )
    .unwrap();
    store.rescan().await.unwrap();

    let report = store.groom(GroomMode { dry_run: false }).await.unwrap();
    assert_eq!(report.examined, 2);
    assert!(report.changes.is_empty());
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].id, "far");
    assert_eq!(read_disk(&tmp, "far"), edited);

    let mut patch = InstructionEntry::patch("far");
    patch.body = Some("new body".to_string());
    assert!(matches!(
        store.update(patch).await,
        Err(CatalogError::ValidationFailed { .. })
    ));
    assert_eq!(store.get("far").unwrap(), edited);
}
