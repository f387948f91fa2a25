mod common;

use std::sync::{Arc, Mutex};

use chunkvault_core::chunker::sha256_hex;
use chunkvault_core::repopulate::ensure_consistent;
use chunkvault_core::snapshot::load_snapshot;
use chunkvault_core::{
    BackupOptions, BackupStatus, ChunkCache, Engine, FileHandle, HandleKind, InMemoryBackend,
    KeyProvider, KeyPurpose, MasterKey, ProgressSink, PruneOptions, RestoreOptions, RunPhase,
    RunProgress,
};
use common::*;
use tempfile::TempDir;

#[tokio::test]
async fn pruning_drops_only_chunks_nothing_references() {
    let temp = TempDir::new().unwrap();
    let backend = Arc::new(InMemoryBackend::new());
    let engine = engine_with(temp.path(), backend.clone(), &MasterKey::generate(), config()).await;

    let old = pattern(1, 100 * KIB);
    let new = pattern(2, 100 * KIB);
    let scanner = MemScanner::new();
    scanner.put("kept.txt", b"kept".to_vec(), 1);
    scanner.put("doc.bin", old.clone(), 1);
    engine.backup(&scanner, BackupOptions::default()).await.unwrap();

    scanner.put("doc.bin", new.clone(), 2);
    engine.backup(&scanner, BackupOptions::default()).await.unwrap();
    engine.backup(&scanner, BackupOptions::default()).await.unwrap();
    assert_eq!(backend.count(HandleKind::Blob).await, 3);

    let new_chunk = engine.cache().get_chunk(&sha256_hex(&new)).await.unwrap().unwrap();
    assert_eq!(new_chunk.ref_count, 2);

    // all three runs share one day, so only the newest snapshot is retained
    let removes_before = backend.removes();
    let outcome = engine.prune(PruneOptions::default()).await.unwrap();
    assert_eq!(outcome.snapshots_considered, 3);
    assert_eq!(outcome.snapshots_deleted, 2);
    assert_eq!(outcome.chunks_deleted, 1);
    assert!(outcome.failures.is_empty());
    assert_eq!(backend.removes() - removes_before, 3);

    let folder = engine.folder().clone();
    assert!(backend.get(&FileHandle::blob(&folder, sha256_hex(&old))).await.is_none());
    assert!(engine.cache().get_chunk(&sha256_hex(&old)).await.unwrap().is_none());
    let new_chunk = engine.cache().get_chunk(&sha256_hex(&new)).await.unwrap().unwrap();
    assert_eq!(new_chunk.ref_count, 1);
    assert!(engine.cache().journaled_snapshots().await.unwrap().is_empty());

    let latest = engine.list_snapshots().await.unwrap();
    assert_eq!(latest.len(), 1);
    let writer = CollectingWriter::default();
    engine
        .restore(&latest[0].handle, &writer, RestoreOptions::default())
        .await
        .unwrap();
    assert_eq!(writer.contents(), scanner.contents());
}

#[tokio::test]
async fn backup_and_prune_prunes_after_success() {
    let temp = TempDir::new().unwrap();
    let backend = Arc::new(InMemoryBackend::new());
    let engine = engine_with(temp.path(), backend.clone(), &MasterKey::generate(), config()).await;

    let scanner = MemScanner::new();
    scanner.put("a.txt", b"a".to_vec(), 1);
    let (_, pruned) = engine
        .backup_and_prune(&scanner, BackupOptions::default(), PruneOptions::default())
        .await
        .unwrap();
    assert_eq!(pruned.unwrap().snapshots_deleted, 0);

    scanner.put("a.txt", b"b".to_vec(), 2);
    let (outcome, pruned) = engine
        .backup_and_prune(&scanner, BackupOptions::default(), PruneOptions::default())
        .await
        .unwrap();
    assert_eq!(outcome.status, BackupStatus::Succeeded);
    let pruned = pruned.unwrap();
    assert_eq!(pruned.snapshots_deleted, 1);
    assert_eq!(pruned.chunks_deleted, 1);
    assert_eq!(backend.count(HandleKind::Snapshot).await, 1);
    assert_eq!(backend.count(HandleKind::Blob).await, 1);
}

struct GuardRecorder<'a> {
    engine: &'a Engine,
    seen: Mutex<Vec<(RunPhase, bool)>>,
}

impl ProgressSink for GuardRecorder<'_> {
    fn report(&self, progress: &RunProgress) {
        let held = self.engine.is_backup_running();
        self.seen.lock().unwrap().push((progress.phase, held));
    }
}

#[tokio::test]
async fn backup_and_prune_holds_the_backup_guard_throughout() {
    let temp = TempDir::new().unwrap();
    let backend = Arc::new(InMemoryBackend::new());
    let engine = engine_with(temp.path(), backend.clone(), &MasterKey::generate(), config()).await;

    let scanner = MemScanner::new();
    scanner.put("a.txt", b"a".to_vec(), 1);
    engine.backup(&scanner, BackupOptions::default()).await.unwrap();
    scanner.put("a.txt", b"b".to_vec(), 2);

    let recorder = GuardRecorder {
        engine: &engine,
        seen: Mutex::new(Vec::new()),
    };
    let (_, pruned) = engine
        .backup_and_prune(
            &scanner,
            BackupOptions {
                progress: Some(&recorder),
                ..BackupOptions::default()
            },
            PruneOptions {
                progress: Some(&recorder),
                ..PruneOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(pruned.unwrap().snapshots_deleted, 1);
    assert!(!engine.is_backup_running());

    let seen = recorder.seen.into_inner().unwrap();
    assert!(seen.iter().any(|(phase, _)| *phase == RunPhase::Prune), "{seen:?}");
    assert!(seen.iter().all(|(_, held)| *held), "{seen:?}");
}

#[tokio::test]
async fn interrupted_prune_is_finished_by_the_next_one() {
    let temp = TempDir::new().unwrap();
    let backend = Arc::new(InMemoryBackend::new());
    let key = MasterKey::generate();
    let engine = engine_with(temp.path(), backend.clone(), &key, config()).await;

    let scanner = MemScanner::new();
    let old = pattern(3, 100 * KIB);
    scanner.put("doc.bin", old.clone(), 1);
    let first = engine.backup(&scanner, BackupOptions::default()).await.unwrap();
    scanner.put("doc.bin", pattern(4, 100 * KIB), 2);
    engine.backup(&scanner, BackupOptions::default()).await.unwrap();

    // decrements applied and journaled, but the blobs were never removed
    let stream = key.derive_sub_key(KeyPurpose::Stream).unwrap();
    let handle = first.snapshot.unwrap();
    let snapshot = load_snapshot(&*backend, &stream, &handle).await.unwrap();
    assert!(
        engine
            .cache()
            .journal_prune_decrements(&handle.relative_path(), &snapshot.chunk_references())
            .await
            .unwrap()
    );

    let outcome = engine.prune(PruneOptions::default()).await.unwrap();
    assert_eq!(outcome.snapshots_resumed, 1);
    assert_eq!(outcome.snapshots_deleted, 0);
    assert_eq!(outcome.chunks_deleted, 1);
    assert!(backend.get(&handle).await.is_none());
    assert!(
        backend
            .get(&FileHandle::blob(engine.folder(), sha256_hex(&old)))
            .await
            .is_none()
    );
    assert!(engine.cache().journaled_snapshots().await.unwrap().is_empty());
    assert_eq!(engine.list_snapshots().await.unwrap().len(), 1);
}

#[tokio::test]
async fn repopulated_cache_matches_the_lost_one() {
    let temp = TempDir::new().unwrap();
    let backend = Arc::new(InMemoryBackend::new());
    let key = MasterKey::generate();
    let engine = engine_with(temp.path(), backend.clone(), &key, config()).await;

    let shared = pattern(5, MIB);
    let scanner = MemScanner::new();
    scanner.put("a.bin", shared.clone(), 1);
    scanner.put("b.bin", shared, 1);
    scanner.put("c.txt", b"c".to_vec(), 1);
    scanner.put("d.bin", pattern(6, 2 * MIB + 5), 1);
    engine.backup(&scanner, BackupOptions::default()).await.unwrap();
    scanner.put("d.bin", pattern(7, 2 * MIB + 5), 2);
    scanner.remove("c.txt");
    engine.backup(&scanner, BackupOptions::default()).await.unwrap();

    let expected = engine.cache().all_chunks().await.unwrap();
    assert!(!expected.is_empty());

    // an orphan the sweep should reclaim
    let orphan = FileHandle::blob(engine.folder(), sha256_hex(b"orphan"));
    backend.put_raw(orphan.clone(), vec![1, 2, 3]).await;

    let fresh_dir = TempDir::new().unwrap();
    let fresh = ChunkCache::open(&fresh_dir.path().join("cache.sqlite")).await.unwrap();
    let stream = key.derive_sub_key(KeyPurpose::Stream).unwrap();
    let outcome = ensure_consistent(&fresh, &*backend, &stream, engine.folder())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome.snapshots, 2);
    assert_eq!(outcome.missing_chunks, 0);
    assert_eq!(outcome.orphans_removed, 1);
    assert!(backend.get(&orphan).await.is_none());

    assert_eq!(fresh.all_chunks().await.unwrap(), expected);
    assert!(
        ensure_consistent(&fresh, &*backend, &stream, engine.folder())
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn chunk_deleted_out_of_band_is_uploaded_again_with_its_references() {
    let temp = TempDir::new().unwrap();
    let backend = Arc::new(InMemoryBackend::new());
    let engine = engine_with(temp.path(), backend.clone(), &MasterKey::generate(), config()).await;

    let doc = pattern(8, 100 * KIB);
    let scanner = MemScanner::new();
    scanner.put("doc.bin", doc.clone(), 1);
    engine.backup(&scanner, BackupOptions::default()).await.unwrap();

    let chunk = FileHandle::blob(engine.folder(), sha256_hex(&doc));
    backend.delete_raw(&chunk).await.unwrap();

    let outcome = engine.backup(&scanner, BackupOptions::default()).await.unwrap();
    assert!(outcome.counters.cache_repopulated);
    assert_eq!(outcome.counters.chunks_uploaded, 1);
    assert!(backend.get(&chunk).await.is_some());

    // referenced by both snapshots, including the one written before the loss
    let cached = engine.cache().get_chunk(&sha256_hex(&doc)).await.unwrap().unwrap();
    assert_eq!(cached.ref_count, 2);

    let pruned = engine.prune(PruneOptions::default()).await.unwrap();
    assert_eq!(pruned.snapshots_deleted, 1);
    assert_eq!(pruned.chunks_deleted, 0);

    let latest = engine.list_snapshots().await.unwrap();
    let writer = CollectingWriter::default();
    engine
        .restore(&latest[0].handle, &writer, RestoreOptions::default())
        .await
        .unwrap();
    assert_eq!(writer.contents()["doc.bin"], doc);
}
