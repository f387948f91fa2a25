#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chunkvault_core::{
    Backend, BlobInfo, BoxFuture, ChunkCache, ChunkingConfig, ContentFile, Engine, EngineConfig,
    Error, FileHandle, FileReader, FileWriter, HandleKind, InMemoryBackend, MasterKey, Scanner,
    SnapshotFile, TopLevelFolder,
};

pub const KIB: usize = 1024;
pub const MIB: usize = 1024 * 1024;

pub fn small_chunking() -> ChunkingConfig {
    ChunkingConfig {
        chunk_size_max: MIB,
        small_file_size_max: 64 * KIB,
        zip_chunk_size_max: 256 * KIB,
    }
}

pub fn config() -> EngineConfig {
    let mut cfg = EngineConfig::new("phone");
    cfg.chunking = small_chunking();
    cfg
}

pub async fn engine_with(
    dir: &Path,
    backend: Arc<dyn Backend>,
    key: &MasterKey,
    config: EngineConfig,
) -> Engine {
    let cache = ChunkCache::open(&dir.join("cache.sqlite")).await.unwrap();
    Engine::new(backend, cache, key, config).unwrap()
}

/// Deterministic, non-repeating bytes.
pub fn pattern(seed: u8, len: usize) -> Vec<u8> {
    let mut x = 0x9e37_79b9u32 ^ u32::from(seed);
    (0..len)
        .map(|_| {
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            (x >> 24) as u8
        })
        .collect()
}

#[derive(Default)]
pub struct MemScanner {
    files: Mutex<BTreeMap<String, (Vec<u8>, i64)>>,
}

impl MemScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, id: &str, bytes: Vec<u8>, mtime: i64) {
        self.files
            .lock()
            .unwrap()
            .insert(id.to_string(), (bytes, mtime));
    }

    pub fn remove(&self, id: &str) {
        self.files.lock().unwrap().remove(id);
    }

    pub fn contents(&self) -> BTreeMap<String, Vec<u8>> {
        self.files
            .lock()
            .unwrap()
            .iter()
            .map(|(k, (b, _))| (k.clone(), b.clone()))
            .collect()
    }
}

impl Scanner for MemScanner {
    fn scan(&self) -> BoxFuture<'_, Vec<ContentFile>> {
        Box::pin(async move {
            Ok(self
                .files
                .lock()
                .unwrap()
                .iter()
                .map(|(id, (bytes, mtime))| ContentFile {
                    id: id.clone(),
                    size: bytes.len() as u64,
                    last_modified: Some(*mtime),
                })
                .collect())
        })
    }

    fn open<'a>(&'a self, file: &'a ContentFile) -> BoxFuture<'a, FileReader<'a>> {
        Box::pin(async move {
            let bytes = self
                .files
                .lock()
                .unwrap()
                .get(&file.id)
                .map(|(b, _)| b.clone())
                .ok_or_else(|| Error::NotFound {
                    path: file.id.clone(),
                })?;
            Ok(Box::new(std::io::Cursor::new(bytes)) as FileReader<'a>)
        })
    }
}

#[derive(Default)]
pub struct CollectingWriter {
    pub files: Mutex<BTreeMap<String, (Vec<u8>, Option<i64>)>>,
}

impl CollectingWriter {
    pub fn contents(&self) -> BTreeMap<String, Vec<u8>> {
        self.files
            .lock()
            .unwrap()
            .iter()
            .map(|(k, (b, _))| (k.clone(), b.clone()))
            .collect()
    }
}

impl FileWriter for CollectingWriter {
    fn write<'a>(&'a self, record: &'a SnapshotFile, bytes: Vec<u8>) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.files
                .lock()
                .unwrap()
                .insert(record.id.clone(), (bytes, record.last_modified));
            Ok(())
        })
    }
}

/// Wraps a backend and fails saves of the listed chunk hashes, or of snapshots when armed.
pub struct FailOnSave {
    pub inner: Arc<InMemoryBackend>,
    pub fail_chunks: Mutex<HashSet<String>>,
    pub fail_snapshots: AtomicBool,
    /// Snapshot saves are stored, then reported as failed.
    pub drop_snapshot_acks: AtomicBool,
}

impl FailOnSave {
    pub fn new(inner: Arc<InMemoryBackend>) -> Self {
        Self {
            inner,
            fail_chunks: Mutex::new(HashSet::new()),
            fail_snapshots: AtomicBool::new(false),
            drop_snapshot_acks: AtomicBool::new(false),
        }
    }

    pub fn fail_chunk(&self, id: &str) {
        self.fail_chunks.lock().unwrap().insert(id.to_string());
    }

    pub fn heal(&self) {
        self.fail_chunks.lock().unwrap().clear();
        self.fail_snapshots.store(false, Ordering::Relaxed);
        self.drop_snapshot_acks.store(false, Ordering::Relaxed);
    }

    fn should_fail(&self, handle: &FileHandle) -> bool {
        match handle {
            FileHandle::Blob { hash, .. } => self.fail_chunks.lock().unwrap().contains(hash),
            FileHandle::Snapshot { .. } => self.fail_snapshots.load(Ordering::Relaxed),
            FileHandle::TopLevelFolder(_) => false,
        }
    }
}

impl Backend for FailOnSave {
    fn name(&self) -> &'static str {
        "test.fail_on_save"
    }

    fn save<'a>(&'a self, handle: &'a FileHandle, bytes: Vec<u8>) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if self.should_fail(handle) {
                return Err(Error::Backend {
                    message: format!("injected save failure: {handle}"),
                });
            }
            self.inner.save(handle, bytes).await?;
            if matches!(handle, FileHandle::Snapshot { .. })
                && self.drop_snapshot_acks.load(Ordering::Relaxed)
            {
                return Err(Error::Backend {
                    message: format!("injected timeout after save: {handle}"),
                });
            }
            Ok(())
        })
    }

    fn load<'a>(&'a self, handle: &'a FileHandle) -> BoxFuture<'a, Vec<u8>> {
        self.inner.load(handle)
    }

    fn list<'a>(
        &'a self,
        folder: Option<&'a TopLevelFolder>,
        kinds: &'a [HandleKind],
    ) -> BoxFuture<'a, Vec<BlobInfo>> {
        self.inner.list(folder, kinds)
    }

    fn remove<'a>(&'a self, handle: &'a FileHandle) -> BoxFuture<'a, ()> {
        self.inner.remove(handle)
    }

    fn rename<'a>(
        &'a self,
        from: &'a TopLevelFolder,
        to: &'a TopLevelFolder,
    ) -> BoxFuture<'a, ()> {
        self.inner.rename(from, to)
    }

    fn remove_all(&self) -> BoxFuture<'_, ()> {
        self.inner.remove_all()
    }
}
