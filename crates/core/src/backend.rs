use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Mutex;

use crate::handle::{FileHandle, HandleKind, TopLevelFolder};
use crate::{Error, Result};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobInfo {
    pub handle: FileHandle,
    pub size: u64,
}

/// Remote blob store. Implementations own timeouts and retries; listings are advisory.
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    fn save<'a>(&'a self, handle: &'a FileHandle, bytes: Vec<u8>) -> BoxFuture<'a, ()>;

    fn load<'a>(&'a self, handle: &'a FileHandle) -> BoxFuture<'a, Vec<u8>>;

    /// Lists blobs of the given kinds, optionally limited to one owner folder.
    fn list<'a>(
        &'a self,
        folder: Option<&'a TopLevelFolder>,
        kinds: &'a [HandleKind],
    ) -> BoxFuture<'a, Vec<BlobInfo>>;

    fn remove<'a>(&'a self, handle: &'a FileHandle) -> BoxFuture<'a, ()>;

    fn rename<'a>(&'a self, from: &'a TopLevelFolder, to: &'a TopLevelFolder)
    -> BoxFuture<'a, ()>;

    fn remove_all(&self) -> BoxFuture<'_, ()>;
}

#[derive(Debug, Default)]
pub struct InMemoryBackend {
    pub saved: AtomicUsize,
    pub removed: AtomicUsize,
    inner: Mutex<BTreeMap<FileHandle, Vec<u8>>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, handle: &FileHandle) -> Option<Vec<u8>> {
        self.inner.lock().await.get(handle).cloned()
    }

    pub async fn put_raw(&self, handle: FileHandle, bytes: Vec<u8>) {
        self.inner.lock().await.insert(handle, bytes);
    }

    pub async fn delete_raw(&self, handle: &FileHandle) -> Option<Vec<u8>> {
        self.inner.lock().await.remove(handle)
    }

    pub async fn count(&self, kind: HandleKind) -> usize {
        self.inner
            .lock()
            .await
            .keys()
            .filter(|h| h.kind() == kind)
            .count()
    }

    pub fn saves(&self) -> usize {
        self.saved.load(Ordering::Relaxed)
    }

    pub fn removes(&self) -> usize {
        self.removed.load(Ordering::Relaxed)
    }
}

impl Backend for InMemoryBackend {
    fn name(&self) -> &'static str {
        "test.mem"
    }

    fn save<'a>(&'a self, handle: &'a FileHandle, bytes: Vec<u8>) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.inner.lock().await.insert(handle.clone(), bytes);
            self.saved.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
    }

    fn load<'a>(&'a self, handle: &'a FileHandle) -> BoxFuture<'a, Vec<u8>> {
        Box::pin(async move {
            self.inner
                .lock()
                .await
                .get(handle)
                .cloned()
                .ok_or_else(|| Error::NotFound {
                    path: handle.relative_path(),
                })
        })
    }

    fn list<'a>(
        &'a self,
        folder: Option<&'a TopLevelFolder>,
        kinds: &'a [HandleKind],
    ) -> BoxFuture<'a, Vec<BlobInfo>> {
        Box::pin(async move {
            Ok(self
                .inner
                .lock()
                .await
                .iter()
                .filter(|(h, _)| folder.is_none_or(|f| h.folder() == f))
                .filter(|(h, _)| kinds.contains(&h.kind()))
                .map(|(h, b)| BlobInfo {
                    handle: h.clone(),
                    size: b.len() as u64,
                })
                .collect())
        })
    }

    fn remove<'a>(&'a self, handle: &'a FileHandle) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let mut inner = self.inner.lock().await;
            match handle {
                FileHandle::TopLevelFolder(folder) => inner.retain(|h, _| h.folder() != folder),
                other => {
                    inner.remove(other);
                }
            }
            self.removed.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
    }

    fn rename<'a>(
        &'a self,
        from: &'a TopLevelFolder,
        to: &'a TopLevelFolder,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let mut inner = self.inner.lock().await;
            if inner.keys().any(|h| h.folder() == to) {
                return Err(Error::Backend {
                    message: format!("rename target exists: {}", to.name()),
                });
            }
            let moved: Vec<FileHandle> = inner
                .keys()
                .filter(|h| h.folder() == from)
                .cloned()
                .collect();
            for old in moved {
                if let Some(bytes) = inner.remove(&old) {
                    inner.insert(with_folder(old, to), bytes);
                }
            }
            Ok(())
        })
    }

    fn remove_all(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.inner.lock().await.clear();
            Ok(())
        })
    }
}

pub(crate) fn with_folder(handle: FileHandle, to: &TopLevelFolder) -> FileHandle {
    match handle {
        FileHandle::TopLevelFolder(_) => FileHandle::TopLevelFolder(to.clone()),
        FileHandle::Blob { hash, .. } => FileHandle::blob(to, hash),
        FileHandle::Snapshot { name, .. } => FileHandle::snapshot(to, name),
    }
}
