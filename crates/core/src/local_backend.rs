use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::backend::{Backend, BlobInfo, BoxFuture};
use crate::handle::{FileHandle, HandleKind, TopLevelFolder};
use crate::{Error, Result};

const PARTIAL_SUFFIX: &str = ".partial";

/// Stores blobs as plain files below `root`, one directory per owner folder.
#[derive(Debug, Clone)]
pub struct LocalDirBackend {
    root: PathBuf,
}

impl LocalDirBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, handle: &FileHandle) -> PathBuf {
        self.root.join(handle.relative_path())
    }
}

impl Backend for LocalDirBackend {
    fn name(&self) -> &'static str {
        "local.dir"
    }

    fn save<'a>(&'a self, handle: &'a FileHandle, bytes: Vec<u8>) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let path = self.path_of(handle);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let tmp = path.with_extension(format!(
                "{}{PARTIAL_SUFFIX}",
                uuid::Uuid::new_v4().simple()
            ));
            tokio::fs::write(&tmp, &bytes).await?;
            if let Err(e) = tokio::fs::rename(&tmp, &path).await {
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(e.into());
            }
            Ok(())
        })
    }

    fn load<'a>(&'a self, handle: &'a FileHandle) -> BoxFuture<'a, Vec<u8>> {
        Box::pin(async move {
            match tokio::fs::read(self.path_of(handle)).await {
                Ok(bytes) => Ok(bytes),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::NotFound {
                    path: handle.relative_path(),
                }),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn list<'a>(
        &'a self,
        folder: Option<&'a TopLevelFolder>,
        kinds: &'a [HandleKind],
    ) -> BoxFuture<'a, Vec<BlobInfo>> {
        Box::pin(async move {
            let start = match folder {
                Some(f) => self.root.join(f.name()),
                None => self.root.clone(),
            };
            if !start.is_dir() {
                return Ok(Vec::new());
            }

            let mut out = Vec::new();
            for entry in WalkDir::new(&start).follow_links(false) {
                let entry = entry?;
                let rel = entry
                    .path()
                    .strip_prefix(&self.root)
                    .map_err(|_| Error::Backend {
                        message: "path strip_prefix failed".to_string(),
                    })?;
                let Some(rel) = rel_to_slash(rel) else {
                    continue;
                };
                if rel.is_empty() || rel.ends_with(PARTIAL_SUFFIX) {
                    continue;
                }
                let Ok(handle) = FileHandle::parse(&rel) else {
                    if entry.file_type().is_file() {
                        debug!(event = "backend.list.skip", path = %rel, "backend.list.skip");
                    }
                    continue;
                };
                if !kinds.contains(&handle.kind()) {
                    continue;
                }
                let size = if entry.file_type().is_file() {
                    entry.metadata()?.len()
                } else {
                    0
                };
                out.push(BlobInfo { handle, size });
            }
            Ok(out)
        })
    }

    fn remove<'a>(&'a self, handle: &'a FileHandle) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let path = self.path_of(handle);
            let res = match handle {
                FileHandle::TopLevelFolder(_) => tokio::fs::remove_dir_all(&path).await,
                _ => tokio::fs::remove_file(&path).await,
            };
            match res {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    warn!(
                        event = "backend.remove.missing",
                        path = %handle,
                        "backend.remove.missing"
                    );
                    Ok(())
                }
                Err(e) => Err(e.into()),
            }
        })
    }

    fn rename<'a>(
        &'a self,
        from: &'a TopLevelFolder,
        to: &'a TopLevelFolder,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let target = self.root.join(to.name());
            if tokio::fs::try_exists(&target).await? {
                return Err(Error::Backend {
                    message: format!("rename target exists: {}", to.name()),
                });
            }
            tokio::fs::rename(self.root.join(from.name()), target).await?;
            Ok(())
        })
    }

    fn remove_all(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if !self.root.is_dir() {
                return Ok(());
            }
            let mut dir = tokio::fs::read_dir(&self.root).await?;
            while let Some(entry) = dir.next_entry().await? {
                let name = entry.file_name();
                let is_ours = name
                    .to_str()
                    .is_some_and(|n| matches!(FileHandle::parse(n), Ok(FileHandle::TopLevelFolder(_))));
                if is_ours {
                    tokio::fs::remove_dir_all(entry.path()).await?;
                }
            }
            Ok(())
        })
    }
}

fn rel_to_slash(rel: &Path) -> Option<String> {
    let mut parts = Vec::new();
    for c in rel.components() {
        parts.push(c.as_os_str().to_str()?);
    }
    Some(parts.join("/"))
}
