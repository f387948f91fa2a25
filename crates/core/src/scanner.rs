use std::path::{Path, PathBuf};

use tokio::io::AsyncRead;
use walkdir::WalkDir;

use crate::backend::BoxFuture;
use crate::{Error, Result};

pub type FileReader<'a> = Box<dyn AsyncRead + Send + Unpin + 'a>;

/// A file as seen by the scanner at scan time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentFile {
    /// Stable source identity, unique within one scan.
    pub id: String,
    pub size: u64,
    /// Milliseconds since the Unix epoch.
    pub last_modified: Option<i64>,
}

pub trait Scanner: Send + Sync {
    fn scan(&self) -> BoxFuture<'_, Vec<ContentFile>>;

    fn open<'a>(&'a self, file: &'a ContentFile) -> BoxFuture<'a, FileReader<'a>>;
}

/// Regular files below a root directory, identified by their `/`-separated relative path.
#[derive(Debug, Clone)]
pub struct DirScanner {
    root: PathBuf,
}

impl DirScanner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn scan_blocking(root: &Path) -> Result<Vec<ContentFile>> {
        if !root.is_dir() {
            return Err(Error::InvalidConfig {
                message: format!("source must be an existing directory: {}", root.display()),
            });
        }

        let mut out = Vec::new();
        for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(root)
                .map_err(|_| Error::Internal {
                    message: "path strip_prefix failed".to_string(),
                })?;
            let id = relative_id(rel)?;
            let metadata = entry.metadata()?;
            let last_modified = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as i64);
            out.push(ContentFile {
                id,
                size: metadata.len(),
                last_modified,
            });
        }
        Ok(out)
    }
}

impl Scanner for DirScanner {
    fn scan(&self) -> BoxFuture<'_, Vec<ContentFile>> {
        Box::pin(async move {
            let root = self.root.clone();
            tokio::task::spawn_blocking(move || Self::scan_blocking(&root))
                .await
                .map_err(|e| Error::Internal {
                    message: format!("scan task failed: {e}"),
                })?
        })
    }

    fn open<'a>(&'a self, file: &'a ContentFile) -> BoxFuture<'a, FileReader<'a>> {
        Box::pin(async move {
            let f = tokio::fs::File::open(self.root.join(&file.id)).await?;
            Ok(Box::new(f) as FileReader<'a>)
        })
    }
}

fn relative_id(rel: &Path) -> Result<String> {
    let mut parts = Vec::new();
    for c in rel.components() {
        let s = c.as_os_str().to_str().ok_or_else(|| Error::NonUtf8Path {
            path: rel.to_path_buf(),
        })?;
        parts.push(s);
    }
    Ok(parts.join("/"))
}
