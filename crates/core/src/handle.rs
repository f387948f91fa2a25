use std::fmt;

use crate::{Error, Result};

pub const FOLDER_SUFFIX: &str = ".cv";
pub const SNAPSHOT_SUFFIX: &str = ".snapshot";

/// A backup owner's folder, `"{owner}.cv"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopLevelFolder {
    pub owner: String,
}

impl TopLevelFolder {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
        }
    }

    pub fn name(&self) -> String {
        format!("{}{FOLDER_SUFFIX}", self.owner)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SnapshotName {
    /// Milliseconds since the Unix epoch.
    Time(i64),
    /// Lowercase hex SHA-256 of the encrypted snapshot blob.
    Hash(String),
}

impl fmt::Display for SnapshotName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotName::Time(t) => write!(f, "{t}"),
            SnapshotName::Hash(h) => f.write_str(h),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    TopLevelFolder,
    Blob,
    Snapshot,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FileHandle {
    TopLevelFolder(TopLevelFolder),
    Blob {
        folder: TopLevelFolder,
        hash: String,
    },
    Snapshot {
        folder: TopLevelFolder,
        name: SnapshotName,
    },
}

impl FileHandle {
    pub fn blob(folder: &TopLevelFolder, hash: impl Into<String>) -> Self {
        FileHandle::Blob {
            folder: folder.clone(),
            hash: hash.into(),
        }
    }

    pub fn snapshot(folder: &TopLevelFolder, name: SnapshotName) -> Self {
        FileHandle::Snapshot {
            folder: folder.clone(),
            name,
        }
    }

    pub fn kind(&self) -> HandleKind {
        match self {
            FileHandle::TopLevelFolder(_) => HandleKind::TopLevelFolder,
            FileHandle::Blob { .. } => HandleKind::Blob,
            FileHandle::Snapshot { .. } => HandleKind::Snapshot,
        }
    }

    pub fn folder(&self) -> &TopLevelFolder {
        match self {
            FileHandle::TopLevelFolder(folder) => folder,
            FileHandle::Blob { folder, .. } | FileHandle::Snapshot { folder, .. } => folder,
        }
    }

    pub fn relative_path(&self) -> String {
        match self {
            FileHandle::TopLevelFolder(folder) => folder.name(),
            FileHandle::Blob { folder, hash } => {
                let prefix = hash.get(..2).unwrap_or(hash);
                format!("{}/{prefix}/{hash}", folder.name())
            }
            FileHandle::Snapshot { folder, name } => {
                format!("{}/{name}{SNAPSHOT_SUFFIX}", folder.name())
            }
        }
    }

    /// Inverse of [`FileHandle::relative_path`]. Paths use `/` separators.
    pub fn parse(path: &str) -> Result<Self> {
        let invalid = || Error::InvalidConfig {
            message: format!("not a storage path: {path}"),
        };

        let parts: Vec<&str> = path.split('/').collect();
        let folder = parts
            .first()
            .and_then(|p| p.strip_suffix(FOLDER_SUFFIX))
            .filter(|o| !o.is_empty())
            .map(TopLevelFolder::new)
            .ok_or_else(invalid)?;

        match parts.as_slice() {
            [_] => Ok(FileHandle::TopLevelFolder(folder)),
            [_, file] => {
                let stem = file.strip_suffix(SNAPSHOT_SUFFIX).ok_or_else(invalid)?;
                let name = if is_hex_hash(stem) {
                    SnapshotName::Hash(stem.to_string())
                } else {
                    SnapshotName::Time(stem.parse::<i64>().map_err(|_| invalid())?)
                };
                Ok(FileHandle::Snapshot { folder, name })
            }
            [_, prefix, hash] if is_hex_hash(hash) && hash.starts_with(prefix) => {
                if prefix.len() != 2 {
                    return Err(invalid());
                }
                Ok(FileHandle::Blob {
                    folder,
                    hash: hash.to_string(),
                })
            }
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.relative_path())
    }
}

pub fn is_hex_hash(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
