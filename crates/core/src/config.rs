use std::path::{Path, PathBuf};

use serde::de::Error as _;
use serde::{Deserialize, Serialize};

use crate::chunker::ChunkingConfig;
use crate::retention::RetentionPolicy;
use crate::snapshot::SnapshotNaming;
use crate::{Error, Result};

pub const SETTINGS_SCHEMA_VERSION: u32 = 1;
pub const DEFAULT_OWNER_ID: &str = "default";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub version: u32,
    #[serde(default = "default_owner_id")]
    pub owner_id: String,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retention: RetentionPolicy,
    #[serde(default)]
    pub snapshots: Snapshots,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshots {
    #[serde(default)]
    pub naming: SnapshotNaming,
}

fn default_owner_id() -> String {
    DEFAULT_OWNER_ID.to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: SETTINGS_SCHEMA_VERSION,
            owner_id: default_owner_id(),
            chunking: ChunkingConfig::default(),
            retention: RetentionPolicy::default(),
            snapshots: Snapshots::default(),
        }
    }
}

pub fn config_path(config_dir: &Path) -> PathBuf {
    config_dir.join("config.toml")
}

pub fn load_settings(config_dir: &Path) -> Result<Settings> {
    let path = config_path(config_dir);
    if !path.exists() {
        return Ok(Settings::default());
    }

    let text = std::fs::read_to_string(&path).map_err(|e| Error::InvalidConfig {
        message: format!("config read failed: {e}"),
    })?;

    let settings = parse_settings(&text).map_err(|e| Error::InvalidConfig {
        message: format!("config invalid: {e}"),
    })?;
    validate_settings(&settings)?;
    Ok(settings)
}

pub fn parse_settings(text: &str) -> std::result::Result<Settings, toml::de::Error> {
    let raw: toml::Value = toml::from_str(text)?;
    let version = raw
        .get("version")
        .and_then(|v| v.as_integer())
        .and_then(|v| u32::try_from(v).ok());

    match version {
        Some(SETTINGS_SCHEMA_VERSION) => toml::from_str::<Settings>(text),
        Some(other) => Err(toml::de::Error::custom(format!(
            "unsupported settings schema version: {other} (expected {SETTINGS_SCHEMA_VERSION})"
        ))),
        None => Err(toml::de::Error::custom("missing settings schema version")),
    }
}

pub fn to_toml(settings: &Settings) -> Result<String> {
    validate_settings(settings)?;
    toml::to_string(settings).map_err(|e| Error::InvalidConfig {
        message: format!("config encode failed: {e}"),
    })
}

pub fn save_settings(config_dir: &Path, settings: &Settings) -> Result<()> {
    let text = to_toml(settings)?;

    let path = config_path(config_dir);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::InvalidConfig {
            message: format!("config dir create failed: {e}"),
        })?;
    }

    atomic_write(&path, text.as_bytes()).map_err(|e| Error::InvalidConfig {
        message: format!("config write failed: {e}"),
    })?;
    Ok(())
}

pub fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.version != SETTINGS_SCHEMA_VERSION {
        return Err(Error::InvalidConfig {
            message: format!(
                "settings.version must be {SETTINGS_SCHEMA_VERSION} (got {})",
                settings.version
            ),
        });
    }
    validate_owner_id(&settings.owner_id)?;
    settings.chunking.validate()?;
    settings.retention.validate()?;
    Ok(())
}

/// Owner ids become a storage folder name, so only `[A-Za-z0-9_-]` is allowed.
pub fn validate_owner_id(owner_id: &str) -> Result<()> {
    if owner_id.is_empty() || owner_id.len() > 64 {
        return Err(Error::InvalidConfig {
            message: "owner_id must be 1..=64 characters".to_string(),
        });
    }
    if !owner_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(Error::InvalidConfig {
            message: format!("owner_id has unsupported characters: {owner_id:?}"),
        });
    }
    Ok(())
}

fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}
