pub mod backend;
mod backup;
mod cache_db;
mod chunk_cache;
pub mod chunker;
pub mod config;
pub mod crypto;
mod engine;
mod error;
pub mod handle;
pub mod key_text;
pub mod keys;
pub mod legacy;
mod local_backend;
pub mod pack;
pub mod progress;
mod prune;
pub mod repopulate;
mod restore;
pub mod retention;
pub mod run_log;
pub mod scanner;
pub mod snapshot;

pub const APP_NAME: &str = "chunkvault";

pub use backend::{Backend, BlobInfo, BoxFuture, InMemoryBackend};
pub use backup::{
    BackupCounters, BackupOptions, BackupOutcome, BackupPhase, BackupStatus, FileFailure,
};
pub use chunk_cache::{CachedChunk, CachedFile, ChunkCache, RUN_KIND_BACKUP, RunState};
pub use chunker::ChunkingConfig;
pub use config::Settings;
pub use engine::{Engine, EngineConfig, SnapshotSummary};
pub use error::{Error, Result};
pub use handle::{FileHandle, HandleKind, SnapshotName, TopLevelFolder};
pub use keys::{KeyProvider, KeyPurpose, MasterKey};
pub use local_backend::LocalDirBackend;
pub use progress::{ProgressSink, RunPhase, RunProgress, Tally};
pub use prune::{PruneOptions, PruneOutcome, SnapshotFailure};
pub use restore::{
    DirFileWriter, FileWriter, RestoreFailure, RestoreOptions, RestoreOutcome, RestoreStatus,
};
pub use retention::RetentionPolicy;
pub use scanner::{ContentFile, DirScanner, FileReader, Scanner};
pub use snapshot::{ChunkRef, PackedRange, Snapshot, SnapshotFile, SnapshotNaming};
