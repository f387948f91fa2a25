use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] sqlx::Error),

    #[error("sqlite migrate error: {0}")]
    SqliteMigrate(#[from] sqlx::migrate::MigrateError),

    #[error("walkdir error: {0}")]
    Walkdir(#[from] walkdir::Error),

    #[error("backend error: {message}")]
    Backend { message: String },

    #[error("object not found: {path}")]
    NotFound { path: String },

    /// AEAD tag verification failed.
    #[error("authentication failed: {message}")]
    Authentication { message: String },

    /// The stream decrypted fine but belongs to a different identity or version.
    #[error("identity mismatch: {message}")]
    Mismatch { message: String },

    #[error("corrupt stream: {message}")]
    Corrupt { message: String },

    #[error("premature end of stream")]
    PrematureEnd,

    #[error("unsupported format version: {version}")]
    UnsupportedVersion { version: u8 },

    #[error("integrity error: {message}")]
    Integrity { message: String },

    #[error("chunk cache repopulation failed: {message}")]
    CacheRepopulate { message: String },

    #[error("{operation} already running")]
    AlreadyRunning { operation: &'static str },

    #[error("prune refused: last backup status is {last_backup}")]
    PruneBlocked { last_backup: String },

    #[error("cancelled")]
    Cancelled,

    #[error("encode error: {message}")]
    Encode { message: String },

    /// A broken internal assumption, such as a failed blocking task.
    #[error("internal error: {message}")]
    Internal { message: String },

    #[error("unsupported path (must be UTF-8): {path:?}")]
    NonUtf8Path { path: PathBuf },
}

impl Error {
    pub fn is_authentication(&self) -> bool {
        matches!(self, Error::Authentication { .. } | Error::Mismatch { .. })
    }
}
