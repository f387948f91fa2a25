use std::path::Path;
use std::time::Duration;

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use tracing::{debug, error};

use crate::Result;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens (creating if missing) the chunk cache database and brings its schema up to date.
///
/// The pool holds a single connection, so every cache write is serialized.
pub async fn open_cache_pool(path: &Path) -> Result<SqlitePool> {
    debug!(event = "sqlite.open", db_path = %path.display(), "sqlite.open");
    if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(dir).await?;
    }

    let connect = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Delete)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(BUSY_TIMEOUT)
        .foreign_keys(true);

    let pool = match SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(connect)
        .await
    {
        Ok(pool) => pool,
        Err(e) => {
            error!(event = "io.sqlite.connect_failed", db_path = %path.display(), error = %e, "io.sqlite.connect_failed");
            return Err(e.into());
        }
    };

    if let Err(e) = sqlx::migrate!().run(&pool).await {
        error!(event = "io.sqlite.migrate_failed", db_path = %path.display(), error = %e, "io.sqlite.migrate_failed");
        pool.close().await;
        return Err(e.into());
    }
    debug!(event = "sqlite.ready", db_path = %path.display(), "sqlite.ready");
    Ok(pool)
}
