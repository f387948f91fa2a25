use std::collections::HashSet;
use std::path::Path;

use sqlx::{Row, SqlitePool, sqlite::SqliteRow};
use tracing::debug;

use crate::crypto::BLOB_VERSION;
use crate::cache_db::open_cache_pool;
use crate::snapshot::{ChunkRef, PackedRange, SnapshotFile};
use crate::{Error, Result};

pub const RUN_KIND_BACKUP: &str = "backup";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedChunk {
    pub id: String,
    pub size: u64,
    pub ref_count: i64,
    pub version: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedFile {
    pub id: String,
    pub size: u64,
    pub last_modified: Option<i64>,
    pub chunks: Vec<ChunkRef>,
    pub packed: Option<PackedRange>,
    pub last_seen: i64,
}

impl CachedFile {
    pub fn from_record(record: &SnapshotFile, last_seen: i64) -> Self {
        Self {
            id: record.id.clone(),
            size: record.size,
            last_modified: record.last_modified,
            chunks: record.chunks.clone(),
            packed: record.packed,
            last_seen,
        }
    }

    pub fn to_record(&self) -> SnapshotFile {
        SnapshotFile {
            id: self.id.clone(),
            size: self.size,
            last_modified: self.last_modified,
            chunks: self.chunks.clone(),
            packed: self.packed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunState {
    pub kind: String,
    pub status: String,
    pub run_id: String,
    pub updated_at: String,
}

/// The local dedup index. All cache reads and writes go through this type.
#[derive(Debug, Clone)]
pub struct ChunkCache {
    pool: SqlitePool,
}

impl ChunkCache {
    pub async fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            pool: open_cache_pool(path).await?,
        })
    }

    pub async fn get_chunk(&self, id: &str) -> Result<Option<CachedChunk>> {
        let row = sqlx::query(
            "SELECT chunk_hash, size, ref_count, version FROM chunks WHERE chunk_hash = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| chunk_from_row(&r)))
    }

    /// Records a chunk confirmed saved in the backend. References are added when a snapshot commits.
    ///
    /// A chunk that was lost remotely and is uploaded again takes over its lost reference count.
    pub async fn insert_new(&self, id: &str, size: u64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let lost: i64 = sqlx::query("SELECT ref_count FROM lost_chunks WHERE chunk_hash = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .map(|r| r.get("ref_count"))
            .unwrap_or(0);
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO chunks (chunk_hash, size, ref_count, version, created_at)
            VALUES (?, ?, ?, ?, strftime('%Y-%m-%dT%H:%M:%fZ','now'))
            "#,
        )
        .bind(id)
        .bind(size as i64)
        .bind(lost)
        .bind(BLOB_VERSION as i64)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM lost_chunks WHERE chunk_hash = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Adds one reference per listed id (repeats count repeatedly), in one transaction.
    pub async fn increment_refs(&self, ids: &[String]) -> Result<()> {
        self.adjust_refs(ids, 1).await
    }

    pub async fn decrement_refs(&self, ids: &[String]) -> Result<()> {
        self.adjust_refs(ids, -1).await
    }

    async fn adjust_refs(&self, ids: &[String], delta: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for id in ids {
            let res = sqlx::query("UPDATE chunks SET ref_count = ref_count + ? WHERE chunk_hash = ?")
                .bind(delta)
                .bind(id)
                .execute(&mut *tx)
                .await?;
            if res.rows_affected() == 0 {
                return Err(Error::Integrity {
                    message: format!("refcount change for uncached chunk {id}"),
                });
            }
        }
        tx.commit().await?;
        Ok(())
    }

    /// Applies a deleted snapshot's decrements and journals them atomically.
    ///
    /// Returns false without touching counts when `snapshot_path` is already journaled.
    pub async fn journal_prune_decrements(&self, snapshot_path: &str, ids: &[String]) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let existing = sqlx::query("SELECT 1 FROM prune_journal WHERE snapshot_path = ?")
            .bind(snapshot_path)
            .fetch_optional(&mut *tx)
            .await?;
        if existing.is_some() {
            return Ok(false);
        }

        for id in ids {
            sqlx::query("UPDATE chunks SET ref_count = ref_count - 1 WHERE chunk_hash = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("UPDATE lost_chunks SET ref_count = ref_count - 1 WHERE chunk_hash = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("DELETE FROM lost_chunks WHERE ref_count <= 0")
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            INSERT INTO prune_journal (snapshot_path, applied_at)
            VALUES (?, strftime('%Y-%m-%dT%H:%M:%fZ','now'))
            "#,
        )
        .bind(snapshot_path)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    pub async fn clear_journal(&self, snapshot_path: &str) -> Result<()> {
        sqlx::query("DELETE FROM prune_journal WHERE snapshot_path = ?")
            .bind(snapshot_path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn journaled_snapshots(&self) -> Result<HashSet<String>> {
        let rows = sqlx::query("SELECT snapshot_path FROM prune_journal")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get("snapshot_path")).collect())
    }

    pub async fn unreferenced_chunks(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT chunk_hash FROM chunks WHERE ref_count <= 0 ORDER BY chunk_hash")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get("chunk_hash")).collect())
    }

    pub async fn delete_chunks(&self, ids: &[String]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for id in ids {
            sqlx::query("DELETE FROM chunks WHERE chunk_hash = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn all_chunk_hashes(&self) -> Result<HashSet<String>> {
        let rows = sqlx::query("SELECT chunk_hash FROM chunks")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get("chunk_hash")).collect())
    }

    pub async fn all_chunks(&self) -> Result<Vec<CachedChunk>> {
        let rows = sqlx::query(
            "SELECT chunk_hash, size, ref_count, version FROM chunks ORDER BY chunk_hash",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(chunk_from_row).collect())
    }

    /// Replaces the chunk and lost-chunk tables in one transaction.
    pub async fn clear_and_repopulate(
        &self,
        chunks: &[CachedChunk],
        lost: &[CachedChunk],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM lost_chunks").execute(&mut *tx).await?;
        for c in chunks {
            sqlx::query(
                r#"
                INSERT INTO chunks (chunk_hash, size, ref_count, version, created_at)
                VALUES (?, ?, ?, ?, strftime('%Y-%m-%dT%H:%M:%fZ','now'))
                "#,
            )
            .bind(&c.id)
            .bind(c.size as i64)
            .bind(c.ref_count)
            .bind(c.version as i64)
            .execute(&mut *tx)
            .await?;
        }
        for c in lost {
            sqlx::query("INSERT INTO lost_chunks (chunk_hash, size, ref_count) VALUES (?, ?, ?)")
                .bind(&c.id)
                .bind(c.size as i64)
                .bind(c.ref_count)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        debug!(
            event = "cache.repopulated",
            chunks = chunks.len() as u64,
            lost = lost.len() as u64,
            "cache.repopulated"
        );
        Ok(())
    }

    /// Reference counts kept for chunks the backend lost.
    pub async fn lost_chunks(&self) -> Result<Vec<CachedChunk>> {
        let rows = sqlx::query(
            "SELECT chunk_hash, size, ref_count FROM lost_chunks ORDER BY chunk_hash",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| CachedChunk {
                id: r.get("chunk_hash"),
                size: r.get::<i64, _>("size") as u64,
                ref_count: r.get("ref_count"),
                version: BLOB_VERSION,
            })
            .collect())
    }

    pub async fn get_file(&self, id: &str) -> Result<Option<CachedFile>> {
        let row = sqlx::query(
            r#"
            SELECT file_id, size, last_modified, chunks, pack_offset, pack_len, last_seen
            FROM files
            WHERE file_id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| file_from_row(&r)).transpose()
    }

    pub async fn upsert_file(&self, file: &CachedFile) -> Result<()> {
        let chunks = serde_json::to_string(&file.chunks).map_err(|e| Error::Encode {
            message: format!("serialize chunk list failed: {e}"),
        })?;
        sqlx::query(
            r#"
            INSERT INTO files (file_id, size, last_modified, chunks, pack_offset, pack_len, last_seen)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(file_id) DO UPDATE SET
              size = excluded.size,
              last_modified = excluded.last_modified,
              chunks = excluded.chunks,
              pack_offset = excluded.pack_offset,
              pack_len = excluded.pack_len,
              last_seen = excluded.last_seen
            "#,
        )
        .bind(&file.id)
        .bind(file.size as i64)
        .bind(file.last_modified)
        .bind(chunks)
        .bind(file.packed.map(|p| p.offset as i64))
        .bind(file.packed.map(|p| p.length as i64))
        .bind(file.last_seen)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove_file(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM files WHERE file_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn touch_files(&self, ids: &[String], now: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for id in ids {
            sqlx::query("UPDATE files SET last_seen = ? WHERE file_id = ?")
                .bind(now)
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Drops file entries last seen before `cutoff`; returns how many were removed.
    pub async fn evict_files_not_seen_since(&self, cutoff: i64) -> Result<u64> {
        let res = sqlx::query("DELETE FROM files WHERE last_seen < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    pub async fn all_files(&self) -> Result<Vec<CachedFile>> {
        let rows = sqlx::query(
            r#"
            SELECT file_id, size, last_modified, chunks, pack_offset, pack_len, last_seen
            FROM files
            ORDER BY file_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(file_from_row).collect()
    }

    pub async fn set_run_state(&self, kind: &str, status: &str, run_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO run_state (kind, status, run_id, updated_at)
            VALUES (?, ?, ?, strftime('%Y-%m-%dT%H:%M:%fZ','now'))
            ON CONFLICT(kind) DO UPDATE SET
              status = excluded.status,
              run_id = excluded.run_id,
              updated_at = excluded.updated_at
            "#,
        )
        .bind(kind)
        .bind(status)
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn run_state(&self, kind: &str) -> Result<Option<RunState>> {
        let row = sqlx::query("SELECT kind, status, run_id, updated_at FROM run_state WHERE kind = ?")
            .bind(kind)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| RunState {
            kind: r.get("kind"),
            status: r.get("status"),
            run_id: r.get("run_id"),
            updated_at: r.get("updated_at"),
        }))
    }
}

fn chunk_from_row(row: &SqliteRow) -> CachedChunk {
    CachedChunk {
        id: row.get("chunk_hash"),
        size: row.get::<i64, _>("size") as u64,
        ref_count: row.get("ref_count"),
        version: row.get::<i64, _>("version") as u8,
    }
}

fn file_from_row(row: &SqliteRow) -> Result<CachedFile> {
    let chunks_json: String = row.get("chunks");
    let chunks: Vec<ChunkRef> =
        serde_json::from_str(&chunks_json).map_err(|e| Error::Integrity {
            message: format!("invalid cached chunk list: {e}"),
        })?;
    let offset: Option<i64> = row.get("pack_offset");
    let length: Option<i64> = row.get("pack_len");
    let packed = match (offset, length) {
        (Some(offset), Some(length)) => Some(PackedRange {
            offset: offset as u64,
            length: length as u64,
        }),
        _ => None,
    };
    Ok(CachedFile {
        id: row.get("file_id"),
        size: row.get::<i64, _>("size") as u64,
        last_modified: row.get("last_modified"),
        chunks,
        packed,
        last_seen: row.get("last_seen"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn cache() -> (tempfile::TempDir, ChunkCache) {
        let temp = tempfile::tempdir().unwrap();
        let cache = ChunkCache::open(&temp.path().join("cache.sqlite")).await.unwrap();
        (temp, cache)
    }

    fn id(c: char) -> String {
        c.to_string().repeat(64)
    }

    #[tokio::test]
    async fn insert_new_then_count_references() {
        let (_t, cache) = cache().await;
        assert!(cache.get_chunk(&id('a')).await.unwrap().is_none());

        cache.insert_new(&id('a'), 10).await.unwrap();
        cache.insert_new(&id('a'), 10).await.unwrap();
        let c = cache.get_chunk(&id('a')).await.unwrap().unwrap();
        assert_eq!((c.size, c.ref_count, c.version), (10, 0, BLOB_VERSION));

        cache.increment_refs(&[id('a'), id('a')]).await.unwrap();
        cache.decrement_refs(&[id('a')]).await.unwrap();
        assert_eq!(cache.get_chunk(&id('a')).await.unwrap().unwrap().ref_count, 1);
    }

    #[tokio::test]
    async fn refcount_change_for_unknown_chunk_rolls_back() {
        let (_t, cache) = cache().await;
        cache.insert_new(&id('a'), 1).await.unwrap();
        let err = cache.increment_refs(&[id('a'), id('b')]).await.unwrap_err();
        assert!(matches!(err, Error::Integrity { .. }));
        assert_eq!(cache.get_chunk(&id('a')).await.unwrap().unwrap().ref_count, 0);
    }

    #[tokio::test]
    async fn prune_journal_applies_decrements_once() {
        let (_t, cache) = cache().await;
        cache.insert_new(&id('a'), 1).await.unwrap();
        cache.insert_new(&id('b'), 1).await.unwrap();
        cache.increment_refs(&[id('a'), id('a'), id('b')]).await.unwrap();

        let refs = [id('a'), id('b')];
        assert!(cache.journal_prune_decrements("o.cv/1.snapshot", &refs).await.unwrap());
        assert!(!cache.journal_prune_decrements("o.cv/1.snapshot", &refs).await.unwrap());
        assert_eq!(cache.unreferenced_chunks().await.unwrap(), vec![id('b')]);

        assert_eq!(cache.journaled_snapshots().await.unwrap().len(), 1);
        cache.clear_journal("o.cv/1.snapshot").await.unwrap();
        assert!(cache.journaled_snapshots().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn files_upsert_touch_and_evict() {
        let (_t, cache) = cache().await;
        let mut f = CachedFile {
            id: "file:1".to_string(),
            size: 3,
            last_modified: None,
            chunks: vec![ChunkRef { id: id('c'), size: 9 }],
            packed: Some(PackedRange { offset: 2, length: 3 }),
            last_seen: 100,
        };
        cache.upsert_file(&f).await.unwrap();
        assert_eq!(cache.get_file("file:1").await.unwrap().unwrap(), f);

        f.last_modified = Some(7);
        f.packed = None;
        cache.upsert_file(&f).await.unwrap();
        assert_eq!(cache.get_file("file:1").await.unwrap().unwrap(), f);

        cache.touch_files(&["file:1".to_string()], 200).await.unwrap();
        assert_eq!(cache.evict_files_not_seen_since(150).await.unwrap(), 0);
        assert_eq!(cache.evict_files_not_seen_since(300).await.unwrap(), 1);
        assert!(cache.all_files().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn repopulate_replaces_chunk_table() {
        let (_t, cache) = cache().await;
        cache.insert_new(&id('a'), 1).await.unwrap();
        let fresh = vec![CachedChunk {
            id: id('b'),
            size: 4,
            ref_count: 2,
            version: BLOB_VERSION,
        }];
        cache.clear_and_repopulate(&fresh, &[]).await.unwrap();
        assert_eq!(cache.all_chunks().await.unwrap(), fresh);
    }

    #[tokio::test]
    async fn reuploaded_lost_chunk_keeps_its_references() {
        let (_t, cache) = cache().await;
        let lost = vec![
            CachedChunk {
                id: id('l'),
                size: 5,
                ref_count: 2,
                version: BLOB_VERSION,
            },
            CachedChunk {
                id: id('m'),
                size: 5,
                ref_count: 1,
                version: BLOB_VERSION,
            },
        ];
        cache.clear_and_repopulate(&[], &lost).await.unwrap();
        assert!(cache.get_chunk(&id('l')).await.unwrap().is_none());
        assert_eq!(cache.lost_chunks().await.unwrap(), lost);

        cache.insert_new(&id('l'), 5).await.unwrap();
        assert_eq!(cache.get_chunk(&id('l')).await.unwrap().unwrap().ref_count, 2);

        cache
            .journal_prune_decrements("o.cv/1.snapshot", &[id('m')])
            .await
            .unwrap();
        assert!(cache.lost_chunks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn run_state_round_trip() {
        let (_t, cache) = cache().await;
        assert!(cache.run_state(RUN_KIND_BACKUP).await.unwrap().is_none());
        cache.set_run_state(RUN_KIND_BACKUP, "running", "run_1").await.unwrap();
        cache.set_run_state(RUN_KIND_BACKUP, "succeeded", "run_1").await.unwrap();
        let s = cache.run_state(RUN_KIND_BACKUP).await.unwrap().unwrap();
        assert_eq!((s.status.as_str(), s.run_id.as_str()), ("succeeded", "run_1"));
    }
}
