use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{Error, Result};

pub const MIB: usize = 1024 * 1024;
pub const CHUNK_SIZE_MAX: usize = 15 * MIB;
pub const SMALL_FILE_SIZE_MAX: usize = 2 * MIB;
pub const ZIP_CHUNK_SIZE_MAX: usize = 7 * MIB;

const CHUNK_SIZE_WINDOW: std::ops::RangeInclusive<usize> = MIB..=64 * MIB;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub chunk_size_max: usize,
    /// Files with a declared size below this are packed into zip chunks.
    pub small_file_size_max: usize,
    pub zip_chunk_size_max: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size_max: CHUNK_SIZE_MAX,
            small_file_size_max: SMALL_FILE_SIZE_MAX,
            zip_chunk_size_max: ZIP_CHUNK_SIZE_MAX,
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size_max == 0 || self.small_file_size_max == 0 || self.zip_chunk_size_max == 0
        {
            return Err(Error::InvalidConfig {
                message: "chunk sizes must be > 0".to_string(),
            });
        }
        if !CHUNK_SIZE_WINDOW.contains(&self.chunk_size_max) {
            return Err(Error::InvalidConfig {
                message: format!(
                    "chunk_size_max must be within {}..={} bytes",
                    CHUNK_SIZE_WINDOW.start(),
                    CHUNK_SIZE_WINDOW.end()
                ),
            });
        }
        if self.small_file_size_max > self.zip_chunk_size_max {
            return Err(Error::InvalidConfig {
                message: "small_file_size_max must be <= zip_chunk_size_max".to_string(),
            });
        }
        Ok(())
    }

    pub fn is_small(&self, size: u64) -> bool {
        size < self.small_file_size_max as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Lowercase hex SHA-256 of `bytes`.
    pub id: String,
    pub bytes: Vec<u8>,
}

impl Chunk {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            id: sha256_hex(&bytes),
            bytes,
        }
    }
}

/// Splits a stream into consecutive pieces of at most `chunk_size_max` bytes.
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    chunk_size_max: usize,
}

impl Chunker {
    pub fn new(chunk_size_max: usize) -> Self {
        Self { chunk_size_max }
    }

    /// Next piece of `reader`, or `None` at end of stream. Never yields an empty chunk.
    pub async fn next_chunk<R: AsyncRead + Unpin>(&self, reader: &mut R) -> Result<Option<Chunk>> {
        let mut buf = vec![0u8; self.chunk_size_max];
        let mut filled = 0;
        while filled < buf.len() {
            let n = reader.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            return Ok(None);
        }
        buf.truncate(filled);
        Ok(Some(Chunk::new(buf)))
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub fn chunk_id_bytes(id: &str) -> Result<[u8; 32]> {
    let mut out = [0u8; 32];
    hex::decode_to_slice(id, &mut out).map_err(|_| Error::Integrity {
        message: format!("invalid chunk id: {id}"),
    })?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn split(data: &[u8], max: usize) -> Vec<Chunk> {
        let chunker = Chunker::new(max);
        let mut reader = data;
        let mut out = Vec::new();
        while let Some(c) = chunker.next_chunk(&mut reader).await.unwrap() {
            out.push(c);
        }
        out
    }

    #[tokio::test]
    async fn splits_into_fixed_pieces_with_short_tail() {
        let data: Vec<u8> = (0..25u8).collect();
        let chunks = split(&data, 10).await;
        let lens: Vec<usize> = chunks.iter().map(|c| c.bytes.len()).collect();
        assert_eq!(lens, vec![10, 10, 5]);
        assert_eq!(chunks[2].id, sha256_hex(&data[20..]));
    }

    #[tokio::test]
    async fn empty_stream_yields_no_chunk() {
        assert!(split(&[], 10).await.is_empty());
    }

    #[tokio::test]
    async fn short_tail_differs_from_full_piece_with_same_prefix() {
        let full = split(&[7u8; 10], 10).await;
        let tail = split(&[7u8; 14], 10).await;
        assert_eq!(full[0].id, tail[0].id);
        assert_ne!(tail[1].id, full[0].id);
    }

    #[test]
    fn config_validation() {
        assert!(ChunkingConfig::default().validate().is_ok());
        let mut c = ChunkingConfig::default();
        c.small_file_size_max = c.zip_chunk_size_max + 1;
        assert!(c.validate().is_err());
        let c = ChunkingConfig {
            chunk_size_max: 1024,
            ..ChunkingConfig::default()
        };
        assert!(c.validate().is_err());
    }

    #[test]
    fn chunk_id_bytes_round_trips_hex() {
        let id = sha256_hex(b"abc");
        assert_eq!(hex::encode(chunk_id_bytes(&id).unwrap()), id);
        assert!(chunk_id_bytes("zz").is_err());
    }
}
