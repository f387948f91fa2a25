//! Zip chunks: small files concatenated into one shared chunk.

use crate::chunker::Chunk;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackEntry {
    /// Index of the file in push order.
    pub index: usize,
    pub offset: u64,
    pub len: u64,
}

#[derive(Debug, Clone)]
pub struct FinalizedPack {
    pub chunk: Chunk,
    pub entries: Vec<PackEntry>,
}

#[derive(Debug)]
pub struct PackBuilder {
    max_bytes: usize,
    bytes: Vec<u8>,
    entries: Vec<PackEntry>,
}

impl PackBuilder {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            bytes: Vec::new(),
            entries: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn fits(&self, len: usize) -> bool {
        self.bytes.len().saturating_add(len) <= self.max_bytes
    }

    /// Appends one file's bytes and returns its entry.
    pub fn push(&mut self, index: usize, data: &[u8]) -> Result<PackEntry> {
        if !self.fits(data.len()) {
            return Err(Error::Internal {
                message: format!(
                    "pack overflow: {} + {} > {}",
                    self.bytes.len(),
                    data.len(),
                    self.max_bytes
                ),
            });
        }
        let entry = PackEntry {
            index,
            offset: self.bytes.len() as u64,
            len: data.len() as u64,
        };
        self.bytes.extend_from_slice(data);
        self.entries.push(entry.clone());
        Ok(entry)
    }

    /// Takes the accumulated bytes as one chunk and leaves the builder empty.
    pub fn finalize(&mut self) -> Result<FinalizedPack> {
        if self.entries.is_empty() {
            return Err(Error::Internal {
                message: "pack finalize called with no entries".to_string(),
            });
        }
        let bytes = std::mem::take(&mut self.bytes);
        let entries = std::mem::take(&mut self.entries);
        Ok(FinalizedPack {
            chunk: Chunk::new(bytes),
            entries,
        })
    }
}

pub fn extract_packed(bytes: &[u8], offset: u64, len: u64) -> Result<&[u8]> {
    let end = offset.checked_add(len).ok_or_else(|| Error::Integrity {
        message: "pack slice overflow".to_string(),
    })?;
    if end > bytes.len() as u64 {
        return Err(Error::Integrity {
            message: format!("pack slice {offset}+{len} out of bounds ({})", bytes.len()),
        });
    }
    Ok(&bytes[offset as usize..end as usize])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::sha256_hex;

    #[test]
    fn entries_locate_each_file() {
        let mut b = PackBuilder::new(16);
        assert_eq!(b.push(0, &[1, 2, 3]).unwrap().offset, 0);
        let e = b.push(1, &[4, 5]).unwrap();
        assert_eq!((e.offset, e.len), (3, 2));
        b.push(2, &[]).unwrap();

        let pack = b.finalize().unwrap();
        assert!(b.is_empty());
        assert_eq!(pack.chunk.bytes, vec![1, 2, 3, 4, 5]);
        assert_eq!(pack.chunk.id, sha256_hex(&[1, 2, 3, 4, 5]));
        assert_eq!(pack.entries.len(), 3);
        assert_eq!(extract_packed(&pack.chunk.bytes, 3, 2).unwrap(), &[4, 5]);
    }

    #[test]
    fn push_respects_limit() {
        let mut b = PackBuilder::new(4);
        b.push(0, &[0; 3]).unwrap();
        assert!(!b.fits(2));
        assert!(matches!(b.push(1, &[0; 2]), Err(Error::Internal { .. })));
        assert!(b.fits(1));
    }

    #[test]
    fn finalize_empty_is_an_error() {
        assert!(matches!(PackBuilder::new(4).finalize(), Err(Error::Internal { .. })));
    }

    #[test]
    fn extract_checks_bounds() {
        assert!(extract_packed(&[0; 4], 2, 3).is_err());
        assert!(extract_packed(&[0; 4], u64::MAX, 1).is_err());
        assert_eq!(extract_packed(&[0; 4], 4, 0).unwrap(), &[] as &[u8]);
    }
}
