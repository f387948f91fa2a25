use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::Aes256Gcm;
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;

use crate::{Error, Result};

pub const KEY_SIZE_BYTES: usize = 32;

const KEY_VERIFICATION_PLAINTEXT: &[u8] = b"Recovery Code Verification";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPurpose {
    /// Chunk and snapshot blobs.
    Stream,
    /// Legacy segmented per-package streams.
    Legacy,
}

impl KeyPurpose {
    pub fn context(self) -> &'static [u8] {
        match self {
            KeyPurpose::Stream => b"stream key",
            KeyPurpose::Legacy => b"app data key",
        }
    }
}

/// Source of derived keys. Implementations never hand out the master key itself.
pub trait KeyProvider: Send + Sync {
    fn derive_sub_key(&self, purpose: KeyPurpose) -> Result<[u8; KEY_SIZE_BYTES]>;

    /// Returns true if `candidate` is the same key material as the stored master key.
    fn verify_key(&self, candidate: &[u8; KEY_SIZE_BYTES]) -> Result<bool>;
}

/// In-process master key.
#[derive(Clone)]
pub struct MasterKey {
    key: [u8; KEY_SIZE_BYTES],
}

impl MasterKey {
    pub fn from_bytes(key: [u8; KEY_SIZE_BYTES]) -> Self {
        Self { key }
    }

    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE_BYTES];
        OsRng.fill_bytes(&mut key);
        Self { key }
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey(<redacted>)")
    }
}

impl KeyProvider for MasterKey {
    fn derive_sub_key(&self, purpose: KeyPurpose) -> Result<[u8; KEY_SIZE_BYTES]> {
        hkdf_expand(&self.key, purpose.context())
    }

    fn verify_key(&self, candidate: &[u8; KEY_SIZE_BYTES]) -> Result<bool> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let stored = Aes256Gcm::new((&self.key).into())
            .encrypt(&nonce, KEY_VERIFICATION_PLAINTEXT)
            .map_err(|_| Error::Authentication {
                message: "key verification encrypt failed".to_string(),
            })?;
        let other = Aes256Gcm::new(candidate.into())
            .encrypt(&nonce, KEY_VERIFICATION_PLAINTEXT)
            .map_err(|_| Error::Authentication {
                message: "key verification encrypt failed".to_string(),
            })?;

        Ok(stored == other)
    }
}

/// HKDF-SHA256 expand step with `prk` used directly as the pseudorandom key.
pub(crate) fn hkdf_expand(prk: &[u8], info: &[u8]) -> Result<[u8; KEY_SIZE_BYTES]> {
    let hk = Hkdf::<Sha256>::from_prk(prk).map_err(|_| Error::Internal {
        message: "key too short for hkdf".to_string(),
    })?;
    let mut okm = [0u8; KEY_SIZE_BYTES];
    hk.expand(info, &mut okm).map_err(|_| Error::Internal {
        message: "hkdf output length invalid".to_string(),
    })?;
    Ok(okm)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn purposes_derive_distinct_keys() {
        let key = MasterKey::from_bytes([3u8; 32]);
        let stream = key.derive_sub_key(KeyPurpose::Stream).unwrap();
        let legacy = key.derive_sub_key(KeyPurpose::Legacy).unwrap();
        assert_ne!(stream, legacy);
        assert_ne!(stream, [3u8; 32]);
        assert_eq!(stream, key.derive_sub_key(KeyPurpose::Stream).unwrap());
    }

    #[test]
    fn verify_key_compares_ciphertexts() {
        let key = MasterKey::from_bytes([3u8; 32]);
        assert!(key.verify_key(&[3u8; 32]).unwrap());
        assert!(!key.verify_key(&[4u8; 32]).unwrap());
    }

    #[test]
    fn debug_is_redacted() {
        let key = MasterKey::from_bytes([0xAB; 32]);
        let s = format!("{key:?}");
        assert!(!s.contains("171"));
        assert!(s.contains("redacted"));
    }
}
