//! Legacy segmented stream format.
//!
//! `[version:1][header segment][data segment]*`, where every segment is
//! `[length:i16 BE][nonce:12][ciphertext+tag]`. Each segment is sealed with
//! AES-256-GCM under the legacy sub-key and a fresh random nonce.

use std::io::Read;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};

use crate::keys::{KeyProvider, KeyPurpose};
use crate::{Error, Result};

pub const VERSION: u8 = 0;
pub const MAX_PACKAGE_LENGTH_SIZE: usize = 255;
pub const MAX_KEY_LENGTH_SIZE: usize = 255;
pub const MAX_SEGMENT_LENGTH: usize = i16::MAX as usize;
pub const MAX_SEGMENT_CLEARTEXT_LENGTH: usize = MAX_SEGMENT_LENGTH - TAG_LEN;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const SEGMENT_LENGTH_SIZE: usize = 2;
const SEGMENT_HEADER_SIZE: usize = SEGMENT_LENGTH_SIZE + NONCE_LEN;
const MAX_VERSION_HEADER_SIZE: usize =
    1 + 2 + MAX_PACKAGE_LENGTH_SIZE + 2 + MAX_KEY_LENGTH_SIZE + TAG_LEN;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionHeader {
    pub version: u8,
    pub package_name: String,
    pub key: Option<String>,
}

impl VersionHeader {
    pub fn new(package_name: impl Into<String>, key: Option<String>) -> Self {
        Self {
            version: VERSION,
            package_name: package_name.into(),
            key,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let package = self.package_name.as_bytes();
        if package.is_empty() || package.len() > MAX_PACKAGE_LENGTH_SIZE {
            return Err(Error::InvalidConfig {
                message: format!("package name length {} out of range", package.len()),
            });
        }
        let key = self.key.as_deref().unwrap_or("").as_bytes();
        if key.len() > MAX_KEY_LENGTH_SIZE {
            return Err(Error::InvalidConfig {
                message: format!("key length {} out of range", key.len()),
            });
        }

        let mut out = Vec::with_capacity(1 + 2 + package.len() + 2 + key.len());
        out.push(self.version);
        out.extend_from_slice(&(package.len() as i16).to_be_bytes());
        out.extend_from_slice(package);
        out.extend_from_slice(&(key.len() as i16).to_be_bytes());
        out.extend_from_slice(key);
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut rest = bytes;
        let version = take(&mut rest, 1)?[0];

        let package_len = take_i16(&mut rest)?;
        if package_len <= 0 || package_len as usize > MAX_PACKAGE_LENGTH_SIZE {
            return Err(corrupt(format!("invalid package length: {package_len}")));
        }
        let package_name = utf8(take(&mut rest, package_len as usize)?)?;

        let key_len = take_i16(&mut rest)?;
        if key_len < 0 || key_len as usize > MAX_KEY_LENGTH_SIZE {
            return Err(corrupt(format!("invalid key length: {key_len}")));
        }
        let key = match key_len {
            0 => None,
            n => Some(utf8(take(&mut rest, n as usize)?)?),
        };

        if !rest.is_empty() {
            return Err(corrupt("found extra bytes in header".to_string()));
        }
        Ok(Self {
            version,
            package_name,
            key,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    pub length: i16,
    pub nonce: [u8; NONCE_LEN],
}

/// Codec for legacy streams, keyed by the legacy sub-key.
pub struct LegacyCipher {
    cipher: Aes256Gcm,
}

impl LegacyCipher {
    pub fn new(keys: &dyn KeyProvider) -> Result<Self> {
        let key = keys.derive_sub_key(KeyPurpose::Legacy)?;
        Ok(Self {
            cipher: Aes256Gcm::new((&key).into()),
        })
    }

    /// Writes the version byte, the sealed header and `payload` split into data segments.
    pub fn encrypt_stream(&self, header: &VersionHeader, payload: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(1 + payload.len() + 64);
        out.push(header.version);
        self.encrypt_segment(&mut out, &header.encode()?)?;
        for piece in payload.chunks(MAX_SEGMENT_CLEARTEXT_LENGTH) {
            self.encrypt_segment(&mut out, piece)?;
        }
        Ok(out)
    }

    pub fn encrypt_segment(&self, out: &mut Vec<u8>, cleartext: &[u8]) -> Result<()> {
        if cleartext.len() > MAX_SEGMENT_CLEARTEXT_LENGTH {
            return Err(Error::InvalidConfig {
                message: format!("segment cleartext too long: {}", cleartext.len()),
            });
        }
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = self
            .cipher
            .encrypt(&nonce, cleartext)
            .map_err(|_| corrupt("segment encrypt failed".to_string()))?;

        out.extend_from_slice(&(sealed.len() as i16).to_be_bytes());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(())
    }

    /// Reads and checks the version byte against `expected`.
    pub fn read_version(&self, input: &mut impl Read, expected: u8) -> Result<u8> {
        let mut b = [0u8; 1];
        if input.read(&mut b)? == 0 {
            return Err(Error::PrematureEnd);
        }
        let version = b[0];
        if version > VERSION {
            return Err(Error::UnsupportedVersion { version });
        }
        if version != expected {
            return Err(Error::Mismatch {
                message: format!("expected version {expected}, got {version}"),
            });
        }
        Ok(version)
    }

    /// Decrypts the header segment and checks it names the expected identity.
    pub fn decrypt_header(
        &self,
        input: &mut impl Read,
        expected_version: u8,
        expected_package: &str,
        expected_key: Option<&str>,
    ) -> Result<VersionHeader> {
        let plain = self
            .decrypt_segment_max(input, MAX_VERSION_HEADER_SIZE)?
            .ok_or(Error::PrematureEnd)?;
        let header = VersionHeader::decode(&plain)?;

        if header.version != expected_version {
            return Err(Error::Mismatch {
                message: format!(
                    "header version {}, expected {expected_version}",
                    header.version
                ),
            });
        }
        if header.package_name != expected_package {
            return Err(Error::Mismatch {
                message: format!(
                    "header package {:?}, expected {expected_package:?}",
                    header.package_name
                ),
            });
        }
        if header.key.as_deref() != expected_key {
            return Err(Error::Mismatch {
                message: format!("header key {:?}, expected {expected_key:?}", header.key),
            });
        }
        Ok(header)
    }

    pub fn decrypt_segment(&self, input: &mut impl Read) -> Result<Vec<u8>> {
        self.decrypt_segment_max(input, MAX_SEGMENT_LENGTH)?
            .ok_or(Error::PrematureEnd)
    }

    /// Concatenates segments until a clean end of stream.
    pub fn decrypt_multiple_segments(&self, input: &mut impl Read) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut read = 0usize;
        while let Some(plain) = self.decrypt_segment_max(input, MAX_SEGMENT_LENGTH)? {
            out.extend_from_slice(&plain);
            read += 1;
        }
        if read == 0 {
            return Err(Error::PrematureEnd);
        }
        Ok(out)
    }

    /// Version, header check and payload in one call.
    pub fn decrypt_stream(
        &self,
        bytes: &[u8],
        expected_package: &str,
        expected_key: Option<&str>,
    ) -> Result<Vec<u8>> {
        let mut input = bytes;
        let version = self.read_version(&mut input, VERSION)?;
        self.decrypt_header(&mut input, version, expected_package, expected_key)?;
        if input.is_empty() {
            return Ok(Vec::new());
        }
        self.decrypt_multiple_segments(&mut input)
    }

    fn decrypt_segment_max(&self, input: &mut impl Read, max: usize) -> Result<Option<Vec<u8>>> {
        let Some(header) = read_segment_header(input)? else {
            return Ok(None);
        };
        let length = header.length as usize;
        if length > max {
            return Err(corrupt(format!("segment length too long: {length} > {max}")));
        }

        let mut sealed = vec![0u8; length];
        read_full(input, &mut sealed)?;
        let plain = self
            .cipher
            .decrypt(Nonce::from_slice(&header.nonce), sealed.as_slice())
            .map_err(|_| Error::Authentication {
                message: "segment failed authentication".to_string(),
            })?;
        Ok(Some(plain))
    }
}

/// `None` at a clean end of stream, `Corrupt` for a length outside `1..=32767`.
pub fn read_segment_header(input: &mut impl Read) -> Result<Option<SegmentHeader>> {
    let mut buf = [0u8; SEGMENT_HEADER_SIZE];
    let mut filled = 0;
    while filled < buf.len() {
        let n = input.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    if filled == 0 {
        return Ok(None);
    }
    if filled != SEGMENT_HEADER_SIZE {
        return Err(Error::PrematureEnd);
    }

    let length = i16::from_be_bytes([buf[0], buf[1]]);
    if length <= 0 {
        return Err(corrupt(format!("invalid segment length: {length}")));
    }
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&buf[SEGMENT_LENGTH_SIZE..]);
    Ok(Some(SegmentHeader { length, nonce }))
}

fn read_full(input: &mut impl Read, buf: &mut [u8]) -> Result<()> {
    input.read_exact(buf).map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => Error::PrematureEnd,
        _ => Error::Io(e),
    })
}

fn take<'a>(rest: &mut &'a [u8], n: usize) -> Result<&'a [u8]> {
    if rest.len() < n {
        return Err(corrupt("header truncated".to_string()));
    }
    let (head, tail) = rest.split_at(n);
    *rest = tail;
    Ok(head)
}

fn take_i16(rest: &mut &[u8]) -> Result<i16> {
    let b = take(rest, 2)?;
    Ok(i16::from_be_bytes([b[0], b[1]]))
}

fn utf8(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec()).map_err(|_| corrupt("header is not utf-8".to_string()))
}

fn corrupt(message: String) -> Error {
    Error::Corrupt { message }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::MasterKey;

    fn cipher() -> LegacyCipher {
        LegacyCipher::new(&MasterKey::from_bytes([5u8; 32])).unwrap()
    }

    #[test]
    fn header_round_trip() {
        let h = VersionHeader::new("org.example.app", Some("prefs".to_string()));
        assert_eq!(VersionHeader::decode(&h.encode().unwrap()).unwrap(), h);

        let h = VersionHeader::new("org.example.app", None);
        assert_eq!(VersionHeader::decode(&h.encode().unwrap()).unwrap(), h);
    }

    #[test]
    fn header_rejects_bad_lengths_and_trailing_bytes() {
        assert!(VersionHeader::new("", None).encode().is_err());
        assert!(VersionHeader::new("a".repeat(256), None).encode().is_err());

        let mut bytes = VersionHeader::new("pkg", None).encode().unwrap();
        bytes.push(0);
        assert!(matches!(
            VersionHeader::decode(&bytes),
            Err(Error::Corrupt { .. })
        ));
    }

    #[test]
    fn stream_round_trip_over_several_segments() {
        let c = cipher();
        let header = VersionHeader::new("pkg", Some("k".to_string()));
        let payload: Vec<u8> = (0..80_000u32).map(|i| i as u8).collect();
        let bytes = c.encrypt_stream(&header, &payload).unwrap();
        assert_eq!(c.decrypt_stream(&bytes, "pkg", Some("k")).unwrap(), payload);
    }

    #[test]
    fn wrong_identity_is_a_mismatch() {
        let c = cipher();
        let bytes = c
            .encrypt_stream(&VersionHeader::new("pkg", Some("k".to_string())), b"x")
            .unwrap();

        for (pkg, key) in [("other", Some("k")), ("pkg", None), ("pkg", Some("j"))] {
            let err = c.decrypt_stream(&bytes, pkg, key).unwrap_err();
            assert!(matches!(err, Error::Mismatch { .. }), "{pkg} {key:?}: {err}");
        }

        let mut input = &bytes[..];
        c.read_version(&mut input, VERSION).unwrap();
        let err = c.decrypt_header(&mut input, 3, "pkg", Some("k")).unwrap_err();
        assert!(matches!(err, Error::Mismatch { .. }));
    }

    #[test]
    fn newer_version_byte_is_unsupported() {
        let c = cipher();
        let mut input: &[u8] = &[1u8];
        assert!(matches!(
            c.read_version(&mut input, VERSION),
            Err(Error::UnsupportedVersion { version: 1 })
        ));
    }

    #[test]
    fn zero_and_negative_segment_lengths_are_corrupt() {
        let c = cipher();
        for len in [0i16, -1, i16::MIN] {
            let mut bytes = len.to_be_bytes().to_vec();
            bytes.extend_from_slice(&[0u8; NONCE_LEN]);
            bytes.extend_from_slice(&[0u8; 64]);
            let err = c.decrypt_segment(&mut bytes.as_slice()).unwrap_err();
            assert!(matches!(err, Error::Corrupt { .. }), "len={len}: {err}");
        }
    }

    #[test]
    fn tampered_segment_fails_authentication() {
        let c = cipher();
        let mut out = Vec::new();
        c.encrypt_segment(&mut out, b"payload").unwrap();
        let last = out.len() - 1;
        out[last] ^= 0x80;
        let err = c.decrypt_segment(&mut out.as_slice()).unwrap_err();
        assert!(matches!(err, Error::Authentication { .. }));
    }

    #[test]
    fn multiple_segments_need_at_least_one() {
        let c = cipher();
        let err = c.decrypt_multiple_segments(&mut &[][..]).unwrap_err();
        assert!(matches!(err, Error::PrematureEnd));

        let mut out = Vec::new();
        c.encrypt_segment(&mut out, b"a").unwrap();
        c.encrypt_segment(&mut out, b"b").unwrap();
        assert_eq!(c.decrypt_multiple_segments(&mut out.as_slice()).unwrap(), b"ab");
    }

    #[test]
    fn truncated_segment_body_is_premature_end() {
        let c = cipher();
        let mut out = Vec::new();
        c.encrypt_segment(&mut out, b"payload").unwrap();
        out.truncate(out.len() - 3);
        assert!(matches!(
            c.decrypt_segment(&mut out.as_slice()),
            Err(Error::PrematureEnd)
        ));
    }
}
