use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;

use crate::{Error, Result};

pub const BLOB_VERSION: u8 = 1;
pub const SEGMENT_SIZE: usize = 1024 * 1024;

const TAG_LEN: usize = 16;
const SALT_LEN: usize = 32;
const NONCE_PREFIX_LEN: usize = 7;
const HEADER_LEN: usize = 1 + SALT_LEN + NONCE_PREFIX_LEN;

const AD_TYPE_CHUNK: u8 = 0x00;
const AD_TYPE_SNAPSHOT: u8 = 0x01;

pub fn chunk_ad(chunk_id: &[u8; 32]) -> Vec<u8> {
    let mut ad = Vec::with_capacity(2 + chunk_id.len());
    ad.push(BLOB_VERSION);
    ad.push(AD_TYPE_CHUNK);
    ad.extend_from_slice(chunk_id);
    ad
}

pub fn snapshot_time_ad(time_ms: i64) -> Vec<u8> {
    let mut ad = Vec::with_capacity(2 + 8);
    ad.push(BLOB_VERSION);
    ad.push(AD_TYPE_SNAPSHOT);
    ad.extend_from_slice(&time_ms.to_be_bytes());
    ad
}

/// Hash-named snapshots carry no name in the AD; the name is checked against the blob hash instead.
pub fn snapshot_hash_ad() -> Vec<u8> {
    vec![BLOB_VERSION, AD_TYPE_SNAPSHOT]
}

/// `[blob version][stream]`
pub fn encrypt_blob(sub_key: &[u8; 32], ad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let stream = encrypt_stream(sub_key, ad, plaintext)?;
    let mut out = Vec::with_capacity(1 + stream.len());
    out.push(BLOB_VERSION);
    out.extend_from_slice(&stream);
    Ok(out)
}

pub fn decrypt_blob(sub_key: &[u8; 32], ad: &[u8], blob: &[u8]) -> Result<Vec<u8>> {
    let (&version, stream) = blob.split_first().ok_or_else(|| Error::Corrupt {
        message: "empty blob".to_string(),
    })?;
    if version != BLOB_VERSION {
        return Err(Error::Mismatch {
            message: format!("blob version {version}, expected {BLOB_VERSION}"),
        });
    }
    decrypt_stream(sub_key, ad, stream)
}

pub fn encrypt_stream(sub_key: &[u8; 32], ad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    encrypt_segmented(sub_key, ad, plaintext, SEGMENT_SIZE)
}

pub fn decrypt_stream(sub_key: &[u8; 32], ad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    decrypt_segmented(sub_key, ad, ciphertext, SEGMENT_SIZE)
}

fn encrypt_segmented(
    sub_key: &[u8; 32],
    ad: &[u8],
    plaintext: &[u8],
    segment_size: usize,
) -> Result<Vec<u8>> {
    let mut salt = [0u8; SALT_LEN];
    let mut prefix = [0u8; NONCE_PREFIX_LEN];
    OsRng.fill_bytes(&mut salt);
    OsRng.fill_bytes(&mut prefix);

    let cipher = stream_cipher(sub_key, &salt, ad)?;

    let segments = plaintext.len() / (segment_size - TAG_LEN) + 1;
    let mut out = Vec::with_capacity(HEADER_LEN + plaintext.len() + segments * TAG_LEN);
    out.push(HEADER_LEN as u8);
    out.extend_from_slice(&salt);
    out.extend_from_slice(&prefix);

    let mut rest = plaintext;
    let mut segment_no: u32 = 0;
    loop {
        let cap = plaintext_capacity(segment_no, segment_size);
        let last = rest.len() <= cap;
        let take = if last { rest.len() } else { cap };
        let (piece, tail) = rest.split_at(take);

        let nonce = segment_nonce(&prefix, segment_no, last);
        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce), piece)
            .map_err(|_| Error::Corrupt {
                message: format!("segment {segment_no} encrypt failed"),
            })?;
        out.extend_from_slice(&sealed);

        if last {
            return Ok(out);
        }
        rest = tail;
        segment_no = segment_no.checked_add(1).ok_or_else(|| Error::Corrupt {
            message: "too many segments".to_string(),
        })?;
    }
}

fn decrypt_segmented(
    sub_key: &[u8; 32],
    ad: &[u8],
    ciphertext: &[u8],
    segment_size: usize,
) -> Result<Vec<u8>> {
    if ciphertext.len() < HEADER_LEN {
        return Err(Error::PrematureEnd);
    }
    if ciphertext[0] as usize != HEADER_LEN {
        return Err(Error::Corrupt {
            message: format!("stream header length {} != {HEADER_LEN}", ciphertext[0]),
        });
    }
    let salt = &ciphertext[1..1 + SALT_LEN];
    let prefix = &ciphertext[1 + SALT_LEN..HEADER_LEN];
    let cipher = stream_cipher(sub_key, salt, ad)?;

    let mut out = Vec::with_capacity(ciphertext.len());
    let mut rest = &ciphertext[HEADER_LEN..];
    let mut segment_no: u32 = 0;
    loop {
        let cap = plaintext_capacity(segment_no, segment_size) + TAG_LEN;
        let last = rest.len() <= cap;
        let take = if last { rest.len() } else { cap };
        if take < TAG_LEN {
            return Err(Error::PrematureEnd);
        }
        let (sealed, tail) = rest.split_at(take);

        let nonce = segment_nonce(prefix, segment_no, last);
        let plain = cipher
            .decrypt(Nonce::from_slice(&nonce), sealed)
            .map_err(|_| Error::Authentication {
                message: format!("segment {segment_no} failed authentication"),
            })?;
        out.extend_from_slice(&plain);

        if last {
            return Ok(out);
        }
        rest = tail;
        segment_no = segment_no.checked_add(1).ok_or_else(|| Error::Corrupt {
            message: "too many segments".to_string(),
        })?;
    }
}

fn plaintext_capacity(segment_no: u32, segment_size: usize) -> usize {
    if segment_no == 0 {
        segment_size - HEADER_LEN - TAG_LEN
    } else {
        segment_size - TAG_LEN
    }
}

fn segment_nonce(prefix: &[u8], segment_no: u32, last: bool) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..NONCE_PREFIX_LEN].copy_from_slice(prefix);
    nonce[NONCE_PREFIX_LEN..NONCE_PREFIX_LEN + 4].copy_from_slice(&segment_no.to_be_bytes());
    nonce[11] = u8::from(last);
    nonce
}

fn stream_cipher(sub_key: &[u8; 32], salt: &[u8], ad: &[u8]) -> Result<Aes256Gcm> {
    let hk = Hkdf::<Sha256>::new(Some(salt), sub_key);
    let mut key = [0u8; 32];
    hk.expand(ad, &mut key).map_err(|_| Error::Corrupt {
        message: "stream key derivation failed".to_string(),
    })?;
    Ok(Aes256Gcm::new((&key).into()))
}
