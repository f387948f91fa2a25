use base64::Engine;
use rand::RngCore;
use rand::rngs::OsRng;

use crate::keys::{KEY_SIZE_BYTES, MasterKey};
use crate::{Error, Result};

pub const KEY_TEXT_PREFIX: &str = "CVK1:";

/// Generates fresh key material and returns only its text form, for writing to a key file.
pub fn generate_key_text() -> String {
    let mut key = [0u8; KEY_SIZE_BYTES];
    OsRng.fill_bytes(&mut key);
    encode_key_text(&key)
}

fn encode_key_text(key: &[u8; KEY_SIZE_BYTES]) -> String {
    let b64 = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(key);
    format!("{KEY_TEXT_PREFIX}{b64}")
}

pub fn decode_key_text(s: &str) -> Result<MasterKey> {
    let rest = s
        .trim()
        .strip_prefix(KEY_TEXT_PREFIX)
        .ok_or_else(|| Error::InvalidConfig {
            message: "invalid key text (missing CVK1: prefix)".to_string(),
        })?;

    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(rest.as_bytes())
        .map_err(|e| Error::InvalidConfig {
            message: format!("invalid key text (bad base64url): {e}"),
        })?;
    let arr: [u8; KEY_SIZE_BYTES] = bytes.try_into().map_err(|_| Error::InvalidConfig {
        message: "invalid key text (wrong length)".to_string(),
    })?;
    Ok(MasterKey::from_bytes(arr))
}
