//! URL signature verification
//!
//! A path `/​<sig>/<rest>` is valid when `<sig>` equals the URL-safe
//! base64 of the first `signature_size` bytes of
//! `HMAC-SHA256(key, salt || "/<rest>")` for any configured (key, salt)
//! pair. With no keys configured the service runs in insecure mode and
//! accepts any value.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::ServiceError;

type HmacSha256 = Hmac<Sha256>;

/// Hex-decoded key or salt material.
pub type SecurityKey = Vec<u8>;

#[derive(Debug, Clone, Default)]
pub struct Signer {
    keys: Vec<SecurityKey>,
    salts: Vec<SecurityKey>,
    signature_size: usize,
}

impl Signer {
    /// Keys and salts must be equal in number; validated by config.
    pub fn new(keys: Vec<SecurityKey>, salts: Vec<SecurityKey>, signature_size: usize) -> Self {
        Signer {
            keys,
            salts,
            signature_size,
        }
    }

    /// Insecure mode: no keys configured, every signature accepted.
    pub fn is_insecure(&self) -> bool {
        self.keys.is_empty()
    }

    /// Signs `path` (the part after the signature segment, with its
    /// leading slash) with the pair at `index`.
    pub fn sign(&self, path: &str, index: usize) -> String {
        let digest = self.digest(path, index);
        URL_SAFE_NO_PAD.encode(&digest[..self.signature_size.min(digest.len())])
    }

    /// Verifies `signature` against `path` for every configured pair.
    pub fn verify(&self, signature: &str, path: &str) -> Result<(), ServiceError> {
        if self.is_insecure() {
            return Ok(());
        }

        for i in 0..self.keys.len() {
            if constant_time_eq(signature.as_bytes(), self.sign(path, i).as_bytes()) {
                return Ok(());
            }
        }

        Err(ServiceError::InvalidSignature)
    }

    fn digest(&self, path: &str, index: usize) -> Vec<u8> {
        let mut mac =
            HmacSha256::new_from_slice(&self.keys[index]).expect("HMAC can take key of any size");
        mac.update(&self.salts[index]);
        mac.update(path.as_bytes());
        mac.finalize().into_bytes().to_vec()
    }
}

/// Constant-time comparison to keep signature checks timing-safe.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
