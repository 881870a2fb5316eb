//! ETag computation
//!
//! The entity tag digests the source bytes together with the canonical
//! option string, so it changes whenever either the source or the
//! requested transformation does.

use sha2::{Digest, Sha256};

use crate::options::ProcessingOptions;

pub fn calc_etag(source: &[u8], po: &ProcessingOptions) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source);
    hasher.update(po.cache_key().as_bytes());

    let digest = hasher.finalize();
    let mut hex = String::with_capacity(digest.len() * 2 + 2);
    hex.push('"');
    for byte in digest {
        hex.push_str(&format!("{:02x}", byte));
    }
    hex.push('"');
    hex
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_etag_is_quoted_hex() {
        let po = ProcessingOptions::new(80);
        let etag = calc_etag(b"bytes", &po);
        assert!(etag.starts_with('"') && etag.ends_with('"'));
        assert_eq!(etag.len(), 66);
        assert!(etag[1..65].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_etag_stable_for_same_input() {
        let po = ProcessingOptions::new(80);
        assert_eq!(calc_etag(b"bytes", &po), calc_etag(b"bytes", &po));
    }

    #[test]
    fn test_etag_changes_with_source_and_options() {
        let po = ProcessingOptions::new(80);
        let mut other = po.clone();
        other.width = 42;

        assert_ne!(calc_etag(b"a", &po), calc_etag(b"b", &po));
        assert_ne!(calc_etag(b"a", &po), calc_etag(b"a", &other));
    }
}
