//! Cipher key derivation from the Media Access Key.
//!
//! A recording's payload key mixes the owner's MAK with per-recording data
//! from the first plaintext metadata chunk; the metadata key mixes the MAK
//! with an MD5 fingerprint of itself under a fixed prefix. Both end in the
//! same SHA-1 step so the resulting 20 bytes drop straight into a cipher
//! pool working key.

use md5::{Digest, Md5};
use sha1::Sha1;

/// Prefix mixed into the metadata-key MD5 step.
const METADATA_PREFIX: &[u8] = b"tivo:TiVo DVR:";

/// Derives the media cipher key: SHA-1 over the MAK bytes followed by the
/// payload of the first plaintext metadata chunk.
pub fn derive_media_key(mak: &str, chunk_data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(mak.as_bytes());
    hasher.update(chunk_data);
    hasher.finalize().into()
}

/// Derives the metadata cipher key: the MAK is fingerprinted with
/// MD5("tivo:TiVo DVR:" + MAK), the digest rendered as lowercase hex, and
/// that hex string fed through the same SHA-1 composition as the media key.
pub fn derive_metadata_key(mak: &str) -> [u8; 20] {
    let mut md5 = Md5::new();
    md5.update(METADATA_PREFIX);
    md5.update(mak.as_bytes());
    let fingerprint = lowercase_hex(&md5.finalize());

    derive_media_key(mak, fingerprint.as_bytes())
}

fn lowercase_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_key_depends_on_both_inputs() {
        let base = derive_media_key("0123456789", b"chunk");
        assert_ne!(base, derive_media_key("9876543210", b"chunk"));
        assert_ne!(base, derive_media_key("0123456789", b"other"));
        assert_eq!(base, derive_media_key("0123456789", b"chunk"));
    }

    #[test]
    fn test_metadata_key_matches_manual_composition() {
        let mak = "1234567890";

        let mut md5 = Md5::new();
        md5.update(b"tivo:TiVo DVR:");
        md5.update(mak.as_bytes());
        let hex: String = md5
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect();

        assert_eq!(hex.len(), 32);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(
            derive_metadata_key(mak),
            derive_media_key(mak, hex.as_bytes())
        );
    }
}
