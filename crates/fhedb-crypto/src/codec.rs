//! Compression and content fingerprinting for ciphertext transport and
//! key-file storage.
//!
//! Fingerprinting uses a fast, non-cryptographic hash (`xxh3`) and is never
//! suitable for authentication — only for deduplication and cache keys. All
//! authentication in this crate goes through [`crate::symmetric`]'s AEAD tag
//! or [`crate::keystore`]'s verification tag, never through a fingerprint.

use crate::error::CryptoError;
use twox_hash::xxh3::hash64;

/// Compress `data` at the given zstd level (1-22; higher is slower and
/// smaller). Callers should source the level from configuration rather than
/// hardcoding it.
///
/// # Errors
///
/// Returns [`CryptoError::IoError`] if the zstd encoder fails.
pub fn compress(data: &[u8], level: i32) -> Result<Vec<u8>, CryptoError> {
    zstd::encode_all(data, level)
        .map_err(|e| CryptoError::IoError(format!("zstd compression failed: {e}")))
}

/// Decompress a zstd frame produced by [`compress`].
///
/// # Errors
///
/// Returns [`CryptoError::CorruptCiphertext`] if `data` is not a valid zstd
/// frame.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    zstd::decode_all(data)
        .map_err(|e| CryptoError::CorruptCiphertext(format!("zstd decode failed: {e}")))
}

/// Compute a 64-bit content fingerprint for deduplication and cache keys.
///
/// This is **not** a cryptographic hash: it is fast but not
/// collision-resistant against an adversary, and carries no authentication
/// guarantee. It is suitable only for matching identical plaintexts in the
/// reference table and for cache-key derivation.
#[must_use]
pub fn fingerprint(data: &[u8]) -> u64 {
    hash64(data)
}

/// Render a fingerprint as a fixed-width lowercase hex string, used as the
/// textual key in on-disk reference rows and cache entries.
#[must_use]
pub fn fingerprint_hex(data: &[u8]) -> String {
    format!("{:016x}", fingerprint(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compress_decompress_roundtrip() {
        let data = b"the quick brown fox jumps over the lazy dog".repeat(8);
        let compressed = compress(&data, 9).expect("compress");
        assert!(compressed.len() < data.len());
        let restored = decompress(&compressed).expect("decompress");
        assert_eq!(restored, data);
    }

    #[test]
    fn decompress_rejects_garbage() {
        let garbage = vec![0xDE, 0xAD, 0xBE, 0xEF, 1, 2, 3];
        assert!(matches!(
            decompress(&garbage),
            Err(CryptoError::CorruptCiphertext(_))
        ));
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let data = b"some record content";
        assert_eq!(fingerprint(data), fingerprint(data));
    }

    #[test]
    fn fingerprint_differs_for_different_content() {
        assert_ne!(fingerprint(b"alpha"), fingerprint(b"beta"));
    }

    #[test]
    fn fingerprint_hex_is_fixed_width() {
        assert_eq!(fingerprint_hex(b"").len(), 16);
        assert_eq!(fingerprint_hex(b"a longer input string here").len(), 16);
    }

    #[test]
    fn empty_input_compresses_and_roundtrips() {
        let compressed = compress(b"", 9).expect("compress");
        let restored = decompress(&compressed).expect("decompress");
        assert!(restored.is_empty());
    }
}
