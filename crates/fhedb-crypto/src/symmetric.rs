//! AES-256-GCM authenticated encryption of record payloads.
//!
//! Wire format: `nonce (12 bytes) || tag (16 bytes) || ciphertext (variable)`.
//! The nonce is drawn from a CSPRNG per call and never reused under a given
//! key; the tag authenticates both the ciphertext and (when supplied) the
//! associated data.

use crate::error::CryptoError;
use crate::memory::SecretBuffer;
use rand::rngs::OsRng;
use rand::RngCore;
use ring::aead;
use zeroize::Zeroize;

/// AES-256-GCM nonce length in bytes (96 bits).
pub const NONCE_LEN: usize = 12;

/// AES-256-GCM authentication tag length in bytes (128 bits).
pub const TAG_LEN: usize = 16;

/// AES-256-GCM key length in bytes (256 bits).
pub const KEY_LEN: usize = 32;

/// Minimum valid sealed-payload length: nonce + tag + empty ciphertext.
const HEADER_LEN: usize = NONCE_LEN + TAG_LEN;

/// Encrypt `plaintext` under `key` (must be exactly [`KEY_LEN`] bytes),
/// authenticating `aad` alongside it.
///
/// Returns the wire format `nonce || tag || ciphertext`, with the nonce
/// drawn from `OsRng` fresh on every call.
///
/// # Errors
///
/// Returns [`CryptoError::Malformed`] if `key` is not 32 bytes, or
/// [`CryptoError::IoError`] if the underlying seal operation fails (this
/// should not happen for a correctly sized key).
pub fn encrypt(plaintext: &[u8], key: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if key.len() != KEY_LEN {
        return Err(CryptoError::Malformed(format!(
            "invalid key length: {} bytes (expected {KEY_LEN})",
            key.len()
        )));
    }

    let unbound = aead::UnboundKey::new(&aead::AES_256_GCM, key)
        .map_err(|_| CryptoError::IoError("failed to create AES-256-GCM key".into()))?;
    let less_safe_key = aead::LessSafeKey::new(unbound);

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = aead::Nonce::assume_unique_for_key(nonce_bytes);

    let mut in_out = plaintext.to_vec();
    let Ok(tag) =
        less_safe_key.seal_in_place_separate_tag(nonce, aead::Aad::from(aad), &mut in_out)
    else {
        in_out.zeroize();
        return Err(CryptoError::IoError(
            "AES-256-GCM encryption failed".into(),
        ));
    };

    let mut out = Vec::with_capacity(HEADER_LEN.saturating_add(in_out.len()));
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(tag.as_ref());
    out.extend_from_slice(&in_out);
    in_out.zeroize();
    Ok(out)
}

/// Decrypt and authenticate a sealed payload produced by [`encrypt`].
///
/// Returns the plaintext as a [`SecretBuffer`] (zeroized on drop). The
/// intermediate decryption buffer is zeroized after copying into it.
///
/// # Errors
///
/// Returns [`CryptoError::Malformed`] if `key` is not 32 bytes or `sealed`
/// is shorter than `nonce + tag` (28 bytes). Returns
/// [`CryptoError::Tampered`] if authentication fails — wrong key, wrong
/// `aad`, or modified bytes.
pub fn decrypt(sealed: &[u8], key: &[u8], aad: &[u8]) -> Result<SecretBuffer, CryptoError> {
    if key.len() != KEY_LEN {
        return Err(CryptoError::Malformed(format!(
            "invalid key length: {} bytes (expected {KEY_LEN})",
            key.len()
        )));
    }
    if sealed.len() < HEADER_LEN {
        return Err(CryptoError::Malformed(format!(
            "sealed payload too short: {} bytes (minimum {HEADER_LEN})",
            sealed.len()
        )));
    }

    let mut nonce_bytes = [0u8; NONCE_LEN];
    nonce_bytes.copy_from_slice(&sealed[..NONCE_LEN]);
    let nonce = aead::Nonce::assume_unique_for_key(nonce_bytes);

    let unbound = aead::UnboundKey::new(&aead::AES_256_GCM, key)
        .map_err(|_| CryptoError::IoError("failed to create AES-256-GCM key".into()))?;
    let less_safe_key = aead::LessSafeKey::new(unbound);

    // `ring::open_in_place` wants ciphertext || tag; our wire order is
    // nonce || tag || ciphertext, so the tag moves to the end first.
    let tag_start = NONCE_LEN;
    let ct_start = HEADER_LEN;
    let mut ct_tag = Vec::with_capacity(
        sealed
            .len()
            .saturating_sub(HEADER_LEN)
            .saturating_add(TAG_LEN),
    );
    ct_tag.extend_from_slice(&sealed[ct_start..]);
    ct_tag.extend_from_slice(&sealed[tag_start..ct_start]);

    let plaintext_slice = less_safe_key
        .open_in_place(nonce, aead::Aad::from(aad), &mut ct_tag)
        .map_err(|_| CryptoError::Tampered)?;

    let result = SecretBuffer::new(plaintext_slice)?;
    ct_tag.zeroize();
    Ok(result)
}

/// Encrypt each of `plaintexts` under `key`, drawing an independent nonce
/// per call. A throughput helper, not a batched cryptographic primitive —
/// there is no shared state across calls to synchronize.
///
/// # Errors
///
/// Returns the first error encountered; the remaining items are not
/// attempted.
pub fn encrypt_batch(
    plaintexts: &[&[u8]],
    key: &[u8],
    aad: &[u8],
) -> Result<Vec<Vec<u8>>, CryptoError> {
    plaintexts.iter().map(|pt| encrypt(pt, key, aad)).collect()
}

/// Decrypt each of `sealed` under `key`. A throughput helper, not a batched
/// cryptographic primitive — there is no shared state across calls to
/// synchronize.
///
/// # Errors
///
/// Returns the first error encountered; the remaining items are not
/// attempted.
pub fn decrypt_batch(
    sealed: &[&[u8]],
    key: &[u8],
    aad: &[u8],
) -> Result<Vec<SecretBuffer>, CryptoError> {
    sealed.iter().map(|ct| decrypt(ct, key, aad)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_KEY: [u8; KEY_LEN] = [0xAA; KEY_LEN];
    const WRONG_KEY: [u8; KEY_LEN] = [0xBB; KEY_LEN];

    #[test]
    fn encrypt_produces_correct_header_length() {
        let plaintext = b"hello, fhedb!";
        let sealed = encrypt(plaintext, &TEST_KEY, &[]).expect("encrypt should succeed");
        assert_eq!(sealed.len(), HEADER_LEN + plaintext.len());
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let plaintext = b"secret record payload";
        let sealed = encrypt(plaintext, &TEST_KEY, &[]).expect("encrypt should succeed");
        let decrypted = decrypt(&sealed, &TEST_KEY, &[]).expect("decrypt should succeed");
        assert_eq!(decrypted.expose(), plaintext);
    }

    #[test]
    fn decrypt_fails_on_tampered_ciphertext() {
        let mut sealed = encrypt(b"test data", &TEST_KEY, &[]).expect("encrypt should succeed");
        let last = sealed.len() - 1;
        sealed[last] ^= 0xFF;
        let result = decrypt(&sealed, &TEST_KEY, &[]);
        assert!(matches!(result, Err(CryptoError::Tampered)));
    }

    #[test]
    fn decrypt_fails_on_tampered_tag() {
        let mut sealed = encrypt(b"test data", &TEST_KEY, &[]).expect("encrypt should succeed");
        sealed[NONCE_LEN] ^= 0xFF;
        let result = decrypt(&sealed, &TEST_KEY, &[]);
        assert!(matches!(result, Err(CryptoError::Tampered)));
    }

    #[test]
    fn decrypt_fails_with_wrong_key() {
        let sealed = encrypt(b"test data", &TEST_KEY, &[]).expect("encrypt should succeed");
        let result = decrypt(&sealed, &WRONG_KEY, &[]);
        assert!(matches!(result, Err(CryptoError::Tampered)));
    }

    #[test]
    fn decrypt_fails_with_modified_nonce() {
        let mut sealed = encrypt(b"test data", &TEST_KEY, &[]).expect("encrypt should succeed");
        sealed[0] ^= 0xFF;
        let result = decrypt(&sealed, &TEST_KEY, &[]);
        assert!(matches!(result, Err(CryptoError::Tampered)));
    }

    #[test]
    fn encrypt_rejects_wrong_key_length() {
        let result = encrypt(b"test", &[0u8; 31], &[]);
        assert!(matches!(result, Err(CryptoError::Malformed(_))));
    }

    #[test]
    fn encrypt_empty_plaintext_succeeds() {
        let sealed = encrypt(&[], &TEST_KEY, &[]).expect("encrypt empty should succeed");
        assert_eq!(sealed.len(), HEADER_LEN);
        let decrypted = decrypt(&sealed, &TEST_KEY, &[]).expect("decrypt empty should succeed");
        assert!(decrypted.expose().is_empty());
    }

    #[test]
    fn two_encrypts_produce_different_nonces() {
        let a = encrypt(b"same data", &TEST_KEY, &[]).expect("encrypt should succeed");
        let b = encrypt(b"same data", &TEST_KEY, &[]).expect("encrypt should succeed");
        assert_ne!(&a[..NONCE_LEN], &b[..NONCE_LEN]);
        assert_ne!(a, b);
    }

    #[test]
    fn decrypt_rejects_short_input() {
        let result = decrypt(&[0u8; HEADER_LEN - 1], &TEST_KEY, &[]);
        assert!(matches!(result, Err(CryptoError::Malformed(_))));
    }

    #[test]
    fn aad_mismatch_causes_decryption_failure() {
        let sealed =
            encrypt(b"aad test", &TEST_KEY, b"correct aad").expect("encrypt should succeed");
        let result = decrypt(&sealed, &TEST_KEY, b"wrong aad");
        assert!(matches!(result, Err(CryptoError::Tampered)));
    }

    #[test]
    fn encrypt_decrypt_with_aad_roundtrip() {
        let aad = b"record-id:12345";
        let plaintext = b"sensitive field value";
        let sealed = encrypt(plaintext, &TEST_KEY, aad).expect("encrypt should succeed");
        let decrypted = decrypt(&sealed, &TEST_KEY, aad).expect("decrypt should succeed");
        assert_eq!(decrypted.expose(), plaintext);
    }

    #[test]
    fn decrypt_output_is_secret_buffer() {
        let sealed = encrypt(b"secret", &TEST_KEY, &[]).expect("encrypt should succeed");
        let decrypted = decrypt(&sealed, &TEST_KEY, &[]).expect("decrypt should succeed");
        assert_eq!(format!("{decrypted:?}"), "SecretBuffer(***)");
    }

    #[test]
    fn batch_roundtrip_with_independent_nonces() {
        let plaintexts: Vec<&[u8]> = vec![b"a", b"bb", b"ccc"];
        let sealed = encrypt_batch(&plaintexts, &TEST_KEY, &[]).expect("batch encrypt");
        assert_ne!(&sealed[0][..NONCE_LEN], &sealed[1][..NONCE_LEN]);
        let refs: Vec<&[u8]> = sealed.iter().map(Vec::as_slice).collect();
        let decrypted = decrypt_batch(&refs, &TEST_KEY, &[]).expect("batch decrypt");
        for (got, want) in decrypted.iter().zip(plaintexts.iter()) {
            assert_eq!(got.expose(), *want);
        }
    }

    #[test]
    fn batch_propagates_first_error() {
        let plaintexts: Vec<&[u8]> = vec![b"a", b"b"];
        let result = encrypt_batch(&plaintexts, &[0u8; 10], &[]);
        assert!(matches!(result, Err(CryptoError::Malformed(_))));
    }
}
