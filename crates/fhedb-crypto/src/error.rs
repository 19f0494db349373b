//! Cryptographic error types for `fhedb-crypto`.
//!
//! Every variant maps 1:1 onto an error kind from the design's error table
//! (`spec.md` §7): each is raised by exactly one component and carries no
//! secret material in its `Display` output.

use thiserror::Error;

/// Errors produced by the BFV engine, the symmetric cipher, the codec, and
/// the key store.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Decryption or comparison requested on an engine holding no secret
    /// material (public-key-only / encrypt-only mode).
    #[error("engine holds no secret key material (encrypt-only mode)")]
    EncryptOnly,

    /// Verification-tag mismatch while unwrapping a password-wrapped key.
    #[error("wrong password")]
    WrongPassword,

    /// AEAD authentication tag mismatch (wrapped key or sealed payload).
    #[error("authentication failed: data has been tampered with")]
    Tampered,

    /// A password was rejected by `validate_password` on a write path.
    #[error("password does not satisfy the complexity policy")]
    WeakPassword,

    /// A zstd frame, or a serialized FHE ciphertext/plaintext, failed to decode.
    #[error("corrupt ciphertext: {0}")]
    CorruptCiphertext(String),

    /// Input shorter than the minimum length for its wire format, or a
    /// buffer/key of an unexpected size reached an internal boundary.
    #[error("malformed input: {0}")]
    Malformed(String),

    /// An on-disk key file carries an unrecognized format version byte.
    #[error("unsupported key file version: {0}")]
    UnsupportedVersion(u8),

    /// Filesystem or archive I/O failure (key load/save, backup, restore).
    #[error("I/O error: {0}")]
    IoError(String),

    /// Opaque failure surfaced to callers of the equality/range comparators;
    /// the real cause is logged, never returned, per §7.
    #[error("comparison failed")]
    ComparisonFailed,
}

impl From<std::io::Error> for CryptoError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}
