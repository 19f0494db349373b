//! `fhedb-crypto` — cryptographic primitives for an encrypted record store
//! with a homomorphic-encryption-backed searchable index.
//!
//! This crate is the audit target: it is the smallest thing that must be
//! trusted not to leak key material. It has no database access and no I/O
//! beyond the key directory. It houses:
//!
//! - [`codec`] — compression and non-cryptographic content fingerprinting
//! - [`keystore`] — password-wrapped, versioned key storage with backup/rotate
//! - [`symmetric`] — authenticated (AES-256-GCM) payload encryption
//! - [`fhe`] — the BFV homomorphic index engine
//! - [`config`] — process-wide configuration, injected rather than global

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::arithmetic_side_effects))]

pub mod codec;
pub mod config;
pub mod error;
pub mod fhe;
pub mod keystore;
pub mod memory;
pub mod symmetric;

pub use config::Config;
pub use error::CryptoError;
pub use fhe::FheEngine;
pub use keystore::{validate_password, wrap_sym_key, unwrap_sym_key, FheKeyFiles, KeyFileNames, KeyStore};
pub use memory::{disable_core_dumps, LockedRegion, SecretBuffer, SecretBytes};
pub use symmetric::{decrypt, decrypt_batch, encrypt, encrypt_batch};
