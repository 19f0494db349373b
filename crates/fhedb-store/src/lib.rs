//! `fhedb-store` — persistence, caching, and query evaluation for the
//! encrypted record store.
//!
//! Depends on `fhedb-crypto` for the FHE engine and symmetric cipher but
//! never the reverse: key material and ciphertext arithmetic stay
//! entirely inside the crypto crate, and this crate only ever moves
//! opaque bytes in and out of tables.
//!
//! - [`db`] — the three-table `Store` (records, dedup references, range
//!   bits) and the record-by-id cache
//! - [`cache`] — the bounded, thread-safe LRU cache with hit/miss stats
//! - [`query`] — `QueryEvaluator`: equality and range search, and the
//!   composed update/delete-by-query operations

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::arithmetic_side_effects))]

pub mod cache;
pub mod db;
pub mod error;
pub mod query;

pub use cache::{CacheStats, LruCache};
pub use db::{NewRecord, Record, Store};
pub use error::StoreError;
pub use query::QueryEvaluator;
