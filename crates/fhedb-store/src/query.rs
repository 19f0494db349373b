//! Equality and range search over the encrypted index, result assembly,
//! and the four composed update/delete-by-query operations.
//!
//! `QueryEvaluator` owns no state of its own: it holds references to a
//! [`Store`] (which owns the query caches as well as the tables) and an
//! [`FheEngine`]. This is the explicit capability-object wiring in place of
//! a runtime-polymorphic `fhe_manager` handle threaded through the store.

use fhedb_crypto::FheEngine;

use crate::db::Store;
use crate::error::StoreError;

/// Composes `Store` and `FheEngine` into equality/range search and the
/// search-then-mutate operations.
pub struct QueryEvaluator<'a> {
    store: &'a Store,
    fhe: &'a FheEngine,
}

impl<'a> QueryEvaluator<'a> {
    /// Build an evaluator over the given store and engine.
    #[must_use]
    pub const fn new(store: &'a Store, fhe: &'a FheEngine) -> Self {
        Self { store, fhe }
    }

    /// Find every record whose plaintext index equals `q`.
    ///
    /// Checks the equality-query cache first; on a miss, re-encrypts `q`
    /// once and evaluates `compare_equal` against every row's encrypted
    /// index, then populates the cache.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the scan or a comparison fails.
    pub fn search_by_index(&self, q: i64) -> Result<Vec<u64>, StoreError> {
        if let Some(cached) = self.store.equality_cache().get(&q) {
            tracing::debug!(matches = cached.len(), "equality cache hit");
            return Ok(cached);
        }

        let encrypted_q = self.fhe.encrypt_int(q)?;
        let mut matches = Vec::new();
        for (id, enc_idx) in self.store.scan_index()? {
            if self.fhe.compare_equal(&enc_idx, &encrypted_q)? {
                matches.push(id);
            }
        }

        tracing::debug!(matches = matches.len(), "equality scan completed");
        self.store.equality_cache().put(q, matches.clone());
        Ok(matches)
    }

    /// Find every record whose plaintext index is in `qs`, returning a
    /// parallel `Vec<Vec<u64>>` of matches per query value.
    ///
    /// Cached values are served directly; uncached values share a single
    /// scan of the table, each row tested against every still-uncached
    /// query and short-circuiting to the next row on first match per
    /// value.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the scan or a comparison fails.
    pub fn search_by_multiple_indices(&self, qs: &[i64]) -> Result<Vec<Vec<u64>>, StoreError> {
        let mut results: Vec<Option<Vec<u64>>> = vec![None; qs.len()];
        let mut uncached_idx = Vec::new();
        let mut encrypted = Vec::new();

        for (i, &q) in qs.iter().enumerate() {
            if let Some(cached) = self.store.equality_cache().get(&q) {
                results[i] = Some(cached);
            } else {
                uncached_idx.push(i);
                encrypted.push(self.fhe.encrypt_int(q)?);
            }
        }

        if !uncached_idx.is_empty() {
            let mut scratch = vec![Vec::new(); uncached_idx.len()];
            for (id, enc_idx) in self.store.scan_index()? {
                for (slot, enc_q) in encrypted.iter().enumerate() {
                    if self.fhe.compare_equal(&enc_idx, enc_q)? {
                        scratch[slot].push(id);
                        // A row's index can equal at most one distinct query value.
                        break;
                    }
                }
            }
            for (slot, &i) in uncached_idx.iter().enumerate() {
                self.store.equality_cache().put(qs[i], scratch[slot].clone());
                results[i] = Some(std::mem::take(&mut scratch[slot]));
            }
        }

        Ok(results.into_iter().map(Option::unwrap_or_default).collect())
    }

    /// Find every record whose plaintext index falls in `[min, max]`
    /// (either bound may be absent), via the per-bit range index.
    ///
    /// Checks the range-query cache under the key `"min-max"`, using `*`
    /// for an absent bound. Records with no range index are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the scan or a comparison fails.
    pub fn search_by_range(&self, min: Option<i64>, max: Option<i64>) -> Result<Vec<u64>, StoreError> {
        let key = range_cache_key(min, max);
        if let Some(cached) = self.store.range_cache().get(&key) {
            return Ok(cached);
        }

        let mut matches = Vec::new();
        for (id, _) in self.store.scan_index()? {
            let bits = self.store.scan_range_bits(id)?;
            if bits.is_empty() {
                continue;
            }
            if self.fhe.in_range(&bits, min, max)? {
                matches.push(id);
            }
        }

        self.store.range_cache().put(key, matches.clone());
        Ok(matches)
    }

    /// Replace the payload of every record matching `search_by_index(q)`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the search or any write fails.
    pub fn update_by_index(&self, q: i64, new_encrypted_payload: &[u8]) -> Result<usize, StoreError> {
        let ids = self.search_by_index(q)?;
        let mut updated = 0usize;
        for id in ids {
            if self.store.update_payload(id, new_encrypted_payload)? {
                updated = updated.saturating_add(1);
            }
        }
        Ok(updated)
    }

    /// Delete every record matching `search_by_index(q)`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the search or the delete fails.
    pub fn delete_by_index(&self, q: i64) -> Result<usize, StoreError> {
        let ids = self.search_by_index(q)?;
        self.store.delete_batch(&ids)
    }

    /// Replace the payload of every record matching `search_by_range(min, max)`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the search or any write fails.
    pub fn update_by_range(
        &self,
        min: Option<i64>,
        max: Option<i64>,
        new_encrypted_payload: &[u8],
    ) -> Result<usize, StoreError> {
        let ids = self.search_by_range(min, max)?;
        let mut updated = 0usize;
        for id in ids {
            if self.store.update_payload(id, new_encrypted_payload)? {
                updated = updated.saturating_add(1);
            }
        }
        Ok(updated)
    }

    /// Delete every record matching `search_by_range(min, max)`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the search or the delete fails.
    pub fn delete_by_range(&self, min: Option<i64>, max: Option<i64>) -> Result<usize, StoreError> {
        let ids = self.search_by_range(min, max)?;
        self.store.delete_batch(&ids)
    }
}

fn range_cache_key(min: Option<i64>, max: Option<i64>) -> String {
    let min_str = min.map_or_else(|| "*".to_string(), |v| v.to_string());
    let max_str = max.map_or_else(|| "*".to_string(), |v| v.to_string());
    format!("{min_str}-{max_str}")
}

#[cfg(test)]
mod tests {
    use super::range_cache_key;

    #[test]
    fn range_cache_key_uses_star_for_absent_bounds() {
        assert_eq!(range_cache_key(None, None), "*-*");
        assert_eq!(range_cache_key(Some(10), None), "10-*");
        assert_eq!(range_cache_key(None, Some(20)), "*-20");
        assert_eq!(range_cache_key(Some(10), Some(20)), "10-20");
    }
}
