//! Persistent record store: three tables, dedup references, and the
//! record-by-id cache.
//!
//! This module owns the `SQLite` connection and all three caches (record,
//! equality-query, range-query). `QueryEvaluator` reads and populates the
//! query caches through the accessors at the bottom of this file but never
//! touches the database directly — all persistence flows through here.

use std::path::Path;

use fhedb_crypto::codec;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::cache::LruCache;
use crate::error::StoreError;

/// Forward-only SQL migrations, embedded at compile time.
/// Index 0 -> version 1, index 1 -> version 2, etc.
const MIGRATIONS: &[&str] = &[include_str!("../migrations/001_initial_schema.sql")];

/// A stored record: encrypted index, encrypted payload, and an optional
/// per-bit range index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Monotonic id, assigned at insert, never reused.
    pub id: u64,
    /// BFV ciphertext of the plaintext index value.
    pub encrypted_index: Vec<u8>,
    /// AES-256-GCM ciphertext of the plaintext payload.
    pub encrypted_payload: Vec<u8>,
    /// ISO-8601 creation timestamp.
    pub created_at: String,
    /// ISO-8601 last-modified timestamp.
    pub updated_at: String,
    /// `W` per-bit ciphertexts ordered MSB to LSB, if range indexing was
    /// requested at insert.
    pub range_bits: Option<Vec<Vec<u8>>>,
}

/// One record to insert as part of a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRecord {
    /// BFV ciphertext of the plaintext index value.
    pub encrypted_index: Vec<u8>,
    /// AES-256-GCM ciphertext of the plaintext payload.
    pub encrypted_payload: Vec<u8>,
    /// Per-bit range ciphertexts, MSB to LSB, or `None` to skip range
    /// indexing for this record.
    pub range_bits: Option<Vec<Vec<u8>>>,
}

/// Persistence layer: tables, dedup references, and cache coordination.
pub struct Store {
    conn: Mutex<Connection>,
    ref_cache: Mutex<std::collections::HashMap<String, i64>>,
    record_cache: LruCache<u64, Record>,
    equality_cache: LruCache<i64, Vec<u64>>,
    range_cache: LruCache<String, Vec<u64>>,
}

fn now_iso8601() -> String {
    // `time`/`chrono` are not in the dependency surface here; a plain
    // monotonically-increasing-enough timestamp from `SystemTime` is
    // sufficient since `created_at`/`updated_at` are informational.
    let since_epoch = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}.{:09}", since_epoch.as_secs(), since_epoch.subsec_nanos())
}

impl Store {
    /// Open (or create) the database at `path` and run pending migrations.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DbError`] if the file cannot be opened or a
    /// migration fails.
    pub fn open(
        path: &Path,
        record_cache_size: usize,
        equality_cache_size: usize,
        range_cache_size: usize,
    ) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")?;

        let store = Self {
            conn: Mutex::new(conn),
            ref_cache: Mutex::new(std::collections::HashMap::new()),
            record_cache: LruCache::new(record_cache_size),
            equality_cache: LruCache::new(equality_cache_size),
            range_cache: LruCache::new(range_cache_size),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.lock();
        let current: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

        for (idx, sql) in MIGRATIONS.iter().enumerate() {
            let version = i32::try_from(idx.saturating_add(1))
                .map_err(|_| StoreError::DbError("migration index overflow".to_string()))?;
            if version <= current {
                continue;
            }
            let tx = conn.transaction()?;
            tx.execute_batch(sql)?;
            tx.pragma_update(None, "user_version", version)?;
            tx.commit()?;
            tracing::info!(version, "applied migration");
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Insert a single record. Upserts the dedup reference, inserts the
    /// record row, and inserts `W` range-bit rows if provided — all in one
    /// transaction. Invalidates both query caches: a new row can always
    /// become a fresh match.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DbError`] on any underlying failure; the
    /// transaction is rolled back.
    pub fn insert(
        &self,
        encrypted_index: &[u8],
        encrypted_payload: &[u8],
        range_bits: Option<&[Vec<u8>]>,
    ) -> Result<u64, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let id = insert_one(&tx, &self.ref_cache, encrypted_index, encrypted_payload, range_bits)?;
        tx.commit()?;
        drop(conn);

        self.equality_cache.clear();
        self.range_cache.clear();
        Ok(id)
    }

    /// Insert many records in a single transaction. All-or-nothing: any
    /// failure aborts the whole batch.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DbError`] on any underlying failure; the
    /// transaction is rolled back and no ids are returned.
    pub fn insert_batch(&self, records: &[NewRecord]) -> Result<Vec<u64>, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut ids = Vec::with_capacity(records.len());
        for record in records {
            let id = insert_one(
                &tx,
                &self.ref_cache,
                &record.encrypted_index,
                &record.encrypted_payload,
                record.range_bits.as_deref(),
            )?;
            ids.push(id);
        }
        tx.commit()?;
        drop(conn);

        if !ids.is_empty() {
            self.equality_cache.clear();
            self.range_cache.clear();
        }
        Ok(ids)
    }

    /// Overwrite a record's payload, upserting a fresh dedup reference and
    /// touching `updated_at`. Invalidates the record cache entry and both
    /// query caches.
    ///
    /// Returns `false` if `id` does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DbError`] on any underlying failure.
    pub fn update_payload(&self, id: u64, new_encrypted_payload: &[u8]) -> Result<bool, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        upsert_reference(&tx, &self.ref_cache, new_encrypted_payload)?;

        #[allow(clippy::cast_possible_wrap)]
        let rows = tx.execute(
            "UPDATE encrypted_records SET encrypted_payload = ?1, updated_at = ?2 WHERE id = ?3",
            params![new_encrypted_payload, now_iso8601(), id as i64],
        )?;
        tx.commit()?;
        drop(conn);

        let updated = rows > 0;
        if updated {
            self.record_cache.remove(&id);
            self.equality_cache.clear();
            self.range_cache.clear();
        }
        Ok(updated)
    }

    /// Delete one record: removes its range-bit rows first, then the
    /// record row itself, in a single transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DbError`] on any underlying failure.
    pub fn delete(&self, id: u64) -> Result<bool, StoreError> {
        let deleted = self.delete_batch(&[id])?;
        Ok(deleted == 1)
    }

    /// Delete many records in one transaction: all range-bit rows first,
    /// then all record rows. Returns the number of record rows actually
    /// removed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DbError`] on any underlying failure; the
    /// transaction is rolled back and no rows are removed.
    pub fn delete_batch(&self, ids: &[u64]) -> Result<usize, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut removed = 0usize;
        for &id in ids {
            #[allow(clippy::cast_possible_wrap)]
            let id_i64 = id as i64;
            tx.execute(
                "DELETE FROM range_query_indices WHERE record_id = ?1",
                params![id_i64],
            )?;
            let rows = tx.execute("DELETE FROM encrypted_records WHERE id = ?1", params![id_i64])?;
            removed = removed.saturating_add(rows);
        }
        tx.commit()?;
        drop(conn);

        for &id in ids {
            self.record_cache.remove(&id);
        }
        if removed > 0 {
            self.equality_cache.clear();
            self.range_cache.clear();
        }
        Ok(removed)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Look up a record by id, checking the record cache first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DbError`] on any underlying failure.
    pub fn get(&self, id: u64) -> Result<Option<Record>, StoreError> {
        if let Some(record) = self.record_cache.get(&id) {
            return Ok(Some(record));
        }
        let conn = self.conn.lock();
        let record = load_record(&conn, id)?;
        drop(conn);
        if let Some(ref record) = record {
            self.record_cache.put(id, record.clone());
        }
        Ok(record)
    }

    /// Look up many records by id: cache first, then a single `IN` query
    /// for the misses.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DbError`] on any underlying failure.
    pub fn get_many(&self, ids: &[u64]) -> Result<Vec<Record>, StoreError> {
        let mut found = Vec::with_capacity(ids.len());
        let mut misses = Vec::new();
        for &id in ids {
            if let Some(record) = self.record_cache.get(&id) {
                found.push(record);
            } else {
                misses.push(id);
            }
        }
        if misses.is_empty() {
            return Ok(found);
        }

        let conn = self.conn.lock();
        let placeholders = misses.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT id, encrypted_index, encrypted_payload, created_at, updated_at \
             FROM encrypted_records WHERE id IN ({placeholders})"
        );
        let mut stmt = conn.prepare(&sql)?;
        #[allow(clippy::cast_possible_wrap)]
        let id_params: Vec<i64> = misses.iter().map(|&id| id as i64).collect();
        let rows = stmt.query_map(rusqlite::params_from_iter(id_params.iter()), row_to_partial_record)?;
        let mut loaded = Vec::with_capacity(misses.len());
        for row in rows {
            loaded.push(row?);
        }
        drop(stmt);

        for mut record in loaded {
            record.range_bits = load_range_bits(&conn, record.id)?;
            self.record_cache.put(record.id, record.clone());
            found.push(record);
        }
        Ok(found)
    }

    /// Stream `(id, encrypted_index)` for every record — used by
    /// equality-search scans. Materialized eagerly: scans are linear by
    /// design and hold no open cursor across the call boundary.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DbError`] on any underlying failure.
    pub fn scan_index(&self) -> Result<Vec<(u64, Vec<u8>)>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id, encrypted_index FROM encrypted_records")?;
        let rows = stmt.query_map([], |row| {
            let id: i64 = row.get(0)?;
            let enc_idx: Vec<u8> = row.get(1)?;
            #[allow(clippy::cast_sign_loss)]
            Ok((id as u64, enc_idx))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Load the per-bit range ciphertexts for `id`, ordered by bit
    /// position (MSB first). Empty if the record has no range index.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DbError`] on any underlying failure.
    pub fn scan_range_bits(&self, id: u64) -> Result<Vec<Vec<u8>>, StoreError> {
        let conn = self.conn.lock();
        load_range_bits(&conn, id)
    }

    /// Recompute the set of live payload fingerprints from current records
    /// and delete every reference row not in that set. Clears the
    /// reference fingerprint cache. Returns the number of rows deleted.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DbError`] on any underlying failure.
    pub fn cleanup_references(&self) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT encrypted_payload FROM encrypted_records")?;
        let payloads = stmt.query_map([], |row| row.get::<_, Vec<u8>>(0))?;
        let mut live = std::collections::HashSet::new();
        for payload in payloads {
            live.insert(codec::fingerprint_hex(&payload?));
        }
        drop(stmt);

        let mut stmt = conn.prepare("SELECT id, hash FROM reference_table")?;
        let rows = stmt.query_map([], |row| {
            let id: i64 = row.get(0)?;
            let hash: String = row.get(1)?;
            Ok((id, hash))
        })?;
        let mut stale = Vec::new();
        for row in rows {
            let (id, hash) = row?;
            if !live.contains(&hash) {
                stale.push(id);
            }
        }
        drop(stmt);

        let mut removed = 0usize;
        for id in stale {
            removed = removed.saturating_add(conn.execute(
                "DELETE FROM reference_table WHERE id = ?1",
                params![id],
            )?);
        }
        drop(conn);

        self.ref_cache.lock().clear();
        tracing::debug!(removed, "cleaned up stale references");
        Ok(removed)
    }

    // -----------------------------------------------------------------------
    // Cache accessors for QueryEvaluator
    // -----------------------------------------------------------------------

    /// The record-by-id cache.
    #[must_use]
    pub fn record_cache(&self) -> &LruCache<u64, Record> {
        &self.record_cache
    }

    /// The equality-query-result cache: plaintext index value to matching
    /// ids.
    #[must_use]
    pub fn equality_cache(&self) -> &LruCache<i64, Vec<u64>> {
        &self.equality_cache
    }

    /// The range-query-result cache, keyed by `"min-max"` with `*` for
    /// absent bounds.
    #[must_use]
    pub fn range_cache(&self) -> &LruCache<String, Vec<u64>> {
        &self.range_cache
    }
}

fn insert_one(
    tx: &rusqlite::Transaction<'_>,
    ref_cache: &Mutex<std::collections::HashMap<String, i64>>,
    encrypted_index: &[u8],
    encrypted_payload: &[u8],
    range_bits: Option<&[Vec<u8>]>,
) -> Result<u64, StoreError> {
    upsert_reference(tx, ref_cache, encrypted_payload)?;

    let now = now_iso8601();
    tx.execute(
        "INSERT INTO encrypted_records (encrypted_index, encrypted_payload, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?3)",
        params![encrypted_index, encrypted_payload, now],
    )?;
    #[allow(clippy::cast_sign_loss)]
    let id = tx.last_insert_rowid() as u64;

    if let Some(bits) = range_bits {
        for (position, bit) in bits.iter().enumerate() {
            let position = i64::try_from(position)
                .map_err(|_| StoreError::DbError("range width overflow".to_string()))?;
            #[allow(clippy::cast_possible_wrap)]
            tx.execute(
                "INSERT INTO range_query_indices (record_id, bit_position, encrypted_bit) \
                 VALUES (?1, ?2, ?3)",
                params![id as i64, position, bit],
            )?;
        }
    }

    Ok(id)
}

fn upsert_reference(
    tx: &rusqlite::Transaction<'_>,
    ref_cache: &Mutex<std::collections::HashMap<String, i64>>,
    encrypted_payload: &[u8],
) -> Result<(), StoreError> {
    let hash = codec::fingerprint_hex(encrypted_payload);

    if ref_cache.lock().contains_key(&hash) {
        return Ok(());
    }

    let existing: Option<i64> = tx
        .query_row(
            "SELECT id FROM reference_table WHERE hash = ?1",
            params![hash],
            |row| row.get(0),
        )
        .optional()?;

    let ref_id = match existing {
        Some(id) => id,
        None => {
            tx.execute(
                "INSERT INTO reference_table (hash, encrypted_payload) VALUES (?1, ?2)",
                params![hash, encrypted_payload],
            )?;
            tx.last_insert_rowid()
        }
    };

    ref_cache.lock().insert(hash, ref_id);
    Ok(())
}

fn row_to_partial_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<Record> {
    let id: i64 = row.get(0)?;
    #[allow(clippy::cast_sign_loss)]
    Ok(Record {
        id: id as u64,
        encrypted_index: row.get(1)?,
        encrypted_payload: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
        range_bits: None,
    })
}

fn load_record(conn: &Connection, id: u64) -> Result<Option<Record>, StoreError> {
    #[allow(clippy::cast_possible_wrap)]
    let id_i64 = id as i64;
    let record = conn
        .query_row(
            "SELECT id, encrypted_index, encrypted_payload, created_at, updated_at \
             FROM encrypted_records WHERE id = ?1",
            params![id_i64],
            row_to_partial_record,
        )
        .optional()?;

    match record {
        Some(mut record) => {
            record.range_bits = load_range_bits(conn, id)?;
            Ok(Some(record))
        }
        None => Ok(None),
    }
}

fn load_range_bits(conn: &Connection, id: u64) -> Result<Vec<Vec<u8>>, StoreError> {
    #[allow(clippy::cast_possible_wrap)]
    let id_i64 = id as i64;
    let mut stmt = conn.prepare(
        "SELECT encrypted_bit FROM range_query_indices WHERE record_id = ?1 ORDER BY bit_position ASC",
    )?;
    let rows = stmt.query_map(params![id_i64], |row| row.get::<_, Vec<u8>>(0))?;
    let mut bits = Vec::new();
    for row in rows {
        bits.push(row?);
    }
    Ok(bits)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> Store {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("store.db");
        let store = Store::open(&path, 100, 100, 100).expect("open store");
        std::mem::forget(dir); // keep the backing dir alive for the test's duration
        store
    }

    #[test]
    fn insert_then_get_roundtrips() {
        let store = open_temp();
        let id = store.insert(b"idx", b"payload", None).expect("insert");
        let record = store.get(id).expect("get").expect("present");
        assert_eq!(record.encrypted_index, b"idx");
        assert_eq!(record.encrypted_payload, b"payload");
        assert_eq!(record.range_bits, None);
    }

    #[test]
    fn insert_with_range_bits_roundtrips_ordered() {
        let store = open_temp();
        let bits = vec![vec![1u8], vec![2u8], vec![3u8]];
        let id = store.insert(b"idx", b"payload", Some(&bits)).expect("insert");
        let loaded = store.scan_range_bits(id).expect("scan range bits");
        assert_eq!(loaded, bits);
    }

    #[test]
    fn get_missing_returns_none() {
        let store = open_temp();
        assert_eq!(store.get(9999).expect("get"), None);
    }

    #[test]
    fn update_payload_touches_record_and_clears_query_caches() {
        let store = open_temp();
        let id = store.insert(b"idx", b"old", None).expect("insert");
        store.equality_cache().put(1, vec![id]);
        store.range_cache().put("1-2".to_string(), vec![id]);

        let updated = store.update_payload(id, b"new").expect("update");
        assert!(updated);
        assert_eq!(
            store.get(id).expect("get").expect("present").encrypted_payload,
            b"new"
        );
        assert!(store.equality_cache().is_empty());
        assert!(store.range_cache().is_empty());
    }

    #[test]
    fn update_payload_missing_id_returns_false() {
        let store = open_temp();
        assert!(!store.update_payload(9999, b"x").expect("update"));
    }

    #[test]
    fn delete_removes_record_and_range_bits() {
        let store = open_temp();
        let bits = vec![vec![1u8]; 4];
        let id = store.insert(b"idx", b"payload", Some(&bits)).expect("insert");
        assert!(store.delete(id).expect("delete"));
        assert_eq!(store.get(id).expect("get"), None);
        assert_eq!(store.scan_range_bits(id).expect("scan"), Vec::<Vec<u8>>::new());
    }

    #[test]
    fn dedup_collapses_identical_payloads() {
        let store = open_temp();
        let id_a = store.insert(b"idx-a", b"same", None).expect("insert a");
        let id_b = store.insert(b"idx-b", b"same", None).expect("insert b");
        assert_ne!(id_a, id_b);

        let conn = store.conn.lock();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM reference_table", [], |row| row.get(0))
            .expect("count");
        drop(conn);
        assert_eq!(count, 1);
    }

    #[test]
    fn cleanup_references_reduces_to_live_set() {
        let store = open_temp();
        let id_a = store.insert(b"idx-a", b"x", None).expect("insert a");
        let _id_b = store.insert(b"idx-b", b"x", None).expect("insert b");
        assert_eq!(store.cleanup_references().expect("cleanup"), 0);

        store.delete(id_a).expect("delete a");
        assert_eq!(store.cleanup_references().expect("cleanup"), 0);
    }

    #[test]
    fn cleanup_references_deletes_stale_after_last_referent_removed() {
        let store = open_temp();
        let id_a = store.insert(b"idx-a", b"x", None).expect("insert a");
        let id_b = store.insert(b"idx-b", b"x", None).expect("insert b");
        store.delete(id_a).expect("delete a");
        assert_eq!(store.cleanup_references().expect("cleanup"), 0);
        store.delete(id_b).expect("delete b");
        assert_eq!(store.cleanup_references().expect("cleanup"), 1);
    }

    #[test]
    fn insert_batch_is_all_or_nothing_on_empty_input() {
        let store = open_temp();
        assert_eq!(store.insert_batch(&[]).expect("insert batch"), Vec::<u64>::new());
    }

    #[test]
    fn get_many_mixes_cache_and_db() {
        let store = open_temp();
        let id1 = store.insert(b"a", b"1", None).expect("insert");
        let id2 = store.insert(b"b", b"2", None).expect("insert");
        // Warm the cache for id1 only.
        let _ = store.get(id1).expect("get");
        let records = store.get_many(&[id1, id2]).expect("get many");
        assert_eq!(records.len(), 2);
    }
}
