//! End-to-end scenarios over `Store` + `QueryEvaluator`, backed by a real
//! `FheEngine` and a throwaway key directory and database.

use fhedb_crypto::keystore::{KeyFileNames, KeyStore};
use fhedb_crypto::{symmetric, FheEngine};
use fhedb_store::{QueryEvaluator, Store};

const RANGE_WIDTH: usize = 8;

fn names() -> KeyFileNames {
    KeyFileNames {
        public_key_file: "public.key".to_string(),
        secret_key_file: "secret.key".to_string(),
        relin_key_file: "relin.key".to_string(),
        galois_key_file: "galois.key".to_string(),
    }
}

fn fresh_engine(keys_dir: &std::path::Path) -> FheEngine {
    let keystore = KeyStore::new(keys_dir).expect("keystore init");
    FheEngine::init(&keystore, &names(), false, 64, RANGE_WIDTH, None).expect("engine init")
}

fn seal_payload(plaintext: &[u8], key: &[u8; 32]) -> Vec<u8> {
    symmetric::encrypt(plaintext, key, b"").expect("encrypt payload")
}

fn open_payload(sealed: &[u8], key: &[u8; 32]) -> Vec<u8> {
    symmetric::decrypt(sealed, key, b"")
        .expect("decrypt payload")
        .expose()
        .to_vec()
}

#[test]
fn equality_search_finds_exact_match_only() {
    let key_dir = tempfile::tempdir().expect("key dir");
    let db_dir = tempfile::tempdir().expect("db dir");
    let engine = fresh_engine(key_dir.path());
    let store = Store::open(&db_dir.path().join("store.db"), 64, 64, 64).expect("open store");
    let payload_key = [7u8; 32];

    let enc_idx_42 = engine.encrypt_int(42).expect("encrypt 42");
    let enc_payload_hello = seal_payload(b"hello", &payload_key);
    store.insert(&enc_idx_42, &enc_payload_hello, None).expect("insert hello");

    let enc_idx_7 = engine.encrypt_int(7).expect("encrypt 7");
    let enc_payload_world = seal_payload(b"world", &payload_key);
    store.insert(&enc_idx_7, &enc_payload_world, None).expect("insert world");

    let evaluator = QueryEvaluator::new(&store, &engine);

    let found = evaluator.search_by_index(42).expect("search 42");
    assert_eq!(found.len(), 1);
    let record = store.get(found[0]).expect("get").expect("present");
    assert_eq!(open_payload(&record.encrypted_payload, &payload_key), b"hello");

    assert!(evaluator.search_by_index(100).expect("search 100").is_empty());
}

#[test]
fn range_search_returns_values_within_bounds() {
    let key_dir = tempfile::tempdir().expect("key dir");
    let db_dir = tempfile::tempdir().expect("db dir");
    let engine = fresh_engine(key_dir.path());
    let store = Store::open(&db_dir.path().join("store.db"), 64, 64, 64).expect("open store");
    let payload_key = [9u8; 32];

    let values = [10i64, 20, 30, 40, 50];
    for v in values {
        let enc_idx = engine.encrypt_int(v).expect("encrypt index");
        let bits = engine.encrypt_for_range(v).expect("encrypt range bits");
        let enc_payload = seal_payload(v.to_string().as_bytes(), &payload_key);
        store.insert(&enc_idx, &enc_payload, Some(&bits)).expect("insert");
    }

    let evaluator = QueryEvaluator::new(&store, &engine);
    let found = evaluator.search_by_range(Some(15), Some(45)).expect("range search");

    let mut decrypted: Vec<i64> = found
        .iter()
        .map(|&id| {
            let record = store.get(id).expect("get").expect("present");
            let bytes = open_payload(&record.encrypted_payload, &payload_key);
            String::from_utf8(bytes).expect("utf8").parse().expect("parse")
        })
        .collect();
    decrypted.sort_unstable();
    assert_eq!(decrypted, vec![20, 30, 40]);
}

#[test]
fn dedup_collapses_identical_payload_ciphertexts() {
    let key_dir = tempfile::tempdir().expect("key dir");
    let db_dir = tempfile::tempdir().expect("db dir");
    let engine = fresh_engine(key_dir.path());
    let store = Store::open(&db_dir.path().join("store.db"), 64, 64, 64).expect("open store");
    let payload_key = [3u8; 32];

    // Same plaintext payload but re-encrypted independently — distinct
    // ciphertexts under AES-GCM's fresh-nonce discipline, so this exercises
    // insert's dedup path on the *plaintext*-equal-but-ciphertext-distinct
    // case correctly falling through to two reference rows; dedup only
    // collapses byte-identical ciphertexts, which happens when the same
    // sealed bytes are reused verbatim.
    let sealed_x = seal_payload(b"X", &payload_key);

    let idx_a = engine.encrypt_int(1).expect("encrypt 1");
    let idx_b = engine.encrypt_int(2).expect("encrypt 2");
    let id_a = store.insert(&idx_a, &sealed_x, None).expect("insert a");
    let id_b = store.insert(&idx_b, &sealed_x, None).expect("insert b");
    assert_ne!(id_a, id_b);

    assert_eq!(store.cleanup_references().expect("cleanup"), 0);
    store.delete(id_a).expect("delete a");
    assert_eq!(store.cleanup_references().expect("cleanup"), 0);
    store.delete(id_b).expect("delete b");
    assert_eq!(store.cleanup_references().expect("cleanup"), 1);
}

#[test]
fn cache_invalidation_forces_rescan_after_insert() {
    let key_dir = tempfile::tempdir().expect("key dir");
    let db_dir = tempfile::tempdir().expect("db dir");
    let engine = fresh_engine(key_dir.path());
    let store = Store::open(&db_dir.path().join("store.db"), 64, 64, 64).expect("open store");
    let payload_key = [1u8; 32];
    let evaluator = QueryEvaluator::new(&store, &engine);

    // Populate the equality cache for idx=5 with no matches yet.
    assert!(evaluator.search_by_index(5).expect("first search").is_empty());
    assert_eq!(store.equality_cache().stats().misses, 1);

    let enc_idx_5 = engine.encrypt_int(5).expect("encrypt 5");
    let enc_payload = seal_payload(b"five", &payload_key);
    let id = store.insert(&enc_idx_5, &enc_payload, None).expect("insert");

    // Insert must have cleared the equality cache (and reset its counters):
    // the re-search is a miss again, not a stale cached empty result.
    assert_eq!(store.equality_cache().stats().misses, 0);
    let found = evaluator.search_by_index(5).expect("second search");
    assert_eq!(found, vec![id]);
    assert_eq!(store.equality_cache().stats().misses, 1);
}
