//! BFV homomorphic index engine: key lifecycle, integer encrypt/decrypt,
//! oblivious equality, and per-bit range comparison.
//!
//! Grounded on `FHEManager` from the originating system, translated from
//! SEAL-Python to [`seal_fhe`] (Sunscreen's Rust bindings to Microsoft SEAL).

use crate::codec;
use crate::error::CryptoError;
use crate::keystore::{FheKeyFiles, KeyFileNames, KeyStore};
use lru::LruCache;
use parking_lot::Mutex;
use seal_fhe::{
    BFVEncoder, BFVEvaluator, BfvEncryptionParametersBuilder, CoefficientModulus, Context,
    Decryptor, Encryptor, GaloisKeys, KeyGenerator, Plaintext, PublicKey, RelinearizationKeys,
    SecretKey, SecurityLevel,
};
use std::num::NonZeroUsize;
use subtle::ConstantTimeEq;

/// BFV polynomial modulus degree.
const POLY_MODULUS_DEGREE: u64 = 8192;
/// BFV coefficient modulus bit sizes.
const COEFF_MODULUS_BITS: [i32; 4] = [60, 40, 40, 60];
/// BFV plain modulus (prime supporting batching at `N = 8192`).
const PLAIN_MODULUS: u64 = 1_032_193;
/// Default range-comparator width, in bits.
pub const DEFAULT_RANGE_WIDTH: usize = 32;

/// A BFV homomorphic encryption engine over 64-bit signed integers.
///
/// In *encrypt-only* mode the engine holds no secret key material: it can
/// encrypt but not decrypt or compare. All such calls fail with
/// [`CryptoError::EncryptOnly`].
pub struct FheEngine {
    public_key: PublicKey,
    secret_key: Option<SecretKey>,
    relin_keys: Option<RelinearizationKeys>,
    #[allow(dead_code)]
    galois_keys: Option<GaloisKeys>,
    encryptor: Encryptor,
    decryptor: Option<Decryptor>,
    evaluator: BFVEvaluator,
    encoder: BFVEncoder,
    plain_modulus: u64,
    range_width: usize,
    encrypt_cache: Mutex<LruCache<i64, Vec<u8>>>,
    decrypt_cache: Mutex<LruCache<String, i64>>,
}

// SAFETY-relevant note: seal_fhe's context/key/evaluator types are
// immutable after construction; only per-call working ciphertexts are
// mutated, and those are local to each call. See the concurrency model.
unsafe impl Send for FheEngine {}
unsafe impl Sync for FheEngine {}

fn build_context() -> Result<Context, CryptoError> {
    let coeff_modulus =
        CoefficientModulus::create(POLY_MODULUS_DEGREE, &COEFF_MODULUS_BITS)
            .map_err(|e| CryptoError::IoError(format!("coefficient modulus build failed: {e}")))?;
    let params = BfvEncryptionParametersBuilder::new()
        .set_poly_modulus_degree(POLY_MODULUS_DEGREE)
        .set_coefficient_modulus(coeff_modulus)
        .set_plain_modulus_u64(PLAIN_MODULUS)
        .build()
        .map_err(|e| CryptoError::IoError(format!("BFV parameter build failed: {e}")))?;
    Context::new(&params, true, SecurityLevel::TC128)
        .map_err(|e| CryptoError::IoError(format!("BFV context build failed: {e}")))
}

impl FheEngine {
    /// Load an existing key bundle from `keystore`, or generate and persist
    /// a fresh one if no files exist yet.
    ///
    /// # Errors
    ///
    /// Propagates [`CryptoError`] from key I/O, wrapping, or BFV context
    /// construction.
    pub fn init(
        keystore: &KeyStore,
        names: &KeyFileNames,
        encrypt_only: bool,
        cache_size: usize,
        range_width: usize,
        password: Option<&str>,
    ) -> Result<Self, CryptoError> {
        match keystore.load_fhe(names, password) {
            Ok(files) => Self::from_key_files(files, encrypt_only, cache_size, range_width),
            Err(_) => {
                tracing::info!("no existing FHE keys found, generating a new bundle");
                Self::generate_and_persist(keystore, names, encrypt_only, cache_size, range_width, password)
            }
        }
    }

    fn from_key_files(
        files: FheKeyFiles,
        encrypt_only: bool,
        cache_size: usize,
        range_width: usize,
    ) -> Result<Self, CryptoError> {
        let context = build_context()?;
        let public_key: PublicKey = bincode::deserialize(&files.public)
            .map_err(|e| CryptoError::CorruptCiphertext(format!("public key decode: {e}")))?;

        let (secret_key, relin_keys, galois_keys, decryptor) = if encrypt_only {
            (None, None, None, None)
        } else {
            let secret_bytes = files
                .secret
                .ok_or_else(|| CryptoError::Malformed("secret key file missing".into()))?;
            let secret_key: SecretKey = bincode::deserialize(&secret_bytes)
                .map_err(|e| CryptoError::CorruptCiphertext(format!("secret key decode: {e}")))?;
            let relin_keys = files
                .relin
                .map(|b| {
                    bincode::deserialize(&b).map_err(|e| {
                        CryptoError::CorruptCiphertext(format!("relin keys decode: {e}"))
                    })
                })
                .transpose()?;
            let galois_keys = files
                .galois
                .map(|b| {
                    bincode::deserialize(&b).map_err(|e| {
                        CryptoError::CorruptCiphertext(format!("galois keys decode: {e}"))
                    })
                })
                .transpose()?;
            let decryptor = Decryptor::new(&context, &secret_key)
                .map_err(|e| CryptoError::IoError(format!("decryptor init failed: {e}")))?;
            (Some(secret_key), relin_keys, galois_keys, Some(decryptor))
        };

        let encryptor = Encryptor::with_public_key(&context, &public_key)
            .map_err(|e| CryptoError::IoError(format!("encryptor init failed: {e}")))?;
        let evaluator = BFVEvaluator::new(&context)
            .map_err(|e| CryptoError::IoError(format!("evaluator init failed: {e}")))?;
        let encoder = BFVEncoder::new(&context)
            .map_err(|e| CryptoError::IoError(format!("encoder init failed: {e}")))?;

        Ok(Self::assemble(
            public_key,
            secret_key,
            relin_keys,
            galois_keys,
            encryptor,
            decryptor,
            evaluator,
            encoder,
            cache_size,
            range_width,
        ))
    }

    fn generate_and_persist(
        keystore: &KeyStore,
        names: &KeyFileNames,
        encrypt_only: bool,
        cache_size: usize,
        range_width: usize,
        password: Option<&str>,
    ) -> Result<Self, CryptoError> {
        let context = build_context()?;
        let keygen = KeyGenerator::new(&context)
            .map_err(|e| CryptoError::IoError(format!("key generator init failed: {e}")))?;
        let public_key = keygen.create_public_key();
        let secret_key = keygen.secret_key();
        let relin_keys = keygen
            .create_relinearization_keys()
            .map_err(|e| CryptoError::IoError(format!("relin key generation failed: {e}")))?;
        let galois_keys = keygen
            .create_galois_keys()
            .map_err(|e| CryptoError::IoError(format!("galois key generation failed: {e}")))?;

        let public_bytes = bincode::serialize(&public_key)
            .map_err(|e| CryptoError::IoError(format!("public key encode: {e}")))?;
        let secret_bytes = bincode::serialize(&secret_key)
            .map_err(|e| CryptoError::IoError(format!("secret key encode: {e}")))?;
        let relin_bytes = bincode::serialize(&relin_keys)
            .map_err(|e| CryptoError::IoError(format!("relin key encode: {e}")))?;
        let galois_bytes = bincode::serialize(&galois_keys)
            .map_err(|e| CryptoError::IoError(format!("galois key encode: {e}")))?;

        keystore.save_fhe(
            &public_bytes,
            Some(&secret_bytes),
            Some(&relin_bytes),
            Some(&galois_bytes),
            names,
            password,
        )?;

        let encryptor = Encryptor::with_public_key(&context, &public_key)
            .map_err(|e| CryptoError::IoError(format!("encryptor init failed: {e}")))?;
        let evaluator = BFVEvaluator::new(&context)
            .map_err(|e| CryptoError::IoError(format!("evaluator init failed: {e}")))?;
        let encoder = BFVEncoder::new(&context)
            .map_err(|e| CryptoError::IoError(format!("encoder init failed: {e}")))?;

        let (secret_key, relin_keys, galois_keys, decryptor) = if encrypt_only {
            (None, None, None, None)
        } else {
            let decryptor = Decryptor::new(&context, &secret_key)
                .map_err(|e| CryptoError::IoError(format!("decryptor init failed: {e}")))?;
            (
                Some(secret_key),
                Some(relin_keys),
                Some(galois_keys),
                Some(decryptor),
            )
        };

        Ok(Self::assemble(
            public_key,
            secret_key,
            relin_keys,
            galois_keys,
            encryptor,
            decryptor,
            evaluator,
            encoder,
            cache_size,
            range_width,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        public_key: PublicKey,
        secret_key: Option<SecretKey>,
        relin_keys: Option<RelinearizationKeys>,
        galois_keys: Option<GaloisKeys>,
        encryptor: Encryptor,
        decryptor: Option<Decryptor>,
        evaluator: BFVEvaluator,
        encoder: BFVEncoder,
        cache_size: usize,
        range_width: usize,
    ) -> Self {
        let capacity = NonZeroUsize::new(cache_size.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            public_key,
            secret_key,
            relin_keys,
            galois_keys,
            encryptor,
            decryptor,
            evaluator,
            encoder,
            plain_modulus: PLAIN_MODULUS,
            range_width,
            encrypt_cache: Mutex::new(LruCache::new(capacity)),
            decrypt_cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// `true` if this engine holds no secret key material.
    #[must_use]
    pub const fn is_encrypt_only(&self) -> bool {
        self.secret_key.is_none()
    }

    fn require_secret(&self) -> Result<&Decryptor, CryptoError> {
        self.decryptor.as_ref().ok_or(CryptoError::EncryptOnly)
    }

    /// Encrypt a single `i64` value, caching the compressed ciphertext
    /// under `"enc:{v}"`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::IoError`] if the encoder or encryptor fails,
    /// or [`CryptoError::CorruptCiphertext`] if compression fails.
    pub fn encrypt_int(&self, v: i64) -> Result<Vec<u8>, CryptoError> {
        let cache_key = v;
        if let Some(hit) = self.encrypt_cache.lock().get(&cache_key) {
            return Ok(hit.clone());
        }

        let plain = self
            .encoder
            .encode_i64(&[v])
            .map_err(|e| CryptoError::IoError(format!("encode failed: {e}")))?;
        let ciphertext = self
            .encryptor
            .encrypt(&plain)
            .map_err(|e| CryptoError::IoError(format!("encrypt failed: {e}")))?;
        let serialized = bincode::serialize(&ciphertext)
            .map_err(|e| CryptoError::IoError(format!("ciphertext encode: {e}")))?;
        let compressed = codec::compress(&serialized, 9)?;

        self.encrypt_cache.lock().put(cache_key, compressed.clone());
        Ok(compressed)
    }

    /// Decrypt a compressed ciphertext produced by [`FheEngine::encrypt_int`].
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::EncryptOnly`] if this engine holds no secret
    /// key, or [`CryptoError::CorruptCiphertext`] if the bytes do not
    /// decompress/deserialize.
    pub fn decrypt_int(&self, compressed: &[u8]) -> Result<i64, CryptoError> {
        let decryptor = self.require_secret()?;

        let cache_key = cache_key_hex(compressed);
        if let Some(hit) = self.decrypt_cache.lock().get(&cache_key) {
            return Ok(*hit);
        }

        let value = self.decrypt_ciphertext_bytes(decryptor, compressed)?;
        self.decrypt_cache.lock().put(cache_key, value);
        Ok(value)
    }

    fn deserialize_ciphertext(
        &self,
        compressed: &[u8],
    ) -> Result<seal_fhe::Ciphertext, CryptoError> {
        let serialized = codec::decompress(compressed)?;
        bincode::deserialize(&serialized)
            .map_err(|e| CryptoError::CorruptCiphertext(format!("ciphertext decode: {e}")))
    }

    fn decrypt_ciphertext_bytes(
        &self,
        decryptor: &Decryptor,
        compressed: &[u8],
    ) -> Result<i64, CryptoError> {
        let ciphertext = self.deserialize_ciphertext(compressed)?;
        let plain = decryptor
            .decrypt(&ciphertext)
            .map_err(|e| CryptoError::IoError(format!("decrypt failed: {e}")))?;
        self.decode_first_i64(&plain)
    }

    fn decode_first_i64(&self, plain: &Plaintext) -> Result<i64, CryptoError> {
        let decoded = self
            .encoder
            .decode_i64(plain)
            .map_err(|e| CryptoError::IoError(format!("decode failed: {e}")))?;
        decoded
            .first()
            .copied()
            .ok_or_else(|| CryptoError::CorruptCiphertext("empty decoded slot vector".into()))
    }

    /// Evaluate equality between two encrypted integers without revealing
    /// their values to the secret-key holder, via a fresh random
    /// multiplicative mask per call.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::EncryptOnly`] if this engine holds no secret
    /// key. All other internal failures surface as the opaque
    /// [`CryptoError::ComparisonFailed`] (the underlying cause is logged,
    /// never returned, per the error-handling contract).
    pub fn compare_equal(&self, enc_a: &[u8], enc_b: &[u8]) -> Result<bool, CryptoError> {
        let decryptor = self.require_secret()?;
        self.compare_equal_inner(decryptor, enc_a, enc_b)
            .map_err(|e| {
                tracing::error!(error = %e, "oblivious equality comparison failed");
                CryptoError::ComparisonFailed
            })
    }

    fn compare_equal_inner(
        &self,
        decryptor: &Decryptor,
        enc_a: &[u8],
        enc_b: &[u8],
    ) -> Result<bool, CryptoError> {
        let a = self.deserialize_ciphertext(enc_a)?;
        let b = self.deserialize_ciphertext(enc_b)?;

        let mask = random_nonzero_mod(self.plain_modulus);
        let mask_plain = self
            .encoder
            .encode_i64(&[mask])
            .map_err(|e| CryptoError::IoError(format!("encode mask failed: {e}")))?;

        let mut a_masked = self
            .evaluator
            .multiply_plain(&a, &mask_plain)
            .map_err(|e| CryptoError::IoError(format!("multiply_plain failed: {e}")))?;
        let mut b_masked = self
            .evaluator
            .multiply_plain(&b, &mask_plain)
            .map_err(|e| CryptoError::IoError(format!("multiply_plain failed: {e}")))?;

        if let Some(relin_keys) = &self.relin_keys {
            if a_masked.num_polys() > 2 {
                self.evaluator
                    .relinearize_inplace(&mut a_masked, relin_keys)
                    .map_err(|e| CryptoError::IoError(format!("relinearize failed: {e}")))?;
            }
            if b_masked.num_polys() > 2 {
                self.evaluator
                    .relinearize_inplace(&mut b_masked, relin_keys)
                    .map_err(|e| CryptoError::IoError(format!("relinearize failed: {e}")))?;
            }
        }

        let diff = self
            .evaluator
            .sub(&a_masked, &b_masked)
            .map_err(|e| CryptoError::IoError(format!("sub failed: {e}")))?;

        let plain = decryptor
            .decrypt(&diff)
            .map_err(|e| CryptoError::IoError(format!("decrypt failed: {e}")))?;
        let slot0 = self.decode_first_i64(&plain)?;
        let reduced = slot0.rem_euclid(i64::try_from(self.plain_modulus).unwrap_or(i64::MAX));

        // Constant-time with respect to the secret residue: compare against
        // zero via byte equality rather than an integer `== 0` branch.
        let reduced_bytes = reduced.to_le_bytes();
        let zero_bytes = 0i64.to_le_bytes();
        Ok(reduced_bytes.ct_eq(&zero_bytes).unwrap_u8() == 1)
    }

    /// Encrypt `v` bit-by-bit, MSB (index 0) to LSB (index `W-1`), for use
    /// as a per-bit range index.
    ///
    /// # Errors
    ///
    /// See [`FheEngine::encrypt_int`].
    pub fn encrypt_for_range(&self, v: i64) -> Result<Vec<Vec<u8>>, CryptoError> {
        let bits = to_msb_bits(v, self.range_width);
        bits.into_iter()
            .map(|bit| self.encrypt_int(i64::from(bit)))
            .collect()
    }

    /// `true` iff the value encoded by `bits` is strictly less than `q`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::EncryptOnly`] without secret material;
    /// otherwise internal failures surface as
    /// [`CryptoError::ComparisonFailed`].
    pub fn less_than(&self, bits: &[Vec<u8>], q: i64) -> Result<bool, CryptoError> {
        let decryptor = self.require_secret()?;
        self.bitwise_compare(decryptor, bits, q)
            .map(|ord| ord == std::cmp::Ordering::Less)
            .map_err(|e| {
                tracing::error!(error = %e, "range less_than comparison failed");
                CryptoError::ComparisonFailed
            })
    }

    /// `true` iff the value encoded by `bits` is strictly greater than `q`.
    ///
    /// # Errors
    ///
    /// See [`FheEngine::less_than`].
    pub fn greater_than(&self, bits: &[Vec<u8>], q: i64) -> Result<bool, CryptoError> {
        let decryptor = self.require_secret()?;
        self.bitwise_compare(decryptor, bits, q)
            .map(|ord| ord == std::cmp::Ordering::Greater)
            .map_err(|e| {
                tracing::error!(error = %e, "range greater_than comparison failed");
                CryptoError::ComparisonFailed
            })
    }

    fn bitwise_compare(
        &self,
        decryptor: &Decryptor,
        bits: &[Vec<u8>],
        q: i64,
    ) -> Result<std::cmp::Ordering, CryptoError> {
        let query_bits = to_msb_bits(q, bits.len());
        for (encrypted_bit, q_bit) in bits.iter().zip(query_bits.iter()) {
            let ciphertext = self.deserialize_ciphertext(encrypted_bit)?;
            let q_plain = self
                .encoder
                .encode_i64(&[i64::from(*q_bit)])
                .map_err(|e| CryptoError::IoError(format!("encode failed: {e}")))?;
            let diff = self
                .evaluator
                .sub_plain(&ciphertext, &q_plain)
                .map_err(|e| CryptoError::IoError(format!("sub_plain failed: {e}")))?;
            let plain = decryptor
                .decrypt(&diff)
                .map_err(|e| CryptoError::IoError(format!("decrypt failed: {e}")))?;
            let bit_diff = self.decode_first_i64(&plain)?;
            if bit_diff < 0 {
                return Ok(std::cmp::Ordering::Less);
            }
            if bit_diff > 0 {
                return Ok(std::cmp::Ordering::Greater);
            }
        }
        Ok(std::cmp::Ordering::Equal)
    }

    /// `true` iff the value encoded by `bits` satisfies `min <= value <=
    /// max` (either bound may be absent).
    ///
    /// # Errors
    ///
    /// See [`FheEngine::less_than`] and [`FheEngine::greater_than`].
    pub fn in_range(
        &self,
        bits: &[Vec<u8>],
        min: Option<i64>,
        max: Option<i64>,
    ) -> Result<bool, CryptoError> {
        if let Some(min) = min {
            if self.less_than(bits, min)? {
                return Ok(false);
            }
        }
        if let Some(max) = max {
            if self.greater_than(bits, max)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Serialize this engine's public material (public key, evaluation
    /// keys) for [`KeyStore::save_fhe`], and the secret key if present.
    #[must_use]
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }
}

fn cache_key_hex(compressed: &[u8]) -> String {
    let hex: String = compressed.iter().take(16).map(|b| format!("{b:02x}")).collect();
    hex
}

fn to_msb_bits(v: i64, width: usize) -> Vec<u8> {
    (0..width)
        .map(|i| {
            let shift = width.saturating_sub(1).saturating_sub(i);
            u8::try_from((v >> shift) & 1).unwrap_or(0)
        })
        .collect()
}

fn random_nonzero_mod(modulus: u64) -> i64 {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let m = rng.gen_range(1..modulus);
    i64::try_from(m).unwrap_or(1)
}
