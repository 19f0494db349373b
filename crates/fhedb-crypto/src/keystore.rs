//! Directory-backed, password-protected storage for symmetric and BFV key
//! material.
//!
//! Wrapped symmetric keys are self-contained byte blobs of the form
//! `V(1) || salt(16) || <version body>`. For the current format (`V=1`) the
//! version body is `nonce(12) || gcm_tag(16) || verification_tag(8) ||
//! ciphertext`; the verification tag lets [`unwrap_sym_key`] reject a wrong
//! password in constant time before ever touching the AEAD path. `V=0` is a
//! legacy, unauthenticated AES-256-CBC format kept for reading only.

use crate::codec;
use crate::error::CryptoError;
use crate::memory::{SecretBuffer, SecretBytes};
use rand::rngs::OsRng;
use rand::RngCore;
use ring::aead;
use ring::hmac;
use ring::pbkdf2;
use std::fs;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

const SALT_LEN: usize = 16;
const VERIFICATION_LEN: usize = 8;
const VERIFICATION_CONTEXT: &[u8] = b"VALID_KEY_CHECK";
const CURRENT_VERSION: u8 = 1;
const LEGACY_VERSION: u8 = 0;

/// PBKDF2-HMAC-SHA256 iteration count for key wrapping. The design floor is
/// 100,000; this matches the originating system's configured default.
const DEFAULT_PBKDF2_ITERATIONS: u32 = 1_000_000;

const AES_BLOCK_LEN: usize = 16;

/// Names of the on-disk files making up one FHE key bundle.
#[derive(Clone, Debug)]
pub struct KeyFileNames {
    pub public_key_file: String,
    pub secret_key_file: String,
    pub relin_key_file: String,
    pub galois_key_file: String,
}

/// Raw (still zstd-compressed, not yet deserialized into engine types) FHE
/// key material loaded from disk.
pub struct FheKeyFiles {
    pub public: Vec<u8>,
    pub secret: Option<Vec<u8>>,
    pub relin: Option<Vec<u8>>,
    pub galois: Option<Vec<u8>>,
}

fn aes_companion_file(secret_key_file: &str) -> String {
    match secret_key_file.rsplit_once('.') {
        Some((stem, _ext)) => format!("{stem}_aes.key"),
        None => format!("{secret_key_file}_aes.key"),
    }
}

/// Returns `true` if `password` contains at least two of
/// {uppercase, lowercase, digit, non-alphanumeric}.
#[must_use]
pub fn validate_password(password: &str) -> bool {
    let mut classes = 0u8;
    if password.chars().any(|c| c.is_ascii_uppercase()) {
        classes += 1;
    }
    if password.chars().any(|c| c.is_ascii_lowercase()) {
        classes += 1;
    }
    if password.chars().any(|c| c.is_ascii_digit()) {
        classes += 1;
    }
    if password.chars().any(|c| c.is_ascii() && !c.is_alphanumeric()) {
        classes += 1;
    }
    classes >= 2
}

fn derive_wrap_key(password: &str, salt: &[u8], iterations: u32) -> Result<SecretBytes<32>, CryptoError> {
    let iterations =
        NonZeroU32::new(iterations).ok_or_else(|| CryptoError::Malformed("zero PBKDF2 iterations".into()))?;
    let mut out = [0u8; 32];
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        iterations,
        salt,
        password.as_bytes(),
        &mut out,
    );
    Ok(SecretBytes::new(out))
}

fn verification_tag(k_wrap: &[u8]) -> [u8; VERIFICATION_LEN] {
    let key = hmac::Key::new(hmac::HMAC_SHA256, k_wrap);
    let tag = hmac::sign(&key, VERIFICATION_CONTEXT);
    let mut out = [0u8; VERIFICATION_LEN];
    out.copy_from_slice(&tag.as_ref()[..VERIFICATION_LEN]);
    out
}

/// Wrap `key` under `password`, returning a self-contained blob:
/// `V(1) || salt(16) || nonce(12) || gcm_tag(16) || verification_tag(8) ||
/// ciphertext`.
///
/// # Errors
///
/// Returns [`CryptoError::WeakPassword`] if `password` fails
/// [`validate_password`].
pub fn wrap_sym_key(key: &[u8], password: &str) -> Result<Vec<u8>, CryptoError> {
    wrap_sym_key_with_iterations(key, password, DEFAULT_PBKDF2_ITERATIONS)
}

fn wrap_sym_key_with_iterations(
    key: &[u8],
    password: &str,
    iterations: u32,
) -> Result<Vec<u8>, CryptoError> {
    if !validate_password(password) {
        return Err(CryptoError::WeakPassword);
    }

    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);

    let k_wrap = derive_wrap_key(password, &salt, iterations)?;
    let tag8 = verification_tag(k_wrap.expose());

    let unbound = aead::UnboundKey::new(&aead::AES_256_GCM, k_wrap.expose())
        .map_err(|_| CryptoError::IoError("failed to create wrap key".into()))?;
    let less_safe = aead::LessSafeKey::new(unbound);

    let mut nonce_bytes = [0u8; 12];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = aead::Nonce::assume_unique_for_key(nonce_bytes);

    let mut in_out = key.to_vec();
    let Ok(gcm_tag) = less_safe.seal_in_place_separate_tag(nonce, aead::Aad::empty(), &mut in_out)
    else {
        in_out.zeroize();
        return Err(CryptoError::IoError("key wrap encryption failed".into()));
    };

    let mut out = Vec::with_capacity(
        1 + SALT_LEN + 12 + 16 + VERIFICATION_LEN + in_out.len(),
    );
    out.push(CURRENT_VERSION);
    out.extend_from_slice(&salt);
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(gcm_tag.as_ref());
    out.extend_from_slice(&tag8);
    out.extend_from_slice(&in_out);

    in_out.zeroize();
    Ok(out)
}

/// Unwrap a blob produced by [`wrap_sym_key`] (or a legacy `V=0` blob).
///
/// # Errors
///
/// Returns [`CryptoError::Malformed`] if the blob is structurally too short,
/// [`CryptoError::UnsupportedVersion`] for an unrecognized version byte,
/// [`CryptoError::WrongPassword`] on verification-tag (or, for `V=0`,
/// padding) mismatch, and [`CryptoError::Tampered`] on AEAD failure.
pub fn unwrap_sym_key(blob: &[u8], password: &str) -> Result<SecretBuffer, CryptoError> {
    unwrap_sym_key_with_iterations(blob, password, DEFAULT_PBKDF2_ITERATIONS)
}

fn unwrap_sym_key_with_iterations(
    blob: &[u8],
    password: &str,
    iterations: u32,
) -> Result<SecretBuffer, CryptoError> {
    if blob.len() < 1 + SALT_LEN {
        return Err(CryptoError::Malformed("wrapped key blob too short".into()));
    }
    let version = blob[0];
    let salt = &blob[1..1 + SALT_LEN];
    let body = &blob[1 + SALT_LEN..];

    match version {
        CURRENT_VERSION => unwrap_v1(body, salt, password, iterations),
        LEGACY_VERSION => {
            tracing::warn!("unwrapping legacy V=0 key (unauthenticated AES-256-CBC)");
            unwrap_v0(body, salt, password, iterations)
        }
        other => Err(CryptoError::UnsupportedVersion(other)),
    }
}

fn unwrap_v1(
    body: &[u8],
    salt: &[u8],
    password: &str,
    iterations: u32,
) -> Result<SecretBuffer, CryptoError> {
    let min_len = 12 + 16 + VERIFICATION_LEN;
    if body.len() < min_len {
        return Err(CryptoError::Malformed("V=1 wrap body too short".into()));
    }

    let k_wrap = derive_wrap_key(password, salt, iterations)?;
    let expected_tag = verification_tag(k_wrap.expose());
    let actual_tag = &body[28..28 + VERIFICATION_LEN];
    if expected_tag.ct_eq(actual_tag).unwrap_u8() == 0 {
        return Err(CryptoError::WrongPassword);
    }

    let mut nonce_bytes = [0u8; 12];
    nonce_bytes.copy_from_slice(&body[..12]);
    let nonce = aead::Nonce::assume_unique_for_key(nonce_bytes);

    let tag_start = 12;
    let ct_start = 28 + VERIFICATION_LEN;
    let mut ct_tag = Vec::with_capacity(body.len() - ct_start + 16);
    ct_tag.extend_from_slice(&body[ct_start..]);
    ct_tag.extend_from_slice(&body[tag_start..tag_start + 16]);

    let unbound = aead::UnboundKey::new(&aead::AES_256_GCM, k_wrap.expose())
        .map_err(|_| CryptoError::IoError("failed to create wrap key".into()))?;
    let less_safe = aead::LessSafeKey::new(unbound);

    let plain = less_safe
        .open_in_place(nonce, aead::Aad::empty(), &mut ct_tag)
        .map_err(|_| CryptoError::Tampered)?;

    let result = SecretBuffer::new(plain)?;
    ct_tag.zeroize();
    Ok(result)
}

fn unwrap_v0(
    body: &[u8],
    salt: &[u8],
    password: &str,
    iterations: u32,
) -> Result<SecretBuffer, CryptoError> {
    if body.len() < AES_BLOCK_LEN {
        return Err(CryptoError::Malformed("V=0 wrap body too short".into()));
    }
    let key = derive_wrap_key(password, salt, iterations)?;
    let iv = &body[..AES_BLOCK_LEN];
    let ciphertext = &body[AES_BLOCK_LEN..];

    use aes::cipher::block_padding::Pkcs7;
    use aes::cipher::{BlockDecryptMut, KeyIvInit};
    type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

    if ciphertext.is_empty() || ciphertext.len() % AES_BLOCK_LEN != 0 {
        return Err(CryptoError::WrongPassword);
    }
    let mut buf = ciphertext.to_vec();
    let decryptor = Aes256CbcDec::new(key.expose().as_slice().into(), iv.into());
    let result = decryptor
        .decrypt_padded_mut::<Pkcs7>(&mut buf)
        .map_err(|_| CryptoError::WrongPassword)?
        .to_vec();
    buf.zeroize();

    SecretBuffer::new(&result)
}

/// Directory-backed store for symmetric and FHE key material.
pub struct KeyStore {
    keys_dir: PathBuf,
    pbkdf2_iterations: u32,
}

impl KeyStore {
    /// Open (creating if necessary) a key store rooted at `keys_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::IoError`] if the directory cannot be created.
    pub fn new(keys_dir: impl Into<PathBuf>) -> Result<Self, CryptoError> {
        Self::with_iterations(keys_dir, DEFAULT_PBKDF2_ITERATIONS)
    }

    /// As [`KeyStore::new`], with an explicit PBKDF2 iteration count
    /// (must be ≥ 100,000 per policy).
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::IoError`] if the directory cannot be created.
    pub fn with_iterations(
        keys_dir: impl Into<PathBuf>,
        pbkdf2_iterations: u32,
    ) -> Result<Self, CryptoError> {
        let keys_dir = keys_dir.into();
        fs::create_dir_all(&keys_dir)?;
        tighten_permissions(&keys_dir);
        Ok(Self {
            keys_dir,
            pbkdf2_iterations,
        })
    }

    fn path(&self, filename: &str) -> PathBuf {
        self.keys_dir.join(filename)
    }

    fn save_file(&self, data: &[u8], filename: &str) -> Result<(), CryptoError> {
        let path = self.path(filename);
        fs::write(&path, data)?;
        tighten_permissions(&path);
        Ok(())
    }

    fn load_file(&self, filename: &str) -> Result<Vec<u8>, CryptoError> {
        Ok(fs::read(self.path(filename))?)
    }

    /// Wrap `key` under `password` and write it to `name` in the key
    /// directory.
    ///
    /// # Errors
    ///
    /// See [`wrap_sym_key`].
    pub fn save_sym_key(&self, name: &str, key: &[u8], password: &str) -> Result<(), CryptoError> {
        let blob = wrap_sym_key_with_iterations(key, password, self.pbkdf2_iterations)?;
        self.save_file(&blob, name)
    }

    /// Load and unwrap the symmetric key stored at `name`.
    ///
    /// # Errors
    ///
    /// See [`unwrap_sym_key`].
    pub fn load_sym_key(&self, name: &str, password: &str) -> Result<SecretBuffer, CryptoError> {
        let blob = self.load_file(name)?;
        unwrap_sym_key_with_iterations(&blob, password, self.pbkdf2_iterations)
    }

    /// Persist an FHE key bundle. Public, relinearization, and Galois key
    /// bytes are stored zstd-compressed and unencrypted (they carry no
    /// secret material). Secret key bytes are compressed, then — if
    /// `password` is supplied — wrapped under a fresh random 256-bit
    /// `K_sec`, which is itself password-wrapped and stored alongside as
    /// `<secret_key_file>_aes.key`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::IoError`] on file I/O failure.
    #[allow(clippy::too_many_arguments)]
    pub fn save_fhe(
        &self,
        public: &[u8],
        secret: Option<&[u8]>,
        relin: Option<&[u8]>,
        galois: Option<&[u8]>,
        names: &KeyFileNames,
        password: Option<&str>,
    ) -> Result<(), CryptoError> {
        self.save_file(&codec::compress(public, 9)?, &names.public_key_file)?;
        if let Some(relin) = relin {
            self.save_file(&codec::compress(relin, 9)?, &names.relin_key_file)?;
        }
        if let Some(galois) = galois {
            self.save_file(&codec::compress(galois, 9)?, &names.galois_key_file)?;
        }

        if let Some(secret) = secret {
            let compressed = codec::compress(secret, 9)?;
            if let Some(password) = password {
                let k_sec = SecretBytes::<32>::random()?;
                let sealed = crate::symmetric::encrypt(&compressed, k_sec.expose(), b"")?;
                self.save_file(&sealed, &names.secret_key_file)?;
                self.save_sym_key(
                    &aes_companion_file(&names.secret_key_file),
                    k_sec.expose(),
                    password,
                )?;
            } else {
                self.save_file(&compressed, &names.secret_key_file)?;
            }
        }
        Ok(())
    }

    /// Load an FHE key bundle saved by [`KeyStore::save_fhe`].
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::IoError`] if a required file is missing, or
    /// propagates unwrap errors if the secret key is password-wrapped.
    pub fn load_fhe(
        &self,
        names: &KeyFileNames,
        password: Option<&str>,
    ) -> Result<FheKeyFiles, CryptoError> {
        let public = codec::decompress(&self.load_file(&names.public_key_file)?)?;

        let relin = self
            .load_file(&names.relin_key_file)
            .ok()
            .map(|b| codec::decompress(&b))
            .transpose()?;
        let galois = self
            .load_file(&names.galois_key_file)
            .ok()
            .map(|b| codec::decompress(&b))
            .transpose()?;

        let secret = match self.load_file(&names.secret_key_file) {
            Ok(raw) => {
                let companion = aes_companion_file(&names.secret_key_file);
                if self.path(&companion).exists() {
                    let password = password.ok_or_else(|| {
                        CryptoError::Malformed("password required to decrypt FHE secret key".into())
                    })?;
                    let k_sec = self.load_sym_key(&companion, password)?;
                    let decompressed_body = crate::symmetric::decrypt(&raw, k_sec.expose(), b"")?;
                    Some(codec::decompress(decompressed_body.expose())?)
                } else {
                    Some(codec::decompress(&raw)?)
                }
            }
            Err(_) => None,
        };

        Ok(FheKeyFiles {
            public,
            secret,
            relin,
            galois,
        })
    }

    /// Copy the existing artifacts named in `old_names` to
    /// `<file>.<timestamp>.bak`, then save `new_*` under `new_names`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::IoError`] on file I/O failure.
    #[allow(clippy::too_many_arguments)]
    pub fn rotate_fhe(
        &self,
        old_names: &KeyFileNames,
        new_public: &[u8],
        new_secret: Option<&[u8]>,
        new_relin: Option<&[u8]>,
        new_galois: Option<&[u8]>,
        new_names: &KeyFileNames,
        password: Option<&str>,
        timestamp: &str,
    ) -> Result<(), CryptoError> {
        for filename in [
            &old_names.public_key_file,
            &old_names.secret_key_file,
            &old_names.relin_key_file,
            &old_names.galois_key_file,
        ] {
            let src = self.path(filename);
            if src.is_file() {
                let backup = self.path(&format!("{filename}.{timestamp}.bak"));
                fs::copy(&src, &backup)?;
            }
        }
        let companion = aes_companion_file(&old_names.secret_key_file);
        let companion_path = self.path(&companion);
        if companion_path.is_file() {
            let backup = self.path(&format!("{companion}.{timestamp}.bak"));
            fs::copy(&companion_path, &backup)?;
        }

        self.save_fhe(
            new_public,
            new_secret,
            new_relin,
            new_galois,
            new_names,
            password,
        )
    }

    /// Create a gzipped tar archive of every regular file in the key
    /// directory under `backup_dir` (default: `<keys_dir>/../backups`),
    /// named `keys_backup_<timestamp>.tar.gz`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::IoError`] on archive or file I/O failure.
    pub fn backup(&self, backup_dir: Option<&Path>, timestamp: &str) -> Result<PathBuf, CryptoError> {
        let backup_dir = match backup_dir {
            Some(dir) => dir.to_path_buf(),
            None => self
                .keys_dir
                .parent()
                .map(|p| p.join("backups"))
                .unwrap_or_else(|| PathBuf::from("backups")),
        };
        fs::create_dir_all(&backup_dir)?;
        let archive_path = backup_dir.join(format!("keys_backup_{timestamp}.tar.gz"));

        let file = fs::File::create(&archive_path)?;
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);

        for entry in fs::read_dir(&self.keys_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_file() {
                let name = entry.file_name();
                builder.append_path_with_name(&path, &name)?;
            }
        }
        builder
            .into_inner()
            .map_err(|e| CryptoError::IoError(e.to_string()))?
            .finish()
            .map_err(|e| CryptoError::IoError(e.to_string()))?;

        tighten_permissions(&archive_path);
        Ok(archive_path)
    }

    /// Restore keys from a gzipped tar archive produced by
    /// [`KeyStore::backup`]. Archive member paths are sanitized (rejecting
    /// `..` components and absolute paths) before extraction. If `password`
    /// is supplied, the first `*_aes.key` companion found in the archive is
    /// probed with it before any file is copied into the key directory.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::IoError`] on archive or file I/O failure, or
    /// [`CryptoError::WrongPassword`]/[`CryptoError::Tampered`] if the
    /// password probe fails.
    pub fn restore(&self, archive: &Path, password: Option<&str>) -> Result<(), CryptoError> {
        let temp_dir = tempfile_dir(&self.keys_dir)?;

        let extract = || -> Result<(), CryptoError> {
            let file = fs::File::open(archive)?;
            let decoder = flate2::read::GzDecoder::new(file);
            let mut archive = tar::Archive::new(decoder);
            for entry in archive.entries()? {
                let mut entry = entry?;
                let path = entry.path()?.into_owned();
                if path.is_absolute() || path.components().any(|c| c == std::path::Component::ParentDir) {
                    return Err(CryptoError::Malformed(format!(
                        "unsafe archive member path: {}",
                        path.display()
                    )));
                }
                entry.unpack(temp_dir.join(&path))?;
            }

            if let Some(password) = password {
                if let Some(companion) = find_companion_key(&temp_dir)? {
                    let blob = fs::read(&companion)?;
                    unwrap_sym_key_with_iterations(&blob, password, self.pbkdf2_iterations)
                        .map(|_| ())?;
                }
            }

            for entry in fs::read_dir(&temp_dir)? {
                let entry = entry?;
                let src = entry.path();
                if src.is_file() {
                    let dst = self.path(&entry.file_name().to_string_lossy());
                    fs::copy(&src, &dst)?;
                    tighten_permissions(&dst);
                }
            }
            Ok(())
        };

        let result = extract();
        let _ = fs::remove_dir_all(&temp_dir);
        result
    }
}

fn find_companion_key(dir: &Path) -> Result<Option<PathBuf>, CryptoError> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(".key") && name.contains("_aes") {
            return Ok(Some(entry.path()));
        }
    }
    Ok(None)
}

fn tempfile_dir(base: &Path) -> Result<PathBuf, CryptoError> {
    let mut bytes = [0u8; 8];
    OsRng.fill_bytes(&mut bytes);
    let suffix: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    let dir = base
        .parent()
        .unwrap_or(base)
        .join(format!(".fhedb-restore-{suffix}"));
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

#[cfg(unix)]
fn tighten_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(metadata) = fs::metadata(path) {
        let mode = if metadata.is_dir() { 0o700 } else { 0o600 };
        let _ = fs::set_permissions(path, fs::Permissions::from_mode(mode));
    }
}

#[cfg(not(unix))]
fn tighten_permissions(_path: &Path) {}
