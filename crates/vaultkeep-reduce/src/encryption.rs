//! Passphrase-based authenticated encryption.
//!
//! Key schedule: PBKDF2-HMAC-SHA256 over the passphrase and a random 32-byte
//! salt, expanded with HKDF-SHA256 into a 256-bit AEAD key. Every blob carries
//! its salt, iteration count, nonce and tag, so the passphrase alone is enough
//! to open it. The blob header is bound to the ciphertext as associated data.

use crate::error::ReduceError;
use crate::metrics::ReductionMetrics;
use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit};
use chacha20poly1305::ChaCha20Poly1305;
use hkdf::Hkdf;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// PBKDF2 iteration count for newly derived keys
pub const PBKDF2_ITERATIONS: u32 = 100_000;
/// Salt length in bytes
pub const SALT_LEN: usize = 32;
/// AEAD nonce length in bytes
pub const NONCE_LEN: usize = 12;
/// AEAD tag length in bytes
pub const TAG_LEN: usize = 16;

const BLOB_MAGIC: [u8; 4] = *b"VKEB";
const BLOB_VERSION: u8 = 1;
const HEADER_LEN: usize = 4 + 1 + 1 + 4 + SALT_LEN;
const MAX_ITERATIONS: u32 = 10_000_000;
const KEY_INFO: &[u8] = b"vaultkeep-blob-key";

/// 256-bit (32-byte) encryption key
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey(pub [u8; 32]);

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EncryptionKey([REDACTED])")
    }
}

/// 96-bit (12-byte) nonce for AEAD ciphers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Nonce(pub [u8; NONCE_LEN]);

/// AEAD cipher selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionAlgorithm {
    /// AES-256-GCM, hardware accelerated on x86 with AES-NI
    #[default]
    AesGcm256,
    /// ChaCha20-Poly1305, constant-time and fast on non-AES hardware
    ChaCha20Poly1305,
}

impl EncryptionAlgorithm {
    fn code(self) -> u8 {
        match self {
            EncryptionAlgorithm::AesGcm256 => 1,
            EncryptionAlgorithm::ChaCha20Poly1305 => 2,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(EncryptionAlgorithm::AesGcm256),
            2 => Some(EncryptionAlgorithm::ChaCha20Poly1305),
            _ => None,
        }
    }
}

/// Self-contained ciphertext envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedBlob {
    /// Cipher used
    pub algorithm: EncryptionAlgorithm,
    /// PBKDF2 iterations used to derive the key
    pub iterations: u32,
    /// KDF salt
    pub salt: [u8; SALT_LEN],
    /// AEAD nonce
    pub nonce: Nonce,
    /// Ciphertext without the tag
    pub ciphertext: Vec<u8>,
    /// AEAD authentication tag
    pub auth_tag: [u8; TAG_LEN],
}

impl EncryptedBlob {
    fn header(algorithm: EncryptionAlgorithm, iterations: u32, salt: &[u8; SALT_LEN]) -> [u8; HEADER_LEN] {
        let mut h = [0u8; HEADER_LEN];
        h[0..4].copy_from_slice(&BLOB_MAGIC);
        h[4] = BLOB_VERSION;
        h[5] = algorithm.code();
        h[6..10].copy_from_slice(&iterations.to_le_bytes());
        h[10..].copy_from_slice(salt);
        h
    }

    /// Serialize: header (magic, version, algorithm, iterations, salt), nonce, tag, ciphertext.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out =
            Vec::with_capacity(HEADER_LEN + NONCE_LEN + TAG_LEN + self.ciphertext.len());
        out.extend_from_slice(&Self::header(self.algorithm, self.iterations, &self.salt));
        out.extend_from_slice(&self.nonce.0);
        out.extend_from_slice(&self.auth_tag);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Parse bytes produced by [`EncryptedBlob::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ReduceError> {
        let min = HEADER_LEN + NONCE_LEN + TAG_LEN;
        if bytes.len() < min {
            return Err(ReduceError::DecryptionFailed(format!(
                "blob truncated: {} bytes, need at least {}",
                bytes.len(),
                min
            )));
        }
        if bytes[0..4] != BLOB_MAGIC {
            return Err(ReduceError::DecryptionFailed("bad blob magic".to_string()));
        }
        if bytes[4] != BLOB_VERSION {
            return Err(ReduceError::DecryptionFailed(format!(
                "unsupported blob version {}",
                bytes[4]
            )));
        }
        let algorithm = EncryptionAlgorithm::from_code(bytes[5]).ok_or_else(|| {
            ReduceError::DecryptionFailed(format!("unknown cipher code {}", bytes[5]))
        })?;
        let mut iter_bytes = [0u8; 4];
        iter_bytes.copy_from_slice(&bytes[6..10]);
        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&bytes[10..HEADER_LEN]);
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&bytes[HEADER_LEN..HEADER_LEN + NONCE_LEN]);
        let mut auth_tag = [0u8; TAG_LEN];
        auth_tag.copy_from_slice(&bytes[HEADER_LEN + NONCE_LEN..min]);
        Ok(Self {
            algorithm,
            iterations: u32::from_le_bytes(iter_bytes),
            salt,
            nonce: Nonce(nonce),
            ciphertext: bytes[min..].to_vec(),
            auth_tag,
        })
    }

    /// Size of [`EncryptedBlob::to_bytes`] output
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + NONCE_LEN + TAG_LEN + self.ciphertext.len()
    }
}

/// Generate a cryptographically random 12-byte nonce
pub fn random_nonce() -> Nonce {
    use rand::RngCore;
    let mut bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut bytes);
    Nonce(bytes)
}

/// Generate a random KDF salt
pub fn random_salt() -> [u8; SALT_LEN] {
    use rand::RngCore;
    let mut bytes = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Derive the AEAD key for a passphrase and salt.
pub fn derive_key_from_passphrase(
    passphrase: &[u8],
    salt: &[u8; SALT_LEN],
    iterations: u32,
) -> Result<EncryptionKey, ReduceError> {
    let mut master = Zeroizing::new([0u8; 32]);
    pbkdf2::pbkdf2_hmac::<Sha256>(passphrase, salt, iterations, &mut master[..]);
    let hk = Hkdf::<Sha256>::new(Some(salt), &master[..]);
    let mut okm = [0u8; 32];
    hk.expand(KEY_INFO, &mut okm)
        .map_err(|e| ReduceError::EncryptionFailed(format!("HKDF expand: {}", e)))?;
    Ok(EncryptionKey(okm))
}

/// Encrypt under an already derived key. `salt` and `iterations` are recorded
/// in the blob and must be the ones the key was derived with.
pub fn encrypt_with_key(
    plaintext: &[u8],
    key: &EncryptionKey,
    algorithm: EncryptionAlgorithm,
    salt: [u8; SALT_LEN],
    iterations: u32,
) -> Result<EncryptedBlob, ReduceError> {
    let nonce = random_nonce();
    let aad = EncryptedBlob::header(algorithm, iterations, &salt);
    let payload = Payload {
        msg: plaintext,
        aad: &aad,
    };
    let mut sealed = match algorithm {
        EncryptionAlgorithm::AesGcm256 => {
            let cipher = Aes256Gcm::new_from_slice(&key.0)
                .map_err(|e| ReduceError::EncryptionFailed(e.to_string()))?;
            cipher
                .encrypt(aes_gcm::Nonce::from_slice(&nonce.0), payload)
                .map_err(|e| ReduceError::EncryptionFailed(e.to_string()))?
        }
        EncryptionAlgorithm::ChaCha20Poly1305 => {
            use chacha20poly1305::aead::Aead as _;
            use chacha20poly1305::KeyInit as _;
            let cipher = ChaCha20Poly1305::new_from_slice(&key.0)
                .map_err(|e| ReduceError::EncryptionFailed(e.to_string()))?;
            cipher
                .encrypt(chacha20poly1305::Nonce::from_slice(&nonce.0), payload)
                .map_err(|e| ReduceError::EncryptionFailed(e.to_string()))?
        }
    };
    // aead appends the tag to the ciphertext
    let tag_start = sealed.len() - TAG_LEN;
    let mut auth_tag = [0u8; TAG_LEN];
    auth_tag.copy_from_slice(&sealed[tag_start..]);
    sealed.truncate(tag_start);
    Ok(EncryptedBlob {
        algorithm,
        iterations,
        salt,
        nonce,
        ciphertext: sealed,
        auth_tag,
    })
}

/// Decrypt under an already derived key. Fails with `DecryptionFailed` if
/// the tag does not verify.
pub fn decrypt_with_key(blob: &EncryptedBlob, key: &EncryptionKey) -> Result<Vec<u8>, ReduceError> {
    let aad = EncryptedBlob::header(blob.algorithm, blob.iterations, &blob.salt);
    let mut sealed = Vec::with_capacity(blob.ciphertext.len() + TAG_LEN);
    sealed.extend_from_slice(&blob.ciphertext);
    sealed.extend_from_slice(&blob.auth_tag);
    let payload = Payload {
        msg: &sealed,
        aad: &aad,
    };
    let auth_failed =
        |_| ReduceError::DecryptionFailed("authentication tag mismatch".to_string());
    match blob.algorithm {
        EncryptionAlgorithm::AesGcm256 => {
            let cipher = Aes256Gcm::new_from_slice(&key.0)
                .map_err(|e| ReduceError::EncryptionFailed(e.to_string()))?;
            cipher
                .decrypt(aes_gcm::Nonce::from_slice(&blob.nonce.0), payload)
                .map_err(auth_failed)
        }
        EncryptionAlgorithm::ChaCha20Poly1305 => {
            use chacha20poly1305::aead::Aead as _;
            use chacha20poly1305::KeyInit as _;
            let cipher = ChaCha20Poly1305::new_from_slice(&key.0)
                .map_err(|e| ReduceError::EncryptionFailed(e.to_string()))?;
            cipher
                .decrypt(chacha20poly1305::Nonce::from_slice(&blob.nonce.0), payload)
                .map_err(auth_failed)
        }
    }
}

fn check_iterations(iterations: u32) -> Result<(), ReduceError> {
    if iterations == 0 || iterations > MAX_ITERATIONS {
        return Err(ReduceError::DecryptionFailed(format!(
            "unsupported KDF iteration count {}",
            iterations
        )));
    }
    Ok(())
}

/// Decrypt a blob with nothing but the passphrase.
pub fn decrypt_data(blob: &EncryptedBlob, passphrase: &[u8]) -> Result<Vec<u8>, ReduceError> {
    check_iterations(blob.iterations)?;
    let key = derive_key_from_passphrase(passphrase, &blob.salt, blob.iterations)?;
    decrypt_with_key(blob, &key)
}

/// Passphrase encryptor for one backup session.
///
/// The KDF runs once per session for encryption (one salt shared by every blob
/// this encryptor produces, each with a fresh nonce). Keys for salts seen while
/// decrypting are cached.
pub struct Encryptor {
    passphrase: Zeroizing<Vec<u8>>,
    algorithm: EncryptionAlgorithm,
    session: Mutex<Option<[u8; SALT_LEN]>>,
    keys: Mutex<HashMap<[u8; SALT_LEN], EncryptionKey>>,
    metrics: Option<Arc<ReductionMetrics>>,
}

impl std::fmt::Debug for Encryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Encryptor")
            .field("passphrase", &"[REDACTED]")
            .field("algorithm", &self.algorithm)
            .finish()
    }
}

impl Encryptor {
    /// Create an encryptor. No key is derived until first use.
    pub fn new(passphrase: impl AsRef<[u8]>, algorithm: EncryptionAlgorithm) -> Self {
        Self {
            passphrase: Zeroizing::new(passphrase.as_ref().to_vec()),
            algorithm,
            session: Mutex::new(None),
            keys: Mutex::new(HashMap::new()),
            metrics: None,
        }
    }

    /// Record encrypt/decrypt counts into shared metrics
    pub fn with_metrics(mut self, metrics: Arc<ReductionMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Cipher used for new blobs
    pub fn algorithm(&self) -> EncryptionAlgorithm {
        self.algorithm
    }

    fn key_for(&self, salt: &[u8; SALT_LEN], iterations: u32) -> Result<EncryptionKey, ReduceError> {
        let mut keys = self.keys.lock();
        if let Some(k) = keys.get(salt) {
            return Ok(k.clone());
        }
        let key = derive_key_from_passphrase(&self.passphrase, salt, iterations)?;
        debug!(iterations, "derived key for salt");
        keys.insert(*salt, key.clone());
        Ok(key)
    }

    fn session_salt(&self) -> [u8; SALT_LEN] {
        *self.session.lock().get_or_insert_with(random_salt)
    }

    /// Encrypt plaintext into a self-contained blob.
    pub fn encrypt_data(&self, plaintext: &[u8]) -> Result<EncryptedBlob, ReduceError> {
        let salt = self.session_salt();
        let key = self.key_for(&salt, PBKDF2_ITERATIONS)?;
        let blob = encrypt_with_key(plaintext, &key, self.algorithm, salt, PBKDF2_ITERATIONS)?;
        if let Some(m) = &self.metrics {
            m.record_encrypt();
        }
        Ok(blob)
    }

    /// Decrypt a blob produced under this encryptor's passphrase.
    pub fn decrypt(&self, blob: &EncryptedBlob) -> Result<Vec<u8>, ReduceError> {
        check_iterations(blob.iterations)?;
        let key = self.key_for(&blob.salt, blob.iterations)?;
        let result = decrypt_with_key(blob, &key);
        if let Some(m) = &self.metrics {
            m.record_decrypt(result.is_ok());
        }
        result
    }
}
