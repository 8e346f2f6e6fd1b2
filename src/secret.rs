//! Cluster secret: persisted once per data directory, loaded into a
//! [`SealingService`] on every start.

use std::fmt;
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use ring::aead::{Aad, CHACHA20_POLY1305, LessSafeKey, NONCE_LEN, Nonce, UnboundKey};
use ring::rand::{SecureRandom, SystemRandom};
use tracing::info;

use crate::error::{BootstrapError, Result, ResultExt};
use crate::fs_util;

pub const SECRET_FILE_NAME: &str = "teleport.secret";
pub const KEY_LEN: usize = 32;
const SECURE_ID_LEN: usize = 16;

/// Symmetric sealing service backed by ChaCha20-Poly1305.
#[derive(Clone, PartialEq, Eq)]
pub struct SealingService {
    key: [u8; KEY_LEN],
}

impl fmt::Debug for SealingService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SealingService")
            .field("key", &"<redacted>")
            .finish()
    }
}

impl SealingService {
    /// Builds a service from raw key bytes.
    ///
    /// # Errors
    /// Returns `Crypto` if the key is not exactly [`KEY_LEN`] bytes.
    pub fn new(key_bytes: &[u8]) -> Result<Self> {
        let key: [u8; KEY_LEN] = key_bytes.try_into().map_err(|_| {
            BootstrapError::Crypto(format!(
                "secret key must be {KEY_LEN} bytes, got {}",
                key_bytes.len()
            ))
        })?;
        Ok(Self { key })
    }

    /// Generates fresh random key bytes.
    ///
    /// # Errors
    /// Returns `Crypto` if the system RNG fails.
    pub fn generate_key() -> Result<[u8; KEY_LEN]> {
        let mut key = [0u8; KEY_LEN];
        SystemRandom::new()
            .fill(&mut key)
            .map_err(|_| BootstrapError::Crypto("failed to generate secret key".to_string()))?;
        Ok(key)
    }

    #[must_use]
    pub fn encode_key(key: &[u8]) -> String {
        URL_SAFE_NO_PAD.encode(key)
    }

    /// Decodes a key produced by [`SealingService::encode_key`].
    ///
    /// # Errors
    /// Returns `Crypto` if the string is not valid base64 or has the wrong length.
    pub fn decode_key(encoded: &str) -> Result<Vec<u8>> {
        let key = URL_SAFE_NO_PAD
            .decode(encoded.trim())
            .map_err(|e| BootstrapError::Crypto(format!("invalid secret key encoding: {e}")))?;
        if key.len() != KEY_LEN {
            return Err(BootstrapError::Crypto(format!(
                "secret key must be {KEY_LEN} bytes, got {}",
                key.len()
            )));
        }
        Ok(key)
    }

    /// The key in its persisted string form.
    #[must_use]
    pub fn encoded_key(&self) -> String {
        Self::encode_key(&self.key)
    }

    fn aead_key(&self) -> Result<LessSafeKey> {
        let unbound = UnboundKey::new(&CHACHA20_POLY1305, &self.key)
            .map_err(|_| BootstrapError::Crypto("invalid sealing key".to_string()))?;
        Ok(LessSafeKey::new(unbound))
    }

    /// Encrypts and authenticates `plaintext`, returning `base64(nonce || ciphertext || tag)`.
    ///
    /// # Errors
    /// Returns `Crypto` if the RNG or the cipher fails.
    pub fn seal(&self, plaintext: &[u8]) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        SystemRandom::new()
            .fill(&mut nonce_bytes)
            .map_err(|_| BootstrapError::Crypto("failed to generate nonce".to_string()))?;

        let mut in_out = plaintext.to_vec();
        self.aead_key()?
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                &mut in_out,
            )
            .map_err(|_| BootstrapError::Crypto("failed to seal data".to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + in_out.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&in_out);
        Ok(URL_SAFE_NO_PAD.encode(sealed))
    }

    /// Reverses [`SealingService::seal`].
    ///
    /// # Errors
    /// Returns `Crypto` if the input is malformed or fails authentication.
    pub fn open(&self, sealed: &str) -> Result<Vec<u8>> {
        let mut bytes = URL_SAFE_NO_PAD
            .decode(sealed.trim())
            .map_err(|e| BootstrapError::Crypto(format!("invalid sealed data encoding: {e}")))?;
        if bytes.len() < NONCE_LEN + CHACHA20_POLY1305.tag_len() {
            return Err(BootstrapError::Crypto("sealed data is too short".to_string()));
        }
        let mut in_out = bytes.split_off(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(&bytes)
            .map_err(|_| BootstrapError::Crypto("invalid nonce".to_string()))?;
        let plaintext = self
            .aead_key()?
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| BootstrapError::Crypto("failed to open sealed data".to_string()))?;
        Ok(plaintext.to_vec())
    }

    /// Mints a random id and its sealed encoding.
    ///
    /// # Errors
    /// Returns `Crypto` if the RNG or the cipher fails.
    pub fn new_secure_id(&self) -> Result<(String, String)> {
        let mut raw = [0u8; SECURE_ID_LEN];
        SystemRandom::new()
            .fill(&mut raw)
            .map_err(|_| BootstrapError::Crypto("failed to generate id".to_string()))?;
        let id = hex::encode(raw);
        let encoded = self.seal(id.as_bytes())?;
        Ok((id, encoded))
    }

    /// Recovers the id sealed inside an encoded secure id.
    ///
    /// # Errors
    /// Returns `Crypto` if the token was not sealed with this key or is not a valid id.
    pub fn decode_secure_id(&self, encoded: &str) -> Result<String> {
        let plaintext = self.open(encoded)?;
        let id = String::from_utf8(plaintext)
            .map_err(|_| BootstrapError::Crypto("secure id is not UTF-8".to_string()))?;
        if id.len() != SECURE_ID_LEN * 2 || !id.chars().all(|ch| ch.is_ascii_hexdigit()) {
            return Err(BootstrapError::Crypto("malformed secure id".to_string()));
        }
        Ok(id)
    }
}

#[must_use]
pub fn secret_key_path(data_dir: &Path) -> PathBuf {
    data_dir.join(SECRET_FILE_NAME)
}

/// Loads the cluster secret, creating it first if this data directory has none.
///
/// An empty `provided_key` generates a fresh key; otherwise the encoded key is
/// adopted. An existing secret file is never overwritten.
///
/// # Errors
/// Returns an error if the provided key is malformed, or the secret cannot be
/// written or read back.
pub async fn init_secret(data_dir: &Path, provided_key: &str) -> Result<SealingService> {
    let key_path = secret_key_path(data_dir);
    if !fs_util::path_exists(&key_path).await? {
        info!("Secret not found. Writing to {}", key_path.display());
        let encoded = if provided_key.is_empty() {
            info!("Secret key is not supplied, generating");
            SealingService::encode_key(&SealingService::generate_key()?)
        } else {
            info!("Using secret key provided with configuration");
            SealingService::decode_key(provided_key).context("provided secret key")?;
            provided_key.trim().to_string()
        };
        fs_util::write_private_file(&key_path, encoded.as_bytes()).await?;
    }
    info!("Reading secret from {}", key_path.display());
    read_secret(data_dir).await
}

/// Loads the cluster secret without creating it.
///
/// # Errors
/// Returns `NotFound` if no secret has been written, or `Crypto` if it is malformed.
pub async fn read_secret(data_dir: &Path) -> Result<SealingService> {
    let key_path = secret_key_path(data_dir);
    let bytes = fs_util::read_path(&key_path).await?;
    let encoded = String::from_utf8(bytes)
        .map_err(|_| BootstrapError::Crypto("secret file is not UTF-8".to_string()))?;
    let key = SealingService::decode_key(&encoded)
        .with_context(|| format!("secret file {}", key_path.display()))?;
    SealingService::new(&key)
}
