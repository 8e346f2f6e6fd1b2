//! This node's host key pair and CA-signed host certificate.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rcgen::KeyPair;
use ring::rand::SystemRandom;
use ring::signature::{ECDSA_P256_SHA256_ASN1_SIGNING, EcdsaKeyPair, KeyPair as _};
use tracing::info;
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::auth_server::AuthServer;
use crate::error::{BootstrapError, Result, ResultExt};
use crate::fs_util;

/// Signs with the node key; always matches the key and certificate on disk.
pub struct NodeSigner {
    private_key: Vec<u8>,
    certificate: Vec<u8>,
    principal: String,
    key_pair: EcdsaKeyPair,
}

impl fmt::Debug for NodeSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeSigner")
            .field("principal", &self.principal)
            .field("private_key", &"<redacted>")
            .finish_non_exhaustive()
    }
}

impl NodeSigner {
    /// Builds a signer from PEM key and certificate bytes.
    ///
    /// # Errors
    /// Returns `Crypto` if either input cannot be parsed or the certificate
    /// was not issued for this key.
    pub fn new(private_key: &[u8], certificate: &[u8]) -> Result<Self> {
        let key_pem = std::str::from_utf8(private_key)
            .map_err(|_| BootstrapError::Crypto("private key is not UTF-8".to_string()))?;
        let pkcs8 = KeyPair::from_pem(key_pem)?.serialize_der();
        let key_pair =
            EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, &pkcs8, &SystemRandom::new())
                .map_err(|e| BootstrapError::Crypto(format!("unsupported private key: {e}")))?;

        let (_, pem) = x509_parser::pem::parse_x509_pem(certificate)
            .map_err(|e| BootstrapError::Crypto(format!("failed to parse certificate PEM: {e}")))?;
        let (_, cert) = X509Certificate::from_der(&pem.contents)
            .map_err(|e| BootstrapError::Crypto(format!("failed to parse certificate: {e}")))?;

        let cert_key: &[u8] = &cert.public_key().subject_public_key.data;
        if cert_key != key_pair.public_key().as_ref() {
            return Err(BootstrapError::Crypto(
                "certificate does not match private key".to_string(),
            ));
        }
        let principal = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or_default()
            .to_string();

        Ok(Self {
            private_key: private_key.to_vec(),
            certificate: certificate.to_vec(),
            principal,
            key_pair,
        })
    }

    #[must_use]
    pub fn private_key_pem(&self) -> &[u8] {
        &self.private_key
    }

    #[must_use]
    pub fn certificate_pem(&self) -> &[u8] {
        &self.certificate
    }

    /// Common name of the host certificate.
    #[must_use]
    pub fn principal(&self) -> &str {
        &self.principal
    }

    /// Uncompressed SEC1 public key point.
    #[must_use]
    pub fn public_key(&self) -> &[u8] {
        self.key_pair.public_key().as_ref()
    }

    /// ASN.1 DER ECDSA-SHA256 signature over `message`.
    ///
    /// # Errors
    /// Returns `Crypto` if signing fails.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        let signature = self
            .key_pair
            .sign(&SystemRandom::new(), message)
            .map_err(|_| BootstrapError::Crypto("failed to sign message".to_string()))?;
        Ok(signature.as_ref().to_vec())
    }
}

/// Paths of the key and certificate files for `fqdn`.
#[must_use]
pub fn keys_path(fqdn: &str, data_dir: &Path) -> (PathBuf, PathBuf) {
    (
        data_dir.join(format!("{fqdn}.key")),
        data_dir.join(format!("{fqdn}.cert")),
    )
}

/// Checks that `name` is usable as a single file name inside the data directory.
///
/// # Errors
/// Returns `Configuration` for an empty name, `.`/`..`, or a name containing a
/// path separator or NUL.
pub fn validate_node_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(BootstrapError::Configuration(
            "fqdn can not be empty".to_string(),
        ));
    }
    if matches!(name, "." | "..") || name.contains(['/', '\\', '\0']) {
        return Err(BootstrapError::Configuration(format!(
            "fqdn {name:?} is not a valid file name"
        )));
    }
    Ok(())
}

/// Ensures this node has a key and a host certificate, then loads them.
///
/// Missing files are regenerated together: a fresh key pair and a
/// non-expiring certificate for `fqdn` signed by the host CA.
///
/// # Errors
/// Returns `Configuration` for an empty or path-like `fqdn`; otherwise I/O or
/// signing errors.
pub async fn init_keys(auth: &AuthServer, fqdn: &str, data_dir: &Path) -> Result<NodeSigner> {
    validate_node_name(fqdn)?;

    if !have_keys(fqdn, data_dir).await? {
        let (key, public_key) = auth.generate_key_pair("").context("generate node key")?;
        let cert = auth
            .generate_host_certificate(&public_key, fqdn, fqdn, Duration::ZERO)
            .await
            .context("generate host certificate")?;
        write_keys(fqdn, data_dir, &key, &cert).await?;
    }
    read_keys(fqdn, data_dir).await
}

async fn write_keys(fqdn: &str, data_dir: &Path, key: &[u8], cert: &[u8]) -> Result<()> {
    let (key_path, cert_path) = keys_path(fqdn, data_dir);
    info!(
        "Writing key to {}, cert to {}",
        key_path.display(),
        cert_path.display()
    );
    fs_util::write_private_file(&key_path, key).await?;
    fs_util::write_private_file(&cert_path, cert).await
}

/// Loads the node signer without generating anything.
///
/// # Errors
/// Returns `NotFound` if either file is missing, or `Crypto` if they do not parse.
pub async fn read_keys(fqdn: &str, data_dir: &Path) -> Result<NodeSigner> {
    validate_node_name(fqdn)?;
    let (key_path, cert_path) = keys_path(fqdn, data_dir);
    info!(
        "Reading key from {}, cert from {}",
        key_path.display(),
        cert_path.display()
    );
    let key = fs_util::read_path(&key_path).await?;
    let cert = fs_util::read_path(&cert_path).await?;
    NodeSigner::new(&key, &cert)
}

/// Reports whether both the key and the certificate for `fqdn` exist.
///
/// # Errors
/// Returns `Io` if either path cannot be probed.
pub async fn have_keys(fqdn: &str, data_dir: &Path) -> Result<bool> {
    let (key_path, cert_path) = keys_path(fqdn, data_dir);
    Ok(fs_util::path_exists(&key_path).await? && fs_util::path_exists(&cert_path).await?)
}
