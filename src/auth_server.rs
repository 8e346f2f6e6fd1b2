use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::authority::{Authority, CaKind, CertAuthority};
use crate::error::{BootstrapError, Result, ResultExt};
use crate::secret::SealingService;
use crate::services::{Backend, RemoteCert};

/// The cluster authority: a backend, a key generator and the cluster secret.
#[derive(Clone)]
pub struct AuthServer {
    backend: Arc<dyn Backend>,
    authority: Arc<dyn Authority>,
    sealer: SealingService,
    domain: String,
}

impl std::fmt::Debug for AuthServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthServer")
            .field("domain", &self.domain)
            .finish_non_exhaustive()
    }
}

impl AuthServer {
    pub fn new(
        backend: Arc<dyn Backend>,
        authority: Arc<dyn Authority>,
        sealer: SealingService,
        domain: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            authority,
            sealer,
            domain: domain.into(),
        }
    }

    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }

    #[must_use]
    pub fn sealer(&self) -> &SealingService {
        &self.sealer
    }

    /// Public certificate of the CA of `kind`.
    ///
    /// # Errors
    /// Returns `NotFound` if the CA does not exist yet.
    pub async fn get_ca_public(&self, kind: CaKind) -> Result<Vec<u8>> {
        Ok(self.backend.get_ca(kind).await?.certificate)
    }

    /// # Errors
    /// Returns `NotFound` if the host CA does not exist yet.
    pub async fn get_host_ca_public(&self) -> Result<Vec<u8>> {
        self.get_ca_public(CaKind::Host).await
    }

    /// # Errors
    /// Returns `NotFound` if the user CA does not exist yet.
    pub async fn get_user_ca_public(&self) -> Result<Vec<u8>> {
        self.get_ca_public(CaKind::User).await
    }

    /// Stores externally supplied CA material as the CA of `kind`.
    ///
    /// # Errors
    /// Returns `Configuration` if `ca` is of another kind, or the backend error.
    pub async fn upsert_ca(&self, kind: CaKind, ca: CertAuthority) -> Result<()> {
        if ca.kind != kind {
            return Err(BootstrapError::Configuration(format!(
                "{} CA material supplied where a {kind} CA is expected",
                ca.kind
            )));
        }
        self.backend.upsert_ca(ca).await
    }

    /// # Errors
    /// See [`AuthServer::upsert_ca`].
    pub async fn upsert_host_ca(&self, ca: CertAuthority) -> Result<()> {
        self.upsert_ca(CaKind::Host, ca).await
    }

    /// # Errors
    /// See [`AuthServer::upsert_ca`].
    pub async fn upsert_user_ca(&self, ca: CertAuthority) -> Result<()> {
        self.upsert_ca(CaKind::User, ca).await
    }

    /// Generates a new CA of `kind` and stores it, replacing any existing one.
    /// An empty `passphrase` produces an unencrypted key.
    ///
    /// # Errors
    /// Returns the generation or backend error.
    pub async fn reset_ca(&self, kind: CaKind, passphrase: &str) -> Result<()> {
        let ca = self
            .authority
            .generate_ca(kind, &self.domain, passphrase)
            .with_context(|| format!("generate {kind} CA"))?;
        info!("Generated {kind} CA {}", ca.fingerprint()?);
        self.backend.upsert_ca(ca).await
    }

    /// # Errors
    /// See [`AuthServer::reset_ca`].
    pub async fn reset_host_ca(&self, passphrase: &str) -> Result<()> {
        self.reset_ca(CaKind::Host, passphrase).await
    }

    /// # Errors
    /// See [`AuthServer::reset_ca`].
    pub async fn reset_user_ca(&self, passphrase: &str) -> Result<()> {
        self.reset_ca(CaKind::User, passphrase).await
    }

    /// # Errors
    /// Returns the generation error.
    pub fn generate_key_pair(&self, passphrase: &str) -> Result<(Vec<u8>, Vec<u8>)> {
        self.authority.generate_key_pair(passphrase)
    }

    /// Signs a host certificate with the host CA.
    ///
    /// # Errors
    /// Returns `NotFound` if there is no host CA, or the signing error.
    pub async fn generate_host_certificate(
        &self,
        public_key: &[u8],
        principal: &str,
        issuer: &str,
        ttl: Duration,
    ) -> Result<Vec<u8>> {
        let ca = self.backend.get_ca(CaKind::Host).await?;
        self.authority
            .generate_host_certificate(&ca, public_key, principal, issuer, ttl)
    }

    /// Signs a user certificate with the user CA.
    ///
    /// # Errors
    /// Returns `NotFound` if there is no user CA, or the signing error.
    pub async fn generate_user_certificate(
        &self,
        public_key: &[u8],
        username: &str,
        ttl: Duration,
    ) -> Result<Vec<u8>> {
        let ca = self.backend.get_ca(CaKind::User).await?;
        self.authority
            .generate_user_certificate(&ca, public_key, username, ttl)
    }

    /// # Errors
    /// Returns the backend error.
    pub async fn upsert_token(&self, id: &str, domain: &str, ttl: Duration) -> Result<()> {
        self.backend.upsert_token(id, domain, ttl).await
    }

    /// Mints a token for `domain`, registers it and returns its encoded form.
    ///
    /// # Errors
    /// Returns the sealing or backend error.
    pub async fn new_provisioning_token(&self, domain: &str, ttl: Duration) -> Result<String> {
        let (id, encoded) = self.sealer.new_secure_id()?;
        self.upsert_token(&id, domain, ttl).await?;
        Ok(encoded)
    }

    /// Decodes `encoded` and returns the domain its token was issued for.
    ///
    /// # Errors
    /// Returns `Crypto` for a malformed token, `NotFound` for an unknown or expired one.
    pub async fn validate_token(&self, encoded: &str) -> Result<String> {
        let id = self.sealer.decode_secure_id(encoded)?;
        Ok(self.backend.get_token(&id).await?.domain)
    }

    /// # Errors
    /// Returns the backend error.
    pub async fn upsert_remote_certificate(&self, cert: RemoteCert, ttl: Duration) -> Result<()> {
        self.backend.upsert_remote_certificate(cert, ttl).await
    }

    /// # Errors
    /// Returns the backend error.
    pub async fn get_remote_certificates(&self, kind: CaKind) -> Result<Vec<RemoteCert>> {
        self.backend.get_remote_certificates(kind).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::LocalAuthority;
    use crate::error::ErrorKind;
    use crate::memory::MemoryBackend;

    fn auth_server() -> AuthServer {
        let sealer = SealingService::new(&SealingService::generate_key().unwrap()).unwrap();
        AuthServer::new(
            Arc::new(MemoryBackend::new()),
            Arc::new(LocalAuthority::new()),
            sealer,
            "example.com",
        )
    }

    #[tokio::test]
    async fn reset_then_get_ca() {
        let auth = auth_server();
        assert!(auth.get_host_ca_public().await.unwrap_err().is_not_found());

        auth.reset_host_ca("").await.unwrap();
        let first = auth.get_host_ca_public().await.unwrap();
        assert!(auth.get_user_ca_public().await.unwrap_err().is_not_found());

        auth.reset_host_ca("").await.unwrap();
        assert_ne!(auth.get_host_ca_public().await.unwrap(), first);
    }

    #[tokio::test]
    async fn upsert_rejects_mismatched_kind() {
        let auth = auth_server();
        let ca = LocalAuthority
            .generate_ca(CaKind::User, "example.com", "")
            .unwrap();
        let err = auth.upsert_host_ca(ca.clone()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);

        auth.upsert_user_ca(ca.clone()).await.unwrap();
        assert_eq!(auth.get_user_ca_public().await.unwrap(), ca.certificate);
    }

    #[tokio::test]
    async fn host_certificate_requires_host_ca() {
        let auth = auth_server();
        let (_, public_key) = auth.generate_key_pair("").unwrap();
        let err = auth
            .generate_host_certificate(&public_key, "node", "example.com", Duration::ZERO)
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        auth.reset_host_ca("").await.unwrap();
        auth.generate_host_certificate(&public_key, "node", "example.com", Duration::ZERO)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn user_certificate_is_issued_by_user_ca() {
        let auth = auth_server();
        auth.reset_user_ca("").await.unwrap();
        let (_, public_key) = auth.generate_key_pair("").unwrap();
        let cert = auth
            .generate_user_certificate(&public_key, "alice", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(String::from_utf8(cert).unwrap().starts_with("-----BEGIN CERTIFICATE-----"));
    }

    #[tokio::test]
    async fn provisioning_token_validates() {
        let auth = auth_server();
        let encoded = auth
            .new_provisioning_token("node.example.com", Duration::from_secs(600))
            .await
            .unwrap();
        assert_eq!(auth.validate_token(&encoded).await.unwrap(), "node.example.com");

        let (_, unregistered) = auth.sealer().new_secure_id().unwrap();
        assert!(auth.validate_token(&unregistered).await.unwrap_err().is_not_found());
    }
}
