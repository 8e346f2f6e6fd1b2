//! Cluster bootstrap: lock, secret, CAs, first-start provisioning, node identity.
//!
//! Every step checks persisted state before mutating it, so [`init`] is safe to
//! run on every start and resumes whatever a crashed earlier run left undone.
//! Whether this is the cluster's first start is derived solely from the absence
//! of a CA at the beginning of the run.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::auth_server::AuthServer;
use crate::authority::{Authority, CaKind, CertAuthority};
use crate::error::{BootstrapError, Result, ResultExt};
use crate::fs_util;
use crate::keys::{self, NodeSigner};
use crate::secret;
use crate::services::{Backend, LockGuard, RemoteCert};

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(60);
pub const PROVISIONING_TOKEN_TTL: Duration = Duration::from_secs(600);

pub struct InitConfig {
    pub backend: Arc<dyn Backend>,
    pub authority: Arc<dyn Authority>,
    /// Cluster domain; names the bootstrap lock and the CAs.
    pub domain: String,
    /// Node name for the host certificate; falls back to `domain`.
    pub hostname: Option<String>,
    pub data_dir: PathBuf,
    /// Encoded secret key to adopt on first start; empty generates one.
    pub secret_key: String,
    /// Domain to encoded provisioning token, imported on first start only.
    pub allowed_tokens: BTreeMap<String, String>,
    /// Imported on first start only.
    pub trusted_authorities: Vec<RemoteCert>,
    pub host_ca: Option<CertAuthority>,
    pub user_ca: Option<CertAuthority>,
    pub lock_timeout: Duration,
}

impl std::fmt::Debug for InitConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitConfig")
            .field("domain", &self.domain)
            .field("hostname", &self.hostname)
            .field("data_dir", &self.data_dir)
            .field("secret_key", &"<redacted>")
            .field("allowed_tokens", &self.allowed_tokens.keys().collect::<Vec<_>>())
            .field("trusted_authorities", &self.trusted_authorities)
            .field("host_ca", &self.host_ca)
            .field("user_ca", &self.user_ca)
            .field("lock_timeout", &self.lock_timeout)
            .finish_non_exhaustive()
    }
}

impl InitConfig {
    pub fn new(
        backend: Arc<dyn Backend>,
        authority: Arc<dyn Authority>,
        domain: impl Into<String>,
        data_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            backend,
            authority,
            domain: domain.into(),
            hostname: None,
            data_dir: data_dir.into(),
            secret_key: String::new(),
            allowed_tokens: BTreeMap::new(),
            trusted_authorities: Vec::new(),
            host_ca: None,
            user_ca: None,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    fn node_name(&self) -> &str {
        self.hostname
            .as_deref()
            .filter(|name| !name.is_empty())
            .unwrap_or(&self.domain)
    }
}

/// A ready node identity.
#[derive(Debug)]
pub struct InitOutcome {
    pub auth_server: AuthServer,
    pub signer: NodeSigner,
    /// Whether a CA was missing when this run started.
    pub first_start: bool,
}

/// How one CA gets resolved during bootstrap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaResolution {
    /// Already stored; left untouched.
    Present,
    /// Missing; store the supplied material.
    Adopt(CertAuthority),
    /// Missing; generate a new CA.
    Generate,
}

impl CaResolution {
    /// Decides from the result of probing the CA's public material.
    /// Any probe error other than `NotFound` is returned unchanged.
    ///
    /// # Errors
    /// Returns the probe error when it is not `NotFound`.
    pub fn plan(probe: Result<Vec<u8>>, supplied: Option<&CertAuthority>) -> Result<Self> {
        match probe {
            Ok(_) => Ok(Self::Present),
            Err(err) if err.is_not_found() => Ok(supplied
                .cloned()
                .map_or(Self::Generate, Self::Adopt)),
            Err(err) => Err(err),
        }
    }

    #[must_use]
    pub fn is_first_start(&self) -> bool {
        !matches!(self, Self::Present)
    }
}

/// Bootstraps cluster identity under the cluster lock.
///
/// Steps already persisted by an earlier (possibly failed) run are not
/// repeated, and nothing is rolled back on failure.
///
/// # Errors
/// `Configuration` for an empty domain or data directory (nothing is touched),
/// `LockTimeout` if the lock is busy, otherwise the first failing step's error.
pub async fn init(cfg: InitConfig) -> Result<InitOutcome> {
    if cfg.domain.is_empty() {
        return Err(BootstrapError::Configuration(
            "domain can not be empty".to_string(),
        ));
    }
    if cfg.data_dir.as_os_str().is_empty() {
        return Err(BootstrapError::Configuration(
            "data directory can not be empty".to_string(),
        ));
    }

    fs_util::ensure_data_dir(&cfg.data_dir)
        .await
        .inspect_err(|err| error!("Failed to create data directory: {err}"))?;

    let _guard = LockGuard::acquire(cfg.backend.as_ref(), &cfg.domain, cfg.lock_timeout).await?;
    bootstrap_locked(&cfg).await
}

async fn bootstrap_locked(cfg: &InitConfig) -> Result<InitOutcome> {
    let sealer = secret::init_secret(&cfg.data_dir, &cfg.secret_key)
        .await
        .context("init secret")?;
    let auth = AuthServer::new(
        Arc::clone(&cfg.backend),
        Arc::clone(&cfg.authority),
        sealer,
        cfg.domain.clone(),
    );

    let mut first_start = false;
    for (kind, supplied) in [
        (CaKind::Host, cfg.host_ca.as_ref()),
        (CaKind::User, cfg.user_ca.as_ref()),
    ] {
        first_start |= bootstrap_ca(&auth, kind, supplied).await?;
    }

    if first_start {
        provision_first_start(&auth, &cfg.allowed_tokens, &cfg.trusted_authorities).await?;
    }

    let signer = keys::init_keys(&auth, cfg.node_name(), &cfg.data_dir)
        .await
        .context("init node keys")?;

    Ok(InitOutcome {
        auth_server: auth,
        signer,
        first_start,
    })
}

/// Makes sure the CA of `kind` exists. Returns whether it was missing.
async fn bootstrap_ca(
    auth: &AuthServer,
    kind: CaKind,
    supplied: Option<&CertAuthority>,
) -> Result<bool> {
    let probe = auth.get_ca_public(kind).await;
    let resolution = CaResolution::plan(probe, supplied)
        .inspect_err(|err| error!("{kind} CA error: {err}"))
        .with_context(|| format!("probe {kind} CA"))?;

    match &resolution {
        CaResolution::Present => {}
        CaResolution::Adopt(ca) => {
            info!("FIRST START: use {kind} CA keypair provided in config");
            auth.upsert_ca(kind, ca.clone())
                .await
                .with_context(|| format!("upsert {kind} CA"))?;
        }
        CaResolution::Generate => {
            info!("FIRST START: Generating {kind} CA on first start");
            auth.reset_ca(kind, "")
                .await
                .with_context(|| format!("reset {kind} CA"))?;
        }
    }
    Ok(resolution.is_first_start())
}

/// Applies the genesis-only provisioning: join tokens, then trusted authorities.
///
/// All tokens are decoded before any is stored, so a malformed entry leaves
/// no partial import behind.
async fn provision_first_start(
    auth: &AuthServer,
    allowed_tokens: &BTreeMap<String, String>,
    trusted_authorities: &[RemoteCert],
) -> Result<()> {
    if !allowed_tokens.is_empty() {
        info!("FIRST START: Setting allowed provisioning tokens");
        let decoded = allowed_tokens
            .iter()
            .map(|(domain, token)| {
                auth.sealer()
                    .decode_secure_id(token)
                    .with_context(|| format!("decode provisioning token for {domain}"))
                    .map(|id| (domain, id))
            })
            .collect::<Result<Vec<_>>>()?;

        for (domain, id) in decoded {
            info!("FIRST START: upsert provisioning token: fqdn: {domain}");
            auth.upsert_token(&id, domain, PROVISIONING_TOKEN_TTL)
                .await
                .with_context(|| format!("upsert provisioning token for {domain}"))?;
        }
    }

    if !trusted_authorities.is_empty() {
        info!("FIRST START: Setting trusted certificate authorities");
        for cert in trusted_authorities {
            info!(
                "FIRST START: upsert trusted remote cert: type: {} fqdn: {}",
                cert.kind, cert.domain
            );
            auth.upsert_remote_certificate(cert.clone(), Duration::ZERO)
                .await
                .with_context(|| format!("upsert trusted {} CA for {}", cert.kind, cert.domain))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::LocalAuthority;
    use crate::error::ErrorKind;
    use crate::memory::MemoryBackend;

    fn supplied_ca() -> CertAuthority {
        LocalAuthority
            .generate_ca(CaKind::Host, "example.com", "")
            .unwrap()
    }

    #[test]
    fn debug_redacts_secret_key() {
        let mut cfg = InitConfig::new(
            Arc::new(MemoryBackend::new()),
            Arc::new(LocalAuthority),
            "example.com",
            "/var/lib/certboot",
        );
        cfg.secret_key = "top-secret-key".to_string();
        let rendered = format!("{cfg:?}");
        assert!(rendered.contains("example.com"));
        assert!(!rendered.contains("top-secret-key"));
    }

    #[test]
    fn present_ca_is_left_alone() {
        let plan = CaResolution::plan(Ok(b"cert".to_vec()), Some(&supplied_ca())).unwrap();
        assert_eq!(plan, CaResolution::Present);
        assert!(!plan.is_first_start());
    }

    #[test]
    fn absent_ca_generates_without_material() {
        let probe = Err(BootstrapError::NotFound("host CA".to_string()));
        let plan = CaResolution::plan(probe, None).unwrap();
        assert_eq!(plan, CaResolution::Generate);
        assert!(plan.is_first_start());
    }

    #[test]
    fn absent_ca_adopts_supplied_material() {
        let ca = supplied_ca();
        let probe = Err(BootstrapError::NotFound("host CA".to_string()).context("probe"));
        let plan = CaResolution::plan(probe, Some(&ca)).unwrap();
        assert_eq!(plan, CaResolution::Adopt(ca));
        assert!(plan.is_first_start());
    }

    #[test]
    fn other_probe_errors_are_fatal() {
        let probe = Err(BootstrapError::Backend("connection refused".to_string()));
        let err = CaResolution::plan(probe, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Backend);
    }
}
