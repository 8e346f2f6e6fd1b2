//! Backend persisted as JSON inside the data directory.
//!
//! Cluster state survives process restarts, so a later `init` against the same
//! directory finds the CAs it created before. The cluster lock is a lock file
//! created exclusively next to the state file. Mutations from separate processes
//! are only safe while holding that lock.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::authority::{CaKind, CertAuthority};
use crate::error::{BootstrapError, Result};
use crate::fs_util::{self, PRIVATE_FILE_MODE};
use crate::services::{
    CaStore, LockService, ProvisionToken, ProvisioningStore, RemoteCert, TrustStore,
};

pub const STATE_FILE_NAME: &str = "backend.json";
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Serialize, Deserialize)]
struct StoredCa {
    kind: CaKind,
    domain: String,
    private_key: String,
    certificate: String,
}

impl TryFrom<CertAuthority> for StoredCa {
    type Error = BootstrapError;

    fn try_from(ca: CertAuthority) -> Result<Self> {
        let CertAuthority {
            kind,
            domain,
            private_key,
            certificate,
        } = ca;
        let pem = |bytes: Vec<u8>, what: &str| {
            String::from_utf8(bytes)
                .map_err(|_| BootstrapError::Crypto(format!("{kind} CA {what} is not PEM")))
        };
        Ok(Self {
            kind,
            domain,
            private_key: pem(private_key, "private key")?,
            certificate: pem(certificate, "certificate")?,
        })
    }
}

impl From<&StoredCa> for CertAuthority {
    fn from(stored: &StoredCa) -> Self {
        Self {
            kind: stored.kind,
            domain: stored.domain.clone(),
            private_key: stored.private_key.clone().into_bytes(),
            certificate: stored.certificate.clone().into_bytes(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredRemoteCert {
    #[serde(flatten)]
    cert: RemoteCert,
    expires: Option<SystemTime>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    authorities: Vec<StoredCa>,
    #[serde(default)]
    tokens: Vec<ProvisionToken>,
    #[serde(default)]
    remote_certs: Vec<StoredRemoteCert>,
}

#[derive(Debug)]
pub struct FileBackend {
    dir: PathBuf,
    // Serializes read-modify-write cycles within this process.
    write: Mutex<()>,
}

impl FileBackend {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE_NAME)
    }

    fn lock_path(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || matches!(name, "." | "..") || name.contains(['/', '\\', '\0']) {
            return Err(BootstrapError::Configuration(format!(
                "lock name {name:?} is not a valid file name"
            )));
        }
        Ok(self.dir.join(format!("{name}.lock")))
    }

    async fn load(&self) -> Result<Snapshot> {
        let path = self.state_path();
        match fs_util::read_path(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                BootstrapError::Backend(format!("failed to parse {}: {e}", path.display()))
            }),
            Err(err) if err.is_not_found() => Ok(Snapshot::default()),
            Err(err) => Err(err),
        }
    }

    async fn update<F>(&self, apply: F) -> Result<()>
    where
        F: FnOnce(&mut Snapshot) -> Result<()> + Send,
    {
        let _write = self.write.lock().await;
        let mut snapshot = self.load().await?;
        apply(&mut snapshot)?;
        let bytes = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| BootstrapError::Backend(format!("failed to encode state: {e}")))?;
        fs_util::ensure_data_dir(&self.dir).await?;
        fs_util::write_private_file(&self.state_path(), &bytes).await
    }
}

async fn lock_holder(path: &Path) -> String {
    fs::read_to_string(path)
        .await
        .map_or_else(|_| "unknown".to_string(), |pid| pid.trim().to_string())
}

#[async_trait]
impl LockService for FileBackend {
    async fn acquire(&self, name: &str, timeout: Duration) -> Result<()> {
        let path = self.lock_path(name)?;
        fs_util::ensure_data_dir(&self.dir).await?;
        let deadline = Instant::now() + timeout;
        loop {
            let created = fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(PRIVATE_FILE_MODE)
                .open(&path)
                .await;
            match created {
                Ok(mut file) => {
                    let pid = std::process::id().to_string();
                    if let Err(e) = file.write_all(pid.as_bytes()).await {
                        let _ = fs::remove_file(&path).await;
                        return Err(BootstrapError::io(&path, e));
                    }
                    debug!("Acquired lock file {}", path.display());
                    return Ok(());
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return Err(BootstrapError::io(&path, e)),
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    "Lock file {} is still held by process {}",
                    path.display(),
                    lock_holder(&path).await
                );
                return Err(BootstrapError::LockTimeout {
                    name: name.to_string(),
                    timeout,
                });
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    fn release(&self, name: &str) -> Result<()> {
        let path = self.lock_path(name)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BootstrapError::io(path, e)),
        }
    }
}

#[async_trait]
impl CaStore for FileBackend {
    async fn get_ca(&self, kind: CaKind) -> Result<CertAuthority> {
        self.load()
            .await?
            .authorities
            .iter()
            .find(|ca| ca.kind == kind)
            .map(CertAuthority::from)
            .ok_or_else(|| BootstrapError::NotFound(format!("{kind} CA")))
    }

    async fn upsert_ca(&self, ca: CertAuthority) -> Result<()> {
        let stored = StoredCa::try_from(ca)?;
        self.update(move |snapshot| {
            snapshot.authorities.retain(|ca| ca.kind != stored.kind);
            snapshot.authorities.push(stored);
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl ProvisioningStore for FileBackend {
    async fn upsert_token(&self, id: &str, domain: &str, ttl: Duration) -> Result<()> {
        let token = ProvisionToken {
            id: id.to_string(),
            domain: domain.to_string(),
            expires: SystemTime::now() + ttl,
        };
        self.update(move |snapshot| {
            snapshot.tokens.retain(|t| t.id != token.id);
            snapshot.tokens.push(token);
            Ok(())
        })
        .await
    }

    async fn get_token(&self, id: &str) -> Result<ProvisionToken> {
        let now = SystemTime::now();
        self.load()
            .await?
            .tokens
            .into_iter()
            .find(|token| token.id == id && token.expires > now)
            .ok_or_else(|| BootstrapError::NotFound(format!("token {id}")))
    }
}

#[async_trait]
impl TrustStore for FileBackend {
    async fn upsert_remote_certificate(&self, cert: RemoteCert, ttl: Duration) -> Result<()> {
        let expires = (!ttl.is_zero()).then(|| SystemTime::now() + ttl);
        self.update(move |snapshot| {
            snapshot.remote_certs.retain(|stored| {
                stored.cert.kind != cert.kind || stored.cert.domain != cert.domain
            });
            snapshot.remote_certs.push(StoredRemoteCert { cert, expires });
            Ok(())
        })
        .await
    }

    async fn get_remote_certificates(&self, kind: CaKind) -> Result<Vec<RemoteCert>> {
        let now = SystemTime::now();
        Ok(self
            .load()
            .await?
            .remote_certs
            .into_iter()
            .filter(|stored| stored.cert.kind == kind && stored.expires.is_none_or(|at| at > now))
            .map(|stored| stored.cert)
            .collect())
    }
}
