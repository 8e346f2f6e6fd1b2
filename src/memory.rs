//! In-process backend implementing every collaborator contract.
//!
//! State lives for the lifetime of the value; share it between callers with `Arc`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::authority::{CaKind, CertAuthority};
use crate::error::{BootstrapError, Result};
use crate::services::{
    CaStore, LockService, ProvisionToken, ProvisioningStore, RemoteCert, TrustStore,
};

#[derive(Default)]
struct State {
    locks: HashSet<String>,
    authorities: HashMap<CaKind, CertAuthority>,
    tokens: HashMap<String, ProvisionToken>,
    remote_certs: BTreeMap<(CaKind, String), (RemoteCert, Option<SystemTime>)>,
}

#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<State>,
    released: Notify,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| BootstrapError::Backend("memory backend state poisoned".to_string()))
    }

    fn try_lock(&self, name: &str) -> Result<bool> {
        Ok(self.state()?.locks.insert(name.to_string()))
    }
}

#[async_trait]
impl LockService for MemoryBackend {
    async fn acquire(&self, name: &str, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            // Registered before the check so a release in between still wakes us.
            let released = self.released.notified();
            if self.try_lock(name)? {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, released).await.is_err() {
                return Err(BootstrapError::LockTimeout {
                    name: name.to_string(),
                    timeout,
                });
            }
        }
    }

    fn release(&self, name: &str) -> Result<()> {
        self.state()?.locks.remove(name);
        self.released.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl CaStore for MemoryBackend {
    async fn get_ca(&self, kind: CaKind) -> Result<CertAuthority> {
        self.state()?
            .authorities
            .get(&kind)
            .cloned()
            .ok_or_else(|| BootstrapError::NotFound(format!("{kind} CA")))
    }

    async fn upsert_ca(&self, ca: CertAuthority) -> Result<()> {
        self.state()?.authorities.insert(ca.kind, ca);
        Ok(())
    }
}

#[async_trait]
impl ProvisioningStore for MemoryBackend {
    async fn upsert_token(&self, id: &str, domain: &str, ttl: Duration) -> Result<()> {
        let token = ProvisionToken {
            id: id.to_string(),
            domain: domain.to_string(),
            expires: SystemTime::now() + ttl,
        };
        self.state()?.tokens.insert(id.to_string(), token);
        Ok(())
    }

    async fn get_token(&self, id: &str) -> Result<ProvisionToken> {
        let mut state = self.state()?;
        match state.tokens.get(id) {
            Some(token) if token.expires > SystemTime::now() => Ok(token.clone()),
            Some(_) => {
                state.tokens.remove(id);
                Err(BootstrapError::NotFound(format!("token {id} expired")))
            }
            None => Err(BootstrapError::NotFound(format!("token {id}"))),
        }
    }
}

#[async_trait]
impl TrustStore for MemoryBackend {
    async fn upsert_remote_certificate(&self, cert: RemoteCert, ttl: Duration) -> Result<()> {
        let expires = (!ttl.is_zero()).then(|| SystemTime::now() + ttl);
        self.state()?
            .remote_certs
            .insert((cert.kind, cert.domain.clone()), (cert, expires));
        Ok(())
    }

    async fn get_remote_certificates(&self, kind: CaKind) -> Result<Vec<RemoteCert>> {
        let now = SystemTime::now();
        Ok(self
            .state()?
            .remote_certs
            .values()
            .filter(|(cert, expires)| cert.kind == kind && expires.is_none_or(|at| at > now))
            .map(|(cert, _)| cert.clone())
            .collect())
    }
}
