//! Contracts of the storage collaborators bootstrap runs against.

use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::authority::{CaKind, CertAuthority};
use crate::error::Result;

/// Cluster-wide named lock.
#[async_trait]
pub trait LockService: Send + Sync {
    /// Waits up to `timeout` for `name` to become free and takes it.
    ///
    /// # Errors
    /// Returns `LockTimeout` if the lock is still held when `timeout` elapses.
    async fn acquire(&self, name: &str, timeout: Duration) -> Result<()>;

    /// Releases `name`. Releasing a lock that is not held is not an error.
    ///
    /// # Errors
    /// Returns `Backend` if the lock state cannot be updated.
    fn release(&self, name: &str) -> Result<()>;
}

/// Holds a named lock until dropped.
pub struct LockGuard<'a, L: LockService + ?Sized> {
    locks: &'a L,
    name: String,
}

impl<'a, L: LockService + ?Sized> LockGuard<'a, L> {
    /// Acquires `name` on `locks`.
    ///
    /// # Errors
    /// Propagates the acquire error; nothing is held in that case.
    pub async fn acquire(locks: &'a L, name: &str, timeout: Duration) -> Result<Self> {
        locks.acquire(name, timeout).await?;
        debug!("Acquired lock {name}");
        Ok(Self {
            locks,
            name: name.to_string(),
        })
    }
}

impl<L: LockService + ?Sized> Drop for LockGuard<'_, L> {
    fn drop(&mut self) {
        match self.locks.release(&self.name) {
            Ok(()) => debug!("Released lock {}", self.name),
            Err(err) => warn!("Failed to release lock {}: {err}", self.name),
        }
    }
}

/// Storage of the cluster's host and user CAs.
#[async_trait]
pub trait CaStore: Send + Sync {
    /// # Errors
    /// Returns `NotFound` if no CA of this kind has been stored.
    async fn get_ca(&self, kind: CaKind) -> Result<CertAuthority>;

    /// Stores `ca`, replacing any CA of the same kind.
    ///
    /// # Errors
    /// Returns `Backend` on storage failure.
    async fn upsert_ca(&self, ca: CertAuthority) -> Result<()>;
}

/// A registered node join token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionToken {
    pub id: String,
    pub domain: String,
    pub expires: SystemTime,
}

#[async_trait]
pub trait ProvisioningStore: Send + Sync {
    /// Registers token `id` for `domain`, expiring after `ttl`.
    ///
    /// # Errors
    /// Returns `Backend` on storage failure.
    async fn upsert_token(&self, id: &str, domain: &str, ttl: Duration) -> Result<()>;

    /// # Errors
    /// Returns `NotFound` if the token is unknown or expired.
    async fn get_token(&self, id: &str) -> Result<ProvisionToken>;
}

/// Public material of an externally trusted CA.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCert {
    pub kind: CaKind,
    pub domain: String,
    pub certificate: Vec<u8>,
}

#[async_trait]
pub trait TrustStore: Send + Sync {
    /// Stores `cert`, keyed by kind and domain. A zero `ttl` never expires.
    ///
    /// # Errors
    /// Returns `Backend` on storage failure.
    async fn upsert_remote_certificate(&self, cert: RemoteCert, ttl: Duration) -> Result<()>;

    /// Lists unexpired trusted authorities of `kind`.
    ///
    /// # Errors
    /// Returns `Backend` on storage failure.
    async fn get_remote_certificates(&self, kind: CaKind) -> Result<Vec<RemoteCert>>;
}

/// Everything bootstrap needs from the shared cluster backend.
pub trait Backend: LockService + CaStore + ProvisioningStore + TrustStore {}

impl<T: LockService + CaStore + ProvisioningStore + TrustStore + ?Sized> Backend for T {}
