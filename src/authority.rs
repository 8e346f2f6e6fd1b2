//! Certificate authority material and native key/certificate generation.

use std::fmt;
use std::time::Duration;

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, Issuer, KeyPair, KeyUsagePurpose, SubjectPublicKeyInfo,
};
use ring::digest::{SHA256, digest};
use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, Time};

use crate::error::{BootstrapError, Result};

// RFC 5280 4.1.2.5: 99991231235959Z marks a certificate with no expiration date.
const NO_EXPIRY_YEAR: i32 = 9999;

fn no_expiry() -> Result<OffsetDateTime> {
    let end_of_day = Time::from_hms(23, 59, 59).map_err(BootstrapError::crypto)?;
    Ok(rcgen::date_time_ymd(NO_EXPIRY_YEAR, 12, 31).replace_time(end_of_day))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaKind {
    Host,
    User,
}

impl fmt::Display for CaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host => f.write_str("host"),
            Self::User => f.write_str("user"),
        }
    }
}

/// A CA key pair with its self-signed certificate, both PEM encoded.
#[derive(Clone, PartialEq, Eq)]
pub struct CertAuthority {
    pub kind: CaKind,
    pub domain: String,
    pub private_key: Vec<u8>,
    pub certificate: Vec<u8>,
}

impl fmt::Debug for CertAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertAuthority")
            .field("kind", &self.kind)
            .field("domain", &self.domain)
            .field("private_key", &"<redacted>")
            .field("certificate", &String::from_utf8_lossy(&self.certificate))
            .finish()
    }
}

impl CertAuthority {
    /// `SHA256:<hex>` digest of the certificate DER.
    ///
    /// # Errors
    /// Returns `Crypto` if the certificate is not valid PEM.
    pub fn fingerprint(&self) -> Result<String> {
        certificate_fingerprint(&self.certificate)
    }
}

/// Fingerprint of a PEM certificate.
///
/// # Errors
/// Returns `Crypto` if the input is not valid PEM.
pub fn certificate_fingerprint(cert_pem: &[u8]) -> Result<String> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(cert_pem)
        .map_err(|e| BootstrapError::Crypto(format!("failed to parse certificate PEM: {e}")))?;
    Ok(format!(
        "SHA256:{}",
        hex::encode(digest(&SHA256, &pem.contents))
    ))
}

/// Key and certificate generation primitives.
pub trait Authority: Send + Sync {
    /// Generates a key pair, returning `(private_key_pem, public_key_pem)`.
    ///
    /// # Errors
    /// Returns `Crypto` on generation failure or an unsupported passphrase.
    fn generate_key_pair(&self, passphrase: &str) -> Result<(Vec<u8>, Vec<u8>)>;

    /// Generates a new self-signed CA of the given kind.
    ///
    /// # Errors
    /// Returns `Crypto` on generation failure.
    fn generate_ca(&self, kind: CaKind, domain: &str, passphrase: &str) -> Result<CertAuthority>;

    /// Signs a host certificate for `public_key`. A zero `ttl` never expires.
    ///
    /// # Errors
    /// Returns `Crypto` if the CA or public key cannot be parsed, or signing fails.
    fn generate_host_certificate(
        &self,
        ca: &CertAuthority,
        public_key: &[u8],
        principal: &str,
        issuer: &str,
        ttl: Duration,
    ) -> Result<Vec<u8>>;

    /// Signs a user certificate for `public_key`.
    ///
    /// # Errors
    /// Returns `Crypto` if the CA or public key cannot be parsed, or signing fails.
    fn generate_user_certificate(
        &self,
        ca: &CertAuthority,
        public_key: &[u8],
        username: &str,
        ttl: Duration,
    ) -> Result<Vec<u8>>;
}

/// ECDSA P-256 authority built on `rcgen`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalAuthority;

impl LocalAuthority {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

fn pem_str<'a>(bytes: &'a [u8], what: &str) -> Result<&'a str> {
    std::str::from_utf8(bytes).map_err(|_| BootstrapError::Crypto(format!("{what} is not UTF-8")))
}

fn parse_public_key(public_key: &[u8]) -> Result<SubjectPublicKeyInfo> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(public_key)
        .map_err(|e| BootstrapError::Crypto(format!("failed to parse public key PEM: {e}")))?;
    Ok(SubjectPublicKeyInfo::from_der(&pem.contents)?)
}

fn load_issuer(ca: &CertAuthority, expected: CaKind) -> Result<Issuer<'static, KeyPair>> {
    if ca.kind != expected {
        return Err(BootstrapError::Crypto(format!(
            "{} CA cannot sign {expected} certificates",
            ca.kind
        )));
    }
    let key = KeyPair::from_pem(pem_str(&ca.private_key, "CA private key")?)?;
    Ok(Issuer::from_ca_cert_pem(
        pem_str(&ca.certificate, "CA certificate")?,
        key,
    )?)
}

fn set_validity(params: &mut CertificateParams, ttl: Duration) -> Result<()> {
    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = if ttl.is_zero() {
        no_expiry()?
    } else {
        let ttl = time::Duration::try_from(ttl).map_err(BootstrapError::crypto)?;
        now + ttl
    };
    Ok(())
}

impl Authority for LocalAuthority {
    fn generate_key_pair(&self, passphrase: &str) -> Result<(Vec<u8>, Vec<u8>)> {
        if !passphrase.is_empty() {
            return Err(BootstrapError::Crypto(
                "passphrase-protected keys are not supported".to_string(),
            ));
        }
        let key = KeyPair::generate()?;
        Ok((
            key.serialize_pem().into_bytes(),
            key.public_key_pem().into_bytes(),
        ))
    }

    fn generate_ca(&self, kind: CaKind, domain: &str, passphrase: &str) -> Result<CertAuthority> {
        let (private_key, _) = self.generate_key_pair(passphrase)?;
        let key = KeyPair::from_pem(pem_str(&private_key, "CA private key")?)?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, format!("{domain} {kind} CA"));
        dn.push(DnType::OrganizationName, domain);
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        set_validity(&mut params, Duration::ZERO)?;

        let cert = params.self_signed(&key)?;
        Ok(CertAuthority {
            kind,
            domain: domain.to_string(),
            private_key,
            certificate: cert.pem().into_bytes(),
        })
    }

    fn generate_host_certificate(
        &self,
        ca: &CertAuthority,
        public_key: &[u8],
        principal: &str,
        issuer: &str,
        ttl: Duration,
    ) -> Result<Vec<u8>> {
        let ca_issuer = load_issuer(ca, CaKind::Host)?;
        let public_key = parse_public_key(public_key)?;

        let mut params = CertificateParams::new(vec![principal.to_string()])?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, principal);
        dn.push(DnType::OrganizationName, issuer);
        params.distinguished_name = dn;
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        set_validity(&mut params, ttl)?;

        let cert = params.signed_by(&public_key, &ca_issuer)?;
        Ok(cert.pem().into_bytes())
    }

    fn generate_user_certificate(
        &self,
        ca: &CertAuthority,
        public_key: &[u8],
        username: &str,
        ttl: Duration,
    ) -> Result<Vec<u8>> {
        let ca_issuer = load_issuer(ca, CaKind::User)?;
        let public_key = parse_public_key(public_key)?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, username);
        dn.push(DnType::OrganizationName, ca.domain.as_str());
        params.distinguished_name = dn;
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        set_validity(&mut params, ttl)?;

        let cert = params.signed_by(&public_key, &ca_issuer)?;
        Ok(cert.pem().into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use x509_parser::prelude::{FromDer, X509Certificate};

    use super::*;

    // 9999-12-31T23:59:59Z
    const NO_EXPIRY_TIMESTAMP: i64 = 253_402_300_799;

    fn parse(pem: &[u8]) -> x509_parser::pem::Pem {
        x509_parser::pem::parse_x509_pem(pem).unwrap().1
    }

    #[test]
    fn generated_ca_is_self_signed_ca() {
        let ca = LocalAuthority
            .generate_ca(CaKind::Host, "example.com", "")
            .unwrap();
        let pem = parse(&ca.certificate);
        let (_, cert) = X509Certificate::from_der(&pem.contents).unwrap();

        let constraints = cert.basic_constraints().unwrap().unwrap();
        assert!(constraints.value.ca);
        assert_eq!(cert.subject(), cert.issuer());
        assert_eq!(cert.validity().not_after.timestamp(), NO_EXPIRY_TIMESTAMP);
        assert!(ca.fingerprint().unwrap().starts_with("SHA256:"));
    }

    #[test]
    fn passphrase_is_rejected() {
        let err = LocalAuthority.generate_key_pair("secret").unwrap_err();
        assert!(err.to_string().contains("passphrase"));
    }

    #[test]
    fn host_certificate_is_signed_by_host_ca() {
        let authority = LocalAuthority::new();
        let ca = authority
            .generate_ca(CaKind::Host, "example.com", "")
            .unwrap();
        let (_, public_key) = authority.generate_key_pair("").unwrap();

        let cert_pem = authority
            .generate_host_certificate(
                &ca,
                &public_key,
                "node.example.com",
                "example.com",
                Duration::ZERO,
            )
            .unwrap();

        let ca_pem = parse(&ca.certificate);
        let (_, ca_cert) = X509Certificate::from_der(&ca_pem.contents).unwrap();
        let pem = parse(&cert_pem);
        let (_, cert) = X509Certificate::from_der(&pem.contents).unwrap();

        assert_eq!(cert.issuer(), ca_cert.subject());
        assert!(cert.verify_signature(Some(ca_cert.public_key())).is_ok());
        let cn = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok());
        assert_eq!(cn, Some("node.example.com"));
        assert_eq!(cert.validity().not_after.timestamp(), NO_EXPIRY_TIMESTAMP);
    }

    #[test]
    fn user_ca_cannot_sign_host_certificates() {
        let authority = LocalAuthority::new();
        let ca = authority
            .generate_ca(CaKind::User, "example.com", "")
            .unwrap();
        let (_, public_key) = authority.generate_key_pair("").unwrap();

        let err = authority
            .generate_host_certificate(&ca, &public_key, "node", "example.com", Duration::ZERO)
            .unwrap_err();
        assert!(err.to_string().contains("user CA cannot sign host"));
    }

    #[test]
    fn user_certificate_honours_ttl() {
        let authority = LocalAuthority::new();
        let ca = authority
            .generate_ca(CaKind::User, "example.com", "")
            .unwrap();
        let (_, public_key) = authority.generate_key_pair("").unwrap();

        let cert_pem = authority
            .generate_user_certificate(&ca, &public_key, "alice", Duration::from_secs(3600))
            .unwrap();
        let pem = parse(&cert_pem);
        let (_, cert) = X509Certificate::from_der(&pem.contents).unwrap();
        let lifetime = cert.validity().not_after.timestamp() - cert.validity().not_before.timestamp();
        assert_eq!(lifetime, 3600);
    }
}
