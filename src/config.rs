use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::authority::{Authority, CaKind, CertAuthority};
use crate::init::InitConfig;
use crate::services::{Backend, RemoteCert};

mod defaults;
mod validation;

const DEFAULT_CONFIG_FILE: &str = "certboot.toml";
const ENV_PREFIX: &str = "CERTBOOT";

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub domain: String,
    pub hostname: String,
    pub data_dir: PathBuf,
    pub secret_key: String,
    pub lock_timeout: String,
    #[serde(default)]
    pub allowed_tokens: BTreeMap<String, String>,
    #[serde(default)]
    pub trusted_authorities: Vec<TrustedAuthoritySettings>,
    #[serde(default)]
    pub host_ca: Option<CaFiles>,
    #[serde(default)]
    pub user_ca: Option<CaFiles>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TrustedAuthoritySettings {
    pub kind: CaKind,
    pub domain: String,
    pub certificate_path: PathBuf,
}

/// PEM files of externally supplied CA material.
#[derive(Debug, Deserialize, Clone)]
pub struct CaFiles {
    pub key_path: PathBuf,
    pub cert_path: PathBuf,
}

impl Settings {
    /// Loads defaults, then the config file (if present), then `CERTBOOT_*` variables.
    ///
    /// # Errors
    /// Returns error if a source cannot be parsed.
    pub fn new(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut s = defaults::apply_defaults(Config::builder())?;

        let path = config_path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        s = s.add_source(File::from(path).required(false));

        // e.g. CERTBOOT_DOMAIN, CERTBOOT_DATA_DIR, CERTBOOT_HOST_CA__KEY_PATH
        s = s.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__"),
        );

        s.build()?.try_deserialize()
    }

    /// Validates configuration values for correctness.
    ///
    /// # Errors
    /// Returns error if any setting is invalid or out of range.
    pub fn validate(&self) -> Result<()> {
        validation::validate_settings(self)
    }

    /// Parsed `lock_timeout`.
    ///
    /// # Errors
    /// Returns error if the value is not a duration such as `60s` or `2m`.
    pub fn lock_timeout(&self) -> Result<Duration> {
        humantime::parse_duration(&self.lock_timeout)
            .with_context(|| format!("Invalid lock_timeout {:?}", self.lock_timeout))
    }

    /// Reads the referenced PEM files and builds the bootstrap input.
    ///
    /// # Errors
    /// Returns error if a referenced file cannot be read.
    pub fn into_init_config(
        self,
        backend: Arc<dyn Backend>,
        authority: Arc<dyn Authority>,
    ) -> Result<InitConfig> {
        let lock_timeout = self.lock_timeout()?;
        let trusted_authorities = self
            .trusted_authorities
            .iter()
            .map(|authority| {
                Ok(RemoteCert {
                    kind: authority.kind,
                    domain: authority.domain.clone(),
                    certificate: read_file(&authority.certificate_path)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let host_ca = self
            .host_ca
            .as_ref()
            .map(|files| files.load(CaKind::Host, &self.domain))
            .transpose()?;
        let user_ca = self
            .user_ca
            .as_ref()
            .map(|files| files.load(CaKind::User, &self.domain))
            .transpose()?;

        let mut cfg = InitConfig::new(backend, authority, self.domain, self.data_dir);
        cfg.hostname = Some(self.hostname).filter(|name| !name.is_empty());
        cfg.secret_key = self.secret_key;
        cfg.allowed_tokens = self.allowed_tokens;
        cfg.trusted_authorities = trusted_authorities;
        cfg.host_ca = host_ca;
        cfg.user_ca = user_ca;
        cfg.lock_timeout = lock_timeout;
        Ok(cfg)
    }
}

impl CaFiles {
    fn load(&self, kind: CaKind, domain: &str) -> Result<CertAuthority> {
        Ok(CertAuthority {
            kind,
            domain: domain.to_string(),
            private_key: read_file(&self.key_path)?,
            certificate: read_file(&self.cert_path)?,
        })
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::authority::LocalAuthority;
    use crate::memory::MemoryBackend;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(file, "{contents}").unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_load_settings_defaults() {
        let settings = Settings::new(Some(PathBuf::from("/nonexistent/certboot.toml"))).unwrap();
        assert_eq!(settings.data_dir, PathBuf::from("/var/lib/certboot"));
        assert_eq!(settings.lock_timeout().unwrap(), Duration::from_secs(60));
        assert!(settings.allowed_tokens.is_empty());
        assert!(settings.host_ca.is_none());
    }

    #[test]
    fn test_load_settings_file_override() {
        let file = write_config(
            r#"
            domain = "example.com"
            hostname = "auth.example.com"
            data_dir = "/tmp/certboot"
            lock_timeout = "2m"

            [allowed_tokens]
            "node1.example.com" = "token-one"

            [[trusted_authorities]]
            kind = "user"
            domain = "remote.example.com"
            certificate_path = "/etc/certboot/remote-user-ca.pem"
        "#,
        );

        let settings = Settings::new(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(settings.domain, "example.com");
        assert_eq!(settings.hostname, "auth.example.com");
        assert_eq!(settings.lock_timeout().unwrap(), Duration::from_secs(120));
        assert_eq!(
            settings.allowed_tokens.get("node1.example.com").map(String::as_str),
            Some("token-one")
        );
        assert_eq!(settings.trusted_authorities[0].kind, CaKind::User);
        settings.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_empty_domain() {
        let settings = Settings::new(Some(PathBuf::from("/nonexistent/certboot.toml"))).unwrap();
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("domain"));
    }

    #[test]
    fn test_validate_rejects_path_like_hostname() {
        let mut settings =
            Settings::new(Some(PathBuf::from("/nonexistent/certboot.toml"))).unwrap();
        settings.domain = "example.com".to_string();
        settings.hostname = "../etc/node".to_string();
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("not a valid file name"));

        settings.hostname = "node1.example.com".to_string();
        settings.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_lock_timeout() {
        let mut settings =
            Settings::new(Some(PathBuf::from("/nonexistent/certboot.toml"))).unwrap();
        settings.domain = "example.com".to_string();
        settings.lock_timeout = "soon".to_string();
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("lock_timeout"));

        settings.lock_timeout = "0s".to_string();
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("greater than 0"));
    }

    #[test]
    fn test_into_init_config_reads_ca_files() {
        let dir = tempfile::tempdir().unwrap();
        let ca = LocalAuthority
            .generate_ca(CaKind::Host, "example.com", "")
            .unwrap();
        let key_path = dir.path().join("host-ca.key");
        let cert_path = dir.path().join("host-ca.pem");
        std::fs::write(&key_path, &ca.private_key).unwrap();
        std::fs::write(&cert_path, &ca.certificate).unwrap();

        let mut settings =
            Settings::new(Some(PathBuf::from("/nonexistent/certboot.toml"))).unwrap();
        settings.domain = "example.com".to_string();
        settings.host_ca = Some(CaFiles {
            key_path,
            cert_path,
        });

        let cfg = settings
            .into_init_config(Arc::new(MemoryBackend::new()), Arc::new(LocalAuthority))
            .unwrap();
        assert_eq!(cfg.host_ca, Some(ca));
        assert!(cfg.user_ca.is_none());
        assert!(cfg.hostname.is_none());
    }

    #[test]
    fn test_into_init_config_reports_missing_file() {
        let mut settings =
            Settings::new(Some(PathBuf::from("/nonexistent/certboot.toml"))).unwrap();
        settings.domain = "example.com".to_string();
        settings.trusted_authorities = vec![TrustedAuthoritySettings {
            kind: CaKind::Host,
            domain: "remote".to_string(),
            certificate_path: PathBuf::from("/nonexistent/remote.pem"),
        }];

        let err = settings
            .into_init_config(Arc::new(MemoryBackend::new()), Arc::new(LocalAuthority))
            .unwrap_err();
        assert!(err.to_string().contains("Failed to read /nonexistent/remote.pem"));
    }
}
