use anyhow::Result;

use crate::keys;

use super::{CaFiles, Settings, TrustedAuthoritySettings};

pub(crate) fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.domain.trim().is_empty() {
        anyhow::bail!("domain must not be empty");
    }
    if !settings.domain.is_ascii() {
        anyhow::bail!("domain must be ASCII");
    }
    if !settings.hostname.is_ascii() {
        anyhow::bail!("hostname must be ASCII");
    }
    // Either name may end up as the node key file name.
    keys::validate_node_name(settings.domain.trim())?;
    if !settings.hostname.is_empty() {
        keys::validate_node_name(&settings.hostname)?;
    }
    if settings.data_dir.as_os_str().is_empty() {
        anyhow::bail!("data_dir must not be empty");
    }
    if settings.lock_timeout()?.is_zero() {
        anyhow::bail!("lock_timeout must be greater than 0");
    }
    for (domain, token) in &settings.allowed_tokens {
        if domain.trim().is_empty() {
            anyhow::bail!("allowed_tokens keys must not be empty");
        }
        if token.trim().is_empty() {
            anyhow::bail!("allowed_tokens.{domain} must not be empty");
        }
    }
    for authority in &settings.trusted_authorities {
        validate_trusted_authority(authority)?;
    }
    if let Some(files) = &settings.host_ca {
        validate_ca_files(files, "host_ca")?;
    }
    if let Some(files) = &settings.user_ca {
        validate_ca_files(files, "user_ca")?;
    }
    Ok(())
}

fn validate_trusted_authority(authority: &TrustedAuthoritySettings) -> Result<()> {
    if authority.domain.trim().is_empty() {
        anyhow::bail!("trusted_authorities.domain must not be empty");
    }
    if authority.certificate_path.as_os_str().is_empty() {
        anyhow::bail!("trusted_authorities.certificate_path must not be empty");
    }
    Ok(())
}

fn validate_ca_files(files: &CaFiles, label: &str) -> Result<()> {
    if files.key_path.as_os_str().is_empty() {
        anyhow::bail!("{label}.key_path must not be empty");
    }
    if files.cert_path.as_os_str().is_empty() {
        anyhow::bail!("{label}.cert_path must not be empty");
    }
    Ok(())
}
