use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use certboot::authority::{CaKind, LocalAuthority};
use certboot::config::Settings;
use certboot::file_backend::FileBackend;
use certboot::{InitOutcome, init, keys};
use clap::Parser;
use serde::Serialize;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (default: certboot.toml)
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Cluster domain (overrides config)
    #[arg(long)]
    domain: Option<String>,

    /// Data directory (overrides config)
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct InitSummary {
    domain: String,
    node: String,
    data_dir: PathBuf,
    first_start: bool,
    host_ca_fingerprint: String,
    user_ca_fingerprint: String,
    node_key_path: PathBuf,
    node_cert_path: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let settings = load_settings(&args)?;
    let data_dir = settings.data_dir.clone();
    info!("Bootstrapping cluster identity for {}", settings.domain);

    let backend = Arc::new(FileBackend::new(&data_dir));
    let cfg = settings.into_init_config(backend, Arc::new(LocalAuthority))?;
    let outcome = match init(cfg).await {
        Ok(outcome) => outcome,
        Err(err) => {
            error!("Bootstrap failed: {err}");
            std::process::exit(1);
        }
    };

    let summary = summarize(&outcome, data_dir).await?;
    println!(
        "{}",
        serde_json::to_string_pretty(&summary).context("Failed to serialize summary")?
    );
    Ok(())
}

fn load_settings(args: &Args) -> anyhow::Result<Settings> {
    let mut settings = Settings::new(args.config.clone())?;
    if let Some(domain) = &args.domain {
        domain.clone_into(&mut settings.domain);
    }
    if let Some(data_dir) = &args.data_dir {
        data_dir.clone_into(&mut settings.data_dir);
    }
    settings.validate()?;
    Ok(settings)
}

async fn summarize(outcome: &InitOutcome, data_dir: PathBuf) -> anyhow::Result<InitSummary> {
    let auth = &outcome.auth_server;
    let host_ca = auth.get_ca_public(CaKind::Host).await?;
    let user_ca = auth.get_ca_public(CaKind::User).await?;
    let node = outcome.signer.principal().to_string();
    let (node_key_path, node_cert_path) = keys::keys_path(&node, &data_dir);
    Ok(InitSummary {
        domain: auth.domain().to_string(),
        node,
        first_start: outcome.first_start,
        host_ca_fingerprint: certboot::authority::certificate_fingerprint(&host_ca)?,
        user_ca_fingerprint: certboot::authority::certificate_fingerprint(&user_ca)?,
        node_key_path,
        node_cert_path,
        data_dir,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides_settings() {
        let args = Args::parse_from([
            "certboot",
            "--config",
            "/nonexistent/certboot.toml",
            "--domain",
            "example.com",
            "--data-dir",
            "/tmp/certboot-data",
        ]);
        let settings = load_settings(&args).unwrap();
        assert_eq!(settings.domain, "example.com");
        assert_eq!(settings.data_dir, PathBuf::from("/tmp/certboot-data"));
    }

    #[test]
    fn test_missing_domain_is_rejected() {
        let args = Args::parse_from(["certboot", "--config", "/nonexistent/certboot.toml"]);
        let err = load_settings(&args).unwrap_err();
        assert!(err.to_string().contains("domain must not be empty"));
    }
}
