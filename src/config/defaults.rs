use config::{ConfigBuilder, ConfigError, builder::DefaultState};

const DEFAULT_DOMAIN: &str = "";
const DEFAULT_HOSTNAME: &str = "";
const DEFAULT_DATA_DIR: &str = "/var/lib/certboot";
const DEFAULT_SECRET_KEY: &str = "";
const DEFAULT_LOCK_TIMEOUT: &str = "60s";

pub(crate) fn apply_defaults(
    builder: ConfigBuilder<DefaultState>,
) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    builder
        .set_default("domain", DEFAULT_DOMAIN)?
        .set_default("hostname", DEFAULT_HOSTNAME)?
        .set_default("data_dir", DEFAULT_DATA_DIR)?
        .set_default("secret_key", DEFAULT_SECRET_KEY)?
        .set_default("lock_timeout", DEFAULT_LOCK_TIMEOUT)
}
