pub mod auth_server;
pub mod authority;
pub mod config;
pub mod error;
pub mod file_backend;
pub mod fs_util;
pub mod init;
pub mod keys;
pub mod memory;
pub mod secret;
pub mod services;

pub use auth_server::AuthServer;
pub use error::{BootstrapError, ErrorKind, Result};
pub use init::{InitConfig, InitOutcome, init};
pub use keys::NodeSigner;
