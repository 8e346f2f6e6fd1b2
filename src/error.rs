//! Bootstrap error types.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result type for bootstrap operations.
pub type Result<T> = std::result::Result<T, BootstrapError>;

/// Coarse classification of a [`BootstrapError`], stable across context wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    NotFound,
    LockTimeout,
    Io,
    Crypto,
    Backend,
}

/// Errors that can occur while bootstrapping cluster identity.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// A required setting is missing or invalid.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Expected absence of a record or file.
    #[error("not found: {0}")]
    NotFound(String),

    /// The cluster lock was not acquired in time.
    #[error("timed out after {timeout:?} waiting for lock {name:?}")]
    LockTimeout {
        /// Lock name.
        name: String,
        /// Bound that was exceeded.
        timeout: Duration,
    },

    /// Filesystem failure.
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        /// Path involved in the failed operation.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Key or certificate generation, parsing or sealing failure.
    #[error("cryptographic error: {0}")]
    Crypto(String),

    /// Failure reported by a storage collaborator.
    #[error("backend error: {0}")]
    Backend(String),

    /// Another error with the step that produced it.
    #[error("{context}: {source}")]
    Context {
        /// Description of the failing step.
        context: String,
        /// Wrapped error.
        #[source]
        source: Box<BootstrapError>,
    },
}

impl BootstrapError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn crypto(err: impl std::fmt::Display) -> Self {
        Self::Crypto(err.to_string())
    }

    /// Wraps the error with a description of the failing step.
    #[must_use]
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Classifies the error, looking through context wrappers.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::LockTimeout { .. } => ErrorKind::LockTimeout,
            Self::Io { .. } => ErrorKind::Io,
            Self::Crypto(_) => ErrorKind::Crypto,
            Self::Backend(_) => ErrorKind::Backend,
            Self::Context { source, .. } => source.kind(),
        }
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

impl From<rcgen::Error> for BootstrapError {
    fn from(err: rcgen::Error) -> Self {
        Self::crypto(err)
    }
}

/// Adds step context to fallible results.
pub trait ResultExt<T> {
    /// Wraps the error, if any, with `context`.
    ///
    /// # Errors
    /// Returns the underlying error wrapped in [`BootstrapError::Context`].
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Like [`ResultExt::context`], but builds the message lazily.
    ///
    /// # Errors
    /// Returns the underlying error wrapped in [`BootstrapError::Context`].
    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|err| err.context(context))
    }

    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C,
    {
        self.map_err(|err| err.context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_looks_through_context() {
        let err = BootstrapError::NotFound("host CA".to_string())
            .context("probe host CA")
            .context("bootstrap");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "bootstrap: probe host CA: not found: host CA");
    }

    #[test]
    fn lock_timeout_message_names_lock() {
        let err = BootstrapError::LockTimeout {
            name: "example.com".to_string(),
            timeout: Duration::from_secs(60),
        };
        assert_eq!(err.kind(), ErrorKind::LockTimeout);
        assert!(err.to_string().contains("\"example.com\""));
    }

    #[test]
    fn result_ext_wraps_errors_only() {
        let ok: Result<u8> = Ok(1);
        assert_eq!(ok.context("unused").unwrap(), 1);

        let err: Result<u8> = Err(BootstrapError::Backend("down".to_string()));
        let wrapped = err.with_context(|| "upsert token").unwrap_err();
        assert_eq!(wrapped.kind(), ErrorKind::Backend);
        assert_eq!(wrapped.to_string(), "upsert token: backend error: down");
    }
}
