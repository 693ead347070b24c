//! Error types for the tunnel engine.

use thiserror::Error;

use crate::trust::TrustError;

pub type Result<T> = std::result::Result<T, Error>;

/// Diagnostic class of a connection failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Address exhaustion, unusable local endpoint, access denial, bad configuration.
    Setup,
    /// Unrecoverable socket errors and readiness timeouts.
    Transport,
    /// Handshake, certificate and application protocol failures.
    Protocol,
    /// Invariant violations inside the engine itself.
    Internal,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Setup error: {0}")]
    Setup(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("Verification failed: {0}")]
    Verification(#[from] TrustError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Timeout: {0}")]
    Timeout(&'static str),

    #[error("INTERNAL ERROR: {0}")]
    Internal(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Setup(_) | Error::AccessDenied(_) | Error::Config(_) => ErrorKind::Setup,
            Error::Io(_) | Error::Timeout(_) => ErrorKind::Transport,
            Error::Tls(_) | Error::Verification(_) | Error::Protocol(_) => ErrorKind::Protocol,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }
}
