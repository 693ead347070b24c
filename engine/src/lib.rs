//! tlstun engine
//!
//! Per-connection TLS tunnel: session establishment, the full-duplex
//! transfer loop and the certificate trust decisions behind the handshake.

pub mod access;
pub mod address;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod establish;
pub mod keycache;
pub mod negotiate;
pub mod options;
pub mod service;
pub mod session_cache;
pub mod stats;
pub mod tls;
pub mod transfer;
pub mod trust;

pub use error::{Error, ErrorKind, Result};
pub use options::{Protocol, Role, ServiceOptions, Timeouts, TlsVersion, TrustOptions, VerifyLevel};
pub use service::Service;
