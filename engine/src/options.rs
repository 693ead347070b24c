//! Static per-service options.
//!
//! Built by the binary from its configuration file and shared read-only by
//! every connection of one listener.

use serde::Deserialize;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Which side of the tunnel speaks TLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// TLS is accepted from the local side, plaintext goes to the remote.
    Server,
    /// Plaintext is accepted locally, TLS is originated to the remote.
    Client,
}

/// Peer certificate verification strictness, ordered from weakest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifyLevel {
    /// No certificate is requested or checked.
    None,
    /// Certificates are requested, every verdict is logged and ignored.
    Ignore,
    /// A presented certificate must verify; absence is tolerated.
    Optional,
    /// A certificate must be presented and verify; hostname is checked after the handshake.
    Require,
}

/// Application protocol spoken before the TLS handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Smtp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum TlsVersion {
    #[serde(rename = "1.2")]
    Tls12,
    #[serde(rename = "1.3")]
    Tls13,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Bound on each readiness wait while a handshake or negotiation is in flight.
    pub busy: Duration,
    /// Transfer wait once one direction has finished.
    pub close: Duration,
    /// Remote connect attempt.
    pub connect: Duration,
    /// Transfer wait while both directions are open or data is buffered.
    pub idle: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            busy: Duration::from_secs(300),
            close: Duration::from_secs(60),
            connect: Duration::from_secs(10),
            idle: Duration::from_secs(43200),
        }
    }
}

/// Trust material and policy for peer certificates.
#[derive(Debug, Clone)]
pub struct TrustOptions {
    pub level: VerifyLevel,
    /// Accept the leaf only when its subject is one of the loaded CA certificates.
    pub only_trusted: bool,
    pub ca_file: Option<PathBuf>,
    pub ca_dir: Option<PathBuf>,
    pub crl_file: Option<PathBuf>,
    pub crl_dir: Option<PathBuf>,
    /// Name checked against the peer certificate; defaults to the first remote host.
    pub check_host: Option<String>,
}

impl Default for TrustOptions {
    fn default() -> Self {
        Self {
            level: VerifyLevel::None,
            only_trusted: false,
            ca_file: None,
            ca_dir: None,
            crl_file: None,
            crl_dir: None,
            check_host: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub name: String,
    pub role: Role,
    /// Remote targets as `host:port`, or a bare port for the loopback host.
    pub connect: Vec<String>,
    /// Resolve `connect` on every attempt instead of once at start-up.
    pub delayed_lookup: bool,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    /// Key size for the self-signed identity used when no `cert` is configured.
    pub ephemeral_key_bits: u32,
    pub trust: TrustOptions,
    pub protocol: Option<Protocol>,
    /// Source address bound before connecting to the remote.
    pub source: Option<IpAddr>,
    /// Connect to the remote from the client's own address.
    pub transparent: bool,
    /// Empty means the library defaults.
    pub tls_versions: Vec<TlsVersion>,
    /// Cipher suite names in preference order. Empty means the library defaults.
    pub ciphers: Vec<String>,
    /// Treat a TLS EOF without close_notify as an error.
    pub strict_close: bool,
    pub timeouts: Timeouts,
    pub allow: Vec<String>,
    pub deny: Vec<String>,
    /// Expected ident user name of the local peer.
    pub ident: Option<String>,
}

impl ServiceOptions {
    pub fn new(name: impl Into<String>, role: Role, connect: Vec<String>) -> Self {
        Self {
            name: name.into(),
            role,
            connect,
            delayed_lookup: false,
            cert: None,
            key: None,
            ephemeral_key_bits: 256,
            trust: TrustOptions::default(),
            protocol: None,
            source: None,
            transparent: false,
            tls_versions: Vec::new(),
            ciphers: Vec::new(),
            strict_close: false,
            timeouts: Timeouts::default(),
            allow: Vec::new(),
            deny: Vec::new(),
            ident: None,
        }
    }

    /// Server role without protocol negotiation: handshake before the remote connect.
    pub fn tls_first(&self) -> bool {
        self.role == Role::Server && self.protocol.is_none()
    }
}
