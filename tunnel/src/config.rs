//! Configuration file parser for tlstun
//!
//! A tlstun.yml holds one entry per listening service.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tlstun_engine::{Protocol, Role, ServiceOptions, Timeouts, TlsVersion, TrustOptions, VerifyLevel};

/// Root configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TlstunConfig {
    /// Service definitions
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

/// Single service definition
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Name used in logs and as the ephemeral certificate subject
    pub name: String,

    /// Listen address, `host:port` or a bare port on all interfaces
    pub accept: String,

    /// Remote targets, `host:port` or a bare port on the loopback host
    #[serde(default)]
    pub connect: Vec<String>,

    /// Originate TLS towards `connect` instead of terminating it
    #[serde(default)]
    pub client: bool,

    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,

    pub ca_file: Option<PathBuf>,
    pub ca_dir: Option<PathBuf>,
    pub crl_file: Option<PathBuf>,
    pub crl_dir: Option<PathBuf>,

    /// Peer certificate verification: none, ignore, optional or require
    #[serde(default = "default_verify")]
    pub verify: VerifyLevel,

    /// Accept only peer certificates present in the CA material
    #[serde(default)]
    pub verify_only_trusted: bool,

    /// Name the peer certificate must carry (client default: first connect host)
    pub check_host: Option<String>,

    /// Plaintext protocol spoken before TLS
    pub protocol: Option<Protocol>,

    /// Source address for remote connections
    pub local: Option<IpAddr>,

    /// Connect to the remote from the client's address
    #[serde(default)]
    pub transparent: bool,

    /// Resolve `connect` on every connection
    #[serde(default)]
    pub delayed_lookup: bool,

    /// Allowed TLS versions, "1.2" and/or "1.3" (empty = both)
    #[serde(default)]
    pub tls_versions: Vec<TlsVersion>,

    /// Cipher suites in preference order, e.g. TLS13_AES_256_GCM_SHA384 (empty = defaults)
    #[serde(default)]
    pub ciphers: Vec<String>,

    /// Reset instead of close when the peer drops TLS without close_notify
    #[serde(default)]
    pub strict_close: bool,

    /// Required ident user of the connecting client
    pub ident: Option<String>,

    /// Allowed CIDR ranges (empty = allow all)
    #[serde(default)]
    pub allow: Vec<String>,

    /// Denied CIDR ranges
    #[serde(default)]
    pub deny: Vec<String>,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Key size of the self-signed identity used without `cert`
    #[serde(default = "default_key_bits")]
    pub ephemeral_key_bits: u32,
}

/// Timeouts in seconds
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_busy")]
    pub busy: u64,
    #[serde(default = "default_close")]
    pub close: u64,
    #[serde(default = "default_connect")]
    pub connect: u64,
    #[serde(default = "default_idle")]
    pub idle: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            busy: default_busy(),
            close: default_close(),
            connect: default_connect(),
            idle: default_idle(),
        }
    }
}

fn default_verify() -> VerifyLevel {
    VerifyLevel::None
}

fn default_key_bits() -> u32 {
    256
}

fn default_busy() -> u64 {
    300
}

fn default_close() -> u64 {
    60
}

fn default_connect() -> u64 {
    10
}

fn default_idle() -> u64 {
    43200
}

impl ServiceConfig {
    pub fn role(&self) -> Role {
        if self.client {
            Role::Client
        } else {
            Role::Server
        }
    }

    /// Listen address; a bare port listens on every interface.
    pub fn accept_addr(&self) -> Result<SocketAddr> {
        let accept = self.accept.trim();
        if let Ok(port) = accept.parse::<u16>() {
            return Ok(SocketAddr::from(([0, 0, 0, 0], port)));
        }
        accept
            .parse()
            .with_context(|| format!("Invalid accept address '{}' for service '{}'", accept, self.name))
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            anyhow::bail!("Service name cannot be empty");
        }
        self.accept_addr()?;
        if self.connect.is_empty() {
            anyhow::bail!("No connect address for service '{}'", self.name);
        }

        match (&self.cert, &self.key) {
            (Some(_), None) | (None, Some(_)) => {
                anyhow::bail!("Service '{}': cert and key must be set together", self.name)
            }
            (None, None) if !self.client => {
                if !matches!(self.ephemeral_key_bits, 256 | 384) {
                    anyhow::bail!(
                        "Service '{}' has no cert and ephemeral_key_bits {} is not 256 or 384",
                        self.name,
                        self.ephemeral_key_bits
                    );
                }
            }
            _ => {}
        }

        if self.verify >= VerifyLevel::Require && self.ca_file.is_none() && self.ca_dir.is_none() {
            anyhow::bail!(
                "Service '{}': verify require needs ca_file or ca_dir",
                self.name
            );
        }
        if self.protocol.is_some() && !self.client {
            anyhow::bail!(
                "Service '{}': protocol negotiation is supported in client mode only",
                self.name
            );
        }
        for name in &self.ciphers {
            tlstun_engine::tls::cipher_suite(name)
                .with_context(|| format!("Service '{}': invalid ciphers", self.name))?;
        }
        if self.transparent && self.local.is_some() {
            anyhow::bail!("Service '{}': transparent and local are exclusive", self.name);
        }
        Ok(())
    }

    /// Engine options for this service.
    pub fn to_options(&self) -> ServiceOptions {
        let mut opts = ServiceOptions::new(self.name.clone(), self.role(), self.connect.clone());
        opts.delayed_lookup = self.delayed_lookup;
        opts.cert = self.cert.clone();
        opts.key = self.key.clone();
        opts.ephemeral_key_bits = self.ephemeral_key_bits;
        opts.trust = TrustOptions {
            level: self.verify,
            only_trusted: self.verify_only_trusted,
            ca_file: self.ca_file.clone(),
            ca_dir: self.ca_dir.clone(),
            crl_file: self.crl_file.clone(),
            crl_dir: self.crl_dir.clone(),
            check_host: self.check_host.clone(),
        };
        opts.protocol = self.protocol;
        opts.source = self.local;
        opts.transparent = self.transparent;
        opts.tls_versions = self.tls_versions.clone();
        opts.ciphers = self.ciphers.clone();
        opts.strict_close = self.strict_close;
        opts.timeouts = Timeouts {
            busy: Duration::from_secs(self.timeouts.busy),
            close: Duration::from_secs(self.timeouts.close),
            connect: Duration::from_secs(self.timeouts.connect),
            idle: Duration::from_secs(self.timeouts.idle),
        };
        opts.allow = self.allow.clone();
        opts.deny = self.deny.clone();
        opts.ident = self.ident.clone();
        opts
    }
}

impl TlstunConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: TlstunConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    fn validate(&self) -> Result<()> {
        if self.services.is_empty() {
            anyhow::bail!("No services defined in configuration");
        }

        let mut names = HashSet::new();
        for service in &self.services {
            service.validate()?;
            if !names.insert(service.name.as_str()) {
                anyhow::bail!("Duplicate service name '{}'", service.name);
            }
        }

        Ok(())
    }

    /// Search for config file in standard locations
    pub fn find_config() -> Option<PathBuf> {
        let candidates = ["tlstun.yml", "tlstun.yaml", ".tlstun.yml", ".tlstun.yaml"];

        // Check current directory
        for name in &candidates {
            let path = PathBuf::from(name);
            if path.exists() {
                return Some(path);
            }
        }

        // Check home directory
        if let Some(home) = dirs::home_dir() {
            for name in &candidates {
                let path = home.join(name);
                if path.exists() {
                    return Some(path);
                }
            }
        }

        None
    }
}
