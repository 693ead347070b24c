//! Remote address list with round-robin rotation.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::net::lookup_host;
use tracing::{debug, warn};

use crate::error::{Error, Result};

#[derive(Debug)]
enum Targets {
    Resolved(Vec<SocketAddr>),
    /// Names resolved again on every connection.
    Deferred(Vec<String>),
}

/// Remote targets of one listener plus the rotation cursor shared by its connections.
#[derive(Debug)]
pub struct AddressList {
    /// Targets as configured, before resolution.
    names: Vec<String>,
    targets: Targets,
    /// Advanced with relaxed ordering and no lock. Two connections racing here may
    /// pick the same start or skip one; neither breaks the list.
    cursor: AtomicUsize,
}

/// Expand a bare port to the loopback host.
pub fn normalize(target: &str) -> String {
    let target = target.trim();
    if !target.is_empty() && target.chars().all(|c| c.is_ascii_digit()) {
        format!("127.0.0.1:{}", target)
    } else {
        target.to_string()
    }
}

/// Host part of a `host:port` target, without IPv6 brackets.
pub fn host_of(target: &str) -> Option<String> {
    let target = normalize(target);
    let (host, port) = target.rsplit_once(':')?;
    if port.parse::<u16>().is_err() {
        return None;
    }
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}

impl AddressList {
    pub fn from_addrs(addrs: Vec<SocketAddr>) -> Self {
        Self {
            names: addrs.iter().map(|a| a.to_string()).collect(),
            targets: Targets::Resolved(addrs),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Build the list from `host:port` entries, resolving now unless `deferred`.
    pub async fn resolve(configured: &[String], deferred: bool) -> Result<Self> {
        let names: Vec<String> = configured.iter().map(|s| normalize(s)).collect();
        for name in &names {
            if host_of(name).is_none() {
                return Err(Error::Config(format!("Invalid remote address '{}'", name)));
            }
        }
        if names.is_empty() {
            return Err(Error::Config("No remote address".into()));
        }

        let targets = if deferred {
            Targets::Deferred(names.clone())
        } else {
            let addrs = resolve_all(&names).await;
            if addrs.is_empty() {
                return Err(Error::Setup(format!("No host resolved for {}", names.join(", "))));
            }
            Targets::Resolved(addrs)
        };

        Ok(Self {
            names,
            targets,
            cursor: AtomicUsize::new(0),
        })
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self.targets, Targets::Deferred(_))
    }

    /// Host name of the first configured target, used as the default peer identity.
    pub fn first_host(&self) -> Option<String> {
        self.names.first().and_then(|n| host_of(n))
    }

    /// Next rotation start for a list of `len` entries.
    fn next_start(&self, len: usize) -> usize {
        self.cursor.fetch_add(1, Ordering::Relaxed) % len
    }

    /// Addresses to try for one connection, starting at the rotation cursor and wrapping.
    pub async fn candidates(&self) -> Result<Vec<SocketAddr>> {
        let mut addrs = match &self.targets {
            Targets::Resolved(addrs) => addrs.clone(),
            Targets::Deferred(names) => resolve_all(names).await,
        };
        if addrs.is_empty() {
            return Err(Error::Setup("No remote host resolved".into()));
        }
        let start = self.next_start(addrs.len());
        addrs.rotate_left(start);
        Ok(addrs)
    }
}

async fn resolve_all(names: &[String]) -> Vec<SocketAddr> {
    let mut addrs = Vec::new();
    for name in names {
        match lookup_host(name.as_str()).await {
            Ok(found) => {
                let before = addrs.len();
                addrs.extend(found);
                debug!("{} resolved to {} address(es)", name, addrs.len() - before);
            }
            Err(e) => warn!("Error resolving '{}': {}", name, e),
        }
    }
    addrs
}
