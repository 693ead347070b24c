//! Access control consulted before a connection is set up.
//!
//! CIDR allow/deny rules on the peer address, and an ident (RFC 1413) query
//! for the user name behind the peer's port.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpSocket;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// IP filter for a service
#[derive(Debug, Clone, Default)]
pub struct IpFilter {
    /// Allowed CIDR ranges (empty = allow all)
    pub allow: Vec<CidrRange>,
    /// Denied CIDR ranges
    pub deny: Vec<CidrRange>,
}

/// A parsed CIDR range, IPv4 or IPv6
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CidrRange {
    network: IpAddr,
    prefix: u8,
    pub raw: String,
}

fn prefix_mask(prefix: u8, width: u8) -> u128 {
    if prefix == 0 {
        0
    } else {
        (!0u128 << (width - prefix)) & (!0u128 >> (128 - width as u32))
    }
}

fn bits(ip: IpAddr) -> (u128, u8) {
    match ip {
        IpAddr::V4(v4) => (u32::from(v4) as u128, 32),
        IpAddr::V6(v6) => (u128::from(v6), 128),
    }
}

impl CidrRange {
    /// Parse "192.168.1.0/24" or "fd00::/8". A bare address is a single host.
    pub fn parse(cidr: &str) -> Option<Self> {
        let (addr, prefix) = match cidr.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (cidr, None),
        };

        let ip: IpAddr = addr.trim().parse().ok()?;
        let (_, width) = bits(ip);
        let prefix = match prefix {
            Some(p) => p.trim().parse::<u8>().ok()?,
            None => width,
        };
        if prefix > width {
            return None;
        }

        Some(CidrRange {
            network: ip,
            prefix,
            raw: cidr.to_string(),
        })
    }

    /// Check if an IP address is within this CIDR range. IPv4-mapped IPv6
    /// addresses match IPv4 ranges.
    pub fn contains(&self, ip: IpAddr) -> bool {
        let ip = match ip {
            IpAddr::V6(v6) if self.network.is_ipv4() => match v6.to_ipv4_mapped() {
                Some(v4) => IpAddr::V4(v4),
                None => return false,
            },
            other => other,
        };
        if ip.is_ipv4() != self.network.is_ipv4() {
            return false;
        }

        let (net, width) = bits(self.network);
        let (addr, _) = bits(ip);
        let mask = prefix_mask(self.prefix, width);
        (addr & mask) == (net & mask)
    }
}

impl IpFilter {
    /// Build a filter from string lists, rejecting malformed entries.
    pub fn from_strings(allow: &[String], deny: &[String]) -> Result<Self> {
        let parse = |list: &[String]| {
            list.iter()
                .map(|s| {
                    CidrRange::parse(s)
                        .ok_or_else(|| Error::Config(format!("Invalid CIDR range '{}'", s)))
                })
                .collect::<Result<Vec<_>>>()
        };
        Ok(Self {
            allow: parse(allow)?,
            deny: parse(deny)?,
        })
    }

    /// Check if an IP is allowed through this filter
    pub fn is_allowed(&self, ip: IpAddr) -> bool {
        if self.deny.iter().any(|cidr| cidr.contains(ip)) {
            return false;
        }
        self.allow.is_empty() || self.allow.iter().any(|cidr| cidr.contains(ip))
    }

    /// Returns true if this filter has no rules (allows everything)
    pub fn is_empty(&self) -> bool {
        self.allow.is_empty() && self.deny.is_empty()
    }
}

/// Parsed ident response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentReply {
    User { os: String, user: String },
    Error(String),
}

/// Parse `"<port> , <port> : USERID : <os> : <user>"` or
/// `"<port> , <port> : ERROR : <reason>"`.
pub fn parse_ident_reply(line: &str) -> Option<IdentReply> {
    let mut fields = line.trim_end_matches(|c| c == '\r' || c == '\n').splitn(4, ':');
    let _ports = fields.next()?;
    let kind = fields.next()?.trim();
    match kind.to_ascii_uppercase().as_str() {
        "USERID" => {
            let os = fields.next()?.trim().to_string();
            let user = fields.next()?.trim().to_string();
            if user.is_empty() {
                return None;
            }
            Some(IdentReply::User { os, user })
        }
        "ERROR" => Some(IdentReply::Error(
            fields.next().unwrap_or_default().trim().to_string(),
        )),
        _ => None,
    }
}

const IDENT_PORT: u16 = 113;

/// Ask the peer's ident service who owns the connection from `peer` to `local`
/// and require the answer to be `expected`.
pub async fn ident_check(
    peer: SocketAddr,
    local: SocketAddr,
    expected: &str,
    timeout: Duration,
) -> Result<()> {
    query_ident(SocketAddr::new(peer.ip(), IDENT_PORT), peer, local, expected, timeout).await
}

async fn query_ident(
    server: SocketAddr,
    peer: SocketAddr,
    local: SocketAddr,
    expected: &str,
    timeout: Duration,
) -> Result<()> {
    let deny = |reason: String| {
        warn!("IDENT failed for {}: {}", peer, reason);
        Error::AccessDenied(format!("ident: {}", reason))
    };

    let socket = match peer {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.bind(SocketAddr::new(local.ip(), 0))?;

    let stream = tokio::time::timeout(timeout, socket.connect(server))
        .await
        .map_err(|_| deny("connect timeout".into()))?
        .map_err(|e| deny(format!("connect: {}", e)))?;
    debug!("IDENT server connected");

    let (rd, mut wr) = stream.into_split();
    let query = format!("{} , {}\r\n", peer.port(), local.port());
    let exchange = async {
        wr.write_all(query.as_bytes()).await?;
        let mut line = String::new();
        BufReader::new(rd).read_line(&mut line).await?;
        Ok::<_, std::io::Error>(line)
    };
    let line = tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| deny("response timeout".into()))?
        .map_err(|e| deny(format!("exchange: {}", e)))?;

    match parse_ident_reply(&line) {
        Some(IdentReply::User { user, .. }) if user == expected => {
            info!("IDENT authentication passed");
            Ok(())
        }
        Some(IdentReply::User { user, .. }) => Err(deny(format!("user '{}' is not '{}'", user, expected))),
        Some(IdentReply::Error(reason)) => Err(deny(format!("server error: {}", reason))),
        None => Err(deny(format!("malformed reply '{}'", line.trim_end()))),
    }
}
