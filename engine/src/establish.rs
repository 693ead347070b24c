//! Session establishment: access checks, the remote connect and the TLS
//! handshake, in the order the listener's role requires.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::{TcpSocket, TcpStream};
use tracing::{debug, error, info, warn};

use crate::access::{ident_check, IpFilter};
use crate::address::AddressList;
use crate::connection::Connection;
use crate::endpoint::{wait_ready, Endpoint, LocalPair, Slot};
use crate::error::{Error, Result};
use crate::negotiate::negotiate;
use crate::options::Role;
use crate::service::Service;
use crate::tls::{HandshakeStep, TlsContext, TlsSession};
use crate::trust::{post_connection_check, TrustPolicy};

/// Address the remote socket is bound to before connecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceBind {
    Any,
    Address(IpAddr),
    /// The client's own address; needs IP_TRANSPARENT.
    Transparent(IpAddr),
}

/// Run the access oracles on the local side. Returns the peer address.
pub async fn init_local(
    local: &LocalPair,
    filter: &IpFilter,
    ident: Option<&str>,
    timeout: Duration,
) -> Result<Option<SocketAddr>> {
    let Some(peer) = local.rd.peer_addr() else {
        info!("Local endpoint: NOT A SOCKET, access checks skipped");
        return Ok(None);
    };

    if !filter.is_allowed(peer.ip()) {
        warn!("Connection from {} REFUSED by access rules", peer);
        return Err(Error::AccessDenied(peer.to_string()));
    }

    if let Some(user) = ident {
        let local_addr = local
            .rd
            .local_addr()
            .ok_or_else(|| Error::Setup("local address unavailable for ident".into()))?;
        ident_check(peer, local_addr, user, timeout).await?;
    }

    Ok(Some(peer))
}

fn new_socket(addr: SocketAddr) -> std::io::Result<TcpSocket> {
    match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }
}

#[cfg(target_os = "linux")]
fn set_transparent(socket: &TcpSocket) -> std::io::Result<()> {
    socket2::SockRef::from(socket).set_ip_transparent_v4(true)
}

#[cfg(not(target_os = "linux"))]
fn set_transparent(_socket: &TcpSocket) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "transparent proxy is only available on Linux",
    ))
}

/// A socket for `addr`, bound to the configured source.
fn bound_socket(addr: SocketAddr, source: SourceBind) -> Result<TcpSocket> {
    let socket = new_socket(addr)?;
    let bound = match source {
        SourceBind::Any => return Ok(socket),
        SourceBind::Address(ip) => socket.bind(SocketAddr::new(ip, 0)).map_err(|e| (ip, e)),
        SourceBind::Transparent(ip) => set_transparent(&socket)
            .and_then(|()| socket.bind(SocketAddr::new(ip, 0)))
            .map_err(|e| (ip, e)),
    };
    match bound {
        Ok(()) => Ok(socket),
        Err((ip, e)) => {
            error!("bind {}: {}", ip, e);
            Err(Error::Setup(format!("Cannot bind source address {}: {}", ip, e)))
        }
    }
}

async fn connect_one(socket: TcpSocket, addr: SocketAddr, limit: Duration) -> Result<TcpStream> {
    match tokio::time::timeout(limit, socket.connect(addr)).await {
        Ok(result) => Ok(result?),
        Err(_) => {
            warn!("connect to {}: timeout", addr);
            Err(Error::Timeout("connect"))
        }
    }
}

/// Connect to the next remote candidate, moving on to the following one
/// when an attempt is refused.
pub async fn connect_remote(
    addresses: &AddressList,
    source: SourceBind,
    limit: Duration,
) -> Result<TcpStream> {
    for addr in addresses.candidates().await? {
        debug!("{} connecting", addr);
        // a source that cannot be bound fails the connection, not just this candidate
        let socket = bound_socket(addr, source)?;
        match connect_one(socket, addr, limit).await {
            Ok(stream) => {
                info!("Remote {} connected", addr);
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("TCP_NODELAY on remote: {}", e);
                }
                return Ok(stream);
            }
            // a silent remote holds the connection for the whole timeout, give up
            Err(e @ Error::Timeout(_)) => return Err(e),
            Err(e) => warn!("remote connect ({}): {}", addr, e),
        }
    }
    Err(Error::Setup("No more addresses to connect".into()))
}

/// Drive the handshake to completion, then apply the hostname check.
pub async fn init_tls(
    ctx: &TlsContext,
    policy: &TrustPolicy,
    check_host: Option<&str>,
    rd: Endpoint,
    wr: Endpoint,
    busy: Duration,
) -> Result<TlsSession> {
    let mut session = ctx.session(rd, wr)?;
    loop {
        match session.handshake()? {
            HandshakeStep::Done => break,
            HandshakeStep::WantRead => {
                debug!("TLS handshake: waiting for read");
                wait_ready(session.read_endpoint().transport(), Slot::TlsRead, busy, "handshake")
                    .await?
            }
            HandshakeStep::WantWrite => {
                debug!("TLS handshake: waiting for write");
                wait_ready(session.write_endpoint().transport(), Slot::TlsWrite, busy, "handshake")
                    .await?
            }
        }
    }

    post_connection_check(policy.level(), check_host, session.peer_certificates())?;
    match session.resumed() {
        Some(true) => info!("TLS connected: previous session reused"),
        Some(false) => info!("TLS connected: new session negotiated"),
        None => info!("TLS accepted: session negotiated"),
    }
    info!("Negotiated {}", session.describe());
    if let Some(sessions) = ctx.sessions() {
        debug!("Session cache generation {}", sessions.generation());
    }
    Ok(session)
}

fn source_for(service: &Service, peer: Option<SocketAddr>) -> Result<SourceBind> {
    let opts = service.options();
    if opts.transparent {
        return match peer {
            Some(SocketAddr::V4(v4)) => Ok(SourceBind::Transparent(IpAddr::V4(*v4.ip()))),
            _ => Err(Error::Setup(
                "transparent proxy needs an IPv4 client address".into(),
            )),
        };
    }
    Ok(opts.source.map_or(SourceBind::Any, SourceBind::Address))
}

async fn handshake(service: &Service, rd: Endpoint, wr: Endpoint) -> Result<TlsSession> {
    let session = init_tls(
        service.tls_context(),
        service.policy(),
        service.check_host(),
        rd,
        wr,
        service.options().timeouts.busy,
    )
    .await?;
    if session.resumed() == Some(true) {
        service.stats().session_reused();
    }
    Ok(session)
}

/// Establish `conn` for `service`. A server role without negotiation
/// handshakes before the remote connect; every other listener connects
/// (and negotiates) first. Whatever was acquired stays in `conn` for cleanup.
pub async fn establish(service: &Service, conn: &mut Connection) -> Result<()> {
    let opts = service.options();
    let timeouts = &opts.timeouts;
    let local = conn.local.clone();

    conn.peer = init_local(&local, service.filter(), opts.ident.as_deref(), timeouts.connect).await?;
    let source = source_for(service, conn.peer)?;

    if opts.tls_first() {
        conn.tls = Some(handshake(service, local.rd.clone(), local.wr.clone()).await?);
        let stream = connect_remote(service.addresses(), source, timeouts.connect).await?;
        conn.remote = Some(Endpoint::new(stream));
        return Ok(());
    }

    let stream = connect_remote(service.addresses(), source, timeouts.connect).await?;
    let remote = Endpoint::new(stream);
    conn.remote = Some(remote.clone());
    if let Some(protocol) = opts.protocol {
        negotiate(protocol, opts.role, &local, &remote, timeouts.busy).await?;
    }
    let session = match opts.role {
        Role::Client => handshake(service, remote.clone(), remote).await?,
        Role::Server => handshake(service, local.rd.clone(), local.wr.clone()).await?,
    };
    conn.tls = Some(session);
    Ok(())
}
