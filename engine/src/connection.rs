//! One tunneled connection and its single cleanup point.

use std::fmt;
use std::net::SocketAddr;
use tracing::{debug, error, info, warn};

use crate::endpoint::{Endpoint, LocalPair};
use crate::error::{Error, ErrorKind, Result};
use crate::establish::establish;
use crate::options::Role;
use crate::service::Service;
use crate::stats::ConnectionGuard;
use crate::tls::TlsSession;
use crate::transfer::{transfer, Counters};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Closed,
    Reset,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Closed => write!(f, "closed"),
            Outcome::Reset => write!(f, "reset"),
        }
    }
}

/// Final record of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Report {
    pub outcome: Outcome,
    /// Plaintext bytes handed to TLS.
    pub to_tls: u64,
    /// Decrypted bytes written to the plaintext side.
    pub to_plain: u64,
    /// Class of the failure behind a reset.
    pub error: Option<ErrorKind>,
}

/// Resources of one connection. Everything acquired during establishment
/// lands here so [`Connection::finish`] can release it.
pub struct Connection {
    pub(crate) local: LocalPair,
    pub(crate) remote: Option<Endpoint>,
    pub(crate) tls: Option<TlsSession>,
    pub(crate) peer: Option<SocketAddr>,
    counters: Counters,
}

impl Connection {
    pub fn new(local: LocalPair) -> Self {
        Self {
            local,
            remote: None,
            tls: None,
            peer: None,
            counters: Counters::default(),
        }
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Establish both sides, then relay until the tunnel is finished.
    pub async fn run(&mut self, service: &Service) -> Result<()> {
        establish(service, self).await?;

        let opts = service.options();
        let (Some(remote), Some(tls)) = (self.remote.clone(), self.tls.as_mut()) else {
            return Err(Error::Internal("connection established without both sides".into()));
        };
        // the plaintext side is whichever side TLS is not on
        let plain = match opts.role {
            Role::Client => self.local.clone(),
            Role::Server => LocalPair::duplex(remote),
        };
        transfer(&plain, tls, &opts.timeouts, opts.strict_close, &mut self.counters).await
    }

    /// Release every resource of the connection and emit its terminal log line.
    /// On failure the sockets are reset instead of closed gracefully.
    pub fn finish(self, result: Result<()>, guard: &ConnectionGuard) -> Report {
        let error = match &result {
            Ok(()) => None,
            Err(e) => {
                match e.kind() {
                    ErrorKind::Internal => error!("{}", e),
                    ErrorKind::Setup => warn!("{}", e),
                    ErrorKind::Transport | ErrorKind::Protocol => info!("{}", e),
                }
                self.local.rd.reset("local");
                if self.local.is_split() {
                    self.local.wr.reset("local write");
                }
                if let Some(remote) = &self.remote {
                    remote.reset("remote");
                }
                Some(e.kind())
            }
        };

        let outcome = if error.is_none() {
            Outcome::Closed
        } else {
            Outcome::Reset
        };
        let Counters { to_tls, to_plain } = self.counters;
        guard.record(outcome == Outcome::Closed, to_tls, to_plain);
        info!(
            "Connection {}: {} bytes sent to TLS, {} bytes sent to socket",
            outcome, to_tls, to_plain
        );

        if let Some(peer) = self.peer {
            debug!("Releasing connection from {}", peer);
        }
        Report {
            outcome,
            to_tls,
            to_plain,
            error,
        }
    }
}
