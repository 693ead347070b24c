//! A listener's shared state and its accept loop.

use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::access::IpFilter;
use crate::address::AddressList;
use crate::connection::{Connection, Report};
use crate::endpoint::{Endpoint, LocalPair};
use crate::error::{Error, Result};
use crate::keycache::{EcdsaKeys, KeyCache};
use crate::options::{Role, ServiceOptions};
use crate::stats::ConnectionStats;
use crate::tls::TlsContext;
use crate::trust::TrustPolicy;

/// Everything the connections of one listener share. Read-only once built,
/// apart from the address cursor, the session cache and the counters.
pub struct Service {
    options: ServiceOptions,
    addresses: AddressList,
    tls: TlsContext,
    policy: Arc<TrustPolicy>,
    filter: IpFilter,
    check_host: Option<String>,
    stats: ConnectionStats,
}

impl Service {
    /// Resolve addresses, load trust material and build the TLS context.
    pub async fn build(options: ServiceOptions, keys: Arc<KeyCache<EcdsaKeys>>) -> Result<Self> {
        if options.role == Role::Server && options.protocol.is_some() {
            return Err(Error::Config(format!(
                "{}: protocol negotiation is supported in client mode only",
                options.name
            )));
        }

        let filter = IpFilter::from_strings(&options.allow, &options.deny)?;
        let addresses = AddressList::resolve(&options.connect, options.delayed_lookup).await?;
        let policy = Arc::new(TrustPolicy::load(&options.trust)?);

        // without an explicit name the peer must carry the first remote host
        let check_host = options
            .trust
            .check_host
            .clone()
            .or_else(|| addresses.first_host());

        let tls = TlsContext::build(&options, Arc::clone(&policy), &keys, check_host.as_deref())?;
        debug!(
            "{}: {:?} role, {} remote target(s){}",
            options.name,
            options.role,
            options.connect.len(),
            if addresses.is_deferred() { ", delayed lookup" } else { "" }
        );

        Ok(Self {
            options,
            addresses,
            tls,
            policy,
            filter,
            check_host,
            stats: ConnectionStats::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    pub fn options(&self) -> &ServiceOptions {
        &self.options
    }

    pub fn addresses(&self) -> &AddressList {
        &self.addresses
    }

    pub fn tls_context(&self) -> &TlsContext {
        &self.tls
    }

    pub fn policy(&self) -> &TrustPolicy {
        &self.policy
    }

    pub fn filter(&self) -> &IpFilter {
        &self.filter
    }

    /// Host name the peer certificate is checked against.
    pub fn check_host(&self) -> Option<&str> {
        self.check_host.as_deref()
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Accept connections until the listener fails for good. Each one runs in
    /// its own task.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!("{} accepting on {}", self.name(), listener.local_addr()?);
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!("{} accepted connection from {}", self.name(), peer);
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("TCP_NODELAY on local: {}", e);
                    }
                    let service = Arc::clone(&self);
                    tokio::spawn(async move {
                        service.handle(LocalPair::duplex(Endpoint::new(stream))).await;
                    });
                }
                Err(e) => {
                    // out of descriptors and the like; back off instead of spinning
                    warn!("{} accept: {}", self.name(), e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Run one connection to completion.
    pub async fn handle(&self, local: LocalPair) -> Report {
        let guard = self.stats.open();
        debug!("{} started", self.name());

        let mut conn = Connection::new(local);
        let result = conn.run(self).await;
        let report = conn.finish(result, &guard);

        drop(guard);
        debug!("{} finished ({} left)", self.name(), self.stats.active());
        report
    }
}
