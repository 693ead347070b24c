//! rustls sessions driven over non-blocking transports.
//!
//! [`TlsSession`] exposes the handshake, read, write and shutdown steps the
//! way the transfer loop needs them: every step returns immediately and
//! reports what the underlying transport must become ready for.

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{
    ClientConfig, ClientConnection, Connection, ProtocolVersion, ServerConfig, ServerConnection,
    SupportedCipherSuite,
};
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::net::Shutdown;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::endpoint::{is_transient, Endpoint, Transport};
use crate::error::{Error, Result};
use crate::keycache::{EcdsaKeys, EphemeralCertResolver, KeyCache};
use crate::options::{Role, ServiceOptions, TlsVersion};
use crate::session_cache::ResumptionCache;
use crate::trust::verifier::{ClientCertCheck, ServerCertCheck, SessionCertCheck};
use crate::trust::TrustPolicy;

/// Load every PEM certificate in `path`.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| Error::Config(format!("Cannot open {}: {}", path.display(), e)))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<io::Result<Vec<_>>>()
        .map_err(|e| Error::Config(format!("Cannot parse {}: {}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(Error::Config(format!("No certificate found in {}", path.display())));
    }
    Ok(certs)
}

/// Load the first PEM private key in `path`.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| Error::Config(format!("Cannot open {}: {}", path.display(), e)))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(meta) = file.metadata() {
            if meta.permissions().mode() & 0o077 != 0 {
                warn!("Wrong permissions on {}", path.display());
            }
        }
    }

    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| Error::Config(format!("Cannot parse {}: {}", path.display(), e)))?
        .ok_or_else(|| Error::Config(format!("No private key found in {}", path.display())))
}

struct ReadHalf<'a>(&'a dyn Transport);

impl Read for ReadHalf<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.try_read(buf)
    }
}

struct WriteHalf<'a>(&'a dyn Transport);

impl Write for WriteHalf<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.try_write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStep {
    Done,
    WantRead,
    WantWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsRead {
    Data(usize),
    WantRead,
    WantWrite,
    /// close_notify received and all data before it consumed.
    Closed,
    /// Transport EOF without close_notify.
    Eof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsWrite {
    Written(usize),
    WantRead,
    WantWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownStep {
    /// close_notify flushed and the peer's close_notify already received.
    Complete,
    /// close_notify queued or sent, the peer has not closed yet.
    InProgress,
}

/// One TLS connection over a read half and a write half, which may be the
/// same transport.
pub struct TlsSession {
    conn: Connection,
    rd: Endpoint,
    wr: Endpoint,
    /// The last step stopped for lack of ciphertext.
    want_read: bool,
    close_sent: bool,
    close_received: bool,
    /// Client role only: sees whether the server certificate was checked.
    cert_check: Option<Arc<SessionCertCheck>>,
}

impl TlsSession {
    pub fn new(conn: impl Into<Connection>, rd: Endpoint, wr: Endpoint) -> Self {
        Self {
            conn: conn.into(),
            rd,
            wr,
            want_read: false,
            close_sent: false,
            close_received: false,
            cert_check: None,
        }
    }

    pub fn read_endpoint(&self) -> &Endpoint {
        &self.rd
    }

    pub fn write_endpoint(&self) -> &Endpoint {
        &self.wr
    }

    fn read_tls(&mut self) -> io::Result<usize> {
        let transport = self.rd.transport();
        self.conn.read_tls(&mut ReadHalf(transport))
    }

    fn process(&mut self) -> Result<()> {
        match self.conn.process_new_packets() {
            Ok(state) => {
                if state.peer_has_closed() {
                    self.close_received = true;
                }
                Ok(())
            }
            Err(e) => {
                // best effort: let the peer see the alert
                let transport = self.wr.transport();
                let _ = self.conn.write_tls(&mut WriteHalf(transport));
                Err(e.into())
            }
        }
    }

    /// Push queued records to the transport until it would block. Returns the
    /// number of bytes written.
    pub fn drain(&mut self) -> Result<usize> {
        let mut written = 0;
        while self.conn.wants_write() {
            let transport = self.wr.transport();
            match self.conn.write_tls(&mut WriteHalf(transport)) {
                Ok(0) => return Err(Error::Io(io::ErrorKind::WriteZero.into())),
                Ok(n) => written += n,
                Err(e) if is_transient(&e) => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(written)
    }

    /// Push queued records to the transport. `Ok(false)` means it would block.
    pub fn flush(&mut self) -> Result<bool> {
        self.drain()?;
        Ok(!self.conn.wants_write())
    }

    /// One non-blocking handshake step.
    pub fn handshake(&mut self) -> Result<HandshakeStep> {
        self.want_read = false;
        loop {
            if !self.flush()? {
                return Ok(HandshakeStep::WantWrite);
            }
            if !self.conn.is_handshaking() {
                return Ok(HandshakeStep::Done);
            }
            match self.read_tls() {
                Ok(0) => {
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed connection during handshake",
                    )))
                }
                Ok(_) => self.process()?,
                Err(e) if is_transient(&e) => {
                    self.want_read = true;
                    return Ok(HandshakeStep::WantRead);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<TlsRead> {
        self.want_read = false;
        if buf.is_empty() {
            return Ok(TlsRead::Data(0));
        }
        loop {
            match self.conn.reader().read(buf) {
                Ok(0) => {
                    self.close_received = true;
                    return Ok(TlsRead::Closed);
                }
                Ok(n) => return Ok(TlsRead::Data(n)),
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(TlsRead::Eof),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e.into()),
            }

            match self.read_tls() {
                // an EOF is recorded by rustls and surfaces from the reader
                Ok(_) => self.process()?,
                Err(e) if is_transient(&e) => {
                    if !self.flush()? {
                        return Ok(TlsRead::WantWrite);
                    }
                    self.want_read = true;
                    return Ok(TlsRead::WantRead);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<TlsWrite> {
        if self.conn.is_handshaking() {
            match self.handshake()? {
                HandshakeStep::Done => {}
                HandshakeStep::WantRead => return Ok(TlsWrite::WantRead),
                HandshakeStep::WantWrite => return Ok(TlsWrite::WantWrite),
            }
        }
        self.want_read = false;

        // queued records go first so the send buffer stays bounded
        if !self.flush()? {
            return Ok(TlsWrite::WantWrite);
        }
        let n = self.conn.writer().write(buf)?;
        // whatever does not fit now is drained by a later step
        self.drain()?;
        if n == 0 {
            Ok(TlsWrite::WantWrite)
        } else {
            Ok(TlsWrite::Written(n))
        }
    }

    /// Send close_notify once, then keep flushing it.
    pub fn shutdown(&mut self) -> Result<ShutdownStep> {
        self.want_read = false;
        if !self.close_sent {
            self.conn.send_close_notify();
            self.close_sent = true;
        }
        if self.flush()? && self.close_received {
            Ok(ShutdownStep::Complete)
        } else {
            Ok(ShutdownStep::InProgress)
        }
    }

    /// Close both transport directions without close_notify and mark the
    /// session shut down in both directions.
    pub fn abandon(&mut self) {
        self.rd.shutdown(Shutdown::Read);
        self.wr.shutdown(Shutdown::Write);
        self.close_sent = true;
        self.close_received = true;
    }

    pub fn wants_read(&self) -> bool {
        self.want_read
    }

    pub fn wants_write(&self) -> bool {
        self.conn.wants_write()
    }

    /// Decrypted bytes waiting to be read without touching the transport.
    pub fn pending(&mut self) -> usize {
        self.conn
            .process_new_packets()
            .map(|state| state.plaintext_bytes_to_read())
            .unwrap_or(0)
    }

    /// close_notify has gone both ways.
    pub fn shutdown_complete(&self) -> bool {
        self.close_sent && self.close_received
    }

    /// Whether the negotiated protocol has a close_notify alert at all.
    pub fn supports_close_notify(&self) -> bool {
        self.conn.protocol_version() != Some(ProtocolVersion::SSLv2)
    }

    pub fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    /// Whether the completed handshake resumed a cached session. Only the
    /// client role can tell.
    pub fn resumed(&self) -> Option<bool> {
        if self.conn.is_handshaking() {
            return None;
        }
        self.cert_check.as_ref().map(|check| !check.verified())
    }

    pub fn peer_certificates(&self) -> Option<&[CertificateDer<'_>]> {
        self.conn.peer_certificates()
    }

    /// Negotiated protocol version and cipher suite.
    pub fn describe(&self) -> String {
        let version = self
            .conn
            .protocol_version()
            .map(|v| format!("{:?}", v))
            .unwrap_or_else(|| "unknown".into());
        let suite = self
            .conn
            .negotiated_cipher_suite()
            .map(|s| format!("{:?}", s.suite()))
            .unwrap_or_else(|| "unknown".into());
        format!("{}, cipher {}", version, suite)
    }
}

/// Immutable per-listener TLS configuration.
#[derive(Clone)]
pub enum TlsContext {
    Client {
        config: Arc<ClientConfig>,
        server_name: ServerName<'static>,
        sessions: Arc<ResumptionCache>,
        verifier: Arc<ServerCertCheck>,
    },
    Server {
        config: Arc<ServerConfig>,
    },
}

fn protocol_versions(versions: &[TlsVersion]) -> Vec<&'static rustls::SupportedProtocolVersion> {
    if versions.is_empty() {
        return rustls::DEFAULT_VERSIONS.to_vec();
    }
    versions
        .iter()
        .map(|v| match v {
            TlsVersion::Tls12 => &rustls::version::TLS12,
            TlsVersion::Tls13 => &rustls::version::TLS13,
        })
        .collect()
}

/// Look up a cipher suite by its IANA name, e.g. `TLS13_AES_256_GCM_SHA384`.
pub fn cipher_suite(name: &str) -> Result<SupportedCipherSuite> {
    rustls::crypto::ring::ALL_CIPHER_SUITES
        .iter()
        .find(|s| format!("{:?}", s.suite()).eq_ignore_ascii_case(name.trim()))
        .copied()
        .ok_or_else(|| Error::Config(format!("Unknown cipher suite '{}'", name)))
}

fn crypto_provider(ciphers: &[String]) -> Result<Arc<CryptoProvider>> {
    let mut provider = rustls::crypto::ring::default_provider();
    if !ciphers.is_empty() {
        provider.cipher_suites = ciphers
            .iter()
            .map(|name| cipher_suite(name))
            .collect::<Result<_>>()?;
    }
    Ok(Arc::new(provider))
}

impl TlsContext {
    /// `peer_name` is the host the client role presents in SNI.
    pub fn build(
        opts: &ServiceOptions,
        policy: Arc<TrustPolicy>,
        keys: &Arc<KeyCache<EcdsaKeys>>,
        peer_name: Option<&str>,
    ) -> Result<Self> {
        let versions = protocol_versions(&opts.tls_versions);
        let provider = crypto_provider(&opts.ciphers)?;
        let incompatible = |e: rustls::Error| {
            Error::Config(format!("{}: cipher suites and TLS versions: {}", opts.name, e))
        };

        match opts.role {
            Role::Client => {
                let verifier = Arc::new(ServerCertCheck::new(policy)?);
                let builder = ClientConfig::builder_with_provider(provider)
                    .with_protocol_versions(&versions)
                    .map_err(incompatible)?
                    .dangerous()
                    .with_custom_certificate_verifier(verifier.clone());
                let mut config = match (&opts.cert, &opts.key) {
                    (Some(cert), Some(key)) => builder
                        .with_client_auth_cert(load_certs(cert)?, load_private_key(key)?)?,
                    _ => builder.with_no_client_auth(),
                };

                let sessions = Arc::new(ResumptionCache::new());
                config.resumption = rustls::client::Resumption::store(sessions.clone());

                let host = peer_name.unwrap_or("localhost");
                let server_name = ServerName::try_from(host)
                    .map(|n| n.to_owned())
                    .map_err(|e| Error::Config(format!("Invalid peer name '{}': {}", host, e)))?;
                debug!("Client context: peer name {}", host);

                Ok(TlsContext::Client {
                    config: Arc::new(config),
                    server_name,
                    sessions,
                    verifier,
                })
            }
            Role::Server => {
                let verifier = Arc::new(ClientCertCheck::new(policy)?);
                let builder = ServerConfig::builder_with_provider(provider)
                    .with_protocol_versions(&versions)
                    .map_err(incompatible)?
                    .with_client_cert_verifier(verifier);
                let config = match (&opts.cert, &opts.key) {
                    (Some(cert), Some(key)) => {
                        builder.with_single_cert(load_certs(cert)?, load_private_key(key)?)?
                    }
                    (Some(_), None) | (None, Some(_)) => {
                        return Err(Error::Config("cert and key must be set together".into()))
                    }
                    (None, None) => {
                        debug!(
                            "Server context: ephemeral {} bit identity",
                            opts.ephemeral_key_bits
                        );
                        let resolver = EphemeralCertResolver::new(
                            Arc::clone(keys),
                            opts.ephemeral_key_bits,
                            opts.name.clone(),
                        );
                        // fail at start-up rather than in the first handshake
                        resolver.certified_key()?;
                        builder.with_cert_resolver(Arc::new(resolver))
                    }
                };
                Ok(TlsContext::Server {
                    config: Arc::new(config),
                })
            }
        }
    }

    /// Start a session over the given transport halves.
    pub fn session(&self, rd: Endpoint, wr: Endpoint) -> Result<TlsSession> {
        match self {
            TlsContext::Client {
                config,
                server_name,
                verifier,
                ..
            } => {
                let check = Arc::new(SessionCertCheck::new(Arc::clone(verifier)));
                let mut config = ClientConfig::clone(config);
                config.dangerous().set_certificate_verifier(check.clone());
                let conn = ClientConnection::new(Arc::new(config), server_name.clone())?;
                let mut session = TlsSession::new(conn, rd, wr);
                session.cert_check = Some(check);
                Ok(session)
            }
            TlsContext::Server { config } => {
                let conn = ServerConnection::new(Arc::clone(config))?;
                Ok(TlsSession::new(conn, rd, wr))
            }
        }
    }

    pub fn sessions(&self) -> Option<&Arc<ResumptionCache>> {
        match self {
            TlsContext::Client { sessions, .. } => Some(sessions),
            TlsContext::Server { .. } => None,
        }
    }
}
