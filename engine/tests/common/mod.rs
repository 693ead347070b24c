#![allow(dead_code)]

use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair, KeyUsagePurpose};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

use tlstun_engine::keycache::{EcdsaKeys, KeyCache};
use tlstun_engine::{Role, Service, ServiceOptions, VerifyLevel};

/// A test CA and a `localhost` server certificate it signed, written as PEM files.
pub struct Pki {
    _dir: TempDir,
    pub ca: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
    pub ca_der: CertificateDer<'static>,
    pub cert_der: CertificateDer<'static>,
    key_der: Vec<u8>,
}

impl Pki {
    pub fn generate() -> Self {
        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        ca_params.distinguished_name.push(DnType::CommonName, "tlstun test ca");
        let ca = ca_params.self_signed(&ca_key).unwrap();

        let key = KeyPair::generate().unwrap();
        let mut params =
            CertificateParams::new(vec!["localhost".to_string(), "127.0.0.1".to_string()]).unwrap();
        params.distinguished_name.push(DnType::CommonName, "localhost");
        let cert = params.signed_by(&key, &ca, &ca_key).unwrap();

        let dir = TempDir::new().unwrap();
        let ca_path = dir.path().join("ca.pem");
        let cert_path = dir.path().join("server.pem");
        let key_path = dir.path().join("server.key");
        std::fs::write(&ca_path, ca.pem()).unwrap();
        std::fs::write(&cert_path, cert.pem()).unwrap();
        std::fs::write(&key_path, key.serialize_pem()).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600)).unwrap();
        }

        Self {
            _dir: dir,
            ca: ca_path,
            cert: cert_path,
            key: key_path,
            ca_der: ca.der().clone(),
            cert_der: cert.der().clone(),
            key_der: key.serialize_der(),
        }
    }

    pub fn key_der(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der.clone()))
    }

    pub fn roots(&self) -> rustls::RootCertStore {
        let mut roots = rustls::RootCertStore::empty();
        roots.add(self.ca_der.clone()).unwrap();
        roots
    }
}

pub fn keys() -> Arc<KeyCache<EcdsaKeys>> {
    Arc::new(KeyCache::new(EcdsaKeys))
}

pub fn quick_timeouts(opts: &mut ServiceOptions) {
    opts.timeouts.busy = Duration::from_secs(5);
    opts.timeouts.close = Duration::from_secs(2);
    opts.timeouts.connect = Duration::from_secs(2);
    opts.timeouts.idle = Duration::from_secs(10);
}

/// TLS in front of `connect`, using the test certificate.
pub fn server_options(name: &str, connect: Vec<SocketAddr>, pki: &Pki) -> ServiceOptions {
    let mut opts = ServiceOptions::new(
        name,
        Role::Server,
        connect.iter().map(|a| a.to_string()).collect(),
    );
    opts.cert = Some(pki.cert.clone());
    opts.key = Some(pki.key.clone());
    quick_timeouts(&mut opts);
    opts
}

/// TLS towards `connect`, requiring a certificate for `localhost` from the test CA.
pub fn client_options(name: &str, connect: SocketAddr, pki: &Pki) -> ServiceOptions {
    let mut opts = ServiceOptions::new(name, Role::Client, vec![connect.to_string()]);
    opts.trust.level = VerifyLevel::Require;
    opts.trust.ca_file = Some(pki.ca.clone());
    opts.trust.check_host = Some("localhost".to_string());
    quick_timeouts(&mut opts);
    opts
}

/// Build the service and serve it on an ephemeral loopback port.
pub async fn start(opts: ServiceOptions) -> (Arc<Service>, SocketAddr) {
    let service = Arc::new(Service::build(opts, keys()).await.unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(Arc::clone(&service).serve(listener));
    (service, addr)
}

/// Plain TCP echo; closes its write side once the client has finished.
pub async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = listener.accept().await.unwrap();
            tokio::spawn(async move {
                let (mut rd, mut wr) = stream.split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
                let _ = wr.shutdown().await;
            });
        }
    });
    addr
}

/// An address nothing listens on.
pub async fn refused_addr() -> SocketAddr {
    TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap()
        .local_addr()
        .unwrap()
}

/// Poll `cond` for up to five seconds.
pub async fn wait_for(cond: impl Fn() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}
