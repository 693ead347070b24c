mod common;

use common::*;
use rustls::pki_types::ServerName;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UnixStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use tlstun_engine::connection::Outcome;
use tlstun_engine::endpoint::{Endpoint, LocalPair};
use tlstun_engine::{ErrorKind, Service, VerifyLevel};

const T: Duration = Duration::from_secs(10);

async fn read_exact_within(stream: &mut (impl AsyncReadExt + Unpin), n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    tokio::time::timeout(T, stream.read_exact(&mut buf))
        .await
        .expect("read timed out")
        .unwrap();
    buf
}

async fn read_to_end_within(stream: &mut (impl AsyncReadExt + Unpin)) -> Vec<u8> {
    let mut buf = Vec::new();
    tokio::time::timeout(T, stream.read_to_end(&mut buf))
        .await
        .expect("read timed out")
        .unwrap();
    buf
}

/// plaintext client -> client role -> TLS -> server role -> echo
async fn tunnel_pair(pki: &Pki) -> (Arc<Service>, Arc<Service>, std::net::SocketAddr) {
    let echo = echo_server().await;
    let (server, server_addr) = start(server_options("server", vec![echo], pki)).await;
    let (client, client_addr) = start(client_options("client", server_addr, pki)).await;
    (client, server, client_addr)
}

#[tokio::test]
async fn test_hello_through_both_roles() {
    let pki = Pki::generate();
    let (client, server, addr) = tunnel_pair(&pki).await;

    let mut app = TcpStream::connect(addr).await.unwrap();
    app.write_all(b"hello").await.unwrap();
    assert_eq!(read_exact_within(&mut app, 5).await, b"hello");

    // a clean close travels as close_notify, the far side sees no reset
    app.shutdown().await.unwrap();
    assert!(read_to_end_within(&mut app).await.is_empty());

    wait_for(|| client.stats().snapshot().closed == 1).await;
    wait_for(|| server.stats().snapshot().closed == 1).await;
    assert_eq!(client.stats().snapshot().reset, 0);
    assert_eq!(server.stats().snapshot().reset, 0);
    assert_eq!(server.stats().snapshot().bytes_to_tls, 5);
    assert_eq!(server.stats().snapshot().bytes_to_plain, 5);
}

#[tokio::test]
async fn test_large_payload_without_loss() {
    let pki = Pki::generate();
    let (client, _server, addr) = tunnel_pair(&pki).await;

    let payload: Vec<u8> = (0..1024 * 1024).map(|i: u32| (i % 251) as u8).collect();
    let app = TcpStream::connect(addr).await.unwrap();
    let (mut rd, mut wr) = app.into_split();

    let sent = payload.clone();
    let writer = tokio::spawn(async move {
        wr.write_all(&sent).await.unwrap();
        wr.shutdown().await.unwrap();
    });
    let echoed = read_to_end_within(&mut rd).await;
    writer.await.unwrap();

    assert_eq!(echoed.len(), payload.len());
    assert!(echoed == payload);
    wait_for(|| client.stats().snapshot().closed == 1).await;
    assert_eq!(client.stats().snapshot().bytes_to_tls, payload.len() as u64);
}

#[tokio::test]
async fn test_standard_client_through_server_role() {
    let pki = Pki::generate();
    let echo = echo_server().await;
    let (_server, addr) = start(server_options("server", vec![echo], &pki)).await;

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(pki.roots())
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));
    let tcp = TcpStream::connect(addr).await.unwrap();
    let name = ServerName::try_from("localhost").unwrap();
    let mut tls = connector.connect(name, tcp).await.unwrap();

    tls.write_all(b"ping").await.unwrap();
    assert_eq!(read_exact_within(&mut tls, 4).await, b"ping");
    tls.shutdown().await.unwrap();
    assert!(read_to_end_within(&mut tls).await.is_empty());
}

#[tokio::test]
async fn test_failover_to_reachable_address() {
    let pki = Pki::generate();
    let refused = refused_addr().await;
    let echo = echo_server().await;
    let (server, server_addr) = start(server_options("server", vec![refused, echo], &pki)).await;
    let (_client, addr) = start(client_options("client", server_addr, &pki)).await;

    let mut app = TcpStream::connect(addr).await.unwrap();
    app.write_all(b"again").await.unwrap();
    assert_eq!(read_exact_within(&mut app, 5).await, b"again");
    app.shutdown().await.unwrap();
    read_to_end_within(&mut app).await;

    wait_for(|| server.stats().snapshot().closed == 1).await;
    assert_eq!(server.stats().snapshot().reset, 0);
}

#[tokio::test]
async fn test_handshake_timeout_resets() {
    let pki = Pki::generate();
    let echo = echo_server().await;
    let mut opts = server_options("server", vec![echo], &pki);
    opts.timeouts.busy = Duration::from_millis(200);
    let (server, addr) = start(opts).await;

    // connect and never send a ClientHello
    let mut silent = TcpStream::connect(addr).await.unwrap();
    let mut buf = [0u8; 16];
    let result = tokio::time::timeout(T, silent.read(&mut buf))
        .await
        .expect("handshake wait was not bounded");
    assert!(matches!(result, Ok(0) | Err(_)));

    wait_for(|| server.stats().snapshot().reset == 1).await;
    assert_eq!(server.stats().active(), 0);
}

#[tokio::test]
async fn test_untrusted_server_is_rejected() {
    let pki = Pki::generate();
    let other = Pki::generate();
    let echo = echo_server().await;
    let (_server, server_addr) = start(server_options("server", vec![echo], &other)).await;
    let (client, addr) = start(client_options("client", server_addr, &pki)).await;

    let mut app = TcpStream::connect(addr).await.unwrap();
    let _ = app.write_all(b"secret").await;
    let mut buf = [0u8; 16];
    let result = tokio::time::timeout(T, app.read(&mut buf)).await.unwrap();
    assert!(matches!(result, Ok(0) | Err(_)));

    wait_for(|| client.stats().snapshot().reset == 1).await;
    assert_eq!(client.stats().snapshot().bytes_to_tls, 0);
}

#[tokio::test]
async fn test_hostname_mismatch_is_rejected() {
    let pki = Pki::generate();
    let echo = echo_server().await;
    let (_server, server_addr) = start(server_options("server", vec![echo], &pki)).await;
    let mut opts = client_options("client", server_addr, &pki);
    opts.trust.check_host = Some("example.org".to_string());
    let service = Service::build(opts, keys()).await.unwrap();

    let (local, mut app) = UnixStream::pair().unwrap();
    let report = tokio::time::timeout(T, service.handle(LocalPair::duplex(Endpoint::new(local))))
        .await
        .unwrap();
    assert_eq!(report.outcome, Outcome::Reset);
    assert_eq!(report.error, Some(ErrorKind::Protocol));
    assert!(read_to_end_within(&mut app).await.is_empty());
}

#[tokio::test]
async fn test_ephemeral_server_identity() {
    let pki = Pki::generate();
    let echo = echo_server().await;
    let mut server_opts = server_options("server", vec![echo], &pki);
    server_opts.cert = None;
    server_opts.key = None;
    let (_server, server_addr) = start(server_opts).await;

    let mut client_opts = client_options("client", server_addr, &pki);
    client_opts.trust.level = VerifyLevel::None;
    client_opts.trust.ca_file = None;
    let (_client, addr) = start(client_opts).await;

    let mut app = TcpStream::connect(addr).await.unwrap();
    app.write_all(b"anon").await.unwrap();
    assert_eq!(read_exact_within(&mut app, 4).await, b"anon");
}

#[tokio::test]
async fn test_split_local_pair() {
    let pki = Pki::generate();

    // TLS echo server built on a standard acceptor
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![pki.cert_der.clone()], pki.key_der())
        .unwrap();
    let acceptor = TlsAcceptor::from(Arc::new(config));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let remote = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let tls = acceptor.accept(tcp).await.unwrap();
        let (mut rd, mut wr) = tokio::io::split(tls);
        let _ = tokio::io::copy(&mut rd, &mut wr).await;
        let _ = wr.shutdown().await;
    });

    let service = Service::build(client_options("split", remote, &pki), keys())
        .await
        .unwrap();

    // input and output of the local side are different transports
    let (input_local, mut input_app) = UnixStream::pair().unwrap();
    let (output_local, mut output_app) = UnixStream::pair().unwrap();
    let local = LocalPair::split(Endpoint::new(input_local), Endpoint::new(output_local));
    assert!(local.is_split());
    let worker = tokio::spawn(async move { service.handle(local).await });

    input_app.write_all(b"split").await.unwrap();
    assert_eq!(read_exact_within(&mut output_app, 5).await, b"split");
    input_app.shutdown().await.unwrap();
    assert!(read_to_end_within(&mut output_app).await.is_empty());

    let report = tokio::time::timeout(T, worker).await.unwrap().unwrap();
    assert_eq!(report.outcome, Outcome::Closed);
    assert_eq!(report.to_tls, 5);
    assert_eq!(report.to_plain, 5);
}

#[tokio::test]
async fn test_mutual_tls_checks_client_against_remote_host() {
    let pki = Pki::generate();
    let echo = echo_server().await;

    // the client certificate must name the first remote host, here "localhost"
    let mut server_opts = server_options("server", vec![echo], &pki);
    server_opts.connect = vec![format!("localhost:{}", echo.port())];
    server_opts.trust.level = VerifyLevel::Require;
    server_opts.trust.ca_file = Some(pki.ca.clone());
    let (server, server_addr) = start(server_opts).await;
    assert_eq!(server.check_host(), Some("localhost"));

    let mut client_opts = client_options("client", server_addr, &pki);
    client_opts.cert = Some(pki.cert.clone());
    client_opts.key = Some(pki.key.clone());
    let (_client, addr) = start(client_opts).await;

    let mut app = TcpStream::connect(addr).await.unwrap();
    app.write_all(b"mutual").await.unwrap();
    assert_eq!(read_exact_within(&mut app, 6).await, b"mutual");
    app.shutdown().await.unwrap();
    read_to_end_within(&mut app).await;

    wait_for(|| server.stats().snapshot().closed == 1).await;
    assert_eq!(server.stats().snapshot().reset, 0);
}

#[tokio::test]
async fn test_mutual_tls_without_client_certificate_resets() {
    let pki = Pki::generate();
    let echo = echo_server().await;
    let mut server_opts = server_options("server", vec![echo], &pki);
    server_opts.trust.level = VerifyLevel::Require;
    server_opts.trust.ca_file = Some(pki.ca.clone());
    let (server, server_addr) = start(server_opts).await;
    let (_client, addr) = start(client_options("client", server_addr, &pki)).await;

    let mut app = TcpStream::connect(addr).await.unwrap();
    let _ = app.write_all(b"anonymous").await;
    let mut buf = [0u8; 16];
    let result = tokio::time::timeout(T, app.read(&mut buf)).await.unwrap();
    assert!(matches!(result, Ok(0) | Err(_)));

    wait_for(|| server.stats().snapshot().reset == 1).await;
    assert_eq!(server.stats().snapshot().bytes_to_plain, 0);
}

#[tokio::test]
async fn test_second_connection_resumes_session() {
    let pki = Pki::generate();
    let (client, server, addr) = tunnel_pair(&pki).await;
    let cache = client.tls_context().sessions().unwrap();

    for round in 1..=2u64 {
        let mut app = TcpStream::connect(addr).await.unwrap();
        app.write_all(b"again").await.unwrap();
        assert_eq!(read_exact_within(&mut app, 5).await, b"again");
        app.shutdown().await.unwrap();
        read_to_end_within(&mut app).await;
        wait_for(|| client.stats().snapshot().closed == round).await;

        // the ticket from the last handshake replaces the previous one
        assert!(!cache.is_empty());
        assert!(cache.generation() >= round);
    }

    assert_eq!(client.stats().snapshot().sessions_reused, 1);
    wait_for(|| server.stats().snapshot().closed == 2).await;
    assert_eq!(server.stats().snapshot().reset, 0);
}
