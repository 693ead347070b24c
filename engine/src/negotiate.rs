//! Application protocol exchanged in plaintext before the TLS handshake.

use std::time::Duration;
use tracing::{debug, error};

use crate::endpoint::{read_line, write_all, Endpoint, LocalPair};
use crate::error::{Error, Result};
use crate::options::{Protocol, Role};

/// Longest line accepted from the remote server.
const MAX_LINE: usize = 4096;

pub async fn negotiate(
    protocol: Protocol,
    role: Role,
    local: &LocalPair,
    remote: &Endpoint,
    timeout: Duration,
) -> Result<()> {
    match (protocol, role) {
        (Protocol::Smtp, Role::Client) => smtp_client(local, remote, timeout).await,
        (Protocol::Smtp, Role::Server) => Err(Error::Config(
            "SMTP negotiation is supported in client mode only".into(),
        )),
    }
}

async fn put_line(endpoint: &Endpoint, line: &str, timeout: Duration) -> Result<()> {
    debug!(" -> {}", line);
    write_all(endpoint, format!("{}\r\n", line).as_bytes(), timeout).await
}

async fn get_line(endpoint: &Endpoint, timeout: Duration) -> Result<String> {
    let line = read_line(endpoint, timeout, MAX_LINE).await?;
    debug!(" <- {}", line);
    Ok(line)
}

/// Read a possibly multi-line reply and return its last line.
async fn reply(remote: &Endpoint, code: &str, timeout: Duration) -> Result<String> {
    let continued = format!("{}-", code);
    loop {
        let line = get_line(remote, timeout).await?;
        if !line.starts_with(&continued) {
            return Ok(line);
        }
    }
}

/// Relay the greeting to the local client, then switch the remote server to TLS.
async fn smtp_client(local: &LocalPair, remote: &Endpoint, timeout: Duration) -> Result<()> {
    loop {
        let line = get_line(remote, timeout).await?;
        put_line(&local.wr, &line, timeout).await?;
        if !line.starts_with("220-") {
            break;
        }
    }

    put_line(remote, "EHLO localhost", timeout).await?;
    if !reply(remote, "250", timeout).await?.starts_with("250 ") {
        error!("Remote server is not RFC 1425 compliant");
        return Err(Error::Protocol("EHLO rejected by remote server".into()));
    }

    put_line(remote, "STARTTLS", timeout).await?;
    if !reply(remote, "220", timeout).await?.starts_with("220 ") {
        error!("Remote server is not RFC 2487 compliant");
        return Err(Error::Protocol("STARTTLS rejected by remote server".into()));
    }

    Ok(())
}
