//! Transport halves and bounded readiness waits.
//!
//! Every wait in the engine goes through [`wait`], which polls up to four
//! transports at once and always carries a timeout.

use socket2::SockRef;
use std::fmt;
use std::future::poll_fn;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::net::{TcpStream, UnixStream};
use tracing::debug;

use crate::error::{Error, Result};

/// Non-blocking byte transport driven by readiness.
pub trait Transport: Send + Sync + fmt::Debug {
    fn poll_read_ready(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>>;

    fn poll_write_ready(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>>;

    /// Returns `WouldBlock` when no data is available.
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize>;

    fn try_write(&self, buf: &[u8]) -> io::Result<usize>;

    fn shutdown(&self, how: Shutdown) -> io::Result<()>;

    /// Network peer address, `None` for transports without one.
    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// Abort on close instead of a graceful FIN.
    fn reset(&self) -> io::Result<()>;
}

impl Transport for TcpStream {
    fn poll_read_ready(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        TcpStream::poll_read_ready(self, cx)
    }

    fn poll_write_ready(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        TcpStream::poll_write_ready(self, cx)
    }

    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        TcpStream::try_read(self, buf)
    }

    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        TcpStream::try_write(self, buf)
    }

    fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        SockRef::from(self).shutdown(how)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        TcpStream::peer_addr(self).ok()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        TcpStream::local_addr(self).ok()
    }

    fn reset(&self) -> io::Result<()> {
        SockRef::from(self).set_linger(Some(Duration::ZERO))
    }
}

impl Transport for UnixStream {
    fn poll_read_ready(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        UnixStream::poll_read_ready(self, cx)
    }

    fn poll_write_ready(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        UnixStream::poll_write_ready(self, cx)
    }

    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        UnixStream::try_read(self, buf)
    }

    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        UnixStream::try_write(self, buf)
    }

    fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        SockRef::from(self).shutdown(how)
    }

    fn reset(&self) -> io::Result<()> {
        SockRef::from(self).set_linger(Some(Duration::ZERO))
    }
}

/// Shared handle to one transport half.
#[derive(Debug, Clone)]
pub struct Endpoint {
    io: Arc<dyn Transport>,
}

impl Endpoint {
    pub fn new<T: Transport + 'static>(transport: T) -> Self {
        Self {
            io: Arc::new(transport),
        }
    }

    pub fn transport(&self) -> &dyn Transport {
        self.io.as_ref()
    }

    /// Both handles refer to the same transport.
    pub fn same(&self, other: &Endpoint) -> bool {
        Arc::ptr_eq(&self.io, &other.io)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.io.peer_addr()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.io.local_addr()
    }

    pub fn shutdown(&self, how: Shutdown) {
        if let Err(e) = self.io.shutdown(how) {
            debug!("shutdown ({:?}): {}", how, e);
        }
    }

    /// Arm an abortive close; `what` names the endpoint in the log.
    pub fn reset(&self, what: &str) {
        if let Err(e) = self.io.reset() {
            debug!("linger ({}): {}", what, e);
        }
    }
}

/// The local side of a connection: one duplex transport, or separate read and write halves.
#[derive(Debug, Clone)]
pub struct LocalPair {
    pub rd: Endpoint,
    pub wr: Endpoint,
}

impl LocalPair {
    pub fn duplex(endpoint: Endpoint) -> Self {
        Self {
            rd: endpoint.clone(),
            wr: endpoint,
        }
    }

    pub fn split(rd: Endpoint, wr: Endpoint) -> Self {
        Self { rd, wr }
    }

    pub fn is_split(&self) -> bool {
        !self.rd.same(&self.wr)
    }
}

/// Position in a [`PollSet`]; the read/write interest is implied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    PlainRead = 0,
    PlainWrite = 1,
    TlsRead = 2,
    TlsWrite = 3,
}

impl Slot {
    fn is_write(self) -> bool {
        matches!(self, Slot::PlainWrite | Slot::TlsWrite)
    }
}

const SLOTS: [Slot; 4] = [Slot::PlainRead, Slot::PlainWrite, Slot::TlsRead, Slot::TlsWrite];

#[derive(Default)]
pub struct PollSet<'a> {
    slots: [Option<&'a dyn Transport>; 4],
    immediate: bool,
}

impl<'a> PollSet<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, slot: Slot, transport: &'a dyn Transport) {
        self.slots[slot as usize] = Some(transport);
    }

    /// Return from the next wait without blocking, even when nothing is ready.
    pub fn wake_now(&mut self) {
        self.immediate = true;
    }
}

/// Slots reported ready by one wait.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Readiness([bool; 4]);

impl Readiness {
    pub fn is_ready(&self, slot: Slot) -> bool {
        self.0[slot as usize]
    }

    pub fn set(&mut self, slot: Slot) {
        self.0[slot as usize] = true;
    }
}

/// Wait until any slot is ready. `Ok(None)` means the timeout expired first.
pub async fn wait(set: &PollSet<'_>, limit: Duration) -> io::Result<Option<Readiness>> {
    let ready = poll_fn(|cx| {
        let mut ready = Readiness::default();
        let mut any = false;
        for slot in SLOTS {
            let Some(transport) = set.slots[slot as usize] else {
                continue;
            };
            let poll = if slot.is_write() {
                transport.poll_write_ready(cx)
            } else {
                transport.poll_read_ready(cx)
            };
            match poll {
                Poll::Ready(Ok(())) => {
                    ready.set(slot);
                    any = true;
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => {}
            }
        }
        if any || set.immediate {
            Poll::Ready(Ok(ready))
        } else {
            Poll::Pending
        }
    });

    match tokio::time::timeout(limit, ready).await {
        Ok(result) => result.map(Some),
        Err(_) => Ok(None),
    }
}

/// Wait for a single transport; a timeout is fatal.
pub async fn wait_ready(
    transport: &dyn Transport,
    slot: Slot,
    limit: Duration,
    what: &'static str,
) -> Result<()> {
    let mut set = PollSet::new();
    set.add(slot, transport);
    match wait(&set, limit).await? {
        Some(_) => Ok(()),
        None => Err(Error::Timeout(what)),
    }
}

/// Write all of `data`, waiting at most `limit` for each readiness.
pub async fn write_all(endpoint: &Endpoint, data: &[u8], limit: Duration) -> Result<()> {
    let mut sent = 0;
    while sent < data.len() {
        match endpoint.transport().try_write(&data[sent..]) {
            Ok(0) => return Err(Error::Io(io::ErrorKind::WriteZero.into())),
            Ok(n) => sent += n,
            Err(e) if is_transient(&e) => {
                wait_ready(endpoint.transport(), Slot::PlainWrite, limit, "write").await?
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Read one line terminated by LF, a byte at a time so nothing past it is consumed.
/// The terminator and any trailing CR are stripped.
pub async fn read_line(endpoint: &Endpoint, limit: Duration, max: usize) -> Result<String> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match endpoint.transport().try_read(&mut byte) {
            Ok(0) => {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before end of line",
                )))
            }
            Ok(_) if byte[0] == b'\n' => break,
            Ok(_) => {
                if line.len() >= max {
                    return Err(Error::Protocol("line too long".into()));
                }
                line.push(byte[0]);
            }
            Err(e) if is_transient(&e) => {
                wait_ready(endpoint.transport(), Slot::PlainRead, limit, "read").await?
            }
            Err(e) => return Err(e.into()),
        }
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}

/// Errors that mean "try again", never a failure.
pub fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_reports_readable() {
        let (a, b) = UnixStream::pair().unwrap();
        b.try_write(b"x").unwrap();

        let mut set = PollSet::new();
        set.add(Slot::PlainRead, &a);
        let ready = wait(&set, Duration::from_secs(5)).await.unwrap().unwrap();
        assert!(ready.is_ready(Slot::PlainRead));
        assert!(!ready.is_ready(Slot::TlsRead));
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let (a, _b) = UnixStream::pair().unwrap();
        let mut set = PollSet::new();
        set.add(Slot::TlsRead, &a);
        let ready = wait(&set, Duration::from_millis(50)).await.unwrap();
        assert!(ready.is_none());
    }

    #[tokio::test]
    async fn test_wake_now_returns_empty() {
        let (a, _b) = UnixStream::pair().unwrap();
        let mut set = PollSet::new();
        set.add(Slot::PlainRead, &a);
        set.wake_now();
        let ready = wait(&set, Duration::from_secs(5)).await.unwrap().unwrap();
        assert_eq!(ready, Readiness::default());
    }

    #[tokio::test]
    async fn test_line_io() {
        let (a, b) = UnixStream::pair().unwrap();
        let a = Endpoint::new(a);
        let b = Endpoint::new(b);
        write_all(&a, b"220 ready\r\nrest", Duration::from_secs(5)).await.unwrap();
        let line = read_line(&b, Duration::from_secs(5), 512).await.unwrap();
        assert_eq!(line, "220 ready");

        let mut rest = [0u8; 8];
        let n = b.transport().try_read(&mut rest).unwrap();
        assert_eq!(&rest[..n], b"rest");
    }

    #[tokio::test]
    async fn test_local_pair_split() {
        let (a, b) = UnixStream::pair().unwrap();
        let a = Endpoint::new(a);
        let b = Endpoint::new(b);
        assert!(!LocalPair::duplex(a.clone()).is_split());
        assert!(LocalPair::split(a, b).is_split());
    }
}
