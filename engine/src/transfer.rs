//! Full-duplex transfer between the plaintext side and the TLS side.
//!
//! The loop keeps one buffer per direction, four open flags and the
//! close_notify state machine. Each iteration waits for readiness on the
//! transports it has work for, then runs the shutdown step, the two writes,
//! the two reads and the half-close checks in that order.

use std::io;
use std::net::Shutdown;
use tracing::{debug, error, info, warn};

use crate::endpoint::{is_transient, wait, LocalPair, PollSet, Readiness, Slot, Transport};
use crate::error::{Error, Result};
use crate::options::Timeouts;
use crate::tls::{ShutdownStep, TlsRead, TlsSession, TlsWrite};

pub const BUFFER_SIZE: usize = 16384;

/// Iterations in `Retry` without progress before close_notify is given up.
const RETRY_LIMIT: u32 = 5;

/// Iterations without progress before the loop is declared stuck.
const STALL_LIMIT: u32 = 100;

/// Fixed-capacity byte queue.
pub struct TransferBuffer {
    data: Box<[u8]>,
    len: usize,
}

impl TransferBuffer {
    pub fn new() -> Self {
        Self {
            data: vec![0u8; BUFFER_SIZE].into_boxed_slice(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.data.len()
    }

    pub fn has_room(&self) -> bool {
        !self.is_full()
    }

    /// Queued bytes.
    pub fn filled(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Free space after the queued bytes.
    pub fn spare(&mut self) -> &mut [u8] {
        &mut self.data[self.len..]
    }

    /// Account for `n` bytes written into [`spare`](Self::spare).
    pub fn commit(&mut self, n: usize) {
        debug_assert!(n <= self.data.len() - self.len);
        self.len = (self.len + n).min(self.data.len());
    }

    /// Drop `n` bytes from the front.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.len);
        self.data.copy_within(n..self.len, 0);
        self.len -= n;
    }
}

impl Default for TransferBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Open flags of the four logical stream directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Directions {
    pub plain_rd: bool,
    pub plain_wr: bool,
    pub tls_rd: bool,
    pub tls_wr: bool,
}

impl Directions {
    pub fn open() -> Self {
        Self {
            plain_rd: true,
            plain_wr: true,
            tls_rd: true,
            tls_wr: true,
        }
    }
}

/// close_notify negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseState {
    Open,
    /// close_notify must be sent.
    Init,
    /// close_notify sent or partly sent, waiting on the transport.
    Retry,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseEvent {
    /// The TLS write direction retired on a protocol with close_notify.
    Initiate,
    /// The TLS side is gone without a close_notify to send.
    Abandon,
    ShutdownDone,
    ShutdownPending,
    /// The session needs neither a read nor a write.
    Idle,
    RetriesExhausted,
}

impl CloseState {
    pub fn on(self, event: CloseEvent) -> CloseState {
        use CloseEvent::*;
        use CloseState::*;

        match (self, event) {
            (_, Abandon) => Closed,
            (Open, Initiate) => Init,
            (Init | Retry, ShutdownDone) => Closed,
            (Init | Retry, ShutdownPending) => Retry,
            (Retry, Idle) => Closed,
            (Retry, RetriesExhausted) => Closed,
            (state, _) => state,
        }
    }
}

/// Counts loop iterations since the last byte moved.
#[derive(Debug, Default)]
pub struct Watchdog {
    idle: u32,
}

impl Watchdog {
    pub fn progress(&mut self) {
        self.idle = 0;
    }

    pub fn retries_exhausted(&self) -> bool {
        self.idle > RETRY_LIMIT
    }

    /// Count one iteration; true once the stall limit is passed.
    pub fn tick(&mut self) -> bool {
        self.idle += 1;
        self.idle > STALL_LIMIT
    }
}

/// Bytes moved in each direction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Counters {
    /// Plaintext bytes handed to TLS.
    pub to_tls: u64,
    /// Decrypted bytes written to the plaintext side.
    pub to_plain: u64,
}

/// The TLS side as the transfer loop drives it.
pub trait TlsChannel {
    fn read_transport(&self) -> &dyn Transport;

    fn write_transport(&self) -> &dyn Transport;

    fn read(&mut self, buf: &mut [u8]) -> Result<TlsRead>;

    fn write(&mut self, buf: &[u8]) -> Result<TlsWrite>;

    fn shutdown(&mut self) -> Result<ShutdownStep>;

    /// Write records already queued inside the session. Returns the bytes written.
    fn flush(&mut self) -> Result<usize>;

    /// Close the transport without close_notify.
    fn abandon(&mut self);

    fn wants_read(&self) -> bool;

    fn wants_write(&self) -> bool;

    /// Decrypted bytes already buffered inside the session.
    fn pending(&mut self) -> usize;

    fn shutdown_complete(&self) -> bool;

    fn supports_close_notify(&self) -> bool;
}

impl TlsChannel for TlsSession {
    fn read_transport(&self) -> &dyn Transport {
        self.read_endpoint().transport()
    }

    fn write_transport(&self) -> &dyn Transport {
        self.write_endpoint().transport()
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<TlsRead> {
        TlsSession::read(self, buf)
    }

    fn write(&mut self, buf: &[u8]) -> Result<TlsWrite> {
        TlsSession::write(self, buf)
    }

    fn shutdown(&mut self) -> Result<ShutdownStep> {
        TlsSession::shutdown(self)
    }

    fn flush(&mut self) -> Result<usize> {
        TlsSession::drain(self)
    }

    fn abandon(&mut self) {
        TlsSession::abandon(self)
    }

    fn wants_read(&self) -> bool {
        TlsSession::wants_read(self)
    }

    fn wants_write(&self) -> bool {
        TlsSession::wants_write(self)
    }

    fn pending(&mut self) -> usize {
        TlsSession::pending(self)
    }

    fn shutdown_complete(&self) -> bool {
        TlsSession::shutdown_complete(self)
    }

    fn supports_close_notify(&self) -> bool {
        TlsSession::supports_close_notify(self)
    }
}

fn yes(flag: bool) -> &'static str {
    if flag {
        "yes"
    } else {
        "no"
    }
}

/// Relay until both sides are finished. `counters` is updated as bytes move
/// so the totals survive an error.
pub async fn transfer<C: TlsChannel>(
    local: &LocalPair,
    tls: &mut C,
    timeouts: &Timeouts,
    strict_close: bool,
    counters: &mut Counters,
) -> Result<()> {
    // plaintext -> TLS
    let mut sock_buf = TransferBuffer::new();
    // TLS -> plaintext
    let mut tls_buf = TransferBuffer::new();
    let mut open = Directions::open();
    let mut closing = CloseState::Open;
    let mut watchdog = Watchdog::default();

    loop {
        let mut check_pending = false;
        let want_rd = tls.wants_read();
        let want_wr = tls.wants_write();
        // decrypted data the transport will never signal again
        let tls_pending = open.tls_rd && tls_buf.has_room() && tls.pending() > 0;

        let busy = (open.plain_rd && open.tls_rd) || !tls_buf.is_empty() || !sock_buf.is_empty();
        let limit = if busy { timeouts.idle } else { timeouts.close };

        let ready = {
            let mut set = PollSet::new();
            if open.plain_rd && sock_buf.has_room() {
                set.add(Slot::PlainRead, local.rd.transport());
            }
            if (open.tls_rd && tls_buf.has_room())
                || ((!sock_buf.is_empty() || closing == CloseState::Retry) && want_rd)
            {
                set.add(Slot::TlsRead, tls.read_transport());
            }
            if !tls_buf.is_empty() {
                set.add(Slot::PlainWrite, local.wr.transport());
            }
            if !sock_buf.is_empty()
                || closing == CloseState::Init
                || ((tls_buf.has_room() || closing == CloseState::Retry) && want_wr)
            {
                set.add(Slot::TlsWrite, tls.write_transport());
            }
            if tls_pending {
                set.wake_now();
            }
            wait(&set, limit).await?
        };

        let ready = match ready {
            Some(ready) => ready,
            None if busy => {
                info!("Transfer wait timeout: connection reset");
                return Err(Error::Timeout("transfer"));
            }
            None => {
                info!("Transfer wait timeout: connection close");
                return Ok(());
            }
        };

        let plain_can_rd = ready.is_ready(Slot::PlainRead);
        let plain_can_wr = ready.is_ready(Slot::PlainWrite);
        let tls_can_rd = ready.is_ready(Slot::TlsRead);
        let tls_can_wr = ready.is_ready(Slot::TlsWrite);

        if ready == Readiness::default() && !tls_pending {
            error!("INTERNAL ERROR: readiness wait returned, but no transport is ready");
            return Err(Error::Internal("readiness wait returned with nothing ready".into()));
        }

        // close_notify
        if closing == CloseState::Init
            || (closing == CloseState::Retry
                && ((tls.wants_read() && tls_can_rd) || (tls.wants_write() && tls_can_wr)))
        {
            match tls.shutdown()? {
                ShutdownStep::Complete => {
                    info!("TLS shutdown successfully sent close_notify");
                    closing = closing.on(CloseEvent::ShutdownDone);
                }
                ShutdownStep::InProgress => {
                    debug!("TLS shutdown retrying");
                    closing = closing.on(CloseEvent::ShutdownPending);
                }
            }
        }

        // plaintext write
        if open.plain_wr && plain_can_wr {
            match local.wr.transport().try_write(tls_buf.filled()) {
                Ok(0) => debug!("No data written to the socket: retrying"),
                Ok(n) => {
                    if tls_buf.is_full() {
                        check_pending = true;
                    }
                    tls_buf.consume(n);
                    counters.to_plain += n as u64;
                    watchdog.progress();
                }
                Err(e) if is_transient(&e) => debug!("Socket write: {}: retrying", e),
                Err(e) => return Err(e.into()),
            }
        }

        // TLS write
        if open.tls_wr
            && !sock_buf.is_empty()
            && (tls_can_wr || (tls.wants_read() && tls_can_rd))
        {
            match tls.write(sock_buf.filled())? {
                TlsWrite::Written(n) => {
                    sock_buf.consume(n);
                    counters.to_tls += n as u64;
                    watchdog.progress();
                }
                TlsWrite::WantWrite => debug!("TLS write returned WANT_WRITE: retrying"),
                TlsWrite::WantRead => debug!("TLS write returned WANT_READ: retrying"),
            }
        }

        // records still queued from earlier writes
        if sock_buf.is_empty() && tls_can_wr && tls.wants_write() {
            let n = tls.flush()?;
            if n > 0 {
                debug!("TLS flushed {} queued byte(s)", n);
                watchdog.progress();
            }
        }

        // plaintext read
        if open.plain_rd && plain_can_rd && sock_buf.has_room() {
            match local.rd.transport().try_read(sock_buf.spare()) {
                Ok(0) => {
                    debug!("Socket closed on read");
                    open.plain_rd = false;
                }
                Ok(n) => {
                    sock_buf.commit(n);
                    watchdog.progress();
                }
                Err(e) if is_transient(&e) => debug!("Socket read: {}: retrying", e),
                Err(e) => return Err(e.into()),
            }
        }

        // TLS read
        if open.tls_rd
            && tls_buf.has_room()
            && (tls_can_rd
                || (tls.wants_write() && tls_can_wr)
                || tls_pending
                || (check_pending && tls.pending() > 0))
        {
            match tls.read(tls_buf.spare())? {
                TlsRead::Data(n) => {
                    tls_buf.commit(n);
                    if n > 0 {
                        watchdog.progress();
                    }
                }
                TlsRead::WantWrite => debug!("TLS read returned WANT_WRITE: retrying"),
                TlsRead::WantRead => debug!("TLS read returned WANT_READ: retrying"),
                TlsRead::Closed => {
                    debug!("TLS closed on read");
                    open.tls_rd = false;
                }
                TlsRead::Eof => {
                    if !sock_buf.is_empty() {
                        error!(
                            "TLS transport closed with {} byte(s) in buffer",
                            sock_buf.len()
                        );
                        return Err(Error::Io(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            format!("TLS transport closed with {} byte(s) in buffer", sock_buf.len()),
                        )));
                    }
                    if strict_close {
                        warn!("TLS transport closed without close_notify");
                        return Err(Error::Protocol("peer closed without close_notify".into()));
                    }
                    debug!("TLS transport closed on read");
                    open.tls_rd = false;
                    open.tls_wr = false;
                    closing = closing.on(CloseEvent::Abandon);
                }
            }
        }

        // half-close propagation
        if open.plain_wr && !open.tls_rd && tls_buf.is_empty() {
            debug!("Socket write shutdown");
            open.plain_wr = false;
            local.wr.shutdown(Shutdown::Write);
        }
        if open.tls_wr && (!open.plain_rd || tls.shutdown_complete()) && sock_buf.is_empty() {
            debug!("TLS write shutdown");
            open.tls_wr = false;
            if tls.supports_close_notify() {
                closing = closing.on(CloseEvent::Initiate);
            } else {
                tls.abandon();
                open.tls_rd = false;
                closing = closing.on(CloseEvent::Abandon);
            }
        }
        if closing == CloseState::Retry {
            if !tls.wants_read() && !tls.wants_write() {
                debug!("TLS doesn't need to read or write");
                closing = closing.on(CloseEvent::Idle);
            }
            if watchdog.retries_exhausted() {
                warn!("Too many retries on TLS shutdown");
                closing = closing.on(CloseEvent::RetriesExhausted);
            }
        }

        if watchdog.tick() {
            error!("INTERNAL ERROR: transfer loop executes not transferring any data");
            error!(
                "socket open: rd={} wr={}, tls open: rd={} wr={}",
                yes(open.plain_rd),
                yes(open.plain_wr),
                yes(open.tls_rd),
                yes(open.tls_wr)
            );
            error!(
                "socket ready: rd={} wr={}, tls ready: rd={} wr={}",
                yes(plain_can_rd),
                yes(plain_can_wr),
                yes(tls_can_rd),
                yes(tls_can_wr)
            );
            error!(
                "tls want: rd={} wr={}",
                yes(tls.wants_read()),
                yes(tls.wants_write())
            );
            error!(
                "socket input buffer: {} byte(s), tls input buffer: {} byte(s)",
                sock_buf.len(),
                tls_buf.len()
            );
            error!("check_pending={}, closing={:?}", check_pending, closing);
            return Err(Error::Internal(
                "transfer loop executes not transferring any data".into(),
            ));
        }

        if !open.plain_wr && closing == CloseState::Closed {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Endpoint;
    use crate::error::ErrorKind;
    use proptest::prelude::*;
    use std::collections::VecDeque;
    use std::time::Duration;
    use tokio::net::UnixStream;

    #[test]
    fn test_close_state_transition_table() {
        use CloseEvent::*;
        use CloseState::*;

        let table = [
            (Open, Initiate, Init),
            (Open, Abandon, Closed),
            (Open, ShutdownDone, Open),
            (Open, ShutdownPending, Open),
            (Open, Idle, Open),
            (Open, RetriesExhausted, Open),
            (Init, Initiate, Init),
            (Init, Abandon, Closed),
            (Init, ShutdownDone, Closed),
            (Init, ShutdownPending, Retry),
            (Init, Idle, Init),
            (Init, RetriesExhausted, Init),
            (Retry, Initiate, Retry),
            (Retry, Abandon, Closed),
            (Retry, ShutdownDone, Closed),
            (Retry, ShutdownPending, Retry),
            (Retry, Idle, Closed),
            (Retry, RetriesExhausted, Closed),
            (Closed, Initiate, Closed),
            (Closed, Abandon, Closed),
            (Closed, ShutdownDone, Closed),
            (Closed, ShutdownPending, Closed),
            (Closed, Idle, Closed),
            (Closed, RetriesExhausted, Closed),
        ];
        assert_eq!(table.len(), 4 * 6);
        for (state, event, expected) in table {
            assert_eq!(state.on(event), expected, "{:?} on {:?}", state, event);
        }
    }

    #[test]
    fn test_watchdog_limits() {
        let mut dog = Watchdog::default();
        for _ in 0..RETRY_LIMIT {
            assert!(!dog.tick());
        }
        assert!(!dog.retries_exhausted());
        dog.tick();
        assert!(dog.retries_exhausted());
        for _ in 0..(STALL_LIMIT - RETRY_LIMIT - 1) {
            assert!(!dog.tick());
        }
        assert!(dog.tick());
        dog.progress();
        assert!(!dog.retries_exhausted());
    }

    #[test]
    fn test_buffer_shifts_on_partial_consume() {
        let mut buf = TransferBuffer::new();
        buf.spare()[..5].copy_from_slice(b"hello");
        buf.commit(5);
        buf.consume(2);
        assert_eq!(buf.filled(), b"llo");
        assert_eq!(buf.spare().len(), BUFFER_SIZE - 3);
    }

    proptest! {
        #[test]
        fn prop_buffer_is_bounded_fifo(ops in proptest::collection::vec((any::<bool>(), 0usize..20_000), 1..64)) {
            let mut buf = TransferBuffer::new();
            let mut model = VecDeque::new();
            let mut next = 0u8;

            for (fill, amount) in ops {
                if fill {
                    let n = amount.min(buf.spare().len());
                    for b in &mut buf.spare()[..n] {
                        *b = next;
                        model.push_back(next);
                        next = next.wrapping_add(1);
                    }
                    buf.commit(n);
                } else {
                    let n = amount.min(buf.len());
                    buf.consume(n);
                    model.drain(..n);
                }
                prop_assert!(buf.len() <= BUFFER_SIZE);
                prop_assert_eq!(buf.len(), model.len());
                prop_assert!(buf.filled().iter().eq(model.iter()));
            }
        }
    }

    /// A channel whose transport is always readable but which never yields data.
    #[derive(Debug)]
    struct Stalled {
        io: UnixStream,
        eof: bool,
    }

    impl TlsChannel for Stalled {
        fn read_transport(&self) -> &dyn Transport {
            &self.io
        }

        fn write_transport(&self) -> &dyn Transport {
            &self.io
        }

        fn read(&mut self, _buf: &mut [u8]) -> Result<TlsRead> {
            if self.eof {
                Ok(TlsRead::Eof)
            } else {
                Ok(TlsRead::WantRead)
            }
        }

        fn write(&mut self, _buf: &[u8]) -> Result<TlsWrite> {
            Ok(TlsWrite::WantWrite)
        }

        fn shutdown(&mut self) -> Result<ShutdownStep> {
            Ok(ShutdownStep::Complete)
        }

        fn flush(&mut self) -> Result<usize> {
            Ok(0)
        }

        fn abandon(&mut self) {}

        fn wants_read(&self) -> bool {
            true
        }

        fn wants_write(&self) -> bool {
            false
        }

        fn pending(&mut self) -> usize {
            0
        }

        fn shutdown_complete(&self) -> bool {
            false
        }

        fn supports_close_notify(&self) -> bool {
            true
        }
    }

    struct Harness {
        local: LocalPair,
        channel: Stalled,
        _local_peer: UnixStream,
        _tls_peer: UnixStream,
    }

    fn harness(eof: bool) -> Harness {
        let (local, local_peer) = UnixStream::pair().unwrap();
        let (tls, tls_peer) = UnixStream::pair().unwrap();
        // keeps the TLS transport readable forever, the fake never consumes it
        tls_peer.try_write(b"x").unwrap();
        Harness {
            local: LocalPair::duplex(Endpoint::new(local)),
            channel: Stalled { io: tls, eof },
            _local_peer: local_peer,
            _tls_peer: tls_peer,
        }
    }

    #[tokio::test]
    async fn test_stalled_channel_is_internal_error() {
        let mut h = harness(false);
        let mut counters = Counters::default();
        let err = transfer(&h.local, &mut h.channel, &Timeouts::default(), false, &mut counters)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert_eq!(counters, Counters::default());
    }

    #[tokio::test]
    async fn test_lenient_eof_closes_cleanly() {
        let mut h = harness(true);
        let mut counters = Counters::default();
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            transfer(&h.local, &mut h.channel, &Timeouts::default(), false, &mut counters),
        )
        .await
        .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_strict_eof_is_protocol_error() {
        let mut h = harness(true);
        let mut counters = Counters::default();
        let err = transfer(&h.local, &mut h.channel, &Timeouts::default(), true, &mut counters)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    async fn session_pair(
        tls: UnixStream,
        peer: UnixStream,
    ) -> (TlsSession, TlsSession) {
        use crate::keycache::{EcdsaKeys, KeyCache};
        use crate::options::{Role, ServiceOptions, VerifyLevel};
        use crate::tls::{HandshakeStep, TlsContext};
        use crate::trust::TrustPolicy;
        use std::sync::Arc;

        let keys = Arc::new(KeyCache::new(EcdsaKeys));
        let policy = Arc::new(TrustPolicy::new(VerifyLevel::None, false, Vec::new(), None));
        let client_opts = ServiceOptions::new("client", Role::Client, vec!["1".into()]);
        let server_opts = ServiceOptions::new("server", Role::Server, vec!["1".into()]);
        let client_ctx =
            TlsContext::build(&client_opts, Arc::clone(&policy), &keys, Some("localhost")).unwrap();
        let server_ctx = TlsContext::build(&server_opts, policy, &keys, None).unwrap();

        let tls = Endpoint::new(tls);
        let peer = Endpoint::new(peer);
        let mut client = client_ctx.session(tls.clone(), tls).unwrap();
        let mut server = server_ctx.session(peer.clone(), peer).unwrap();
        for _ in 0..100 {
            let c = client.handshake().unwrap();
            let s = server.handshake().unwrap();
            if c == HandshakeStep::Done && s == HandshakeStep::Done {
                return (client, server);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("handshake did not complete");
    }

    #[tokio::test]
    async fn test_queued_records_reach_a_slow_half_closed_peer() {
        use tokio::io::AsyncWriteExt;

        const PAYLOAD: usize = 256 * 1024;

        let (tls, peer) = UnixStream::pair().unwrap();
        socket2::SockRef::from(&tls).set_send_buffer_size(4096).unwrap();
        let (mut client, mut server) = session_pair(tls, peer).await;

        // the peer is done sending but keeps reading
        server.shutdown().unwrap();

        let (local, app) = UnixStream::pair().unwrap();
        let local = LocalPair::duplex(Endpoint::new(local));
        let (_app_rd, mut app_wr) = app.into_split();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();

        let mut counters = Counters::default();
        let timeouts = Timeouts::default();
        let relay = transfer(&local, &mut client, &timeouts, false, &mut counters);

        let app = async move {
            let payload: Vec<u8> = (0..PAYLOAD).map(|i| (i % 251) as u8).collect();
            app_wr.write_all(&payload).await.unwrap();
            done_rx.await.unwrap();
            app_wr.shutdown().await.unwrap();
        };

        let reader = async move {
            let mut received = Vec::with_capacity(PAYLOAD);
            let mut buf = vec![0u8; 4096];
            while received.len() < PAYLOAD {
                match server.read(&mut buf).unwrap() {
                    TlsRead::Data(n) => received.extend_from_slice(&buf[..n]),
                    TlsRead::WantRead | TlsRead::WantWrite => {}
                    other => panic!("unexpected {:?}", other),
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            done_tx.send(()).unwrap();
            received
        };

        let (result, (), received) = tokio::time::timeout(
            Duration::from_secs(30),
            async { tokio::join!(relay, app, reader) },
        )
        .await
        .unwrap();

        result.unwrap();
        assert_eq!(received.len(), PAYLOAD);
        assert!(received.iter().enumerate().all(|(i, b)| *b == (i % 251) as u8));
        assert_eq!(counters.to_tls, PAYLOAD as u64);
        assert_eq!(counters.to_plain, 0);
    }
}
