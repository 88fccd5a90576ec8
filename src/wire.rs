//! Wire I/O (C1): byte-level read/write on a connection with
//! wait/timeout/non-block semantics, shared by both the server and
//! client state machines.
//!
//! A single global abort flag ([`crate::signal`]) is consulted by
//! [`Connection::wait`] so a shutdown request can terminate a suspended
//! transaction even though it is not making progress.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream as ClientTlsStream;
use tokio_rustls::server::TlsStream as ServerTlsStream;

/// Readiness bitmask returned by [`Connection::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    /// The wait was interrupted (e.g. by the halt signal) before the
    /// timeout elapsed and without becoming ready; callers should loop.
    pub retry: bool,
}

impl Readiness {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_ready(&self) -> bool {
        self.readable || self.writable
    }
}

/// What to wait for in [`Connection::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitFor {
    pub read: bool,
    pub write: bool,
}

impl WaitFor {
    pub fn read() -> Self {
        WaitFor { read: true, write: false }
    }
    pub fn write() -> Self {
        WaitFor { read: false, write: true }
    }
    pub fn both() -> Self {
        WaitFor { read: true, write: true }
    }
}

/// Capability set a connection endpoint must provide, regardless of
/// whether it is a plain TCP socket or a TLS session. Plain and TLS
/// implementations both satisfy this same contract; only TLS's `wait`
/// also inspects protocol-level pending bytes and "wants read/write"
/// hints from the TLS state machine (approximated here by falling
/// back to the underlying TCP socket's readiness).
#[async_trait]
pub trait Connection: Send {
    /// Read up to `buf.len()` bytes without blocking past `deadline`.
    /// Returns `Ok(0)` on clean EOF.
    async fn read_timeout(&mut self, buf: &mut [u8], deadline: Duration) -> io::Result<usize>;

    /// Write all of `buf`, retrying short writes, without blocking past
    /// `deadline`.
    async fn write_timeout(&mut self, buf: &[u8], deadline: Duration) -> io::Result<()>;

    /// Non-blocking read: `Ok(Some(n))` with `n` bytes read (0 = EOF),
    /// or `Ok(None)` if the read would block.
    async fn try_read(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>>;

    /// Non-blocking write: `Ok(Some(n))` bytes written, or `Ok(None)`
    /// if the write would block.
    async fn try_write(&mut self, buf: &[u8]) -> io::Result<Option<usize>>;

    /// Wait for readability/writability (or both), bounded by
    /// `timeout_ms`, honoring the global halt flag.
    async fn wait(&mut self, want: WaitFor, timeout_ms: u64) -> io::Result<Readiness>;

    /// Abrupt close (used on error paths after nothing useful can be
    /// salvaged).
    async fn close_hard(&mut self);

    /// Graceful close: flush, then shut down the write half, allowing
    /// the peer to observe EOF (used after a full response has been
    /// sent).
    async fn close_linger(&mut self);

    fn peer_addr(&self) -> Option<SocketAddr>;
    fn local_addr(&self) -> Option<SocketAddr>;

    /// True for ICAPS (TLS) connections; consulted by the access
    /// control layer and format interpolation.
    fn is_tls(&self) -> bool {
        false
    }
}

async fn wait_plain(stream: &TcpStream, want: WaitFor, timeout_ms: u64) -> io::Result<Readiness> {
    let dur = Duration::from_millis(timeout_ms);
    let fut = async {
        let mut readiness = Readiness::none();
        tokio::select! {
            res = stream.readable(), if want.read => {
                res?;
                readiness.readable = true;
            }
            res = stream.writable(), if want.write => {
                res?;
                readiness.writable = true;
            }
        }
        Ok::<_, io::Error>(readiness)
    };
    tokio::select! {
        res = fut => res,
        _ = tokio::time::sleep(dur) => Ok(Readiness::none()),
        _ = crate::signal::wait_for_halt() => {
            let mut r = Readiness::none();
            r.retry = true;
            Ok(r)
        }
    }
}

/// Plain-TCP connection implementing [`Connection`].
pub struct TcpConnection {
    stream: TcpStream,
    peer: Option<SocketAddr>,
    local: Option<SocketAddr>,
}

impl TcpConnection {
    pub fn new(stream: TcpStream) -> Self {
        let peer = stream.peer_addr().ok();
        let local = stream.local_addr().ok();
        TcpConnection { stream, peer, local }
    }
}

#[async_trait]
impl Connection for TcpConnection {
    async fn read_timeout(&mut self, buf: &mut [u8], deadline: Duration) -> io::Result<usize> {
        match timeout(deadline, self.stream.read(buf)).await {
            Ok(res) => res,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out")),
        }
    }

    async fn write_timeout(&mut self, buf: &[u8], deadline: Duration) -> io::Result<()> {
        match timeout(deadline, self.stream.write_all(buf)).await {
            Ok(res) => res,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out")),
        }
    }

    async fn try_read(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        match self.stream.try_read(buf) {
            Ok(n) => Ok(Some(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn try_write(&mut self, buf: &[u8]) -> io::Result<Option<usize>> {
        match self.stream.try_write(buf) {
            Ok(n) => Ok(Some(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn wait(&mut self, want: WaitFor, timeout_ms: u64) -> io::Result<Readiness> {
        wait_plain(&self.stream, want, timeout_ms).await
    }

    async fn close_hard(&mut self) {
        if let Err(e) = self.stream.set_linger(Some(Duration::from_secs(0))) {
            log::trace!("set_linger(0) failed on hard close: {e}");
        }
        let _ = self.stream.shutdown().await;
    }

    async fn close_linger(&mut self) {
        let _ = self.stream.flush().await;
        let _ = self.stream.shutdown().await;
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }
}

/// Either role of a TLS-wrapped ICAPS connection; the core only needs
/// a byte-stream contract, so both roles are wrapped uniformly.
enum TlsRole {
    Server(ServerTlsStream<TcpStream>),
    Client(ClientTlsStream<TcpStream>),
}

pub struct TlsConnection {
    role: TlsRole,
    peer: Option<SocketAddr>,
    local: Option<SocketAddr>,
}

impl TlsConnection {
    pub fn new_server(stream: ServerTlsStream<TcpStream>) -> Self {
        let (io, _) = stream.get_ref();
        let peer = io.peer_addr().ok();
        let local = io.local_addr().ok();
        TlsConnection { role: TlsRole::Server(stream), peer, local }
    }

    pub fn new_client(stream: ClientTlsStream<TcpStream>) -> Self {
        let (io, _) = stream.get_ref();
        let peer = io.peer_addr().ok();
        let local = io.local_addr().ok();
        TlsConnection { role: TlsRole::Client(stream), peer, local }
    }
}

#[async_trait]
impl Connection for TlsConnection {
    async fn read_timeout(&mut self, buf: &mut [u8], deadline: Duration) -> io::Result<usize> {
        let fut = async {
            match &mut self.role {
                TlsRole::Server(s) => s.read(buf).await,
                TlsRole::Client(s) => s.read(buf).await,
            }
        };
        match timeout(deadline, fut).await {
            Ok(res) => res,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out")),
        }
    }

    async fn write_timeout(&mut self, buf: &[u8], deadline: Duration) -> io::Result<()> {
        let fut = async {
            match &mut self.role {
                TlsRole::Server(s) => s.write_all(buf).await,
                TlsRole::Client(s) => s.write_all(buf).await,
            }
        };
        match timeout(deadline, fut).await {
            Ok(res) => res,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out")),
        }
    }

    async fn try_read(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        // rustls streams don't expose a non-blocking try_read; a
        // zero-duration deadline approximates the same contract.
        match timeout(Duration::from_millis(0), self.read_timeout(buf, Duration::from_secs(3600))).await {
            Ok(Ok(n)) => Ok(Some(n)),
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(None),
        }
    }

    async fn try_write(&mut self, buf: &[u8]) -> io::Result<Option<usize>> {
        match timeout(Duration::from_millis(0), self.write_timeout(buf, Duration::from_secs(3600))).await {
            Ok(Ok(())) => Ok(Some(buf.len())),
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(None),
        }
    }

    async fn wait(&mut self, want: WaitFor, timeout_ms: u64) -> io::Result<Readiness> {
        let stream: &TcpStream = match &self.role {
            TlsRole::Server(s) => &s.get_ref().0,
            TlsRole::Client(s) => &s.get_ref().0,
        };
        wait_plain(stream, want, timeout_ms).await
    }

    async fn close_hard(&mut self) {
        match &mut self.role {
            TlsRole::Server(s) => {
                let _ = s.get_mut().0.set_linger(Some(Duration::from_secs(0)));
                let _ = s.shutdown().await;
            }
            TlsRole::Client(s) => {
                let _ = s.get_mut().0.set_linger(Some(Duration::from_secs(0)));
                let _ = s.shutdown().await;
            }
        }
    }

    async fn close_linger(&mut self) {
        match &mut self.role {
            TlsRole::Server(s) => {
                let _ = s.flush().await;
                let _ = s.shutdown().await;
            }
            TlsRole::Client(s) => {
                let _ = s.flush().await;
                let _ = s.shutdown().await;
            }
        }
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    fn is_tls(&self) -> bool {
        true
    }
}
