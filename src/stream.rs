//! The stream handed back to callers, whichever path produced it.

use crate::ssh_jump::SshTunnel;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::{Instant, Sleep};
use tokio_rustls::client::TlsStream;
use tokio_socks::tcp::Socks5Stream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelKind {
    Direct,
    Http,
    Https,
    Socks5,
    SshJump,
}

impl fmt::Display for TunnelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelKind::Direct => write!(f, "direct"),
            TunnelKind::Http => write!(f, "http"),
            TunnelKind::Https => write!(f, "https"),
            TunnelKind::Socks5 => write!(f, "socks5"),
            TunnelKind::SshJump => write!(f, "ssh"),
        }
    }
}

/// Socket to an HTTP(S) proxy, before or after TLS.
pub(crate) enum ProxyIo {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for ProxyIo {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ProxyIo::Plain(s) => Pin::new(s).poll_read(cx, buf),
            ProxyIo::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ProxyIo {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ProxyIo::Plain(s) => Pin::new(s).poll_write(cx, buf),
            ProxyIo::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ProxyIo::Plain(s) => Pin::new(s).poll_flush(cx),
            ProxyIo::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ProxyIo::Plain(s) => Pin::new(s).poll_shutdown(cx),
            ProxyIo::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

enum Inner {
    Direct(TcpStream),
    // The BufReader may already hold bytes the proxy sent right after its
    // response headers; reads drain it before touching the socket again.
    Http { io: BufReader<ProxyIo>, tls: bool },
    Socks5(Socks5Stream<TcpStream>),
    SshJump(Box<SshTunnel>),
}

#[derive(Default)]
struct Deadline {
    sleep: Option<Pin<Box<Sleep>>>,
}

impl Deadline {
    fn set(&mut self, at: Option<Instant>) {
        self.sleep = at.map(|at| Box::pin(tokio::time::sleep_until(at)));
    }

    fn poll_expired(&mut self, cx: &mut Context<'_>) -> bool {
        match self.sleep.as_mut() {
            Some(sleep) => sleep.as_mut().poll(cx).is_ready(),
            None => false,
        }
    }
}

fn deadline_exceeded() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "i/o deadline exceeded")
}

/// A connected byte stream to the dial target, either direct or tunneled
/// through a proxy.
///
/// Read and write halves are meant to be driven by one task at a time; use
/// `tokio::io::split` to share it.
pub struct TunnelConnection {
    inner: Inner,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    read_deadline: Deadline,
    write_deadline: Deadline,
}

impl fmt::Debug for TunnelConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelConnection")
            .field("kind", &self.kind())
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}

impl TunnelConnection {
    fn from_inner(inner: Inner, local_addr: SocketAddr, peer_addr: SocketAddr) -> Self {
        Self {
            inner,
            local_addr,
            peer_addr,
            read_deadline: Deadline::default(),
            write_deadline: Deadline::default(),
        }
    }

    pub(crate) fn direct(stream: TcpStream) -> io::Result<Self> {
        let local = stream.local_addr()?;
        let peer = stream.peer_addr()?;
        Ok(Self::from_inner(Inner::Direct(stream), local, peer))
    }

    pub(crate) fn http(io: BufReader<ProxyIo>, tls: bool, local: SocketAddr, peer: SocketAddr) -> Self {
        Self::from_inner(Inner::Http { io, tls }, local, peer)
    }

    pub(crate) fn socks5(stream: Socks5Stream<TcpStream>, local: SocketAddr, peer: SocketAddr) -> Self {
        Self::from_inner(Inner::Socks5(stream), local, peer)
    }

    pub(crate) fn ssh_jump(tunnel: SshTunnel) -> Self {
        let (local, peer) = (tunnel.local_addr, tunnel.peer_addr);
        Self::from_inner(Inner::SshJump(Box::new(tunnel)), local, peer)
    }

    pub fn kind(&self) -> TunnelKind {
        match &self.inner {
            Inner::Direct(_) => TunnelKind::Direct,
            Inner::Http { tls: false, .. } => TunnelKind::Http,
            Inner::Http { tls: true, .. } => TunnelKind::Https,
            Inner::Socks5(_) => TunnelKind::Socks5,
            Inner::SshJump(_) => TunnelKind::SshJump,
        }
    }

    /// Local end of the socket this process owns. For a jump-host tunnel
    /// that is the socket to the SSH server, not the forwarded channel.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Remote end of the socket this process owns: the target for direct
    /// connections, the proxy otherwise.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn set_deadline(&mut self, at: Option<Instant>) {
        self.set_read_deadline(at);
        self.set_write_deadline(at);
    }

    pub fn set_read_deadline(&mut self, at: Option<Instant>) {
        self.read_deadline.set(at);
    }

    pub fn set_write_deadline(&mut self, at: Option<Instant>) {
        self.write_deadline.set(at);
    }

    /// Closes the connection. A jump-host tunnel closes its channel first and
    /// then the SSH client; both are attempted and the first error wins.
    pub async fn close(self) -> io::Result<()> {
        match self.inner {
            Inner::Direct(mut s) => s.shutdown().await,
            Inner::Http { mut io, .. } => io.shutdown().await,
            Inner::Socks5(mut s) => s.shutdown().await,
            Inner::SshJump(tunnel) => tunnel.close().await,
        }
    }
}

impl AsyncRead for TunnelConnection {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.read_deadline.poll_expired(cx) {
            return Poll::Ready(Err(deadline_exceeded()));
        }
        match &mut this.inner {
            Inner::Direct(s) => Pin::new(s).poll_read(cx, buf),
            Inner::Http { io, .. } => Pin::new(io).poll_read(cx, buf),
            Inner::Socks5(s) => Pin::new(s).poll_read(cx, buf),
            Inner::SshJump(t) => t.channel.as_mut().poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TunnelConnection {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.write_deadline.poll_expired(cx) {
            return Poll::Ready(Err(deadline_exceeded()));
        }
        match &mut this.inner {
            Inner::Direct(s) => Pin::new(s).poll_write(cx, buf),
            Inner::Http { io, .. } => Pin::new(io).poll_write(cx, buf),
            Inner::Socks5(s) => Pin::new(s).poll_write(cx, buf),
            Inner::SshJump(t) => t.channel.as_mut().poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.write_deadline.poll_expired(cx) {
            return Poll::Ready(Err(deadline_exceeded()));
        }
        match &mut this.inner {
            Inner::Direct(s) => Pin::new(s).poll_flush(cx),
            Inner::Http { io, .. } => Pin::new(io).poll_flush(cx),
            Inner::Socks5(s) => Pin::new(s).poll_flush(cx),
            Inner::SshJump(t) => t.channel.as_mut().poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().inner {
            Inner::Direct(s) => Pin::new(s).poll_shutdown(cx),
            Inner::Http { io, .. } => Pin::new(io).poll_shutdown(cx),
            Inner::Socks5(s) => Pin::new(s).poll_shutdown(cx),
            Inner::SshJump(t) => t.channel.as_mut().poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn connected_pair() -> (TunnelConnection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let conn = TunnelConnection::direct(client.unwrap()).unwrap();
        (conn, server.unwrap().0)
    }

    #[tokio::test]
    async fn test_direct_round_trip_and_addrs() {
        let (mut conn, mut server) = connected_pair().await;
        assert_eq!(conn.kind(), TunnelKind::Direct);
        assert_eq!(conn.peer_addr(), server.local_addr().unwrap());
        assert_eq!(conn.local_addr(), server.peer_addr().unwrap());

        conn.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server.write_all(b"pong").await.unwrap();
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_read_deadline_expires() {
        let (mut conn, _server) = connected_pair().await;
        conn.set_read_deadline(Some(Instant::now() + Duration::from_millis(50)));
        let mut buf = [0u8; 1];
        let err = conn.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_cleared_deadline_allows_reads() {
        let (mut conn, mut server) = connected_pair().await;
        conn.set_deadline(Some(Instant::now()));
        conn.set_deadline(None);
        server.write_all(b"x").await.unwrap();
        let mut buf = [0u8; 1];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"x");
    }

    #[tokio::test]
    async fn test_http_variant_serves_buffered_bytes_first() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let client = client.unwrap();
        let (local, peer) = (client.local_addr().unwrap(), client.peer_addr().unwrap());
        let mut server = server.unwrap().0;

        server.write_all(b"HTTP/1.1 200 OK\r\n\r\nhello").await.unwrap();
        let mut reader = BufReader::new(ProxyIo::Plain(client));
        let resp = crate::response::ConnectResponseParser::parse(&mut reader).await.unwrap();
        assert_eq!(resp.status, 200);

        let mut conn = TunnelConnection::http(reader, false, local, peer);
        assert_eq!(conn.kind(), TunnelKind::Http);
        let mut buf = [0u8; 5];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }
}
