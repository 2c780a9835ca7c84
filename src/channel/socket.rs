use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use rustls::pki_types::CertificateDer;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::{TlsAcceptor, TlsStream};
use tracing::debug;

use crate::{Error, Result};

/// A connected stream, plaintext or TLS.
pub enum Socket {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Socket {
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.tcp().peer_addr()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.tcp().local_addr()
    }

    pub fn is_secure(&self) -> bool {
        matches!(self, Socket::Tls(_))
    }

    /// Negotiated TLS protocol version and cipher suite, for diagnostics.
    pub fn negotiated(&self) -> Option<(String, String)> {
        let Socket::Tls(stream) = self else {
            return None;
        };
        let (_, connection) = stream.get_ref();
        let version = connection.protocol_version().map(|v| format!("{:?}", v))?;
        let suite = connection
            .negotiated_cipher_suite()
            .map(|s| format!("{:?}", s.suite()))?;
        Some((version, suite))
    }

    /// End-entity certificate presented by the peer.
    pub fn peer_certificate(&self) -> Option<CertificateDer<'static>> {
        let Socket::Tls(stream) = self else {
            return None;
        };
        let (_, connection) = stream.get_ref();
        connection.peer_certificates()?.first().cloned()
    }

    fn tcp(&self) -> &TcpStream {
        match self {
            Socket::Plain(stream) => stream,
            Socket::Tls(stream) => stream.get_ref().0,
        }
    }
}

impl AsyncRead for Socket {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Socket::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Socket::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Socket {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Socket::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Socket::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Socket::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Socket::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Socket::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Socket::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// A freshly accepted TCP connection whose TLS handshake, if any, has not
/// run yet. The handshake is driven by the connection's own task.
pub struct IncomingSocket {
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: Option<TlsAcceptor>,
}

impl IncomingSocket {
    pub(crate) fn new(stream: TcpStream, peer: SocketAddr, acceptor: Option<TlsAcceptor>) -> Self {
        Self {
            stream,
            peer,
            acceptor,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn requires_handshake(&self) -> bool {
        self.acceptor.is_some()
    }

    pub async fn handshake(self, limit: Duration) -> Result<Socket> {
        let Some(acceptor) = self.acceptor else {
            return Ok(Socket::Plain(self.stream));
        };

        let stream = timeout(limit, acceptor.accept(self.stream))
            .await
            .map_err(|_| Error::Timeout {
                message: format!("TLS handshake with {}", self.peer),
            })?
            .map_err(|e| Error::Handshake(format!("peer {}: {}", self.peer, e)))?;

        debug!(peer = %self.peer, "TLS handshake completed");
        Ok(Socket::Tls(Box::new(TlsStream::Server(stream))))
    }
}
