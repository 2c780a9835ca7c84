//! Listening and connecting sockets with optional TLS.

pub mod socket;
pub mod tls;

pub use socket::{IncomingSocket, Socket};
pub use tls::{ClientTls, KeyStore, ServerTls};

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_rustls::{TlsAcceptor, TlsStream};
use tracing::{debug, info};

use crate::endpoint::Endpoint;
use crate::{Error, Result};

/// Default timeout for TCP connection establishment.
pub const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for the client side of the TLS handshake.
pub const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Server side of a THL connection endpoint.
///
/// `close()` may be called from any task; it is idempotent and wakes a
/// pending `accept()` immediately, which then fails with
/// [`Error::Terminated`].
pub struct SecureChannel {
    endpoint: Endpoint,
    local_addr: SocketAddr,
    listener: Mutex<Option<Arc<TcpListener>>>,
    acceptor: Option<TlsAcceptor>,
    closed: watch::Sender<bool>,
}

impl SecureChannel {
    pub async fn bind(endpoint: &Endpoint, tls: Option<&ServerTls>) -> Result<Self> {
        let acceptor = match (endpoint.is_secure(), tls) {
            (true, Some(tls)) => Some(tls.acceptor()),
            (true, None) => {
                return Err(Error::Config(format!(
                    "Secure endpoint {} requires TLS settings",
                    endpoint
                )))
            }
            (false, Some(_)) => {
                return Err(Error::Config(format!(
                    "TLS settings supplied for plaintext endpoint {}",
                    endpoint
                )))
            }
            (false, None) => None,
        };

        let address = endpoint.socket_address();
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|source| Error::Bind {
                address: address.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        info!(
            endpoint = %endpoint,
            local_addr = %local_addr,
            secure = endpoint.is_secure(),
            "Opened listening socket"
        );

        let (closed, _) = watch::channel(false);
        Ok(Self {
            endpoint: endpoint.clone(),
            local_addr,
            listener: Mutex::new(Some(Arc::new(listener))),
            acceptor,
            closed,
        })
    }

    pub async fn accept(&self) -> Result<IncomingSocket> {
        let closed = self.closed.subscribe();
        let already_closed = *closed.borrow();
        if already_closed {
            return Err(Error::Terminated);
        }
        let listener = self
            .listener
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
            .ok_or(Error::Terminated)?;

        tokio::select! {
            biased;
            _ = wait_closed(closed) => Err(Error::Terminated),
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                stream.set_nodelay(true)?;
                debug!(peer = %peer, "Accepted connection");
                Ok(IncomingSocket::new(stream, peer, self.acceptor.clone()))
            }
        }
    }

    pub fn close(&self) {
        if !self.closed.send_replace(true) {
            debug!(endpoint = %self.endpoint, "Closed channel");
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Closes the channel and drops the listening socket, freeing the port
    /// once any in-flight `accept()` has returned.
    pub fn release(&self) {
        self.close();
        if let Ok(mut guard) = self.listener.lock() {
            if guard.take().is_some() {
                info!(endpoint = %self.endpoint, local_addr = %self.local_addr, "Released listening socket");
            }
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn is_secure(&self) -> bool {
        self.acceptor.is_some()
    }

    /// Client side: opens a socket to `endpoint`, running the TLS handshake
    /// when the endpoint is secure.
    pub async fn connect(endpoint: &Endpoint, tls: Option<&ClientTls>) -> Result<Socket> {
        let address = endpoint.socket_address();
        let stream = timeout(TCP_CONNECT_TIMEOUT, TcpStream::connect(&address))
            .await
            .map_err(|_| Error::Timeout {
                message: format!("connect to {}", address),
            })??;
        stream.set_nodelay(true)?;

        if !endpoint.is_secure() {
            return Ok(Socket::Plain(stream));
        }

        let tls = tls.ok_or_else(|| {
            Error::Config(format!("Secure endpoint {} requires TLS settings", endpoint))
        })?;
        let server_name = ServerName::try_from(endpoint.host.clone())
            .map_err(|e| Error::Config(format!("Invalid server name {}: {}", endpoint.host, e)))?;

        let stream = timeout(TLS_HANDSHAKE_TIMEOUT, tls.connector().connect(server_name, stream))
            .await
            .map_err(|_| Error::Timeout {
                message: format!("TLS handshake with {}", address),
            })?
            .map_err(|e| Error::Handshake(format!("{}: {}", address, e)))?;

        Ok(Socket::Tls(Box::new(TlsStream::Client(stream))))
    }
}

impl Drop for SecureChannel {
    fn drop(&mut self) {
        self.closed.send_replace(true);
    }
}

async fn wait_closed(mut closed: watch::Receiver<bool>) {
    loop {
        let is_closed = *closed.borrow_and_update();
        if is_closed {
            return;
        }
        if closed.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Scheme;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn local() -> Endpoint {
        Endpoint::new(Scheme::Plaintext, "127.0.0.1", 0)
    }

    #[tokio::test]
    async fn test_close_unblocks_accept() {
        let channel = Arc::new(SecureChannel::bind(&local(), None).await.unwrap());

        let accepting = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.accept().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        channel.close();
        let result = timeout(Duration::from_secs(1), accepting).await.unwrap().unwrap();
        assert!(matches!(result, Err(Error::Terminated)));

        // Idempotent, and accept keeps reporting termination.
        channel.close();
        assert!(channel.is_closed());
        assert!(matches!(channel.accept().await, Err(Error::Terminated)));
    }

    #[tokio::test]
    async fn test_accept_and_connect_plaintext() {
        let channel = SecureChannel::bind(&local(), None).await.unwrap();
        let target = local().with_port(channel.local_addr().port());

        let client = tokio::spawn(async move {
            let mut socket = SecureChannel::connect(&target, None).await.unwrap();
            socket.write_all(b"ping").await.unwrap();
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await.unwrap();
            buf
        });

        let incoming = channel.accept().await.unwrap();
        assert!(!incoming.requires_handshake());
        let mut socket = incoming.handshake(Duration::from_secs(1)).await.unwrap();
        let mut buf = [0u8; 4];
        socket.read_exact(&mut buf).await.unwrap();
        socket.write_all(&buf).await.unwrap();

        assert_eq!(&client.await.unwrap(), b"ping");
    }

    #[tokio::test]
    async fn test_release_frees_port() {
        let channel = SecureChannel::bind(&local(), None).await.unwrap();
        let port = channel.local_addr().port();
        channel.release();

        let rebound = SecureChannel::bind(&local().with_port(port), None).await;
        assert!(rebound.is_ok());
    }

    #[tokio::test]
    async fn test_bind_port_in_use() {
        let first = SecureChannel::bind(&local(), None).await.unwrap();
        let taken = local().with_port(first.local_addr().port());
        let result = SecureChannel::bind(&taken, None).await;
        assert!(matches!(result, Err(Error::Bind { .. })));
    }

    #[tokio::test]
    async fn test_secure_endpoint_requires_tls() {
        let endpoint = Endpoint::new(Scheme::Secure, "127.0.0.1", 0);
        let result = SecureChannel::bind(&endpoint, None).await;
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
