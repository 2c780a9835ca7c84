//! Byte echo, for connectivity checks against a running server.

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use super::{ConnectorHandler, HandlerContext, ShutdownSignal};
use crate::channel::Socket;
use crate::Result;

pub const PROTOCOL: &str = "echo";

const BUFFER_SIZE: usize = 8192;

#[derive(Debug, Default)]
pub struct EchoHandler {
    echoed: u64,
}

impl EchoHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Echoes one read; `false` once the peer has closed.
    async fn echo_once(&mut self, socket: &mut Socket, buffer: &mut [u8]) -> Result<bool> {
        let n = socket.read(buffer).await?;
        if n == 0 {
            return Ok(false);
        }
        socket.write_all(&buffer[..n]).await?;
        socket.flush().await?;
        self.echoed += n as u64;
        Ok(true)
    }
}

impl ConnectorHandler for EchoHandler {
    fn protocol(&self) -> &'static str {
        PROTOCOL
    }

    fn configure(&mut self, _context: &HandlerContext) -> Result<()> {
        Ok(())
    }

    fn prepare<'a>(&'a mut self, _socket: &'a mut Socket) -> BoxFuture<'a, Result<()>> {
        async { Ok(()) }.boxed()
    }

    fn serve<'a>(
        &'a mut self,
        socket: &'a mut Socket,
        mut shutdown: ShutdownSignal,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            let mut buffer = vec![0u8; BUFFER_SIZE];
            loop {
                tokio::select! {
                    _ = shutdown.requested() => return Ok(()),
                    more = self.echo_once(socket, &mut buffer) => {
                        if !more? {
                            return Ok(());
                        }
                    }
                }
            }
        }
        .boxed()
    }

    fn release(&mut self, _context: &HandlerContext) -> Result<()> {
        debug!(bytes = self.echoed, "Echo handler released");
        Ok(())
    }
}
