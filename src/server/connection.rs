//! Registry entries for live connections and the task that drives one
//! connector handler.

use std::fmt;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use crate::channel::IncomingSocket;
use crate::handler::{ConnectorHandler, HandlerContext, HandlerState, ShutdownSignal};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Pushed by a connection task once its handler has stopped.
#[derive(Debug)]
pub struct Completion {
    pub id: ConnectionId,
    /// Furthest lifecycle state the handler got to before stopping.
    pub reached: HandlerState,
    pub outcome: Result<()>,
}

/// Handler and its lifecycle position. Locked by the connection task while
/// it runs; the registry entry takes the handler back for release.
struct HandlerSlot {
    handler: Option<Box<dyn ConnectorHandler>>,
    state: HandlerState,
}

/// A handler that is running or has not yet been released.
pub struct ActiveConnection {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    pub protocol: &'static str,
    pub started_at: DateTime<Utc>,
    slot: Arc<Mutex<HandlerSlot>>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl ActiveConnection {
    /// Spawns the connection task and returns its registry entry.
    pub(crate) fn spawn(
        id: ConnectionId,
        incoming: IncomingSocket,
        handler: Box<dyn ConnectorHandler>,
        handshake_timeout: Duration,
        completions: mpsc::UnboundedSender<Completion>,
    ) -> Self {
        let peer = incoming.peer_addr();
        let protocol = handler.protocol();
        let slot = Arc::new(Mutex::new(HandlerSlot {
            handler: Some(handler),
            state: HandlerState::Configured,
        }));
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(run(
            id,
            incoming,
            slot.clone(),
            ShutdownSignal::new(rx),
            handshake_timeout,
            completions,
        ));

        Self {
            id,
            peer,
            protocol,
            started_at: Utc::now(),
            slot,
            shutdown,
            task: Some(task),
        }
    }

    pub fn request_stop(&self) {
        self.shutdown.send_replace(true);
    }

    /// Current lifecycle state; `None` while the connection task holds the
    /// handler.
    pub fn state(&self) -> Option<HandlerState> {
        self.slot.try_lock().ok().map(|slot| slot.state)
    }

    /// Requests termination and waits up to `limit` for the task to exit.
    /// A task that does not exit in time is aborted; its handler stays
    /// available to [`ActiveConnection::release`].
    pub async fn stop(&mut self, limit: Duration) -> Result<()> {
        self.request_stop();
        let Some(task) = self.task.as_mut() else {
            return Ok(());
        };

        let joined = timeout(limit, &mut *task).await;
        match joined {
            Ok(Ok(())) => {
                self.task = None;
                Ok(())
            }
            Ok(Err(e)) => {
                self.task = None;
                Err(Error::Handler(format!("{} task failed: {}", self.id, e)))
            }
            Err(_) => {
                task.abort();
                // The cancelled task gives up the slot once it is dropped.
                if timeout(limit, &mut *task).await.is_err() {
                    warn!(connection_id = %self.id, "Aborted connection task has not exited");
                }
                self.task = None;
                Err(Error::Timeout {
                    message: format!("{} did not stop within {:?}", self.id, limit),
                })
            }
        }
    }

    /// Calls the handler's `release` the first time this succeeds; later
    /// calls do nothing. Fails while the connection task still runs.
    pub fn release(&self, context: &HandlerContext) -> Result<()> {
        let mut slot = self
            .slot
            .try_lock()
            .map_err(|_| Error::Handler(format!("{} handler is still running", self.id)))?;
        let Some(mut handler) = slot.handler.take() else {
            return Ok(());
        };
        slot.state = HandlerState::Released;
        handler.release(context)
    }
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

impl fmt::Debug for ActiveConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveConnection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("protocol", &self.protocol)
            .field("started_at", &self.started_at)
            .finish()
    }
}

#[instrument(name = "thl_connection", skip_all, fields(connection_id = %id))]
async fn run(
    id: ConnectionId,
    incoming: IncomingSocket,
    slot: Arc<Mutex<HandlerSlot>>,
    shutdown: ShutdownSignal,
    handshake_timeout: Duration,
    completions: mpsc::UnboundedSender<Completion>,
) {
    let mut guard = slot.lock_owned().await;
    let HandlerSlot { handler, state } = &mut *guard;
    let outcome = match handler.as_deref_mut() {
        Some(handler) => AssertUnwindSafe(drive(incoming, handler, shutdown, handshake_timeout, state))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(Error::Handler(format!("{} handler panicked", id)))),
        None => Err(Error::Handler(format!("{} handler already released", id))),
    };
    let reached = *state;
    drop(guard);

    match &outcome {
        Ok(()) => debug!(connection_id = %id, state = ?reached, "Connection finished"),
        Err(e) => warn!(connection_id = %id, error = %e, state = ?reached, "Connection failed"),
    }

    let completion = Completion {
        id,
        reached,
        outcome,
    };
    if completions.send(completion).is_err() {
        debug!(connection_id = %id, "Completion queue closed; server already gone");
    }
}

async fn drive(
    incoming: IncomingSocket,
    handler: &mut dyn ConnectorHandler,
    mut shutdown: ShutdownSignal,
    handshake_timeout: Duration,
    state: &mut HandlerState,
) -> Result<()> {
    let mut socket = tokio::select! {
        _ = shutdown.requested() => return Ok(()),
        socket = incoming.handshake(handshake_timeout) => socket?,
    };

    let prepared = tokio::select! {
        _ = shutdown.requested() => None,
        prepared = handler.prepare(&mut socket) => Some(prepared),
    };
    let result = match prepared {
        None => Ok(()),
        Some(Err(e)) => Err(e),
        Some(Ok(())) => {
            *state = HandlerState::Prepared;
            if shutdown.is_requested() {
                Ok(())
            } else {
                *state = HandlerState::Running;
                let served = handler.serve(&mut socket, shutdown).await;
                *state = HandlerState::Stopped;
                served
            }
        }
    };

    // Let the peer observe a clean close.
    if let Err(e) = socket.shutdown().await {
        debug!(error = %e, "Socket shutdown failed");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{SecureChannel, Socket};
    use crate::endpoint::Endpoint;
    use futures::future::{self, BoxFuture};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;

    struct ScriptedHandler {
        fail_prepare: bool,
        ignore_shutdown: bool,
        released: Arc<AtomicUsize>,
    }

    impl ScriptedHandler {
        fn new(released: &Arc<AtomicUsize>) -> Self {
            Self {
                fail_prepare: false,
                ignore_shutdown: false,
                released: released.clone(),
            }
        }
    }

    impl ConnectorHandler for ScriptedHandler {
        fn protocol(&self) -> &'static str {
            "scripted"
        }

        fn configure(&mut self, _context: &HandlerContext) -> Result<()> {
            Ok(())
        }

        fn prepare<'a>(&'a mut self, _socket: &'a mut Socket) -> BoxFuture<'a, Result<()>> {
            let fail = self.fail_prepare;
            async move {
                if fail {
                    Err(Error::Protocol("refused".to_string()))
                } else {
                    Ok(())
                }
            }
            .boxed()
        }

        fn serve<'a>(
            &'a mut self,
            socket: &'a mut Socket,
            mut shutdown: ShutdownSignal,
        ) -> BoxFuture<'a, Result<()>> {
            if self.ignore_shutdown {
                return future::pending().boxed();
            }
            async move {
                let mut buf = [0u8; 16];
                tokio::select! {
                    _ = shutdown.requested() => Ok(()),
                    read = socket.read(&mut buf) => read.map(|_| ()).map_err(Error::from),
                }
            }
            .boxed()
        }

        fn release(&mut self, _context: &HandlerContext) -> Result<()> {
            self.released.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn accepted() -> (SecureChannel, IncomingSocket, TcpStream) {
        let endpoint = Endpoint::parse("thl://127.0.0.1:0").unwrap();
        let channel = SecureChannel::bind(&endpoint, None).await.unwrap();
        let client = TcpStream::connect(channel.local_addr()).await.unwrap();
        let incoming = channel.accept().await.unwrap();
        (channel, incoming, client)
    }

    fn spawn(
        incoming: IncomingSocket,
        handler: ScriptedHandler,
    ) -> (ActiveConnection, mpsc::UnboundedReceiver<Completion>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let connection = ActiveConnection::spawn(
            ConnectionId(1),
            incoming,
            Box::new(handler),
            Duration::from_secs(5),
            sender,
        );
        (connection, receiver)
    }

    #[tokio::test]
    async fn test_completion_after_serve_reports_stopped() {
        let (_channel, incoming, client) = accepted().await;
        let released = Arc::new(AtomicUsize::new(0));
        let (connection, mut completions) = spawn(incoming, ScriptedHandler::new(&released));

        drop(client);
        let completion = completions.recv().await.unwrap();
        assert_eq!(completion.id, ConnectionId(1));
        assert_eq!(completion.reached, HandlerState::Stopped);
        assert!(completion.outcome.is_ok());
        assert_eq!(connection.state(), Some(HandlerState::Stopped));

        let context = HandlerContext::default();
        connection.release(&context).unwrap();
        connection.release(&context).unwrap();
        assert_eq!(connection.state(), Some(HandlerState::Released));
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_prepare_reports_configured() {
        let (_channel, incoming, _client) = accepted().await;
        let released = Arc::new(AtomicUsize::new(0));
        let mut handler = ScriptedHandler::new(&released);
        handler.fail_prepare = true;
        let (connection, mut completions) = spawn(incoming, handler);

        let completion = completions.recv().await.unwrap();
        assert_eq!(completion.reached, HandlerState::Configured);
        assert!(matches!(completion.outcome, Err(Error::Protocol(_))));

        connection.release(&HandlerContext::default()).unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_request_while_serving() {
        let (_channel, incoming, _client) = accepted().await;
        let released = Arc::new(AtomicUsize::new(0));
        let (mut connection, mut completions) = spawn(incoming, ScriptedHandler::new(&released));

        connection.stop(Duration::from_secs(5)).await.unwrap();
        let completion = completions.recv().await.unwrap();
        assert!(completion.outcome.is_ok());
        assert_eq!(connection.state(), Some(completion.reached));
    }

    #[tokio::test]
    async fn test_aborted_handler_is_still_released() {
        let (_channel, incoming, _client) = accepted().await;
        let released = Arc::new(AtomicUsize::new(0));
        let mut handler = ScriptedHandler::new(&released);
        handler.ignore_shutdown = true;
        let (mut connection, mut completions) = spawn(incoming, handler);

        let result = connection.stop(Duration::from_millis(100)).await;
        assert!(matches!(result, Err(Error::Timeout { .. })));
        assert!(completions.try_recv().is_err());

        connection.release(&HandlerContext::default()).unwrap();
        assert_eq!(connection.state(), Some(HandlerState::Released));
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }
}
