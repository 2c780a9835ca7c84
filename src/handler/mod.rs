//! Per-connection protocol workers.
//!
//! A [`ConnectorHandler`] goes through
//! `configure -> prepare -> serve -> release`. `configure` runs on the
//! accept loop, `prepare` and `serve` run on the connection's own task,
//! and `release` runs exactly once on the server's control path, either
//! when the task reports completion or after an overrunning task has been
//! aborted.

pub mod echo;
pub mod protocol;
pub mod thl;

pub use echo::EchoHandler;
pub use thl::ThlHandler;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::watch;

use crate::channel::Socket;
use crate::server::ServerHandle;
use crate::store::LogStore;
use crate::{Error, Result};

/// Protocol used when none is configured.
pub const DEFAULT_PROTOCOL: &str = "thl";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Configured,
    Prepared,
    Running,
    Stopped,
    Released,
}

/// Shared references handed to every handler.
#[derive(Clone, Default)]
pub struct HandlerContext {
    pub store: Option<Arc<dyn LogStore>>,
    pub server: Option<ServerHandle>,
}

impl HandlerContext {
    pub fn new(store: Arc<dyn LogStore>, server: ServerHandle) -> Self {
        Self {
            store: Some(store),
            server: Some(server),
        }
    }

    pub fn require_store(&self) -> Result<Arc<dyn LogStore>> {
        self.store
            .clone()
            .ok_or_else(|| Error::Config("Connector handler requires a log store".to_string()))
    }

    pub fn require_server(&self) -> Result<ServerHandle> {
        self.server
            .clone()
            .ok_or_else(|| Error::Config("Connector handler requires a server reference".to_string()))
    }
}

/// Cooperative termination request observed by a serving loop.
#[derive(Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    pub fn is_requested(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once termination has been requested. A dropped sender
    /// counts as a request.
    pub async fn requested(&mut self) {
        loop {
            let requested = *self.rx.borrow_and_update();
            if requested {
                return;
            }
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

pub trait ConnectorHandler: Send + 'static {
    /// Name under which the handler is registered.
    fn protocol(&self) -> &'static str;

    fn configure(&mut self, context: &HandlerContext) -> Result<()>;

    /// Protocol handshake and authentication; failure aborts the connection.
    fn prepare<'a>(&'a mut self, socket: &'a mut Socket) -> BoxFuture<'a, Result<()>>;

    /// Serving loop. Must return promptly once `shutdown` is requested,
    /// even when blocked on socket I/O.
    fn serve<'a>(
        &'a mut self,
        socket: &'a mut Socket,
        shutdown: ShutdownSignal,
    ) -> BoxFuture<'a, Result<()>>;

    fn release(&mut self, context: &HandlerContext) -> Result<()>;
}

pub type HandlerFactory = Arc<dyn Fn() -> Box<dyn ConnectorHandler> + Send + Sync>;

/// Protocol name -> handler constructor.
#[derive(Clone)]
pub struct HandlerRegistry {
    factories: HashMap<String, HandlerFactory>,
}

impl HandlerRegistry {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, protocol: &str, factory: F)
    where
        F: Fn() -> Box<dyn ConnectorHandler> + Send + Sync + 'static,
    {
        self.factories.insert(protocol.to_string(), Arc::new(factory));
    }

    pub fn with<F>(mut self, protocol: &str, factory: F) -> Self
    where
        F: Fn() -> Box<dyn ConnectorHandler> + Send + Sync + 'static,
    {
        self.register(protocol, factory);
        self
    }

    pub fn resolve(&self, protocol: &str) -> Result<HandlerFactory> {
        self.factories.get(protocol).cloned().ok_or_else(|| {
            Error::Config(format!(
                "Unknown THL protocol '{}'; known protocols: {:?}",
                protocol,
                self.protocols()
            ))
        })
    }

    pub fn protocols(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::empty()
            .with(thl::PROTOCOL, || Box::new(ThlHandler::new()))
            .with(echo::PROTOCOL, || Box::new(EchoHandler::new()))
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("protocols", &self.protocols())
            .finish()
    }
}
