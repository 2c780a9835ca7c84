//! The THL distribution server.
//!
//! [`DistributionServer`] owns the listening channel and the accept loop.
//! The accept loop runs on its own task and owns the registry of
//! [`ActiveConnection`]s together with the receiving end of the completion
//! queue; connection tasks only ever push a [`Completion`]. When the loop
//! exits it hands registry and queue back, so `stop()` can finish the
//! remaining connections without any shared lock.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use thl_server::{Config, DistributionServer, MemoryLogStore};
//!
//! # async fn example() -> thl_server::Result<()> {
//! let store = Arc::new(MemoryLogStore::new("thl"));
//! let mut server = DistributionServer::new(Config::new("thl://0.0.0.0:2112"), store)?;
//! server.start().await?;
//! // ...
//! let report = server.stop().await?;
//! assert!(report.is_clean());
//! # Ok(())
//! # }
//! ```

pub mod connection;

pub use connection::{ActiveConnection, Completion, ConnectionId};

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};
use zeroize::Zeroizing;

use crate::auth::{AuthenticationOutcome, CredentialStore};
use crate::channel::{SecureChannel, ServerTls};
use crate::config::{Config, PRIMARY_DISTRIBUTION_ALIAS};
use crate::endpoint::Endpoint;
use crate::filter::CatalogFilter;
use crate::handler::{HandlerContext, HandlerFactory, HandlerRegistry};
use crate::store::LogStore;
use crate::{Error, Result};

/// Shared, read-only view of a running server handed to every handler.
pub type ServerHandle = Arc<ServerShared>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerLifecycleState {
    Created,
    Bound,
    Running,
    Stopping,
    Stopped,
}

pub struct ServerShared {
    store_name: String,
    endpoint: Endpoint,
    secure: bool,
    credentials: Option<CredentialStore>,
    filter: Option<CatalogFilter>,
    stopping: AtomicBool,
}

impl ServerShared {
    pub fn store_name(&self) -> &str {
        &self.store_name
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Whether clients must present credentials.
    pub fn requires_authentication(&self) -> bool {
        self.secure && self.credentials.is_some()
    }

    pub fn filter(&self) -> Option<&CatalogFilter> {
        self.filter.as_ref()
    }

    pub fn authenticate(&self, login: &str, secret: &str) -> Result<AuthenticationOutcome> {
        if !self.secure {
            return Err(Error::Unsupported(format!(
                "Authentication requested on plaintext endpoint {}",
                self.endpoint
            )));
        }
        let credentials = self.credentials.as_ref().ok_or_else(|| {
            Error::Unsupported("Authentication requested but no credential source is configured".to_string())
        })?;
        Ok(credentials.authenticate(login, secret))
    }

    /// [`ServerShared::authenticate`] on the blocking pool, for callers on
    /// async workers. Credential sources may read files.
    pub async fn verify_credentials(
        self: Arc<Self>,
        login: String,
        secret: Zeroizing<String>,
    ) -> Result<AuthenticationOutcome> {
        tokio::task::spawn_blocking(move || self.authenticate(&login, &secret))
            .await
            .map_err(|e| Error::Handler(format!("Credential lookup task failed: {}", e)))?
    }
}

impl fmt::Debug for ServerShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerShared")
            .field("store_name", &self.store_name)
            .field("endpoint", &self.endpoint)
            .field("secure", &self.secure)
            .field("authenticating", &self.credentials.is_some())
            .finish()
    }
}

/// What `stop()` found while shutting down.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Registry entries still present after every handler was stopped.
    pub unfinished: usize,
    /// Handlers that failed to stop in time or whose task failed.
    pub handler_errors: usize,
    /// Set when the accept loop ended on an error or could not be joined.
    pub accept_error: Option<String>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.unfinished == 0 && self.handler_errors == 0 && self.accept_error.is_none()
    }
}

/// State owned by the accept-loop task, returned to `stop()` on exit.
struct AcceptLoop {
    channel: Arc<SecureChannel>,
    shared: ServerHandle,
    context: HandlerContext,
    factory: HandlerFactory,
    handshake_timeout: Duration,
    registry: Vec<ActiveConnection>,
    completions: mpsc::UnboundedReceiver<Completion>,
    completion_sender: mpsc::UnboundedSender<Completion>,
    active: Arc<AtomicUsize>,
    next_id: u64,
    error: Option<String>,
}

impl AcceptLoop {
    #[instrument(name = "thl_accept", skip(self), fields(endpoint = %self.shared.endpoint()))]
    async fn run(mut self) -> Self {
        info!("Server thread started");
        loop {
            tokio::select! {
                accepted = self.channel.accept() => match accepted {
                    Ok(incoming) => {
                        self.admit(incoming);
                        self.reap_ready();
                    }
                    Err(e) if e.is_termination() => {
                        if self.shared.is_stopping() {
                            info!("Server thread cancelled");
                        } else {
                            warn!("THL server cancelled unexpectedly");
                        }
                        break;
                    }
                    Err(e) => {
                        error!(error = %e, "THL server stopped by I/O error; exiting");
                        self.error = Some(e.to_string());
                        break;
                    }
                },
                Some(completion) = self.completions.recv() => {
                    self.reap(completion);
                }
            }
        }
        self
    }

    fn admit(&mut self, incoming: crate::channel::IncomingSocket) {
        self.next_id += 1;
        let id = ConnectionId(self.next_id);
        let peer = incoming.peer_addr();

        let mut handler = (self.factory)();
        if let Err(e) = handler.configure(&self.context) {
            error!(connection_id = %id, peer = %peer, error = %e, "Unable to configure connector handler");
            return;
        }

        let connection = ActiveConnection::spawn(
            id,
            incoming,
            handler,
            self.handshake_timeout,
            self.completion_sender.clone(),
        );
        info!(
            connection_id = %id,
            peer = %peer,
            protocol = connection.protocol,
            "Accepted THL client"
        );
        self.registry.push(connection);
        self.active.store(self.registry.len(), Ordering::SeqCst);
    }

    fn reap_ready(&mut self) {
        while let Ok(completion) = self.completions.try_recv() {
            self.reap(completion);
        }
    }

    fn reap(&mut self, completion: Completion) {
        reap(&mut self.registry, &self.context, completion);
        self.active.store(self.registry.len(), Ordering::SeqCst);
    }
}

/// Removes a finished connection from `registry` and releases its handler.
fn reap(registry: &mut Vec<ActiveConnection>, context: &HandlerContext, completion: Completion) {
    let Completion { id, reached, outcome } = completion;
    if let Err(e) = &outcome {
        debug!(connection_id = %id, state = ?reached, error = %e, "Connector handler ended with error");
    }

    let Some(position) = registry.iter().position(|c| c.id == id) else {
        debug!(connection_id = %id, "Completion for unknown connection");
        return;
    };
    let connection = registry.remove(position);
    debug!(
        connection_id = %id,
        peer = %connection.peer,
        started_at = %connection.started_at,
        state = ?reached,
        "Reaped connection"
    );
    release(&connection, context);
}

fn release(connection: &ActiveConnection, context: &HandlerContext) {
    match connection.release(context) {
        Ok(()) => debug!(connection_id = %connection.id, "Released connector handler"),
        Err(e) => warn!(connection_id = %connection.id, error = %e, "Unable to release connector handler"),
    }
}

/// Accepts THL client connections and runs one connector handler per
/// connection.
pub struct DistributionServer {
    config: Config,
    endpoint: Endpoint,
    store: Arc<dyn LogStore>,
    handlers: HandlerRegistry,
    credentials: Option<CredentialStore>,
    state: ServerLifecycleState,
    shared: Option<ServerHandle>,
    channel: Option<Arc<SecureChannel>>,
    accept_task: Option<JoinHandle<AcceptLoop>>,
    active: Arc<AtomicUsize>,
}

impl DistributionServer {
    pub fn new(config: Config, store: Arc<dyn LogStore>) -> Result<Self> {
        let endpoint = config.endpoint()?;
        Ok(Self {
            config,
            endpoint,
            store,
            handlers: HandlerRegistry::default(),
            credentials: None,
            state: ServerLifecycleState::Created,
            shared: None,
            channel: None,
            accept_task: None,
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Replaces the protocol registry; takes effect at `start()`.
    pub fn with_handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    /// Uses `credentials` instead of the configured password file.
    pub fn with_credentials(mut self, credentials: CredentialStore) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Binds the endpoint and starts accepting connections.
    pub async fn start(&mut self) -> Result<()> {
        if self.state != ServerLifecycleState::Created {
            return Err(Error::Unsupported(format!(
                "Server cannot be started from state {:?}",
                self.state
            )));
        }

        let factory = self.handlers.resolve(&self.config.server.protocol)?;
        let filter = self
            .config
            .filter
            .as_ref()
            .map(|f| CatalogFilter::new(&f.catalog_schema))
            .transpose()?;

        let tls = if self.endpoint.is_secure() {
            let security = self.config.security.as_ref().ok_or_else(|| {
                Error::Config(format!(
                    "Secure endpoint {} requires a [security] section",
                    self.endpoint
                ))
            })?;
            Some(ServerTls::from_security(security, PRIMARY_DISTRIBUTION_ALIAS)?)
        } else {
            None
        };

        let channel = Arc::new(SecureChannel::bind(&self.endpoint, tls.as_ref()).await?);
        self.state = ServerLifecycleState::Bound;

        let credentials = match self.credentials.take() {
            Some(credentials) => Some(credentials),
            None => self
                .config
                .security
                .as_ref()
                .filter(|_| channel.is_secure())
                .and_then(|security| security.password_file.as_ref())
                .map(CredentialStore::from_password_file),
        };
        if let Some(credentials) = &credentials {
            info!(source = %credentials.source(), "Authenticating THL clients");
        }

        let shared = Arc::new(ServerShared {
            store_name: self.store.name().to_string(),
            endpoint: self.endpoint.clone(),
            secure: channel.is_secure(),
            credentials,
            filter,
            stopping: AtomicBool::new(false),
        });

        let (completion_sender, completions) = mpsc::unbounded_channel();
        let accept_loop = AcceptLoop {
            channel: channel.clone(),
            shared: shared.clone(),
            context: HandlerContext::new(self.store.clone(), shared.clone()),
            factory,
            handshake_timeout: self.config.server.handshake_timeout(),
            registry: Vec::new(),
            completions,
            completion_sender,
            active: self.active.clone(),
            next_id: 0,
            error: None,
        };

        info!(
            endpoint = %self.endpoint,
            local_addr = %channel.local_addr(),
            store = %shared.store_name(),
            protocol = %self.config.server.protocol,
            secure = shared.is_secure(),
            "Starting THL server"
        );
        self.accept_task = Some(tokio::spawn(accept_loop.run()));
        self.channel = Some(channel);
        self.shared = Some(shared);
        self.state = ServerLifecycleState::Running;
        Ok(())
    }

    /// Stops accepting, stops every connection and releases the endpoint.
    ///
    /// Individual handler failures are logged and counted in the returned
    /// report; they do not fail the call.
    pub async fn stop(&mut self) -> Result<ShutdownReport> {
        let mut report = ShutdownReport::default();
        match self.state {
            ServerLifecycleState::Stopped => return Ok(report),
            ServerLifecycleState::Created => {
                self.state = ServerLifecycleState::Stopped;
                return Ok(report);
            }
            _ => {}
        }

        info!(endpoint = %self.endpoint, "Stopping THL server");
        self.state = ServerLifecycleState::Stopping;
        if let Some(shared) = &self.shared {
            shared.stopping.store(true, Ordering::SeqCst);
        }
        if let Some(channel) = &self.channel {
            channel.close();
        }

        let accept_loop = match self.accept_task.take() {
            Some(mut task) => {
                let limit = self.config.server.accept_stop_timeout();
                let joined = timeout(limit, &mut task).await;
                match joined {
                    Ok(Ok(accept_loop)) => Some(accept_loop),
                    Ok(Err(e)) => {
                        error!(error = %e, "Accept loop task failed");
                        report.accept_error = Some(e.to_string());
                        None
                    }
                    Err(_) => {
                        task.abort();
                        warn!(timeout = ?limit, "Accept loop did not exit in time");
                        report.accept_error = Some(format!("accept loop did not exit within {:?}", limit));
                        None
                    }
                }
            }
            None => None,
        };

        if let Some(mut accept_loop) = accept_loop {
            if let Some(e) = accept_loop.error.take() {
                report.accept_error = Some(e);
            }

            let limit = self.config.server.handler_stop_timeout();
            for connection in accept_loop.registry.iter_mut() {
                if let Err(e) = connection.stop(limit).await {
                    error!(connection_id = %connection.id, peer = %connection.peer, error = %e, "Unable to stop connector handler");
                    report.handler_errors += 1;
                }
            }

            accept_loop.reap_ready();
            report.unfinished = accept_loop.registry.len();
            if report.unfinished > 0 {
                warn!(
                    unfinished = report.unfinished,
                    "One or more clients did not finish"
                );
            }
            for connection in &accept_loop.registry {
                release(connection, &accept_loop.context);
            }
            accept_loop.registry.clear();
        }
        self.active.store(0, Ordering::SeqCst);

        if let Some(channel) = self.channel.take() {
            channel.release();
        }
        self.state = ServerLifecycleState::Stopped;
        info!(endpoint = %self.endpoint, clean = report.is_clean(), "THL server stopped");
        Ok(report)
    }

    /// Checks client credentials. Only available on a running secure
    /// server with a credential source.
    pub fn authenticate(&self, login: &str, secret: &str) -> Result<AuthenticationOutcome> {
        match &self.shared {
            Some(shared) => shared.authenticate(login, secret),
            None => Err(Error::Unsupported("Server is not running".to_string())),
        }
    }

    pub fn state(&self) -> ServerLifecycleState {
        self.state
    }

    /// Bound address while the server holds its channel.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.channel.as_ref().map(|c| c.local_addr())
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Logical name reported by the log store.
    pub fn store_name(&self) -> &str {
        self.store.name()
    }

    pub fn is_secure(&self) -> bool {
        self.endpoint.is_secure()
    }

    /// Connections accepted and not yet reaped.
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

impl Drop for DistributionServer {
    fn drop(&mut self) {
        if let Some(channel) = &self.channel {
            channel.close();
        }
    }
}
