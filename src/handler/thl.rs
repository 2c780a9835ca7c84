//! THL replication protocol.
//!
//! A session starts with `Hello`. Consumers then page through the log with
//! `Fetch`; producers ship records with `Append`, which pass the catalog
//! filter before reaching the store. On secure servers with a credential
//! source the `Hello` must carry a valid login and secret.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::protocol::{read_message, write_message, Message, Role, MAX_FETCH_RECORDS};
use super::{ConnectorHandler, HandlerContext, ShutdownSignal};
use crate::auth::AuthenticationOutcome;
use crate::channel::Socket;
use crate::server::ServerHandle;
use crate::store::{LogRecord, LogStore};
use crate::{Error, Result};

pub const PROTOCOL: &str = "thl";

/// Whether the session continues after a request.
enum Flow {
    Continue,
    Done,
}

#[derive(Default)]
pub struct ThlHandler {
    store: Option<Arc<dyn LogStore>>,
    server: Option<ServerHandle>,
    role: Option<Role>,
    login: Option<String>,
    records_sent: u64,
    records_appended: u64,
    records_filtered: u64,
}

impl ThlHandler {
    pub fn new() -> Self {
        Self::default()
    }

    fn references(&self) -> Result<(&Arc<dyn LogStore>, &ServerHandle)> {
        match (&self.store, &self.server) {
            (Some(store), Some(server)) => Ok((store, server)),
            _ => Err(Error::Config("THL handler used before configure".to_string())),
        }
    }

    async fn handshake(&mut self, socket: &mut Socket) -> Result<()> {
        let (store, server) = self.references()?;
        let (store, server) = (store.clone(), server.clone());

        let (role, login, secret) = match read_message(socket).await? {
            Some(Message::Hello {
                role,
                login,
                secret,
            }) => (role, login, secret),
            Some(other) => {
                return violation(socket, format!("expected hello, got {}", other.kind())).await;
            }
            None => {
                return Err(Error::Protocol(
                    "client disconnected before hello".to_string(),
                ))
            }
        };

        if server.requires_authentication() {
            let outcome = match (login.as_deref(), secret.as_deref()) {
                (Some(login), Some(secret)) => {
                    server
                        .clone()
                        .verify_credentials(login.to_string(), Zeroizing::new(secret.to_string()))
                        .await?
                }
                _ => AuthenticationOutcome::NoSuchUser,
            };
            if !outcome.is_ok() {
                warn!(login = ?login, ?outcome, "Rejected THL client");
                write_message(socket, &Message::Rejected { outcome }).await?;
                return Err(Error::Authentication { outcome });
            }
        }

        let welcome = Message::Welcome {
            store: server.store_name().to_string(),
            max_seqno: store.max_seqno()?,
        };
        write_message(socket, &welcome).await?;

        info!(?role, login = ?login, store = store.name(), "THL session opened");
        self.role = Some(role);
        self.login = login;
        Ok(())
    }

    async fn handle_next(&mut self, socket: &mut Socket) -> Result<Flow> {
        let message = match read_message(socket).await? {
            Some(message) => message,
            None => return Ok(Flow::Done),
        };

        match (self.role, message) {
            (_, Message::Goodbye) => Ok(Flow::Done),
            (Some(Role::Consumer), Message::Fetch { from_seqno, max }) => {
                let records = self.fetch(from_seqno, max)?;
                self.records_sent += records.len() as u64;
                write_message(socket, &Message::Records { records }).await?;
                Ok(Flow::Continue)
            }
            (Some(Role::Producer), Message::Append { records }) => {
                match self.append(records) {
                    Ok(reply) => {
                        write_message(socket, &reply).await?;
                        Ok(Flow::Continue)
                    }
                    Err(e) => {
                        let message = e.to_string();
                        write_message(socket, &Message::Error { message }).await?;
                        Err(e)
                    }
                }
            }
            (role, other) => {
                violation(
                    socket,
                    format!("unexpected {} for role {:?}", other.kind(), role),
                )
                .await
            }
        }
    }

    fn fetch(&self, from_seqno: u64, max: u32) -> Result<Vec<LogRecord>> {
        let (store, _) = self.references()?;
        let max = max.min(MAX_FETCH_RECORDS) as usize;
        let records = store.fetch(from_seqno, max)?;
        debug!(from_seqno, count = records.len(), "Serving THL records");
        Ok(records)
    }

    fn append(&mut self, records: Vec<LogRecord>) -> Result<Message> {
        let (store, server) = self.references()?;
        let (store, server) = (store.clone(), server.clone());

        let mut accepted = 0;
        let mut filtered = 0;
        for record in records {
            let record = match server.filter() {
                Some(filter) => filter.filter(record),
                None => Some(record),
            };
            match record {
                Some(record) => {
                    store.append(record)?;
                    accepted += 1;
                }
                None => filtered += 1,
            }
        }
        self.records_appended += accepted as u64;
        self.records_filtered += filtered as u64;

        Ok(Message::Appended {
            last_seqno: store.max_seqno()?,
            accepted,
            filtered,
        })
    }
}

/// Sends an `Error` frame and fails the session.
async fn violation<T>(socket: &mut Socket, message: String) -> Result<T> {
    write_message(
        socket,
        &Message::Error {
            message: message.clone(),
        },
    )
    .await?;
    Err(Error::Protocol(message))
}

impl ConnectorHandler for ThlHandler {
    fn protocol(&self) -> &'static str {
        PROTOCOL
    }

    fn configure(&mut self, context: &HandlerContext) -> Result<()> {
        self.store = Some(context.require_store()?);
        self.server = Some(context.require_server()?);
        Ok(())
    }

    fn prepare<'a>(&'a mut self, socket: &'a mut Socket) -> BoxFuture<'a, Result<()>> {
        self.handshake(socket).boxed()
    }

    fn serve<'a>(
        &'a mut self,
        socket: &'a mut Socket,
        mut shutdown: ShutdownSignal,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            loop {
                tokio::select! {
                    _ = shutdown.requested() => {
                        debug!("THL session interrupted by shutdown");
                        return Ok(());
                    }
                    flow = self.handle_next(socket) => {
                        if let Flow::Done = flow? {
                            return Ok(());
                        }
                    }
                }
            }
        }
        .boxed()
    }

    fn release(&mut self, _context: &HandlerContext) -> Result<()> {
        info!(
            role = ?self.role,
            login = ?self.login,
            sent = self.records_sent,
            appended = self.records_appended,
            filtered = self.records_filtered,
            "THL session released"
        );
        self.store = None;
        self.server = None;
        Ok(())
    }
}
