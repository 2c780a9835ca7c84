//! Client side of the `thl` protocol.

use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::channel::{ClientTls, SecureChannel, Socket};
use crate::endpoint::Endpoint;
use crate::handler::protocol::{read_message, write_message, Message, Role};
use crate::store::LogRecord;
use crate::{Error, Result};

/// Server reply to an `Append`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendSummary {
    pub last_seqno: Option<u64>,
    pub accepted: usize,
    pub filtered: usize,
}

pub struct ThlClient {
    socket: Socket,
    store: String,
    max_seqno: Option<u64>,
}

impl ThlClient {
    /// Connects and performs the `Hello` exchange.
    ///
    /// A refused login surfaces as [`Error::Authentication`].
    pub async fn connect(
        endpoint: &Endpoint,
        tls: Option<&ClientTls>,
        role: Role,
        credentials: Option<(&str, &str)>,
    ) -> Result<Self> {
        let mut socket = SecureChannel::connect(endpoint, tls).await?;

        let hello = Message::Hello {
            role,
            login: credentials.map(|(login, _)| login.to_string()),
            secret: credentials.map(|(_, secret)| secret.to_string()),
        };
        write_message(&mut socket, &hello).await?;

        match expect_reply(&mut socket).await? {
            Message::Welcome { store, max_seqno } => {
                debug!(%endpoint, store = %store, ?max_seqno, "Connected to THL server");
                Ok(Self {
                    socket,
                    store,
                    max_seqno,
                })
            }
            Message::Rejected { outcome } => Err(Error::Authentication { outcome }),
            other => Err(unexpected(&other)),
        }
    }

    /// Store name announced by the server.
    pub fn store(&self) -> &str {
        &self.store
    }

    /// Highest seqno stored when the session was opened.
    pub fn max_seqno(&self) -> Option<u64> {
        self.max_seqno
    }

    pub async fn fetch(&mut self, from_seqno: u64, max: u32) -> Result<Vec<LogRecord>> {
        write_message(&mut self.socket, &Message::Fetch { from_seqno, max }).await?;
        match expect_reply(&mut self.socket).await? {
            Message::Records { records } => Ok(records),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn append(&mut self, records: Vec<LogRecord>) -> Result<AppendSummary> {
        write_message(&mut self.socket, &Message::Append { records }).await?;
        match expect_reply(&mut self.socket).await? {
            Message::Appended {
                last_seqno,
                accepted,
                filtered,
            } => Ok(AppendSummary {
                last_seqno,
                accepted,
                filtered,
            }),
            other => Err(unexpected(&other)),
        }
    }

    /// Ends the session cleanly.
    pub async fn close(mut self) -> Result<()> {
        write_message(&mut self.socket, &Message::Goodbye).await?;
        // The server may already have closed its side after the goodbye.
        if let Err(e) = self.socket.shutdown().await {
            debug!(error = %e, "Socket shutdown after goodbye failed");
        }
        Ok(())
    }
}

async fn expect_reply(socket: &mut Socket) -> Result<Message> {
    match read_message(socket).await? {
        Some(Message::Error { message }) => Err(Error::Protocol(format!("server error: {}", message))),
        Some(message) => Ok(message),
        None => Err(Error::Protocol("server closed the connection".to_string())),
    }
}

fn unexpected(message: &Message) -> Error {
    Error::Protocol(format!("unexpected {} reply", message.kind()))
}
