//! THL wire messages.
//!
//! Each frame is a big-endian `u32` payload length followed by one JSON
//! encoded [`Message`].

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::auth::AuthenticationOutcome;
use crate::store::LogRecord;
use crate::{Error, Result};

/// Largest accepted frame payload.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Upper bound on records returned for one fetch.
pub const MAX_FETCH_RECORDS: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Downstream replicator reading the log.
    Consumer,
    /// Upstream replicator shipping records into the log.
    Producer,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Hello {
        role: Role,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        login: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        secret: Option<String>,
    },
    Welcome {
        store: String,
        max_seqno: Option<u64>,
    },
    Rejected {
        outcome: AuthenticationOutcome,
    },
    Fetch {
        from_seqno: u64,
        max: u32,
    },
    Records {
        records: Vec<LogRecord>,
    },
    Append {
        records: Vec<LogRecord>,
    },
    Appended {
        last_seqno: Option<u64>,
        accepted: usize,
        filtered: usize,
    },
    Goodbye,
    Error {
        message: String,
    },
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Hello { .. } => "hello",
            Message::Welcome { .. } => "welcome",
            Message::Rejected { .. } => "rejected",
            Message::Fetch { .. } => "fetch",
            Message::Records { .. } => "records",
            Message::Append { .. } => "append",
            Message::Appended { .. } => "appended",
            Message::Goodbye => "goodbye",
            Message::Error { .. } => "error",
        }
    }
}

pub fn encode(message: &Message) -> Result<BytesMut> {
    let payload = serde_json::to_vec(message)?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(Error::Protocol(format!(
            "{} frame of {} bytes exceeds limit of {}",
            message.kind(),
            payload.len(),
            MAX_FRAME_SIZE
        )));
    }
    let mut frame = BytesMut::with_capacity(4 + payload.len());
    frame.put_u32(payload.len() as u32);
    frame.put_slice(&payload);
    Ok(frame)
}

pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode(message)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads the next frame. Returns `None` when the peer closed the stream
/// cleanly on a frame boundary.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<Message>>
where
    R: AsyncRead + Unpin,
{
    let length = match reader.read_u32().await {
        Ok(length) => length as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if length > MAX_FRAME_SIZE {
        return Err(Error::Protocol(format!(
            "Frame of {} bytes exceeds limit of {}",
            length, MAX_FRAME_SIZE
        )));
    }

    let mut payload = BytesMut::zeroed(length);
    reader.read_exact(&mut payload).await?;
    Ok(Some(serde_json::from_slice(&payload)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_layout() {
        let frame = encode(&Message::Goodbye).unwrap();
        let payload = br#"{"type":"goodbye"}"#;
        assert_eq!(&frame[..4], &(payload.len() as u32).to_be_bytes());
        assert_eq!(&frame[4..], payload);
    }

    #[tokio::test]
    async fn test_stream_of_messages() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let hello = Message::Hello {
            role: Role::Consumer,
            login: Some("tungsten".to_string()),
            secret: Some("secret".to_string()),
        };
        write_message(&mut client, &hello).await.unwrap();
        write_message(&mut client, &Message::Fetch { from_seqno: 7, max: 10 })
            .await
            .unwrap();
        drop(client);

        assert_eq!(read_message(&mut server).await.unwrap(), Some(hello));
        assert_eq!(
            read_message(&mut server).await.unwrap(),
            Some(Message::Fetch { from_seqno: 7, max: 10 })
        );
        assert_eq!(read_message(&mut server).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_all(&((MAX_FRAME_SIZE as u32) + 1).to_be_bytes())
            .await
            .unwrap();

        let result = read_message(&mut server).await;
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_io_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[0, 0, 0, 20, b'{']).await.unwrap();
        drop(client);

        let result = read_message(&mut server).await;
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[test]
    fn test_hello_without_credentials() {
        let message: Message = serde_json::from_str(r#"{"type":"hello","role":"producer"}"#).unwrap();
        assert_eq!(
            message,
            Message::Hello {
                role: Role::Producer,
                login: None,
                secret: None
            }
        );
    }
}
