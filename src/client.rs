//! Async client for the switchboard protocol.
//!
//! Thin wrapper over one TCP connection: each request method writes a frame
//! and, where the server answers, reads the reply. Frames relayed from other
//! sessions are not buffered aside, so read them before issuing the next
//! request.

use std::net::SocketAddr;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::error::FrameError;
use crate::protocol::{
    CalcRequest, Credentials, Envelope, Frame, FrameCodec, FunctionDecl, Outbound, Tag,
};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to connect to server: {0}")]
    Connect(#[source] std::io::Error),

    #[error("framing error: {0}")]
    Frame(#[from] FrameError),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("server closed the connection")]
    Closed,

    #[error("server rejected request: {0}")]
    Rejected(String),

    #[error("unexpected frame from server: {0}")]
    Unexpected(String),
}

pub struct Client {
    reader: FramedRead<OwnedReadHalf, FrameCodec>,
    writer: FramedWrite<OwnedWriteHalf, FrameCodec>,
}

impl Client {
    pub async fn connect(addr: SocketAddr) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(ClientError::Connect)?;
        let (read, write) = stream.into_split();

        Ok(Self {
            reader: FramedRead::new(read, FrameCodec::default()),
            writer: FramedWrite::new(write, FrameCodec::default()),
        })
    }

    /// `U`: create an account.
    pub async fn sign_up(&mut self, login: &str, password: &str) -> Result<String, ClientError> {
        self.send_json(Tag::Register, &credentials(login, password)).await?;
        self.ack().await
    }

    /// `I`: sign in on this connection.
    pub async fn sign_in(&mut self, login: &str, password: &str) -> Result<String, ClientError> {
        self.send_json(Tag::SignIn, &credentials(login, password)).await?;
        self.ack().await
    }

    /// `P`: claim a function name.
    pub async fn post(&mut self, function: &str) -> Result<String, ClientError> {
        let decl = FunctionDecl {
            name: function.to_string(),
        };
        self.send_json(Tag::Post, &decl).await?;
        self.ack().await
    }

    /// `R`: become a worker. The server sends nothing back; from here on
    /// use [`Client::next_calculation`] and [`Client::answer`].
    pub async fn ready(&mut self) -> Result<(), ClientError> {
        self.send(Frame::new(Tag::Ready, Bytes::new())).await
    }

    /// `C`: invoke a function and wait for the relayed answer line.
    pub async fn calc(&mut self, function: &str, data: Value) -> Result<Bytes, ClientError> {
        let request = CalcRequest {
            function: function.to_string(),
            data,
        };
        self.send_json(Tag::Calc, &request).await?;

        let line = self.next_line().await?;
        if line.first() == Some(&Tag::Error.as_byte()) {
            return Err(ClientError::Rejected(
                String::from_utf8_lossy(&line[1..]).into_owned(),
            ));
        }
        Ok(line)
    }

    /// `M`: direct message to `receiver`.
    pub async fn message(&mut self, receiver: &str, text: &str) -> Result<String, ClientError> {
        let envelope = Envelope {
            receiver: receiver.to_string(),
            message: text.to_string(),
        };
        self.send_json(Tag::Message, &envelope).await?;
        self.ack().await
    }

    /// `S`: broadcast `text`, signed as `sender`.
    pub async fn broadcast(&mut self, sender: &str, text: &str) -> Result<String, ClientError> {
        let envelope = Envelope {
            receiver: sender.to_string(),
            message: text.to_string(),
        };
        self.send_json(Tag::Stream, &envelope).await?;
        self.ack().await
    }

    /// Next forwarded calculation payload, for a worker.
    pub async fn next_calculation(&mut self) -> Result<Bytes, ClientError> {
        let frame = self.next_frame().await?;
        match frame.tag {
            Tag::Calc => Ok(frame.payload),
            other => Err(ClientError::Unexpected(format!(
                "{other}{}",
                frame.payload_text()
            ))),
        }
    }

    /// Write a raw answer line, for a worker.
    pub async fn answer(&mut self, answer: impl Into<Bytes>) -> Result<(), ClientError> {
        self.writer.send(Outbound::Raw(answer.into())).await?;
        Ok(())
    }

    /// Next delivered `M` envelope.
    pub async fn next_message(&mut self) -> Result<Envelope, ClientError> {
        let frame = self.next_frame().await?;
        match frame.tag {
            Tag::Message => Ok(serde_json::from_slice(&frame.payload)?),
            other => Err(ClientError::Unexpected(format!(
                "{other}{}",
                frame.payload_text()
            ))),
        }
    }

    pub async fn next_frame(&mut self) -> Result<Frame, ClientError> {
        let line = self.next_line().await?;
        Frame::parse(line).map_err(|e| ClientError::Unexpected(e.to_string()))
    }

    /// Next line from the server, without its terminator.
    pub async fn next_line(&mut self) -> Result<Bytes, ClientError> {
        match self.reader.next().await {
            Some(line) => Ok(line?),
            None => Err(ClientError::Closed),
        }
    }

    async fn send(&mut self, frame: Frame) -> Result<(), ClientError> {
        self.writer.send(Outbound::Frame(frame)).await?;
        Ok(())
    }

    async fn send_json<T: Serialize>(&mut self, tag: Tag, body: &T) -> Result<(), ClientError> {
        let payload = serde_json::to_vec(body)?;
        self.send(Frame::new(tag, payload)).await
    }

    /// Read an `O` or `E` reply.
    async fn ack(&mut self) -> Result<String, ClientError> {
        let frame = self.next_frame().await?;
        match frame.tag {
            Tag::Ok => Ok(frame.payload_text()),
            Tag::Error => Err(ClientError::Rejected(frame.payload_text())),
            other => Err(ClientError::Unexpected(format!(
                "{other}{}",
                frame.payload_text()
            ))),
        }
    }
}

fn credentials(login: &str, password: &str) -> Credentials {
    Credentials {
        login: login.to_string(),
        password: password.to_string(),
    }
}
