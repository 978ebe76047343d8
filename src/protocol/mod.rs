//! Wire protocol types.
//!
//! One frame per line: `<tag byte><payload><\n>`. Payloads are opaque bytes
//! except for the handful of JSON shapes that decide routing.

mod codec;
mod sink;

pub use codec::FrameCodec;
pub use sink::{BoxedWriter, FrameSink};

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{FrameError, ProtocolError};

/// Line terminator for every frame.
pub const TERMINATOR: u8 = b'\n';

/// Frame tag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    /// `U`: sign up.
    Register,
    /// `I`: sign in.
    SignIn,
    /// `O`: acknowledgement.
    Ok,
    /// `E`: error.
    Error,
    /// `M`: direct message, both directions.
    Message,
    /// `S`: broadcast.
    Stream,
    /// `P`: post a function name.
    Post,
    /// `R`: become a worker.
    Ready,
    /// `C`: invoke a function, or a forwarded invocation to a worker.
    Calc,
}

impl Tag {
    pub fn as_byte(self) -> u8 {
        match self {
            Tag::Register => b'U',
            Tag::SignIn => b'I',
            Tag::Ok => b'O',
            Tag::Error => b'E',
            Tag::Message => b'M',
            Tag::Stream => b'S',
            Tag::Post => b'P',
            Tag::Ready => b'R',
            Tag::Calc => b'C',
        }
    }
}

impl TryFrom<u8> for Tag {
    type Error = ProtocolError;

    fn try_from(byte: u8) -> Result<Self, ProtocolError> {
        Ok(match byte {
            b'U' => Tag::Register,
            b'I' => Tag::SignIn,
            b'O' => Tag::Ok,
            b'E' => Tag::Error,
            b'M' => Tag::Message,
            b'S' => Tag::Stream,
            b'P' => Tag::Post,
            b'R' => Tag::Ready,
            b'C' => Tag::Calc,
            other => return Err(ProtocolError::UnknownTag(other)),
        })
    }
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_byte() as char)
    }
}

/// A tagged frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: Tag,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(tag: Tag, payload: impl Into<Bytes>) -> Self {
        Self {
            tag,
            payload: payload.into(),
        }
    }

    /// Acknowledgement carrying free text.
    pub fn ok(text: &str) -> Self {
        Self::new(Tag::Ok, Bytes::from(strip_line_breaks(text)))
    }

    /// Error carrying free text.
    pub fn error(text: &str) -> Self {
        Self::new(Tag::Error, Bytes::from(strip_line_breaks(text)))
    }

    /// Split a received line into tag and payload.
    ///
    /// The line has already lost its `\n`; a trailing `\r` left by CRLF
    /// clients is dropped here as well.
    pub fn parse(line: Bytes) -> Result<Self, ProtocolFailure> {
        let Some(&first) = line.first() else {
            return Err(FrameError::MissingTag.into());
        };
        let tag = Tag::try_from(first)?;
        let mut payload = line.slice(1..);
        if payload.last() == Some(&b'\r') {
            payload.truncate(payload.len() - 1);
        }
        Ok(Self { tag, payload })
    }

    /// Lossy payload text with line breaks removed, safe to log or echo.
    pub fn payload_text(&self) -> String {
        strip_line_breaks(&String::from_utf8_lossy(&self.payload))
    }

    /// Decode the payload as one of the JSON request shapes.
    pub fn json<'a, T: Deserialize<'a>>(&'a self) -> Result<T, ProtocolError> {
        serde_json::from_slice(&self.payload).map_err(|source| ProtocolError::Malformed {
            tag: self.tag,
            source,
        })
    }
}

/// Failure turning a line into a [`Frame`].
#[derive(Debug, thiserror::Error)]
pub enum ProtocolFailure {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl From<ProtocolFailure> for crate::error::SessionError {
    fn from(failure: ProtocolFailure) -> Self {
        match failure {
            ProtocolFailure::Frame(e) => e.into(),
            ProtocolFailure::Protocol(e) => e.into(),
        }
    }
}

/// What the server writes to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Tag + payload + terminator.
    Frame(Frame),
    /// A worker answer relayed verbatim, followed by the terminator.
    Raw(Bytes),
}

impl From<Frame> for Outbound {
    fn from(frame: Frame) -> Self {
        Outbound::Frame(frame)
    }
}

impl Outbound {
    fn body_len(&self) -> usize {
        match self {
            Outbound::Frame(frame) => 1 + frame.payload.len(),
            Outbound::Raw(bytes) => bytes.len(),
        }
    }

    pub(crate) fn write_to(&self, dst: &mut BytesMut) -> Result<(), FrameError> {
        let body = match self {
            Outbound::Frame(frame) => &frame.payload,
            Outbound::Raw(bytes) => bytes,
        };
        if body.contains(&TERMINATOR) {
            return Err(FrameError::EmbeddedTerminator);
        }
        dst.reserve(self.body_len() + 1);
        if let Outbound::Frame(frame) = self {
            dst.put_u8(frame.tag.as_byte());
        }
        dst.extend_from_slice(body);
        dst.put_u8(TERMINATOR);
        Ok(())
    }
}

/// Remove every line-break-class character (LF, VT, FF, CR, NEL, LS, PS).
pub fn strip_line_breaks(text: &str) -> String {
    text.chars().filter(|c| !is_line_break(*c)).collect()
}

pub fn is_line_break(c: char) -> bool {
    matches!(
        c,
        '\u{000A}' | '\u{000B}' | '\u{000C}' | '\u{000D}' | '\u{0085}' | '\u{2028}' | '\u{2029}'
    )
}

/// `U` and `I` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub login: String,
    #[serde(rename = "pass")]
    pub password: String,
}

/// `M` and `S` payload. For delivered messages `receiver` holds the sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "rec")]
    pub receiver: String,
    #[serde(rename = "msg")]
    pub message: String,
}

/// `P` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDecl {
    #[serde(rename = "func")]
    pub name: String,
}

/// `C` payload from a requester.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalcRequest {
    #[serde(rename = "func")]
    pub function: String,
    #[serde(default)]
    pub data: Value,
}

impl CalcRequest {
    /// Bytes forwarded to the worker after the `C` tag.
    ///
    /// Strings go through as their text, `null` as nothing, anything else as
    /// compact JSON.
    pub fn worker_payload(&self) -> Bytes {
        match &self.data {
            Value::Null => Bytes::new(),
            Value::String(text) => Bytes::from(strip_line_breaks(text)),
            other => Bytes::from(other.to_string()),
        }
    }
}
