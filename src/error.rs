//! Error taxonomy for connection handling.
//!
//! Every failure a connection can hit is one of four kinds:
//!
//! - [`FrameError`]: the byte stream itself is broken. Always fatal.
//! - [`ProtocolError`]: a frame arrived that cannot be honoured (bad JSON,
//!   unknown tag, unmet precondition). Usually fatal.
//! - [`RoutingError`]: the frame names a receiver or function that does not
//!   exist. Reported, never fatal, no state is mutated.
//! - [`BackendFailure`]: a worker went away or never answered mid-dispatch.
//!   Reported to the requester, never fatal for the requester.
//!
//! The `Display` text of each variant is what the client sees in the E frame.

use thiserror::Error;

use crate::protocol::Tag;

/// Malformed or truncated frame on the wire.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("can't read message content")]
    Io(#[from] std::io::Error),

    #[error("frame is missing its tag byte")]
    MissingTag,

    #[error("connection closed in the middle of a frame")]
    Truncated,

    #[error("frame exceeds {limit} bytes")]
    TooLong { limit: usize },

    #[error("frame terminator not received within {secs}s")]
    Timeout { secs: u64 },

    #[error("outbound payload contains a line terminator")]
    EmbeddedTerminator,

    #[error("write did not complete within {secs}s")]
    WriteTimeout { secs: u64 },
}

/// A frame that was read fine but cannot be acted upon.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("wrong message type")]
    UnknownTag(u8),

    #[error("server can't unmarshal message content")]
    Malformed {
        tag: Tag,
        #[source]
        source: serde_json::Error,
    },

    #[error("you should login first")]
    NotAuthenticated { tag: Tag },

    #[error("already logged in")]
    AlreadyAuthenticated,

    #[error("this login has already been taken")]
    LoginTaken,

    #[error("invalid login or password format")]
    InvalidCredentials,

    #[error("wrong login/pass")]
    WrongCredentials,

    #[error("credential store unavailable")]
    Store(#[from] CredentialError),

    #[error("frame not allowed from a worker connection")]
    WorkerFrame,
}

/// Target of a frame does not exist right now.
#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("Receiver is not logged in!")]
    ReceiverOffline(String),

    #[error("This function wasn't registered on server!")]
    FunctionNotRegistered(String),

    #[error("function with this name already exists")]
    FunctionTaken(String),

    #[error("owner of this function is not connected")]
    OwnerOffline(String),

    #[error("can't call a function registered by this connection's own login")]
    SelfInvocation(String),
}

/// The worker side of a dispatch failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendFailure {
    #[error("can't read answer content")]
    WorkerGone,

    #[error("worker did not answer in time")]
    Timeout,
}

/// Failure reading or appending the flat credential file.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("failed to read credential file {path}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to append to credential file {path}")]
    Append {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Anything that can go wrong while serving one frame.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error(transparent)]
    Backend(#[from] BackendFailure),
}

impl SessionError {
    /// Whether the connection must be torn down after reporting this error.
    pub fn is_fatal(&self) -> bool {
        match self {
            SessionError::Frame(_) | SessionError::Protocol(_) => true,
            SessionError::Routing(_) | SessionError::Backend(_) => false,
        }
    }
}
