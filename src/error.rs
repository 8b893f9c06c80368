use std::time::Duration;
use thiserror::Error;

use crate::config::ConfigError;
use crate::xmlrpc::CodecError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("authentication error: {0}")]
    Auth(#[from] AuthenticationError),

    #[error("invocation error: {0}")]
    Invocation(#[from] InvocationError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("unexpected result from {model}.{method}: {detail}")]
    UnexpectedResult {
        model: String,
        method: String,
        detail: String,
    },

    #[error("channel {0} not found")]
    ChannelNotFound(i64),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("prompt error: {0}")]
    Prompt(#[from] dialoguer::Error),
}

impl Error {
    /// Returns a user-friendly suggestion for how to resolve this error
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Error::Auth(AuthenticationError::Rejected { .. }) => {
                Some("Check server.database, server.username and the API key")
            }
            Error::Auth(AuthenticationError::Transport(TransportError::Timeout(_)))
            | Error::Invocation(InvocationError::Transport(TransportError::Timeout(_)))
            | Error::Transport(TransportError::Timeout(_)) => {
                Some("Check your connection or raise server.timeout_secs")
            }
            Error::Invocation(InvocationError::NotAuthenticated) => {
                Some("Authenticate before invoking model methods")
            }
            Error::Config(ConfigError::MissingValue { .. }) => {
                Some("Run 'rtcprobe config' to see where the config file is read from")
            }
            Error::ChannelNotFound(_) => Some("Pass an existing channel with --channel"),
            _ => None,
        }
    }
}

/// Failure talking to an endpoint, before any XML-RPC result is available.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("http error: {0}")]
    Http(String),

    #[error("server returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl From<CodecError> for TransportError {
    fn from(e: CodecError) -> Self {
        TransportError::Malformed(e.0)
    }
}

/// XML-RPC fault as reported by the remote side. The message is kept verbatim.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct Fault {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum AuthenticationError {
    #[error("credentials rejected for {username} on database {database}")]
    Rejected { username: String, database: String },

    #[error("remote fault: {0}")]
    Fault(Fault),

    #[error(transparent)]
    Transport(TransportError),
}

#[derive(Debug, Error)]
pub enum InvocationError {
    #[error("not authenticated")]
    NotAuthenticated,

    #[error("remote fault: {0}")]
    Fault(Fault),

    #[error(transparent)]
    Transport(TransportError),
}

impl InvocationError {
    /// Fault text exactly as the remote side sent it, if this was a fault.
    pub fn fault_message(&self) -> Option<&str> {
        match self {
            InvocationError::Fault(fault) => Some(&fault.message),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
