// src/error.rs
use std::io;

use thiserror::Error;

/// Boxed error returned by application callbacks and connection filters.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Central error type for the etude engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid engine configuration (negative thread count, bad limit value).
    #[error("configuration error: {0}")]
    Config(String),

    /// A listen address could not be parsed or resolved.
    #[error("invalid server address {address:?}: {reason}")]
    Address { address: String, reason: String },

    /// Binding a listen socket failed.
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },

    /// The engine was driven out of order (start twice, server before start).
    #[error("usage error: {0}")]
    Usage(&'static str),

    /// The request bytes violated HTTP/1.x framing.
    #[error("bad request: {0}")]
    Protocol(#[from] ParseError),

    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The application callback failed.
    #[error("application error: {0}")]
    Application(BoxError),

    /// Status or headers were mutated after the response head went out.
    #[error("response has already started; status and headers are read-only")]
    ResponseStarted,

    /// A worker thread panicked or exited before acknowledging a command.
    #[error("worker {0} is not running")]
    WorkerGone(usize),
}

/// Request parsing failures. Each one terminates the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("invalid request line")]
    InvalidRequestLine,
    #[error("invalid request target")]
    InvalidTarget,
    #[error("unsupported HTTP version")]
    UnsupportedVersion,
    #[error("invalid request header")]
    InvalidHeader,
    #[error("invalid content-length")]
    InvalidContentLength,
    #[error("unsupported transfer-encoding")]
    UnsupportedTransferEncoding,
    #[error("invalid chunk framing")]
    InvalidChunk,
    #[error("request line too long")]
    RequestLineTooLong,
    #[error("request headers too large")]
    HeadersTooLarge,
    #[error("too many request headers")]
    TooManyHeaders,
    #[error("connection closed mid-request")]
    UnexpectedEof,
    #[error("upgrade request cannot carry a body")]
    UpgradeWithBody,
}

impl ParseError {
    /// Status code of the best-effort error response for this failure.
    pub fn status_code(&self) -> u16 {
        match self {
            ParseError::RequestLineTooLong => 414,
            ParseError::HeadersTooLarge | ParseError::TooManyHeaders => 431,
            ParseError::UnsupportedVersion => 505,
            ParseError::UnsupportedTransferEncoding => 501,
            _ => 400,
        }
    }
}

impl EngineError {
    pub(crate) fn address(address: &str, reason: impl Into<String>) -> Self {
        EngineError::Address {
            address: address.to_string(),
            reason: reason.into(),
        }
    }

    /// True for failures that only concern one connection.
    pub fn is_connection_local(&self) -> bool {
        matches!(
            self,
            EngineError::Protocol(_)
                | EngineError::Io(_)
                | EngineError::Application(_)
                | EngineError::ResponseStarted
        )
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
