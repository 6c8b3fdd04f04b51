use crate::frame::ConnId;
use thiserror::Error;

/// Errors produced by the portal protocol engine.
#[derive(Debug, Error)]
pub enum PortalError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("frame too large: {len} bytes (max {max})")]
    FrameTooLarge { len: usize, max: usize },

    #[error("truncated payload: expected {expected} bytes")]
    Truncated { expected: usize },

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("rejected by peer: {0}")]
    Rejected(String),

    #[error("guest link {0} is closed")]
    LinkClosed(ConnId),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("timeout")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<tokio::time::error::Elapsed> for PortalError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        PortalError::Timeout
    }
}

pub type PortalResult<T> = Result<T, PortalError>;
