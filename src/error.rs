//! Error Types

use std::fmt;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    // ============= Protocol =============

    #[error("Invalid handshake: {0}")]
    InvalidHandshake(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid protocol tag: {0:02x?}")]
    InvalidProtoTag([u8; 4]),

    #[error("Invalid message length: {len} (min={min}, max={max})")]
    InvalidMessageLength { len: usize, min: usize, max: usize },

    #[error("Replay detected")]
    ReplayDetected,

    #[error("Mode not allowed: {0}")]
    ModeNotAllowed(String),

    // ============= Upstream =============

    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Connection timeout to {addr}")]
    ConnectionTimeout { addr: String },

    #[error("Telegram handshake timeout")]
    TgHandshakeTimeout,

    #[error("Middle-end response timeout")]
    MeResponseTimeout,

    // ============= Transport =============

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Stream closed: {0}")]
    StreamClosed(String),

    #[error("Idle timeout ({0})")]
    IdleTimeout(&'static str),

    // ============= Crypto =============

    #[error("Crypto error: {0}")]
    Crypto(String),

    // ============= Config =============

    #[error("Config error: {0}")]
    Config(String),

    #[error("Invalid secret: {reason}")]
    InvalidSecret { reason: String },
}

impl ProxyError {
    /// Errors that a scanner or a broken client can provoke. They are logged
    /// at debug level only and never answered on the wire.
    pub fn is_client_fault(&self) -> bool {
        matches!(
            self,
            ProxyError::InvalidHandshake(_)
                | ProxyError::Protocol(_)
                | ProxyError::InvalidProtoTag(_)
                | ProxyError::InvalidMessageLength { .. }
                | ProxyError::ReplayDetected
                | ProxyError::ModeNotAllowed(_)
        )
    }

    pub fn is_upstream_fault(&self) -> bool {
        matches!(
            self,
            ProxyError::UpstreamUnavailable(_)
                | ProxyError::ConnectionTimeout { .. }
                | ProxyError::TgHandshakeTimeout
        )
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;

/// Outcome of a handshake step that owns the connection halves.
///
/// `BadClient` hands the halves back so the caller decides how to dispose of
/// them; the connection is never answered with an explicit rejection.
pub enum HandshakeResult<T, R, W> {
    Success(T),
    BadClient { reader: R, writer: W },
    Error(ProxyError),
}

impl<T, R, W> fmt::Debug for HandshakeResult<T, R, W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeResult::Success(_) => f.write_str("Success"),
            HandshakeResult::BadClient { .. } => f.write_str("BadClient"),
            HandshakeResult::Error(e) => write!(f, "Error({e})"),
        }
    }
}
