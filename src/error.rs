//! Error types for the voice terminal core

use thiserror::Error;

/// Result type alias for voice terminal operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the voice terminal core
#[derive(Debug, Error)]
pub enum Error {
    /// Precondition violated (out-of-range parameter, malformed buffer)
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Queue full, would-block or contention on a non-blocking path
    #[error("busy: {0}")]
    Busy(String),

    /// Operation exceeded its deadline
    #[error("timed out: {0}")]
    TimedOut(String),

    /// Peer sent something malformed, unknown or for the wrong session
    #[error("remote peer fault: {0}")]
    RemotePeer(String),

    /// Reliable channel closed or unreachable
    #[error("transport lost: {0}")]
    TransportLost(String),

    /// Audio hardware failed to deliver or accept frames
    #[error("codec fault: {0}")]
    CodecFault(String),

    /// Allocation or capacity failure on a critical path
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Service discovery error
    #[error("discovery error: {0}")]
    Discovery(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// WebSocket error
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Coarse error classification used for counters and telemetry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidInput,
    BusyOrTransient,
    TimedOut,
    RemotePeerFault,
    TransportLost,
    CodecFault,
    ResourceExhausted,
    Config,
}

impl Error {
    /// Classify this error into the failure taxonomy
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::Busy(_) => ErrorKind::BusyOrTransient,
            Self::TimedOut(_) => ErrorKind::TimedOut,
            Self::RemotePeer(_) | Self::Serialization(_) => ErrorKind::RemotePeerFault,
            Self::TransportLost(_) | Self::WebSocket(_) | Self::Http(_) | Self::Io(_) => {
                ErrorKind::TransportLost
            }
            Self::CodecFault(_) => ErrorKind::CodecFault,
            Self::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            Self::Config(_) | Self::Toml(_) | Self::Discovery(_) => ErrorKind::Config,
        }
    }

    /// Whether the caller may retry the failed operation
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::BusyOrTransient | ErrorKind::TimedOut | ErrorKind::TransportLost
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(
            Error::Busy("queue full".to_string()).kind(),
            ErrorKind::BusyOrTransient
        );
        assert_eq!(
            Error::CodecFault("i2s".to_string()).kind(),
            ErrorKind::CodecFault
        );
        let parse = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert_eq!(Error::from(parse).kind(), ErrorKind::RemotePeerFault);
    }

    #[test]
    fn test_transient() {
        assert!(Error::TimedOut("connect".to_string()).is_transient());
        assert!(Error::TransportLost("closed".to_string()).is_transient());
        assert!(!Error::InvalidInput("gain".to_string()).is_transient());
        assert!(!Error::CodecFault("dma".to_string()).is_transient());
    }
}
