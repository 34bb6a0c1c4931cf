use thiserror::Error;

/// Errors produced by the gateway protocol and session layers.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("connection failed: {0}")]
    ConnectFailed(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("transfer error: {0}")]
    Transfer(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl GateError {
    /// Whether this error means the client connection itself is unusable.
    ///
    /// Everything else is local to one request and is reported back to the
    /// client as a typed error message.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, GateError::Transport(_))
    }
}

impl From<serde_json::Error> for GateError {
    fn from(e: serde_json::Error) -> Self {
        GateError::Codec(e.to_string())
    }
}

pub type GateResult<T> = Result<T, GateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transport_errors_are_fatal() {
        assert!(GateError::Transport("reset".into()).is_session_fatal());
        assert!(!GateError::Transfer("no such file".into()).is_session_fatal());
        assert!(!GateError::Channel("sftp closed".into()).is_session_fatal());
        assert!(!GateError::InvalidMessage("bad".into()).is_session_fatal());
    }

    #[test]
    fn display_has_no_debug_noise() {
        let err = GateError::Transfer("permission denied".into());
        assert_eq!(err.to_string(), "transfer error: permission denied");
    }
}
