use buildfleet_core::EngineError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("invalid endpoint {endpoint:?}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<RemoteError> for EngineError {
    fn from(err: RemoteError) -> Self {
        EngineError::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_becomes_transport() {
        let err: EngineError = RemoteError::Protocol("bad line".to_string()).into();
        assert!(matches!(err, EngineError::Transport(ref m) if m.contains("bad line")));
    }
}
