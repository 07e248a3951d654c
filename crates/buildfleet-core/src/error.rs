//! Error taxonomy for build orchestration.
//!
//! Two layers:
//! - [`EngineError`] is what a node's client returns across the RPC boundary.
//! - [`BuildError`] is what the orchestrator surfaces to callers. It keeps the
//!   engine error reachable through [`std::error::Error::source`].

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Boxed error returned by caller-supplied callbacks and collaborators.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Status codes carried by an engine RPC failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Code {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    Unimplemented,
    Internal,
    Unavailable,
    Unauthenticated,
}

impl Code {
    /// Parse a code name as sent on the wire (`"unimplemented"`, `"Unavailable"`, ...).
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().replace('_', "").as_str() {
            "cancelled" | "canceled" => Code::Cancelled,
            "invalidargument" => Code::InvalidArgument,
            "deadlineexceeded" => Code::DeadlineExceeded,
            "notfound" => Code::NotFound,
            "alreadyexists" => Code::AlreadyExists,
            "permissiondenied" => Code::PermissionDenied,
            "resourceexhausted" => Code::ResourceExhausted,
            "failedprecondition" => Code::FailedPrecondition,
            "aborted" => Code::Aborted,
            "unimplemented" => Code::Unimplemented,
            "internal" => Code::Internal,
            "unavailable" => Code::Unavailable,
            "unauthenticated" => Code::Unauthenticated,
            _ => Code::Unknown,
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Code::Cancelled => "Canceled",
            Code::Unknown => "Unknown",
            Code::InvalidArgument => "InvalidArgument",
            Code::DeadlineExceeded => "DeadlineExceeded",
            Code::NotFound => "NotFound",
            Code::AlreadyExists => "AlreadyExists",
            Code::PermissionDenied => "PermissionDenied",
            Code::ResourceExhausted => "ResourceExhausted",
            Code::FailedPrecondition => "FailedPrecondition",
            Code::Aborted => "Aborted",
            Code::Unimplemented => "Unimplemented",
            Code::Internal => "Internal",
            Code::Unavailable => "Unavailable",
            Code::Unauthenticated => "Unauthenticated",
        };
        f.write_str(name)
    }
}

/// A structured status returned by an engine RPC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("rpc error: code = {code} desc = {message}")]
pub struct RpcStatus {
    pub code: Code,
    pub message: String,
}

impl RpcStatus {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Name of the frontend capability an `Unimplemented` status rejected, if any.
    ///
    /// The name ends at the first character that cannot be part of a
    /// capability id, so `...contexts: reason` and `...contexts.` both yield
    /// the bare id.
    pub fn unsupported_capability(&self) -> Option<&str> {
        const MARKER: &str = "unsupported frontend capability ";
        if self.code != Code::Unimplemented {
            return None;
        }
        let start = self.message.find(MARKER)? + MARKER.len();
        let rest = &self.message[start..];
        let end = rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
            .unwrap_or(rest.len());
        let name = rest[..end].trim_end_matches('.');
        (!name.is_empty()).then_some(name)
    }
}

/// Errors returned by a node's engine client.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    /// The engine answered with a status.
    #[error(transparent)]
    Rpc(#[from] RpcStatus),

    /// The engine could not be reached or the connection broke.
    #[error("transport error: {0}")]
    Transport(String),

    /// The call was abandoned because the shared scope was cancelled.
    #[error("engine call cancelled")]
    Cancelled,
}

impl EngineError {
    pub fn status(&self) -> Option<&RpcStatus> {
        match self {
            EngineError::Rpc(st) => Some(st),
            _ => None,
        }
    }
}

/// Result type for engine client calls.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Coarse classification of a [`BuildError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The caller's input was wrong.
    Configuration,
    /// A node never became usable.
    NodeInit,
    /// A node failed while serving a call.
    Transport,
    /// The engine lacks a capability the request needs.
    Capability,
    /// Writing build output to disk failed.
    Persistence,
    /// A caller-supplied callback failed.
    Callback,
    /// The caller cancelled the operation.
    Cancelled,
    Internal,
}

/// Errors surfaced by build orchestration and usage aggregation.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("invalid {field}: {reason}")]
    Config { field: &'static str, reason: String },

    #[error("node {node} failed to initialize: {reason}")]
    NodeInit { node: String, reason: String },

    #[error("{node}: {source}")]
    Engine {
        node: String,
        #[source]
        source: EngineError,
    },

    #[error("{}", capability_message(.multi_target))]
    CapabilityUnsupported {
        capability: String,
        multi_target: bool,
        #[source]
        source: EngineError,
    },

    #[error("failed to write {}: {source}", path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{what} failed: {source}")]
    Callback {
        what: &'static str,
        #[source]
        source: BoxError,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl BuildError {
    pub fn config(field: &'static str, reason: impl Into<String>) -> Self {
        BuildError::Config {
            field,
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            BuildError::Config { .. } => ErrorKind::Configuration,
            BuildError::NodeInit { .. } => ErrorKind::NodeInit,
            BuildError::Engine { .. } => ErrorKind::Transport,
            BuildError::CapabilityUnsupported { .. } => ErrorKind::Capability,
            BuildError::Persistence { .. } | BuildError::Serialization(_) => {
                ErrorKind::Persistence
            }
            BuildError::Callback { .. } => ErrorKind::Callback,
            BuildError::Cancelled => ErrorKind::Cancelled,
            BuildError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// True when the failure came from the caller's input rather than the backend.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Configuration | ErrorKind::Capability
        )
    }

    /// The engine status underneath this error, if any.
    pub fn rpc_status(&self) -> Option<&RpcStatus> {
        match self {
            BuildError::Engine { source, .. } | BuildError::CapabilityUnsupported { source, .. } => {
                source.status()
            }
            _ => None,
        }
    }
}

fn capability_message(multi_target: &bool) -> String {
    let lead = if *multi_target {
        "current frontend does not support defining additional contexts for targets."
    } else {
        "current frontend does not support --build-context."
    };
    format!(
        "{lead} Named contexts are supported since Dockerfile v1.4. \
         Use #syntax directive in Dockerfile or update to latest BuildKit."
    )
}

/// Result type for orchestration operations.
pub type Result<T> = std::result::Result<T, BuildError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_status_display_matches_grpc_format() {
        let st = RpcStatus::new(Code::Unavailable, "connection refused");
        assert_eq!(
            st.to_string(),
            "rpc error: code = Unavailable desc = connection refused"
        );
    }

    #[test]
    fn test_unsupported_capability_extracts_name() {
        let st = RpcStatus::new(
            Code::Unimplemented,
            "unsupported frontend capability moby.buildkit.frontend.contexts",
        );
        assert_eq!(
            st.unsupported_capability(),
            Some("moby.buildkit.frontend.contexts")
        );

        let other = RpcStatus::new(
            Code::Internal,
            "unsupported frontend capability moby.buildkit.frontend.contexts",
        );
        assert_eq!(other.unsupported_capability(), None);
    }

    #[test]
    fn test_unsupported_capability_ignores_trailing_text() {
        for message in [
            "unsupported frontend capability moby.buildkit.frontend.contexts: not enabled",
            "unsupported frontend capability moby.buildkit.frontend.contexts.",
            "failed to solve: unsupported frontend capability moby.buildkit.frontend.contexts, upgrade",
        ] {
            let st = RpcStatus::new(Code::Unimplemented, message);
            assert_eq!(
                st.unsupported_capability(),
                Some("moby.buildkit.frontend.contexts"),
                "{message}"
            );
        }
        let bare = RpcStatus::new(Code::Unimplemented, "unsupported frontend capability ");
        assert_eq!(bare.unsupported_capability(), None);
    }

    #[test]
    fn test_code_from_name_accepts_wire_spellings() {
        assert_eq!(Code::from_name("unimplemented"), Code::Unimplemented);
        assert_eq!(Code::from_name("DEADLINE_EXCEEDED"), Code::DeadlineExceeded);
        assert_eq!(Code::from_name("Canceled"), Code::Cancelled);
        assert_eq!(Code::from_name("bogus"), Code::Unknown);
    }

    #[test]
    fn test_config_error_names_field() {
        let err = BuildError::config("platform", "unknown os \"\"");
        assert!(err.to_string().starts_with("invalid platform:"));
        assert!(err.is_user_error());
    }

    #[test]
    fn test_engine_error_is_backend_failure() {
        let err = BuildError::Engine {
            node: "node-0".to_string(),
            source: EngineError::Transport("broken pipe".to_string()),
        };
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(!err.is_user_error());
        assert!(err.to_string().contains("broken pipe"));
    }
}
