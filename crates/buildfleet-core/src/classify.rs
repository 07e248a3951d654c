//! Rewrites known engine failures into actionable errors.

use crate::error::{BuildError, EngineError};

/// Frontend capability required by named build contexts.
pub const CAP_FRONTEND_CONTEXTS: &str = "moby.buildkit.frontend.contexts";

/// Turn an `Unimplemented` status naming [`CAP_FRONTEND_CONTEXTS`] into
/// [`BuildError::CapabilityUnsupported`]. Anything else passes through.
///
/// `multi_target` selects the wording for grouped builds.
pub fn wrap_build_error(err: BuildError, multi_target: bool) -> BuildError {
    match err {
        BuildError::Engine {
            node,
            source: EngineError::Rpc(status),
        } => match status.unsupported_capability() {
            Some(CAP_FRONTEND_CONTEXTS) => BuildError::CapabilityUnsupported {
                capability: CAP_FRONTEND_CONTEXTS.to_string(),
                multi_target,
                source: EngineError::Rpc(status),
            },
            _ => BuildError::Engine {
                node,
                source: EngineError::Rpc(status),
            },
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Code, ErrorKind, RpcStatus};
    use std::error::Error as _;

    fn unimplemented(cap: &str) -> BuildError {
        BuildError::Engine {
            node: "node-0".to_string(),
            source: EngineError::Rpc(RpcStatus::new(
                Code::Unimplemented,
                format!("unsupported frontend capability {cap}"),
            )),
        }
    }

    #[test]
    fn test_single_target_mentions_build_context() {
        let err = wrap_build_error(unimplemented(CAP_FRONTEND_CONTEXTS), false);
        assert_eq!(err.kind(), ErrorKind::Capability);
        assert!(err.to_string().contains("--build-context"));
        assert!(err.to_string().contains("#syntax"));
    }

    #[test]
    fn test_capability_with_reason_suffix_is_rewritten() {
        for suffix in [": not enabled", "."] {
            let err = wrap_build_error(
                unimplemented(&format!("{CAP_FRONTEND_CONTEXTS}{suffix}")),
                false,
            );
            assert_eq!(err.kind(), ErrorKind::Capability, "suffix {suffix:?}");
            assert!(err.to_string().contains("--build-context"));
        }
    }

    #[test]
    fn test_grouped_mentions_targets() {
        let err = wrap_build_error(unimplemented(CAP_FRONTEND_CONTEXTS), true);
        assert!(err
            .to_string()
            .contains("defining additional contexts for targets"));
    }

    #[test]
    fn test_original_status_stays_reachable() {
        let err = wrap_build_error(unimplemented(CAP_FRONTEND_CONTEXTS), false);
        assert_eq!(err.rpc_status().unwrap().code, Code::Unimplemented);

        let cause = err.source().unwrap();
        let engine = cause.downcast_ref::<EngineError>().unwrap();
        assert!(engine
            .status()
            .unwrap()
            .message
            .contains(CAP_FRONTEND_CONTEXTS));
    }

    #[test]
    fn test_other_errors_pass_through() {
        let other_cap = wrap_build_error(unimplemented("moby.buildkit.frontend.inputs"), false);
        assert_eq!(other_cap.kind(), ErrorKind::Transport);

        let unavailable = wrap_build_error(
            BuildError::Engine {
                node: "node-1".to_string(),
                source: EngineError::Rpc(RpcStatus::new(Code::Unavailable, "connection refused")),
            },
            false,
        );
        assert!(unavailable.to_string().contains("connection refused"));
        assert!(matches!(
            wrap_build_error(BuildError::Cancelled, true),
            BuildError::Cancelled
        ));
    }
}
