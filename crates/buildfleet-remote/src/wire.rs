//! JSON shapes exchanged with a remote engine.

use buildfleet_core::{BuildWarning, Code, ExporterResponse, ResultHandle, RpcStatus};
use serde::{Deserialize, Serialize};

/// Answer of `GET /v1/info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineInfo {
    pub version: String,
    #[serde(default)]
    pub platforms: Vec<String>,
}

/// Error payload of a non-2xx answer or of an `error` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl From<ErrorBody> for RpcStatus {
    fn from(body: ErrorBody) -> Self {
        RpcStatus::new(Code::from_name(&body.code), body.message)
    }
}

/// One line of the `POST /v1/solve` stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SolveEvent {
    Status {
        message: String,
    },
    Warning(BuildWarning),
    Result {
        #[serde(default)]
        exporter_response: ExporterResponse,
        #[serde(default)]
        result: Option<ResultHandle>,
    },
    Error(ErrorBody),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_lines_parse() {
        let status: SolveEvent =
            serde_json::from_str(r#"{"type":"status","message":"[1/3] FROM alpine"}"#).unwrap();
        assert_eq!(
            status,
            SolveEvent::Status {
                message: "[1/3] FROM alpine".to_string()
            }
        );

        let warning: SolveEvent = serde_json::from_str(
            r#"{"type":"warning","short":"FromAsCasing","detail":["'as' and 'FROM' differ"]}"#,
        )
        .unwrap();
        match warning {
            SolveEvent::Warning(w) => {
                assert_eq!(w.short, "FromAsCasing");
                assert!(w.node.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }

        let result: SolveEvent = serde_json::from_str(
            r#"{"type":"result","exporter_response":{"k":"v"},"result":{"id":"ref-1"}}"#,
        )
        .unwrap();
        assert!(matches!(result, SolveEvent::Result { result: Some(_), .. }));
    }

    #[test]
    fn test_error_body_maps_code() {
        let body: ErrorBody =
            serde_json::from_str(r#"{"code":"unavailable","message":"draining"}"#).unwrap();
        let status = RpcStatus::from(body);
        assert_eq!(status.code, Code::Unavailable);
        assert_eq!(status.message, "draining");
    }
}
