//! HTTP engine driver for buildfleet.
//!
//! A node is an HTTP endpoint speaking a small JSON protocol:
//!
//! - `GET /v1/info` answers with [`EngineInfo`]; used as the connection check
//! - `POST /v1/solve` streams newline-delimited [`SolveEvent`]s
//! - `POST /v1/usage` answers with a list of usage records
//!
//! Non-2xx answers carry `{"code": "<status name>", "message": ".."}`.

mod client;
mod error;
mod factory;
pub mod wire;

pub use client::HttpEngineClient;
pub use error::RemoteError;
pub use factory::HttpDriverFactory;
pub use wire::{EngineInfo, ErrorBody, SolveEvent};
