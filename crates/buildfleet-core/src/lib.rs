//! buildfleet core library
//!
//! Drives container image builds across an ordered set of build engine
//! nodes and reconciles their results into one outcome.
//!
//! ## Key Components
//!
//! - `options`: user-facing build options to a validated `BuildRequest`
//! - `session`: auth, secret and SSH handlers attached to a request
//! - `dispatch`: concurrent fan-out with shared cancellation
//! - `reconcile`: index-ordered result selection and response merging
//! - `progress`: one multiplexed progress and warning stream
//! - `usage`: concurrent disk-usage collection and rendering
//! - `classify`: actionable rewrites of engine capability errors
//! - `metadata`: atomic metadata file output

pub mod classify;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod fakes;
pub mod metadata;
pub mod node;
pub mod obs;
pub mod options;
pub mod progress;
pub mod reconcile;
pub mod session;
pub mod telemetry;
pub mod usage;

pub use classify::{wrap_build_error, CAP_FRONTEND_CONTEXTS};
pub use config::{BuilderConfig, FleetConfig, NodeConfig};
pub use dispatch::{build_targets, plan_branches, run_build, run_group, Branch};
pub use error::{
    BoxError, BuildError, Code, EngineError, EngineResult, ErrorKind, Result, RpcStatus,
};
pub use metadata::{decode_exporter_response, write_metadata_file};
pub use node::{
    DriverFactory, EngineClient, ExporterResponse, Node, NodeSet, NodeState, ResultHandle,
    SolveRequest, SolveResponse,
};
pub use options::{translate, BuildOptions, BuildRequest, Platform, DEFAULT_TARGET};
pub use progress::{
    BuildReporter, BuildWarning, DiscardRenderer, ProgressEvent, ProgressRenderer, ProgressSink,
    ProgressWriter,
};
pub use reconcile::{BuildOutcome, ResultContext};
pub use session::{provision_session, Attachable, Session, SessionCollaborator};
pub use usage::{aggregate_usage, UsageFilter, UsageRecord, UsageReport, UsageSummary};
