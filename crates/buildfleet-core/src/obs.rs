//! Structured lifecycle events for builds and usage reports.
//!
//! Every event carries an `event` field (`build.started`, `usage.collected`,
//! ...) so log pipelines can filter on it without parsing messages.

use tracing::info;

/// Span tagged with the build session id, for instrumenting a build future.
///
/// ```ignore
/// dispatch(..).instrument(obs::build_span("6f0c...", "fleet")).await
/// ```
pub fn build_span(session_id: &str, builder: &str) -> tracing::Span {
    tracing::info_span!("buildfleet.build", session_id = %session_id, builder = %builder)
}

pub fn emit_build_started(session_id: &str, targets: usize, nodes: usize) {
    info!(event = "build.started", session_id = %session_id, targets, nodes);
}

pub fn emit_node_dispatched(session_id: &str, node: &str, target: &str, platforms: usize) {
    info!(
        event = "build.node_dispatched",
        session_id = %session_id,
        node = %node,
        target = %target,
        platforms,
    );
}

pub fn emit_node_finished(session_id: &str, node: &str, target: &str, success: bool) {
    info!(
        event = "build.node_finished",
        session_id = %session_id,
        node = %node,
        target = %target,
        success,
    );
}

/// `winner` is the index of the node holding the canonical result.
pub fn emit_build_finished(
    session_id: &str,
    duration_ms: u64,
    winner: Option<usize>,
    warnings: usize,
    success: bool,
) {
    info!(
        event = "build.finished",
        session_id = %session_id,
        duration_ms,
        winner = ?winner,
        warnings,
        success,
    );
}

pub fn emit_usage_collected(builder: &str, nodes: usize, records: usize) {
    info!(event = "usage.collected", builder = %builder, nodes, records);
}

pub fn emit_metadata_written(path: &std::path::Path, keys: usize) {
    info!(event = "metadata.written", path = %path.display(), keys);
}
