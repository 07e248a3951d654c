//! Lifecycle events emitted while building and collecting usage.

use buildfleet_core::fakes::{FakeEngine, FakeReporter};
use buildfleet_core::obs::{
    build_span, emit_build_finished, emit_build_started, emit_metadata_written,
    emit_node_dispatched,
};
use buildfleet_core::{aggregate_usage, run_build, BuildRequest, Node, NodeSet, UsageFilter};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use tracing_test::traced_test;

#[traced_test]
#[test]
fn test_emit_build_started_logs_event_name() {
    emit_build_started("session-1", 1, 3);
    assert!(logs_contain("build.started"));
    assert!(logs_contain("session-1"));
}

#[traced_test]
#[test]
fn test_emit_node_dispatched_logs_node() {
    emit_node_dispatched("session-2", "node-7", "default", 2);
    assert!(logs_contain("build.node_dispatched"));
    assert!(logs_contain("node-7"));
}

#[traced_test]
#[test]
fn test_emit_build_finished_logs_winner() {
    emit_build_finished("session-3", 120, Some(0), 2, true);
    assert!(logs_contain("build.finished"));
}

#[traced_test]
#[test]
fn test_emit_metadata_written_logs_path() {
    emit_metadata_written(std::path::Path::new("/tmp/meta.json"), 4);
    assert!(logs_contain("metadata.written"));
    assert!(logs_contain("/tmp/meta.json"));
}

#[traced_test]
#[tokio::test]
async fn test_build_span_tags_instrumented_future() {
    async {
        tracing::info!("inside build span");
    }
    .instrument(build_span("session-4", "fleet"))
    .await;
    assert!(logs_contain("inside build span"));
    assert!(logs_contain("session-4"));
}

#[traced_test]
#[tokio::test]
async fn test_run_build_emits_lifecycle() {
    let nodes = NodeSet::new(
        "fleet",
        vec![Node::ready(
            "node-0",
            FakeEngine::new().with_result("r0").into_client(),
        )],
    );
    run_build(
        &nodes,
        BuildRequest::default(),
        &FakeReporter::default(),
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert!(logs_contain("build.started"));
    assert!(logs_contain("build.node_dispatched"));
    assert!(logs_contain("build.node_finished"));
    assert!(logs_contain("build.finished"));
    assert!(logs_contain("buildfleet.build"));
}

#[traced_test]
#[tokio::test]
async fn test_usage_emits_collected() {
    let nodes = NodeSet::new(
        "fleet",
        vec![Node::ready("node-0", FakeEngine::new().into_client())],
    );
    aggregate_usage(&nodes, &UsageFilter::default(), &CancellationToken::new())
        .await
        .unwrap();
    assert!(logs_contain("usage.collected"));
}
