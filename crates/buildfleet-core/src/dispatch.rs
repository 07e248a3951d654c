//! Fan-out of build targets over a node set.
//!
//! One branch runs per (target, node) pair under a shared cancellation scope.
//! A per-node semaphore keeps at most one build in flight on each node. The
//! first fatal branch error cancels every sibling; the progress sink is then
//! drained before that error is returned.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn, Instrument};

use crate::classify::wrap_build_error;
use crate::error::{BuildError, EngineError, Result};
use crate::metadata::write_metadata_file;
use crate::node::{NodeSet, SolveRequest, SolveResponse};
use crate::obs;
use crate::options::{BuildRequest, Platform, DEFAULT_TARGET};
use crate::progress::{BuildReporter, ProgressSink};
use crate::reconcile::{BuildOutcome, ResultSlots};

/// One unit of dispatch: a target on a node, with the platforms it builds there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Branch {
    pub target: String,
    pub node_index: usize,
    pub platforms: Vec<Platform>,
}

/// Assign each target's platforms to nodes.
///
/// A platform goes to the lowest-indexed node that supports it. A target with
/// no platforms goes to the first node.
pub fn plan_branches(
    nodes: &NodeSet,
    targets: &BTreeMap<String, BuildRequest>,
) -> Result<Vec<Branch>> {
    if nodes.is_empty() {
        return Err(BuildError::config(
            "builder",
            format!("builder {:?} has no nodes", nodes.name),
        ));
    }
    let mut branches = Vec::new();
    for (target, req) in targets {
        if req.platforms.is_empty() {
            branches.push(Branch {
                target: target.clone(),
                node_index: 0,
                platforms: Vec::new(),
            });
            continue;
        }
        let mut per_node: BTreeMap<usize, Vec<Platform>> = BTreeMap::new();
        for platform in &req.platforms {
            let idx = nodes
                .nodes
                .iter()
                .position(|n| n.supports(platform))
                .ok_or_else(|| {
                    BuildError::config(
                        "platform",
                        format!(
                            "no node in builder {:?} supports platform {platform}",
                            nodes.name
                        ),
                    )
                })?;
            per_node.entry(idx).or_default().push(platform.clone());
        }
        branches.extend(per_node.into_iter().map(|(node_index, platforms)| Branch {
            target: target.clone(),
            node_index,
            platforms,
        }));
    }
    Ok(branches)
}

/// Build a single target. Capability errors use single-target wording.
pub async fn run_build(
    nodes: &NodeSet,
    request: BuildRequest,
    reporter: &dyn BuildReporter,
    cancel: &CancellationToken,
) -> Result<BuildOutcome> {
    let mut targets = BTreeMap::new();
    targets.insert(DEFAULT_TARGET.to_string(), request);
    build_targets(nodes, targets, reporter, cancel)
        .await
        .map_err(|e| wrap_build_error(e, false))
}

/// Build a group of named targets. Capability errors use grouped wording.
pub async fn run_group(
    nodes: &NodeSet,
    targets: BTreeMap<String, BuildRequest>,
    reporter: &dyn BuildReporter,
    cancel: &CancellationToken,
) -> Result<BuildOutcome> {
    build_targets(nodes, targets, reporter, cancel)
        .await
        .map_err(|e| wrap_build_error(e, true))
}

/// Dispatch every target and reconcile the results.
///
/// After all branches settle: the metadata file of the default target is
/// written, the reporter gets the full warning list, then every print-mode
/// target's response is handed to [`BuildReporter::print_result`].
pub async fn build_targets(
    nodes: &NodeSet,
    targets: BTreeMap<String, BuildRequest>,
    reporter: &dyn BuildReporter,
    cancel: &CancellationToken,
) -> Result<BuildOutcome> {
    let session_id = targets
        .values()
        .next()
        .map(|r| r.session.id.to_string())
        .unwrap_or_default();
    let span = obs::build_span(&session_id, &nodes.name);
    let started = Instant::now();

    let result = dispatch(nodes, &targets, reporter, cancel, &session_id)
        .instrument(span)
        .await;

    let (winner, warnings) = match &result {
        Ok((outcome, warnings)) => (outcome.result.as_ref().map(|c| c.node_index), *warnings),
        Err(_) => (None, 0),
    };
    obs::emit_build_finished(
        &session_id,
        started.elapsed().as_millis() as u64,
        winner,
        warnings,
        result.is_ok(),
    );
    result.map(|(outcome, _)| outcome)
}

async fn dispatch(
    nodes: &NodeSet,
    targets: &BTreeMap<String, BuildRequest>,
    reporter: &dyn BuildReporter,
    cancel: &CancellationToken,
    session_id: &str,
) -> Result<(BuildOutcome, usize)> {
    if targets.is_empty() {
        return Err(BuildError::config("target", "nothing to build"));
    }
    if let Some((node, reason)) = nodes.first_failure() {
        return Err(BuildError::NodeInit {
            node: node.name.clone(),
            reason: reason.to_string(),
        });
    }
    let branches = plan_branches(nodes, targets)?;
    obs::emit_build_started(session_id, targets.len(), nodes.len());

    let scope = cancel.child_token();
    let sink = ProgressSink::start(reporter.progress(nodes));
    let semaphores: Vec<Arc<Semaphore>> = nodes
        .nodes
        .iter()
        .map(|_| Arc::new(Semaphore::new(1)))
        .collect();

    let mut join_set = JoinSet::new();
    for (branch_idx, branch) in branches.iter().enumerate() {
        let node = &nodes.nodes[branch.node_index];
        let client = node.client().cloned().ok_or_else(|| {
            BuildError::Internal(format!("node {} has no client", node.name))
        })?;
        let req = &targets[&branch.target];
        let solve = SolveRequest {
            target: branch.target.clone(),
            session_id: req.session.id,
            platforms: branch.platforms.clone(),
            request: req.clone(),
            session: req.session.descriptors(),
        };
        let writer = sink.writer().for_branch(&node.name, &branch.target);
        let sem = Arc::clone(&semaphores[branch.node_index]);
        let scope = scope.clone();
        obs::emit_node_dispatched(session_id, &node.name, &branch.target, branch.platforms.len());

        join_set.spawn(
            async move {
                let outcome: std::result::Result<SolveResponse, EngineError> = tokio::select! {
                    _ = scope.cancelled() => Err(EngineError::Cancelled),
                    r = async {
                        let _permit = sem
                            .acquire_owned()
                            .await
                            .map_err(|_| EngineError::Cancelled)?;
                        client.solve(&solve, writer.clone()).await
                    } => r,
                };
                if let Ok(resp) = &outcome {
                    for w in &resp.warnings {
                        writer.warn(w.clone());
                    }
                }
                (branch_idx, outcome)
            }
            .in_current_span(),
        );
    }

    let mut slots = ResultSlots::new(nodes.nodes.iter().map(|n| n.name.clone()).collect());
    let mut first_err: Option<BuildError> = None;
    while let Some(joined) = join_set.join_next().await {
        let (branch_idx, outcome) = match joined {
            Ok(v) => v,
            Err(e) => {
                first_err.get_or_insert(BuildError::Internal(format!("build task failed: {e}")));
                scope.cancel();
                continue;
            }
        };
        let branch = &branches[branch_idx];
        let node_name = &nodes.nodes[branch.node_index].name;
        obs::emit_node_finished(session_id, node_name, &branch.target, outcome.is_ok());
        match outcome {
            Ok(resp) => slots.record(branch.node_index, &branch.target, resp),
            Err(EngineError::Cancelled) => {
                first_err.get_or_insert(BuildError::Cancelled);
                scope.cancel();
            }
            Err(source) => {
                warn!(node = %node_name, target = %branch.target, error = %source, "branch failed");
                first_err.get_or_insert(BuildError::Engine {
                    node: node_name.clone(),
                    source,
                });
                scope.cancel();
            }
        }
    }

    // every writer clone died with its task; the sink can drain now
    let warnings = sink.wait().await;
    if let Some(err) = first_err {
        return Err(err);
    }
    let warnings = warnings?;
    let outcome = slots.into_outcome();
    debug!(winner = ?outcome.result, targets = outcome.responses.len(), "branches settled");

    if let Some(path) = targets
        .get(DEFAULT_TARGET)
        .and_then(|r| r.metadata_file.as_deref())
    {
        if !outcome.responses.is_empty() {
            let response = outcome
                .responses
                .get(DEFAULT_TARGET)
                .cloned()
                .unwrap_or_default();
            write_metadata_file(path, &response)?;
            obs::emit_metadata_written(path, response.len());
        }
    }

    reporter.warnings(&warnings);

    for (target, req) in targets {
        if let Some(func) = &req.print_func {
            let response = outcome.responses.get(target).cloned().unwrap_or_default();
            reporter
                .print_result(target, func, &response)
                .map_err(|source| BuildError::Callback {
                    what: "print result",
                    source,
                })?;
        }
    }

    Ok((outcome, warnings.len()))
}
