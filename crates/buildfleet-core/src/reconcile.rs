//! Result reconciliation.
//!
//! Each branch parks what it produced in the slot of its node. Once every
//! branch has settled, a scan in node order picks the canonical result and
//! merges per-target exporter responses. Completion order never matters.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::node::{ExporterResponse, ResultHandle, SolveResponse};

/// The canonical build result for downstream operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResultContext {
    pub node_index: usize,
    pub node: String,
    pub target: String,
    pub handle: ResultHandle,
}

/// Merged outcome of one invocation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BuildOutcome {
    /// Exporter response per target name.
    pub responses: BTreeMap<String, ExporterResponse>,
    pub result: Option<ResultContext>,
}

#[derive(Debug)]
struct Finished {
    target: String,
    exporter_response: ExporterResponse,
    handle: Option<ResultHandle>,
}

/// Per-node result slots, indexed by node position.
#[derive(Debug)]
pub struct ResultSlots {
    names: Vec<String>,
    slots: Vec<Vec<Finished>>,
}

impl ResultSlots {
    pub fn new(node_names: Vec<String>) -> Self {
        let slots = node_names.iter().map(|_| Vec::new()).collect();
        Self {
            names: node_names,
            slots,
        }
    }

    /// Record a finished branch. Out-of-range indices are ignored.
    pub fn record(&mut self, node_index: usize, target: &str, response: SolveResponse) {
        if let Some(slot) = self.slots.get_mut(node_index) {
            slot.push(Finished {
                target: target.to_string(),
                exporter_response: response.exporter_response,
                handle: response.result,
            });
        }
    }

    /// Lowest-indexed node with a result wins. Within one node the target
    /// that sorts first wins.
    pub fn canonical(&self) -> Option<ResultContext> {
        self.slots.iter().enumerate().find_map(|(idx, slot)| {
            slot.iter()
                .filter_map(|f| f.handle.as_ref().map(|h| (f, h)))
                .min_by(|a, b| a.0.target.cmp(&b.0.target))
                .map(|(f, handle)| ResultContext {
                    node_index: idx,
                    node: self.names[idx].clone(),
                    target: f.target.clone(),
                    handle: handle.clone(),
                })
        })
    }

    /// Exporter responses per target. On a key clash the lower node index wins.
    pub fn merged_responses(&self) -> BTreeMap<String, ExporterResponse> {
        let mut out: BTreeMap<String, ExporterResponse> = BTreeMap::new();
        for slot in &self.slots {
            for f in slot {
                let merged = out.entry(f.target.clone()).or_default();
                for (k, v) in &f.exporter_response {
                    merged.entry(k.clone()).or_insert_with(|| v.clone());
                }
            }
        }
        out
    }

    pub fn into_outcome(self) -> BuildOutcome {
        BuildOutcome {
            responses: self.merged_responses(),
            result: self.canonical(),
        }
    }
}
