//! Disk usage across a node set.
//!
//! [`aggregate_usage`] queries every node concurrently and fails as a whole on
//! the first node error. [`UsageReport`] renders the table, verbose and
//! summary views.

use std::fmt::Write as _;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{BuildError, EngineError, Result};
use crate::node::NodeSet;
use crate::obs;

/// One record in a node's content store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default)]
    pub mutable: bool,
    #[serde(default)]
    pub in_use: bool,
    #[serde(default)]
    pub shared: bool,
    pub size: i64,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub usage_count: i64,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub record_type: String,
}

impl UsageRecord {
    pub fn reclaimable(&self) -> bool {
        !self.in_use
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Clause {
    Id(String),
    Parent(String),
    Type(String),
    Description(String),
    InUse(bool),
    Mutable(bool),
    Shared(bool),
    Until(Duration),
}

/// A conjunction of `key=value` clauses.
///
/// Serializes as the list of raw clauses so it can travel to remote engines.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct UsageFilter {
    raw: Vec<String>,
    clauses: Vec<Clause>,
}

impl UsageFilter {
    pub fn parse(values: &[String]) -> Result<Self> {
        let mut clauses = Vec::with_capacity(values.len());
        for value in values {
            let (key, val) = value.split_once('=').ok_or_else(|| {
                BuildError::config("filter", format!("bad format of filter (expected name=value): {value}"))
            })?;
            let clause = match key.trim().to_ascii_lowercase().as_str() {
                "id" => Clause::Id(val.to_string()),
                "parent" => Clause::Parent(val.to_string()),
                "type" => Clause::Type(val.to_string()),
                "description" => Clause::Description(val.to_string()),
                "inuse" => Clause::InUse(parse_bool(value, val)?),
                "mutable" => Clause::Mutable(parse_bool(value, val)?),
                "shared" => Clause::Shared(parse_bool(value, val)?),
                "until" => Clause::Until(humantime::parse_duration(val).map_err(|e| {
                    BuildError::config("filter", format!("invalid until value {val:?}: {e}"))
                })?),
                other => {
                    return Err(BuildError::config(
                        "filter",
                        format!("unsupported filter key {other:?}"),
                    ))
                }
            };
            clauses.push(clause);
        }
        Ok(Self {
            raw: values.to_vec(),
            clauses,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// `id` matches by prefix, `description` by substring, the rest exactly.
    /// `until` keeps records last used (or created) longer ago than the duration.
    pub fn matches(&self, record: &UsageRecord, now: DateTime<Utc>) -> bool {
        self.clauses.iter().all(|c| match c {
            Clause::Id(v) => record.id.starts_with(v.as_str()),
            Clause::Parent(v) => record.parent.as_deref() == Some(v.as_str()),
            Clause::Type(v) => record.record_type == *v,
            Clause::Description(v) => record.description.contains(v.as_str()),
            Clause::InUse(v) => record.in_use == *v,
            Clause::Mutable(v) => record.mutable == *v,
            Clause::Shared(v) => record.shared == *v,
            Clause::Until(d) => {
                let seen = record.last_used_at.unwrap_or(record.created_at);
                match chrono::Duration::from_std(*d) {
                    Ok(d) => seen < now - d,
                    Err(_) => false,
                }
            }
        })
    }
}

fn parse_bool(field: &str, val: &str) -> Result<bool> {
    val.parse()
        .map_err(|_| BuildError::config("filter", format!("invalid boolean in {field:?}")))
}

impl TryFrom<Vec<String>> for UsageFilter {
    type Error = BuildError;

    fn try_from(values: Vec<String>) -> Result<Self> {
        Self::parse(&values)
    }
}

impl From<UsageFilter> for Vec<String> {
    fn from(filter: UsageFilter) -> Self {
        filter.raw
    }
}

/// Records reported by one node.
#[derive(Debug, Clone)]
pub struct NodeUsage {
    pub node: String,
    pub records: Vec<UsageRecord>,
}

/// Query every node of `nodes` concurrently.
///
/// Any node that failed to initialize fails the call before a query is sent.
/// The first query error cancels the rest; nothing partial is returned.
pub async fn aggregate_usage(
    nodes: &NodeSet,
    filter: &UsageFilter,
    cancel: &CancellationToken,
) -> Result<UsageReport> {
    if let Some((node, reason)) = nodes.first_failure() {
        return Err(BuildError::NodeInit {
            node: node.name.clone(),
            reason: reason.to_string(),
        });
    }

    let scope = cancel.child_token();
    let mut join_set = JoinSet::new();
    for (idx, node) in nodes.nodes.iter().enumerate() {
        let Some(client) = node.client().cloned() else {
            continue;
        };
        let filter = filter.clone();
        let scope = scope.clone();
        let name = node.name.clone();
        join_set.spawn(async move {
            let records = tokio::select! {
                _ = scope.cancelled() => Err(EngineError::Cancelled),
                r = client.usage(&filter) => r,
            };
            (idx, name, records)
        });
    }

    let mut slots: Vec<Option<NodeUsage>> = vec![None; nodes.len()];
    let mut first_err: Option<BuildError> = None;
    while let Some(joined) = join_set.join_next().await {
        let (idx, node, records) = match joined {
            Ok(v) => v,
            Err(e) => {
                first_err.get_or_insert(BuildError::Internal(format!("usage task failed: {e}")));
                scope.cancel();
                continue;
            }
        };
        match records {
            Ok(records) => {
                debug!(node = %node, records = records.len(), "usage received");
                slots[idx] = Some(NodeUsage { node, records });
            }
            Err(EngineError::Cancelled) => {
                first_err.get_or_insert(BuildError::Cancelled);
                scope.cancel();
            }
            Err(source) => {
                first_err.get_or_insert(BuildError::Engine { node, source });
                scope.cancel();
            }
        }
    }
    if let Some(err) = first_err {
        return Err(err);
    }

    let report = UsageReport {
        nodes: slots.into_iter().flatten().collect(),
    };
    obs::emit_usage_collected(&nodes.name, report.nodes.len(), report.records().count());
    Ok(report)
}

/// Totals over records with a positive size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageSummary {
    pub total: i64,
    pub shared: i64,
    pub reclaimable: i64,
}

impl UsageSummary {
    pub fn private(&self) -> i64 {
        self.total - self.shared
    }
}

/// Usage records grouped by node, in node order.
#[derive(Debug, Clone, Default)]
pub struct UsageReport {
    pub nodes: Vec<NodeUsage>,
}

impl UsageReport {
    pub fn records(&self) -> impl Iterator<Item = &UsageRecord> {
        self.nodes.iter().flat_map(|n| n.records.iter())
    }

    pub fn summary(&self) -> UsageSummary {
        let mut s = UsageSummary::default();
        for r in self.records().filter(|r| r.size > 0) {
            s.total += r.size;
            if r.shared {
                s.shared += r.size;
            }
            if r.reclaimable() {
                s.reclaimable += r.size;
            }
        }
        s
    }

    /// One row per record under an `ID RECLAIMABLE SIZE LAST ACCESSED` header.
    pub fn render_table(&self, now: DateTime<Utc>) -> String {
        let mut rows = vec![vec![
            "ID".to_string(),
            "RECLAIMABLE".to_string(),
            "SIZE".to_string(),
            "LAST ACCESSED".to_string(),
        ]];
        for r in self.records() {
            let mut id = r.id.clone();
            if r.mutable {
                id.push('*');
            }
            let mut size = format_size(r.size);
            if r.shared {
                size.push('*');
            }
            let last = r
                .last_used_at
                .map(|t| format_last_accessed(t, now))
                .unwrap_or_default();
            rows.push(vec![
                format!("{id:<71}"),
                format!("{:<11}", r.reclaimable()),
                size,
                last,
            ]);
        }
        align_columns(&rows)
    }

    /// A `key: value` block per record.
    pub fn render_verbose(&self) -> String {
        let mut out = String::new();
        for r in self.records() {
            let mut kv: Vec<Vec<String>> = Vec::new();
            let mut push = |k: &str, v: String| kv.push(vec![format!("{k}:"), v]);
            push("ID", r.id.clone());
            if let Some(parent) = &r.parent {
                push("Parent", parent.clone());
            }
            push("Created at", r.created_at.to_string());
            push("Mutable", r.mutable.to_string());
            push("Reclaimable", r.reclaimable().to_string());
            push("Shared", r.shared.to_string());
            push("Size", format_size(r.size));
            if !r.description.is_empty() {
                push("Description", r.description.clone());
            }
            push("Usage count", r.usage_count.to_string());
            if let Some(t) = r.last_used_at {
                push("Last used", t.to_string());
            }
            if !r.record_type.is_empty() {
                push("Type", r.record_type.clone());
            }
            out.push_str(&align_columns(&kv));
            out.push('\n');
        }
        out
    }

    /// `Shared`/`Private` lines only appear when something is shared.
    pub fn render_summary(&self) -> String {
        let s = self.summary();
        let mut rows = Vec::new();
        if s.shared > 0 {
            rows.push(vec!["Shared:".to_string(), format_size(s.shared)]);
            rows.push(vec!["Private:".to_string(), format_size(s.private())]);
        }
        rows.push(vec!["Reclaimable:".to_string(), format_size(s.reclaimable)]);
        rows.push(vec!["Total:".to_string(), format_size(s.total)]);
        align_columns(&rows)
    }

    /// Full report. The summary is skipped when the query was filtered.
    pub fn render(&self, verbose: bool, filtered: bool, now: DateTime<Utc>) -> String {
        let mut out = if verbose {
            self.render_verbose()
        } else if self.records().next().is_some() {
            self.render_table(now)
        } else {
            String::new()
        };
        if !filtered {
            out.push_str(&self.render_summary());
        }
        out
    }
}

/// Left-align cells into columns separated by one space.
fn align_columns(rows: &[Vec<String>]) -> String {
    let cols = rows.iter().map(Vec::len).max().unwrap_or(0);
    let mut widths = vec![0usize; cols];
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(cell.chars().count());
        }
    }
    let mut out = String::new();
    for row in rows {
        let mut line = String::new();
        for (i, cell) in row.iter().enumerate() {
            if i + 1 == row.len() {
                line.push_str(cell);
            } else {
                let _ = write!(line, "{cell:<width$} ", width = widths[i]);
            }
        }
        out.push_str(line.trim_end());
        out.push('\n');
    }
    out
}

/// Human-readable byte count with 1024-based units.
pub fn format_size(bytes: i64) -> String {
    const UNITS: [&str; 7] = ["B", "kB", "MB", "GB", "TB", "PB", "EB"];
    if bytes.abs() < 1024 {
        return format!("{bytes}B");
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value.abs() >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2}{}", UNITS[unit])
}

/// Coarse age of `then` relative to `now`.
pub fn format_last_accessed(then: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (now - then).num_seconds();
    match secs {
        s if s < 60 => "Just now".to_string(),
        s if s < 3600 => format!("{}m ago", s / 60),
        s if s < 86_400 => format!("{}h ago", s / 3600),
        s => format!("{}d ago", s / 86_400),
    }
}
