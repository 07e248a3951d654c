//! In-memory fakes for the engine, driver and session seams (testing only).
//!
//! `FakeEngine` plays a scripted node: it sleeps, then answers with a result,
//! an error, warnings or usage records. Its [`EngineLedger`] records calls and
//! whether an in-flight call was abandoned by cancellation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::config::NodeConfig;
use crate::error::{BoxError, EngineError, EngineResult};
use crate::node::{
    DriverFactory, EngineClient, ExporterResponse, ResultHandle, SolveRequest, SolveResponse,
};
use crate::options::{PrintFunc, SecretSpec, SshSpec};
use crate::progress::{
    BuildReporter, BuildWarning, DiscardRenderer, ProgressRenderer, ProgressWriter,
};
use crate::session::{Attachable, SessionCollaborator};
use crate::usage::{UsageFilter, UsageRecord};
use crate::node::NodeSet;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// FakeEngine
// ---------------------------------------------------------------------------

/// Observations of a [`FakeEngine`], shared with the test.
#[derive(Debug, Default)]
pub struct EngineLedger {
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    cancelled: AtomicBool,
    completed: AtomicUsize,
    requests: Mutex<Vec<SolveRequest>>,
}

impl EngineLedger {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// True once an in-flight call was dropped before it finished.
    pub fn was_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<SolveRequest> {
        lock(&self.requests).clone()
    }
}

struct InFlight<'a> {
    ledger: &'a EngineLedger,
    done: bool,
}

impl<'a> InFlight<'a> {
    fn begin(ledger: &'a EngineLedger) -> Self {
        ledger.calls.fetch_add(1, Ordering::SeqCst);
        let now = ledger.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        ledger.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self { ledger, done: false }
    }

    fn finish(mut self) {
        self.done = true;
        self.ledger.completed.fetch_add(1, Ordering::SeqCst);
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.ledger.in_flight.fetch_sub(1, Ordering::SeqCst);
        if !self.done {
            self.ledger.cancelled.store(true, Ordering::SeqCst);
        }
    }
}

/// Scripted in-memory engine.
#[derive(Debug)]
pub struct FakeEngine {
    delay: Duration,
    result: Option<ResultHandle>,
    exporter_response: ExporterResponse,
    warnings: Vec<BuildWarning>,
    error: Option<EngineError>,
    usage: Vec<UsageRecord>,
    ledger: Arc<EngineLedger>,
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeEngine {
    /// An engine that answers immediately with no result.
    pub fn new() -> Self {
        Self {
            delay: Duration::ZERO,
            result: None,
            exporter_response: ExporterResponse::new(),
            warnings: Vec::new(),
            error: None,
            usage: Vec::new(),
            ledger: Arc::new(EngineLedger::default()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_result(mut self, id: &str) -> Self {
        self.result = Some(ResultHandle { id: id.to_string() });
        self
    }

    pub fn with_exporter(mut self, key: &str, value: &str) -> Self {
        self.exporter_response
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_warning(mut self, short: &str) -> Self {
        self.warnings.push(BuildWarning::new(short));
        self
    }

    pub fn with_error(mut self, error: EngineError) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_usage(mut self, records: Vec<UsageRecord>) -> Self {
        self.usage = records;
        self
    }

    pub fn ledger(&self) -> Arc<EngineLedger> {
        Arc::clone(&self.ledger)
    }

    pub fn into_client(self) -> Arc<dyn EngineClient> {
        Arc::new(self)
    }
}

#[async_trait]
impl EngineClient for FakeEngine {
    async fn solve(
        &self,
        request: &SolveRequest,
        progress: ProgressWriter,
    ) -> EngineResult<SolveResponse> {
        let guard = InFlight::begin(&self.ledger);
        lock(&self.ledger.requests).push(request.clone());
        progress.status(format!("solving {}", request.target));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        guard.finish();
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        Ok(SolveResponse {
            exporter_response: self.exporter_response.clone(),
            warnings: self.warnings.clone(),
            result: self.result.clone(),
        })
    }

    async fn usage(&self, filter: &UsageFilter) -> EngineResult<Vec<UsageRecord>> {
        let guard = InFlight::begin(&self.ledger);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        guard.finish();
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        let now = Utc::now();
        Ok(self
            .usage
            .iter()
            .filter(|r| filter.matches(r, now))
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// FakeDriverFactory
// ---------------------------------------------------------------------------

/// Connects node names to pre-built engines. Unknown names fail to connect.
#[derive(Default)]
pub struct FakeDriverFactory {
    engines: HashMap<String, Arc<dyn EngineClient>>,
}

impl FakeDriverFactory {
    pub fn with_engine(mut self, node: &str, engine: FakeEngine) -> Self {
        self.engines.insert(node.to_string(), engine.into_client());
        self
    }
}

#[async_trait]
impl DriverFactory for FakeDriverFactory {
    async fn connect(&self, node: &NodeConfig) -> Result<Arc<dyn EngineClient>, BoxError> {
        self.engines
            .get(&node.name)
            .cloned()
            .ok_or_else(|| format!("dial {}: connection refused", node.endpoint).into())
    }
}

// ---------------------------------------------------------------------------
// Session fakes
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct FakeAttachable {
    kind: String,
    descriptor: serde_json::Value,
}

impl FakeAttachable {
    pub fn new(kind: &str, descriptor: serde_json::Value) -> Self {
        Self {
            kind: kind.to_string(),
            descriptor,
        }
    }
}

impl Attachable for FakeAttachable {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn descriptor(&self) -> serde_json::Value {
        self.descriptor.clone()
    }
}

#[derive(Debug, Default)]
pub struct FakeSessionCollaborator {
    pub fail_auth: bool,
}

#[async_trait]
impl SessionCollaborator for FakeSessionCollaborator {
    async fn auth(&self) -> Result<Arc<dyn Attachable>, BoxError> {
        if self.fail_auth {
            return Err("credential helper exited with status 1".into());
        }
        Ok(Arc::new(FakeAttachable::new("auth", serde_json::json!({}))))
    }

    async fn secrets(&self, specs: &[SecretSpec]) -> Result<Arc<dyn Attachable>, BoxError> {
        let ids: Vec<&str> = specs.iter().map(|s| s.id.as_str()).collect();
        Ok(Arc::new(FakeAttachable::new(
            "secrets",
            serde_json::json!({ "ids": ids }),
        )))
    }

    async fn ssh(&self, specs: &[SshSpec]) -> Result<Arc<dyn Attachable>, BoxError> {
        let ids: Vec<&str> = specs.iter().map(|s| s.id.as_str()).collect();
        Ok(Arc::new(FakeAttachable::new(
            "ssh",
            serde_json::json!({ "ids": ids }),
        )))
    }
}

// ---------------------------------------------------------------------------
// FakeReporter
// ---------------------------------------------------------------------------

/// Records what the dispatcher reports back to the caller.
#[derive(Debug, Default)]
pub struct FakeReporter {
    warnings: Mutex<Option<Vec<BuildWarning>>>,
    printed: Mutex<Vec<(String, PrintFunc, ExporterResponse)>>,
    fail_print_for: Option<String>,
}

impl FakeReporter {
    /// Reporter whose print callback fails for `target`.
    pub fn failing_print(target: &str) -> Self {
        Self {
            fail_print_for: Some(target.to_string()),
            ..Default::default()
        }
    }

    /// Warnings handed over, or `None` if the callback never ran.
    pub fn warnings_seen(&self) -> Option<Vec<BuildWarning>> {
        lock(&self.warnings).clone()
    }

    pub fn printed(&self) -> Vec<(String, PrintFunc, ExporterResponse)> {
        lock(&self.printed).clone()
    }
}

impl BuildReporter for FakeReporter {
    fn progress(&self, _nodes: &NodeSet) -> Box<dyn ProgressRenderer> {
        Box::new(DiscardRenderer)
    }

    fn warnings(&self, warnings: &[BuildWarning]) {
        *lock(&self.warnings) = Some(warnings.to_vec());
    }

    fn print_result(
        &self,
        target: &str,
        func: &PrintFunc,
        response: &ExporterResponse,
    ) -> Result<(), BoxError> {
        if self.fail_print_for.as_deref() == Some(target) {
            return Err(format!("cannot print {target}").into());
        }
        lock(&self.printed).push((target.to_string(), func.clone(), response.clone()));
        Ok(())
    }
}
