//! Progress and warning aggregation across concurrent build branches.
//!
//! Every branch holds a cheap [`ProgressWriter`] clone feeding one unbounded
//! channel. A single consumer task forwards events to the caller's
//! [`ProgressRenderer`] and accumulates warnings in arrival order. A slow
//! renderer never blocks a branch because sends do not wait.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{BoxError, BuildError, Result};
use crate::node::{ExporterResponse, NodeSet};
use crate::options::PrintFunc;

/// A build warning reported by an engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildWarning {
    /// Node that reported the warning. Filled in by the dispatcher.
    #[serde(default)]
    pub node: String,
    #[serde(default)]
    pub level: i32,
    pub short: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub detail: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl BuildWarning {
    pub fn new(short: impl Into<String>) -> Self {
        Self {
            node: String::new(),
            level: 1,
            short: short.into(),
            detail: Vec::new(),
            url: None,
        }
    }
}

/// One event on the shared progress stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProgressEvent {
    Status {
        node: String,
        target: String,
        message: String,
    },
    Warning(BuildWarning),
}

/// Renders progress events. Runs on the consumer task only.
pub trait ProgressRenderer: Send {
    fn on_event(&mut self, event: &ProgressEvent);

    /// Called once after the stream closes.
    fn finish(&mut self) -> std::result::Result<(), BoxError> {
        Ok(())
    }
}

/// Renderer that drops everything.
#[derive(Debug, Default)]
pub struct DiscardRenderer;

impl ProgressRenderer for DiscardRenderer {
    fn on_event(&mut self, _event: &ProgressEvent) {}
}

/// Caller hooks for one build invocation.
pub trait BuildReporter: Send + Sync {
    /// Construct the progress renderer for this node set.
    fn progress(&self, nodes: &NodeSet) -> Box<dyn ProgressRenderer>;

    /// Receives every warning once all branches have settled.
    fn warnings(&self, _warnings: &[BuildWarning]) {}

    /// Receives the exporter response of a target built in print mode.
    fn print_result(
        &self,
        _target: &str,
        _func: &PrintFunc,
        _response: &ExporterResponse,
    ) -> std::result::Result<(), BoxError> {
        Ok(())
    }
}

/// Branch-side handle onto the shared progress stream.
#[derive(Debug, Clone)]
pub struct ProgressWriter {
    tx: mpsc::UnboundedSender<ProgressEvent>,
    node: String,
    target: String,
}

impl ProgressWriter {
    /// A writer that tags its events with `node` and `target`.
    pub fn for_branch(&self, node: &str, target: &str) -> Self {
        Self {
            tx: self.tx.clone(),
            node: node.to_string(),
            target: target.to_string(),
        }
    }

    pub fn status(&self, message: impl Into<String>) {
        // the consumer only goes away after every writer is dropped
        let _ = self.tx.send(ProgressEvent::Status {
            node: self.node.clone(),
            target: self.target.clone(),
            message: message.into(),
        });
    }

    pub fn warn(&self, mut warning: BuildWarning) {
        if warning.node.is_empty() {
            warning.node = self.node.clone();
        }
        let _ = self.tx.send(ProgressEvent::Warning(warning));
    }

    /// A writer whose events go nowhere. Handy for direct client calls.
    pub fn detached() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self {
            tx,
            node: String::new(),
            target: String::new(),
        }
    }
}

/// Owner side of the progress stream.
pub struct ProgressSink {
    root: ProgressWriter,
    consumer: JoinHandle<std::result::Result<Vec<BuildWarning>, BoxError>>,
}

impl ProgressSink {
    /// Spawn the consumer task around `renderer`.
    pub fn start(mut renderer: Box<dyn ProgressRenderer>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<ProgressEvent>();
        let consumer = tokio::spawn(async move {
            let mut warnings = Vec::new();
            while let Some(event) = rx.recv().await {
                renderer.on_event(&event);
                if let ProgressEvent::Warning(w) = event {
                    warnings.push(w);
                }
            }
            renderer.finish()?;
            Ok(warnings)
        });
        Self {
            root: ProgressWriter {
                tx,
                node: String::new(),
                target: String::new(),
            },
            consumer,
        }
    }

    pub fn writer(&self) -> &ProgressWriter {
        &self.root
    }

    /// Close the stream and wait for the renderer to drain it.
    ///
    /// Returns once every outstanding writer has been dropped.
    pub async fn wait(self) -> Result<Vec<BuildWarning>> {
        drop(self.root);
        match self.consumer.await {
            Ok(Ok(warnings)) => Ok(warnings),
            Ok(Err(source)) => Err(BuildError::Callback {
                what: "progress printer",
                source,
            }),
            Err(e) => Err(BuildError::Internal(format!("progress task failed: {e}"))),
        }
    }
}
