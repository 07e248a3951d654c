//! Nodes, node sets and the engine client contract.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{BuilderConfig, NodeConfig};
use crate::error::{BoxError, EngineResult};
use crate::options::{BuildRequest, Platform};
use crate::progress::{BuildWarning, ProgressWriter};
use crate::usage::{UsageFilter, UsageRecord};

/// Opaque key/value metadata describing where a build's output went.
pub type ExporterResponse = BTreeMap<String, String>;

/// Reference to a solved build result held by an engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultHandle {
    pub id: String,
}

/// What a branch sends to its node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolveRequest {
    pub target: String,
    pub session_id: Uuid,
    /// Platforms assigned to this node. Empty means the engine default.
    pub platforms: Vec<Platform>,
    pub request: BuildRequest,
    /// Session handler descriptors in attachment order.
    #[serde(default)]
    pub session: Vec<serde_json::Value>,
}

/// What a node answers after solving.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SolveResponse {
    #[serde(default)]
    pub exporter_response: ExporterResponse,
    #[serde(default)]
    pub warnings: Vec<BuildWarning>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultHandle>,
}

/// RPC surface of one build engine.
///
/// Implementations must return promptly once the future is dropped; the
/// dispatcher drops in-flight calls when the shared scope is cancelled.
#[async_trait]
pub trait EngineClient: Send + Sync {
    async fn solve(
        &self,
        request: &SolveRequest,
        progress: ProgressWriter,
    ) -> EngineResult<SolveResponse>;

    async fn usage(&self, filter: &UsageFilter) -> EngineResult<Vec<UsageRecord>>;
}

/// Turns a node config entry into a connected client.
#[async_trait]
pub trait DriverFactory: Send + Sync {
    async fn connect(&self, node: &NodeConfig) -> Result<Arc<dyn EngineClient>, BoxError>;
}

/// Initialization outcome of a node, resolved once before any dispatch.
#[derive(Clone)]
pub enum NodeState {
    Ready(Arc<dyn EngineClient>),
    InitFailed(String),
}

impl fmt::Debug for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeState::Ready(_) => f.write_str("Ready"),
            NodeState::InitFailed(reason) => f.debug_tuple("InitFailed").field(reason).finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    /// Declared platforms. Empty means the node accepts any platform.
    pub platforms: Vec<Platform>,
    pub state: NodeState,
}

impl Node {
    pub fn ready(name: impl Into<String>, client: Arc<dyn EngineClient>) -> Self {
        Self {
            name: name.into(),
            platforms: Vec::new(),
            state: NodeState::Ready(client),
        }
    }

    pub fn failed(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            platforms: Vec::new(),
            state: NodeState::InitFailed(reason.into()),
        }
    }

    pub fn with_platforms(mut self, platforms: Vec<Platform>) -> Self {
        self.platforms = platforms;
        self
    }

    pub fn supports(&self, platform: &Platform) -> bool {
        self.platforms.is_empty() || self.platforms.contains(platform)
    }

    pub fn client(&self) -> Option<&Arc<dyn EngineClient>> {
        match &self.state {
            NodeState::Ready(c) => Some(c),
            NodeState::InitFailed(_) => None,
        }
    }

    pub fn init_error(&self) -> Option<&str> {
        match &self.state {
            NodeState::Ready(_) => None,
            NodeState::InitFailed(reason) => Some(reason),
        }
    }
}

/// Ordered nodes of one builder. A node's index is its position here.
#[derive(Debug, Clone)]
pub struct NodeSet {
    pub name: String,
    pub nodes: Vec<Node>,
}

impl NodeSet {
    pub fn new(name: impl Into<String>, nodes: Vec<Node>) -> Self {
        Self {
            name: name.into(),
            nodes,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// First node that failed to initialize.
    pub fn first_failure(&self) -> Option<(&Node, &str)> {
        self.nodes
            .iter()
            .find_map(|n| n.init_error().map(|reason| (n, reason)))
    }

    /// Connect to every node of `builder` concurrently.
    ///
    /// Connection failures do not fail the load; they become
    /// [`NodeState::InitFailed`] and keep their index.
    pub async fn load(builder: &BuilderConfig, factory: &dyn DriverFactory) -> Self {
        let nodes = join_all(builder.nodes.iter().map(|cfg| load_node(cfg, factory))).await;
        let ready = nodes.iter().filter(|n| n.client().is_some()).count();
        info!(builder = %builder.name, nodes = nodes.len(), ready, "node set loaded");
        Self::new(builder.name.clone(), nodes)
    }
}

async fn load_node(cfg: &NodeConfig, factory: &dyn DriverFactory) -> Node {
    let platforms = match crate::options::parse_platforms(&cfg.platforms) {
        Ok(p) => p,
        Err(reason) => {
            warn!(node = %cfg.name, %reason, "invalid platform in node config");
            return Node::failed(&cfg.name, format!("invalid platform: {reason}"));
        }
    };
    let state = match factory.connect(cfg).await {
        Ok(client) => NodeState::Ready(client),
        Err(e) => {
            warn!(node = %cfg.name, endpoint = %cfg.endpoint, error = %e, "node failed to initialize");
            NodeState::InitFailed(e.to_string())
        }
    };
    Node {
        name: cfg.name.clone(),
        platforms,
        state,
    }
}
