//! Builder configuration.
//!
//! A builders file names one or more builders, each an ordered list of nodes:
//!
//! ```json
//! {
//!   "default": "fleet",
//!   "builders": [
//!     { "name": "fleet", "nodes": [
//!       { "name": "amd", "endpoint": "http://10.0.0.5:8840", "platforms": ["linux/amd64"] }
//!     ] }
//!   ]
//! }
//! ```
//!
//! Node order is significant: it decides which node's result is canonical.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{BuildError, Result};

/// Default per-request timeout for a node when none is configured.
pub const DEFAULT_NODE_TIMEOUT_SECS: u64 = 600;

/// One build engine endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    pub endpoint: String,
    /// Platforms this node builds. Empty means any.
    #[serde(default)]
    pub platforms: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl NodeConfig {
    pub fn timeout_secs(&self) -> u64 {
        self.timeout_secs.unwrap_or(DEFAULT_NODE_TIMEOUT_SECS)
    }
}

/// A named, ordered group of nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuilderConfig {
    pub name: String,
    pub nodes: Vec<NodeConfig>,
}

/// Contents of a builders file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default)]
    pub builders: Vec<BuilderConfig>,
}

impl FleetConfig {
    pub fn from_json(raw: &str) -> Result<Self> {
        let cfg: FleetConfig = serde_json::from_str(raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            BuildError::config("config", format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json(&raw)
    }

    fn validate(&self) -> Result<()> {
        for (i, b) in self.builders.iter().enumerate() {
            if self.builders[..i].iter().any(|o| o.name == b.name) {
                return Err(BuildError::config(
                    "config",
                    format!("duplicate builder {:?}", b.name),
                ));
            }
            for (j, n) in b.nodes.iter().enumerate() {
                if b.nodes[..j].iter().any(|o| o.name == n.name) {
                    return Err(BuildError::config(
                        "config",
                        format!("duplicate node {:?} in builder {:?}", n.name, b.name),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Look up a builder by name, falling back to the configured default and
    /// then to the first builder in the file.
    pub fn builder(&self, name: Option<&str>) -> Result<&BuilderConfig> {
        let wanted = name.or(self.default.as_deref());
        let found = match wanted {
            Some(n) => self.builders.iter().find(|b| b.name == n),
            None => self.builders.first(),
        };
        found.ok_or_else(|| {
            BuildError::config(
                "builder",
                match wanted {
                    Some(n) => format!("no builder named {n:?}"),
                    None => "no builders configured".to_string(),
                },
            )
        })
    }
}
