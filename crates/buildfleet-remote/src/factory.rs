use std::sync::Arc;

use async_trait::async_trait;
use buildfleet_core::{BoxError, DriverFactory, EngineClient, NodeConfig};
use tracing::info;

use crate::client::HttpEngineClient;

/// Connects nodes over HTTP. A node counts as ready once `GET /v1/info` answers.
#[derive(Debug, Default, Clone)]
pub struct HttpDriverFactory;

impl HttpDriverFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DriverFactory for HttpDriverFactory {
    async fn connect(&self, node: &NodeConfig) -> Result<Arc<dyn EngineClient>, BoxError> {
        let client = HttpEngineClient::new(node)?;
        let info = client.info().await?;
        info!(node = %node.name, version = %info.version, "engine reachable");
        Ok(Arc::new(client))
    }
}
