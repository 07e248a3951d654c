//! Local session handlers: registry auth from the docker config, secrets
//! from files or the environment, SSH forwarding from the running agent.
//!
//! Only descriptors are sent to engines. Secret values stay on this host.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use buildfleet_core::options::{SecretSource, SecretSpec, SshSpec};
use buildfleet_core::{Attachable, BoxError, SessionCollaborator};
use serde_json::{json, Value};

#[derive(Debug)]
struct Handler {
    kind: &'static str,
    descriptor: Value,
}

impl Attachable for Handler {
    fn kind(&self) -> &str {
        self.kind
    }

    fn descriptor(&self) -> Value {
        self.descriptor.clone()
    }
}

/// Handlers backed by this machine.
#[derive(Debug, Clone, Default)]
pub struct LocalSession {
    /// Directory holding `config.json` with registry credentials.
    pub docker_config: Option<PathBuf>,
    /// Socket of the running SSH agent.
    pub ssh_auth_sock: Option<String>,
}

impl LocalSession {
    pub fn from_env() -> Self {
        let docker_config = std::env::var_os("DOCKER_CONFIG")
            .map(PathBuf::from)
            .or_else(|| dirs::home_dir().map(|h| h.join(".docker")));
        Self {
            docker_config,
            ssh_auth_sock: std::env::var("SSH_AUTH_SOCK").ok().filter(|s| !s.is_empty()),
        }
    }
}

#[async_trait]
impl SessionCollaborator for LocalSession {
    async fn auth(&self) -> Result<Arc<dyn Attachable>, BoxError> {
        let config = match &self.docker_config {
            Some(dir) => {
                let file = dir.join("config.json");
                tokio::fs::try_exists(&file)
                    .await?
                    .then(|| file.display().to_string())
            }
            None => None,
        };
        Ok(Arc::new(Handler {
            kind: "auth",
            descriptor: json!({ "type": "auth", "config": config }),
        }))
    }

    async fn secrets(&self, specs: &[SecretSpec]) -> Result<Arc<dyn Attachable>, BoxError> {
        let mut ids = Vec::with_capacity(specs.len());
        for spec in specs {
            match &spec.source {
                SecretSource::File { path } => {
                    if !tokio::fs::try_exists(path).await? {
                        return Err(format!("secret {}: {path}: no such file", spec.id).into());
                    }
                }
                SecretSource::Env { var } => {
                    if std::env::var_os(var).is_none() {
                        return Err(
                            format!("secret {}: environment variable {var} is not set", spec.id)
                                .into(),
                        );
                    }
                }
            }
            ids.push(spec.id.clone());
        }
        Ok(Arc::new(Handler {
            kind: "secrets",
            descriptor: json!({ "type": "secrets", "ids": ids }),
        }))
    }

    async fn ssh(&self, specs: &[SshSpec]) -> Result<Arc<dyn Attachable>, BoxError> {
        let mut agents = Vec::with_capacity(specs.len());
        for spec in specs {
            let paths = if spec.paths.is_empty() {
                match &self.ssh_auth_sock {
                    Some(sock) => vec![sock.clone()],
                    None => {
                        return Err(format!(
                            "ssh {}: invalid empty SSH agent socket, make sure SSH_AUTH_SOCK is set",
                            spec.id
                        )
                        .into())
                    }
                }
            } else {
                spec.paths.clone()
            };
            agents.push(json!({ "id": spec.id, "paths": paths }));
        }
        Ok(Arc::new(Handler {
            kind: "ssh",
            descriptor: json!({ "type": "ssh", "agents": agents }),
        }))
    }
}
