//! Session provisioning: the auxiliary handlers attached to a build request.
//!
//! Handlers themselves (registry auth, secret stores, SSH agents) come from a
//! [`SessionCollaborator`]. The orchestrator only carries them as opaque
//! [`Attachable`]s and forwards their descriptors to the engine.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use crate::error::{BoxError, BuildError, Result};
use crate::options::{BuildRequest, SecretSpec, SshSpec};

/// An opaque session handler.
pub trait Attachable: fmt::Debug + Send + Sync {
    /// Short handler kind (`auth`, `secrets`, `ssh`).
    fn kind(&self) -> &str;

    /// What the engine needs to know to talk back to this handler.
    fn descriptor(&self) -> serde_json::Value;
}

/// The set of handlers attached to one build invocation.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub attachments: Vec<Arc<dyn Attachable>>,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4(),
            attachments: Vec::new(),
        }
    }
}

impl Session {
    pub fn attach(&mut self, handler: Arc<dyn Attachable>) {
        self.attachments.push(handler);
    }

    /// Descriptors in attachment order.
    pub fn descriptors(&self) -> Vec<serde_json::Value> {
        self.attachments.iter().map(|a| a.descriptor()).collect()
    }
}

/// Supplies credential material for a session.
#[async_trait]
pub trait SessionCollaborator: Send + Sync {
    async fn auth(&self) -> std::result::Result<Arc<dyn Attachable>, BoxError>;

    async fn secrets(
        &self,
        specs: &[SecretSpec],
    ) -> std::result::Result<Arc<dyn Attachable>, BoxError>;

    async fn ssh(&self, specs: &[SshSpec]) -> std::result::Result<Arc<dyn Attachable>, BoxError>;
}

/// Attach auth, then secrets, then SSH forwarding to `request.session`.
///
/// Secret and SSH handlers are only requested when the request names at
/// least one spec of that family.
pub async fn provision_session(
    request: &mut BuildRequest,
    collaborator: &dyn SessionCollaborator,
) -> Result<()> {
    let auth = collaborator
        .auth()
        .await
        .map_err(|source| BuildError::Callback {
            what: "auth provider",
            source,
        })?;
    request.session.attach(auth);

    if !request.secrets.is_empty() {
        let secrets = collaborator
            .secrets(&request.secrets)
            .await
            .map_err(|source| BuildError::Callback {
                what: "secret provider",
                source,
            })?;
        request.session.attach(secrets);
    }

    if !request.ssh.is_empty() {
        let ssh = collaborator
            .ssh(&request.ssh)
            .await
            .map_err(|source| BuildError::Callback {
                what: "ssh agent provider",
                source,
            })?;
        request.session.attach(ssh);
    }

    debug!(
        session = %request.session.id,
        attachments = request.session.attachments.len(),
        "session provisioned"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{FakeAttachable, FakeSessionCollaborator};
    use crate::options::{SecretSource, SecretSpec};

    #[tokio::test]
    async fn test_provision_attaches_in_order() {
        let mut req = BuildRequest {
            secrets: vec![SecretSpec {
                id: "token".to_string(),
                source: SecretSource::Env {
                    var: "TOKEN".to_string(),
                },
            }],
            ssh: vec![SshSpec::default_agent()],
            ..Default::default()
        };
        provision_session(&mut req, &FakeSessionCollaborator::default())
            .await
            .unwrap();
        let kinds: Vec<&str> = req.session.attachments.iter().map(|a| a.kind()).collect();
        assert_eq!(kinds, vec!["auth", "secrets", "ssh"]);
        assert_eq!(req.session.descriptors()[1]["ids"][0], "token");
    }

    #[tokio::test]
    async fn test_provision_skips_empty_families() {
        let mut req = BuildRequest::default();
        provision_session(&mut req, &FakeSessionCollaborator::default())
            .await
            .unwrap();
        assert_eq!(req.session.attachments.len(), 1);
        assert_eq!(req.session.attachments[0].kind(), "auth");
    }

    #[tokio::test]
    async fn test_provider_failure_is_callback_error() {
        let collab = FakeSessionCollaborator {
            fail_auth: true,
            ..Default::default()
        };
        let err = provision_session(&mut BuildRequest::default(), &collab)
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::Callback { what: "auth provider", .. }));
    }

    #[test]
    fn test_descriptors_follow_attachment_order() {
        let mut session = Session::default();
        session.attach(Arc::new(FakeAttachable::new("auth", serde_json::json!({"n": 1}))));
        session.attach(Arc::new(FakeAttachable::new("ssh", serde_json::json!({"n": 2}))));
        let d = session.descriptors();
        assert_eq!(d[0]["n"], 1);
        assert_eq!(d[1]["n"], 2);
    }
}
