//! Immutable, append-only version history for workflow definitions.
//!
//! Every `snapshot` and every `rollback` appends a new version; nothing is
//! ever rewritten or deleted. Version numbers are allocated by the repository
//! inside the inserting write, so concurrent submitters never collide.

use sha2::{Digest, Sha256};
use taskloom_types::workflow::{VersionSnapshot, WorkflowDefinition};
use thiserror::Error;
use uuid::Uuid;

use super::definition::{DefinitionError, validate_definition};
use crate::repository::workflow::WorkflowRepository;

#[derive(Debug, Error)]
pub enum VersionError {
    #[error(transparent)]
    Invalid(#[from] DefinitionError),

    #[error("workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    #[error("version {version} of workflow {workflow_id} not found")]
    VersionNotFound { workflow_id: Uuid, version: u32 },

    #[error("version repository error: {0}")]
    Repository(String),
}

/// Hex SHA-256 of a definition body in canonical JSON form.
///
/// The version number is excluded so identical bodies hash identically.
pub fn body_hash(definition: &WorkflowDefinition) -> String {
    let canonical = serde_json::to_vec(&definition.body()).unwrap_or_default();
    format!("{:x}", Sha256::digest(&canonical))
}

pub struct VersionManager<R: WorkflowRepository> {
    repo: R,
}

impl<R: WorkflowRepository> VersionManager<R> {
    pub fn new(repo: R) -> Self {
        Self { repo }
    }

    /// Validate `definition` and store it as the next version of `workflow_id`.
    ///
    /// Validation runs before anything is written; an invalid definition
    /// leaves history untouched.
    pub async fn snapshot(
        &self,
        workflow_id: Uuid,
        definition: &WorkflowDefinition,
        author: &str,
        note: Option<&str>,
    ) -> Result<VersionSnapshot, VersionError> {
        validate_definition(definition)?;

        let mut body = definition.body();
        body.id = workflow_id;
        let hash = body_hash(&body);

        let snapshot = self
            .repo
            .append_version(&workflow_id, &body, author, note, &hash)
            .await
            .map_err(|e| VersionError::Repository(e.to_string()))?;

        tracing::info!(
            workflow_id = %workflow_id,
            version = snapshot.version,
            author,
            "workflow version created"
        );
        Ok(snapshot)
    }

    /// Append a new version whose body copies `target_version`.
    ///
    /// The version counter only moves forward; history is never rewritten.
    pub async fn rollback(
        &self,
        workflow_id: Uuid,
        target_version: u32,
        author: &str,
    ) -> Result<VersionSnapshot, VersionError> {
        let target = self
            .repo
            .get_version(&workflow_id, target_version)
            .await
            .map_err(|e| VersionError::Repository(e.to_string()))?
            .ok_or(VersionError::VersionNotFound {
                workflow_id,
                version: target_version,
            })?;

        let note = format!("rollback to v{target_version}");
        let body = target.definition.body();
        let snapshot = self
            .repo
            .append_version(&workflow_id, &body, author, Some(&note), &target.body_hash)
            .await
            .map_err(|e| VersionError::Repository(e.to_string()))?;

        tracing::info!(
            workflow_id = %workflow_id,
            from = target_version,
            version = snapshot.version,
            "workflow rolled back"
        );
        Ok(snapshot)
    }

    /// All versions in ascending order.
    pub async fn history(&self, workflow_id: Uuid) -> Result<Vec<VersionSnapshot>, VersionError> {
        let versions = self
            .repo
            .list_versions(&workflow_id)
            .await
            .map_err(|e| VersionError::Repository(e.to_string()))?;
        if versions.is_empty() {
            return Err(VersionError::WorkflowNotFound(workflow_id));
        }
        Ok(versions)
    }

    /// A specific version, or the latest when `version` is `None`.
    pub async fn get(
        &self,
        workflow_id: Uuid,
        version: Option<u32>,
    ) -> Result<VersionSnapshot, VersionError> {
        let found = match version {
            Some(v) => self.repo.get_version(&workflow_id, v).await,
            None => self.repo.latest_version(&workflow_id).await,
        }
        .map_err(|e| VersionError::Repository(e.to_string()))?;

        found.ok_or(match version {
            Some(v) => VersionError::VersionNotFound {
                workflow_id,
                version: v,
            },
            None => VersionError::WorkflowNotFound(workflow_id),
        })
    }

    /// Latest version of every workflow.
    pub async fn list(&self) -> Result<Vec<VersionSnapshot>, VersionError> {
        self.repo
            .list_workflows()
            .await
            .map_err(|e| VersionError::Repository(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryWorkflowRepository;
    use crate::test_support::stub_workflow;
    use taskloom_types::error::GraphError;

    fn manager() -> VersionManager<InMemoryWorkflowRepository> {
        VersionManager::new(InMemoryWorkflowRepository::new())
    }

    #[tokio::test]
    async fn test_snapshot_increments_versions() {
        let mgr = manager();
        let id = Uuid::now_v7();
        let def = stub_workflow("etl", &[("a", &[]), ("b", &["a"])]);

        let v1 = mgr.snapshot(id, &def, "ana", None).await.unwrap();
        let v2 = mgr.snapshot(id, &def, "ana", Some("again")).await.unwrap();
        assert_eq!(v1.version, 1);
        assert_eq!(v2.version, 2);
        assert_eq!(v2.change_note.as_deref(), Some("again"));
        assert!(v1.definition.same_body(&v2.definition));
        assert_eq!(v1.body_hash, v2.body_hash);
        assert_eq!(v2.definition.id, id);
    }

    #[tokio::test]
    async fn test_invalid_definition_writes_nothing() {
        let mgr = manager();
        let id = Uuid::now_v7();
        let def = stub_workflow("loop", &[("a", &["b"]), ("b", &["a"])]);

        let err = mgr.snapshot(id, &def, "ana", None).await.unwrap_err();
        assert!(matches!(
            err,
            VersionError::Invalid(DefinitionError::Graph(GraphError::CycleDetected(_)))
        ));
        assert!(matches!(
            mgr.history(id).await.unwrap_err(),
            VersionError::WorkflowNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_rollback_appends_copy_of_target() {
        let mgr = manager();
        let id = Uuid::now_v7();
        let v1_def = stub_workflow("etl", &[("a", &[])]);
        mgr.snapshot(id, &v1_def, "ana", None).await.unwrap();
        mgr.snapshot(id, &stub_workflow("etl", &[("a", &[]), ("b", &[])]), "ana", None)
            .await
            .unwrap();
        mgr.snapshot(id, &stub_workflow("etl", &[("c", &[])]), "ana", None)
            .await
            .unwrap();

        let v4 = mgr.rollback(id, 1, "bo").await.unwrap();
        assert_eq!(v4.version, 4);
        assert_eq!(v4.change_note.as_deref(), Some("rollback to v1"));

        let history = mgr.history(id).await.unwrap();
        let versions: Vec<u32> = history.iter().map(|s| s.version).collect();
        assert_eq!(versions, vec![1, 2, 3, 4]);
        assert!(history[3].definition.same_body(&history[0].definition));
        assert_eq!(history[3].body_hash, history[0].body_hash);
    }

    #[tokio::test]
    async fn test_rollback_to_missing_version() {
        let mgr = manager();
        let id = Uuid::now_v7();
        mgr.snapshot(id, &stub_workflow("etl", &[("a", &[])]), "ana", None)
            .await
            .unwrap();

        let err = mgr.rollback(id, 7, "ana").await.unwrap_err();
        assert!(matches!(err, VersionError::VersionNotFound { version: 7, .. }));
        assert_eq!(mgr.history(id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_get_latest_and_specific() {
        let mgr = manager();
        let id = Uuid::now_v7();
        mgr.snapshot(id, &stub_workflow("etl", &[("a", &[])]), "ana", None)
            .await
            .unwrap();
        mgr.snapshot(id, &stub_workflow("etl", &[("b", &[])]), "ana", None)
            .await
            .unwrap();

        assert_eq!(mgr.get(id, None).await.unwrap().version, 2);
        assert!(mgr.get(id, Some(1)).await.unwrap().definition.tasks.contains_key("a"));
        assert!(mgr.get(Uuid::now_v7(), None).await.is_err());
    }

    #[test]
    fn test_body_hash_ignores_version() {
        let mut def = stub_workflow("etl", &[("a", &[])]);
        let before = body_hash(&def);
        def.version = 9;
        assert_eq!(body_hash(&def), before);
        def.name = "other".into();
        assert_ne!(body_hash(&def), before);
    }
}
