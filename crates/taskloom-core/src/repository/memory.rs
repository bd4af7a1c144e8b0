//! In-memory `WorkflowRepository`.
//!
//! Holds everything behind one async mutex, so each operation is atomic with
//! respect to the others. Cloning shares the underlying store.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use taskloom_types::error::RepositoryError;
use taskloom_types::execution::{Checkpoint, Execution, ExecutionStatus, TaskResult};
use taskloom_types::workflow::{VersionSnapshot, WorkflowDefinition};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::workflow::{WorkflowRepository, collapse_results};

#[derive(Debug, Default)]
struct Store {
    versions: HashMap<Uuid, Vec<VersionSnapshot>>,
    executions: HashMap<Uuid, Execution>,
    task_log: HashMap<Uuid, Vec<TaskResult>>,
    checkpoints: HashMap<Uuid, BTreeMap<u64, Checkpoint>>,
}

/// Process-local repository; contents are lost on exit.
#[derive(Debug, Clone, Default)]
pub struct InMemoryWorkflowRepository {
    store: Arc<Mutex<Store>>,
}

impl InMemoryWorkflowRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

fn with_results(mut execution: Execution, log: Option<&Vec<TaskResult>>) -> Execution {
    execution.results = collapse_results(log.cloned().unwrap_or_default());
    execution
}

impl WorkflowRepository for InMemoryWorkflowRepository {
    async fn append_version(
        &self,
        workflow_id: &Uuid,
        definition: &WorkflowDefinition,
        created_by: &str,
        change_note: Option<&str>,
        body_hash: &str,
    ) -> Result<VersionSnapshot, RepositoryError> {
        let mut store = self.store.lock().await;
        let versions = store.versions.entry(*workflow_id).or_default();
        let version = versions.last().map(|v| v.version).unwrap_or(0) + 1;

        let mut definition = definition.clone();
        definition.id = *workflow_id;
        definition.version = version;

        let snapshot = VersionSnapshot {
            workflow_id: *workflow_id,
            version,
            definition,
            created_by: created_by.to_string(),
            created_at: Utc::now(),
            change_note: change_note.map(str::to_string),
            body_hash: body_hash.to_string(),
        };
        versions.push(snapshot.clone());
        Ok(snapshot)
    }

    async fn get_version(
        &self,
        workflow_id: &Uuid,
        version: u32,
    ) -> Result<Option<VersionSnapshot>, RepositoryError> {
        let store = self.store.lock().await;
        Ok(store
            .versions
            .get(workflow_id)
            .and_then(|vs| vs.iter().find(|v| v.version == version).cloned()))
    }

    async fn latest_version(
        &self,
        workflow_id: &Uuid,
    ) -> Result<Option<VersionSnapshot>, RepositoryError> {
        let store = self.store.lock().await;
        Ok(store
            .versions
            .get(workflow_id)
            .and_then(|vs| vs.last().cloned()))
    }

    async fn list_versions(&self, workflow_id: &Uuid) -> Result<Vec<VersionSnapshot>, RepositoryError> {
        let store = self.store.lock().await;
        Ok(store.versions.get(workflow_id).cloned().unwrap_or_default())
    }

    async fn list_workflows(&self) -> Result<Vec<VersionSnapshot>, RepositoryError> {
        let store = self.store.lock().await;
        let mut latest: Vec<VersionSnapshot> = store
            .versions
            .values()
            .filter_map(|vs| vs.last().cloned())
            .collect();
        latest.sort_by(|a, b| {
            a.definition
                .name
                .cmp(&b.definition.name)
                .then(a.workflow_id.cmp(&b.workflow_id))
        });
        Ok(latest)
    }

    async fn create_execution(&self, execution: &Execution) -> Result<(), RepositoryError> {
        let mut store = self.store.lock().await;
        if store.executions.contains_key(&execution.id) {
            return Err(RepositoryError::Conflict(format!(
                "execution {} already exists",
                execution.id
            )));
        }
        let mut record = execution.clone();
        record.results.clear();
        store.executions.insert(execution.id, record);
        Ok(())
    }

    async fn update_execution_status(
        &self,
        execution_id: &Uuid,
        status: ExecutionStatus,
        error: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let mut store = self.store.lock().await;
        let execution = store
            .executions
            .get_mut(execution_id)
            .ok_or(RepositoryError::NotFound)?;
        execution.status = status;
        if let Some(e) = error {
            execution.error = Some(e.to_string());
        }
        if status.is_terminal() {
            execution.ended_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn get_execution(&self, execution_id: &Uuid) -> Result<Option<Execution>, RepositoryError> {
        let store = self.store.lock().await;
        Ok(store
            .executions
            .get(execution_id)
            .cloned()
            .map(|e| with_results(e, store.task_log.get(execution_id))))
    }

    async fn list_executions(
        &self,
        workflow_id: &Uuid,
        limit: u32,
    ) -> Result<Vec<Execution>, RepositoryError> {
        let store = self.store.lock().await;
        let mut runs: Vec<Execution> = store
            .executions
            .values()
            .filter(|e| e.workflow_id == *workflow_id)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        runs.truncate(limit as usize);
        Ok(runs
            .into_iter()
            .map(|e| {
                let log = store.task_log.get(&e.id);
                with_results(e, log)
            })
            .collect())
    }

    async fn list_unfinished_executions(&self) -> Result<Vec<Execution>, RepositoryError> {
        let store = self.store.lock().await;
        let mut runs: Vec<Execution> = store
            .executions
            .values()
            .filter(|e| !e.status.is_terminal())
            .cloned()
            .collect();
        runs.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));
        Ok(runs
            .into_iter()
            .map(|e| {
                let log = store.task_log.get(&e.id);
                with_results(e, log)
            })
            .collect())
    }

    async fn count_executions(&self) -> Result<Vec<(ExecutionStatus, usize)>, RepositoryError> {
        let store = self.store.lock().await;
        let mut counts: HashMap<ExecutionStatus, usize> = HashMap::new();
        for e in store.executions.values() {
            *counts.entry(e.status).or_default() += 1;
        }
        let mut out: Vec<(ExecutionStatus, usize)> = counts.into_iter().collect();
        out.sort_by_key(|(s, _)| s.as_str());
        Ok(out)
    }

    async fn append_task_result(
        &self,
        execution_id: &Uuid,
        result: &TaskResult,
    ) -> Result<(), RepositoryError> {
        let mut store = self.store.lock().await;
        if !store.executions.contains_key(execution_id) {
            return Err(RepositoryError::NotFound);
        }
        store
            .task_log
            .entry(*execution_id)
            .or_default()
            .push(result.clone());
        Ok(())
    }

    async fn list_task_results(&self, execution_id: &Uuid) -> Result<Vec<TaskResult>, RepositoryError> {
        let store = self.store.lock().await;
        Ok(store.task_log.get(execution_id).cloned().unwrap_or_default())
    }

    async fn append_checkpoint(
        &self,
        checkpoint: &Checkpoint,
        results: &[TaskResult],
    ) -> Result<(), RepositoryError> {
        let mut store = self.store.lock().await;
        if !store.executions.contains_key(&checkpoint.execution_id) {
            return Err(RepositoryError::NotFound);
        }
        let checkpoints = store.checkpoints.entry(checkpoint.execution_id).or_default();
        if checkpoints.contains_key(&checkpoint.index) {
            return Err(RepositoryError::Conflict(format!(
                "checkpoint {} already exists for execution {}",
                checkpoint.index, checkpoint.execution_id
            )));
        }
        checkpoints.insert(checkpoint.index, checkpoint.clone());
        store
            .task_log
            .entry(checkpoint.execution_id)
            .or_default()
            .extend(results.iter().cloned());
        Ok(())
    }

    async fn latest_checkpoint(&self, execution_id: &Uuid) -> Result<Option<Checkpoint>, RepositoryError> {
        let store = self.store.lock().await;
        Ok(store
            .checkpoints
            .get(execution_id)
            .and_then(|cps| cps.values().next_back().cloned()))
    }

    async fn list_checkpoints(&self, execution_id: &Uuid) -> Result<Vec<Checkpoint>, RepositoryError> {
        let store = self.store.lock().await;
        Ok(store
            .checkpoints
            .get(execution_id)
            .map(|cps| cps.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn prune_checkpoints(&self, execution_id: &Uuid, keep_from: u64) -> Result<u64, RepositoryError> {
        let mut store = self.store.lock().await;
        let Some(cps) = store.checkpoints.get_mut(execution_id) else {
            return Ok(0);
        };
        let before = cps.len();
        cps.retain(|idx, _| *idx >= keep_from);
        Ok((before - cps.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskloom_types::execution::{CheckpointKind, ContextSnapshot, TaskStatus};
    use taskloom_types::workflow::TaskDefinition;

    fn definition(name: &str) -> WorkflowDefinition {
        WorkflowDefinition {
            id: Uuid::nil(),
            owner: "ops".into(),
            name: name.into(),
            description: None,
            version: 0,
            tasks: [("a".to_string(), TaskDefinition::new("echo"))].into_iter().collect(),
            config: Default::default(),
        }
    }

    fn checkpoint(execution_id: Uuid, index: u64) -> Checkpoint {
        Checkpoint {
            execution_id,
            index,
            task_id: "a".into(),
            kind: CheckpointKind::Task,
            snapshot: ContextSnapshot::default(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_versions_are_sequential() {
        let repo = InMemoryWorkflowRepository::new();
        let wf = Uuid::now_v7();
        let v1 = repo.append_version(&wf, &definition("x"), "amy", None, "h").await.unwrap();
        let v2 = repo
            .append_version(&wf, &definition("x"), "amy", Some("again"), "h")
            .await
            .unwrap();
        assert_eq!((v1.version, v2.version), (1, 2));
        assert_eq!(v2.definition.version, 2);
        assert_eq!(v2.definition.id, wf);
        assert_eq!(repo.latest_version(&wf).await.unwrap().unwrap().version, 2);
        assert!(repo.get_version(&wf, 3).await.unwrap().is_none());
        assert_eq!(repo.list_versions(&wf).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_checkpoint_index_conflict() {
        let repo = InMemoryWorkflowRepository::new();
        let exec = Execution::new(Uuid::now_v7(), 1, Default::default());
        repo.create_execution(&exec).await.unwrap();

        repo.append_checkpoint(&checkpoint(exec.id, 0), &[]).await.unwrap();
        let err = repo.append_checkpoint(&checkpoint(exec.id, 0), &[]).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_prune_keeps_latest() {
        let repo = InMemoryWorkflowRepository::new();
        let exec = Execution::new(Uuid::now_v7(), 1, Default::default());
        repo.create_execution(&exec).await.unwrap();
        for i in 0..4 {
            repo.append_checkpoint(&checkpoint(exec.id, i), &[]).await.unwrap();
        }
        assert_eq!(repo.prune_checkpoints(&exec.id, 3).await.unwrap(), 3);
        let left = repo.list_checkpoints(&exec.id).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].index, 3);
    }

    #[tokio::test]
    async fn test_running_entry_is_superseded_by_checkpointed_result() {
        let repo = InMemoryWorkflowRepository::new();
        let exec = Execution::new(Uuid::now_v7(), 1, Default::default());
        repo.create_execution(&exec).await.unwrap();

        repo.append_task_result(&exec.id, &TaskResult::running("a", Utc::now()))
            .await
            .unwrap();
        let loaded = repo.get_execution(&exec.id).await.unwrap().unwrap();
        assert_eq!(loaded.result("a").unwrap().status, TaskStatus::Running);

        let done = TaskResult::succeeded("a", 1, serde_json::Value::Null, Utc::now());
        repo.append_checkpoint(&checkpoint(exec.id, 0), std::slice::from_ref(&done))
            .await
            .unwrap();
        let loaded = repo.get_execution(&exec.id).await.unwrap().unwrap();
        assert_eq!(loaded.results, vec![done]);

        let missing = repo
            .append_task_result(&Uuid::now_v7(), &TaskResult::pending("a"))
            .await
            .unwrap_err();
        assert!(matches!(missing, RepositoryError::NotFound));
    }

    #[tokio::test]
    async fn test_terminal_status_stamps_end() {
        let repo = InMemoryWorkflowRepository::new();
        let exec = Execution::new(Uuid::now_v7(), 1, Default::default());
        repo.create_execution(&exec).await.unwrap();
        repo.update_execution_status(&exec.id, ExecutionStatus::Running, None)
            .await
            .unwrap();
        assert_eq!(repo.list_unfinished_executions().await.unwrap().len(), 1);

        repo.update_execution_status(&exec.id, ExecutionStatus::Failed, Some("boom"))
            .await
            .unwrap();
        let loaded = repo.get_execution(&exec.id).await.unwrap().unwrap();
        assert!(loaded.ended_at.is_some());
        assert_eq!(loaded.error.as_deref(), Some("boom"));
        assert!(repo.list_unfinished_executions().await.unwrap().is_empty());
    }
}
