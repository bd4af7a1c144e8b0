//! Application state wiring the engine to its concrete infrastructure.
//!
//! The engine is generic over its repository; `AppState` pins it to the
//! SQLite implementation and the built-in capability registry.

use anyhow::Context;
use taskloom_core::workflow::engine::WorkflowEngine;
use taskloom_infra::capability::builtin_registry;
use taskloom_infra::config::{database_url, load_engine_config, resolve_data_dir};
use taskloom_infra::sqlite::pool::DatabasePool;
use taskloom_infra::sqlite::workflow::SqliteWorkflowRepository;

pub type ConcreteEngine = WorkflowEngine<SqliteWorkflowRepository>;

/// Shared application state for CLI commands.
#[derive(Clone)]
pub struct AppState {
    pub engine: ConcreteEngine,
}

impl AppState {
    /// Resolve the data dir, load config, open the database and build the engine.
    ///
    /// Interrupted executions are not resumed here; `tloom resume` does that.
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir();
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("failed to create {}", data_dir.display()))?;

        let config = load_engine_config(&data_dir).await;
        let db_url = database_url(&config, &data_dir);
        let db_pool = DatabasePool::new(&db_url)
            .await
            .with_context(|| format!("failed to open database {db_url}"))?;

        let registry = builtin_registry().context("failed to build capability registry")?;
        let engine = WorkflowEngine::new(SqliteWorkflowRepository::new(db_pool), registry, &config);

        tracing::debug!(data_dir = %data_dir.display(), "application state ready");
        Ok(Self { engine })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskloom_core::workflow::definition::parse_definition;
    use taskloom_infra::config::DATA_DIR_ENV;
    use taskloom_types::execution::{ExecutionStatus, TaskStatus};

    #[tokio::test]
    async fn init_runs_a_workflow_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        // SAFETY: This is the only test in this crate touching the data dir variable.
        unsafe {
            std::env::set_var(DATA_DIR_ENV, dir.path());
        }
        let state = AppState::init().await.unwrap();
        unsafe {
            std::env::remove_var(DATA_DIR_ENV);
        }
        assert!(dir.path().join("taskloom.db").exists());

        let definition = parse_definition(
            r#"
name: greet
owner: cli-tests
config:
  fail_fast: false
tasks:
  hello:
    action: echo
    parameters:
      text: hi
  broken:
    action: echo
    parameters:
      fail: permanent
  after:
    action: echo
    depends_on: [hello]
"#,
        )
        .unwrap();
        let snapshot = state.engine.submit(&definition, "tests", None).await.unwrap();

        let id = state
            .engine
            .execute(snapshot.workflow_id, None, Default::default())
            .await
            .unwrap();
        let execution = state.engine.wait(id).await.unwrap();

        assert_eq!(execution.status, ExecutionStatus::Completed);
        let status_of = |task: &str| execution.result(task).map(|r| r.status);
        assert_eq!(status_of("hello"), Some(TaskStatus::Succeeded));
        assert_eq!(status_of("after"), Some(TaskStatus::Succeeded));
        assert_eq!(status_of("broken"), Some(TaskStatus::Failed));
        assert_eq!(
            execution.result("hello").unwrap().output,
            Some(serde_json::json!({"text": "hi"}))
        );
    }
}
