//! Execution commands: run, status, executions, cancel, checkpoints, resume, stats.

use std::time::Duration;

use anyhow::{Result, bail};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::{Map, Value, json};
use uuid::Uuid;

use taskloom_core::event::bus::next_for_execution;
use taskloom_types::event::EngineEvent;
use taskloom_types::execution::{Execution, ExecutionStatus, TaskResult, TaskStatus};

use super::{
    Output, execution_status_cell, new_table, print_json, styled_status, task_status_cell,
    truncate,
};
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

pub async fn run(
    state: &AppState,
    workflow_id: Uuid,
    version: Option<u32>,
    vars: Vec<(String, Value)>,
    detach: bool,
    out: Output,
) -> Result<()> {
    let variables: Map<String, Value> = vars.into_iter().collect();
    let mut events = state.engine.event_bus().subscribe();
    let execution_id = state.engine.execute(workflow_id, version, variables).await?;

    if detach {
        if out.json {
            return print_json(&json!({ "execution_id": execution_id, "detached": true }));
        }
        println!("{execution_id}");
        return Ok(());
    }

    let execution = follow(state, execution_id, &mut events, out).await?;
    report(&execution, out)?;
    finish_status(&execution)
}

/// Wait for an execution, updating a spinner from its events.
///
/// The first Ctrl-C requests cancellation; the wait continues until the
/// execution drains.
async fn follow(
    state: &AppState,
    execution_id: Uuid,
    events: &mut tokio::sync::broadcast::Receiver<EngineEvent>,
    out: Output,
) -> Result<Execution> {
    let spinner = out.human().then(|| {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        spinner.set_message(format!("Running {execution_id}..."));
        spinner.enable_steady_tick(Duration::from_millis(80));
        spinner
    });

    let wait = state.engine.wait(execution_id);
    tokio::pin!(wait);
    let mut cancelling = false;
    let mut events_open = true;

    let execution = loop {
        tokio::select! {
            result = &mut wait => break result?,
            signal = tokio::signal::ctrl_c(), if !cancelling => {
                signal?;
                cancelling = true;
                state.engine.cancel(execution_id).await?;
                if let Some(spinner) = &spinner {
                    spinner.set_message("Cancelling, waiting for in-flight tasks...");
                }
            }
            event = next_for_execution(events, execution_id), if events_open => {
                match (event, &spinner) {
                    (Some(event), Some(spinner)) => {
                        if let Some(line) = describe_event(&event) {
                            spinner.println(line);
                        }
                    }
                    (None, _) => events_open = false,
                    _ => {}
                }
            }
        }
    };

    if let Some(spinner) = spinner {
        spinner.finish_and_clear();
    }
    Ok(execution)
}

/// One-line rendering of an event for the live view.
pub fn describe_event(event: &EngineEvent) -> Option<String> {
    let line = match event {
        EngineEvent::TaskStarted {
            task_id, attempt, ..
        } if *attempt > 1 => format!("  ↻ {task_id} attempt {attempt}"),
        EngineEvent::TaskSucceeded {
            task_id,
            duration_ms,
            ..
        } => format!("  {} {task_id} ({duration_ms} ms)", style("✓").green()),
        EngineEvent::TaskFailed {
            task_id,
            error,
            will_retry: false,
            ..
        } => format!("  {} {task_id}: {error}", style("✗").red()),
        EngineEvent::RetryScheduled {
            task_id, delay_ms, ..
        } => format!("  {} {task_id} retry in {delay_ms} ms", style("…").dim()),
        EngineEvent::TaskSkipped {
            task_id, reason, ..
        } => format!("  {} {task_id} skipped: {reason}", style("-").yellow()),
        EngineEvent::CircuitTransition { action, to, .. } => {
            format!("  {} circuit for '{action}' is {to}", style("!").yellow())
        }
        _ => return None,
    };
    Some(line)
}

fn finish_status(execution: &Execution) -> Result<()> {
    match execution.status {
        ExecutionStatus::Completed => Ok(()),
        status => bail!("execution {} finished {}", execution.id, status),
    }
}

// ---------------------------------------------------------------------------
// Status / executions
// ---------------------------------------------------------------------------

pub async fn status(state: &AppState, execution_id: Uuid, out: Output) -> Result<()> {
    let execution = state.engine.status(execution_id).await?;
    report(&execution, out)?;
    if out.human() {
        let progress = state.engine.progress(execution_id).await?;
        println!(
            "  {} {}/{} done ({:.0}%), {} running, {} pending",
            style("Progress:").bold(),
            progress.total - progress.pending - progress.running,
            progress.total,
            progress.percent(),
            progress.running,
            progress.pending
        );
        println!();
    }
    Ok(())
}

fn report(execution: &Execution, out: Output) -> Result<()> {
    if out.json {
        return print_json(execution);
    }
    if out.quiet {
        println!("{}", execution.status);
        return Ok(());
    }

    println!();
    println!(
        "  {} {}  {}",
        style("Execution").bold(),
        execution.id,
        styled_status(execution.status)
    );
    println!(
        "  {}  {} v{}",
        style("Workflow:").bold(),
        execution.workflow_id,
        execution.version
    );
    if let Some(error) = &execution.error {
        println!("  {}     {}", style("Error:").bold(), style(error).red());
    }
    println!();

    if !execution.results.is_empty() {
        let mut table = new_table(&["Task", "Status", "Attempts", "Detail"]);
        for result in &execution.results {
            table.add_row(vec![
                comfy_table::Cell::new(&result.task_id),
                task_status_cell(result.status),
                comfy_table::Cell::new(result.attempt_count),
                comfy_table::Cell::new(result_detail(result)),
            ]);
        }
        println!("{table}");
    }
    Ok(())
}

fn result_detail(result: &TaskResult) -> String {
    if let Some(fallback) = &result.recovered_by {
        return format!("recovered by '{fallback}'");
    }
    match result.status {
        TaskStatus::Failed => truncate(result.error.as_deref().unwrap_or_default(), 60),
        TaskStatus::Skipped => format!(
            "skipped: {}",
            truncate(result.skip_reason.as_deref().unwrap_or("not needed"), 50)
        ),
        TaskStatus::Succeeded => result
            .output
            .as_ref()
            .map(|o| truncate(&o.to_string(), 60))
            .unwrap_or_default(),
        TaskStatus::Running => result
            .started_at
            .map(|t| format!("since {}", t.format("%H:%M:%S")))
            .unwrap_or_default(),
        TaskStatus::Pending => String::new(),
    }
}

pub async fn executions(state: &AppState, workflow_id: Uuid, limit: u32, out: Output) -> Result<()> {
    let executions = state.engine.list_executions(workflow_id, limit).await?;

    if out.json {
        return print_json(&executions);
    }
    if executions.is_empty() {
        if out.human() {
            println!("  No executions for workflow {workflow_id}.");
        }
        return Ok(());
    }

    let mut table = new_table(&["Execution", "Version", "Status", "Started", "Duration"]);
    for execution in &executions {
        let duration = execution
            .ended_at
            .map(|end| format!("{:.1}s", (end - execution.started_at).num_milliseconds() as f64 / 1000.0))
            .unwrap_or_else(|| "-".to_string());
        table.add_row(vec![
            comfy_table::Cell::new(execution.id),
            comfy_table::Cell::new(format!("v{}", execution.version)),
            execution_status_cell(execution.status),
            comfy_table::Cell::new(execution.started_at.format("%Y-%m-%d %H:%M:%S")),
            comfy_table::Cell::new(duration),
        ]);
    }
    println!("{table}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Cancel / checkpoints / resume / stats
// ---------------------------------------------------------------------------

pub async fn cancel(state: &AppState, execution_id: Uuid, out: Output) -> Result<()> {
    state.engine.cancel(execution_id).await?;
    let execution = state.engine.status(execution_id).await?;

    if out.json {
        return print_json(&json!({
            "execution_id": execution_id,
            "status": execution.status,
        }));
    }
    if out.human() {
        println!(
            "  {} Execution {} is {}",
            style("✓").green().bold(),
            execution_id,
            styled_status(execution.status)
        );
    }
    Ok(())
}

pub async fn checkpoints(state: &AppState, execution_id: Uuid, out: Output) -> Result<()> {
    let checkpoints = state.engine.checkpoints(execution_id).await?;

    if out.json {
        return print_json(&checkpoints);
    }

    let mut table = new_table(&["#", "Kind", "Task", "Completed", "Created"]);
    for checkpoint in &checkpoints {
        table.add_row(vec![
            checkpoint.index.to_string(),
            checkpoint.kind.to_string(),
            checkpoint.task_id.clone(),
            checkpoint.snapshot.completed_task_ids().len().to_string(),
            checkpoint.created_at.format("%H:%M:%S%.3f").to_string(),
        ]);
    }
    println!("{table}");
    Ok(())
}

pub async fn resume(state: &AppState, execution_id: Option<Uuid>, out: Output) -> Result<()> {
    let ids = match execution_id {
        Some(id) => vec![state.engine.resume(id).await?],
        None => state.engine.recover_interrupted().await?,
    };

    if ids.is_empty() {
        if out.json {
            return print_json(&Vec::<Value>::new());
        }
        if out.human() {
            println!("  Nothing to resume.");
        }
        return Ok(());
    }

    let mut finished = Vec::with_capacity(ids.len());
    for id in ids {
        if out.human() {
            println!("  {} resuming {}", style("↻").cyan(), id);
        }
        finished.push(state.engine.wait(id).await?);
    }

    if out.json {
        let rows: Vec<_> = finished
            .iter()
            .map(|e| json!({ "execution_id": e.id, "status": e.status, "error": e.error }))
            .collect();
        return print_json(&rows);
    }
    for execution in &finished {
        report(execution, out)?;
    }
    Ok(())
}

pub async fn stats(state: &AppState, out: Output) -> Result<()> {
    let stats = state.engine.stats().await?;

    if out.json {
        return print_json(&json!({
            "workflows": stats.workflows,
            "executions": stats.total(),
            "pending": stats.pending,
            "running": stats.running,
            "completed": stats.completed,
            "failed": stats.failed,
            "cancelled": stats.cancelled,
        }));
    }

    let mut table = new_table(&["Metric", "Count"]);
    for (label, value) in [
        ("Workflows", stats.workflows),
        ("Executions", stats.total()),
        ("Pending", stats.pending),
        ("Running", stats.running),
        ("Completed", stats.completed),
        ("Failed", stats.failed),
        ("Cancelled", stats.cancelled),
    ] {
        table.add_row(vec![label.to_string(), value.to_string()]);
    }
    println!("{table}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_detail_separates_errors_from_skip_reasons() {
        let failed = TaskResult::failed("a", 2, "connection reset", Default::default());
        assert_eq!(result_detail(&failed), "connection reset");

        let skipped = TaskResult::skipped("b", "dependency 'a' failed");
        assert_eq!(result_detail(&skipped), "skipped: dependency 'a' failed");

        let mut recovered = failed.clone();
        recovered.recovered_by = Some("page".into());
        assert_eq!(result_detail(&recovered), "recovered by 'page'");

        assert_eq!(result_detail(&TaskResult::pending("c")), "");
    }

    #[test]
    fn describe_event_ignores_first_attempt_and_checkpoints() {
        let id = Uuid::now_v7();
        assert!(describe_event(&EngineEvent::TaskStarted {
            execution_id: id,
            task_id: "a".into(),
            action: "echo".into(),
            attempt: 1,
        })
        .is_none());
        assert!(describe_event(&EngineEvent::CheckpointWritten {
            execution_id: id,
            index: 0,
            task_id: "a".into(),
        })
        .is_none());
    }

    #[test]
    fn describe_event_reports_retries_and_skips() {
        let id = Uuid::now_v7();
        let retry = describe_event(&EngineEvent::RetryScheduled {
            execution_id: id,
            task_id: "fetch".into(),
            attempt: 2,
            delay_ms: 2000,
        })
        .unwrap();
        assert!(retry.contains("fetch retry in 2000 ms"));

        let skipped = describe_event(&EngineEvent::TaskSkipped {
            execution_id: id,
            task_id: "load".into(),
            reason: "predecessor 'fetch' failed".into(),
        })
        .unwrap();
        assert!(skipped.contains("load skipped"));
    }
}
