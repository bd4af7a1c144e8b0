//! Workflow definition commands: submit, list, history, show, rollback, template.

use std::path::Path;

use anyhow::{Context, Result, anyhow};
use console::style;
use serde_json::json;
use uuid::Uuid;

use taskloom_core::workflow::definition::{parse_definition, serialize_definition};
use taskloom_core::workflow::template::{TEMPLATES, find_template};
use taskloom_types::workflow::VersionSnapshot;

use super::{Output, new_table, print_json, truncate};
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Submit
// ---------------------------------------------------------------------------

pub async fn submit(
    state: &AppState,
    file: &Path,
    workflow_id: Option<Uuid>,
    author: &str,
    note: Option<&str>,
    out: Output,
) -> Result<()> {
    let source = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))?;
    let mut definition = parse_definition(&source)
        .with_context(|| format!("failed to parse {}", file.display()))?;
    if let Some(id) = workflow_id {
        definition.id = id;
    }

    let snapshot = state
        .engine
        .submit(&definition, author, note)
        .await
        .context("workflow rejected")?;

    if out.json {
        return print_json(&json!({
            "workflow_id": snapshot.workflow_id,
            "version": snapshot.version,
            "name": snapshot.definition.name,
            "tasks": snapshot.definition.tasks.len(),
            "body_hash": snapshot.body_hash,
        }));
    }
    if out.quiet {
        println!("{}", snapshot.workflow_id);
        return Ok(());
    }

    println!();
    println!(
        "  {} Stored '{}' as version {}",
        style("✓").green().bold(),
        style(&snapshot.definition.name).cyan(),
        snapshot.version
    );
    println!("  {}  {}", style("Workflow:").bold(), snapshot.workflow_id);
    println!("  {}     {}", style("Tasks:").bold(), snapshot.definition.tasks.len());
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

pub async fn list(state: &AppState, out: Output) -> Result<()> {
    let workflows = state.engine.list_workflows().await?;

    if out.json {
        let rows: Vec<_> = workflows.iter().map(summary_json).collect();
        return print_json(&rows);
    }
    if workflows.is_empty() {
        if out.human() {
            println!("  No workflows yet. Submit one with `tloom submit <file>`.");
        }
        return Ok(());
    }

    let mut table = new_table(&["Workflow", "Name", "Owner", "Version", "Tasks", "Updated"]);
    for snapshot in &workflows {
        table.add_row(vec![
            snapshot.workflow_id.to_string(),
            snapshot.definition.name.clone(),
            snapshot.definition.owner.clone(),
            format!("v{}", snapshot.version),
            snapshot.definition.tasks.len().to_string(),
            snapshot.created_at.format("%Y-%m-%d %H:%M").to_string(),
        ]);
    }
    println!("{table}");
    Ok(())
}

// ---------------------------------------------------------------------------
// History / show / rollback
// ---------------------------------------------------------------------------

pub async fn history(state: &AppState, workflow_id: Uuid, out: Output) -> Result<()> {
    let versions = state.engine.history(workflow_id).await?;

    if out.json {
        let rows: Vec<_> = versions.iter().map(summary_json).collect();
        return print_json(&rows);
    }

    let mut table = new_table(&["Version", "Author", "Created", "Hash", "Note"]);
    for snapshot in &versions {
        table.add_row(vec![
            format!("v{}", snapshot.version),
            snapshot.created_by.clone(),
            snapshot.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            truncate(&snapshot.body_hash, 12),
            snapshot.change_note.clone().unwrap_or_default(),
        ]);
    }
    println!("{table}");
    Ok(())
}

pub async fn show(
    state: &AppState,
    workflow_id: Uuid,
    version: Option<u32>,
    out: Output,
) -> Result<()> {
    let snapshot = state.engine.get_version(workflow_id, version).await?;

    if out.json {
        return print_json(&snapshot);
    }

    if out.human() {
        println!(
            "# {} v{} by {} ({})",
            snapshot.definition.name,
            snapshot.version,
            snapshot.created_by,
            snapshot.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    print!("{}", serialize_definition(&snapshot.definition)?);
    Ok(())
}

pub async fn rollback(
    state: &AppState,
    workflow_id: Uuid,
    target: u32,
    author: &str,
    out: Output,
) -> Result<()> {
    let snapshot = state.engine.rollback(workflow_id, target, author).await?;

    if out.json {
        return print_json(&summary_json(&snapshot));
    }
    if out.human() {
        println!();
        println!(
            "  {} Rolled back to v{}; latest is now v{}",
            style("✓").green().bold(),
            target,
            snapshot.version
        );
        println!();
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

pub async fn template(
    id: Option<&str>,
    name: Option<&str>,
    output: Option<&Path>,
    out: Output,
) -> Result<()> {
    let Some(id) = id else {
        if out.json {
            let rows: Vec<_> = TEMPLATES
                .iter()
                .map(|t| json!({ "id": t.id, "description": t.description }))
                .collect();
            return print_json(&rows);
        }
        let mut table = new_table(&["Template", "Description"]);
        for t in TEMPLATES {
            table.add_row(vec![t.id, t.description]);
        }
        println!("{table}");
        return Ok(());
    };

    let template = find_template(id).ok_or_else(|| {
        let known: Vec<_> = TEMPLATES.iter().map(|t| t.id).collect();
        anyhow!("unknown template '{id}' (available: {})", known.join(", "))
    })?;
    let yaml = template.yaml(name.unwrap_or(template.id));

    let Some(path) = output else {
        print!("{yaml}");
        return Ok(());
    };
    tokio::fs::write(path, &yaml)
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;
    if out.human() {
        println!(
            "  {} Wrote '{}' to {}. Submit it with `tloom submit {}`.",
            style("✓").green().bold(),
            style(template.id).cyan(),
            path.display(),
            path.display()
        );
    }
    Ok(())
}

fn summary_json(snapshot: &VersionSnapshot) -> serde_json::Value {
    json!({
        "workflow_id": snapshot.workflow_id,
        "name": snapshot.definition.name,
        "owner": snapshot.definition.owner,
        "version": snapshot.version,
        "tasks": snapshot.definition.tasks.len(),
        "created_by": snapshot.created_by,
        "created_at": snapshot.created_at,
        "change_note": snapshot.change_note,
        "body_hash": snapshot.body_hash,
    })
}
