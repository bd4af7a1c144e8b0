//! CLI command definitions and dispatch for the `tloom` binary.
//!
//! Uses clap derive macros for argument parsing. Workflow definition commands
//! live in [`workflow`], execution commands in [`execution`].

pub mod execution;
pub mod workflow;

use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde_json::Value;
use taskloom_types::execution::{ExecutionStatus, TaskStatus};
use uuid::Uuid;

/// Run dependency-ordered workflows with retries and checkpointed recovery.
#[derive(Parser)]
#[command(name = "tloom", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export tracing spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate a YAML/JSON definition and store it as a new version.
    Submit {
        /// Path to the definition file.
        file: PathBuf,

        /// Append to an existing workflow instead of creating a new one.
        #[arg(long)]
        workflow: Option<Uuid>,

        /// Recorded as the version's author.
        #[arg(long, default_value_t = default_author())]
        author: String,

        /// Free-form change note.
        #[arg(long)]
        note: Option<String>,
    },

    /// List workflows with their latest version.
    #[command(alias = "ls")]
    List,

    /// Show the version history of a workflow.
    History {
        workflow_id: Uuid,
    },

    /// Show a workflow definition.
    #[command(disable_version_flag = true)]
    Show {
        workflow_id: Uuid,

        /// Version to show (latest if omitted).
        #[arg(long)]
        version: Option<u32>,
    },

    /// Append a new version copying an earlier one.
    #[command(disable_version_flag = true)]
    Rollback {
        workflow_id: Uuid,

        /// Version whose body becomes the new latest.
        version: u32,

        #[arg(long, default_value_t = default_author())]
        author: String,
    },

    /// Start an execution and wait for it to finish.
    #[command(disable_version_flag = true)]
    Run {
        workflow_id: Uuid,

        /// Pin a specific version (latest if omitted).
        #[arg(long)]
        version: Option<u32>,

        /// Initial variable as key=value; the value is parsed as JSON when possible.
        #[arg(long = "var", value_parser = parse_var)]
        vars: Vec<(String, Value)>,

        /// Return once the execution is recorded. It continues on the next `tloom resume`.
        #[arg(long)]
        detach: bool,
    },

    /// Show an execution with its task results.
    Status {
        execution_id: Uuid,
    },

    /// List recent executions of a workflow.
    Executions {
        workflow_id: Uuid,

        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Cancel an execution.
    Cancel {
        execution_id: Uuid,
    },

    /// List the checkpoints of an execution.
    Checkpoints {
        execution_id: Uuid,
    },

    /// Resume one execution, or every unfinished execution when no id is given.
    Resume {
        execution_id: Option<Uuid>,
    },

    /// Execution counts by status.
    Stats,

    /// List built-in templates, or print one as YAML.
    Template {
        /// Template to print (lists all when omitted).
        id: Option<String>,

        /// Workflow name written into the rendered definition.
        #[arg(long)]
        name: Option<String>,

        /// Write to a file instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

/// Output switches shared by every command.
#[derive(Debug, Clone, Copy)]
pub struct Output {
    pub json: bool,
    pub quiet: bool,
}

impl Output {
    /// Styled text is printed only when neither `--json` nor `--quiet` is set.
    pub fn human(self) -> bool {
        !self.json && !self.quiet
    }
}

fn default_author() -> String {
    std::env::var("USER").unwrap_or_else(|_| "unknown".to_string())
}

/// Parse `key=value`. The value is JSON if it parses as JSON, else a string.
pub fn parse_var(raw: &str) -> Result<(String, Value)> {
    let Some((key, value)) = raw.split_once('=') else {
        bail!("expected key=value, got '{raw}'");
    };
    let key = key.trim();
    if key.is_empty() {
        bail!("variable name is empty in '{raw}'");
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

pub fn new_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(
        headers
            .iter()
            .map(|h| Cell::new(h).fg(Color::White))
            .collect::<Vec<_>>(),
    );
    table
}

pub fn execution_status_cell(status: ExecutionStatus) -> Cell {
    let color = match status {
        ExecutionStatus::Pending => Color::Grey,
        ExecutionStatus::Running => Color::Cyan,
        ExecutionStatus::Completed => Color::Green,
        ExecutionStatus::Failed => Color::Red,
        ExecutionStatus::Cancelled => Color::Yellow,
    };
    Cell::new(status.as_str()).fg(color)
}

pub fn task_status_cell(status: TaskStatus) -> Cell {
    let color = match status {
        TaskStatus::Succeeded => Color::Green,
        TaskStatus::Failed => Color::Red,
        TaskStatus::Skipped => Color::Yellow,
        TaskStatus::Running => Color::Cyan,
        TaskStatus::Pending => Color::Grey,
    };
    Cell::new(status.as_str()).fg(color)
}

pub fn styled_status(status: ExecutionStatus) -> String {
    match status {
        ExecutionStatus::Completed => style(status.as_str()).green().to_string(),
        ExecutionStatus::Failed => style(status.as_str()).red().to_string(),
        ExecutionStatus::Cancelled => style(status.as_str()).yellow().to_string(),
        ExecutionStatus::Pending | ExecutionStatus::Running => {
            style(status.as_str()).cyan().to_string()
        }
    }
}

pub fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Shorten a string for table display.
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{cut}…")
    }
}
