//! Taskloom CLI entry point.
//!
//! Binary name: `tloom`
//!
//! Parses CLI arguments, opens the engine database, then dispatches to the
//! command handler.

mod cli;
mod state;

use clap::Parser;
use clap_complete::generate;

use cli::{Cli, Commands, Output};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,taskloom_core=debug,taskloom_infra=debug",
        _ => "trace",
    };
    taskloom_observe::tracing_setup::init_tracing(filter, cli.otel)
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    // Shell completions don't need app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "tloom", &mut std::io::stdout());
        return Ok(());
    }

    let out = Output {
        json: cli.json,
        quiet: cli.quiet,
    };

    // Templates are built in, so the database is never opened
    if let Commands::Template { id, name, output } = &cli.command {
        let result =
            cli::workflow::template(id.as_deref(), name.as_deref(), output.as_deref(), out).await;
        taskloom_observe::tracing_setup::shutdown_tracing();
        return result;
    }

    let state = AppState::init().await?;

    let result = dispatch(cli.command, &state, out).await;
    taskloom_observe::tracing_setup::shutdown_tracing();
    result
}

async fn dispatch(command: Commands, state: &AppState, out: Output) -> anyhow::Result<()> {
    match command {
        Commands::Submit {
            file,
            workflow,
            author,
            note,
        } => cli::workflow::submit(state, &file, workflow, &author, note.as_deref(), out).await,
        Commands::List => cli::workflow::list(state, out).await,
        Commands::History { workflow_id } => cli::workflow::history(state, workflow_id, out).await,
        Commands::Show {
            workflow_id,
            version,
        } => cli::workflow::show(state, workflow_id, version, out).await,
        Commands::Rollback {
            workflow_id,
            version,
            author,
        } => cli::workflow::rollback(state, workflow_id, version, &author, out).await,
        Commands::Run {
            workflow_id,
            version,
            vars,
            detach,
        } => cli::execution::run(state, workflow_id, version, vars, detach, out).await,
        Commands::Status { execution_id } => cli::execution::status(state, execution_id, out).await,
        Commands::Executions { workflow_id, limit } => {
            cli::execution::executions(state, workflow_id, limit, out).await
        }
        Commands::Cancel { execution_id } => cli::execution::cancel(state, execution_id, out).await,
        Commands::Checkpoints { execution_id } => {
            cli::execution::checkpoints(state, execution_id, out).await
        }
        Commands::Resume { execution_id } => cli::execution::resume(state, execution_id, out).await,
        Commands::Stats => cli::execution::stats(state, out).await,
        Commands::Completions { .. } | Commands::Template { .. } => Ok(()),
    }
}
