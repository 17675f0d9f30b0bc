//! Clinified CLI - inspect the offline record store and drive sync cycles

mod cli;
mod commands;
mod error;


use clap::Parser;

use crate::cli::{Cli, Commands, RecordCommands, SyncCommands};
use crate::commands::common::resolve_db_path;
use crate::commands::completions::run_completions;
use crate::commands::record::{run_add, run_delete, run_get, run_history, run_list, run_update};
use crate::commands::sync::{
    run_sync, run_sync_conflicts, run_sync_dismiss, run_sync_resolve, run_sync_retry_failed,
    run_sync_status,
};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("clinified=info".parse().unwrap()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let db_path = resolve_db_path(cli.db_path);

    match cli.command {
        Commands::Record { command } => match command {
            RecordCommands::Add { kind, fields, json } => {
                run_add(&kind, &fields, json.as_deref(), &db_path).await?;
            }
            RecordCommands::Update {
                id,
                fields,
                unset,
                json,
            } => run_update(&id, &fields, &unset, json.as_deref(), &db_path).await?,
            RecordCommands::Get { id, json } => run_get(&id, json, &db_path).await?,
            RecordCommands::Delete { id } => run_delete(&id, &db_path).await?,
            RecordCommands::List {
                kind,
                since,
                limit,
                json,
            } => run_list(kind.as_deref(), since, limit, json, &db_path).await?,
            RecordCommands::History { id } => run_history(&id, &db_path).await?,
        },
        Commands::Sync { command } => match command {
            None => run_sync(&db_path).await?,
            Some(SyncCommands::Status { json }) => run_sync_status(json, &db_path).await?,
            Some(SyncCommands::Conflicts { all, limit, json }) => {
                run_sync_conflicts(all, limit, json, &db_path).await?;
            }
            Some(SyncCommands::Resolve { id, keep }) => {
                run_sync_resolve(id, keep, &db_path).await?;
            }
            Some(SyncCommands::Dismiss { id }) => run_sync_dismiss(id, &db_path).await?,
            Some(SyncCommands::RetryFailed) => run_sync_retry_failed(&db_path).await?,
        },
        Commands::Completions { shell, output } => {
            run_completions(shell, output.as_deref())?;
        }
    }

    Ok(())
}
