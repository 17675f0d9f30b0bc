use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "clinified")]
#[command(about = "Inspect and sync the Clinified offline record store")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create, edit and inspect local records
    Record {
        #[command(subcommand)]
        command: RecordCommands,
    },
    /// Run a sync cycle or manage the sync queue
    Sync {
        #[command(subcommand)]
        command: Option<SyncCommands>,
    },
    /// Generate shell completion scripts
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
        /// Optional output path (stdout when omitted)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
pub enum RecordCommands {
    /// Create a record
    #[command(alias = "new")]
    Add {
        /// Record kind, e.g. patient or encounter
        #[arg(long)]
        kind: String,
        /// Field assignment `key=value`; values parse as JSON when possible
        #[arg(short, long = "field", value_name = "KEY=VALUE")]
        fields: Vec<String>,
        /// Initial payload as a JSON object
        #[arg(long, value_name = "OBJECT")]
        json: Option<String>,
    },
    /// Change fields of a record
    #[command(alias = "edit")]
    Update {
        /// Record ID
        id: String,
        /// Field assignment `key=value`; values parse as JSON when possible
        #[arg(short, long = "field", value_name = "KEY=VALUE")]
        fields: Vec<String>,
        /// Remove a field
        #[arg(long = "unset", value_name = "KEY")]
        unset: Vec<String>,
        /// Replace the whole payload with a JSON object
        #[arg(long, value_name = "OBJECT")]
        json: Option<String>,
    },
    /// Show one record
    Get {
        /// Record ID
        id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete a record
    Delete {
        /// Record ID
        id: String,
    },
    /// List recent records
    List {
        /// Only records of this kind
        #[arg(long)]
        kind: Option<String>,
        /// Records changed after this local revision, tombstones included
        #[arg(long, value_name = "REV")]
        since: Option<i64>,
        /// Number of records to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show changes not yet pruned from the change log
    History {
        /// Record ID
        id: String,
    },
}

#[derive(Subcommand)]
pub enum SyncCommands {
    /// Show queue counts and the pull cursor
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List sync conflicts
    Conflicts {
        /// Include resolved conflicts
        #[arg(long)]
        all: bool,
        /// Number of conflicts to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Resolve an open conflict
    Resolve {
        /// Conflict ID
        id: i64,
        /// Version to keep
        #[arg(long, value_enum)]
        keep: KeepSide,
    },
    /// Remove a resolved conflict from the list
    Dismiss {
        /// Conflict ID
        id: i64,
    },
    /// Give failed queue entries another retry budget
    RetryFailed,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum KeepSide {
    Local,
    Remote,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}
