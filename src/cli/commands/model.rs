//! Model management CLI commands

use clap::{Args, Subcommand};

/// Model management commands
#[derive(Args)]
pub struct ModelCommand {
    #[command(subcommand)]
    pub action: ModelAction,
}

/// Model management actions
#[derive(Subcommand)]
pub enum ModelAction {
    /// List models in the server's repository
    List {
        /// Output format (table, json)
        #[arg(long, default_value = "table")]
        format: String,
    },

    /// Load a model and wait until it is ready
    Ready {
        /// Model name (defaults to the configured model)
        name: Option<String>,
    },

    /// Show how many requests a model can execute concurrently
    Concurrency {
        /// Model name (defaults to the configured model)
        name: Option<String>,
    },
}
