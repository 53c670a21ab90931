pub mod generate;
pub mod model;

pub use generate::GenerateCommand;
pub use model::{ModelAction, ModelCommand};

use clap::{Args, Subcommand};

#[derive(Subcommand)]
pub enum Commands {
    /// Generate text for a prompt, streaming tokens as they arrive
    Generate(GenerateCommand),
    /// Inspect and load models on the inference server
    Model(ModelCommand),
}

/// Logging options shared by every command
#[derive(Debug, Clone, Args)]
pub struct LoggingArgs {
    /// Increase verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Base log level
    #[arg(long, default_value = "info", global = true)]
    pub log_level: String,

    /// Log filter directives, e.g. "triton_llm_core=debug,h2=warn"
    #[arg(long, env = "TRITON_LLM_LOG", global = true)]
    pub log_filter: Option<String>,
}

impl LoggingArgs {
    /// The level implied by `--log-level` and any `-v` flags
    pub fn get_effective_level(&self) -> String {
        match self.verbose {
            0 => self.log_level.clone(),
            1 => "debug".to_string(),
            _ => "trace".to_string(),
        }
    }
}
