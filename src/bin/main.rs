//! Triton LLM binary.
//!
//! Command-line entry point for streaming text generation against a Triton
//! inference server running a TensorRT-LLM ensemble.

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_log::LogTracer;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};
use triton_llm_core::{
    cli::commands::{Commands, LoggingArgs},
    cli::handlers::{handle_generate, handle_model},
    config::{ConfigArgs, Settings},
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub config: ConfigArgs,

    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Route `log` records from dependencies into tracing
    LogTracer::init().context("Failed to initialize log tracer")?;

    let level = cli.logging.get_effective_level();
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(level.parse().unwrap_or(LevelFilter::INFO).into())
                .parse_lossy(cli.logging.log_filter.as_deref().unwrap_or("triton_llm_core=info")),
        )
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to install tracing subscriber")?;

    let settings = Settings::load(&cli.config).context("Failed to load configuration")?;
    info!(server = %settings.server.url, model = %settings.server.model, "triton-llm starting");

    match cli.command {
        Commands::Generate(cmd) => handle_generate(settings, cmd).await?,
        Commands::Model(cmd) => handle_model(settings, cmd).await?,
    }

    Ok(())
}
