//! Configuration management for the Triton generation client.
//!
//! Settings are loaded from, in increasing order of precedence:
//! 1. Default configuration (embedded in binary)
//! 2. User-specified configuration file
//! 3. Environment variables (prefixed with `TRITON_LLM_`, sections separated by `__`)
//! 4. Command-line arguments
//!
//! # Environment Variables
//!
//! - `TRITON_LLM_SERVER__URL` - Inference server address (host:port)
//! - `TRITON_LLM_SERVER__MODEL` - Model to generate with
//! - `TRITON_LLM_GENERATION__MAX_TOKENS` - Default generation length
//! - `TRITON_LLM_ADAPTER__LOAD_TIMEOUT_SECS` - Model load timeout

use clap::Args;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::adapter::AdapterConfig;
use crate::error::Result;
use crate::tensor::GenerationParameters;

const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");

/// Command-line arguments that feed configuration
#[derive(Debug, Clone, Default, Args)]
pub struct ConfigArgs {
    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Inference server address in host:port format
    #[arg(long, global = true, value_name = "HOST:PORT")]
    pub server_url: Option<String>,

    /// Model to use
    #[arg(short, long, global = true)]
    pub model: Option<String>,
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Inference server routing
    pub server: ServerSettings,
    /// Default generation parameters
    #[serde(default)]
    pub generation: GenerationParameters,
    /// Token filtering and model loading
    pub adapter: AdapterSettings,
}

/// Inference server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Server address, host:port
    pub url: String,
    /// Model name in the server's repository
    pub model: String,
}

/// Generation adapter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterSettings {
    /// Tokens that end the visible output
    #[serde(default)]
    pub stop_words: Vec<String>,
    /// Tokens dropped from the output
    #[serde(default)]
    pub bad_words: Vec<String>,
    /// Token rendered as a newline
    pub newline_token: String,
    /// Seconds to wait for a model to load
    pub load_timeout_secs: u64,
    /// Milliseconds between readiness checks while loading
    pub poll_interval_ms: u64,
}

impl Settings {
    /// Load configuration from all sources
    pub fn load(args: &ConfigArgs) -> Result<Self> {
        let mut builder = config::Config::builder().add_source(config::File::from_str(
            DEFAULT_CONFIG,
            config::FileFormat::Toml,
        ));

        // Load user config if specified
        if let Some(path) = &args.config {
            builder = builder.add_source(config::File::from(path.as_path()));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("TRITON_LLM")
                .prefix_separator("_")
                .separator("__"),
        );

        let mut settings: Settings = builder.build()?.try_deserialize()?;

        // Override with command line args
        if let Some(url) = &args.server_url {
            settings.server.url = url.clone();
        }
        if let Some(model) = &args.model {
            settings.server.model = model.clone();
        }

        Ok(settings)
    }

    /// Adapter configuration for the configured model
    pub fn adapter_config(&self) -> AdapterConfig {
        AdapterConfig {
            model_name: self.server.model.clone(),
            stop_words: self.adapter.stop_words.clone(),
            bad_words: self.adapter.bad_words.clone(),
            newline_token: self.adapter.newline_token.clone(),
            load_timeout: self.load_timeout(),
        }
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_secs(self.adapter.load_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.adapter.poll_interval_ms)
    }
}
