//! Text generation CLI command

use clap::Args;

use crate::tensor::GenerationOverrides;

#[derive(Args)]
pub struct GenerateCommand {
    /// Prompt text
    pub prompt: String,

    /// Extra stop token; may be repeated
    #[arg(long = "stop", value_name = "TOKEN")]
    pub stop: Vec<String>,

    /// Maximum number of tokens to generate
    #[arg(long)]
    pub max_tokens: Option<u32>,

    #[arg(long)]
    pub temperature: Option<f32>,

    #[arg(long)]
    pub top_k: Option<u32>,

    #[arg(long)]
    pub top_p: Option<f32>,

    #[arg(long)]
    pub beam_width: Option<u32>,

    #[arg(long)]
    pub repetition_penalty: Option<f32>,

    #[arg(long)]
    pub length_penalty: Option<f32>,

    /// Sampling seed
    #[arg(long)]
    pub seed: Option<u64>,

    /// Print only the final text instead of streaming tokens
    #[arg(long)]
    pub no_stream: bool,
}

impl GenerateCommand {
    pub fn overrides(&self) -> GenerationOverrides {
        GenerationOverrides {
            model_name: None,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            top_k: self.top_k,
            top_p: self.top_p,
            beam_width: self.beam_width,
            repetition_penalty: self.repetition_penalty,
            length_penalty: self.length_penalty,
            random_seed: self.seed,
        }
    }
}
