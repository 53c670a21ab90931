//! Prompt-to-text generation over a streaming inference session
//!
//! [`GenerationAdapter::generate`] is the surface an orchestration framework
//! plugs into: it loads the model, streams one request, hands each token to
//! an optional callback as it arrives and returns the accumulated text.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::session::{EventStream, SessionClient, StreamEvent};
use crate::tensor::{GenerationOverrides, GenerationParameters};

/// Backend label reported to orchestration frameworks
pub const LLM_TYPE: &str = "triton_tensorrt";

/// End-of-sequence marker emitted by the served tokenizer
pub const END_OF_SEQUENCE: &str = "</s>";

/// Byte-fallback token the tokenizer emits for a line feed
pub const NEWLINE_TOKEN: &str = "<0x0A>";

/// Receives generated tokens, one call per token, on the generating task
pub trait TokenCallback {
    fn on_token(&mut self, token: &str);
}

impl<F> TokenCallback for F
where
    F: FnMut(&str),
{
    fn on_token(&mut self, token: &str) {
        self(token)
    }
}

/// Routing target of an adapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelIdentity {
    pub server_url: String,
    pub model_name: String,
}

/// Token filtering and loading behaviour of an adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterConfig {
    pub model_name: String,
    /// Tokens that end the visible output
    pub stop_words: Vec<String>,
    /// Tokens dropped from the output without ending it
    pub bad_words: Vec<String>,
    /// Token rendered as `\n`
    pub newline_token: String,
    pub load_timeout: Duration,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            model_name: "ensemble".to_string(),
            stop_words: vec![END_OF_SEQUENCE.to_string()],
            bad_words: Vec::new(),
            newline_token: NEWLINE_TOKEN.to_string(),
            load_timeout: Duration::from_secs(1000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DrainState {
    Streaming,
    /// A stop token was seen; the rest of the stream is read and discarded
    Suppressing,
}

/// Synchronous-style text generation against one model on one server
pub struct GenerationAdapter {
    session: SessionClient,
    defaults: GenerationParameters,
    config: AdapterConfig,
}

impl GenerationAdapter {
    pub fn new(
        session: SessionClient,
        defaults: GenerationParameters,
        config: AdapterConfig,
    ) -> Self {
        Self {
            session,
            defaults,
            config,
        }
    }

    /// Build a gRPC-backed adapter from loaded settings
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let session = SessionClient::connect(&settings.server.url)?
            .with_poll_interval(settings.poll_interval());
        Ok(Self::new(
            session,
            settings.generation.clone(),
            settings.adapter_config(),
        ))
    }

    pub fn llm_type(&self) -> &'static str {
        LLM_TYPE
    }

    pub fn identifying_params(&self) -> ModelIdentity {
        ModelIdentity {
            server_url: self.session.server_url().to_string(),
            model_name: self.config.model_name.clone(),
        }
    }

    pub fn session(&self) -> &SessionClient {
        &self.session
    }

    pub fn defaults(&self) -> &GenerationParameters {
        &self.defaults
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    /// Generate with the default parameters and no callback
    pub async fn generate_text(&self, prompt: &str) -> Result<String> {
        self.generate(prompt, None, None, &GenerationOverrides::default())
            .await
    }

    /// Generate the full completion of `prompt`.
    ///
    /// `stop_sequences` extends the configured stop words for this call. Each
    /// forwarded token is passed to `token_callback` before it is appended.
    /// Setup failures (load timeout, model not ready) are returned as errors;
    /// a stream error ends generation early and returns the text so far.
    pub async fn generate(
        &self,
        prompt: &str,
        stop_sequences: Option<&[String]>,
        token_callback: Option<&mut dyn TokenCallback>,
        overrides: &GenerationOverrides,
    ) -> Result<String> {
        let params = self.defaults.merged(overrides);
        let model_name = overrides
            .model_name
            .as_deref()
            .unwrap_or(&self.config.model_name);

        self.session
            .ensure_model_ready(model_name, self.config.load_timeout)
            .await?;
        let mut events = self
            .session
            .open_streaming_request(model_name, prompt, &params)
            .await?;

        let mut stop_words: Vec<&str> =
            self.config.stop_words.iter().map(String::as_str).collect();
        if let Some(extra) = stop_sequences {
            stop_words.extend(extra.iter().map(String::as_str));
        }

        let outcome = self.drain(&mut events, &stop_words, token_callback).await;

        if let Err(e) = self.session.close_streaming().await {
            warn!(
                request_id = events.request_id(),
                "Failed to close inference stream: {}", e
            );
        }

        outcome
    }

    async fn drain(
        &self,
        events: &mut EventStream,
        stop_words: &[&str],
        mut token_callback: Option<&mut dyn TokenCallback>,
    ) -> Result<String> {
        let mut text = String::new();
        let mut state = DrainState::Streaming;

        loop {
            let token = match events.next_event().await {
                Some(StreamEvent::Token(token)) => token,
                Some(StreamEvent::End) => break,
                Some(StreamEvent::Error(message)) => {
                    warn!(
                        request_id = events.request_id(),
                        "Generation ended by stream error: {}", message
                    );
                    break;
                }
                Some(StreamEvent::Malformed(message)) => {
                    return Err(Error::MalformedResponse(message));
                }
                None => {
                    warn!(
                        request_id = events.request_id(),
                        "Stream closed without a final response"
                    );
                    break;
                }
            };

            if state == DrainState::Suppressing {
                continue;
            }
            if stop_words.contains(&token.as_str()) {
                debug!(request_id = events.request_id(), token = %token, "Stop token received");
                state = DrainState::Suppressing;
                continue;
            }
            if self.config.bad_words.contains(&token) {
                continue;
            }

            let token = if token == self.config.newline_token {
                "\n".to_string()
            } else {
                token
            };

            if let Some(callback) = token_callback.as_deref_mut() {
                callback.on_token(&token);
            }
            text.push_str(&token);
        }

        Ok(text)
    }
}
