use anyhow::{Context, Result};
use std::io::Write;
use tokio::sync::oneshot;
use tracing::info;

use crate::{
    adapter::GenerationAdapter,
    cli::commands::{GenerateCommand, ModelAction, ModelCommand},
    config::Settings,
    session::SessionClient,
    tensor::GenerationOverrides,
};

fn session(settings: &Settings) -> Result<SessionClient> {
    let session = SessionClient::connect(&settings.server.url)
        .with_context(|| format!("Failed to create client for {}", settings.server.url))?;
    Ok(session.with_poll_interval(settings.poll_interval()))
}

pub async fn handle_generate(settings: Settings, cmd: GenerateCommand) -> Result<()> {
    let adapter = GenerationAdapter::from_settings(&settings)
        .context("Failed to create generation adapter")?;
    let identity = adapter.identifying_params();
    info!(
        server = %identity.server_url,
        model = %identity.model_name,
        "Generating"
    );

    let stop = (!cmd.stop.is_empty()).then_some(cmd.stop.as_slice());
    let overrides = cmd.overrides();

    if cmd.no_stream {
        let text = adapter
            .generate(&cmd.prompt, stop, None, &overrides)
            .await
            .context("Generation failed")?;
        println!("{}", text);
        return Ok(());
    }

    stream_generation(&adapter, &cmd.prompt, stop, &overrides, std::io::stdout().lock()).await?;
    println!();
    Ok(())
}

/// Generate `prompt`, writing each token to `out` as it arrives.
///
/// A failed write (e.g. a closed pipe) abandons the generation and is
/// returned as the error.
pub async fn stream_generation<W: Write>(
    adapter: &GenerationAdapter,
    prompt: &str,
    stop: Option<&[String]>,
    overrides: &GenerationOverrides,
    mut out: W,
) -> Result<String> {
    let (broken_tx, mut broken_rx) = oneshot::channel::<std::io::Error>();
    let mut broken_tx = Some(broken_tx);
    let mut write_token = |token: &str| {
        if broken_tx.is_none() {
            return;
        }
        if let Err(e) = out.write_all(token.as_bytes()).and_then(|_| out.flush()) {
            if let Some(tx) = broken_tx.take() {
                let _ = tx.send(e);
            }
        }
    };

    let generation = adapter.generate(prompt, stop, Some(&mut write_token), overrides);
    let outcome = tokio::select! {
        biased;
        Ok(e) = &mut broken_rx => Err(e),
        result = generation => Ok(result),
    };

    let result = match outcome {
        Err(e) => return Err(e).context("Failed to write generated text"),
        Ok(result) => result,
    };
    if let Ok(e) = broken_rx.try_recv() {
        return Err(e).context("Failed to write generated text");
    }
    result.context("Generation failed")
}

pub async fn handle_model(settings: Settings, cmd: ModelCommand) -> Result<()> {
    let client = session(&settings)?;

    match cmd.action {
        ModelAction::List { format } => {
            let models = client
                .repository_index()
                .await
                .context("Failed to read repository index")?;

            if format == "json" {
                println!("{}", serde_json::to_string_pretty(&models)?);
            } else {
                println!("{:<40} {:<10} {:<12} {}", "NAME", "VERSION", "STATE", "REASON");
                for model in models {
                    println!(
                        "{:<40} {:<10} {:<12} {}",
                        model.name, model.version, model.state, model.reason
                    );
                }
            }
        }
        ModelAction::Ready { name } => {
            let name = name.unwrap_or_else(|| settings.server.model.clone());
            client
                .ensure_model_ready(&name, settings.load_timeout())
                .await
                .with_context(|| format!("Model {} is not ready", name))?;
            println!("{} is ready", name);
        }
        ModelAction::Concurrency { name } => {
            let name = name.unwrap_or_else(|| settings.server.model.clone());
            let slots = client
                .get_model_concurrency(&name, settings.load_timeout())
                .await
                .with_context(|| format!("Failed to read concurrency of {}", name))?;
            println!("{}", slots);
        }
    }

    Ok(())
}
