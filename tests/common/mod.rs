//! Common test utilities for driving the adapter against scripted and
//! in-process inference servers
#![allow(dead_code)]

pub mod server;

use std::sync::Arc;
use std::time::Duration;

use triton_llm_core::{
    adapter::AdapterConfig, GenerationAdapter, GenerationParameters, ScriptedPush,
    ScriptedTransport, SessionClient,
};

pub const SERVER_URL: &str = "localhost:8001";

/// A ready server that answers the next request with `pushes`
pub fn scripted(pushes: Vec<ScriptedPush>) -> Arc<ScriptedTransport> {
    Arc::new(
        ScriptedTransport::ready()
            .with_script(pushes)
            .with_push_delay(Duration::from_millis(2)),
    )
}

pub fn session(transport: Arc<ScriptedTransport>) -> SessionClient {
    SessionClient::with_transport(SERVER_URL, transport)
        .with_poll_interval(Duration::from_millis(5))
}

pub fn adapter(transport: Arc<ScriptedTransport>) -> GenerationAdapter {
    GenerationAdapter::new(
        session(transport),
        GenerationParameters::default(),
        AdapterConfig::default(),
    )
}

pub fn token(text: &str) -> ScriptedPush {
    ScriptedPush::Token(text.to_string())
}
