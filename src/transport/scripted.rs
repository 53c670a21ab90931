//! In-process transport that replays scripted stream pushes
//!
//! Each call to `stream_infer` consumes the next script and replays it to the
//! registered callback from a spawned task, the way a live transport delivers
//! pushes from its own reader task. Administrative calls answer from fixed
//! state and are counted so callers can assert on them.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;

use super::{InferenceTransport, ModelConfig, RepositoryModel, StreamCallback, StreamPush};
use crate::error::{Error, Result};
use crate::tensor::{
    InferRequest, InferResponse, InferTensor, ParamValue, TensorData, FINAL_RESPONSE, TEXT_OUTPUT,
};

/// One scripted server push
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedPush {
    /// A response carrying one token as a `[1, 1]` BYTES output
    Token(String),
    /// A token and the final-response flag in the same push
    FinalToken(String),
    /// An empty trailing response carrying only the final-response flag
    Final,
    /// A stream error
    Error(String),
    /// An arbitrary response, for shapes the helpers above do not cover
    Response(InferResponse),
}

impl ScriptedPush {
    /// Script a whole token stream followed by an empty final response
    pub fn tokens<I, S>(tokens: I) -> Vec<ScriptedPush>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        tokens
            .into_iter()
            .map(|t| ScriptedPush::Token(t.into()))
            .chain(std::iter::once(ScriptedPush::Final))
            .collect()
    }

    fn into_push(self) -> StreamPush {
        match self {
            ScriptedPush::Token(token) => StreamPush::Response(token_response(&token, false)),
            ScriptedPush::FinalToken(token) => StreamPush::Response(token_response(&token, true)),
            ScriptedPush::Final => StreamPush::Response(final_response()),
            ScriptedPush::Error(message) => StreamPush::Error(message),
            ScriptedPush::Response(response) => StreamPush::Response(response),
        }
    }
}

fn final_response() -> InferResponse {
    let mut parameters = HashMap::new();
    parameters.insert(FINAL_RESPONSE.to_string(), ParamValue::Bool(true));
    InferResponse {
        parameters,
        ..Default::default()
    }
}

fn token_response(token: &str, is_final: bool) -> InferResponse {
    let mut parameters = HashMap::new();
    parameters.insert(FINAL_RESPONSE.to_string(), ParamValue::Bool(is_final));
    InferResponse {
        outputs: vec![InferTensor::new(
            TEXT_OUTPUT,
            vec![1, 1],
            TensorData::Bytes(vec![token.as_bytes().to_vec()]),
        )],
        parameters,
        ..Default::default()
    }
}

/// Readiness behaviour of the scripted server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Every model reports ready
    Ready,
    /// Models report ready once this many readiness checks follow a load request
    AfterChecks(usize),
    /// No model ever reports ready
    Never,
}

/// A transport that needs no server
pub struct ScriptedTransport {
    readiness: Readiness,
    loaded: AtomicBool,
    checks_since_load: AtomicUsize,
    ready_calls: AtomicUsize,
    load_calls: AtomicUsize,
    stop_calls: AtomicUsize,
    push_delay: Duration,
    models: Vec<RepositoryModel>,
    configs: HashMap<String, ModelConfig>,
    scripts: Mutex<VecDeque<Vec<ScriptedPush>>>,
    requests: Mutex<Vec<InferRequest>>,
    callback: Mutex<Option<StreamCallback>>,
    deliveries: Mutex<Vec<JoinHandle<()>>>,
}

impl ScriptedTransport {
    pub fn new(readiness: Readiness) -> Self {
        Self {
            readiness,
            loaded: AtomicBool::new(false),
            checks_since_load: AtomicUsize::new(0),
            ready_calls: AtomicUsize::new(0),
            load_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
            push_delay: Duration::ZERO,
            models: Vec::new(),
            configs: HashMap::new(),
            scripts: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            callback: Mutex::new(None),
            deliveries: Mutex::new(Vec::new()),
        }
    }

    /// A server on which every model is already loaded
    pub fn ready() -> Self {
        Self::new(Readiness::Ready)
    }

    /// Queue the pushes answering the next streamed request
    pub fn with_script(self, pushes: Vec<ScriptedPush>) -> Self {
        self.scripts.lock().push_back(pushes);
        self
    }

    pub fn with_model(mut self, model: RepositoryModel) -> Self {
        self.models.push(model);
        self
    }

    pub fn with_config(mut self, config: ModelConfig) -> Self {
        self.configs.insert(config.name.clone(), config);
        self
    }

    /// Pause between pushes, so consumers genuinely wait on the queue
    pub fn with_push_delay(mut self, delay: Duration) -> Self {
        self.push_delay = delay;
        self
    }

    pub fn push_script(&self, pushes: Vec<ScriptedPush>) {
        self.scripts.lock().push_back(pushes);
    }

    pub fn load_calls(&self) -> usize {
        self.load_calls.load(Ordering::SeqCst)
    }

    pub fn ready_calls(&self) -> usize {
        self.ready_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    /// Every request streamed so far, oldest first
    pub fn requests(&self) -> Vec<InferRequest> {
        self.requests.lock().clone()
    }

    pub fn stream_open(&self) -> bool {
        self.callback.lock().is_some()
    }
}

#[async_trait]
impl InferenceTransport for ScriptedTransport {
    async fn is_model_ready(&self, _model_name: &str) -> Result<bool> {
        self.ready_calls.fetch_add(1, Ordering::SeqCst);
        Ok(match self.readiness {
            Readiness::Ready => true,
            Readiness::Never => false,
            Readiness::AfterChecks(needed) => {
                self.loaded.load(Ordering::SeqCst)
                    && self.checks_since_load.fetch_add(1, Ordering::SeqCst) + 1 >= needed
            }
        })
    }

    async fn load_model(&self, _model_name: &str) -> Result<()> {
        self.load_calls.fetch_add(1, Ordering::SeqCst);
        self.loaded.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn repository_index(&self) -> Result<Vec<RepositoryModel>> {
        Ok(self.models.clone())
    }

    async fn model_config(&self, model_name: &str) -> Result<ModelConfig> {
        self.configs
            .get(model_name)
            .cloned()
            .ok_or_else(|| Error::Transport(format!("Request for unknown model: '{}'", model_name)))
    }

    async fn start_stream(&self, callback: StreamCallback) -> Result<()> {
        let mut slot = self.callback.lock();
        if slot.is_some() {
            return Err(Error::StreamAlreadyOpen);
        }
        *slot = Some(callback);
        Ok(())
    }

    async fn stream_infer(&self, request: InferRequest) -> Result<()> {
        let callback = self
            .callback
            .lock()
            .clone()
            .ok_or_else(|| Error::Transport("no stream is open".to_string()))?;
        self.requests.lock().push(request);

        let pushes = self.scripts.lock().pop_front().unwrap_or_default();
        let delay = self.push_delay;
        let delivery = tokio::spawn(async move {
            for push in pushes {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                callback(push.into_push());
            }
        });
        self.deliveries.lock().push(delivery);
        Ok(())
    }

    async fn stop_stream(&self) -> Result<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.callback.lock().take();
        let deliveries: Vec<_> = self.deliveries.lock().drain(..).collect();
        for delivery in deliveries {
            delivery.abort();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_replays_script_in_order() {
        let transport = ScriptedTransport::ready().with_script(ScriptedPush::tokens(["a", "b"]));
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport
            .start_stream(Arc::new(move |push| {
                let _ = tx.send(push);
            }))
            .await
            .unwrap();
        transport
            .stream_infer(InferRequest::generation(
                "m",
                "1",
                "p",
                &Default::default(),
            ))
            .await
            .unwrap();

        let mut responses = Vec::new();
        for _ in 0..3 {
            match rx.recv().await.unwrap() {
                StreamPush::Response(response) => responses.push(response),
                other => panic!("unexpected push: {:?}", other),
            }
        }
        assert!(!responses[0].is_final());
        assert!(responses[1].has_outputs());
        assert!(responses[2].is_final());
        assert!(!responses[2].has_outputs());
    }

    #[tokio::test]
    async fn test_becomes_ready_after_checks() {
        let transport = ScriptedTransport::new(Readiness::AfterChecks(2));
        assert!(!transport.is_model_ready("m").await.unwrap());
        transport.load_model("m").await.unwrap();
        assert!(!transport.is_model_ready("m").await.unwrap());
        assert!(transport.is_model_ready("m").await.unwrap());
        assert_eq!(transport.load_calls(), 1);
    }

    #[tokio::test]
    async fn test_single_open_stream() {
        let transport = ScriptedTransport::ready();
        transport.start_stream(Arc::new(|_| {})).await.unwrap();
        assert!(matches!(
            transport.start_stream(Arc::new(|_| {})).await,
            Err(Error::StreamAlreadyOpen)
        ));
        transport.stop_stream().await.unwrap();
        assert!(!transport.stream_open());
    }
}
