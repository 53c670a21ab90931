//! Inference session client
//!
//! Owns the transport to one inference server. It loads models on demand
//! (the server is expected to run with explicit model control), builds the
//! generation request, and turns the transport's push callback into an
//! ordered [`EventStream`].
//!
//! A session carries at most one open stream. After the consumer sees a
//! terminal event it must call [`SessionClient::close_streaming`]; the
//! session never closes the stream from inside the delivery callback.
//! Dropping the [`EventStream`] without closing frees the session for the
//! next request, which first shuts down the abandoned transport stream.

mod events;

pub use events::{EventFeed, EventStream, StreamEvent};

use events::StreamLease;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::tensor::{GenerationParameters, InferRequest};
use crate::transport::{
    GrpcTransport, InferenceTransport, ModelConfig, RepositoryModel, StreamCallback,
};

/// Default pause between readiness checks while a model loads
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Stream bookkeeping shared between a session and its event streams
#[derive(Debug, Default)]
pub(crate) struct StreamSlot {
    /// Request whose events are still being consumed
    active: Option<u64>,
    /// A transport stream was started and has not been stopped
    transport_open: bool,
}

/// Connection to an inference server, reusable across sequential generations
pub struct SessionClient {
    server_url: String,
    transport: Arc<dyn InferenceTransport>,
    poll_interval: Duration,
    next_request_id: AtomicU64,
    stream: Arc<Mutex<StreamSlot>>,
}

impl SessionClient {
    /// Create a session speaking gRPC to `server_url` (host:port).
    ///
    /// Must be called inside a Tokio runtime; the channel connects lazily.
    pub fn connect(server_url: &str) -> Result<Self> {
        let transport = GrpcTransport::new(server_url)?;
        Ok(Self::with_transport(server_url, Arc::new(transport)))
    }

    /// Create a session over an already constructed transport
    pub fn with_transport(
        server_url: impl Into<String>,
        transport: Arc<dyn InferenceTransport>,
    ) -> Self {
        Self {
            server_url: server_url.into(),
            transport,
            poll_interval: DEFAULT_POLL_INTERVAL,
            next_request_id: AtomicU64::new(1),
            stream: Arc::new(Mutex::new(StreamSlot::default())),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Whether a streaming request is open and its events are still held
    pub fn is_streaming(&self) -> bool {
        self.stream.lock().active.is_some()
    }

    /// Make sure `model_name` is loaded, loading it if necessary.
    ///
    /// Returns immediately when the model already reports ready. Otherwise
    /// issues a load and polls readiness until it succeeds or `timeout`
    /// elapses on the monotonic clock.
    pub async fn ensure_model_ready(&self, model_name: &str, timeout: Duration) -> Result<()> {
        if self.transport.is_model_ready(model_name).await? {
            debug!(model = %model_name, "Model already ready");
            return Ok(());
        }

        info!(model = %model_name, "Loading model");
        self.transport.load_model(model_name).await?;

        let start = Instant::now();
        loop {
            if self.transport.is_model_ready(model_name).await? {
                info!(
                    model = %model_name,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Model ready"
                );
                return Ok(());
            }

            let elapsed = start.elapsed();
            if elapsed >= timeout {
                warn!(model = %model_name, ?elapsed, "Model did not become ready in time");
                return Err(Error::ModelLoadTimeout {
                    model: model_name.to_string(),
                    elapsed,
                    timeout,
                });
            }

            tokio::time::sleep(self.poll_interval.min(timeout - elapsed)).await;
        }
    }

    /// Names of all models in the server's repository index, in server order
    pub async fn list_models(&self) -> Result<Vec<String>> {
        Ok(self
            .repository_index()
            .await?
            .into_iter()
            .map(|model| model.name)
            .collect())
    }

    /// Full repository index entries, in server order
    pub async fn repository_index(&self) -> Result<Vec<RepositoryModel>> {
        self.transport.repository_index().await
    }

    /// Total concurrent execution slots of `model_name`, loading it first
    pub async fn get_model_concurrency(
        &self,
        model_name: &str,
        timeout: Duration,
    ) -> Result<usize> {
        self.ensure_model_ready(model_name, timeout).await?;
        let config = self.transport.model_config(model_name).await?;
        Ok(concurrency(&config))
    }

    /// Send one generation request and return its event queue.
    ///
    /// The model must already be ready; this does not load it.
    pub async fn open_streaming_request(
        &self,
        model_name: &str,
        prompt: &str,
        params: &GenerationParameters,
    ) -> Result<EventStream> {
        if !self.transport.is_model_ready(model_name).await? {
            return Err(Error::ModelNotReady(model_name.to_string()));
        }

        let (request_id, stale) = {
            let mut slot = self.stream.lock();
            if slot.active.is_some() {
                return Err(Error::StreamAlreadyOpen);
            }
            let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
            slot.active = Some(request_id);
            (request_id, std::mem::replace(&mut slot.transport_open, true))
        };
        // Frees the slot if this future or the returned stream is dropped
        let lease = StreamLease::new(self.stream.clone(), request_id);

        if stale {
            warn!(request_id, "Closing stream left open by an abandoned request");
            if let Err(e) = self.transport.stop_stream().await {
                warn!(request_id, "Failed to close abandoned stream: {}", e);
            }
        }

        match self.start_request(model_name, prompt, params, request_id).await {
            Ok(receiver) => Ok(EventStream::new(receiver, request_id).leased(lease)),
            Err(e) => {
                self.stream.lock().transport_open = false;
                Err(e)
            }
        }
    }

    async fn start_request(
        &self,
        model_name: &str,
        prompt: &str,
        params: &GenerationParameters,
        request_id: u64,
    ) -> Result<mpsc::UnboundedReceiver<StreamEvent>> {
        let (queue, receiver) = mpsc::unbounded_channel();
        let callback: StreamCallback = Arc::new(move |push| events::dispatch(&queue, push));
        self.transport.start_stream(callback).await?;

        let request = InferRequest::generation(model_name, request_id.to_string(), prompt, params);

        if let Err(e) = self.transport.stream_infer(request).await {
            if let Err(stop_err) = self.transport.stop_stream().await {
                warn!(request_id, "Failed to close stream after send failure: {}", stop_err);
            }
            return Err(e);
        }

        debug!(model = %model_name, request_id, "Streaming request sent");
        Ok(receiver)
    }

    /// Close the open stream, if any.
    ///
    /// Call after observing a terminal event; never from a delivery callback.
    pub async fn close_streaming(&self) -> Result<()> {
        let result = self.transport.stop_stream().await;
        let mut slot = self.stream.lock();
        slot.transport_open = false;
        if let Some(request_id) = slot.active.take() {
            debug!(request_id, "Streaming request closed");
        }
        result
    }
}

/// Sum of `count × device count` over the model's instance groups.
///
/// Groups without devices (CPU instances) count as zero.
pub fn concurrency(config: &ModelConfig) -> usize {
    config
        .instance_groups
        .iter()
        .map(|group| {
            if group.count > 0 && group.gpus.is_empty() {
                warn!(
                    model = %config.name,
                    group = %group.name,
                    count = group.count,
                    "Instance group has no devices and contributes no concurrency"
                );
            }
            group.slots()
        })
        .sum()
}
