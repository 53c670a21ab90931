//! Transport seam between the session client and an inference server
//!
//! The session client never talks to the wire directly. It drives an
//! [`InferenceTransport`], which is either a live gRPC connection
//! ([`grpc::GrpcTransport`]) or an in-process replay
//! ([`scripted::ScriptedTransport`]).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::tensor::{InferRequest, InferResponse};

pub mod grpc;
pub mod proto;
pub mod scripted;

pub use grpc::GrpcTransport;
pub use scripted::{Readiness, ScriptedPush, ScriptedTransport};

/// One push from an open stream
#[derive(Debug, Clone, PartialEq)]
pub enum StreamPush {
    /// A response converted from the wire
    Response(InferResponse),
    /// The server or the wire reported an error
    Error(String),
    /// A response arrived but could not be converted
    Malformed(String),
}

impl StreamPush {
    /// Wrap a conversion result, keeping decode failures distinct from stream errors
    pub fn from_decoded(decoded: Result<InferResponse>) -> Self {
        match decoded {
            Ok(response) => StreamPush::Response(response),
            Err(Error::MalformedResponse(detail)) => StreamPush::Malformed(detail),
            Err(e) => StreamPush::Malformed(e.to_string()),
        }
    }
}

/// Receives every push of an open stream, on a transport-owned task.
///
/// Implementations must not block and must not call back into the transport.
pub type StreamCallback = Arc<dyn Fn(StreamPush) + Send + Sync>;

/// An entry of the server's model repository index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryModel {
    pub name: String,
    pub version: String,
    pub state: String,
    pub reason: String,
}

/// Execution kind of an instance group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceKind {
    Auto,
    Gpu,
    Cpu,
    Model,
}

impl InstanceKind {
    pub fn from_wire(kind: i32) -> Self {
        match kind {
            1 => InstanceKind::Gpu,
            2 => InstanceKind::Cpu,
            3 => InstanceKind::Model,
            _ => InstanceKind::Auto,
        }
    }
}

/// How many copies of a model run, and on which devices
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceGroup {
    pub name: String,
    pub kind: InstanceKind,
    pub count: i32,
    pub gpus: Vec<i32>,
}

impl InstanceGroup {
    /// Concurrent execution slots contributed by this group
    pub fn slots(&self) -> usize {
        self.count.max(0) as usize * self.gpus.len()
    }
}

/// The parts of a model configuration this client reads
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    pub platform: String,
    pub backend: String,
    pub max_batch_size: i32,
    pub instance_groups: Vec<InstanceGroup>,
}

/// Administrative and streaming surface of an inference server.
///
/// A transport carries at most one open stream at a time. The callback given
/// to [`start_stream`](InferenceTransport::start_stream) is invoked from a
/// background task, in the order the server pushed responses.
#[async_trait]
pub trait InferenceTransport: Send + Sync {
    async fn is_model_ready(&self, model_name: &str) -> Result<bool>;

    /// Ask the server to load a model; returns before the load completes
    async fn load_model(&self, model_name: &str) -> Result<()>;

    async fn repository_index(&self) -> Result<Vec<RepositoryModel>>;

    async fn model_config(&self, model_name: &str) -> Result<ModelConfig>;

    /// Open the bidirectional stream and register the push callback
    async fn start_stream(&self, callback: StreamCallback) -> Result<()>;

    /// Send one request on the open stream
    async fn stream_infer(&self, request: InferRequest) -> Result<()>;

    /// Close the open stream. Must not be called from inside the callback.
    async fn stop_stream(&self) -> Result<()>;
}
