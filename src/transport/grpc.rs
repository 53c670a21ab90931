//! gRPC transport to a Triton inference server

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, error, info, warn};

use super::proto::{
    self, infer_parameter::ParameterChoice, model_infer_request, GrpcInferenceServiceClient,
};
use super::{
    InferenceTransport, InstanceGroup, InstanceKind, ModelConfig, RepositoryModel, StreamCallback,
    StreamPush,
};
use crate::error::{Error, Result};
use crate::tensor::{
    decode_raw, DataType, InferRequest, InferResponse, InferTensor, ParamValue, TensorData,
};

/// How long `stop_stream` waits for the server to finish the call before
/// abandoning the reader
const STOP_GRACE: Duration = Duration::from_secs(2);

/// The stream currently open on a [`GrpcTransport`]
struct ActiveStream {
    requests: mpsc::UnboundedSender<proto::ModelInferRequest>,
    reader: JoinHandle<()>,
}

/// Connection to the `GRPCInferenceService` endpoint of a Triton server
pub struct GrpcTransport {
    client: GrpcInferenceServiceClient,
    addr: String,
    stream: Mutex<Option<ActiveStream>>,
}

impl GrpcTransport {
    /// Create a transport for `addr` (e.g. "localhost:8001" or "http://host:8001").
    ///
    /// The channel connects lazily, on the first call.
    pub fn new(addr: &str) -> Result<Self> {
        let uri = if addr.starts_with("http://") || addr.starts_with("https://") {
            addr.to_string()
        } else {
            format!("http://{}", addr)
        };

        debug!(uri = %uri, "Creating Triton gRPC channel");

        let endpoint = Endpoint::from_shared(uri)
            .map_err(|e| Error::InvalidAddress(format!("{}: {}", addr, e)))?;
        let channel: Channel = endpoint.connect_lazy();

        Ok(Self {
            client: GrpcInferenceServiceClient::new(channel),
            addr: addr.to_string(),
            stream: Mutex::new(None),
        })
    }

    /// Get the server address
    pub fn addr(&self) -> &str {
        &self.addr
    }

    // Channel clones are cheap and share the underlying connection
    fn client(&self) -> GrpcInferenceServiceClient {
        self.client.clone()
    }
}

#[async_trait]
impl InferenceTransport for GrpcTransport {
    async fn is_model_ready(&self, model_name: &str) -> Result<bool> {
        let response = self
            .client()
            .model_ready(proto::ModelReadyRequest {
                name: model_name.to_string(),
                version: String::new(),
            })
            .await?;
        Ok(response.ready)
    }

    async fn load_model(&self, model_name: &str) -> Result<()> {
        info!(model = %model_name, "Requesting model load");
        self.client()
            .repository_model_load(proto::RepositoryModelLoadRequest {
                repository_name: String::new(),
                model_name: model_name.to_string(),
            })
            .await?;
        Ok(())
    }

    async fn repository_index(&self) -> Result<Vec<RepositoryModel>> {
        let response = self
            .client()
            .repository_index(proto::RepositoryIndexRequest {
                repository_name: String::new(),
                ready: false,
            })
            .await?;

        Ok(response
            .models
            .into_iter()
            .map(|m| RepositoryModel {
                name: m.name,
                version: m.version,
                state: m.state,
                reason: m.reason,
            })
            .collect())
    }

    async fn model_config(&self, model_name: &str) -> Result<ModelConfig> {
        let response = self
            .client()
            .model_config(proto::ModelConfigRequest {
                name: model_name.to_string(),
                version: String::new(),
            })
            .await?;

        let config = response.config.ok_or_else(|| {
            Error::MalformedResponse(format!("no config returned for model {}", model_name))
        })?;

        Ok(ModelConfig {
            name: config.name,
            platform: config.platform,
            backend: config.backend,
            max_batch_size: config.max_batch_size,
            instance_groups: config
                .instance_group
                .into_iter()
                .map(|g| InstanceGroup {
                    name: g.name,
                    kind: InstanceKind::from_wire(g.kind),
                    count: g.count,
                    gpus: g.gpus,
                })
                .collect(),
        })
    }

    async fn start_stream(&self, callback: StreamCallback) -> Result<()> {
        {
            let mut slot = self.stream.lock();
            match slot.as_ref() {
                Some(active) if active.reader.is_finished() => {
                    debug!(addr = %self.addr, "Replacing finished inference stream");
                    slot.take();
                }
                Some(_) => return Err(Error::StreamAlreadyOpen),
                None => {}
            }
        }

        let (requests, outgoing) = mpsc::unbounded_channel();
        let mut client = self.client();
        let addr = self.addr.clone();

        let reader = tokio::spawn(async move {
            let mut responses = match client
                .model_stream_infer(UnboundedReceiverStream::new(outgoing))
                .await
            {
                Ok(responses) => responses,
                Err(status) => {
                    error!(addr = %addr, "Failed to open inference stream: {}", status);
                    callback(StreamPush::Error(status.message().to_string()));
                    return;
                }
            };

            loop {
                match responses.message().await {
                    Ok(Some(message)) => {
                        if !message.error_message.is_empty() {
                            callback(StreamPush::Error(message.error_message));
                            continue;
                        }
                        match message.infer_response {
                            Some(response) => {
                                callback(StreamPush::from_decoded(response_from_wire(response)))
                            }
                            None => warn!("Stream message carried neither a response nor an error"),
                        }
                    }
                    Ok(None) => {
                        debug!(addr = %addr, "Inference stream closed by server");
                        break;
                    }
                    Err(status) => {
                        callback(StreamPush::Error(status.message().to_string()));
                        break;
                    }
                }
            }
        });

        *self.stream.lock() = Some(ActiveStream { requests, reader });
        Ok(())
    }

    async fn stream_infer(&self, request: InferRequest) -> Result<()> {
        let guard = self.stream.lock();
        let stream = guard
            .as_ref()
            .ok_or_else(|| Error::Transport("no stream is open".to_string()))?;
        stream
            .requests
            .send(request_to_wire(request))
            .map_err(|_| Error::Transport("inference stream has already closed".to_string()))
    }

    async fn stop_stream(&self) -> Result<()> {
        let active = self.stream.lock().take();
        if let Some(ActiveStream {
            requests,
            mut reader,
        }) = active
        {
            // Ending the request side lets the server finish the call
            drop(requests);
            let joined = match tokio::time::timeout(STOP_GRACE, &mut reader).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(addr = %self.addr, "Server did not finish the stream, aborting reader");
                    reader.abort();
                    reader.await
                }
            };
            if let Err(e) = joined {
                if !e.is_cancelled() {
                    return Err(Error::Transport(format!("stream reader failed: {}", e)));
                }
            }
        }
        Ok(())
    }
}

impl Drop for GrpcTransport {
    fn drop(&mut self) {
        if let Some(active) = self.stream.get_mut().take() {
            active.reader.abort();
        }
    }
}

fn param_to_wire(value: ParamValue) -> proto::InferParameter {
    let choice = match value {
        ParamValue::Bool(v) => ParameterChoice::BoolParam(v),
        ParamValue::Int64(v) => ParameterChoice::Int64Param(v),
        ParamValue::Uint64(v) => ParameterChoice::Uint64Param(v),
        ParamValue::Double(v) => ParameterChoice::DoubleParam(v),
        ParamValue::String(v) => ParameterChoice::StringParam(v),
    };
    proto::InferParameter {
        parameter_choice: Some(choice),
    }
}

fn param_from_wire(param: proto::InferParameter) -> Option<ParamValue> {
    Some(match param.parameter_choice? {
        ParameterChoice::BoolParam(v) => ParamValue::Bool(v),
        ParameterChoice::Int64Param(v) => ParamValue::Int64(v),
        ParameterChoice::Uint64Param(v) => ParamValue::Uint64(v),
        ParameterChoice::DoubleParam(v) => ParamValue::Double(v),
        ParameterChoice::StringParam(v) => ParamValue::String(v),
    })
}

fn contents_to_wire(data: TensorData) -> proto::InferTensorContents {
    let mut contents = proto::InferTensorContents::default();
    match data {
        TensorData::Bool(v) => contents.bool_contents = v,
        TensorData::Uint32(v) => contents.uint_contents = v,
        TensorData::Uint64(v) => contents.uint64_contents = v,
        TensorData::Fp32(v) => contents.fp32_contents = v,
        TensorData::Bytes(v) => contents.bytes_contents = v,
    }
    contents
}

fn contents_from_wire(
    datatype: DataType,
    contents: proto::InferTensorContents,
) -> TensorData {
    match datatype {
        DataType::Bool => TensorData::Bool(contents.bool_contents),
        DataType::Uint32 => TensorData::Uint32(contents.uint_contents),
        DataType::Uint64 => TensorData::Uint64(contents.uint64_contents),
        DataType::Fp32 => TensorData::Fp32(contents.fp32_contents),
        DataType::Bytes => TensorData::Bytes(contents.bytes_contents),
    }
}

pub(crate) fn request_to_wire(request: InferRequest) -> proto::ModelInferRequest {
    let inputs = request
        .inputs
        .into_iter()
        .map(|tensor| model_infer_request::InferInputTensor {
            name: tensor.name,
            datatype: tensor.data.datatype().as_str().to_string(),
            shape: tensor.shape,
            parameters: HashMap::new(),
            contents: Some(contents_to_wire(tensor.data)),
        })
        .collect();

    let outputs = request
        .outputs
        .into_iter()
        .map(|name| model_infer_request::InferRequestedOutputTensor {
            name,
            parameters: HashMap::new(),
        })
        .collect();

    proto::ModelInferRequest {
        model_name: request.model_name,
        model_version: String::new(),
        id: request.id,
        parameters: request
            .parameters
            .into_iter()
            .map(|(k, v)| (k, param_to_wire(v)))
            .collect(),
        inputs,
        outputs,
        raw_input_contents: Vec::new(),
    }
}

/// Convert a wire response, reading tensor data from `raw_output_contents`
/// when present and from the typed contents otherwise.
pub(crate) fn response_from_wire(response: proto::ModelInferResponse) -> Result<InferResponse> {
    let use_raw = !response.raw_output_contents.is_empty();
    let mut raw = response.raw_output_contents.into_iter();

    let mut outputs = Vec::with_capacity(response.outputs.len());
    for tensor in response.outputs {
        let datatype = DataType::parse(&tensor.datatype).ok_or_else(|| {
            Error::MalformedResponse(format!(
                "output {} has unsupported datatype {}",
                tensor.name, tensor.datatype
            ))
        })?;

        let data = if use_raw {
            let buffer = raw.next().ok_or_else(|| {
                Error::MalformedResponse(format!("no raw contents for output {}", tensor.name))
            })?;
            decode_raw(datatype, &buffer)?
        } else {
            contents_from_wire(datatype, tensor.contents.unwrap_or_default())
        };

        outputs.push(InferTensor::new(tensor.name, tensor.shape, data));
    }

    Ok(InferResponse {
        model_name: response.model_name,
        id: response.id,
        outputs,
        parameters: response
            .parameters
            .into_iter()
            .filter_map(|(k, v)| param_from_wire(v).map(|v| (k, v)))
            .collect(),
    })
}
