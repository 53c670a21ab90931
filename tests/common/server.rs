//! In-process `GRPCInferenceService` serving scripted stream replies

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::convert::Infallible;
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{TcpListenerStream, UnboundedReceiverStream};
use tonic::codegen::{empty_body, http, Body, BoxFuture, Context, Poll, Service, StdError};
use tonic::server::{NamedService, StreamingService, UnaryService};
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};

use triton_llm_core::tensor::{encode_raw_bytes, FINAL_RESPONSE, TEXT_OUTPUT};
use triton_llm_core::transport::proto::{
    infer_parameter::ParameterChoice, model_infer_response::InferOutputTensor, InferParameter,
    ModelInferRequest, ModelInferResponse, ModelReadyRequest, ModelReadyResponse,
    ModelStreamInferResponse,
};

/// Shared state of the stub server, inspected by tests
#[derive(Clone, Default)]
pub struct StubInferenceService {
    ready_models: Arc<HashSet<String>>,
    replies: Arc<Mutex<VecDeque<Vec<ModelStreamInferResponse>>>>,
    requests: Arc<Mutex<Vec<ModelInferRequest>>>,
    open_calls: Arc<Mutex<usize>>,
}

impl StubInferenceService {
    pub fn with_ready_model(model: &str) -> Self {
        Self {
            ready_models: Arc::new(HashSet::from([model.to_string()])),
            ..Default::default()
        }
    }

    /// Queue the replies streamed back for the next request
    pub fn push_replies(&self, replies: Vec<ModelStreamInferResponse>) {
        self.replies.lock().push_back(replies);
    }

    pub fn requests(&self) -> Vec<ModelInferRequest> {
        self.requests.lock().clone()
    }

    /// Stream calls whose request side is still open
    pub fn open_calls(&self) -> usize {
        *self.open_calls.lock()
    }
}

pub struct TestServer {
    pub handle: tokio::task::JoinHandle<()>,
    pub addr: SocketAddr,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub async fn start_stub_server(
    service: StubInferenceService,
) -> Result<TestServer, Box<dyn Error>> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = Server::builder()
            .add_service(service)
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
        {
            eprintln!("Test server failed: {}", e);
        }
    });

    Ok(TestServer { handle, addr })
}

fn final_flag(is_final: bool) -> HashMap<String, InferParameter> {
    HashMap::from([(
        FINAL_RESPONSE.to_string(),
        InferParameter {
            parameter_choice: Some(ParameterChoice::BoolParam(is_final)),
        },
    )])
}

fn text_output() -> InferOutputTensor {
    InferOutputTensor {
        name: TEXT_OUTPUT.to_string(),
        datatype: "BYTES".to_string(),
        shape: vec![1, 1],
        ..Default::default()
    }
}

fn reply(response: ModelInferResponse) -> ModelStreamInferResponse {
    ModelStreamInferResponse {
        error_message: String::new(),
        infer_response: Some(response),
    }
}

/// A token carried in `raw_output_contents`, the way Triton sends BYTES
pub fn raw_token(token: &str) -> ModelStreamInferResponse {
    reply(ModelInferResponse {
        model_name: "ensemble".to_string(),
        outputs: vec![text_output()],
        raw_output_contents: vec![encode_raw_bytes(&[token.as_bytes().to_vec()])],
        parameters: final_flag(false),
        ..Default::default()
    })
}

/// A token carried in the typed `bytes_contents` field
pub fn typed_token(token: &str) -> ModelStreamInferResponse {
    let mut output = text_output();
    output.contents = Some(triton_llm_core::transport::proto::InferTensorContents {
        bytes_contents: vec![token.as_bytes().to_vec()],
        ..Default::default()
    });
    reply(ModelInferResponse {
        model_name: "ensemble".to_string(),
        outputs: vec![output],
        parameters: final_flag(false),
        ..Default::default()
    })
}

/// The empty response that only carries the final flag
pub fn empty_final() -> ModelStreamInferResponse {
    reply(ModelInferResponse {
        model_name: "ensemble".to_string(),
        parameters: final_flag(true),
        ..Default::default()
    })
}

pub fn error_reply(message: &str) -> ModelStreamInferResponse {
    ModelStreamInferResponse {
        error_message: message.to_string(),
        infer_response: None,
    }
}

/// A BYTES element whose length prefix claims more bytes than follow
pub fn truncated_token() -> ModelStreamInferResponse {
    let mut raw = 9u32.to_le_bytes().to_vec();
    raw.extend_from_slice(b"abc");
    reply(ModelInferResponse {
        model_name: "ensemble".to_string(),
        outputs: vec![text_output()],
        raw_output_contents: vec![raw],
        parameters: final_flag(false),
        ..Default::default()
    })
}

struct ModelReadySvc(StubInferenceService);

impl UnaryService<ModelReadyRequest> for ModelReadySvc {
    type Response = ModelReadyResponse;
    type Future = BoxFuture<Response<Self::Response>, Status>;

    fn call(&mut self, request: Request<ModelReadyRequest>) -> Self::Future {
        let ready = self.0.ready_models.contains(&request.get_ref().name);
        Box::pin(async move { Ok(Response::new(ModelReadyResponse { ready })) })
    }
}

struct ModelStreamInferSvc(StubInferenceService);

impl StreamingService<ModelInferRequest> for ModelStreamInferSvc {
    type Response = ModelStreamInferResponse;
    type ResponseStream = UnboundedReceiverStream<Result<ModelStreamInferResponse, Status>>;
    type Future = BoxFuture<Response<Self::ResponseStream>, Status>;

    fn call(&mut self, request: Request<Streaming<ModelInferRequest>>) -> Self::Future {
        let service = self.0.clone();
        Box::pin(async move {
            let mut incoming = request.into_inner();
            let (replies, outgoing) = mpsc::unbounded_channel();
            *service.open_calls.lock() += 1;

            tokio::spawn(async move {
                while let Ok(Some(request)) = incoming.message().await {
                    service.requests.lock().push(request);
                    let script = service.replies.lock().pop_front().unwrap_or_default();
                    for message in script {
                        if replies.send(Ok(message)).is_err() {
                            break;
                        }
                    }
                }
                // The client closed its side; ending `replies` finishes the call
                *service.open_calls.lock() -= 1;
            });

            Ok(Response::new(UnboundedReceiverStream::new(outgoing)))
        })
    }
}

impl<B> Service<http::Request<B>> for StubInferenceService
where
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    type Response = http::Response<tonic::body::BoxBody>;
    type Error = Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        let service = self.clone();
        match req.uri().path() {
            "/inference.GRPCInferenceService/ModelReady" => Box::pin(async move {
                let mut grpc = tonic::server::Grpc::new(tonic::codec::ProstCodec::default());
                Ok(grpc.unary(ModelReadySvc(service), req).await)
            }),
            "/inference.GRPCInferenceService/ModelStreamInfer" => Box::pin(async move {
                let mut grpc = tonic::server::Grpc::new(tonic::codec::ProstCodec::default());
                Ok(grpc.streaming(ModelStreamInferSvc(service), req).await)
            }),
            _ => Box::pin(async move {
                let mut response = http::Response::new(empty_body());
                let headers = response.headers_mut();
                headers.insert("grpc-status", http::HeaderValue::from_static("12"));
                headers.insert(
                    http::header::CONTENT_TYPE,
                    http::HeaderValue::from_static("application/grpc"),
                );
                Ok(response)
            }),
        }
    }
}

impl NamedService for StubInferenceService {
    const NAME: &'static str = "inference.GRPCInferenceService";
}
