//! Ordered event queue between the transport's delivery task and a consumer

use futures::Stream;
use parking_lot::Mutex;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error};

use super::StreamSlot;
use crate::error::Error;
use crate::tensor::decode_text;
use crate::transport::StreamPush;

/// One unit of a streamed generation, in server push order
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Text decoded from one pushed response
    Token(String),
    /// The server or the wire reported an error; nothing further will follow
    Error(String),
    /// A pushed response could not be decoded into text
    Malformed(String),
    /// The server's final response for the request
    End,
}

impl StreamEvent {
    /// Whether no further events are expected after this one
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Token(_))
    }
}

/// Normalise one transport push into queue events.
///
/// A push may carry a token, the final flag, or both; the token is always
/// queued before the terminal marker.
pub(crate) fn dispatch(queue: &mpsc::UnboundedSender<StreamEvent>, push: StreamPush) {
    // A closed receiver means the consumer is gone; late pushes are dropped
    let send = |event: StreamEvent| {
        let _ = queue.send(event);
    };

    match push {
        StreamPush::Error(message) => {
            error!("Inference stream error: {}", message);
            send(StreamEvent::Error(message));
        }
        StreamPush::Malformed(detail) => {
            error!("Undecodable stream response: {}", detail);
            send(StreamEvent::Malformed(detail));
        }
        StreamPush::Response(response) => {
            if response.has_outputs() {
                match decode_text(&response) {
                    Ok(token) => send(StreamEvent::Token(token)),
                    Err(e) => {
                        let detail = match e {
                            Error::MalformedResponse(detail) => detail,
                            other => other.to_string(),
                        };
                        error!("Undecodable stream response: {}", detail);
                        send(StreamEvent::Malformed(detail));
                        return;
                    }
                }
            }
            if response.is_final() {
                debug!(id = %response.id, "Final response received");
                send(StreamEvent::End);
            }
        }
    }
}

/// Claim on a session's stream slot, released when dropped unless the
/// session closed the request first
#[derive(Debug)]
pub(crate) struct StreamLease {
    slot: Arc<Mutex<StreamSlot>>,
    request_id: u64,
}

impl StreamLease {
    pub(crate) fn new(slot: Arc<Mutex<StreamSlot>>, request_id: u64) -> Self {
        Self { slot, request_id }
    }
}

impl Drop for StreamLease {
    fn drop(&mut self) {
        let mut slot = self.slot.lock();
        if slot.active == Some(self.request_id) {
            slot.active = None;
            debug!(request_id = self.request_id, "Stream released without close");
        }
    }
}

/// Consumer side of a streaming request's event queue
#[derive(Debug)]
pub struct EventStream {
    receiver: mpsc::UnboundedReceiver<StreamEvent>,
    request_id: u64,
    lease: Option<StreamLease>,
}

impl EventStream {
    pub(crate) fn new(receiver: mpsc::UnboundedReceiver<StreamEvent>, request_id: u64) -> Self {
        Self {
            receiver,
            request_id,
            lease: None,
        }
    }

    pub(crate) fn leased(mut self, lease: StreamLease) -> Self {
        self.lease = Some(lease);
        self
    }

    /// Id sent with the request this stream answers
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Wait for the next event.
    ///
    /// Returns `None` once the transport has dropped its end of the queue and
    /// every queued event has been read. There is no timeout.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.receiver.recv().await
    }

    /// Expose the queue as a `Stream` of events
    pub fn into_stream(self) -> EventFeed {
        EventFeed {
            inner: UnboundedReceiverStream::new(self.receiver),
            _lease: self.lease,
        }
    }
}

/// [`EventStream`] as a `futures::Stream`, holding the session's stream slot
/// for as long as it lives
#[derive(Debug)]
pub struct EventFeed {
    inner: UnboundedReceiverStream<StreamEvent>,
    _lease: Option<StreamLease>,
}

impl Stream for EventFeed {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}
