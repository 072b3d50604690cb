//! Streaming response protocol.
//!
//! Handler code receives a [`ResponseSink`] and emits its response through it.
//! The caller holds the paired [`ResponseStream`], which yields the response
//! head exactly once and then the body chunks in emission order.
//!
//! Chunks wait in a FIFO until the consumer polls for them. `stream()`
//! suspends while the backlog sits at the high-water mark, so a slow consumer
//! throttles the handler instead of growing the buffer.
//!
//! Metadata (`status`, `status_text`, `headers`, `options`) merges into a
//! pending head until the first body emission commits it. After the commit,
//! metadata calls are ignored: the first commit wins.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Notify, mpsc, oneshot};

use crate::envelope::{ResponseChunk, ResponseHead, ResponseOptions};

pub const DEFAULT_HIGH_WATER: usize = 16;

const JSON_CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    #[error("response stream was cancelled by the consumer")]
    Cancelled,
}

/// One piece of handler output.
#[derive(Debug, Clone)]
pub enum Chunk {
    Bytes(Bytes),
    Text(String),
    /// Structured output. Forces `content-type: application/json` when it
    /// commits the head.
    Json(serde_json::Value),
}

impl Chunk {
    pub fn json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_value(value).map(Chunk::Json)
    }
}

impl From<&str> for Chunk {
    fn from(value: &str) -> Self {
        Chunk::Text(value.to_string())
    }
}

impl From<String> for Chunk {
    fn from(value: String) -> Self {
        Chunk::Text(value)
    }
}

impl From<Bytes> for Chunk {
    fn from(value: Bytes) -> Self {
        Chunk::Bytes(value)
    }
}

impl From<Vec<u8>> for Chunk {
    fn from(value: Vec<u8>) -> Self {
        Chunk::Bytes(Bytes::from(value))
    }
}

impl From<serde_json::Value> for Chunk {
    fn from(value: serde_json::Value) -> Self {
        Chunk::Json(value)
    }
}

/// Failure reported by handler code through [`ResponseSink::error`].
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
    pub stack: Option<String>,
    pub status: Option<u16>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
            status: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut error = serde_json::json!({ "message": self.message });
        if let Some(stack) = &self.stack {
            error["stack"] = serde_json::Value::String(stack.clone());
        }
        serde_json::json!({ "error": error })
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        HandlerError::new(message)
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        HandlerError::new(message)
    }
}

/// How a response stream was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Done,
    Failed,
}

struct Shared {
    queue: VecDeque<Bytes>,
    outcome: Option<Outcome>,
    cancelled: bool,
    consumer: Option<Waker>,
}

impl Shared {
    fn wake_consumer(&mut self) {
        if let Some(waker) = self.consumer.take() {
            waker.wake();
        }
    }
}

pub fn channel() -> (ResponseSink, ResponseStream) {
    channel_with_high_water(DEFAULT_HIGH_WATER)
}

pub fn channel_with_high_water(high_water: usize) -> (ResponseSink, ResponseStream) {
    let shared = Arc::new(Mutex::new(Shared {
        queue: VecDeque::new(),
        outcome: None,
        cancelled: false,
        consumer: None,
    }));
    let drained = Arc::new(Notify::new());
    let (head_tx, head_rx) = oneshot::channel();

    let sink = ResponseSink {
        shared: Arc::clone(&shared),
        drained: Arc::clone(&drained),
        pending: ResponseHead::default(),
        head_tx: Some(head_tx),
        high_water: high_water.max(1),
        terminated: false,
    };
    let stream = ResponseStream {
        head: head_rx,
        body: ResponseBody { shared, drained },
    };
    (sink, stream)
}

/// Handler-side half of a response.
///
/// `send`, `redirect` and `error` consume the sink, so a handler terminates
/// its response exactly once. A sink dropped without a terminal call closes
/// the response with a 500 error payload.
pub struct ResponseSink {
    shared: Arc<Mutex<Shared>>,
    drained: Arc<Notify>,
    pending: ResponseHead,
    head_tx: Option<oneshot::Sender<ResponseHead>>,
    high_water: usize,
    terminated: bool,
}

impl ResponseSink {
    pub fn status(&mut self, status: u16) -> &mut Self {
        if self.accepts_metadata("status") {
            self.pending.status = status;
        }
        self
    }

    pub fn status_text(&mut self, text: impl Into<String>) -> &mut Self {
        if self.accepts_metadata("statusText") {
            self.pending.status_text = Some(text.into());
        }
        self
    }

    pub fn headers<I, K, V>(&mut self, headers: I) -> &mut Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        if self.accepts_metadata("headers") {
            for (name, value) in headers {
                self.pending.set_header(name.as_ref(), value);
            }
        }
        self
    }

    pub fn header(&mut self, name: &str, value: impl Into<String>) -> &mut Self {
        if self.accepts_metadata("header") {
            self.pending.set_header(name, value);
        }
        self
    }

    pub fn options(&mut self, options: ResponseOptions) -> &mut Self {
        if self.accepts_metadata("options") {
            self.pending.apply(options);
        }
        self
    }

    pub fn is_committed(&self) -> bool {
        self.head_tx.is_none()
    }

    /// Emits a chunk without closing the response.
    pub async fn stream(&mut self, chunk: impl Into<Chunk>) -> Result<(), StreamError> {
        let bytes = self.encode(chunk.into());
        self.commit();
        self.wait_for_room().await?;
        self.push(bytes)
    }

    /// Emits a final chunk and closes the response.
    pub fn send(mut self, chunk: impl Into<Chunk>) {
        let bytes = self.encode(chunk.into());
        self.commit();
        if self.push(bytes).is_err() {
            tracing::debug!("response consumer went away before send()");
        }
        self.finish(Outcome::Done);
    }

    /// Closes the response with a 307 pointing at `location` and no body.
    pub fn redirect(mut self, location: impl Into<String>) {
        if !self.is_committed() {
            self.pending.status = 307;
            self.pending.set_header("location", location);
        } else {
            tracing::warn!("redirect() after the response head was committed");
        }
        self.commit();
        self.finish(Outcome::Done);
    }

    /// Closes the response with a JSON error payload.
    pub fn error(mut self, error: impl Into<HandlerError>) {
        self.fail(error.into());
    }

    async fn wait_for_room(&self) -> Result<(), StreamError> {
        let drained = Arc::clone(&self.drained);
        loop {
            let notified = drained.notified();
            {
                let shared = self.shared.lock();
                if shared.cancelled {
                    return Err(StreamError::Cancelled);
                }
                if shared.queue.len() < self.high_water {
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    fn accepts_metadata(&self, call: &str) -> bool {
        if self.is_committed() {
            tracing::debug!("ignoring {}() after the response head was committed", call);
            return false;
        }
        true
    }

    fn encode(&mut self, chunk: Chunk) -> Bytes {
        match chunk {
            Chunk::Bytes(bytes) => bytes,
            Chunk::Text(text) => Bytes::from(text),
            Chunk::Json(value) => {
                if !self.is_committed() {
                    self.pending.set_header("content-type", JSON_CONTENT_TYPE);
                }
                Bytes::from(value.to_string())
            }
        }
    }

    fn commit(&mut self) {
        if let Some(head_tx) = self.head_tx.take() {
            let _ = head_tx.send(self.pending.clone());
        }
    }

    fn push(&self, bytes: Bytes) -> Result<(), StreamError> {
        let mut shared = self.shared.lock();
        if shared.cancelled {
            return Err(StreamError::Cancelled);
        }
        if !bytes.is_empty() {
            shared.queue.push_back(bytes);
        }
        shared.wake_consumer();
        Ok(())
    }

    fn finish(&mut self, outcome: Outcome) {
        self.terminated = true;
        let mut shared = self.shared.lock();
        shared.outcome = Some(outcome);
        shared.wake_consumer();
    }

    fn fail(&mut self, error: HandlerError) {
        if self.is_committed() {
            tracing::warn!(
                "handler error after the response head was committed: {}",
                error.message
            );
        } else {
            self.pending.status = error.status.unwrap_or(500);
            self.pending.set_header("content-type", JSON_CONTENT_TYPE);
        }
        self.commit();
        let _ = self.push(Bytes::from(error.to_json().to_string()));
        self.finish(Outcome::Failed);
    }
}

impl Drop for ResponseSink {
    fn drop(&mut self) {
        if !self.terminated {
            tracing::warn!("handler returned without send() or error()");
            self.fail(HandlerError::new("handler finished without sending a response"));
        }
    }
}

/// Caller-side half of a response.
pub struct ResponseStream {
    head: oneshot::Receiver<ResponseHead>,
    body: ResponseBody,
}

impl ResponseStream {
    /// Waits for the head to commit, then hands back head and body.
    pub async fn into_parts(self) -> (ResponseHead, ResponseBody) {
        let head = self
            .head
            .await
            .unwrap_or_else(|_| ResponseHead::with_status(500));
        (head, self.body)
    }

    /// Relays the whole response as protocol chunks: one head chunk carrying
    /// `options`, the body chunks, then a terminal chunk. Sending into a
    /// bounded channel applies the receiver's backpressure to the handler.
    pub async fn pump(
        self,
        request_id: &str,
        tx: &mpsc::Sender<ResponseChunk>,
    ) -> Result<(), StreamError> {
        let (head, mut body) = self.into_parts().await;
        tx.send(ResponseChunk::head(request_id, head))
            .await
            .map_err(|_| StreamError::Cancelled)?;

        while let Some(item) = body.next().await {
            let bytes = match item {
                Ok(bytes) => bytes,
                Err(never) => match never {},
            };
            tx.send(ResponseChunk::data(request_id, bytes))
                .await
                .map_err(|_| StreamError::Cancelled)?;
        }

        let failed = body.outcome() == Some(Outcome::Failed);
        tx.send(ResponseChunk::end(request_id, failed))
            .await
            .map_err(|_| StreamError::Cancelled)
    }
}

/// Body chunks in emission order. Dropping the body cancels the response:
/// the buffer is cleared and further `stream()` calls fail.
pub struct ResponseBody {
    shared: Arc<Mutex<Shared>>,
    drained: Arc<Notify>,
}

impl ResponseBody {
    pub fn outcome(&self) -> Option<Outcome> {
        self.shared.lock().outcome
    }

    pub fn cancel(&self) {
        {
            let mut shared = self.shared.lock();
            if shared.outcome.is_none() {
                shared.cancelled = true;
            }
            shared.queue.clear();
        }
        self.drained.notify_one();
    }
}

impl Stream for ResponseBody {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let mut shared = this.shared.lock();
        if let Some(bytes) = shared.queue.pop_front() {
            drop(shared);
            this.drained.notify_one();
            return Poll::Ready(Some(Ok(bytes)));
        }
        if shared.outcome.is_some() || shared.cancelled {
            return Poll::Ready(None);
        }
        shared.consumer = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl Drop for ResponseBody {
    fn drop(&mut self) {
        self.cancel();
    }
}
