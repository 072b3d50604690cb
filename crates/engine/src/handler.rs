use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::envelope::RequestEnvelope;
use crate::stream::{self, ResponseSink, ResponseStream};

/// Handler code running inside an isolate.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, request: RequestEnvelope, response: ResponseSink);
}

pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(RequestEnvelope, ResponseSink) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send,
{
    async fn call(&self, request: RequestEnvelope, response: ResponseSink) {
        (self.0)(request, response).await
    }
}

pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn Handler>
where
    F: Fn(RequestEnvelope, ResponseSink) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Runs `handler` on its own task and returns the caller side of its
/// response. A panicking handler drops its sink, which closes the response
/// with a 500.
pub fn dispatch(handler: Arc<dyn Handler>, request: RequestEnvelope) -> ResponseStream {
    let (sink, stream) = stream::channel();
    tokio::spawn(async move {
        handler.call(request, sink).await;
    });
    stream
}
