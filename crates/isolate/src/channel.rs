use std::sync::Arc;

use bytes::Bytes;
use engine::{Handler, RequestEnvelope, ResponseChunk, dispatch};
use tokio::sync::mpsc;
use transport::{Broker, TransportError, WorkerEndpoint, WorkerRequest, health_subject};

const CHUNK_DEPTH: usize = 16;

/// Serves requests arriving on an in-process worker endpoint until the hub
/// drops it. Each request runs on its own task.
pub async fn serve_worker(mut endpoint: WorkerEndpoint, handler: Arc<dyn Handler>) {
    tracing::debug!("Worker {} started", endpoint.id);
    while let Some(WorkerRequest { envelope, responses }) = endpoint.requests.recv().await {
        let handler = handler.clone();
        tokio::spawn(async move {
            let request_id = envelope.request_id.clone();
            if dispatch(handler, envelope)
                .pump(&request_id, &responses)
                .await
                .is_err()
            {
                tracing::debug!("Response {} abandoned by caller", request_id);
            }
        });
    }
    tracing::debug!("Worker {} stopped", endpoint.id);
}

/// Serves request envelopes published on `subject` and answers health checks
/// on its health subject. Returns when the broker closes both subscriptions.
pub async fn serve_subject(
    broker: Arc<dyn Broker>,
    subject: &str,
    handler: Arc<dyn Handler>,
) -> Result<(), TransportError> {
    let mut requests = broker.subscribe(subject).await?;
    let mut health = broker.subscribe(&health_subject(subject)).await?;
    tracing::debug!("Serving subject {}", subject);

    loop {
        tokio::select! {
            message = requests.recv() => {
                let Some(message) = message else { break };
                let Some(reply) = message.reply else {
                    tracing::warn!("Request on {} has no reply subject", subject);
                    continue;
                };
                let request: RequestEnvelope = match serde_json::from_slice(&message.payload) {
                    Ok(request) => request,
                    Err(err) => {
                        tracing::warn!("Malformed request on {}: {}", subject, err);
                        continue;
                    }
                };
                tokio::spawn(reply_with(broker.clone(), reply, handler.clone(), request));
            }
            message = health.recv() => {
                let Some(message) = message else { break };
                if let Some(reply) = message.reply {
                    let _ = broker.publish(&reply, None, Bytes::from_static(b"ok")).await;
                }
            }
        }
    }
    Ok(())
}

async fn reply_with(
    broker: Arc<dyn Broker>,
    reply: String,
    handler: Arc<dyn Handler>,
    request: RequestEnvelope,
) {
    let request_id = request.request_id.clone();
    let (tx, mut rx) = mpsc::channel::<ResponseChunk>(CHUNK_DEPTH);
    let stream = dispatch(handler, request);
    let id = request_id.clone();
    let pump = tokio::spawn(async move { stream.pump(&id, &tx).await });

    while let Some(chunk) = rx.recv().await {
        let payload = match serde_json::to_vec(&chunk) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!("Failed to encode chunk for {}: {}", request_id, err);
                break;
            }
        };
        if let Err(err) = broker.publish(&reply, None, Bytes::from(payload)).await {
            tracing::debug!("Reply for {} dropped: {}", request_id, err);
            break;
        }
    }
    drop(rx);
    let _ = pump.await;
}
