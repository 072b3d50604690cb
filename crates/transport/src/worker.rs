//! In-process workers. Each request reaches the worker together with its own
//! bounded response channel, so a caller that stops reading only stalls its
//! own response.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::response::Response;
use engine::{RequestEnvelope, ResponseChunk, TransportKind};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::assemble::assemble_response;
use crate::error::TransportError;
use crate::{AddressConfig, IsolateAddress, Target, Transport, correlate, sanitize_name};

const QUEUE_DEPTH: usize = 64;
const RESPONSE_DEPTH: usize = 16;

/// One call delivered to a worker.
pub struct WorkerRequest {
    pub envelope: RequestEnvelope,
    pub responses: mpsc::Sender<ResponseChunk>,
}

/// The worker's side of the connection.
pub struct WorkerEndpoint {
    pub id: String,
    pub requests: mpsc::Receiver<WorkerRequest>,
}

#[derive(Default)]
pub struct WorkerHub {
    workers: Mutex<HashMap<String, mpsc::Sender<WorkerRequest>>>,
}

impl WorkerHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a worker id, replacing any previous worker with that id.
    pub fn register(&self, id: &str) -> WorkerEndpoint {
        let (inbound_tx, inbound_rx) = mpsc::channel(QUEUE_DEPTH);
        self.workers.lock().insert(id.to_string(), inbound_tx);
        WorkerEndpoint {
            id: id.to_string(),
            requests: inbound_rx,
        }
    }

    pub fn remove(&self, id: &str) -> bool {
        self.workers.lock().remove(id).is_some()
    }

    pub fn is_alive(&self, id: &str) -> bool {
        self.workers
            .lock()
            .get(id)
            .map(|inbound| !inbound.is_closed())
            .unwrap_or(false)
    }

    fn inbound(&self, id: &str) -> Option<mpsc::Sender<WorkerRequest>> {
        self.workers.lock().get(id).cloned()
    }
}

pub struct WorkerTransport {
    hub: Arc<WorkerHub>,
}

impl WorkerTransport {
    pub fn new(hub: Arc<WorkerHub>) -> Self {
        Self { hub }
    }

    pub fn hub(&self) -> &Arc<WorkerHub> {
        &self.hub
    }
}

#[async_trait]
impl Transport for WorkerTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Worker
    }

    fn create_address(&self, config: &AddressConfig) -> Result<IsolateAddress, TransportError> {
        let id = match config.port {
            Some(port) => format!("{}-{}", sanitize_name(&config.name), port),
            None => sanitize_name(&config.name),
        };
        Ok(IsolateAddress {
            kind: TransportKind::Worker,
            url: format!("worker://{}", id),
            target: Target::Worker(id),
        })
    }

    async fn send(
        &self,
        address: &IsolateAddress,
        request: RequestEnvelope,
    ) -> Result<Response, TransportError> {
        let Target::Worker(id) = &address.target else {
            return Err(TransportError::Address {
                kind: TransportKind::Worker,
                detail: address.url.clone(),
            });
        };
        let inbound = self
            .hub
            .inbound(id)
            .ok_or_else(|| TransportError::NoResponders(address.url.clone()))?;

        let mut envelope = request;
        correlate(&mut envelope);
        let (tx, rx) = mpsc::channel(RESPONSE_DEPTH);
        let request = WorkerRequest {
            envelope,
            responses: tx,
        };
        if inbound.send(request).await.is_err() {
            return Err(TransportError::Closed(address.url.clone()));
        }
        assemble_response(rx, &address.url).await
    }

    async fn health_check(&self, address: &IsolateAddress) -> bool {
        match &address.target {
            Target::Worker(id) => self.hub.is_alive(id),
            _ => false,
        }
    }
}
