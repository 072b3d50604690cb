//! Request-reply over a message broker. Each isolate subscribes to its own
//! subject; the caller publishes the request envelope with a private reply
//! inbox and reads response chunks from it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::response::Response;
use bytes::Bytes;
use engine::{RequestEnvelope, ResponseChunk, TransportKind};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::assemble::assemble_response;
use crate::error::TransportError;
use crate::{AddressConfig, IsolateAddress, Target, Transport, correlate, sanitize_name};

const SUBSCRIPTION_DEPTH: usize = 64;
const HEALTH_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct Message {
    pub subject: String,
    pub reply: Option<String>,
    pub payload: Bytes,
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Fails with [`TransportError::NoResponders`] when nobody listens.
    async fn publish(
        &self,
        subject: &str,
        reply: Option<String>,
        payload: Bytes,
    ) -> Result<(), TransportError>;

    async fn subscribe(&self, subject: &str) -> Result<mpsc::Receiver<Message>, TransportError>;
}

/// Broker living inside this process.
#[derive(Default)]
pub struct LocalBroker {
    subscribers: Mutex<HashMap<String, Vec<mpsc::Sender<Message>>>>,
}

impl LocalBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl Broker for LocalBroker {
    async fn publish(
        &self,
        subject: &str,
        reply: Option<String>,
        payload: Bytes,
    ) -> Result<(), TransportError> {
        let targets: Vec<mpsc::Sender<Message>> = {
            let mut subscribers = self.subscribers.lock();
            let Some(list) = subscribers.get_mut(subject) else {
                return Err(TransportError::NoResponders(subject.to_string()));
            };
            list.retain(|tx| !tx.is_closed());
            let targets = list.clone();
            if list.is_empty() {
                subscribers.remove(subject);
            }
            targets
        };
        if targets.is_empty() {
            return Err(TransportError::NoResponders(subject.to_string()));
        }

        let message = Message {
            subject: subject.to_string(),
            reply,
            payload,
        };
        let mut delivered = false;
        for target in targets {
            delivered |= target.send(message.clone()).await.is_ok();
        }
        if delivered {
            Ok(())
        } else {
            Err(TransportError::NoResponders(subject.to_string()))
        }
    }

    async fn subscribe(&self, subject: &str) -> Result<mpsc::Receiver<Message>, TransportError> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_DEPTH);
        let mut subscribers = self.subscribers.lock();
        // Reply inboxes are one-shot; forget the ones whose reader is gone.
        subscribers.retain(|_, list| {
            list.retain(|tx| !tx.is_closed());
            !list.is_empty()
        });
        subscribers.entry(subject.to_string()).or_default().push(tx);
        Ok(rx)
    }
}

pub fn health_subject(subject: &str) -> String {
    format!("_HEALTH.{}", subject)
}

fn inbox(request_id: &str) -> String {
    format!("_INBOX.{}", request_id)
}

pub struct PubSubTransport {
    broker: Arc<dyn Broker>,
    prefix: String,
}

impl PubSubTransport {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            prefix: "isolate".to_string(),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }
}

#[async_trait]
impl Transport for PubSubTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::PubSub
    }

    fn create_address(&self, config: &AddressConfig) -> Result<IsolateAddress, TransportError> {
        let mut subject = format!("{}.{}", self.prefix, sanitize_name(&config.name));
        if let Some(port) = config.port {
            subject.push_str(&format!(".{}", port));
        }
        Ok(IsolateAddress {
            kind: TransportKind::PubSub,
            url: format!("pubsub://{}", subject),
            target: Target::Subject(subject),
        })
    }

    async fn send(
        &self,
        address: &IsolateAddress,
        request: RequestEnvelope,
    ) -> Result<Response, TransportError> {
        let Target::Subject(subject) = &address.target else {
            return Err(TransportError::Address {
                kind: TransportKind::PubSub,
                detail: address.url.clone(),
            });
        };

        let mut request = request;
        let reply = inbox(&correlate(&mut request));
        let mut replies = self.broker.subscribe(&reply).await?;
        let payload = serde_json::to_vec(&request).map_err(|err| TransportError::Protocol {
            address: address.url.clone(),
            message: err.to_string(),
        })?;
        self.broker
            .publish(subject, Some(reply), Bytes::from(payload))
            .await?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_DEPTH);
        let url = address.url.clone();
        tokio::spawn(async move {
            while let Some(message) = replies.recv().await {
                let chunk = match serde_json::from_slice::<ResponseChunk>(&message.payload) {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        tracing::warn!("Malformed chunk from {}: {}", url, err);
                        break;
                    }
                };
                let terminal = chunk.is_terminal();
                if tx.send(chunk).await.is_err() || terminal {
                    break;
                }
            }
        });

        assemble_response(rx, &address.url).await
    }

    async fn health_check(&self, address: &IsolateAddress) -> bool {
        let Target::Subject(subject) = &address.target else {
            return false;
        };
        let reply = inbox(&engine::next_request_id());
        let Ok(mut replies) = self.broker.subscribe(&reply).await else {
            return false;
        };
        if self
            .broker
            .publish(&health_subject(subject), Some(reply), Bytes::new())
            .await
            .is_err()
        {
            return false;
        }
        matches!(
            tokio::time::timeout(HEALTH_TIMEOUT, replies.recv()).await,
            Ok(Some(_))
        )
    }
}
