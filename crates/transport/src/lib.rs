pub mod assemble;
pub mod error;
pub mod http;
pub mod pubsub;
pub mod request;
pub mod worker;

use std::time::Duration;

use async_trait::async_trait;
use axum::response::Response;
use engine::{REQUEST_ID_HEADER, RequestEnvelope, TransportKind, next_request_id};

pub use assemble::{assemble_response, response_from_head};
pub use error::TransportError;
pub use http::HttpTransport;
pub use pubsub::{Broker, LocalBroker, Message, PubSubTransport, health_subject};
pub use request::{DEFAULT_BODY_LIMIT, PARAMS_HEADER, envelope_from_request};
pub use worker::{WorkerEndpoint, WorkerHub, WorkerRequest, WorkerTransport};

/// Path every isolate answers with a 2xx once it is ready.
pub const HEALTH_PATH: &str = "/__healthcheck__";
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    Port(u16),
    Worker(String),
    Subject(String),
}

/// Where one isolate can be reached.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IsolateAddress {
    pub kind: TransportKind,
    pub url: String,
    pub target: Target,
}

impl IsolateAddress {
    pub fn port(&self) -> Option<u16> {
        match self.target {
            Target::Port(port) => Some(port),
            _ => None,
        }
    }
}

impl std::fmt::Display for IsolateAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.url)
    }
}

/// Inputs for a new address: the chosen port for loopback HTTP, and a
/// name (usually the route pattern) for worker and subject addresses.
#[derive(Debug, Clone, Default)]
pub struct AddressConfig {
    pub port: Option<u16>,
    pub name: String,
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    fn create_address(&self, config: &AddressConfig) -> Result<IsolateAddress, TransportError>;

    /// Fails only when the isolate cannot be reached.
    async fn send(
        &self,
        address: &IsolateAddress,
        request: RequestEnvelope,
    ) -> Result<Response, TransportError>;

    async fn health_check(&self, address: &IsolateAddress) -> bool;

    async fn wait_for_ready(
        &self,
        address: &IsolateAddress,
        timeout: Duration,
        interval: Duration,
    ) -> Result<(), TransportError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.health_check(address).await {
                return Ok(());
            }
            if tokio::time::Instant::now() + interval > deadline {
                return Err(TransportError::NotReady(address.url.clone()));
            }
            tokio::time::sleep(interval).await;
        }
    }
}

/// Gives the envelope a correlation id of its own for one call. The caller's
/// id stays visible to the isolate through the request id header.
pub(crate) fn correlate(request: &mut RequestEnvelope) -> String {
    let id = next_request_id();
    let previous = std::mem::replace(&mut request.request_id, id.clone());
    if request.header(REQUEST_ID_HEADER).is_none() {
        request.headers.push((REQUEST_ID_HEADER.to_string(), previous));
    }
    id
}

/// Characters allowed in worker ids and broker subjects.
pub(crate) fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .trim_matches('/')
        .chars()
        .map(|ch| match ch {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => ch,
            _ => '.',
        })
        .collect();
    if cleaned.is_empty() {
        "root".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Flaky {
        healthy_after: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Transport for Flaky {
        fn kind(&self) -> TransportKind {
            TransportKind::Http
        }

        fn create_address(&self, _config: &AddressConfig) -> Result<IsolateAddress, TransportError> {
            Ok(IsolateAddress {
                kind: TransportKind::Http,
                url: "flaky".to_string(),
                target: Target::Port(1),
            })
        }

        async fn send(
            &self,
            address: &IsolateAddress,
            _request: RequestEnvelope,
        ) -> Result<Response, TransportError> {
            Err(TransportError::Closed(address.url.clone()))
        }

        async fn health_check(&self, _address: &IsolateAddress) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst) + 1 >= self.healthy_after
        }
    }

    #[tokio::test]
    async fn wait_for_ready_polls_until_healthy() {
        let transport = Arc::new(Flaky {
            healthy_after: 3,
            calls: AtomicUsize::new(0),
        });
        let address = transport.create_address(&AddressConfig::default()).expect("address");
        transport
            .wait_for_ready(&address, Duration::from_secs(1), Duration::from_millis(5))
            .await
            .expect("ready");
        assert!(transport.health_check(&address).await);
    }

    #[tokio::test]
    async fn wait_for_ready_gives_up_and_names_the_address() {
        let transport = Flaky {
            healthy_after: usize::MAX,
            calls: AtomicUsize::new(0),
        };
        let address = transport.create_address(&AddressConfig::default()).expect("address");
        let started = std::time::Instant::now();
        let err = transport
            .wait_for_ready(&address, Duration::from_millis(50), Duration::from_millis(10))
            .await
            .expect_err("never healthy");
        assert_eq!(err.to_string(), "timed out waiting for isolate at flaky");
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn correlation_ids_are_fresh_and_keep_the_client_id() {
        let mut request = RequestEnvelope::new("GET", "/");
        request.request_id = "client-id".to_string();
        let id = correlate(&mut request);
        assert_ne!(id, "client-id");
        assert_eq!(request.request_id, id);
        assert_eq!(request.header(REQUEST_ID_HEADER), Some("client-id"));

        let again = correlate(&mut request);
        assert_ne!(again, id);
        assert_eq!(request.header(REQUEST_ID_HEADER), Some("client-id"));
    }

    #[test]
    fn sanitizes_pattern_names() {
        assert_eq!(sanitize_name("/users/:id"), "users..id");
        assert_eq!(sanitize_name("/"), "root");
    }
}
