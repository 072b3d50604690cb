use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request};
use axum::response::Response;
use bytes::Bytes;
use engine::{REQUEST_ID_HEADER, RequestEnvelope, TransportKind};
use http_body_util::Full;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;

use crate::error::TransportError;
use crate::request::PARAMS_HEADER;
use crate::{AddressConfig, HEALTH_PATH, IsolateAddress, Target, Transport};

const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

// Hop-by-hop headers describe the inbound connection, not the request.
const SKIPPED_HEADERS: [&str; 4] = ["connection", "keep-alive", "transfer-encoding", "upgrade"];

/// Loopback HTTP to isolates listening on a local port. Redirects are
/// returned as-is, never followed.
pub struct HttpTransport {
    client: Client<HttpConnector, Full<Bytes>>,
    host: String,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::with_host("127.0.0.1")
    }

    pub fn with_host(host: impl Into<String>) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(30))
            .build(connector);
        Self {
            client,
            host: host.into(),
        }
    }

    fn build_request(
        &self,
        address: &IsolateAddress,
        envelope: RequestEnvelope,
    ) -> Result<Request<Full<Bytes>>, TransportError> {
        let method = Method::from_bytes(envelope.method.as_bytes())
            .map_err(|err| TransportError::request(&address.url, err))?;
        let uri = format!("{}{}", address.url, envelope.path_and_query());

        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in &envelope.headers {
            if SKIPPED_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }
        if envelope.header(REQUEST_ID_HEADER).is_none() {
            builder = builder.header(REQUEST_ID_HEADER, envelope.request_id.as_str());
        }
        if !envelope.params.is_empty() {
            let params = serde_json::to_string(&envelope.params)
                .map_err(|err| TransportError::request(&address.url, err))?;
            builder = builder.header(PARAMS_HEADER, params);
        }

        builder
            .body(Full::new(envelope.body))
            .map_err(|err| TransportError::request(&address.url, err))
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    fn create_address(&self, config: &AddressConfig) -> Result<IsolateAddress, TransportError> {
        let port = config.port.ok_or_else(|| TransportError::Address {
            kind: TransportKind::Http,
            detail: format!("{} without a port", config.name),
        })?;
        Ok(IsolateAddress {
            kind: TransportKind::Http,
            url: format!("http://{}:{}", self.host, port),
            target: Target::Port(port),
        })
    }

    async fn send(
        &self,
        address: &IsolateAddress,
        request: RequestEnvelope,
    ) -> Result<Response, TransportError> {
        let request = self.build_request(address, request)?;
        let response = self
            .client
            .request(request)
            .await
            .map_err(|err| TransportError::request(&address.url, err))?;
        Ok(response.map(Body::new))
    }

    async fn health_check(&self, address: &IsolateAddress) -> bool {
        let request = match Request::get(format!("{}{}", address.url, HEALTH_PATH))
            .body(Full::new(Bytes::new()))
        {
            Ok(request) => request,
            Err(_) => return false,
        };
        match tokio::time::timeout(HEALTH_TIMEOUT, self.client.request(request)).await {
            Ok(Ok(response)) => response.status().is_success(),
            Ok(Err(err)) => {
                tracing::trace!("Health check {} failed: {}", address, err);
                false
            }
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::http::{HeaderMap, StatusCode, Uri};
    use axum::response::IntoResponse;
    use axum::routing::get;
    use http_body_util::BodyExt;

    async fn start(app: Router) -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let port = listener.local_addr().expect("addr").port();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        port
    }

    fn address(transport: &HttpTransport, port: u16) -> IsolateAddress {
        transport
            .create_address(&AddressConfig {
                port: Some(port),
                name: "/test".to_string(),
            })
            .expect("address")
    }

    #[tokio::test]
    async fn forwards_requests_and_relays_redirects() {
        let app = Router::new()
            .route(HEALTH_PATH, get(|| async { "ok" }))
            .route(
                "/echo",
                axum::routing::post(|uri: Uri, headers: HeaderMap, body: Bytes| async move {
                    let marker = headers
                        .get("x-marker")
                        .and_then(|value| value.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    format!("{} {} {}", uri, marker, String::from_utf8_lossy(&body))
                }),
            )
            .route(
                "/moved",
                get(|| async { (StatusCode::TEMPORARY_REDIRECT, [("location", "/new")]).into_response() }),
            );
        let port = start(app).await;
        let transport = HttpTransport::new();
        let address = address(&transport, port);
        assert_eq!(address.url, format!("http://127.0.0.1:{}", port));
        assert!(transport.health_check(&address).await);

        let mut envelope = RequestEnvelope::new("POST", "/echo");
        envelope.query.push(("a".to_string(), "1".to_string()));
        envelope.headers.push(("x-marker".to_string(), "m".to_string()));
        envelope.body = Bytes::from("payload");
        let response = transport.send(&address, envelope).await.expect("send");
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.expect("body").to_bytes();
        assert_eq!(body, Bytes::from("/echo?a=1 m payload"));

        let response = transport
            .send(&address, RequestEnvelope::new("GET", "/moved"))
            .await
            .expect("redirect");
        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(response.headers()["location"], "/new");
    }

    #[tokio::test]
    async fn isolate_errors_are_responses() {
        let app = Router::new().route(
            "/fail",
            get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "down") }),
        );
        let port = start(app).await;
        let transport = HttpTransport::new();
        let response = transport
            .send(&address(&transport, port), RequestEnvelope::new("GET", "/fail"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn refused_connection_is_a_transport_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);

        let transport = HttpTransport::new();
        let address = address(&transport, port);
        assert!(!transport.health_check(&address).await);
        let err = transport
            .send(&address, RequestEnvelope::new("GET", "/"))
            .await
            .expect_err("refused");
        assert!(matches!(err, TransportError::Request { .. }));
    }

    #[test]
    fn address_requires_a_port() {
        let transport = HttpTransport::new();
        assert!(transport.create_address(&AddressConfig::default()).is_err());
    }
}
