use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::Request;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use engine::{Handler, HandlerError, dispatch};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use transport::{DEFAULT_BODY_LIMIT, HEALTH_PATH, envelope_from_request, response_from_head};

use crate::metadata::{StartupError, StartupMetadata};
use crate::module::{ModuleLoader, ModuleSource};

/// HTTP surface of one isolate: the health endpoint plus every other path
/// dispatched to `handler`.
pub fn host_router(handler: Arc<dyn Handler>) -> Router {
    Router::new()
        .route(HEALTH_PATH, get(|| async { "ok" }))
        .fallback(move |request: Request| invoke(handler.clone(), request))
}

async fn invoke(handler: Arc<dyn Handler>, request: Request) -> Response {
    let envelope = match envelope_from_request(request, DEFAULT_BODY_LIMIT).await {
        Ok(envelope) => envelope,
        Err(err) => {
            let error = HandlerError::new(format!("failed to read request body: {}", err));
            return (
                StatusCode::BAD_REQUEST,
                axum::Json(error.to_json()),
            )
                .into_response();
        }
    };
    tracing::debug!("{} {} ({})", envelope.method, envelope.path, envelope.request_id);

    let (head, body) = dispatch(handler, envelope).into_parts().await;
    response_from_head(&head, Body::from_stream(body))
}

pub async fn bind(port: u16) -> std::io::Result<TcpListener> {
    TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, port))).await
}

/// An isolate host running on the current runtime.
pub struct HostHandle {
    port: u16,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl HostHandle {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Resolves once the server has stopped.
    pub async fn wait(&mut self) {
        if let Err(err) = (&mut self.task).await {
            tracing::warn!("Isolate host on port {} ended abnormally: {}", self.port, err);
        }
    }

    /// Stops accepting connections and closes idle ones.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for HostHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Binds `127.0.0.1:port` and serves `handler` until shut down.
pub async fn spawn_host(port: u16, handler: Arc<dyn Handler>) -> std::io::Result<HostHandle> {
    let listener = bind(port).await?;
    let port = listener.local_addr()?.port();
    let (tx, rx) = oneshot::channel::<()>();
    let app = host_router(handler);

    let task = tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = rx.await;
        });
        if let Err(err) = server.await {
            tracing::warn!("Isolate host on port {} failed: {}", port, err);
        }
    });
    tracing::debug!("Isolate host listening on 127.0.0.1:{}", port);

    Ok(HostHandle {
        port,
        shutdown: Some(tx),
        task,
    })
}

/// Loads the handler `metadata` names and serves it on `port`.
pub async fn serve_startup(
    metadata: &StartupMetadata,
    port: u16,
    loader: &ModuleLoader,
) -> Result<HostHandle, StartupError> {
    let handler = loader.handler_for(metadata).await;
    let host = spawn_host(port, handler)
        .await
        .map_err(|err| StartupError::Bind(format!("port {}: {}", port, err)))?;
    tracing::info!("Isolate for {} serving on port {}", metadata.pattern, host.port());
    Ok(host)
}

/// Entry point of a launched child: boots from the metadata and port its
/// parent put in the environment and serves until the process is stopped.
pub async fn serve_from_env(source: Arc<dyn ModuleSource>) -> Result<(), StartupError> {
    let (metadata, port) = StartupMetadata::from_env()?;
    let mut host = serve_startup(&metadata, port, &ModuleLoader::new(source)).await?;
    host.wait().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine::{RequestEnvelope, ResponseSink, handler_fn};
    use http_body_util::BodyExt;
    use transport::{AddressConfig, HttpTransport, Transport};

    #[tokio::test]
    async fn serves_health_and_handler_responses() {
        let handler = handler_fn(|request: RequestEnvelope, mut response: ResponseSink| async move {
            let id = request.params.get("id").cloned().unwrap_or_default();
            response.status(201).header("x-user", id);
            let _ = response.stream("user ").await;
            response.send(request.query_value("tab").unwrap_or("none").to_string());
        });
        let mut host = spawn_host(0, handler).await.expect("host");

        let transport = HttpTransport::new();
        let address = transport
            .create_address(&AddressConfig {
                port: Some(host.port()),
                name: "/users/:id".to_string(),
            })
            .expect("address");
        assert!(transport.health_check(&address).await);

        let mut envelope = RequestEnvelope::new("GET", "/users/42");
        envelope.query.push(("tab".to_string(), "posts".to_string()));
        envelope.merge_params(&std::collections::BTreeMap::from([(
            "id".to_string(),
            "42".to_string(),
        )]));
        let response = transport.send(&address, envelope).await.expect("send");
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()["x-user"], "42");
        let body = response.into_body().collect().await.expect("body").to_bytes();
        assert_eq!(body.as_ref(), b"user posts");

        host.shutdown();
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while !host.is_finished() {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("host stops");
        assert!(!transport.health_check(&address).await);
    }

    #[tokio::test]
    async fn handler_errors_become_json_bodies() {
        let handler = handler_fn(|_request: RequestEnvelope, response: ResponseSink| async move {
            response.error(HandlerError::new("nope").with_status(418));
        });
        let router = host_router(handler);
        let response = call_router(router, "/anything").await;
        assert_eq!(response.status().as_u16(), 418);
        let body = response.into_body().collect().await.expect("body").to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(json["error"]["message"], "nope");
    }

    async fn call_router(router: Router, path: &str) -> Response {
        let host = spawn_router(router).await;
        let transport = HttpTransport::new();
        let address = transport
            .create_address(&AddressConfig {
                port: Some(host),
                name: path.to_string(),
            })
            .expect("address");
        transport
            .send(&address, RequestEnvelope::new("GET", path))
            .await
            .expect("send")
    }

    async fn spawn_router(router: Router) -> u16 {
        let listener = bind(0).await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        port
    }

    #[tokio::test]
    async fn boots_from_startup_metadata() {
        use crate::module::{Module, StaticModuleSource};

        let source = StaticModuleSource::new().with_module(
            Module::new("api/hello.ts", "").with_handler(handler_fn(
                |_request: RequestEnvelope, response: ResponseSink| async move {
                    response.send("hello");
                },
            )),
        );
        let loader = ModuleLoader::new(Arc::new(source));
        let metadata = StartupMetadata {
            import: "api/hello.ts".to_string(),
            pattern: "/api/hello".to_string(),
            ..StartupMetadata::default()
        };
        let mut host = serve_startup(&metadata, 0, &loader).await.expect("boot");

        let transport = HttpTransport::new();
        let address = transport
            .create_address(&AddressConfig {
                port: Some(host.port()),
                name: metadata.pattern.clone(),
            })
            .expect("address");
        let response = transport
            .send(&address, RequestEnvelope::new("GET", "/api/hello"))
            .await
            .expect("send");
        let body = response.into_body().collect().await.expect("body").to_bytes();
        assert_eq!(body.as_ref(), b"hello");

        let missing = StartupMetadata {
            import: "api/missing.ts".to_string(),
            ..metadata.clone()
        };
        let mut failed = serve_startup(&missing, 0, &loader).await.expect("boot");
        let address = transport
            .create_address(&AddressConfig {
                port: Some(failed.port()),
                name: missing.pattern.clone(),
            })
            .expect("address");
        let response = transport
            .send(&address, RequestEnvelope::new("GET", "/api/hello"))
            .await
            .expect("send");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        host.shutdown();
        failed.shutdown();
        tokio::time::timeout(std::time::Duration::from_secs(5), host.wait())
            .await
            .expect("stopped");
    }
}
