//! Where the proxy learns which file serves a path.

use async_trait::async_trait;
use resolver::{FileMatch, FileResolver, ResolveError};

use crate::error::ProxyError;

#[async_trait]
pub trait MetadataSource: Send + Sync {
    async fn lookup(&self, path: &str) -> Result<FileMatch, ProxyError>;
}

/// Resolves in process against a file backend.
pub struct ResolverSource {
    resolver: FileResolver,
}

impl ResolverSource {
    pub fn new(resolver: FileResolver) -> Self {
        Self { resolver }
    }

    pub fn resolver(&self) -> &FileResolver {
        &self.resolver
    }
}

#[async_trait]
impl MetadataSource for ResolverSource {
    async fn lookup(&self, path: &str) -> Result<FileMatch, ProxyError> {
        Ok(self.resolver.resolve_path(path).await?)
    }
}

/// Asks a remote resolver endpoint (`GET <endpoint>?path=<path>`), such as
/// another proxy's `/__resolve__`.
pub struct HttpMetadataSource {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpMetadataSource {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl MetadataSource for HttpMetadataSource {
    async fn lookup(&self, path: &str) -> Result<FileMatch, ProxyError> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("path", path)])
            .send()
            .await
            .map_err(|err| ResolveError::Io(format!("{}: {}", self.endpoint, err)))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|err| ResolveError::Io(format!("{}: {}", self.endpoint, err)))?;

        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ResolveError::NotFound(path.to_string()).into());
        }
        if !status.is_success() {
            return Err(ResolveError::Backend {
                status: status.as_u16(),
                message: error_message(&body),
            }
            .into());
        }

        serde_json::from_slice(&body).map_err(|err| {
            tracing::warn!("Metadata for {} from {} is malformed: {}", path, self.endpoint, err);
            ProxyError::Metadata(err.to_string())
        })
    }
}

fn error_message(body: &[u8]) -> String {
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|value| value["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| String::from_utf8_lossy(body).trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use axum::Router;
    use axum::extract::Query;
    use axum::http::StatusCode;
    use axum::routing::get;
    use resolver::{MemoryBackend, ResolverOptions};
    use std::collections::HashMap;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("serve");
        });
        format!("http://{}/__resolve__", addr)
    }

    #[tokio::test]
    async fn resolver_source_matches_dynamic_files() {
        let backend = MemoryBackend::new().with_file("users/[id].ts", "export default 1");
        let source = ResolverSource::new(FileResolver::new(Arc::new(backend), ResolverOptions::default()));
        let found = source.lookup("/users/42").await.expect("match");
        assert_eq!(found.match_path, "/users/[id]");
        assert!(found.redirect);

        let err = source.lookup("/posts/1").await.expect_err("missing");
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn http_source_reads_remote_matches_and_errors() {
        let router = Router::new().route(
            "/__resolve__",
            get(|Query(query): Query<HashMap<String, String>>| async move {
                match query.get("path").map(String::as_str) {
                    Some("/users/42") => (
                        StatusCode::OK,
                        r#"{"content":"x","matchPath":"/users/[id]","path":"users/[id].ts","params":{"id":"42"},"variables":{},"redirect":true}"#,
                    ),
                    Some("/garbled") => (StatusCode::OK, "<html>"),
                    Some("/private") => (StatusCode::FORBIDDEN, r#"{"error":{"message":"no access"}}"#),
                    _ => (StatusCode::NOT_FOUND, r#"{"error":{"message":"missing"}}"#),
                }
            }),
        );
        let source = HttpMetadataSource::new(serve(router).await);

        let found = source.lookup("/users/42").await.expect("match");
        assert_eq!(found.path, "users/[id].ts");
        assert_eq!(found.params.get("id").map(String::as_str), Some("42"));

        let err = source.lookup("/nope").await.expect_err("missing");
        assert_eq!(err.status(), StatusCode::NOT_FOUND);

        let err = source.lookup("/private").await.expect_err("forbidden");
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
        assert!(err.to_string().contains("no access"));

        let err = source.lookup("/garbled").await.expect_err("malformed");
        assert!(matches!(err, ProxyError::Metadata(_)));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
