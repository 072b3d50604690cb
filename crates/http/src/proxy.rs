//! Entry point for every inbound request: resolve the route, make sure an
//! isolate serves it, forward the request and relay whatever comes back.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use engine::envelope::parse_query;
use engine::{BUNDLE_CONTENT_TYPE, BundleOptions, Bundler, RuntimeConfig};
use pool::{IsolateManager, SpawnSpec};
use resolver::{FileMatch, RoutePattern};
use transport::{DEFAULT_BODY_LIMIT, PARAMS_HEADER, envelope_from_request};

use crate::error::ProxyError;
use crate::metadata::MetadataSource;
use crate::routes::{RouteHit, RouteTable};

#[derive(Debug, Clone)]
pub struct ProxyOptions {
    /// Route origin recorded in every pattern (e.g. `local` or `owner/repo`).
    pub origin: String,
    /// Directory under the source root holding the functions.
    pub functions_dir: String,
    /// Directory entrypoint name, dropped from patterns.
    pub entrypoint: String,
    /// Working directory handed to isolates.
    pub cwd: Option<String>,
    /// Variables handed to every isolate, below the file's own.
    pub variables: BTreeMap<String, String>,
    /// Bound on the round trip to an isolate, up to its response head.
    pub request_timeout: Duration,
    /// Modules a bundle request may keep external. Empty allows any.
    pub shared_allowlist: Vec<String>,
    pub body_limit: usize,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            origin: "local".to_string(),
            functions_dir: String::new(),
            entrypoint: engine::config::DEFAULT_ENTRYPOINT.to_string(),
            cwd: None,
            variables: BTreeMap::new(),
            request_timeout: Duration::from_secs(30),
            shared_allowlist: Vec::new(),
            body_limit: DEFAULT_BODY_LIMIT,
        }
    }
}

impl ProxyOptions {
    pub fn from_runtime(config: &RuntimeConfig) -> Self {
        Self {
            origin: config.origin(),
            functions_dir: config.functions_dir(),
            entrypoint: config.entrypoint(),
            cwd: Some(config.source_root().to_string_lossy().to_string()),
            variables: config.variables(),
            request_timeout: config.request_timeout(),
            shared_allowlist: config.shared_allowlist(),
            body_limit: DEFAULT_BODY_LIMIT,
        }
    }
}

pub struct RequestProxy {
    options: ProxyOptions,
    metadata: Arc<dyn MetadataSource>,
    manager: IsolateManager,
    bundler: Arc<dyn Bundler>,
    routes: RouteTable,
}

impl RequestProxy {
    pub fn new(
        options: ProxyOptions,
        metadata: Arc<dyn MetadataSource>,
        manager: IsolateManager,
        bundler: Arc<dyn Bundler>,
    ) -> Self {
        Self {
            options,
            metadata,
            manager,
            bundler,
            routes: RouteTable::new(),
        }
    }

    pub fn options(&self) -> &ProxyOptions {
        &self.options
    }

    pub fn manager(&self) -> &IsolateManager {
        &self.manager
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataSource> {
        &self.metadata
    }

    /// Forgets resolved routes and marks every isolate stale, so the next
    /// request for each route re-resolves and upgrades.
    pub fn invalidate(&self) {
        self.routes.clear();
        self.manager.invalidate();
    }

    pub fn shutdown(&self) {
        self.manager.shutdown();
    }

    pub async fn handle(&self, request: Request) -> Response {
        match self.try_handle(request).await {
            Ok(response) => response,
            Err(err) => err.into_response(),
        }
    }

    async fn try_handle(&self, mut request: Request) -> Result<Response, ProxyError> {
        let query = parse_query(request.uri().query().unwrap_or_default());
        let bundle = query_flag(&query, "bundle");
        let bust = query_flag(&query, "bust");
        let source_path = source_path(&self.options, request.uri().path());
        tracing::debug!("{} {} -> {}", request.method(), request.uri(), source_path);

        let route = self.route_for(&source_path, bundle || bust).await?;
        if bundle {
            return self.bundle(&route, &query).await;
        }

        let address = self
            .manager
            .ensure(&route.pattern, self.spawn_spec(&route.file), bust)
            .await?;

        // Route parameters are the proxy's to set, never the client's.
        request.headers_mut().remove(PARAMS_HEADER);
        let mut envelope = envelope_from_request(request, self.options.body_limit)
            .await
            .map_err(|err| ProxyError::Body(err.to_string()))?;
        envelope.merge_params(&route.params);

        let transport = self.manager.transport();
        let sent = tokio::time::timeout(
            self.options.request_timeout,
            transport.send(&address, envelope),
        )
        .await;
        let err = match sent {
            Ok(Ok(response)) => return Ok(response),
            Ok(Err(err)) => ProxyError::Transport(err),
            Err(_) => ProxyError::Timeout {
                address: address.url.clone(),
                timeout: self.options.request_timeout,
            },
        };
        if self.manager.evict_address(&route.pattern, &address) {
            tracing::warn!("Evicted isolate for {} after: {}", route.pattern, err);
        }
        Err(err)
    }

    async fn route_for(&self, source_path: &str, trust: bool) -> Result<RouteHit, ProxyError> {
        if let Some(hit) = self.routes.lookup(source_path, trust) {
            return Ok(hit);
        }

        let file = self.metadata.lookup(source_path).await?;
        let pattern = RoutePattern::from_match(&self.options.origin, &file, &self.options.entrypoint);
        let mut params = pattern.matches(source_path).unwrap_or_default();
        params.extend(file.params.clone());
        tracing::debug!("Resolved {} to {} ({})", source_path, pattern, file.path);

        self.routes.register(pattern.clone(), file.clone(), source_path);
        Ok(RouteHit {
            pattern,
            params,
            file,
        })
    }

    fn spawn_spec(&self, file: &FileMatch) -> SpawnSpec {
        let mut variables = self.options.variables.clone();
        variables.extend(file.variables.clone());
        SpawnSpec {
            import: file.path.clone(),
            params: file.params.clone(),
            variables,
            cwd: self.options.cwd.clone(),
            manifest: None,
        }
    }

    async fn bundle(&self, route: &RouteHit, query: &[(String, String)]) -> Result<Response, ProxyError> {
        let shared = query
            .iter()
            .filter(|(key, _)| key == "shared")
            .flat_map(|(_, value)| value.split(','))
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .filter(|name| {
                self.options.shared_allowlist.is_empty()
                    || self.options.shared_allowlist.iter().any(|allowed| allowed.as_str() == *name)
            })
            .map(str::to_string)
            .collect();

        let code = self
            .bundler
            .bundle(&route.file.path, &route.file.content, &BundleOptions { shared })
            .await?;

        let mut response = (StatusCode::OK, Body::from(code)).into_response();
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(BUNDLE_CONTENT_TYPE),
        );
        Ok(response)
    }
}

/// Request path under the functions directory, with a leading slash.
fn source_path(options: &ProxyOptions, request_path: &str) -> String {
    let segments = std::iter::once(options.functions_dir.as_str())
        .chain(request_path.split('/'))
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>();
    format!("/{}", segments.join("/"))
}

fn query_flag(query: &[(String, String)], name: &str) -> bool {
    query
        .iter()
        .any(|(key, value)| key == name && matches!(value.as_str(), "" | "1" | "true"))
}
