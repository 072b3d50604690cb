use std::sync::Arc;

use axum::extract::{Query, Request, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;

use crate::proxy::RequestProxy;

/// Serves the resolver's file match for `?path=` as JSON.
pub const RESOLVE_PATH: &str = "/__resolve__";

pub fn app_router(proxy: Arc<RequestProxy>) -> Router {
    Router::new()
        .route(RESOLVE_PATH, get(resolve_metadata))
        .fallback(handle_request)
        .with_state(proxy)
}

async fn handle_request(State(proxy): State<Arc<RequestProxy>>, request: Request) -> Response {
    proxy.handle(request).await
}

#[derive(Debug, Deserialize)]
struct ResolveQuery {
    path: String,
}

async fn resolve_metadata(
    State(proxy): State<Arc<RequestProxy>>,
    Query(query): Query<ResolveQuery>,
) -> Response {
    match proxy.metadata().lookup(&query.path).await {
        Ok(found) => Json(found).into_response(),
        Err(err) => err.into_response(),
    }
}
