use axum::body::Body;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use engine::{ResponseChunk, ResponseHead};
use tokio::sync::mpsc;

use crate::error::TransportError;

/// Builds the outer response for a committed head. Headers that are not
/// valid HTTP are dropped with a warning.
pub fn response_from_head(head: &ResponseHead, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() =
        StatusCode::from_u16(head.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    for (name, value) in &head.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                response.headers_mut().append(name, value);
            }
            _ => tracing::warn!("Dropping invalid response header {}", name),
        }
    }

    if let Some(text) = head.status_text.as_deref() {
        if let Ok(reason) = hyper::ext::ReasonPhrase::try_from(text.as_bytes().to_vec()) {
            response.extensions_mut().insert(reason);
        }
    }
    response
}

struct Reassembly {
    chunks: mpsc::Receiver<ResponseChunk>,
    pending: Option<Bytes>,
    finished: bool,
    address: String,
}

/// Turns a chunk channel into a response. The first chunk must carry the
/// head; the body then streams until a terminal chunk arrives. A channel that
/// closes before the terminal chunk aborts the body.
pub async fn assemble_response(
    mut chunks: mpsc::Receiver<ResponseChunk>,
    address: &str,
) -> Result<Response, TransportError> {
    let first = chunks
        .recv()
        .await
        .ok_or_else(|| TransportError::Closed(address.to_string()))?;
    let head = first.options.clone().unwrap_or_default();

    let state = Reassembly {
        chunks,
        pending: (!first.chunk.is_empty()).then(|| first.chunk.clone()),
        finished: first.is_terminal(),
        address: address.to_string(),
    };

    let body = futures_util::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(bytes) = state.pending.take() {
                return Some((Ok(bytes), state));
            }
            if state.finished {
                return None;
            }
            match state.chunks.recv().await {
                Some(chunk) => {
                    state.finished = chunk.is_terminal();
                    if chunk.error {
                        tracing::debug!("Isolate at {} ended response with error", state.address);
                    }
                    if !chunk.chunk.is_empty() {
                        state.pending = Some(chunk.chunk);
                    }
                }
                None => {
                    state.finished = true;
                    let err = std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("isolate at {} closed the response early", state.address),
                    );
                    return Some((Err(err), state));
                }
            }
        }
    });

    Ok(response_from_head(&head, Body::from_stream(body)))
}
