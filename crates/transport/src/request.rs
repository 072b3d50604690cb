use std::collections::BTreeMap;

use axum::body::Body;
use axum::http::Request;
use engine::{REQUEST_ID_HEADER, RequestEnvelope, next_request_id};

/// Carries resolved route parameters across the loopback HTTP hop as JSON.
pub const PARAMS_HEADER: &str = "x-route-params";

pub const DEFAULT_BODY_LIMIT: usize = 16 * 1024 * 1024;

/// Reads an inbound request into an envelope, keeping an existing request
/// id and any forwarded route parameters.
pub async fn envelope_from_request(
    request: Request<Body>,
    body_limit: usize,
) -> Result<RequestEnvelope, axum::Error> {
    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, body_limit).await?;

    let headers: Vec<(String, String)> = parts
        .headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).to_string(),
            )
        })
        .collect();

    let mut envelope = RequestEnvelope::new(parts.method.as_str(), parts.uri.path());
    if let Some(id) = envelope_header(&headers, REQUEST_ID_HEADER) {
        envelope.request_id = id.to_string();
    } else {
        envelope.request_id = next_request_id();
    }
    if let Some(raw) = envelope_header(&headers, PARAMS_HEADER) {
        match serde_json::from_str::<BTreeMap<String, String>>(raw) {
            Ok(params) => envelope.params = params,
            Err(err) => tracing::debug!("Ignoring malformed {} header: {}", PARAMS_HEADER, err),
        }
    }
    envelope.query = engine::envelope::parse_query(parts.uri.query().unwrap_or_default());
    envelope.headers = headers;
    envelope.body = body;
    Ok(envelope)
}

fn envelope_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_query_headers_params_and_body() {
        let request = Request::builder()
            .method("PUT")
            .uri("/users/42?tab=posts&q=a+b")
            .header(REQUEST_ID_HEADER, "req_fixed")
            .header(PARAMS_HEADER, r#"{"id":"42"}"#)
            .body(Body::from("data"))
            .expect("request");

        let envelope = envelope_from_request(request, DEFAULT_BODY_LIMIT)
            .await
            .expect("envelope");
        assert_eq!(envelope.request_id, "req_fixed");
        assert_eq!(envelope.method, "PUT");
        assert_eq!(envelope.path, "/users/42");
        assert_eq!(envelope.query_value("q"), Some("a b"));
        assert_eq!(envelope.params.get("id").map(String::as_str), Some("42"));
        assert_eq!(envelope.body.as_ref(), b"data");
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let request = Request::builder()
            .uri("/")
            .body(Body::from(vec![0u8; 32]))
            .expect("request");
        assert!(envelope_from_request(request, 8).await.is_err());
    }
}
