//! Request ID generation and per-request logging.

use axum::{extract::Request, middleware::Next, response::Response};
use http::HeaderValue;
use std::time::Instant;
use tower_http::request_id::{MakeRequestId, RequestId};
use tracing::{info, warn, Instrument};
use uuid::Uuid;

/// Generates a v4 UUID for every request lacking an `x-request-id` header.
#[derive(Clone, Copy, Default)]
pub struct UuidRequestId;

impl MakeRequestId for UuidRequestId {
    fn make_request_id<B>(&mut self, _request: &http::Request<B>) -> Option<RequestId> {
        HeaderValue::from_str(&Uuid::new_v4().to_string())
            .ok()
            .map(RequestId::new)
    }
}

pub async fn request_logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();
    let start = Instant::now();

    let span = tracing::info_span!("http_request", request_id = %request_id, method = %method, uri = %uri);
    let response = next.run(request).instrument(span).await;

    let status = response.status();
    let elapsed_ms = start.elapsed().as_millis() as u64;
    if status.is_server_error() {
        warn!(
            request_id = %request_id,
            method = %method,
            uri = %uri,
            status = status.as_u16(),
            elapsed_ms,
            "request failed"
        );
    } else {
        info!(
            request_id = %request_id,
            method = %method,
            uri = %uri,
            status = status.as_u16(),
            elapsed_ms,
            "request completed"
        );
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_uuids() {
        let mut maker = UuidRequestId;
        let request = http::Request::builder()
            .uri("/health")
            .body(())
            .expect("request builds");
        let id = maker.make_request_id(&request).expect("id generated");
        let value = id.header_value().to_str().expect("ascii header");
        assert!(Uuid::parse_str(value).is_ok());
    }
}
