//! Proxy handlers: the metric-observing handler and the plain pass-through

use crate::error::ProxyError;
use crate::stream::{self, StreamContext};
use crate::AppState;
use argus_common::{ModelResponse, RequestEnvelope};
use bytes::Bytes;
use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderMap, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::{Request, Response, StatusCode};
use std::io;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, warn};

/// Body type of every response the proxy writes
pub type ProxyBody = UnsyncBoxBody<Bytes, io::Error>;

/// Forward a request to an observed endpoint and record what came back
pub async fn proxy_with_metrics(state: Arc<AppState>, req: Request<Incoming>) -> Response<ProxyBody> {
    match observe(state, req).await {
        Ok(response) => response,
        Err(e) => {
            error!("Proxy request failed: {}", e);
            e.into_response()
        }
    }
}

async fn observe(state: Arc<AppState>, req: Request<Incoming>) -> Result<Response<ProxyBody>, ProxyError> {
    let (parts, body) = req.into_parts();
    let body = body
        .collect()
        .await
        .map_err(ProxyError::ReadRequest)?
        .to_bytes();

    // The envelope is read-only; the original bytes are what gets forwarded
    let envelope = RequestEnvelope::parse(&body)?;
    let model = envelope.model_id().to_string();

    let started = Instant::now();
    let mut shutdown = state.shutdown.clone();

    let upstream = match state.backend.forward(&parts, body, &mut shutdown).await {
        Ok(response) => response,
        Err(e) => {
            if e.is_backend_failure() {
                state.stats.record_failure(&model);
            }
            return Err(e);
        }
    };

    let (upstream_parts, upstream_body) = upstream.into_parts();

    if envelope.stream {
        let mut headers = upstream_parts.headers;
        // Empty lines are dropped on the way through, so the length may change
        headers.remove(CONTENT_LENGTH);

        let body = stream::relay(
            upstream_body,
            StreamContext {
                model,
                started,
                stats: state.stats.clone(),
                shutdown,
            },
        );
        return Ok(build_response(upstream_parts.status, headers, body.boxed_unsync()));
    }

    let bytes = match state.backend.read_body(upstream_body, &mut shutdown).await {
        Ok(bytes) => bytes,
        Err(e) => {
            if e.is_backend_failure() {
                state.stats.record_failure(&model);
            }
            return Err(e);
        }
    };

    match ModelResponse::parse(&bytes) {
        Ok(record) => {
            let elapsed = started.elapsed().as_secs_f64();
            state.stats.record_success(&model, &record, elapsed);
        }
        Err(e) => {
            warn!("Failed to parse response for model {}: {}", model, e);
            state.stats.record_failure(&model);
        }
    }

    Ok(build_response(
        upstream_parts.status,
        upstream_parts.headers,
        full_body(bytes),
    ))
}

/// Forward any other request without looking at either body
pub async fn pass_through(state: Arc<AppState>, req: Request<Incoming>) -> Response<ProxyBody> {
    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            let e = ProxyError::ReadRequest(e);
            error!("Pass-through request failed: {}", e);
            return e.into_response();
        }
    };

    let mut shutdown = state.shutdown.clone();
    match state.backend.forward(&parts, body, &mut shutdown).await {
        Ok(upstream) => {
            let (upstream_parts, upstream_body) = upstream.into_parts();
            build_response(
                upstream_parts.status,
                upstream_parts.headers,
                upstream_body.map_err(io::Error::other).boxed_unsync(),
            )
        }
        Err(e) => {
            error!("Pass-through request failed: {}", e);
            e.into_response()
        }
    }
}

fn build_response(status: StatusCode, headers: HeaderMap, body: ProxyBody) -> Response<ProxyBody> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// Create a full body response
pub fn full_body(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Plain-text response with a trailing newline
pub fn text_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(format!("{}\n", message)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
