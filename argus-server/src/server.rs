//! HTTP server: accept loop, routing and the local endpoints

use crate::exposition;
use crate::proxy::{self, full_body, text_response, ProxyBody};
use crate::AppState;
use anyhow::Result;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info};

/// Paths whose traffic is decoded for metrics
const OBSERVED_PATHS: [&str; 2] = ["/api/chat", "/api/generate"];

/// Bind the configured address and serve until shutdown
pub async fn run_server(state: Arc<AppState>) -> Result<()> {
    let addr: SocketAddr = format!(
        "{}:{}",
        state.config.server.bind_address, state.config.server.port
    )
    .parse()?;

    let listener = TcpListener::bind(addr).await?;
    info!(
        "Proxy listening on http://{} (backend {})",
        addr,
        state.backend.base_url()
    );

    serve(listener, state).await
}

/// Accept connections on `listener` until shutdown is triggered
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<()> {
    let mut shutdown = state.shutdown.clone();

    loop {
        let (stream, remote_addr) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = shutdown.wait() => {
                info!("Proxy stopped accepting connections");
                return Ok(());
            }
        };
        let io = TokioIo::new(stream);
        let state = state.clone();

        tokio::spawn(async move {
            let mut shutdown = state.shutdown.clone();
            let service = service_fn(move |req| {
                let state = state.clone();
                async move { handle_request(state, req, remote_addr).await }
            });

            let conn = http1::Builder::new().serve_connection(io, service);
            tokio::pin!(conn);

            let result = tokio::select! {
                result = conn.as_mut() => result,
                _ = shutdown.wait() => {
                    conn.as_mut().graceful_shutdown();
                    conn.as_mut().await
                }
            };
            if let Err(err) = result {
                debug!("Connection error: {:?}", err);
            }
        });
    }
}

/// Route one inbound request
async fn handle_request(
    state: Arc<AppState>,
    req: Request<Incoming>,
    remote_addr: SocketAddr,
) -> Result<Response<ProxyBody>, Infallible> {
    if state.config.server.access_log {
        info!(
            "{} {} {} - {}",
            remote_addr.ip(),
            req.method(),
            req.uri().path(),
            req.uri().query().unwrap_or("")
        );
    }

    let path = req.uri().path();
    let response = if path == "/metrics" {
        serve_metrics(&state)
    } else if path == "/health" {
        health_check(&state).await
    } else if OBSERVED_PATHS.contains(&path) {
        proxy::proxy_with_metrics(state, req).await
    } else {
        proxy::pass_through(state, req).await
    };

    Ok(response)
}

fn serve_metrics(state: &AppState) -> Response<ProxyBody> {
    let body = exposition::render(&state.stats, &state.config.metrics);
    let mut response = Response::new(full_body(body));
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4"),
    );
    response
}

async fn health_check(state: &AppState) -> Response<ProxyBody> {
    let mut shutdown = state.shutdown.clone();
    match state.backend.probe(&mut shutdown).await {
        Ok(()) => text_response(StatusCode::OK, "OK"),
        Err(e) => text_response(StatusCode::SERVICE_UNAVAILABLE, &format!("ERROR: {}", e)),
    }
}
