pub mod data;
pub mod error;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use error::Error;
use hyper::header::CONTENT_TYPE;
use hyper::StatusCode;
use prometheus::{Encoder, TextEncoder};
use tokio::net::TcpListener;
use tracing::info;

use self::data::{CasResponse, CreateRequestPayload};
use crate::app::App;
use crate::config::ServerConfig;
use crate::shutdown::Shutdown;

async fn create_request(
    State(app): State<Arc<App>>,
    Json(payload): Json<CreateRequestPayload>,
) -> Result<(StatusCode, Json<CasResponse>), Error> {
    let result = app
        .create_request(
            &payload.stream_id,
            &payload.cid,
            payload.timestamp,
            payload.origin,
        )
        .await?;

    Ok((StatusCode::ACCEPTED, Json(result)))
}

async fn request_status(
    State(app): State<Arc<App>>,
    Path(cid): Path<String>,
) -> Result<(StatusCode, Json<CasResponse>), Error> {
    let result = app.request_status(&cid).await?;

    Ok((StatusCode::OK, Json(result)))
}

// Health check, return 200 OK
async fn health() -> Result<(), Error> {
    Ok(())
}

async fn metrics() -> Result<Response<Body>, Error> {
    let encoder = TextEncoder::new();

    let metric_families = prometheus::gather();
    let mut buffer = vec![];
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| Error::Other(e.into()))?;

    let response = Response::builder()
        .status(200)
        .header(CONTENT_TYPE, encoder.format_type())
        .body(Body::from(buffer))
        .map_err(|e| Error::Other(e.into()))?;

    Ok(response)
}

async fn timeout_middleware(
    State(timeout): State<Duration>,
    request: Request,
    next: Next,
) -> Result<Response, Error> {
    Ok(tokio::time::timeout(timeout, next.run(request)).await?)
}

/// # Errors
///
/// Will return `Err` if the server cannot bind to `config.address`.
pub async fn run(app: Arc<App>, config: ServerConfig, shutdown: Shutdown) -> anyhow::Result<()> {
    info!("Will listen on {}", config.address);
    let listener = TcpListener::bind(config.address).await?;

    bind_from_listener(app, config.serve_timeout, listener, shutdown).await?;

    Ok(())
}

/// # Errors
///
/// Will return `Err` if the provided `listener` cannot accept connections.
pub async fn bind_from_listener(
    app: Arc<App>,
    serve_timeout: Duration,
    listener: TcpListener,
    shutdown: Shutdown,
) -> anyhow::Result<()> {
    let router = Router::new()
        // Anchor request intake and status
        .route("/requests", post(create_request))
        .route("/requests/:cid", get(request_status))
        // Health check, return 200 OK
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .layer(middleware::from_fn_with_state(
            serve_timeout,
            timeout_middleware,
        ))
        .with_state(app.clone());

    let server = axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.await_shutdown_begin().await });

    server.await?;

    Ok(())
}
