use std::sync::Arc;

use axum::{Json, Router, extract::State, routing::get};
use playout_core::{format::VideoFormat, monitor, output::Output};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub(crate) fn router(output: Arc<Output>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/output/state", get(output_state))
        .route("/output/format", get(output_format))
        .with_state(output)
}

pub(crate) fn start_api_server(addr: String, output: Arc<Output>, cancel: CancellationToken) {
    tokio::spawn(async move {
        let app = router(output);

        let listener = match TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(e) => {
                log::error!("failed to bind API server on {}: {}", addr, e);
                return;
            }
        };
        log::info!("API server started on {}", addr);
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(cancel))
            .await
        {
            log::error!("Error starting API server: {}", e);
        }
    });
}

async fn shutdown_signal(cancel: CancellationToken) {
    cancel.cancelled().await;
    log::info!("Shutting down API server...");
}

async fn index() -> &'static str {
    "playout"
}

async fn output_state(State(output): State<Arc<Output>>) -> Json<monitor::State> {
    Json(output.state())
}

async fn output_format(State(output): State<Arc<Output>>) -> Json<VideoFormat> {
    Json(output.format())
}

#[cfg(test)]
#[path = "api_test.rs"]
mod api_test;
