//! Health, status and metrics endpoints.

use std::sync::Arc;

use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::metrics::Metrics;
use crate::monitor::StatusSnapshot;

#[derive(Clone)]
pub struct ApiState {
    pub status: watch::Receiver<StatusSnapshot>,
    pub metrics: Arc<Metrics>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: ApiState) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "health endpoint listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn health() -> &'static str {
    "ok"
}

async fn status(State(state): State<ApiState>) -> Json<StatusSnapshot> {
    Json(state.status.borrow().clone())
}

async fn metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let body = state.metrics.render(&state.status.borrow());
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}
