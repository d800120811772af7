//! Rutas HTTP del gateway

pub mod caruso_routes;
pub mod high_mobility_routes;
pub mod job_routes;
pub mod vehicle_routes;

use axum::{http::header, response::IntoResponse, routing::get, Json, Router};
use serde_json::{json, Value};
use tower_http::{compression::CompressionLayer, trace::TraceLayer};

use crate::middleware::cors::cors_layer;
use crate::services::metrics;
use crate::state::AppState;
use crate::utils::errors::AppError;

/// Router completo de la API
pub fn create_router(state: AppState, cors_origins: &[String]) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(render_metrics))
        .merge(high_mobility_routes::create_high_mobility_router(&state))
        .nest("/caruso", caruso_routes::create_caruso_router(&state))
        .nest("/vehicles", vehicle_routes::create_vehicle_router(&state))
        .nest("/jobs", job_routes::create_job_router(&state))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(cors_origins))
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "telematics-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn render_metrics() -> Result<impl IntoResponse, AppError> {
    let body = metrics::render().map_err(AppError::Internal)?;
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body))
}
