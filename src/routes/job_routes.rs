use axum::{extract::State, middleware, routing::post, Json, Router};

use crate::controllers::job_controller::JobController;
use crate::middleware::auth::admin_auth_middleware;
use crate::services::{DispatchReport, PassReport};
use crate::state::AppState;
use crate::utils::errors::AppError;

pub fn create_job_router(state: &AppState) -> Router<AppState> {
    Router::new()
        .route("/reconcile", post(reconcile))
        .route("/load-vehicle-data", post(load_vehicle_data))
        .route_layer(middleware::from_fn_with_state(state.admin.clone(), admin_auth_middleware))
}

async fn reconcile(State(state): State<AppState>) -> Result<Json<PassReport>, AppError> {
    let controller = JobController::new(&state);
    Ok(Json(controller.reconcile().await?))
}

async fn load_vehicle_data(
    State(state): State<AppState>,
) -> Result<Json<DispatchReport>, AppError> {
    let controller = JobController::new(&state);
    Ok(Json(controller.load_vehicle_data().await?))
}
