use axum::{
    extract::{Path, State},
    middleware,
    routing::get,
    Extension, Json, Router,
};
use serde_json::Value;

use crate::clients::HmAuth;
use crate::controllers::high_mobility_controller::HighMobilityController;
use crate::dto::clearance_dto::ClearanceVehicleRequest;
use crate::middleware::auth::hm_auth_middleware;
use crate::state::AppState;
use crate::utils::errors::AppError;

pub fn create_high_mobility_router(state: &AppState) -> Router<AppState> {
    Router::new()
        .route("/vehicle-data/:vin", get(get_vehicle_data))
        .route("/clearances", get(get_clearances).post(create_clearances))
        .route_layer(middleware::from_fn_with_state(state.admin.clone(), hm_auth_middleware))
}

async fn get_vehicle_data(
    State(state): State<AppState>,
    Extension(auth): Extension<HmAuth>,
    Path(vin): Path<String>,
) -> Result<Json<Value>, AppError> {
    let controller = HighMobilityController::new(&state);
    let response = controller.get_vehicle_data(&vin, &auth).await?;
    Ok(Json(response))
}

async fn get_clearances(
    State(state): State<AppState>,
    Extension(auth): Extension<HmAuth>,
) -> Result<Json<Value>, AppError> {
    let controller = HighMobilityController::new(&state);
    let response = controller.get_clearances(&auth).await?;
    Ok(Json(response))
}

async fn create_clearances(
    State(state): State<AppState>,
    Extension(auth): Extension<HmAuth>,
    Json(request): Json<Vec<ClearanceVehicleRequest>>,
) -> Result<Json<Value>, AppError> {
    let controller = HighMobilityController::new(&state);
    let response = controller.create_clearances(request, &auth).await?;
    Ok(Json(response))
}
