use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;

use crate::controllers::vehicle_controller::VehicleController;
use crate::dto::vehicle_dto::{
    ListVehiclesQuery, RegisterVehicleRequest, TelemetryQuery, VehicleTelemetryResponse,
};
use crate::middleware::auth::admin_auth_middleware;
use crate::models::Vehicle;
use crate::state::AppState;
use crate::utils::errors::AppError;

pub fn create_vehicle_router(state: &AppState) -> Router<AppState> {
    Router::new()
        .route("/", post(register_vehicle).get(list_vehicles))
        .route("/:vin", get(get_vehicle).delete(delete_vehicle))
        .route("/:vin/re-enqueue", post(re_enqueue_vehicle))
        .route("/:vin/telemetry", get(get_telemetry))
        .route_layer(middleware::from_fn_with_state(state.admin.clone(), admin_auth_middleware))
}

async fn register_vehicle(
    State(state): State<AppState>,
    Json(request): Json<RegisterVehicleRequest>,
) -> Result<(StatusCode, Json<Vehicle>), AppError> {
    let controller = VehicleController::new(&state);
    let vehicle = controller.register(request).await?;
    Ok((StatusCode::CREATED, Json(vehicle)))
}

async fn list_vehicles(
    State(state): State<AppState>,
    Query(query): Query<ListVehiclesQuery>,
) -> Result<Json<Vec<Vehicle>>, AppError> {
    let controller = VehicleController::new(&state);
    let vehicles = controller.list(query.status.as_deref()).await?;
    Ok(Json(vehicles))
}

async fn get_vehicle(
    State(state): State<AppState>,
    Path(vin): Path<String>,
) -> Result<Json<Vehicle>, AppError> {
    let controller = VehicleController::new(&state);
    Ok(Json(controller.get(&vin).await?))
}

async fn delete_vehicle(
    State(state): State<AppState>,
    Path(vin): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let controller = VehicleController::new(&state);
    controller.delete(&vin).await?;
    Ok(Json(json!({
        "success": true,
        "message": "Vehicle removed"
    })))
}

async fn re_enqueue_vehicle(
    State(state): State<AppState>,
    Path(vin): Path<String>,
) -> Result<Json<Vehicle>, AppError> {
    let controller = VehicleController::new(&state);
    Ok(Json(controller.re_enqueue(&vin).await?))
}

async fn get_telemetry(
    State(state): State<AppState>,
    Path(vin): Path<String>,
    Query(query): Query<TelemetryQuery>,
) -> Result<Json<VehicleTelemetryResponse>, AppError> {
    let controller = VehicleController::new(&state);
    Ok(Json(controller.telemetry(&vin, query.limit).await?))
}
