use axum::{extract::State, middleware, routing::get, Json, Router};
use serde_json::{Map, Value};

use crate::controllers::caruso_controller::CarusoController;
use crate::middleware::auth::admin_auth_middleware;
use crate::state::AppState;
use crate::utils::errors::AppError;

pub fn create_caruso_router(state: &AppState) -> Router<AppState> {
    Router::new()
        .route("/vehicle-data", get(get_vehicle_data).post(get_vehicle_data))
        .route_layer(middleware::from_fn_with_state(state.admin.clone(), admin_auth_middleware))
}

async fn get_vehicle_data(
    State(state): State<AppState>,
    Json(vins): Json<Vec<String>>,
) -> Result<Json<Map<String, Value>>, AppError> {
    let controller = CarusoController::new(&state);
    let response = controller.get_vehicle_data(vins).await?;
    Ok(Json(response))
}
