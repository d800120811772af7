//! DTOs del registro de vehículos

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::models::{ErrorLog, NewVehicle, Provider, TelemetryRecord};
use crate::utils::validation::{normalize_vin, validate_vin};

/// Body de `POST /vehicles`
#[derive(Debug, Deserialize, Validate)]
pub struct RegisterVehicleRequest {
    #[validate(custom = "validate_vin")]
    pub vin: String,
    pub provider: Provider,
    pub brand: Option<String>,
}

impl From<RegisterVehicleRequest> for NewVehicle {
    fn from(request: RegisterVehicleRequest) -> Self {
        NewVehicle {
            vin: normalize_vin(&request.vin),
            provider: request.provider,
            brand: request
                .brand
                .map(|brand| brand.trim().to_string())
                .filter(|brand| !brand.is_empty()),
        }
    }
}

/// Query de `GET /vehicles`
#[derive(Debug, Default, Deserialize)]
pub struct ListVehiclesQuery {
    pub status: Option<String>,
}

/// Query de `GET /vehicles/:vin/telemetry`
#[derive(Debug, Deserialize)]
pub struct TelemetryQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    50
}

// Response de `GET /vehicles/:vin/telemetry`
#[derive(Debug, Serialize)]
pub struct VehicleTelemetryResponse {
    pub vin: String,
    pub records: Vec<TelemetryRecord>,
    pub errors: Vec<ErrorLog>,
}
