//! DTOs de clearances de High Mobility

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use validator::Validate;

use crate::clients::FleetVehicle;
use crate::utils::validation::{normalize_vin, validate_not_empty, validate_vin};

/// Elemento del body de `POST /clearances`
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ClearanceVehicleRequest {
    #[validate(custom = "validate_vin")]
    pub vin: String,

    #[validate(custom = "validate_not_empty")]
    pub brand: String,

    #[serde(default)]
    pub tags: Option<Value>,
}

impl From<ClearanceVehicleRequest> for FleetVehicle {
    fn from(request: ClearanceVehicleRequest) -> Self {
        FleetVehicle {
            vin: normalize_vin(&request.vin),
            brand: request.brand.trim().to_string(),
            tags: request.tags.unwrap_or_else(|| json!({})),
        }
    }
}
