//! Controller de High Mobility
//!
//! Proxy de datos de vehículo y clearances. Una clearance creada desde la API
//! también da de alta el VIN en el registro para que el reconciliador lo
//! vincule.

use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};
use validator::Validate;

use crate::clients::{FleetVehicle, HighMobilityClient, HmAuth, ProviderError};
use crate::dto::clearance_dto::ClearanceVehicleRequest;
use crate::models::{NewVehicle, Provider};
use crate::repositories::VehicleRegistry;
use crate::state::AppState;
use crate::utils::errors::{AppError, AppResult, CLEARANCE_REQUIRED_MESSAGE};
use crate::utils::validation::{normalize_vin, validate_vin};

pub const EMPTY_CLEARANCE_MESSAGE: &str =
    "Please include one or more vehicles (VIN + Brand) in the request body";

pub struct HighMobilityController {
    client: Arc<HighMobilityClient>,
    registry: Arc<dyn VehicleRegistry>,
}

impl HighMobilityController {
    pub fn new(state: &AppState) -> Self {
        Self {
            client: state.high_mobility.clone(),
            registry: state.registry.clone(),
        }
    }

    pub async fn get_vehicle_data(&self, vin: &str, auth: &HmAuth) -> AppResult<Value> {
        validate_vin(vin).map_err(|_| AppError::BadRequest(format!("Invalid VIN '{}'", vin)))?;
        let vin = normalize_vin(vin);

        self.client
            .get_vehicle_data(&vin, auth)
            .await
            .map_err(|e| match e {
                ProviderError::Forbidden => {
                    AppError::Forbidden(CLEARANCE_REQUIRED_MESSAGE.to_string())
                }
                other => other.into(),
            })
    }

    pub async fn get_clearances(&self, auth: &HmAuth) -> AppResult<Value> {
        Ok(self.client.get_clearances(auth).await?)
    }

    pub async fn create_clearances(
        &self,
        requests: Vec<ClearanceVehicleRequest>,
        auth: &HmAuth,
    ) -> AppResult<Value> {
        if requests.is_empty() {
            return Err(AppError::BadRequest(EMPTY_CLEARANCE_MESSAGE.to_string()));
        }
        for request in &requests {
            request.validate()?;
        }

        let vehicles: Vec<FleetVehicle> = requests.into_iter().map(FleetVehicle::from).collect();
        let response = self.client.create_clearances(&vehicles, auth).await?;
        info!("📨 {} clearances enviadas a High Mobility", vehicles.len());

        for vehicle in vehicles {
            self.track(vehicle).await;
        }
        Ok(response)
    }

    /// Dar de alta el VIN si el registro aún no lo conoce
    async fn track(&self, vehicle: FleetVehicle) {
        let vin = vehicle.vin.clone();
        match self.registry.get(&vin).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                let new = NewVehicle {
                    vin: vehicle.vin,
                    provider: Provider::HighMobility,
                    brand: Some(vehicle.brand),
                };
                match self.registry.register(new).await {
                    Ok(_) => info!("🚗 {} registrado para vinculación", vin),
                    Err(AppError::Conflict(_)) => {}
                    Err(e) => warn!("⚠️ No se pudo registrar {}: {}", vin, e),
                }
            }
            Err(e) => warn!("⚠️ No se pudo consultar {} en el registro: {}", vin, e),
        }
    }
}
