use chrono::Utc;
use std::sync::Arc;
use tracing::info;
use validator::Validate;

use crate::dto::vehicle_dto::{RegisterVehicleRequest, VehicleTelemetryResponse};
use crate::models::{LinkingStatus, Vehicle};
use crate::repositories::{TelemetryStore, VehicleRegistry};
use crate::state::AppState;
use crate::utils::errors::{AppError, AppResult};
use crate::utils::validation::normalize_vin;

const ALL_STATUSES: [LinkingStatus; 4] = [
    LinkingStatus::Unlinked,
    LinkingStatus::PendingClearance,
    LinkingStatus::Linked,
    LinkingStatus::Failed,
];

pub struct VehicleController {
    registry: Arc<dyn VehicleRegistry>,
    telemetry: Arc<dyn TelemetryStore>,
}

impl VehicleController {
    pub fn new(state: &AppState) -> Self {
        Self {
            registry: state.registry.clone(),
            telemetry: state.telemetry.clone(),
        }
    }

    pub async fn register(&self, request: RegisterVehicleRequest) -> AppResult<Vehicle> {
        request.validate()?;
        let vehicle = self.registry.register(request.into()).await?;
        info!("🚗 Vehículo {} registrado ({})", vehicle.vin, vehicle.provider);
        Ok(vehicle)
    }

    pub async fn list(&self, status: Option<&str>) -> AppResult<Vec<Vehicle>> {
        match status {
            Some(raw) => {
                let statuses = raw
                    .split(',')
                    .map(|s| s.trim().parse::<LinkingStatus>().map_err(AppError::BadRequest))
                    .collect::<AppResult<Vec<_>>>()?;
                self.registry.list_by_status(&statuses).await
            }
            None => self.registry.list_by_status(&ALL_STATUSES).await,
        }
    }

    pub async fn get(&self, vin: &str) -> AppResult<Vehicle> {
        let vin = normalize_vin(vin);
        self.registry
            .get(&vin)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Vehicle {} not found", vin)))
    }

    pub async fn delete(&self, vin: &str) -> AppResult<()> {
        self.registry.soft_delete(&normalize_vin(vin), Utc::now()).await
    }

    pub async fn re_enqueue(&self, vin: &str) -> AppResult<Vehicle> {
        let vehicle = self.registry.re_enqueue(&normalize_vin(vin), Utc::now()).await?;
        info!("🔁 Vehículo {} re-encolado", vehicle.vin);
        Ok(vehicle)
    }

    pub async fn telemetry(&self, vin: &str, limit: i64) -> AppResult<VehicleTelemetryResponse> {
        let vehicle = self.get(vin).await?;
        let limit = limit.clamp(1, 500);
        let records = self.telemetry.list_records(&vehicle.vin, limit).await?;
        let errors = self.telemetry.list_errors(&vehicle.vin, limit).await?;
        Ok(VehicleTelemetryResponse {
            vin: vehicle.vin,
            records,
            errors,
        })
    }
}
