//! Abstracción común de los proveedores telemáticos
//!
//! Cada proveedor expone un subconjunto de capacidades (consultas batch,
//! onboarding, estado del onboarding). Las respuestas se normalizan aquí en
//! variantes etiquetadas antes de que el resto del sistema las toque.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use super::error::ProviderResult;
use crate::models::{ClearanceStatus, Provider, Vehicle};

/// Capacidades soportadas por un proveedor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderCapabilities {
    /// Acepta varios VINs en una sola llamada
    pub batch_queries: bool,
    /// Requiere un paso explícito de alta (clearance) por vehículo
    pub onboarding: bool,
    /// Permite consultar el estado del alta
    pub onboarding_status: bool,
}

/// Respuesta de datos de vehículo, etiquetada por proveedor
#[derive(Debug, Clone, PartialEq)]
pub enum VehicleDataResponse {
    HighMobility(Value),
    Caruso(Value),
}

impl VehicleDataResponse {
    pub fn provider(&self) -> Provider {
        match self {
            VehicleDataResponse::HighMobility(_) => Provider::HighMobility,
            VehicleDataResponse::Caruso(_) => Provider::Caruso,
        }
    }

    pub fn into_payload(self) -> Value {
        match self {
            VehicleDataResponse::HighMobility(value) | VehicleDataResponse::Caruso(value) => value,
        }
    }
}

/// Resultado por VIN de una consulta batch; los VINs ausentes en la
/// respuesta del proveedor no aparecen en el mapa
pub type BatchVehicleData = HashMap<String, ProviderResult<VehicleDataResponse>>;

/// Referencia a un alta enviada al proveedor
#[derive(Debug, Clone, PartialEq)]
pub enum OnboardingHandle {
    /// Alta asíncrona pendiente de confirmación (clearance HM)
    Submitted { vin: String, brand: Option<String> },
    /// El proveedor no necesita confirmación: el vehículo ya es consultable
    Completed { vin: String },
}

/// Estado de un alta (pending / accepted / rejected)
pub type OnboardingStatus = ClearanceStatus;

/// Cliente de un proveedor telemático
#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn provider(&self) -> Provider;

    fn capabilities(&self) -> ProviderCapabilities;

    /// Datos de un único vehículo
    async fn fetch_vehicle_data(&self, vin: &str) -> ProviderResult<VehicleDataResponse>;

    /// Datos de varios vehículos. Por defecto hace una llamada por VIN de forma
    /// secuencial; los proveedores con `batch_queries` lo sobreescriben.
    async fn fetch_vehicle_data_batch(&self, vins: &[String]) -> ProviderResult<BatchVehicleData> {
        let mut results = HashMap::with_capacity(vins.len());
        for vin in vins {
            results.insert(vin.clone(), self.fetch_vehicle_data(vin).await);
        }
        Ok(results)
    }

    /// Enviar el alta de un vehículo
    async fn request_onboarding(&self, vehicle: &Vehicle) -> ProviderResult<OnboardingHandle>;

    /// Consultar el estado de un alta enviada
    async fn check_onboarding_status(
        &self,
        handle: &OnboardingHandle,
    ) -> ProviderResult<OnboardingStatus>;
}

/// Clientes disponibles, indexados por proveedor
#[derive(Clone, Default)]
pub struct ProviderClients {
    clients: HashMap<Provider, Arc<dyn ProviderClient>>,
}

impl ProviderClients {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, client: Arc<dyn ProviderClient>) -> Self {
        self.clients.insert(client.provider(), client);
        self
    }

    pub fn get(&self, provider: Provider) -> Option<Arc<dyn ProviderClient>> {
        self.clients.get(&provider).cloned()
    }
}
