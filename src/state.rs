//! Shared application state
//!
//! Este módulo define el estado compartido de la aplicación que se pasa
//! a través del router de Axum.

use std::sync::Arc;

use crate::clients::{CarusoClient, HighMobilityClient, ProviderClients};
use crate::middleware::auth::AdminCredentials;
use crate::repositories::{ClearanceStore, TelemetryStore, VehicleRegistry};
use crate::services::{LinkingReconciler, ReconcilerConfig, TelematicsDispatcher};

/// Almacenes de datos del gateway
#[derive(Clone)]
pub struct Stores {
    pub registry: Arc<dyn VehicleRegistry>,
    pub clearances: Arc<dyn ClearanceStore>,
    pub telemetry: Arc<dyn TelemetryStore>,
}

#[derive(Clone)]
pub struct AppState {
    pub admin: Arc<AdminCredentials>,
    pub registry: Arc<dyn VehicleRegistry>,
    pub telemetry: Arc<dyn TelemetryStore>,
    pub high_mobility: Arc<HighMobilityClient>,
    pub reconciler: Arc<LinkingReconciler>,
    pub dispatcher: Arc<TelematicsDispatcher>,
}

impl AppState {
    /// Construir servicios y estado a partir de stores y clientes
    pub fn new(
        admin: AdminCredentials,
        stores: Stores,
        high_mobility: Arc<HighMobilityClient>,
        caruso: Arc<CarusoClient>,
        reconciler_config: ReconcilerConfig,
        per_vin_concurrency: usize,
    ) -> Self {
        let providers = ProviderClients::new()
            .with(high_mobility.clone())
            .with(caruso);

        let reconciler = LinkingReconciler::new(
            stores.registry.clone(),
            stores.clearances.clone(),
            providers.clone(),
            reconciler_config,
        );
        let dispatcher = TelematicsDispatcher::new(
            stores.registry.clone(),
            stores.telemetry.clone(),
            providers,
            per_vin_concurrency,
        );

        Self {
            admin: Arc::new(admin),
            registry: stores.registry,
            telemetry: stores.telemetry,
            high_mobility,
            reconciler: Arc::new(reconciler),
            dispatcher: Arc::new(dispatcher),
        }
    }
}
