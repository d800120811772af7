//! Clientes HTTP de los proveedores telemáticos
//!
//! Este módulo contiene los clientes de High Mobility y Caruso y la
//! abstracción común que usan el reconciliador y el dispatcher.

pub mod caruso_client;
pub mod error;
pub mod high_mobility_client;
pub mod provider;

use std::time::Duration;

pub use caruso_client::CarusoClient;
pub use error::{ProviderError, ProviderResult};
pub use high_mobility_client::{FleetVehicle, HighMobilityClient, HighMobilityTokenSource, HmAuth};
pub use provider::{
    BatchVehicleData, OnboardingHandle, OnboardingStatus, ProviderCapabilities, ProviderClient,
    ProviderClients, VehicleDataResponse,
};

/// Cliente reqwest compartido, con timeout acotado para toda llamada saliente
pub fn build_http_client(timeout: Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .user_agent(concat!("telematics-gateway/", env!("CARGO_PKG_VERSION")))
        .build()
}
