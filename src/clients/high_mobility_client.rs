//! Cliente HTTP para High Mobility
//!
//! API REST por VIN. Cada llamada lleva un bearer token del `TokenCache`;
//! antes de consultar datos de un vehículo hace falta una clearance
//! (VIN + marca) aceptada.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use super::error::{ProviderError, ProviderResult};
use super::provider::{
    OnboardingHandle, OnboardingStatus, ProviderCapabilities, ProviderClient, VehicleDataResponse,
};
use crate::cache::token_cache::{IssuedToken, TokenCache, TokenSource};
use crate::models::{ClearanceStatus, Provider, Vehicle};

/// Autorización de una llamada a High Mobility
#[derive(Debug, Clone)]
pub enum HmAuth {
    /// Token gestionado por el gateway (refresh + un reintento ante 401)
    Managed,
    /// Token enviado por el caller, se reenvía tal cual
    Bearer(SecretString),
}

/// Vehículo dentro de una solicitud de clearance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FleetVehicle {
    pub vin: String,
    pub brand: String,
    #[serde(default = "empty_tags")]
    pub tags: Value,
}

fn empty_tags() -> Value {
    json!({})
}

/// Estado de clearance de un vehículo en `GET /fleets/vehicles`
#[derive(Debug, Clone, Deserialize)]
struct FleetClearance {
    vin: String,
    #[serde(default)]
    status: String,
}

/// High Mobility devuelve la lista directamente o envuelta en `vehicles`
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FleetClearances {
    List(Vec<FleetClearance>),
    Wrapped { vehicles: Vec<FleetClearance> },
}

impl FleetClearances {
    fn into_vec(self) -> Vec<FleetClearance> {
        match self {
            FleetClearances::List(list) | FleetClearances::Wrapped { vehicles: list } => list,
        }
    }
}

#[derive(Debug, Deserialize)]
struct AccessTokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Normalizar el estado textual de una clearance
pub fn map_clearance_status(raw: &str) -> ClearanceStatus {
    match raw.to_ascii_lowercase().as_str() {
        "approved" | "accepted" => ClearanceStatus::Accepted,
        "pending" | "" => ClearanceStatus::Pending,
        _ => ClearanceStatus::Rejected,
    }
}

/// Client-credentials grant contra `POST {base}/access_tokens`
pub struct HighMobilityTokenSource {
    http: Client,
    base_url: String,
    client_id: String,
    client_secret: SecretString,
}

impl HighMobilityTokenSource {
    pub fn new(
        http: Client,
        base_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: SecretString,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            client_id: client_id.into(),
            client_secret,
        }
    }
}

#[async_trait]
impl TokenSource for HighMobilityTokenSource {
    /// Cualquier fallo del intercambio se reporta como `Credentials`
    async fn issue_token(&self) -> ProviderResult<IssuedToken> {
        self.request_token().await.map_err(|e| {
            warn!("🔑 No se pudo obtener el access token de High Mobility: {}", e);
            match e {
                ProviderError::Credentials(_) => e,
                other => ProviderError::Credentials(other.to_string()),
            }
        })
    }
}

impl HighMobilityTokenSource {
    async fn request_token(&self) -> ProviderResult<IssuedToken> {
        let url = format!("{}/access_tokens", self.base_url);
        debug!("🔐 Pidiendo access token a High Mobility");

        let response = self
            .http
            .post(&url)
            .json(&json!({
                "grant_type": "client_credentials",
                "client_id": self.client_id,
                "client_secret": self.client_secret.expose_secret(),
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, &body));
        }

        let token: AccessTokenResponse = response.json().await?;
        if token.access_token.is_empty() {
            return Err(ProviderError::Internal("empty access_token in token response".to_string()));
        }

        Ok(IssuedToken {
            access_token: SecretString::from(token.access_token),
            expires_in: chrono::Duration::seconds(token.expires_in.unwrap_or(3600)),
        })
    }
}

/// Cliente HTTP para High Mobility
pub struct HighMobilityClient {
    http: Client,
    base_url: String,
    tokens: Arc<TokenCache>,
}

impl HighMobilityClient {
    pub fn new(http: Client, base_url: impl Into<String>, tokens: Arc<TokenCache>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            tokens,
        }
    }

    /// `GET {base}/vehicle-data/autoapi-13/{vin}`
    pub async fn get_vehicle_data(&self, vin: &str, auth: &HmAuth) -> ProviderResult<Value> {
        let url = format!(
            "{}/vehicle-data/autoapi-13/{}",
            self.base_url,
            urlencoding::encode(vin)
        );
        self.send(auth, || self.http.get(&url)).await
    }

    /// `POST {base}/fleets/vehicles` con `{vehicles: [...]}`
    pub async fn create_clearances(
        &self,
        vehicles: &[FleetVehicle],
        auth: &HmAuth,
    ) -> ProviderResult<Value> {
        if vehicles.is_empty() {
            return Err(ProviderError::Validation(
                "at least one vehicle is required for a clearance request".to_string(),
            ));
        }
        let url = format!("{}/fleets/vehicles", self.base_url);
        let body = json!({ "vehicles": vehicles });
        self.send(auth, || self.http.post(&url).json(&body)).await
    }

    /// `GET {base}/fleets/vehicles`
    pub async fn get_clearances(&self, auth: &HmAuth) -> ProviderResult<Value> {
        let url = format!("{}/fleets/vehicles", self.base_url);
        self.send(auth, || self.http.get(&url)).await
    }

    /// Estado de clearance de un VIN concreto
    pub async fn clearance_status(
        &self,
        vin: &str,
        auth: &HmAuth,
    ) -> ProviderResult<ClearanceStatus> {
        let raw = self.get_clearances(auth).await?;
        let clearances: FleetClearances = serde_json::from_value(raw).map_err(|e| {
            ProviderError::Internal(format!("unexpected clearance list format: {}", e))
        })?;

        clearances
            .into_vec()
            .into_iter()
            .find(|clearance| clearance.vin.eq_ignore_ascii_case(vin))
            .map(|clearance| map_clearance_status(&clearance.status))
            .ok_or(ProviderError::NotFound)
    }

    async fn send<F>(&self, auth: &HmAuth, build: F) -> ProviderResult<Value>
    where
        F: Fn() -> RequestBuilder,
    {
        match auth {
            HmAuth::Bearer(token) => {
                let response = build().bearer_auth(token.expose_secret()).send().await?;
                read_json(response).await
            }
            HmAuth::Managed => {
                let token = self.tokens.get().await?;
                let response = build().bearer_auth(token.token.expose_secret()).send().await?;
                if response.status() != reqwest::StatusCode::UNAUTHORIZED {
                    return read_json(response).await;
                }

                warn!("🔄 High Mobility rechazó el token (401), renovando y reintentando una vez");
                let token = self.tokens.refresh_after_rejection(&token).await?;
                let response = build().bearer_auth(token.token.expose_secret()).send().await?;
                read_json(response).await
            }
        }
    }
}

async fn read_json(response: Response) -> ProviderResult<Value> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(ProviderError::from_status(status, &body));
    }
    if body.trim().is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_str(&body)
        .map_err(|e| ProviderError::Internal(format!("invalid JSON from High Mobility: {}", e)))
}

#[async_trait]
impl ProviderClient for HighMobilityClient {
    fn provider(&self) -> Provider {
        Provider::HighMobility
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            batch_queries: false,
            onboarding: true,
            onboarding_status: true,
        }
    }

    async fn fetch_vehicle_data(&self, vin: &str) -> ProviderResult<VehicleDataResponse> {
        self.get_vehicle_data(vin, &HmAuth::Managed)
            .await
            .map(VehicleDataResponse::HighMobility)
    }

    async fn request_onboarding(&self, vehicle: &Vehicle) -> ProviderResult<OnboardingHandle> {
        let brand = vehicle
            .brand
            .as_deref()
            .map(str::trim)
            .filter(|brand| !brand.is_empty())
            .ok_or_else(|| {
                ProviderError::Validation(
                    "brand is required for HIGH_MOBILITY clearance requests".to_string(),
                )
            })?;

        let request = FleetVehicle {
            vin: vehicle.vin.clone(),
            brand: brand.to_string(),
            tags: empty_tags(),
        };
        self.create_clearances(std::slice::from_ref(&request), &HmAuth::Managed)
            .await?;

        Ok(OnboardingHandle::Submitted {
            vin: request.vin,
            brand: Some(request.brand),
        })
    }

    async fn check_onboarding_status(
        &self,
        handle: &OnboardingHandle,
    ) -> ProviderResult<OnboardingStatus> {
        match handle {
            OnboardingHandle::Completed { .. } => Ok(ClearanceStatus::Accepted),
            OnboardingHandle::Submitted { vin, .. } => {
                self.clearance_status(vin, &HmAuth::Managed).await
            }
        }
    }
}
