//! Cliente HTTP para Caruso
//!
//! Consulta batch: una sola llamada para N VINs, autenticada con
//! subscription id + API key estáticos.

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use super::error::{message_from_value, ProviderError, ProviderResult};
use super::provider::{
    BatchVehicleData, OnboardingHandle, OnboardingStatus, ProviderCapabilities, ProviderClient,
    VehicleDataResponse,
};
use crate::models::{ClearanceStatus, Provider, Vehicle};

/// Status asignado a un error por vehículo que no trae código propio
const PER_VEHICLE_ERROR_STATUS: u16 = 502;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InVehicleRequest<'a> {
    version: &'static str,
    vehicles: Vec<VehicleIdentifierWrapper>,
    data_items: &'a [String],
}

#[derive(Debug, Serialize, Deserialize)]
struct VehicleIdentifierWrapper {
    identifier: VehicleIdentifier,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct VehicleIdentifier {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InVehicleResponse {
    #[serde(default)]
    in_vehicle_data: Vec<InVehicleEntry>,
}

#[derive(Debug, Deserialize)]
struct InVehicleEntry {
    identifier: VehicleIdentifier,
    #[serde(default)]
    response: Value,
}

/// Error reportado por Caruso dentro de la respuesta de un vehículo
fn per_vehicle_error(response: &Value) -> Option<ProviderError> {
    let has_error = response.get("error").map_or(false, |e| !e.is_null())
        || response
            .get("errors")
            .and_then(Value::as_array)
            .map_or(false, |errors| !errors.is_empty());
    if !has_error {
        return None;
    }

    let status = response
        .get("status")
        .or_else(|| response.pointer("/error/status"))
        .and_then(Value::as_u64)
        .and_then(|status| u16::try_from(status).ok())
        .filter(|status| *status >= 400)
        .unwrap_or(PER_VEHICLE_ERROR_STATUS);

    Some(ProviderError::Upstream {
        status,
        message: message_from_value(response),
    })
}

/// Cliente HTTP para Caruso
pub struct CarusoClient {
    http: Client,
    base_url: String,
    subscription_id: String,
    api_key: SecretString,
    data_items: Vec<String>,
}

impl CarusoClient {
    pub fn new(
        http: Client,
        base_url: impl Into<String>,
        subscription_id: impl Into<String>,
        api_key: SecretString,
        data_items: Vec<String>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            subscription_id: subscription_id.into(),
            api_key,
            data_items,
        }
    }

    /// `POST {base}/delivery/v1/in-vehicle` para todos los VINs.
    /// Los VINs que no vienen en la respuesta no aparecen en el mapa.
    pub async fn query_in_vehicle_data(&self, vins: &[String]) -> ProviderResult<BatchVehicleData> {
        if vins.is_empty() {
            return Ok(HashMap::new());
        }

        let url = format!("{}/delivery/v1/in-vehicle", self.base_url);
        let body = InVehicleRequest {
            version: "1.0",
            vehicles: vins
                .iter()
                .map(|vin| VehicleIdentifierWrapper {
                    identifier: VehicleIdentifier {
                        kind: "VIN".to_string(),
                        value: vin.clone(),
                    },
                })
                .collect(),
            data_items: &self.data_items,
        };

        debug!("🚗 Consultando Caruso para {} vehículos", vins.len());
        let response = self
            .http
            .post(&url)
            .header("X-Subscription-Id", &self.subscription_id)
            .header("X-API-Key", self.api_key.expose_secret())
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            warn!("❌ Caruso respondió {} para un batch de {} VINs", status, vins.len());
            return Err(ProviderError::from_status(status, &text));
        }

        let parsed: InVehicleResponse = serde_json::from_str(&text)
            .map_err(|e| ProviderError::Internal(format!("invalid JSON from Caruso: {}", e)))?;

        let mut results = HashMap::with_capacity(parsed.in_vehicle_data.len());
        for entry in parsed.in_vehicle_data {
            let kind = &entry.identifier.kind;
            if !kind.is_empty() && !kind.eq_ignore_ascii_case("VIN") {
                debug!("Ignorando identificador Caruso de tipo {}", entry.identifier.kind);
                continue;
            }
            let result = match per_vehicle_error(&entry.response) {
                Some(error) => Err(error),
                None => Ok(VehicleDataResponse::Caruso(entry.response)),
            };
            results.insert(entry.identifier.value, result);
        }

        info!("✅ Caruso devolvió {}/{} vehículos", results.len(), vins.len());
        Ok(results)
    }
}

#[async_trait]
impl ProviderClient for CarusoClient {
    fn provider(&self) -> Provider {
        Provider::Caruso
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            batch_queries: true,
            onboarding: false,
            onboarding_status: false,
        }
    }

    async fn fetch_vehicle_data(&self, vin: &str) -> ProviderResult<VehicleDataResponse> {
        let vins = [vin.to_string()];
        let mut results = self.query_in_vehicle_data(&vins).await?;
        results.remove(vin).unwrap_or(Err(ProviderError::NotFound))
    }

    async fn fetch_vehicle_data_batch(&self, vins: &[String]) -> ProviderResult<BatchVehicleData> {
        self.query_in_vehicle_data(vins).await
    }

    async fn request_onboarding(&self, vehicle: &Vehicle) -> ProviderResult<OnboardingHandle> {
        Ok(OnboardingHandle::Completed {
            vin: vehicle.vin.clone(),
        })
    }

    async fn check_onboarding_status(
        &self,
        _handle: &OnboardingHandle,
    ) -> ProviderResult<OnboardingStatus> {
        Ok(ClearanceStatus::Accepted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> CarusoClient {
        CarusoClient::new(
            Client::new(),
            server.uri(),
            "sub-123",
            SecretString::from("api-key".to_string()),
            vec!["dtcconfirmed".to_string(), "mileage".to_string()],
        )
    }

    fn vins(list: &[&str]) -> Vec<String> {
        list.iter().map(|vin| vin.to_string()).collect()
    }

    #[tokio::test]
    async fn test_batch_request_shape_and_demultiplexing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/delivery/v1/in-vehicle"))
            .and(header("X-Subscription-Id", "sub-123"))
            .and(header("X-API-Key", "api-key"))
            .and(body_json(json!({
                "version": "1.0",
                "vehicles": [
                    {"identifier": {"type": "VIN", "value": "WVWZZZ1KZAW000001"}},
                    {"identifier": {"type": "VIN", "value": "WVWZZZ1KZAW000002"}}
                ],
                "dataItems": ["dtcconfirmed", "mileage"]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "inVehicleData": [
                    {
                        "identifier": {"type": "VIN", "value": "WVWZZZ1KZAW000001"},
                        "response": {"mileage": {"value": 42000, "unit": "km"}}
                    }
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let results = client
            .fetch_vehicle_data_batch(&vins(&["WVWZZZ1KZAW000001", "WVWZZZ1KZAW000002"]))
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        let first = results["WVWZZZ1KZAW000001"].as_ref().unwrap();
        assert_eq!(first.clone().into_payload()["mileage"]["value"], 42000);
        assert!(!results.contains_key("WVWZZZ1KZAW000002"));
    }

    #[tokio::test]
    async fn test_per_vehicle_error_does_not_fail_batch() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/delivery/v1/in-vehicle"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "inVehicleData": [
                    {
                        "identifier": {"type": "VIN", "value": "A1"},
                        "response": {"mileage": {"value": 10}}
                    },
                    {
                        "identifier": {"type": "VIN", "value": "B2"},
                        "response": {"error": {"message": "Vehicle not activated"}}
                    }
                ]
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let results = client.fetch_vehicle_data_batch(&vins(&["A1", "B2"])).await.unwrap();

        assert!(results["A1"].is_ok());
        assert_eq!(
            results["B2"],
            Err(ProviderError::Upstream {
                status: 502,
                message: Some("Vehicle not activated".to_string()),
            })
        );
    }

    #[tokio::test]
    async fn test_bad_request_surfaces_reason_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/delivery/v1/in-vehicle"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "reasonCode": "INVALID_DATA_ITEM",
                "reasonText": "Data item dtc is not part of the subscription"
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let result = client.fetch_vehicle_data_batch(&vins(&["A1"])).await;

        assert_eq!(
            result,
            Err(ProviderError::Upstream {
                status: 400,
                message: Some("Data item dtc is not part of the subscription".to_string()),
            })
        );
    }

    #[tokio::test]
    async fn test_single_vin_missing_from_response_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/delivery/v1/in-vehicle"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"inVehicleData": []})))
            .mount(&server)
            .await;

        let client = client_for(&server);
        assert_eq!(client.fetch_vehicle_data("A1").await, Err(ProviderError::NotFound));
    }

    #[tokio::test]
    async fn test_empty_batch_skips_network() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let client = client_for(&server);
        assert!(client.fetch_vehicle_data_batch(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_onboarding_is_synchronous() {
        let client = CarusoClient::new(
            Client::new(),
            "http://127.0.0.1:9",
            "sub",
            SecretString::from("key".to_string()),
            Vec::new(),
        );
        let vehicle = Vehicle::new_unlinked(
            crate::models::NewVehicle {
                vin: "A1".to_string(),
                provider: Provider::Caruso,
                brand: None,
            },
            chrono::Utc::now(),
        );

        let handle = client.request_onboarding(&vehicle).await.unwrap();
        assert_eq!(handle, OnboardingHandle::Completed { vin: "A1".to_string() });
        assert_eq!(client.check_onboarding_status(&handle).await, Ok(ClearanceStatus::Accepted));
    }
}
