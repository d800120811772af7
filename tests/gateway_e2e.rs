use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::util::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use telematics_gateway::cache::TokenCache;
use telematics_gateway::clients::{CarusoClient, HighMobilityClient, HighMobilityTokenSource};
use telematics_gateway::middleware::auth::AdminCredentials;
use telematics_gateway::models::{LinkingStatus, Provider, Vehicle};
use telematics_gateway::repositories::{
    InMemoryClearanceStore, InMemoryTelemetryStore, InMemoryVehicleRegistry,
};
use telematics_gateway::routes::create_router;
use telematics_gateway::services::ReconcilerConfig;
use telematics_gateway::state::{AppState, Stores};
use telematics_gateway::utils::errors::{CLEARANCE_REQUIRED_MESSAGE, FORBIDDEN_MESSAGE};

const VIN_A: &str = "WVWZZZ1KZAW000001";
const VIN_B: &str = "WVWZZZ1KZAW000002";

struct TestApp {
    router: Router,
    telemetry: Arc<InMemoryTelemetryStore>,
}

async fn create_test_app(high_mobility: &MockServer, caruso: &MockServer) -> TestApp {
    let http = reqwest::Client::new();
    let source = HighMobilityTokenSource::new(
        http.clone(),
        high_mobility.uri(),
        "client-id",
        secrecy::SecretString::from("client-secret".to_string()),
    );
    let tokens = Arc::new(TokenCache::new(
        Provider::HighMobility,
        Arc::new(source),
        Duration::from_secs(60),
    ));
    let hm_client = Arc::new(HighMobilityClient::new(http.clone(), high_mobility.uri(), tokens));
    let caruso_client = Arc::new(CarusoClient::new(
        http,
        caruso.uri(),
        "sub-123",
        secrecy::SecretString::from("api-key".to_string()),
        vec!["mileage".to_string()],
    ));

    let telemetry = Arc::new(InMemoryTelemetryStore::new());
    let stores = Stores {
        registry: Arc::new(InMemoryVehicleRegistry::new()),
        clearances: Arc::new(InMemoryClearanceStore::new()),
        telemetry: telemetry.clone(),
    };
    let admin = AdminCredentials::new("admin", bcrypt::hash("secret", 4).unwrap());

    let state = AppState::new(
        admin,
        stores,
        hm_client,
        caruso_client,
        ReconcilerConfig::default(),
        4,
    );

    TestApp {
        router: create_router(state, &[]),
        telemetry,
    }
}

fn admin_auth() -> String {
    format!("Basic {}", STANDARD.encode("admin:secret"))
}

async fn call(
    app: &TestApp,
    method: Method,
    uri: &str,
    auth: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(auth) = auth {
        builder = builder.header(header::AUTHORIZATION, auth);
    }
    let body = match body {
        Some(json) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };

    let response = app.router.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).to_string()))
    };
    (status, json)
}

async fn mount_token(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/access_tokens"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "managed-token",
            "expires_in": 3600
        })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_health_and_metrics_are_public() {
    let (hm, caruso) = (MockServer::start().await, MockServer::start().await);
    let app = create_test_app(&hm, &caruso).await;

    let (status, body) = call(&app, Method::GET, "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, _) = call(&app, Method::GET, "/metrics", None, None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_created_clearance_is_reconciled_to_pending() {
    let (hm, caruso) = (MockServer::start().await, MockServer::start().await);
    mount_token(&hm).await;
    Mock::given(method("POST"))
        .and(path("/fleets/vehicles"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "vehicles": [{"vin": VIN_A, "status": "pending"}]
        })))
        .expect(2)
        .mount(&hm)
        .await;
    let app = create_test_app(&hm, &caruso).await;

    let (status, body) = call(
        &app,
        Method::POST,
        "/clearances",
        Some(&admin_auth()),
        Some(json!([{"vin": VIN_A, "brand": "bmw", "tags": {"fleet": "north"}}])),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["vehicles"][0]["vin"], VIN_A);

    let uri = format!("/vehicles/{}", VIN_A);
    let (status, body) = call(&app, Method::GET, &uri, Some(&admin_auth()), None).await;
    assert_eq!(status, StatusCode::OK);
    let vehicle: Vehicle = serde_json::from_value(body).unwrap();
    assert_eq!(vehicle.provider, Provider::HighMobility);
    assert_eq!(vehicle.linking_status, LinkingStatus::Unlinked);
    assert_eq!(vehicle.brand.as_deref(), Some("bmw"));

    let (status, _) = call(&app, Method::POST, "/jobs/reconcile", Some(&admin_auth()), None).await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = call(&app, Method::GET, &uri, Some(&admin_auth()), None).await;
    let vehicle: Vehicle = serde_json::from_value(body).unwrap();
    assert_eq!(vehicle.linking_status, LinkingStatus::PendingClearance);
}

#[tokio::test]
async fn test_empty_clearance_request_is_rejected() {
    let (hm, caruso) = (MockServer::start().await, MockServer::start().await);
    let app = create_test_app(&hm, &caruso).await;

    let (status, body) =
        call(&app, Method::POST, "/clearances", Some(&admin_auth()), Some(json!([]))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("VIN + Brand"));
}

#[tokio::test]
async fn test_vehicle_data_without_clearance_is_forbidden() {
    let (hm, caruso) = (MockServer::start().await, MockServer::start().await);
    Mock::given(method("GET"))
        .and(path(format!("/vehicle-data/autoapi-13/{}", VIN_A)))
        .respond_with(
            ResponseTemplate::new(403).set_body_json(json!({"errors": [{"title": "Forbidden"}]})),
        )
        .expect(1)
        .mount(&hm)
        .await;
    let app = create_test_app(&hm, &caruso).await;

    let uri = format!("/vehicle-data/{}", VIN_A);
    let (status, body) = call(&app, Method::GET, &uri, Some("Bearer caller-token"), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], CLEARANCE_REQUIRED_MESSAGE);
}

#[tokio::test]
async fn test_caruso_batch_records_data_and_missing_vin() {
    let (hm, caruso) = (MockServer::start().await, MockServer::start().await);
    Mock::given(method("POST"))
        .and(path("/delivery/v1/in-vehicle"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "inVehicleData": [
                {
                    "identifier": {"type": "VIN", "value": VIN_A},
                    "response": {"mileage": {"value": 42000, "unit": "km"}}
                }
            ]
        })))
        .expect(1)
        .mount(&caruso)
        .await;
    let app = create_test_app(&hm, &caruso).await;

    for vin in [VIN_A, VIN_B] {
        let (status, _) = call(
            &app,
            Method::POST,
            "/vehicles",
            Some(&admin_auth()),
            Some(json!({"vin": vin, "provider": "CARUSO"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
    }

    let (status, body) = call(
        &app,
        Method::POST,
        "/caruso/vehicle-data",
        Some(&admin_auth()),
        Some(json!([VIN_A, VIN_B])),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[VIN_A]["mileage"]["value"], 42000);
    assert!(body.get(VIN_B).is_none());

    let records = app.telemetry.all_records().await;
    assert!(records.iter().any(|r| r.vin == VIN_A && r.data.is_some()));
    assert!(!records.iter().any(|r| r.vin == VIN_B && r.data.is_some()));

    let errors = app.telemetry.all_errors().await;
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].vin.as_deref(), Some(VIN_B));
    assert_eq!(errors[0].provider, Provider::Caruso);
}

#[tokio::test]
async fn test_admin_routes_require_basic_admin() {
    let (hm, caruso) = (MockServer::start().await, MockServer::start().await);
    let app = create_test_app(&hm, &caruso).await;

    for auth in [None, Some("Bearer hm-token")] {
        let (status, body) = call(&app, Method::GET, "/vehicles", auth, None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], FORBIDDEN_MESSAGE);
    }

    let (status, body) = call(&app, Method::GET, "/vehicles", Some(&admin_auth()), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));
}

#[tokio::test]
async fn test_unknown_vehicle_is_not_found() {
    let (hm, caruso) = (MockServer::start().await, MockServer::start().await);
    let app = create_test_app(&hm, &caruso).await;

    let uri = format!("/vehicles/{}", VIN_B);
    let (status, _) = call(&app, Method::GET, &uri, Some(&admin_auth()), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
