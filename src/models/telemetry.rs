//! Modelos de datos telemáticos
//!
//! `TelemetryRecord` y `ErrorLog` son append-only: nunca se modifican después
//! de crearse y solo se borran lógicamente con `deleted_at`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::vehicle::Provider;

/// Registro de datos telemáticos de un vehículo
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq)]
pub struct TelemetryRecord {
    pub id: i64,
    pub vin: String,
    pub provider: Provider,
    /// Payload normalizado; `None` cuando la consulta falló
    pub data: Option<serde_json::Value>,
    pub captured_at: DateTime<Utc>,
    pub error_log_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewTelemetryRecord {
    pub vin: String,
    pub provider: Provider,
    pub data: Option<serde_json::Value>,
    pub captured_at: DateTime<Utc>,
    pub error_log_id: Option<i64>,
}

/// Entrada del log de errores de consultas a proveedores
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq)]
pub struct ErrorLog {
    pub id: i64,
    pub vin: Option<String>,
    pub provider: Provider,
    /// Status HTTP del proveedor, 0 para fallos de transporte
    pub error_code: i32,
    pub kind: String,
    pub value: String,
    pub notes: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewErrorLog {
    pub vin: Option<String>,
    pub provider: Provider,
    pub error_code: i32,
    pub kind: String,
    pub value: String,
    pub notes: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}
