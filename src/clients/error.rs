//! Taxonomía de errores de los proveedores telemáticos
//!
//! Los clientes devuelven estos errores sin reintentar; reintentar es
//! responsabilidad del reconciliador.

use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;

pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    /// Entrada inválida, rechazada antes de cualquier llamada de red
    #[error("validation error: {0}")]
    Validation(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("not found")]
    NotFound,

    #[error("upstream error {status}: {message:?}")]
    Upstream { status: u16, message: Option<String> },

    /// Falló el intercambio de credenciales del propio gateway
    /// (`POST /access_tokens`); no es un rechazo del vehículo
    #[error("credential exchange failed: {0}")]
    Credentials(String),

    /// Sin respuesta: timeout, conexión rechazada, DNS...
    #[error("network error: {0}")]
    Network(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ProviderError {
    /// Construir el error a partir de una respuesta no-2xx
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        match status {
            StatusCode::UNAUTHORIZED => ProviderError::Unauthorized,
            StatusCode::FORBIDDEN => ProviderError::Forbidden,
            StatusCode::NOT_FOUND => ProviderError::NotFound,
            _ => ProviderError::Upstream {
                status: status.as_u16(),
                message: extract_error_message(body),
            },
        }
    }

    /// Errores que merecen un reintento en una pasada futura
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Network(_)
            | ProviderError::Unauthorized
            | ProviderError::Credentials(_) => true,
            ProviderError::Upstream { status, .. } => {
                *status >= 500 || *status == 429 || *status == 408
            }
            _ => false,
        }
    }

    /// Clase de error legible por máquina (ErrorLog.kind / Vehicle.last_error.code)
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::Validation(_) => "VALIDATION_ERROR",
            ProviderError::Unauthorized => "UNAUTHORIZED",
            ProviderError::Forbidden => "FORBIDDEN",
            ProviderError::NotFound => "NOT_FOUND",
            ProviderError::Upstream { .. } => "UPSTREAM_ERROR",
            ProviderError::Credentials(_) => "CREDENTIALS_ERROR",
            ProviderError::Network(_) => "NETWORK_ERROR",
            ProviderError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Status HTTP equivalente, 0 cuando no hubo respuesta
    pub fn status_code(&self) -> i32 {
        match self {
            ProviderError::Validation(_) => 400,
            ProviderError::Unauthorized => 401,
            ProviderError::Forbidden => 403,
            ProviderError::NotFound => 404,
            ProviderError::Upstream { status, .. } => i32::from(*status),
            ProviderError::Credentials(_) => 502,
            ProviderError::Network(_) => 0,
            ProviderError::Internal(_) => 500,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProviderError::Network(format!("request timed out: {}", e))
        } else if e.is_connect() || e.is_request() {
            ProviderError::Network(e.to_string())
        } else if e.is_decode() {
            ProviderError::Internal(format!("invalid provider response: {}", e))
        } else {
            ProviderError::Network(e.to_string())
        }
    }
}

/// Buscar un mensaje legible en el cuerpo de error del proveedor
/// (`reasonText` de Caruso, `errors[].detail` de High Mobility...)
pub fn extract_error_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    message_from_value(&value)
}

pub(crate) fn message_from_value(value: &Value) -> Option<String> {
    for key in ["reasonText", "message", "error_description", "detail", "title"] {
        if let Some(text) = value.get(key).and_then(Value::as_str) {
            return Some(text.to_string());
        }
    }
    match value.get("error") {
        Some(Value::String(text)) => return Some(text.clone()),
        Some(nested @ Value::Object(_)) => return message_from_value(nested),
        _ => {}
    }
    value
        .get("errors")
        .and_then(Value::as_array)
        .and_then(|errors| errors.first())
        .and_then(message_from_value)
}
