//! Sistema de manejo de errores
//!
//! Este módulo define los errores del gateway y su conversión a respuestas
//! HTTP. Toda respuesta de error tiene la forma `{"error": "..."}` y nunca
//! expone detalles internos ni trazas del proveedor.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::clients::error::ProviderError;

pub const NOT_FOUND_MESSAGE: &str = "Not found.";
pub const FORBIDDEN_MESSAGE: &str = "Access Forbidden, make sure you are correctly authenticating.";
pub const UNAUTHORIZED_MESSAGE: &str = "Unauthorized, the provider rejected the access token.";
pub const PROXY_ERROR_MESSAGE: &str = "Proxy Error";
pub const GENERIC_ERROR_MESSAGE: &str = "Something went wrong";
pub const NO_RESPONSE_MESSAGE: &str = "No response received";
pub const CLEARANCE_REQUIRED_MESSAGE: &str =
    "No permission to access vehicle with this VIN, maybe you need to access clearance first";

/// Errores principales de la aplicación
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Validation error: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Upstream error {status}: {message}")]
    Upstream { status: StatusCode, message: String },

    #[error("Provider unreachable: {0}")]
    ProviderUnreachable(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self {
        AppError::Database(e.to_string())
    }
}

/// Mapeo de la taxonomía de errores del proveedor a respuestas del gateway
impl From<ProviderError> for AppError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::Validation(msg) => AppError::BadRequest(msg),
            ProviderError::Unauthorized => AppError::Unauthorized(UNAUTHORIZED_MESSAGE.to_string()),
            ProviderError::Forbidden => AppError::Forbidden(FORBIDDEN_MESSAGE.to_string()),
            ProviderError::NotFound => AppError::NotFound(NOT_FOUND_MESSAGE.to_string()),
            ProviderError::Upstream { status, message } => {
                let status_code =
                    StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                let message = match (status, message) {
                    (407, _) => PROXY_ERROR_MESSAGE.to_string(),
                    (400, Some(reason)) => reason,
                    _ => GENERIC_ERROR_MESSAGE.to_string(),
                };
                AppError::Upstream {
                    status: status_code,
                    message,
                }
            }
            ProviderError::Credentials(_) => AppError::Upstream {
                status: StatusCode::BAD_GATEWAY,
                message: GENERIC_ERROR_MESSAGE.to_string(),
            },
            ProviderError::Network(detail) => AppError::ProviderUnreachable(detail),
            ProviderError::Internal(detail) => AppError::Internal(detail),
        }
    }
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Database(_) | AppError::Internal(_) | AppError::ProviderUnreachable(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            AppError::Validation(_) | AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Upstream { status, .. } => *status,
        }
    }

    /// Mensaje visible para el cliente
    fn public_message(&self) -> String {
        match self {
            AppError::Database(_) | AppError::Internal(_) => GENERIC_ERROR_MESSAGE.to_string(),
            AppError::ProviderUnreachable(_) => NO_RESPONSE_MESSAGE.to_string(),
            AppError::Validation(e) => e.to_string(),
            AppError::BadRequest(msg)
            | AppError::Unauthorized(msg)
            | AppError::Forbidden(msg)
            | AppError::NotFound(msg)
            | AppError::Conflict(msg) => msg.clone(),
            AppError::Upstream { message, .. } => message.clone(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("❌ {}", self);
        } else {
            tracing::warn!("⚠️ {}", self);
        }

        (status, Json(json!({ "error": self.public_message() }))).into_response()
    }
}

/// Resultado tipado para operaciones que pueden fallar
pub type AppResult<T> = Result<T, AppError>;
