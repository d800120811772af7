//! Utilidades de validación
//!
//! Este módulo contiene funciones helper para validar VINs y datos de entrada
//! antes de cualquier llamada a un proveedor.

use lazy_static::lazy_static;
use regex::Regex;
use validator::ValidationError;

use super::errors::{AppError, AppResult};

lazy_static! {
    /// VIN alfanumérico de hasta 17 caracteres (los VINs sandbox no siguen ISO 3779)
    pub static ref VIN_REGEX: Regex = Regex::new(r"^[A-Z0-9]{1,17}$").unwrap();
}

/// Normalizar un VIN: sin espacios y en mayúsculas
pub fn normalize_vin(vin: &str) -> String {
    vin.trim().to_ascii_uppercase()
}

/// Validar un VIN (validator custom)
pub fn validate_vin(value: &str) -> Result<(), ValidationError> {
    if VIN_REGEX.is_match(&normalize_vin(value)) {
        return Ok(());
    }
    let mut error = ValidationError::new("vin");
    error.add_param("value".into(), &value.to_string());
    error.message = Some("VIN must be 1-17 alphanumeric characters".into());
    Err(error)
}

/// Validar que un string no esté vacío
pub fn validate_not_empty(value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        let mut error = ValidationError::new("not_empty");
        error.add_param("value".into(), &value.to_string());
        return Err(error);
    }
    Ok(())
}

/// Validar una lista de VINs para consultas batch; devuelve los VINs
/// normalizados sin duplicados, en el orden recibido
pub fn validate_vin_list(vins: &[String]) -> AppResult<Vec<String>> {
    if vins.is_empty() {
        return Err(AppError::BadRequest(
            "Please include one or more VINs in the request body".to_string(),
        ));
    }

    let mut normalized: Vec<String> = Vec::with_capacity(vins.len());
    for vin in vins {
        validate_vin(vin).map_err(|_| AppError::BadRequest(format!("Invalid VIN '{}'", vin)))?;
        let vin = normalize_vin(vin);
        if !normalized.contains(&vin) {
            normalized.push(vin);
        }
    }
    Ok(normalized)
}
