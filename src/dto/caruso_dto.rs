//! DTOs de consultas Caruso

use serde_json::{json, Map, Value};

use crate::clients::BatchVehicleData;

/// Mapa VIN -> respuesta del proveedor; los errores por vehículo se
/// devuelven como `{"error": ...}` y los VINs ausentes se omiten
pub fn vehicle_data_map(batch: BatchVehicleData) -> Map<String, Value> {
    batch
        .into_iter()
        .map(|(vin, result)| {
            let value = match result {
                Ok(data) => data.into_payload(),
                Err(e) => json!({ "error": e.to_string() }),
            };
            (vin, value)
        })
        .collect()
}
