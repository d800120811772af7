//! Controller de Caruso

use serde_json::{Map, Value};
use std::sync::Arc;

use crate::dto::caruso_dto::vehicle_data_map;
use crate::services::TelematicsDispatcher;
use crate::state::AppState;
use crate::utils::errors::AppResult;
use crate::utils::validation::validate_vin_list;

pub struct CarusoController {
    dispatcher: Arc<TelematicsDispatcher>,
}

impl CarusoController {
    pub fn new(state: &AppState) -> Self {
        Self {
            dispatcher: state.dispatcher.clone(),
        }
    }

    /// Consulta batch; devuelve VIN -> datos
    pub async fn get_vehicle_data(&self, vins: Vec<String>) -> AppResult<Map<String, Value>> {
        let vins = validate_vin_list(&vins)?;
        let batch = self.dispatcher.query_caruso(&vins).await?;
        Ok(vehicle_data_map(batch))
    }
}
