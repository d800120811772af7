//! Disparo manual de los jobs de fondo

use std::sync::Arc;

use crate::services::{
    CycleOutcome, DispatchReport, LinkingReconciler, PassOutcome, PassReport, TelematicsDispatcher,
};
use crate::state::AppState;
use crate::utils::errors::{AppError, AppResult};

pub struct JobController {
    reconciler: Arc<LinkingReconciler>,
    dispatcher: Arc<TelematicsDispatcher>,
}

impl JobController {
    pub fn new(state: &AppState) -> Self {
        Self {
            reconciler: state.reconciler.clone(),
            dispatcher: state.dispatcher.clone(),
        }
    }

    pub async fn reconcile(&self) -> AppResult<PassReport> {
        match self.reconciler.run_pass().await? {
            PassOutcome::Completed(report) => Ok(report),
            PassOutcome::Skipped => Err(AppError::Conflict(
                "A reconciliation pass is already running".to_string(),
            )),
        }
    }

    pub async fn load_vehicle_data(&self) -> AppResult<DispatchReport> {
        match self.dispatcher.poll_linked_vehicles().await? {
            CycleOutcome::Completed(report) => Ok(report),
            CycleOutcome::Skipped => Err(AppError::Conflict(
                "A vehicle data load is already running".to_string(),
            )),
        }
    }
}
