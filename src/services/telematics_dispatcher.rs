//! Dispatcher de consultas telemáticas
//!
//! Consulta los datos de los vehículos LINKED y los guarda como
//! `TelemetryRecord`. Los proveedores con consultas batch reciben una sola
//! llamada por ciclo; el resto una llamada por VIN con concurrencia acotada.
//! Cada fallo queda en un `ErrorLog` más un registro sin datos enlazado a él.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::clients::{
    BatchVehicleData, ProviderClient, ProviderClients, ProviderError, ProviderResult,
    VehicleDataResponse,
};
use crate::models::{LinkingStatus, NewErrorLog, NewTelemetryRecord, Provider};
use crate::repositories::{TelemetryStore, VehicleRegistry};
use crate::services::metrics;
use crate::utils::errors::{AppError, AppResult};

pub const MISSING_FROM_RESPONSE: &str = "MISSING_FROM_RESPONSE";
pub const CLEARANCE_REQUIRED: &str = "CLEARANCE_REQUIRED";
pub const VIN_UNKNOWN: &str = "VIN_UNKNOWN";
pub const UPSTREAM_ERROR: &str = "UPSTREAM_ERROR";
pub const NETWORK_ERROR: &str = "NETWORK_ERROR";

/// Clase de ErrorLog para un error de consulta de datos
pub fn error_kind(e: &ProviderError) -> &'static str {
    match e {
        ProviderError::Forbidden => CLEARANCE_REQUIRED,
        ProviderError::NotFound => VIN_UNKNOWN,
        ProviderError::Network(_) => NETWORK_ERROR,
        _ => UPSTREAM_ERROR,
    }
}

/// Resultado de un VIN en un ciclo
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Stored { record_id: i64 },
    ErrorLogged { kind: String, error_log_id: i64 },
    /// No se pudo escribir en la base de datos
    NotPersisted { message: String },
}

impl DispatchOutcome {
    fn label(&self) -> &'static str {
        match self {
            DispatchOutcome::Stored { .. } => "stored",
            DispatchOutcome::ErrorLogged { .. } => "error_logged",
            DispatchOutcome::NotPersisted { .. } => "not_persisted",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchEntry {
    pub vin: String,
    pub provider: Provider,
    #[serde(flatten)]
    pub outcome: DispatchOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stored: usize,
    pub errors: usize,
    pub entries: Vec<DispatchEntry>,
}

impl DispatchReport {
    fn new(started_at: DateTime<Utc>, mut entries: Vec<DispatchEntry>) -> Self {
        entries.sort_by(|a, b| a.vin.cmp(&b.vin));
        let stored = entries
            .iter()
            .filter(|entry| matches!(entry.outcome, DispatchOutcome::Stored { .. }))
            .count();
        Self {
            started_at,
            finished_at: Utc::now(),
            stored,
            errors: entries.len() - stored,
            entries,
        }
    }

    pub fn outcome_of(&self, vin: &str) -> Option<&DispatchOutcome> {
        self.entries
            .iter()
            .find(|entry| entry.vin == vin)
            .map(|entry| &entry.outcome)
    }
}

#[derive(Debug, Clone)]
pub enum CycleOutcome {
    Completed(DispatchReport),
    Skipped,
}

pub struct TelematicsDispatcher {
    registry: Arc<dyn VehicleRegistry>,
    telemetry: Arc<dyn TelemetryStore>,
    providers: ProviderClients,
    per_vin_concurrency: usize,
    in_flight: Mutex<()>,
}

impl TelematicsDispatcher {
    pub fn new(
        registry: Arc<dyn VehicleRegistry>,
        telemetry: Arc<dyn TelemetryStore>,
        providers: ProviderClients,
        per_vin_concurrency: usize,
    ) -> Self {
        Self {
            registry,
            telemetry,
            providers,
            per_vin_concurrency: per_vin_concurrency.max(1),
            in_flight: Mutex::new(()),
        }
    }

    /// Ciclo completo sobre todos los vehículos LINKED
    pub async fn poll_linked_vehicles(&self) -> AppResult<CycleOutcome> {
        let Ok(_guard) = self.in_flight.try_lock() else {
            info!("⏭️ Carga de datos ya en curso, se omite esta ejecución");
            metrics::record_job_run(metrics::DISPATCH_JOB, "skipped");
            return Ok(CycleOutcome::Skipped);
        };

        let started_at = Utc::now();
        let timer = Instant::now();
        let linked = match self.registry.list_by_status(&[LinkingStatus::Linked]).await {
            Ok(linked) => linked,
            Err(e) => {
                error!("❌ No se pudo leer el registro de vehículos: {}", e);
                metrics::record_job_run(metrics::DISPATCH_JOB, "error");
                return Err(e);
            }
        };

        let mut by_provider: BTreeMap<Provider, Vec<String>> = BTreeMap::new();
        for vehicle in linked {
            by_provider.entry(vehicle.provider).or_default().push(vehicle.vin);
        }

        let mut entries = Vec::new();
        for (provider, vins) in by_provider {
            let Some(client) = self.providers.get(provider) else {
                warn!(
                    "⚠️ Sin cliente configurado para {}, {} vehículos sin consultar",
                    provider,
                    vins.len()
                );
                continue;
            };
            info!("📡 Consultando {} vehículos de {}", vins.len(), provider);
            let results = self.fetch(client.as_ref(), &vins).await;
            entries.extend(self.persist(provider, &vins, results).await);
        }

        let report = DispatchReport::new(started_at, entries);
        metrics::record_job_run(metrics::DISPATCH_JOB, "completed");
        metrics::observe_job_duration(metrics::DISPATCH_JOB, timer.elapsed().as_secs_f64());
        info!(
            "✅ Carga de datos terminada: {} registros, {} errores",
            report.stored, report.errors
        );

        Ok(CycleOutcome::Completed(report))
    }

    /// Consulta ad-hoc a Caruso desde la API. Devuelve la respuesta
    /// demultiplexada; solo se persisten los VINs CARUSO del registro.
    pub async fn query_caruso(&self, vins: &[String]) -> AppResult<BatchVehicleData> {
        let client = self
            .providers
            .get(Provider::Caruso)
            .ok_or_else(|| AppError::Internal("Caruso client is not configured".to_string()))?;

        let results = client.fetch_vehicle_data_batch(vins).await;

        let mut known = Vec::new();
        for vin in vins {
            match self.registry.get(vin).await {
                Ok(Some(vehicle)) if vehicle.provider == Provider::Caruso => {
                    known.push(vin.clone())
                }
                Ok(_) => {}
                Err(e) => warn!("⚠️ No se pudo comprobar {} en el registro: {}", vin, e),
            }
        }
        if !known.is_empty() {
            let known_set: HashSet<&String> = known.iter().collect();
            let subset = match &results {
                Ok(batch) => Ok(batch
                    .iter()
                    .filter(|(vin, _)| known_set.contains(vin))
                    .map(|(vin, result)| (vin.clone(), result.clone()))
                    .collect()),
                Err(e) => Err(e.clone()),
            };
            self.persist(Provider::Caruso, &known, subset).await;
        }

        results.map_err(AppError::from)
    }

    async fn fetch(
        &self,
        client: &dyn ProviderClient,
        vins: &[String],
    ) -> ProviderResult<BatchVehicleData> {
        if client.capabilities().batch_queries {
            return client.fetch_vehicle_data_batch(vins).await;
        }

        let results: BatchVehicleData = stream::iter(vins.iter().cloned())
            .map(|vin| async move {
                let result = client.fetch_vehicle_data(&vin).await;
                (vin, result)
            })
            .buffer_unordered(self.per_vin_concurrency)
            .collect()
            .await;
        Ok(results)
    }

    /// Guardar el resultado de cada VIN pedido
    async fn persist(
        &self,
        provider: Provider,
        vins: &[String],
        results: ProviderResult<BatchVehicleData>,
    ) -> Vec<DispatchEntry> {
        let now = Utc::now();
        let mut batch = match results {
            Ok(batch) => batch,
            Err(e) => {
                warn!("❌ Falló el batch de {} ({} VINs): {}", provider, vins.len(), e);
                vins.iter().map(|vin| (vin.clone(), Err(e.clone()))).collect()
            }
        };

        let mut entries = Vec::with_capacity(vins.len());
        for vin in vins {
            let outcome = match batch.remove(vin) {
                Some(Ok(data)) => self.store_data(vin, data, now).await,
                Some(Err(e)) => {
                    let log = NewErrorLog {
                        vin: Some(vin.clone()),
                        provider,
                        error_code: e.status_code(),
                        kind: error_kind(&e).to_string(),
                        value: e.to_string(),
                        notes: Some(json!({ "provider_error": e.kind() })),
                        created_at: now,
                    };
                    self.store_error(vin, log, now).await
                }
                None => {
                    let log = NewErrorLog {
                        vin: Some(vin.clone()),
                        provider,
                        error_code: 200,
                        kind: MISSING_FROM_RESPONSE.to_string(),
                        value: format!("{} did not return data for {}", provider, vin),
                        notes: Some(json!({ "requested": vins.len() })),
                        created_at: now,
                    };
                    self.store_error(vin, log, now).await
                }
            };
            metrics::record_dispatch_outcome(provider, outcome.label());
            entries.push(DispatchEntry {
                vin: vin.clone(),
                provider,
                outcome,
            });
        }
        entries
    }

    async fn store_data(
        &self,
        vin: &str,
        data: VehicleDataResponse,
        now: DateTime<Utc>,
    ) -> DispatchOutcome {
        let record = NewTelemetryRecord {
            vin: vin.to_string(),
            provider: data.provider(),
            data: Some(data.into_payload()),
            captured_at: now,
            error_log_id: None,
        };
        match self.telemetry.append_record(record).await {
            Ok(stored) => DispatchOutcome::Stored { record_id: stored.id },
            Err(e) => not_persisted(vin, e),
        }
    }

    async fn store_error(
        &self,
        vin: &str,
        log: NewErrorLog,
        now: DateTime<Utc>,
    ) -> DispatchOutcome {
        let provider = log.provider;
        let kind = log.kind.clone();
        let stored = match self.telemetry.append_error(log).await {
            Ok(stored) => stored,
            Err(e) => return not_persisted(vin, e),
        };
        warn!("⚠️ {} sin datos de {}: {}", vin, provider, kind);

        let placeholder = NewTelemetryRecord {
            vin: vin.to_string(),
            provider,
            data: None,
            captured_at: now,
            error_log_id: Some(stored.id),
        };
        if let Err(e) = self.telemetry.append_record(placeholder).await {
            return not_persisted(vin, e);
        }

        DispatchOutcome::ErrorLogged {
            kind,
            error_log_id: stored.id,
        }
    }
}

fn not_persisted(vin: &str, e: AppError) -> DispatchOutcome {
    error!("❌ No se pudo guardar el resultado de {}: {}", vin, e);
    DispatchOutcome::NotPersisted {
        message: e.to_string(),
    }
}
