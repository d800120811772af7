//! Reconciliador de vinculación de vehículos
//!
//! Cada pasada toma los vehículos en UNLINKED o PENDING_CLEARANCE, hace como
//! máximo una llamada al proveedor por vehículo y escribe como máximo una
//! transición. Un fallo en un vehículo nunca corta la pasada.
//!
//! ```text
//! UNLINKED ──clearance enviada──▶ PENDING_CLEARANCE ──accepted──▶ LINKED
//!     │                                  │
//!     └──────── rechazo / validación / límite de reintentos ──────▶ FAILED
//! ```

use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::clients::{OnboardingHandle, ProviderClients, ProviderError};
use crate::config::EnvironmentConfig;
use crate::models::{
    ClearanceRequest, ClearanceStatus, LinkingStatus, Provider, StatusUpdate, Vehicle, VehicleError,
};
use crate::repositories::{ClearanceStore, VehicleRegistry};
use crate::services::metrics;
use crate::utils::errors::{AppError, AppResult};

pub const RETRY_LIMIT_EXCEEDED: &str = "RETRY_LIMIT_EXCEEDED";
pub const LINKING_TIMED_OUT: &str = "LINKING_TIMED_OUT";
pub const CLEARANCE_REJECTED: &str = "CLEARANCE_REJECTED";
pub const CLEARANCE_NOT_FOUND: &str = "CLEARANCE_NOT_FOUND";

/// Parámetros de una pasada
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub concurrency: usize,
    /// 0 desactiva el dead-letter por intentos
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub max_backoff: Duration,
    pub max_link_age: Option<Duration>,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            max_attempts: 10,
            backoff_base: Duration::minutes(5),
            max_backoff: Duration::hours(24),
            max_link_age: None,
        }
    }
}

impl ReconcilerConfig {
    pub fn from_env(config: &EnvironmentConfig) -> Self {
        Self {
            concurrency: config.reconcile_concurrency.max(1),
            max_attempts: config.max_link_attempts,
            backoff_base: Duration::from_std(config.retry_backoff_base)
                .unwrap_or_else(|_| Duration::minutes(5)),
            max_link_age: config.max_link_age,
            ..Self::default()
        }
    }

    /// Espera tras `attempts` intentos fallidos: base·2^(n-1), con tope
    pub fn backoff_for(&self, attempts: i32) -> Duration {
        if attempts <= 0 {
            return Duration::zero();
        }
        let exponent = (attempts - 1).min(40) as u32;
        let millis = self
            .backoff_base
            .num_milliseconds()
            .saturating_mul(1i64 << exponent);
        Duration::milliseconds(millis.min(self.max_backoff.num_milliseconds()))
    }

    /// El vehículo sigue dentro de su ventana de backoff
    pub fn in_backoff(&self, vehicle: &Vehicle, now: DateTime<Utc>) -> bool {
        match vehicle.last_attempt_at {
            Some(last) if vehicle.attempt_count > 0 => {
                now < last + self.backoff_for(vehicle.attempt_count)
            }
            _ => false,
        }
    }

    /// Edad medida desde el inicio del intento actual, no desde el alta
    fn timed_out(&self, vehicle: &Vehicle, now: DateTime<Utc>) -> bool {
        self.max_link_age
            .map_or(false, |max_age| now - vehicle.linking_started_at > max_age)
    }
}

/// Resultado de un vehículo en una pasada
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum VehicleOutcome {
    Transitioned { from: LinkingStatus, to: LinkingStatus },
    Unchanged,
    RetryScheduled { attempt: i32, error: String },
    Failed { code: String, message: String },
    Skipped { reason: String },
}

impl VehicleOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            VehicleOutcome::Transitioned { .. } => "transitioned",
            VehicleOutcome::Unchanged => "unchanged",
            VehicleOutcome::RetryScheduled { .. } => "retry_scheduled",
            VehicleOutcome::Failed { .. } => "failed",
            VehicleOutcome::Skipped { .. } => "skipped",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VehicleReport {
    pub vin: String,
    pub provider: Provider,
    #[serde(flatten)]
    pub outcome: VehicleOutcome,
}

/// Conteos por proveedor
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProviderCounts {
    pub transitioned: usize,
    pub unchanged: usize,
    pub retry_scheduled: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl ProviderCounts {
    fn add(&mut self, outcome: &VehicleOutcome) {
        match outcome {
            VehicleOutcome::Transitioned { .. } => self.transitioned += 1,
            VehicleOutcome::Unchanged => self.unchanged += 1,
            VehicleOutcome::RetryScheduled { .. } => self.retry_scheduled += 1,
            VehicleOutcome::Failed { .. } => self.failed += 1,
            VehicleOutcome::Skipped { .. } => self.skipped += 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PassReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub vehicles: Vec<VehicleReport>,
    pub per_provider: BTreeMap<Provider, ProviderCounts>,
}

impl PassReport {
    fn new(started_at: DateTime<Utc>, mut vehicles: Vec<VehicleReport>) -> Self {
        vehicles.sort_by(|a, b| a.vin.cmp(&b.vin));
        let mut per_provider: BTreeMap<Provider, ProviderCounts> = BTreeMap::new();
        for report in &vehicles {
            per_provider.entry(report.provider).or_default().add(&report.outcome);
        }
        Self {
            started_at,
            finished_at: Utc::now(),
            vehicles,
            per_provider,
        }
    }

    pub fn outcome_of(&self, vin: &str) -> Option<&VehicleOutcome> {
        self.vehicles
            .iter()
            .find(|report| report.vin == vin)
            .map(|report| &report.outcome)
    }

    pub fn totals(&self) -> ProviderCounts {
        let mut totals = ProviderCounts::default();
        for report in &self.vehicles {
            totals.add(&report.outcome);
        }
        totals
    }
}

/// Proveedores cuyo intercambio de credenciales falló durante la pasada;
/// el resto de sus vehículos se omite sin llamar al proveedor
#[derive(Default)]
struct CredentialFaults(std::sync::Mutex<HashSet<Provider>>);

impl CredentialFaults {
    fn mark(&self, provider: Provider) {
        if let Ok(mut providers) = self.0.lock() {
            providers.insert(provider);
        }
    }

    fn contains(&self, provider: Provider) -> bool {
        self.0
            .lock()
            .map_or(false, |providers| providers.contains(&provider))
    }
}

/// Resultado de pedir una pasada
#[derive(Debug, Clone)]
pub enum PassOutcome {
    Completed(PassReport),
    /// Ya había una pasada en curso
    Skipped,
}

pub struct LinkingReconciler {
    registry: Arc<dyn VehicleRegistry>,
    clearances: Arc<dyn ClearanceStore>,
    providers: ProviderClients,
    config: ReconcilerConfig,
    in_flight: Mutex<()>,
}

impl LinkingReconciler {
    pub fn new(
        registry: Arc<dyn VehicleRegistry>,
        clearances: Arc<dyn ClearanceStore>,
        providers: ProviderClients,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            registry,
            clearances,
            providers,
            config,
            in_flight: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    pub async fn run_pass(&self) -> AppResult<PassOutcome> {
        self.run_pass_at(Utc::now()).await
    }

    /// Ejecutar una pasada tomando `now` como reloj de referencia
    pub async fn run_pass_at(&self, now: DateTime<Utc>) -> AppResult<PassOutcome> {
        let Ok(_guard) = self.in_flight.try_lock() else {
            info!("⏭️ Reconciliación ya en curso, se omite esta ejecución");
            metrics::record_job_run(metrics::RECONCILE_JOB, "skipped");
            return Ok(PassOutcome::Skipped);
        };

        let timer = Instant::now();
        let vehicles = match self.registry.list_by_status(&LinkingStatus::RECONCILABLE).await {
            Ok(vehicles) => vehicles,
            Err(e) => {
                error!("❌ No se pudo leer el registro de vehículos: {}", e);
                metrics::record_job_run(metrics::RECONCILE_JOB, "error");
                return Err(e);
            }
        };
        info!("🔄 Reconciliación iniciada: {} vehículos pendientes", vehicles.len());

        let faults = CredentialFaults::default();
        let reports: Vec<VehicleReport> = stream::iter(vehicles)
            .map(|vehicle| self.reconcile_vehicle(vehicle, now, &faults))
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        let report = PassReport::new(now, reports);
        for vehicle in &report.vehicles {
            metrics::record_reconcile_outcome(vehicle.provider, vehicle.outcome.label());
        }
        metrics::record_job_run(metrics::RECONCILE_JOB, "completed");
        metrics::observe_job_duration(metrics::RECONCILE_JOB, timer.elapsed().as_secs_f64());

        let totals = report.totals();
        info!(
            "✅ Reconciliación terminada: {} transiciones, {} sin cambios, {} reintentos, \
             {} fallidos, {} omitidos",
            totals.transitioned,
            totals.unchanged,
            totals.retry_scheduled,
            totals.failed,
            totals.skipped
        );

        Ok(PassOutcome::Completed(report))
    }

    async fn reconcile_vehicle(
        &self,
        vehicle: Vehicle,
        now: DateTime<Utc>,
        faults: &CredentialFaults,
    ) -> VehicleReport {
        let outcome = self.decide(&vehicle, now, faults).await;
        VehicleReport {
            vin: vehicle.vin,
            provider: vehicle.provider,
            outcome,
        }
    }

    async fn decide(
        &self,
        vehicle: &Vehicle,
        now: DateTime<Utc>,
        faults: &CredentialFaults,
    ) -> VehicleOutcome {
        if self.config.timed_out(vehicle, now) {
            let error = VehicleError::new(
                LINKING_TIMED_OUT,
                format!("Vehicle was not linked within {} hours", vehicle_age_limit(&self.config)),
                now,
            );
            return self.write(vehicle, StatusUpdate::Failed { error }, now).await;
        }

        if self.config.in_backoff(vehicle, now) {
            debug!("⏳ {} en backoff tras {} intentos", vehicle.vin, vehicle.attempt_count);
            return VehicleOutcome::Skipped {
                reason: "retry backoff".to_string(),
            };
        }

        let Some(client) = self.providers.get(vehicle.provider) else {
            warn!("⚠️ Sin cliente configurado para {}", vehicle.provider);
            return VehicleOutcome::Skipped {
                reason: format!("no client configured for {}", vehicle.provider),
            };
        };

        if faults.contains(vehicle.provider) {
            return credentials_unavailable(vehicle.provider);
        }

        match vehicle.linking_status {
            LinkingStatus::Unlinked => match client.request_onboarding(vehicle).await {
                Ok(OnboardingHandle::Completed { .. }) => {
                    self.write(vehicle, StatusUpdate::Transition { to: LinkingStatus::Linked }, now)
                        .await
                }
                Ok(OnboardingHandle::Submitted { vin, brand }) => {
                    let brand = brand.or_else(|| vehicle.brand.clone()).unwrap_or_default();
                    if let Err(e) = self
                        .clearances
                        .upsert(ClearanceRequest::submitted(vin, brand, now))
                        .await
                    {
                        return persistence_failure(vehicle, e);
                    }
                    info!("📨 Clearance enviada para {}", vehicle.vin);
                    self.write(
                        vehicle,
                        StatusUpdate::Transition { to: LinkingStatus::PendingClearance },
                        now,
                    )
                    .await
                }
                Err(e) => self.provider_failure(vehicle, e, now, faults).await,
            },
            LinkingStatus::PendingClearance => {
                let stored = match self.clearances.get(&vehicle.vin).await {
                    Ok(stored) => stored,
                    Err(e) => return persistence_failure(vehicle, e),
                };
                // sin consulta de estado el alta se da por confirmada
                let capabilities = client.capabilities();
                let handle = match &stored {
                    Some(request) if capabilities.onboarding_status => OnboardingHandle::Submitted {
                        vin: request.vin.clone(),
                        brand: Some(request.brand.clone()),
                    },
                    None if capabilities.onboarding && capabilities.onboarding_status => {
                        OnboardingHandle::Submitted {
                            vin: vehicle.vin.clone(),
                            brand: vehicle.brand.clone(),
                        }
                    }
                    _ => OnboardingHandle::Completed {
                        vin: vehicle.vin.clone(),
                    },
                };

                match client.check_onboarding_status(&handle).await {
                    Ok(ClearanceStatus::Pending) => {
                        let last_status = stored.as_ref().map(|request| request.last_status);
                        if last_status.is_some_and(|status| status != ClearanceStatus::Pending) {
                            self.note_clearance(&vehicle.vin, ClearanceStatus::Pending, now).await;
                        }
                        VehicleOutcome::Unchanged
                    }
                    Ok(ClearanceStatus::Accepted) => {
                        self.note_clearance(&vehicle.vin, ClearanceStatus::Accepted, now).await;
                        let update = StatusUpdate::Transition { to: LinkingStatus::Linked };
                        self.write(vehicle, update, now).await
                    }
                    Ok(ClearanceStatus::Rejected) => {
                        self.note_clearance(&vehicle.vin, ClearanceStatus::Rejected, now).await;
                        let error = VehicleError::new(
                            CLEARANCE_REJECTED,
                            "The provider rejected the clearance request",
                            now,
                        );
                        self.write(vehicle, StatusUpdate::Failed { error }, now).await
                    }
                    Err(ProviderError::NotFound) => {
                        let error = VehicleError::new(
                            CLEARANCE_NOT_FOUND,
                            "The provider has no clearance request for this VIN",
                            now,
                        );
                        self.write(vehicle, StatusUpdate::Failed { error }, now).await
                    }
                    Err(e) => self.provider_failure(vehicle, e, now, faults).await,
                }
            }
            LinkingStatus::Linked | LinkingStatus::Failed => VehicleOutcome::Unchanged,
        }
    }

    /// Clasificar un error del proveedor: credenciales del gateway (sin
    /// escritura), transitorio (reintento o dead-letter) o permanente (FAILED)
    async fn provider_failure(
        &self,
        vehicle: &Vehicle,
        e: ProviderError,
        now: DateTime<Utc>,
        faults: &CredentialFaults,
    ) -> VehicleOutcome {
        if let ProviderError::Credentials(detail) = &e {
            error!(
                "❌ Credenciales de {} rechazadas, se omiten sus vehículos en esta pasada: {}",
                vehicle.provider, detail
            );
            faults.mark(vehicle.provider);
            return credentials_unavailable(vehicle.provider);
        }

        let message = e.to_string();

        if !e.is_transient() {
            warn!("❌ {} falló de forma permanente: {}", vehicle.vin, message);
            let error = VehicleError::new(e.kind(), message, now);
            return self.write(vehicle, StatusUpdate::Failed { error }, now).await;
        }

        let attempt = vehicle.attempt_count + 1;
        let max_attempts = self.config.max_attempts;
        if max_attempts > 0 && i64::from(attempt) >= i64::from(max_attempts) {
            warn!("💀 {} agotó {} intentos: {}", vehicle.vin, attempt, message);
            let error = VehicleError::new(
                RETRY_LIMIT_EXCEEDED,
                format!("Gave up after {} attempts, last error: {}", attempt, message),
                now,
            );
            return self.write(vehicle, StatusUpdate::Failed { error }, now).await;
        }

        warn!("🔁 {} error transitorio (intento {}): {}", vehicle.vin, attempt, message);
        let error = VehicleError::new(e.kind(), message, now);
        self.write(vehicle, StatusUpdate::RetryScheduled { error }, now).await
    }

    /// Única escritura de estado del vehículo en esta pasada
    async fn write(
        &self,
        vehicle: &Vehicle,
        update: StatusUpdate,
        now: DateTime<Utc>,
    ) -> VehicleOutcome {
        let from = vehicle.linking_status;
        let target = update.target_status(from);

        match self.registry.update_status(&vehicle.vin, from, update, now).await {
            Ok(updated) => {
                let closes_clearance = updated.linking_status.is_terminal()
                    && vehicle.provider == Provider::HighMobility;
                if closes_clearance {
                    if let Err(e) = self.clearances.archive(&vehicle.vin, now).await {
                        warn!("⚠️ No se pudo archivar la clearance de {}: {}", vehicle.vin, e);
                    }
                }

                match (target, &updated.last_error) {
                    (LinkingStatus::Failed, Some(error)) => VehicleOutcome::Failed {
                        code: error.code.clone(),
                        message: error.message.clone(),
                    },
                    (to, Some(error)) if to == from => VehicleOutcome::RetryScheduled {
                        attempt: updated.attempt_count,
                        error: error.message.clone(),
                    },
                    (to, _) => VehicleOutcome::Transitioned { from, to },
                }
            }
            Err(AppError::Conflict(message)) => {
                debug!("{} cambió durante la pasada: {}", vehicle.vin, message);
                VehicleOutcome::Skipped { reason: message }
            }
            Err(e) => persistence_failure(vehicle, e),
        }
    }

    async fn note_clearance(&self, vin: &str, status: ClearanceStatus, now: DateTime<Utc>) {
        if let Err(e) = self.clearances.record_check(vin, status, now).await {
            warn!("⚠️ No se pudo guardar el estado de clearance de {}: {}", vin, e);
        }
    }
}

fn credentials_unavailable(provider: Provider) -> VehicleOutcome {
    VehicleOutcome::Skipped {
        reason: format!("{} credentials unavailable", provider),
    }
}

fn persistence_failure(vehicle: &Vehicle, e: AppError) -> VehicleOutcome {
    error!("❌ Error de persistencia para {}: {}", vehicle.vin, e);
    VehicleOutcome::Skipped {
        reason: format!("registry write failed: {}", e),
    }
}

fn vehicle_age_limit(config: &ReconcilerConfig) -> i64 {
    config.max_link_age.map_or(0, |age| age.num_hours())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{ProviderCapabilities, ProviderClient, ProviderResult, VehicleDataResponse};
    use crate::models::NewVehicle;
    use crate::repositories::{InMemoryClearanceStore, InMemoryVehicleRegistry};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Proveedor guionado: errores de onboarding por VIN y un estado de
    /// clearance común
    struct ScriptedProvider {
        provider: Provider,
        onboarding_errors: HashMap<String, ProviderError>,
        status: std::sync::Mutex<ProviderResult<ClearanceStatus>>,
        delay: std::time::Duration,
        onboarding_calls: AtomicUsize,
        status_calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn new(provider: Provider) -> Self {
            Self {
                provider,
                onboarding_errors: HashMap::new(),
                status: std::sync::Mutex::new(Ok(ClearanceStatus::Pending)),
                delay: std::time::Duration::ZERO,
                onboarding_calls: AtomicUsize::new(0),
                status_calls: AtomicUsize::new(0),
            }
        }

        fn failing(mut self, vin: &str, error: ProviderError) -> Self {
            self.onboarding_errors.insert(vin.to_string(), error);
            self
        }

        fn with_status(self, status: ProviderResult<ClearanceStatus>) -> Self {
            *self.status.lock().unwrap() = status;
            self
        }

        fn set_status(&self, status: ProviderResult<ClearanceStatus>) {
            *self.status.lock().unwrap() = status;
        }

        fn calls(&self) -> usize {
            self.onboarding_calls.load(Ordering::SeqCst) + self.status_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProviderClient for ScriptedProvider {
        fn provider(&self) -> Provider {
            self.provider
        }

        fn capabilities(&self) -> ProviderCapabilities {
            let async_onboarding = self.provider == Provider::HighMobility;
            ProviderCapabilities {
                batch_queries: !async_onboarding,
                onboarding: async_onboarding,
                onboarding_status: async_onboarding,
            }
        }

        async fn fetch_vehicle_data(&self, _vin: &str) -> ProviderResult<VehicleDataResponse> {
            Err(ProviderError::Internal("not scripted".to_string()))
        }

        async fn request_onboarding(&self, vehicle: &Vehicle) -> ProviderResult<OnboardingHandle> {
            self.onboarding_calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if let Some(error) = self.onboarding_errors.get(&vehicle.vin) {
                return Err(error.clone());
            }
            if self.provider == Provider::Caruso {
                return Ok(OnboardingHandle::Completed { vin: vehicle.vin.clone() });
            }
            if vehicle.brand.is_none() {
                return Err(ProviderError::Validation("brand is required".to_string()));
            }
            Ok(OnboardingHandle::Submitted {
                vin: vehicle.vin.clone(),
                brand: vehicle.brand.clone(),
            })
        }

        async fn check_onboarding_status(
            &self,
            _handle: &OnboardingHandle,
        ) -> ProviderResult<ClearanceStatus> {
            self.status_calls.fetch_add(1, Ordering::SeqCst);
            self.status.lock().unwrap().clone()
        }
    }

    struct Fixture {
        registry: Arc<InMemoryVehicleRegistry>,
        clearances: Arc<InMemoryClearanceStore>,
        hm: Arc<ScriptedProvider>,
        caruso: Arc<ScriptedProvider>,
        reconciler: LinkingReconciler,
    }

    fn fixture(hm: ScriptedProvider, config: ReconcilerConfig) -> Fixture {
        let registry = Arc::new(InMemoryVehicleRegistry::new());
        let clearances = Arc::new(InMemoryClearanceStore::new());
        let hm = Arc::new(hm);
        let caruso = Arc::new(ScriptedProvider::new(Provider::Caruso));
        let providers = ProviderClients::new()
            .with(hm.clone() as Arc<dyn ProviderClient>)
            .with(caruso.clone() as Arc<dyn ProviderClient>);
        let reconciler =
            LinkingReconciler::new(registry.clone(), clearances.clone(), providers, config);
        Fixture {
            registry,
            clearances,
            hm,
            caruso,
            reconciler,
        }
    }

    fn vehicle(
        vin: &str,
        provider: Provider,
        status: LinkingStatus,
        created_at: DateTime<Utc>,
    ) -> Vehicle {
        let mut vehicle = Vehicle::new_unlinked(
            NewVehicle {
                vin: vin.to_string(),
                provider,
                brand: Some("sandbox".to_string()),
            },
            created_at,
        );
        vehicle.linking_status = status;
        if status == LinkingStatus::Linked {
            vehicle.linked_at = Some(created_at);
        }
        vehicle
    }

    fn hm_vehicle(vin: &str, status: LinkingStatus, created_at: DateTime<Utc>) -> Vehicle {
        vehicle(vin, Provider::HighMobility, status, created_at)
    }

    async fn completed(reconciler: &LinkingReconciler, now: DateTime<Utc>) -> PassReport {
        match reconciler.run_pass_at(now).await.unwrap() {
            PassOutcome::Completed(report) => report,
            PassOutcome::Skipped => panic!("pass unexpectedly skipped"),
        }
    }

    #[tokio::test]
    async fn test_one_call_per_pending_vehicle_and_linked_untouched() {
        let f = fixture(
            ScriptedProvider::new(Provider::HighMobility)
                .with_status(Ok(ClearanceStatus::Accepted)),
            ReconcilerConfig::default(),
        );
        let now = Utc::now();
        f.registry.insert(hm_vehicle("HM1", LinkingStatus::Unlinked, now)).await;
        f.registry.insert(hm_vehicle("HM2", LinkingStatus::PendingClearance, now)).await;
        f.registry.insert(hm_vehicle("HM3", LinkingStatus::Linked, now)).await;
        f.registry.insert(vehicle("CA1", Provider::Caruso, LinkingStatus::Unlinked, now)).await;

        let report = completed(&f.reconciler, now).await;

        assert_eq!(report.vehicles.len(), 3);
        assert_eq!(f.hm.onboarding_calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.hm.status_calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.caruso.calls(), 1);
        assert!(report.outcome_of("HM3").is_none());

        let hm1 = f.registry.get("HM1").await.unwrap().unwrap();
        assert_eq!(hm1.linking_status, LinkingStatus::PendingClearance);
        assert!(f.clearances.get("HM1").await.unwrap().is_some());

        let hm2 = f.registry.get("HM2").await.unwrap().unwrap();
        assert_eq!(hm2.linking_status, LinkingStatus::Linked);
        assert!(hm2.linked_at.is_some());

        let ca1 = f.registry.get("CA1").await.unwrap().unwrap();
        assert_eq!(ca1.linking_status, LinkingStatus::Linked);
        assert!(ca1.linked_at.is_some());

        let counts = &report.per_provider[&Provider::HighMobility];
        assert_eq!(counts.transitioned, 2);
    }

    #[tokio::test]
    async fn test_consecutive_passes_are_idempotent() {
        let f = fixture(ScriptedProvider::new(Provider::HighMobility), ReconcilerConfig::default());
        let now = Utc::now();
        f.registry.insert(hm_vehicle("HM1", LinkingStatus::Unlinked, now)).await;
        f.registry.insert(hm_vehicle("HM2", LinkingStatus::PendingClearance, now)).await;

        completed(&f.reconciler, now).await;
        let writes_after_first = f.registry.status_writes();
        assert_eq!(writes_after_first, 1);

        let second = completed(&f.reconciler, now + Duration::minutes(1)).await;

        assert_eq!(f.registry.status_writes(), writes_after_first);
        assert!(second
            .vehicles
            .iter()
            .all(|report| report.outcome == VehicleOutcome::Unchanged));
    }

    #[tokio::test]
    async fn test_single_failure_does_not_abort_pass() {
        let f = fixture(
            ScriptedProvider::new(Provider::HighMobility)
                .failing("HM3", ProviderError::Network("connection reset".to_string())),
            ReconcilerConfig::default(),
        );
        let now = Utc::now();
        for vin in ["HM1", "HM2", "HM3", "HM4", "HM5"] {
            f.registry.insert(hm_vehicle(vin, LinkingStatus::Unlinked, now)).await;
        }

        let report = completed(&f.reconciler, now).await;

        let totals = report.totals();
        assert_eq!(totals.transitioned, 4);
        assert_eq!(totals.retry_scheduled, 1);
        let failed = f.registry.get("HM3").await.unwrap().unwrap();
        assert_eq!(failed.linking_status, LinkingStatus::Unlinked);
        assert_eq!(failed.attempt_count, 1);
        assert_eq!(failed.last_error.unwrap().code, "NETWORK_ERROR");
    }

    #[tokio::test]
    async fn test_vehicle_in_backoff_is_skipped_without_call() {
        let f = fixture(ScriptedProvider::new(Provider::HighMobility), ReconcilerConfig::default());
        let now = Utc::now();
        let mut retried = vehicle("HM1", Provider::HighMobility, LinkingStatus::Unlinked, now);
        retried.attempt_count = 2;
        retried.last_attempt_at = Some(now - Duration::minutes(1));
        f.registry.insert(retried).await;

        let report = completed(&f.reconciler, now).await;

        assert!(matches!(report.outcome_of("HM1"), Some(VehicleOutcome::Skipped { .. })));
        assert_eq!(f.hm.calls(), 0);
        assert_eq!(f.registry.status_writes(), 0);

        // backoff de 2 intentos = base·2 = 10 min
        let later = completed(&f.reconciler, now + Duration::minutes(10)).await;
        assert!(matches!(later.outcome_of("HM1"), Some(VehicleOutcome::Transitioned { .. })));
    }

    #[tokio::test]
    async fn test_retry_limit_dead_letters_vehicle() {
        let config = ReconcilerConfig {
            max_attempts: 3,
            ..ReconcilerConfig::default()
        };
        let f = fixture(
            ScriptedProvider::new(Provider::HighMobility).failing(
                "HM1",
                ProviderError::Upstream {
                    status: 503,
                    message: None,
                },
            ),
            config,
        );
        let now = Utc::now();
        let registered = now - Duration::days(2);
        let mut retried = hm_vehicle("HM1", LinkingStatus::Unlinked, registered);
        retried.attempt_count = 2;
        retried.last_attempt_at = Some(now - Duration::days(1));
        f.registry.insert(retried).await;

        completed(&f.reconciler, now).await;

        let dead = f.registry.get("HM1").await.unwrap().unwrap();
        assert_eq!(dead.linking_status, LinkingStatus::Failed);
        assert_eq!(dead.last_error.unwrap().code, RETRY_LIMIT_EXCEEDED);
    }

    #[tokio::test]
    async fn test_missing_brand_fails_immediately() {
        let f = fixture(ScriptedProvider::new(Provider::HighMobility), ReconcilerConfig::default());
        let now = Utc::now();
        let mut no_brand = vehicle("HM1", Provider::HighMobility, LinkingStatus::Unlinked, now);
        no_brand.brand = None;
        f.registry.insert(no_brand).await;

        let report = completed(&f.reconciler, now).await;

        assert!(matches!(
            report.outcome_of("HM1"),
            Some(VehicleOutcome::Failed { code, .. }) if code == "VALIDATION_ERROR"
        ));
        assert_eq!(f.registry.get("HM1").await.unwrap().unwrap().attempt_count, 0);
    }

    #[tokio::test]
    async fn test_rejected_clearance_fails_and_archives_request() {
        let f = fixture(ScriptedProvider::new(Provider::HighMobility), ReconcilerConfig::default());
        let now = Utc::now();
        f.registry.insert(hm_vehicle("HM1", LinkingStatus::Unlinked, now)).await;
        completed(&f.reconciler, now).await;

        f.hm.set_status(Ok(ClearanceStatus::Rejected));
        let report = completed(&f.reconciler, now).await;

        assert!(matches!(
            report.outcome_of("HM1"),
            Some(VehicleOutcome::Failed { code, .. }) if code == CLEARANCE_REJECTED
        ));
        assert!(f.clearances.get("HM1").await.unwrap().is_none());
        let archived = f.clearances.get_any("HM1").await.unwrap();
        assert_eq!(archived.last_status, ClearanceStatus::Rejected);
    }

    #[tokio::test]
    async fn test_clearance_missing_upstream_fails_vehicle() {
        let f = fixture(
            ScriptedProvider::new(Provider::HighMobility).with_status(Err(ProviderError::NotFound)),
            ReconcilerConfig::default(),
        );
        let now = Utc::now();
        f.registry.insert(hm_vehicle("HM1", LinkingStatus::PendingClearance, now)).await;

        let report = completed(&f.reconciler, now).await;

        assert!(matches!(
            report.outcome_of("HM1"),
            Some(VehicleOutcome::Failed { code, .. }) if code == CLEARANCE_NOT_FOUND
        ));
    }

    #[tokio::test]
    async fn test_old_vehicle_times_out_without_provider_call() {
        let config = ReconcilerConfig {
            max_link_age: Some(Duration::hours(48)),
            ..ReconcilerConfig::default()
        };
        let f = fixture(ScriptedProvider::new(Provider::HighMobility), config);
        let now = Utc::now();
        let stale = now - Duration::hours(49);
        f.registry
            .insert(vehicle("HM1", Provider::HighMobility, LinkingStatus::PendingClearance, stale))
            .await;

        let report = completed(&f.reconciler, now).await;

        assert!(matches!(
            report.outcome_of("HM1"),
            Some(VehicleOutcome::Failed { code, .. }) if code == LINKING_TIMED_OUT
        ));
        assert_eq!(f.hm.calls(), 0);
    }

    #[tokio::test]
    async fn test_re_enqueued_vehicle_gets_a_fresh_link_window() {
        let config = ReconcilerConfig {
            max_link_age: Some(Duration::hours(48)),
            ..ReconcilerConfig::default()
        };
        let f = fixture(ScriptedProvider::new(Provider::HighMobility), config);
        let now = Utc::now();
        let registered = now - Duration::days(5);
        let mut old = vehicle("CA1", Provider::Caruso, LinkingStatus::Failed, registered);
        let timed_out_at = now - Duration::days(3);
        old.last_error = Some(VehicleError::new(LINKING_TIMED_OUT, "timed out", timed_out_at));
        f.registry.insert(old).await;

        f.registry.re_enqueue("CA1", now).await.unwrap();
        let report = completed(&f.reconciler, now).await;

        assert!(matches!(
            report.outcome_of("CA1"),
            Some(VehicleOutcome::Transitioned { to: LinkingStatus::Linked, .. })
        ));
        assert_eq!(f.caruso.calls(), 1);
        let linked = f.registry.get("CA1").await.unwrap().unwrap();
        assert_eq!(linked.linking_status, LinkingStatus::Linked);
    }

    #[tokio::test]
    async fn test_transport_error_on_pending_clearance_counts_attempt() {
        let f = fixture(
            ScriptedProvider::new(Provider::HighMobility)
                .with_status(Err(ProviderError::Network("connection reset".to_string()))),
            ReconcilerConfig::default(),
        );
        let now = Utc::now();
        f.registry
            .insert(vehicle("HM1", Provider::HighMobility, LinkingStatus::PendingClearance, now))
            .await;
        f.clearances
            .upsert(ClearanceRequest::submitted("HM1", "sandbox", now - Duration::hours(1)))
            .await
            .unwrap();
        let before = f.clearances.get_any("HM1").await;

        let report = completed(&f.reconciler, now).await;

        assert!(matches!(
            report.outcome_of("HM1"),
            Some(VehicleOutcome::RetryScheduled { attempt: 1, .. })
        ));
        let pending = f.registry.get("HM1").await.unwrap().unwrap();
        assert_eq!(pending.linking_status, LinkingStatus::PendingClearance);
        assert_eq!(pending.attempt_count, 1);
        assert_eq!(pending.last_error.unwrap().code, "NETWORK_ERROR");
        assert_eq!(f.clearances.get_any("HM1").await, before);
    }

    #[tokio::test]
    async fn test_rejected_gateway_credentials_do_not_fail_vehicles() {
        use crate::cache::TokenCache;
        use crate::clients::{HighMobilityClient, HighMobilityTokenSource};
        use secrecy::SecretString;
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/access_tokens"))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_json(serde_json::json!({"error": "invalid_client"})),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/fleets/vehicles"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let http = reqwest::Client::new();
        let source = HighMobilityTokenSource::new(
            http.clone(),
            server.uri(),
            "client-id",
            SecretString::from("wrong-secret".to_string()),
        );
        let tokens = Arc::new(TokenCache::new(
            Provider::HighMobility,
            Arc::new(source),
            std::time::Duration::from_secs(60),
        ));
        let client = Arc::new(HighMobilityClient::new(http, server.uri(), tokens));

        let registry = Arc::new(InMemoryVehicleRegistry::new());
        let clearances = Arc::new(InMemoryClearanceStore::new());
        let config = ReconcilerConfig {
            concurrency: 1,
            ..ReconcilerConfig::default()
        };
        let reconciler = LinkingReconciler::new(
            registry.clone(),
            clearances,
            ProviderClients::new().with(client),
            config,
        );
        let now = Utc::now();
        for vin in ["HM1", "HM2", "HM3"] {
            registry
                .insert(vehicle(vin, Provider::HighMobility, LinkingStatus::Unlinked, now))
                .await;
        }

        let report = completed(&reconciler, now).await;

        assert_eq!(report.totals().skipped, 3);
        assert_eq!(registry.status_writes(), 0);
        for vin in ["HM1", "HM2", "HM3"] {
            let untouched = registry.get(vin).await.unwrap().unwrap();
            assert_eq!(untouched.linking_status, LinkingStatus::Unlinked);
            assert_eq!(untouched.attempt_count, 0);
        }
    }

    #[tokio::test]
    async fn test_overlapping_pass_is_skipped() {
        let mut slow = ScriptedProvider::new(Provider::HighMobility);
        slow.delay = std::time::Duration::from_millis(200);
        let f = fixture(slow, ReconcilerConfig::default());
        let now = Utc::now();
        f.registry.insert(hm_vehicle("HM1", LinkingStatus::Unlinked, now)).await;

        let (first, second) = tokio::join!(f.reconciler.run_pass_at(now), async {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            f.reconciler.run_pass_at(now).await
        });

        assert!(matches!(first.unwrap(), PassOutcome::Completed(_)));
        assert!(matches!(second.unwrap(), PassOutcome::Skipped));
        assert_eq!(f.hm.calls(), 1);
    }

    #[test]
    fn test_backoff_doubles_and_is_capped() {
        let config = ReconcilerConfig {
            backoff_base: Duration::minutes(10),
            ..ReconcilerConfig::default()
        };
        assert_eq!(config.backoff_for(0), Duration::zero());
        assert_eq!(config.backoff_for(1), Duration::minutes(10));
        assert_eq!(config.backoff_for(3), Duration::minutes(40));
        assert_eq!(config.backoff_for(40), Duration::hours(24));
    }
}
