//! Métricas Prometheus de los jobs de fondo

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec, IntCounterVec,
    TextEncoder,
};

use crate::models::Provider;

lazy_static! {
    static ref JOB_RUNS: IntCounterVec = register_int_counter_vec!(
        "telematics_job_runs_total",
        "Ejecuciones de jobs de fondo por resultado",
        &["job", "outcome"]
    )
    .expect("telematics_job_runs_total se registra una sola vez");

    static ref JOB_DURATION: HistogramVec = register_histogram_vec!(
        "telematics_job_duration_seconds",
        "Duración de las pasadas completadas",
        &["job"],
        vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0]
    )
    .expect("telematics_job_duration_seconds se registra una sola vez");

    static ref RECONCILE_VEHICLES: IntCounterVec = register_int_counter_vec!(
        "telematics_reconcile_vehicles_total",
        "Resultados por vehículo del reconciliador",
        &["provider", "outcome"]
    )
    .expect("telematics_reconcile_vehicles_total se registra una sola vez");

    static ref DISPATCH_VEHICLES: IntCounterVec = register_int_counter_vec!(
        "telematics_dispatch_vehicles_total",
        "Resultados por vehículo del dispatcher",
        &["provider", "outcome"]
    )
    .expect("telematics_dispatch_vehicles_total se registra una sola vez");
}

pub const RECONCILE_JOB: &str = "reconcile";
pub const DISPATCH_JOB: &str = "load_vehicle_data";

/// Pasada terminada (`completed`, `skipped`, `error`)
pub fn record_job_run(job: &str, outcome: &str) {
    JOB_RUNS.with_label_values(&[job, outcome]).inc();
}

pub fn observe_job_duration(job: &str, seconds: f64) {
    JOB_DURATION.with_label_values(&[job]).observe(seconds);
}

pub fn record_reconcile_outcome(provider: Provider, outcome: &str) {
    RECONCILE_VEHICLES
        .with_label_values(&[provider.as_str(), outcome])
        .inc();
}

pub fn record_dispatch_outcome(provider: Provider, outcome: &str) {
    DISPATCH_VEHICLES
        .with_label_values(&[provider.as_str(), outcome])
        .inc();
}

/// Todas las métricas registradas en formato texto de Prometheus
pub fn render() -> Result<String, String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&prometheus::gather(), &mut buffer)
        .map_err(|e| e.to_string())?;
    String::from_utf8(buffer).map_err(|e| e.to_string())
}
