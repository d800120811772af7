//! Repositorios
//!
//! Este módulo contiene el acceso a datos: registro de vehículos,
//! solicitudes de clearance y datos telemáticos. Cada contrato tiene una
//! implementación PostgreSQL y otra en memoria.

pub mod clearance_repository;
pub mod telemetry_repository;
pub mod vehicle_repository;

pub use clearance_repository::{ClearanceStore, InMemoryClearanceStore, PgClearanceRepository};
pub use telemetry_repository::{InMemoryTelemetryStore, PgTelemetryRepository, TelemetryStore};
pub use vehicle_repository::{InMemoryVehicleRegistry, PgVehicleRepository, VehicleRegistry};
