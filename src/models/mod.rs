//! Modelos del sistema
//!
//! Este módulo contiene los modelos de datos del registro de vehículos que
//! mapean al schema PostgreSQL.

pub mod clearance;
pub mod telemetry;
pub mod vehicle;

pub use clearance::*;
pub use telemetry::*;
pub use vehicle::*;
