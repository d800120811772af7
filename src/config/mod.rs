//! Configuración del gateway
//!
//! Variables de entorno (proveedores, credencial admin, jobs) y pool de
//! PostgreSQL.

pub mod database;
pub mod environment;

pub use environment::{ConfigError, EnvironmentConfig};
