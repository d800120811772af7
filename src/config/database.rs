//! Pool de PostgreSQL del registro de vehículos

use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

use super::environment::EnvironmentConfig;

/// Conexiones reservadas para la API además de las que usan los jobs
const API_CONNECTIONS: u32 = 8;

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
}

impl DatabaseConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: API_CONNECTIONS * 2,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(300),
        }
    }

    /// Dimensionar el pool según la concurrencia de los jobs: cada tarea
    /// por vehículo del reconciliador o del dispatcher puede tener una
    /// escritura en curso
    pub fn for_gateway(config: &EnvironmentConfig) -> Self {
        let jobs = config.reconcile_concurrency.max(1) + config.hm_query_concurrency.max(1);
        let jobs = u32::try_from(jobs).unwrap_or(u32::MAX);
        Self {
            max_connections: jobs.saturating_add(API_CONNECTIONS),
            ..Self::new(config.database_url.clone())
        }
    }

    pub async fn create_pool(&self) -> Result<PgPool, sqlx::Error> {
        PgPoolOptions::new()
            .max_connections(self.max_connections)
            .min_connections(self.min_connections)
            .acquire_timeout(self.acquire_timeout)
            .idle_timeout(self.idle_timeout)
            .connect(&self.url)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_pool_size() {
        let config = DatabaseConfig::new("postgresql://localhost/telematics");
        assert_eq!(config.max_connections, 16);
        assert_eq!(config.min_connections, 1);
    }
}
