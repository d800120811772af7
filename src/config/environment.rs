//! Configuración de variables de entorno
//!
//! Este módulo lee la configuración del gateway (servidor, proveedores de
//! telemática y jobs de fondo) desde variables de entorno.

use secrecy::SecretString;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Errores al leer la configuración
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} has an invalid value '{value}'")]
    Invalid { name: &'static str, value: String },
}

/// Configuración del entorno
#[derive(Debug, Clone)]
pub struct EnvironmentConfig {
    pub environment: String,
    pub port: u16,
    pub host: String,
    pub database_url: String,
    pub cors_origins: Vec<String>,
    // Credencial admin (Basic auth); el password se guarda como hash bcrypt
    pub admin_username: String,
    pub admin_password_hash: String,
    // High Mobility
    pub hm_api_url: String,
    pub hm_client_id: String,
    pub hm_client_secret: SecretString,
    // Caruso
    pub caruso_api_url: String,
    pub caruso_subscription_id: String,
    pub caruso_api_key: SecretString,
    pub caruso_data_items: Vec<String>,
    // Llamadas salientes
    pub provider_timeout: Duration,
    pub token_refresh_margin: Duration,
    // Jobs
    pub reconcile_interval: Duration,
    pub dispatch_interval: Duration,
    pub reconcile_concurrency: usize,
    pub hm_query_concurrency: usize,
    pub max_link_attempts: u32,
    pub retry_backoff_base: Duration,
    pub max_link_age: Option<chrono::Duration>,
    pub shutdown_grace: Duration,
}

impl EnvironmentConfig {
    /// Leer la configuración completa desde el entorno
    pub fn from_env() -> Result<Self, ConfigError> {
        let max_link_age_hours: Option<i64> = optional("MAX_LINK_AGE_HOURS")?;

        Ok(Self {
            environment: env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
            port: parse_or("PORT", 3000)?,
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            database_url: required("DATABASE_URL")?,
            cors_origins: env::var("CORS_ORIGINS")
                .map(|origins| split_list(&origins))
                .unwrap_or_default(),
            admin_username: required("ADMIN_USERNAME")?,
            admin_password_hash: required("ADMIN_PASSWORD_HASH")?,
            hm_api_url: trim_base(required("HM_API_URL")?),
            hm_client_id: required("HM_CLIENT_ID")?,
            hm_client_secret: SecretString::from(required("HM_CLIENT_SECRET")?),
            caruso_api_url: trim_base(required("CARUSO_API_URL")?),
            caruso_subscription_id: required("CARUSO_SUBSCRIPTION_ID")?,
            caruso_api_key: SecretString::from(required("CARUSO_API_KEY")?),
            caruso_data_items: env::var("CARUSO_DATA_ITEMS")
                .map(|items| split_list(&items))
                .unwrap_or_else(|_| default_caruso_data_items()),
            provider_timeout: Duration::from_secs(parse_or("PROVIDER_TIMEOUT_SECS", 30)?),
            token_refresh_margin: Duration::from_secs(parse_or("TOKEN_REFRESH_MARGIN_SECS", 60)?),
            reconcile_interval: Duration::from_secs(parse_or("RECONCILE_INTERVAL_SECS", 7200)?),
            dispatch_interval: Duration::from_secs(parse_or("DISPATCH_INTERVAL_SECS", 7200)?),
            reconcile_concurrency: parse_or("RECONCILE_CONCURRENCY", 4)?,
            hm_query_concurrency: parse_or("HM_QUERY_CONCURRENCY", 4)?,
            max_link_attempts: parse_or("MAX_LINK_ATTEMPTS", 5)?,
            retry_backoff_base: Duration::from_secs(parse_or("RETRY_BACKOFF_BASE_SECS", 300)?),
            max_link_age: max_link_age_hours.map(chrono::Duration::hours),
            shutdown_grace: Duration::from_secs(parse_or("SHUTDOWN_GRACE_SECS", 30)?),
        })
    }

    /// Obtener la URL del servidor
    pub fn server_url(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Data items pedidos a Caruso por defecto ('dtc' devuelve error en Caruso)
pub fn default_caruso_data_items() -> Vec<String> {
    vec!["dtcconfirmed".to_string(), "mileage".to_string()]
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .ok_or(ConfigError::Missing(name))
}

fn optional<T: FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { name, value }),
        _ => Ok(None),
    }
}

fn parse_or<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    Ok(optional(name)?.unwrap_or(default))
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn trim_base(url: String) -> String {
    url.trim_end_matches('/').to_string()
}
