//! Datos telemáticos y log de errores (append-only)

use async_trait::async_trait;
use sqlx::PgPool;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::RwLock;

use crate::models::{ErrorLog, NewErrorLog, NewTelemetryRecord, TelemetryRecord};
use crate::utils::errors::{AppError, AppResult};

#[async_trait]
pub trait TelemetryStore: Send + Sync {
    async fn append_record(&self, record: NewTelemetryRecord) -> AppResult<TelemetryRecord>;

    async fn append_error(&self, error: NewErrorLog) -> AppResult<ErrorLog>;

    /// Registros de un VIN, del más reciente al más antiguo
    async fn list_records(&self, vin: &str, limit: i64) -> AppResult<Vec<TelemetryRecord>>;

    async fn list_errors(&self, vin: &str, limit: i64) -> AppResult<Vec<ErrorLog>>;
}

#[derive(Clone)]
pub struct PgTelemetryRepository {
    pool: PgPool,
}

impl PgTelemetryRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TelemetryStore for PgTelemetryRepository {
    async fn append_record(&self, record: NewTelemetryRecord) -> AppResult<TelemetryRecord> {
        sqlx::query_as::<_, TelemetryRecord>(
            r#"
            INSERT INTO telemetry_records (vin, provider, data, captured_at, error_log_id)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(&record.vin)
        .bind(record.provider)
        .bind(&record.data)
        .bind(record.captured_at)
        .bind(record.error_log_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::Database(format!("Error saving telemetry record: {}", e)))
    }

    async fn append_error(&self, error: NewErrorLog) -> AppResult<ErrorLog> {
        sqlx::query_as::<_, ErrorLog>(
            r#"
            INSERT INTO error_logs (vin, provider, error_code, kind, value, notes, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(&error.vin)
        .bind(error.provider)
        .bind(error.error_code)
        .bind(&error.kind)
        .bind(&error.value)
        .bind(&error.notes)
        .bind(error.created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::Database(format!("Error saving error log: {}", e)))
    }

    async fn list_records(&self, vin: &str, limit: i64) -> AppResult<Vec<TelemetryRecord>> {
        sqlx::query_as::<_, TelemetryRecord>(
            r#"
            SELECT * FROM telemetry_records
            WHERE vin = $1 AND deleted_at IS NULL
            ORDER BY captured_at DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(vin)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::Database(format!("Error listing telemetry records: {}", e)))
    }

    async fn list_errors(&self, vin: &str, limit: i64) -> AppResult<Vec<ErrorLog>> {
        sqlx::query_as::<_, ErrorLog>(
            r#"
            SELECT * FROM error_logs
            WHERE vin = $1 AND deleted_at IS NULL
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(vin)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::Database(format!("Error listing error logs: {}", e)))
    }
}

/// Store en memoria para tests
#[derive(Default)]
pub struct InMemoryTelemetryStore {
    records: RwLock<Vec<TelemetryRecord>>,
    errors: RwLock<Vec<ErrorLog>>,
    next_id: AtomicI64,
}

impl InMemoryTelemetryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all_records(&self) -> Vec<TelemetryRecord> {
        self.records.read().await.clone()
    }

    pub async fn all_errors(&self) -> Vec<ErrorLog> {
        self.errors.read().await.clone()
    }

    fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }
}

fn newest_first<T: Clone>(
    items: &[T],
    vin: &str,
    limit: i64,
    vin_of: impl Fn(&T) -> Option<&str>,
) -> Vec<T> {
    items
        .iter()
        .rev()
        .filter(|item| vin_of(item) == Some(vin))
        .take(usize::try_from(limit).unwrap_or(0))
        .cloned()
        .collect()
}

#[async_trait]
impl TelemetryStore for InMemoryTelemetryStore {
    async fn append_record(&self, record: NewTelemetryRecord) -> AppResult<TelemetryRecord> {
        let stored = TelemetryRecord {
            id: self.next_id(),
            vin: record.vin,
            provider: record.provider,
            data: record.data,
            captured_at: record.captured_at,
            error_log_id: record.error_log_id,
            deleted_at: None,
        };
        self.records.write().await.push(stored.clone());
        Ok(stored)
    }

    async fn append_error(&self, error: NewErrorLog) -> AppResult<ErrorLog> {
        let stored = ErrorLog {
            id: self.next_id(),
            vin: error.vin,
            provider: error.provider,
            error_code: error.error_code,
            kind: error.kind,
            value: error.value,
            notes: error.notes,
            created_at: error.created_at,
            deleted_at: None,
        };
        self.errors.write().await.push(stored.clone());
        Ok(stored)
    }

    async fn list_records(&self, vin: &str, limit: i64) -> AppResult<Vec<TelemetryRecord>> {
        let records = self.records.read().await;
        Ok(newest_first(&records, vin, limit, |record| {
            record.deleted_at.is_none().then_some(record.vin.as_str())
        }))
    }

    async fn list_errors(&self, vin: &str, limit: i64) -> AppResult<Vec<ErrorLog>> {
        let errors = self.errors.read().await;
        Ok(newest_first(&errors, vin, limit, |error| {
            error.vin.as_deref().filter(|_| error.deleted_at.is_none())
        }))
    }
}
