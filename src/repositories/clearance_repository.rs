//! Solicitudes de clearance de High Mobility
//!
//! Una solicitud activa por VIN. Se archiva (borrado lógico) cuando el
//! vehículo llega a LINKED o FAILED.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::models::{ClearanceRequest, ClearanceStatus};
use crate::utils::errors::{AppError, AppResult};

#[async_trait]
pub trait ClearanceStore: Send + Sync {
    /// Guardar una solicitud recién enviada; reemplaza una archivada
    async fn upsert(&self, request: ClearanceRequest) -> AppResult<ClearanceRequest>;

    /// Solicitud activa de un VIN
    async fn get(&self, vin: &str) -> AppResult<Option<ClearanceRequest>>;

    async fn record_check(
        &self,
        vin: &str,
        status: ClearanceStatus,
        at: DateTime<Utc>,
    ) -> AppResult<()>;

    async fn archive(&self, vin: &str, at: DateTime<Utc>) -> AppResult<()>;
}

#[derive(Debug, sqlx::FromRow)]
struct ClearanceRow {
    vin: String,
    brand: String,
    submitted_at: DateTime<Utc>,
    last_status: String,
    last_checked_at: Option<DateTime<Utc>>,
    deleted_at: Option<DateTime<Utc>>,
}

impl From<ClearanceRow> for ClearanceRequest {
    fn from(row: ClearanceRow) -> Self {
        ClearanceRequest {
            vin: row.vin,
            brand: row.brand,
            submitted_at: row.submitted_at,
            last_status: ClearanceStatus::from_db(&row.last_status),
            last_checked_at: row.last_checked_at,
            deleted_at: row.deleted_at,
        }
    }
}

#[derive(Clone)]
pub struct PgClearanceRepository {
    pool: PgPool,
}

impl PgClearanceRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ClearanceStore for PgClearanceRepository {
    async fn upsert(&self, request: ClearanceRequest) -> AppResult<ClearanceRequest> {
        let row = sqlx::query_as::<_, ClearanceRow>(
            r#"
            INSERT INTO clearance_requests (vin, brand, submitted_at, last_status, last_checked_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (vin) DO UPDATE SET
                brand = EXCLUDED.brand,
                submitted_at = EXCLUDED.submitted_at,
                last_status = EXCLUDED.last_status,
                last_checked_at = EXCLUDED.last_checked_at,
                deleted_at = NULL
            RETURNING *
            "#,
        )
        .bind(&request.vin)
        .bind(&request.brand)
        .bind(request.submitted_at)
        .bind(request.last_status.as_str())
        .bind(request.last_checked_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::Database(format!("Error saving clearance request: {}", e)))?;

        Ok(row.into())
    }

    async fn get(&self, vin: &str) -> AppResult<Option<ClearanceRequest>> {
        let row = sqlx::query_as::<_, ClearanceRow>(
            "SELECT * FROM clearance_requests WHERE vin = $1 AND deleted_at IS NULL",
        )
        .bind(vin)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Database(format!("Error finding clearance request: {}", e)))?;

        Ok(row.map(ClearanceRequest::from))
    }

    async fn record_check(
        &self,
        vin: &str,
        status: ClearanceStatus,
        at: DateTime<Utc>,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE clearance_requests SET last_status = $2, last_checked_at = $3
            WHERE vin = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(vin)
        .bind(status.as_str())
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Database(format!("Error updating clearance request: {}", e)))?;

        Ok(())
    }

    async fn archive(&self, vin: &str, at: DateTime<Utc>) -> AppResult<()> {
        sqlx::query(
            "UPDATE clearance_requests SET deleted_at = $2 WHERE vin = $1 AND deleted_at IS NULL",
        )
            .bind(vin)
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Database(format!("Error archiving clearance request: {}", e)))?;

        Ok(())
    }
}

/// Store en memoria para tests
#[derive(Default)]
pub struct InMemoryClearanceStore {
    requests: RwLock<HashMap<String, ClearanceRequest>>,
}

impl InMemoryClearanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Incluye solicitudes archivadas
    pub async fn get_any(&self, vin: &str) -> Option<ClearanceRequest> {
        self.requests.read().await.get(vin).cloned()
    }
}

#[async_trait]
impl ClearanceStore for InMemoryClearanceStore {
    async fn upsert(&self, request: ClearanceRequest) -> AppResult<ClearanceRequest> {
        let mut requests = self.requests.write().await;
        let mut stored = request;
        stored.deleted_at = None;
        requests.insert(stored.vin.clone(), stored.clone());
        Ok(stored)
    }

    async fn get(&self, vin: &str) -> AppResult<Option<ClearanceRequest>> {
        let requests = self.requests.read().await;
        Ok(requests.get(vin).filter(|request| request.deleted_at.is_none()).cloned())
    }

    async fn record_check(
        &self,
        vin: &str,
        status: ClearanceStatus,
        at: DateTime<Utc>,
    ) -> AppResult<()> {
        let mut requests = self.requests.write().await;
        let active = requests.get_mut(vin).filter(|request| request.deleted_at.is_none());
        if let Some(request) = active {
            request.last_status = status;
            request.last_checked_at = Some(at);
        }
        Ok(())
    }

    async fn archive(&self, vin: &str, at: DateTime<Utc>) -> AppResult<()> {
        let mut requests = self.requests.write().await;
        let active = requests.get_mut(vin).filter(|request| request.deleted_at.is_none());
        if let Some(request) = active {
            request.deleted_at = Some(at);
        }
        Ok(())
    }
}
