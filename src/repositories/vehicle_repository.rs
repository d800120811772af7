//! Registro de vehículos
//!
//! `VehicleRegistry` es el contrato que usan el reconciliador, el dispatcher y
//! la API. Cada actualización de estado es un único UPDATE condicionado al
//! estado esperado, así dos escritores nunca pisan la misma transición.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

use crate::models::{LinkingStatus, NewVehicle, Provider, StatusUpdate, Vehicle, VehicleError};
use crate::utils::errors::{AppError, AppResult};

#[async_trait]
pub trait VehicleRegistry: Send + Sync {
    /// Alta de un vehículo en UNLINKED. Un VIN borrado lógicamente se reactiva.
    async fn register(&self, new: NewVehicle) -> AppResult<Vehicle>;

    async fn get(&self, vin: &str) -> AppResult<Option<Vehicle>>;

    /// Vehículos no borrados con estado en `statuses`
    async fn list_by_status(&self, statuses: &[LinkingStatus]) -> AppResult<Vec<Vehicle>>;

    /// Escritura atómica de estado. Falla con `Conflict` si el vehículo ya no
    /// está en `expected` o si la transición no es válida.
    async fn update_status(
        &self,
        vin: &str,
        expected: LinkingStatus,
        update: StatusUpdate,
        now: DateTime<Utc>,
    ) -> AppResult<Vehicle>;

    /// FAILED -> UNLINKED (acción de operador)
    async fn re_enqueue(&self, vin: &str, now: DateTime<Utc>) -> AppResult<Vehicle>;

    async fn soft_delete(&self, vin: &str, now: DateTime<Utc>) -> AppResult<()>;
}

/// Comprobar una actualización contra la máquina de estados
fn check_update(vin: &str, expected: LinkingStatus, update: &StatusUpdate) -> AppResult<()> {
    let target = update.target_status(expected);
    let valid = match update {
        StatusUpdate::RetryScheduled { .. } => !expected.is_terminal(),
        _ => expected.can_transition_to(target),
    };
    if valid {
        Ok(())
    } else {
        Err(AppError::Conflict(format!(
            "Invalid status transition for vehicle {}: {} -> {}",
            vin, expected, target
        )))
    }
}

fn stale_state(vin: &str, expected: LinkingStatus) -> AppError {
    AppError::Conflict(format!("Vehicle {} is no longer {}", vin, expected))
}

fn not_found(vin: &str) -> AppError {
    AppError::NotFound(format!("Vehicle {} not found", vin))
}

/// Fila de `vehicles`
#[derive(Debug, sqlx::FromRow)]
struct VehicleRow {
    vin: String,
    provider: Provider,
    linking_status: LinkingStatus,
    brand: Option<String>,
    last_error_code: Option<String>,
    last_error_message: Option<String>,
    last_error_at: Option<DateTime<Utc>>,
    attempt_count: i32,
    last_attempt_at: Option<DateTime<Utc>>,
    linked_at: Option<DateTime<Utc>>,
    linking_started_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
}

impl From<VehicleRow> for Vehicle {
    fn from(row: VehicleRow) -> Self {
        let last_error = match (row.last_error_code, row.last_error_at) {
            (Some(code), Some(occurred_at)) => Some(VehicleError {
                code,
                message: row.last_error_message.unwrap_or_default(),
                occurred_at,
            }),
            _ => None,
        };

        Vehicle {
            vin: row.vin,
            provider: row.provider,
            linking_status: row.linking_status,
            brand: row.brand,
            last_error,
            attempt_count: row.attempt_count,
            last_attempt_at: row.last_attempt_at,
            linked_at: row.linked_at,
            linking_started_at: row.linking_started_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            deleted_at: row.deleted_at,
        }
    }
}

/// Registro sobre PostgreSQL
#[derive(Clone)]
pub struct PgVehicleRepository {
    pool: PgPool,
}

impl PgVehicleRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_any(&self, vin: &str) -> AppResult<Option<Vehicle>> {
        let row = sqlx::query_as::<_, VehicleRow>("SELECT * FROM vehicles WHERE vin = $1")
            .bind(vin)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::Database(format!("Error finding vehicle: {}", e)))?;

        Ok(row.map(Vehicle::from))
    }

    /// Explicar por qué un UPDATE condicionado no afectó ninguna fila
    async fn missed_update(&self, vin: &str, expected: LinkingStatus) -> AppError {
        match self.fetch_any(vin).await {
            Ok(Some(vehicle)) if !vehicle.is_deleted() => stale_state(vin, expected),
            Ok(_) => not_found(vin),
            Err(e) => e,
        }
    }
}

#[async_trait]
impl VehicleRegistry for PgVehicleRepository {
    async fn register(&self, new: NewVehicle) -> AppResult<Vehicle> {
        let vin = new.vin.clone();
        let row = sqlx::query_as::<_, VehicleRow>(
            r#"
            INSERT INTO vehicles (
                vin, provider, linking_status, brand, attempt_count,
                linking_started_at, created_at, updated_at
            )
            VALUES ($1, $2, 'UNLINKED', $3, 0, $4, $4, $4)
            ON CONFLICT (vin) DO UPDATE SET
                provider = EXCLUDED.provider,
                linking_status = 'UNLINKED',
                brand = EXCLUDED.brand,
                last_error_code = NULL,
                last_error_message = NULL,
                last_error_at = NULL,
                attempt_count = 0,
                last_attempt_at = NULL,
                linked_at = NULL,
                linking_started_at = EXCLUDED.linking_started_at,
                created_at = EXCLUDED.created_at,
                updated_at = EXCLUDED.updated_at,
                deleted_at = NULL
            WHERE vehicles.deleted_at IS NOT NULL
            RETURNING *
            "#,
        )
        .bind(&new.vin)
        .bind(new.provider)
        .bind(&new.brand)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Database(format!("Error registering vehicle: {}", e)))?;

        row.map(Vehicle::from)
            .ok_or_else(|| AppError::Conflict(format!("Vehicle {} is already registered", vin)))
    }

    async fn get(&self, vin: &str) -> AppResult<Option<Vehicle>> {
        Ok(self.fetch_any(vin).await?.filter(|vehicle| !vehicle.is_deleted()))
    }

    async fn list_by_status(&self, statuses: &[LinkingStatus]) -> AppResult<Vec<Vehicle>> {
        let rows = sqlx::query_as::<_, VehicleRow>(
            r#"
            SELECT * FROM vehicles
            WHERE deleted_at IS NULL AND linking_status::text = ANY($1)
            ORDER BY created_at ASC
            "#,
        )
        .bind(statuses.iter().map(|status| status.as_str().to_string()).collect::<Vec<_>>())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::Database(format!("Error listing vehicles: {}", e)))?;

        Ok(rows.into_iter().map(Vehicle::from).collect())
    }

    async fn update_status(
        &self,
        vin: &str,
        expected: LinkingStatus,
        update: StatusUpdate,
        now: DateTime<Utc>,
    ) -> AppResult<Vehicle> {
        check_update(vin, expected, &update)?;

        let query = match &update {
            StatusUpdate::Transition { to } => sqlx::query_as::<_, VehicleRow>(
                r#"
                UPDATE vehicles SET
                    linking_status = $3,
                    last_error_code = NULL,
                    last_error_message = NULL,
                    last_error_at = NULL,
                    attempt_count = 0,
                    last_attempt_at = $4,
                    linked_at = CASE WHEN $3 = 'LINKED'::linking_status THEN $4 ELSE linked_at END,
                    updated_at = $4
                WHERE vin = $1 AND linking_status = $2 AND deleted_at IS NULL
                RETURNING *
                "#,
            )
            .bind(vin)
            .bind(expected)
            .bind(*to)
            .bind(now),
            StatusUpdate::RetryScheduled { error } => sqlx::query_as::<_, VehicleRow>(
                r#"
                UPDATE vehicles SET
                    last_error_code = $3,
                    last_error_message = $4,
                    last_error_at = $5,
                    attempt_count = attempt_count + 1,
                    last_attempt_at = $6,
                    updated_at = $6
                WHERE vin = $1 AND linking_status = $2 AND deleted_at IS NULL
                RETURNING *
                "#,
            )
            .bind(vin)
            .bind(expected)
            .bind(error.code.clone())
            .bind(error.message.clone())
            .bind(error.occurred_at)
            .bind(now),
            StatusUpdate::Failed { error } => sqlx::query_as::<_, VehicleRow>(
                r#"
                UPDATE vehicles SET
                    linking_status = 'FAILED',
                    last_error_code = $3,
                    last_error_message = $4,
                    last_error_at = $5,
                    last_attempt_at = $6,
                    updated_at = $6
                WHERE vin = $1 AND linking_status = $2 AND deleted_at IS NULL
                RETURNING *
                "#,
            )
            .bind(vin)
            .bind(expected)
            .bind(error.code.clone())
            .bind(error.message.clone())
            .bind(error.occurred_at)
            .bind(now),
        };

        let row = query
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::Database(format!("Error updating vehicle status: {}", e)))?;

        match row {
            Some(row) => {
                debug!("📝 Vehículo {} actualizado: {:?}", vin, update);
                Ok(row.into())
            }
            None => Err(self.missed_update(vin, expected).await),
        }
    }

    async fn re_enqueue(&self, vin: &str, now: DateTime<Utc>) -> AppResult<Vehicle> {
        let row = sqlx::query_as::<_, VehicleRow>(
            r#"
            UPDATE vehicles SET
                linking_status = 'UNLINKED',
                last_error_code = NULL,
                last_error_message = NULL,
                last_error_at = NULL,
                attempt_count = 0,
                last_attempt_at = NULL,
                linking_started_at = $2,
                updated_at = $2
            WHERE vin = $1 AND linking_status = 'FAILED' AND deleted_at IS NULL
            RETURNING *
            "#,
        )
        .bind(vin)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Database(format!("Error re-enqueueing vehicle: {}", e)))?;

        match row {
            Some(row) => Ok(row.into()),
            None => Err(self.missed_update(vin, LinkingStatus::Failed).await),
        }
    }

    async fn soft_delete(&self, vin: &str, now: DateTime<Utc>) -> AppResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE vehicles SET deleted_at = $2, updated_at = $2
            WHERE vin = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(vin)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Database(format!("Error deleting vehicle: {}", e)))?;

        if result.rows_affected() == 0 {
            return Err(not_found(vin));
        }
        Ok(())
    }
}

/// Registro en memoria, usado por los tests y para ejecutar sin base de datos
#[derive(Default)]
pub struct InMemoryVehicleRegistry {
    vehicles: RwLock<HashMap<String, Vehicle>>,
    writes: AtomicUsize,
}

impl InMemoryVehicleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cantidad de escrituras de estado aplicadas (update_status)
    pub fn status_writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Insertar un vehículo tal cual, sin pasar por `register`
    pub async fn insert(&self, vehicle: Vehicle) {
        self.vehicles.write().await.insert(vehicle.vin.clone(), vehicle);
    }
}

#[async_trait]
impl VehicleRegistry for InMemoryVehicleRegistry {
    async fn register(&self, new: NewVehicle) -> AppResult<Vehicle> {
        let mut vehicles = self.vehicles.write().await;
        if vehicles.get(&new.vin).map_or(false, |existing| !existing.is_deleted()) {
            return Err(AppError::Conflict(format!("Vehicle {} is already registered", new.vin)));
        }
        let vehicle = Vehicle::new_unlinked(new, Utc::now());
        vehicles.insert(vehicle.vin.clone(), vehicle.clone());
        Ok(vehicle)
    }

    async fn get(&self, vin: &str) -> AppResult<Option<Vehicle>> {
        let vehicles = self.vehicles.read().await;
        Ok(vehicles.get(vin).filter(|vehicle| !vehicle.is_deleted()).cloned())
    }

    async fn list_by_status(&self, statuses: &[LinkingStatus]) -> AppResult<Vec<Vehicle>> {
        let vehicles = self.vehicles.read().await;
        let mut listed: Vec<Vehicle> = vehicles
            .values()
            .filter(|vehicle| !vehicle.is_deleted() && statuses.contains(&vehicle.linking_status))
            .cloned()
            .collect();
        listed.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.vin.cmp(&b.vin)));
        Ok(listed)
    }

    async fn update_status(
        &self,
        vin: &str,
        expected: LinkingStatus,
        update: StatusUpdate,
        now: DateTime<Utc>,
    ) -> AppResult<Vehicle> {
        check_update(vin, expected, &update)?;

        let mut vehicles = self.vehicles.write().await;
        let vehicle = vehicles
            .get_mut(vin)
            .filter(|vehicle| !vehicle.is_deleted())
            .ok_or_else(|| not_found(vin))?;
        if vehicle.linking_status != expected {
            return Err(stale_state(vin, expected));
        }

        vehicle.apply(&update, now);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(vehicle.clone())
    }

    async fn re_enqueue(&self, vin: &str, now: DateTime<Utc>) -> AppResult<Vehicle> {
        let mut vehicles = self.vehicles.write().await;
        let vehicle = vehicles
            .get_mut(vin)
            .filter(|vehicle| !vehicle.is_deleted())
            .ok_or_else(|| not_found(vin))?;
        if vehicle.linking_status != LinkingStatus::Failed {
            return Err(stale_state(vin, LinkingStatus::Failed));
        }

        vehicle.re_enqueue(now);
        Ok(vehicle.clone())
    }

    async fn soft_delete(&self, vin: &str, now: DateTime<Utc>) -> AppResult<()> {
        let mut vehicles = self.vehicles.write().await;
        let vehicle = vehicles
            .get_mut(vin)
            .filter(|vehicle| !vehicle.is_deleted())
            .ok_or_else(|| not_found(vin))?;
        vehicle.deleted_at = Some(now);
        vehicle.updated_at = now;
        Ok(())
    }
}
