//! Modelo de Vehicle
//!
//! Este módulo contiene el struct Vehicle del registro, identificado por VIN,
//! junto con el proveedor telemático y la máquina de estados de vinculación.
//! Mapea al schema PostgreSQL de `migrations/`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Type;
use std::fmt;
use std::str::FromStr;

/// Proveedor telemático - mapea al ENUM telematics_provider
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Type, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[sqlx(type_name = "telematics_provider", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Provider {
    HighMobility,
    Caruso,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::HighMobility => "HIGH_MOBILITY",
            Provider::Caruso => "CARUSO",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "HIGH_MOBILITY" => Ok(Provider::HighMobility),
            "CARUSO" => Ok(Provider::Caruso),
            other => Err(format!("unknown provider '{}'", other)),
        }
    }
}

/// Estado de vinculación - mapea al ENUM linking_status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Type, PartialEq, Eq, Hash)]
#[sqlx(type_name = "linking_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkingStatus {
    Unlinked,
    PendingClearance,
    Linked,
    Failed,
}

impl LinkingStatus {
    /// Estados que el reconciliador todavía tiene que procesar
    pub const RECONCILABLE: [LinkingStatus; 2] =
        [LinkingStatus::Unlinked, LinkingStatus::PendingClearance];

    pub fn as_str(&self) -> &'static str {
        match self {
            LinkingStatus::Unlinked => "UNLINKED",
            LinkingStatus::PendingClearance => "PENDING_CLEARANCE",
            LinkingStatus::Linked => "LINKED",
            LinkingStatus::Failed => "FAILED",
        }
    }

    /// LINKED es absorbente; FAILED solo sale por re-enqueue explícito
    pub fn is_terminal(&self) -> bool {
        matches!(self, LinkingStatus::Linked | LinkingStatus::Failed)
    }

    /// Transiciones permitidas de la máquina de estados
    pub fn can_transition_to(&self, next: LinkingStatus) -> bool {
        use LinkingStatus::*;
        matches!(
            (self, next),
            (Unlinked, PendingClearance)
                | (Unlinked, Linked)
                | (Unlinked, Failed)
                | (PendingClearance, Linked)
                | (PendingClearance, Failed)
                | (Failed, Unlinked)
        )
    }
}

impl fmt::Display for LinkingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LinkingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "UNLINKED" => Ok(LinkingStatus::Unlinked),
            "PENDING_CLEARANCE" | "WAITING" => Ok(LinkingStatus::PendingClearance),
            "LINKED" => Ok(LinkingStatus::Linked),
            "FAILED" => Ok(LinkingStatus::Failed),
            other => Err(format!("unknown linking status '{}'", other)),
        }
    }
}

/// Último error registrado para un vehículo
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VehicleError {
    pub code: String,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

impl VehicleError {
    pub fn new(
        code: impl Into<String>,
        message: impl Into<String>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            occurred_at,
        }
    }
}

/// Vehicle principal del registro
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Vehicle {
    pub vin: String,
    pub provider: Provider,
    pub linking_status: LinkingStatus,
    pub brand: Option<String>,
    pub last_error: Option<VehicleError>,
    pub attempt_count: i32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub linked_at: Option<DateTime<Utc>>,
    /// Inicio del intento de vinculación actual (alta o re-enqueue)
    pub linking_started_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Vehicle {
    /// Vehículo recién registrado para onboarding
    pub fn new_unlinked(new: NewVehicle, now: DateTime<Utc>) -> Self {
        Self {
            vin: new.vin,
            provider: new.provider,
            linking_status: LinkingStatus::Unlinked,
            brand: new.brand,
            last_error: None,
            attempt_count: 0,
            last_attempt_at: None,
            linked_at: None,
            linking_started_at: now,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Aplicar una actualización de estado en memoria.
    ///
    /// Es la misma semántica que el UPDATE del repositorio Postgres: todos los
    /// campos cambian juntos o ninguno.
    pub fn apply(&mut self, update: &StatusUpdate, now: DateTime<Utc>) {
        match update {
            StatusUpdate::Transition { to } => {
                self.linking_status = *to;
                self.last_error = None;
                self.attempt_count = 0;
                self.last_attempt_at = Some(now);
                if *to == LinkingStatus::Linked {
                    self.linked_at = Some(now);
                }
            }
            StatusUpdate::RetryScheduled { error } => {
                self.last_error = Some(error.clone());
                self.attempt_count += 1;
                self.last_attempt_at = Some(now);
            }
            StatusUpdate::Failed { error } => {
                self.linking_status = LinkingStatus::Failed;
                self.last_error = Some(error.clone());
                self.last_attempt_at = Some(now);
            }
        }
        self.updated_at = now;
    }

    /// FAILED -> UNLINKED, reinicia intentos, error y ventana de vinculación
    pub fn re_enqueue(&mut self, now: DateTime<Utc>) {
        self.linking_status = LinkingStatus::Unlinked;
        self.linking_started_at = now;
        self.last_error = None;
        self.attempt_count = 0;
        self.last_attempt_at = None;
        self.updated_at = now;
    }
}

/// Datos para registrar un vehículo nuevo
#[derive(Debug, Clone)]
pub struct NewVehicle {
    pub vin: String,
    pub provider: Provider,
    pub brand: Option<String>,
}

/// Actualización atómica de estado que solo emite el reconciliador
#[derive(Debug, Clone, PartialEq)]
pub enum StatusUpdate {
    /// Transición exitosa; limpia el error y reinicia los intentos
    Transition { to: LinkingStatus },
    /// Error transitorio: el estado no cambia, se cuenta el intento
    RetryScheduled { error: VehicleError },
    /// Falla terminal (rechazo, validación o dead-letter)
    Failed { error: VehicleError },
}

impl StatusUpdate {
    /// Estado resultante a partir del estado actual
    pub fn target_status(&self, current: LinkingStatus) -> LinkingStatus {
        match self {
            StatusUpdate::Transition { to } => *to,
            StatusUpdate::RetryScheduled { .. } => current,
            StatusUpdate::Failed { .. } => LinkingStatus::Failed,
        }
    }
}
