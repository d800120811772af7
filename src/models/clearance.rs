//! Modelo de ClearanceRequest (solo High Mobility)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Estado de una clearance tal como la reporta High Mobility, ya normalizado
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ClearanceStatus {
    Pending,
    Accepted,
    Rejected,
}

impl ClearanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClearanceStatus::Pending => "pending",
            ClearanceStatus::Accepted => "accepted",
            ClearanceStatus::Rejected => "rejected",
        }
    }

    /// Parsear el valor guardado en `clearance_requests.last_status`
    pub fn from_db(raw: &str) -> Self {
        match raw {
            "accepted" => ClearanceStatus::Accepted,
            "rejected" => ClearanceStatus::Rejected,
            _ => ClearanceStatus::Pending,
        }
    }
}

impl fmt::Display for ClearanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Solicitud de clearance enviada a High Mobility
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClearanceRequest {
    pub vin: String,
    pub brand: String,
    pub submitted_at: DateTime<Utc>,
    pub last_status: ClearanceStatus,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl ClearanceRequest {
    pub fn submitted(vin: impl Into<String>, brand: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            vin: vin.into(),
            brand: brand.into(),
            submitted_at: at,
            last_status: ClearanceStatus::Pending,
            last_checked_at: None,
            deleted_at: None,
        }
    }
}
