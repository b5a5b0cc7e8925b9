//! Patient records and the ordering policy of patient listings.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Patient {
    pub id: String,
    pub name: String,
    /// Human-facing number, allocated above every existing one.
    pub numeric_id: i64,
    pub last_access_ms: i64,
    /// Denormalized "has at least one stored session". May lag behind the
    /// sessions table; the reconciler reports and masks the drift.
    pub has_history: bool,
}

impl Patient {
    pub fn new(name: impl Into<String>, numeric_id: i64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            numeric_id,
            last_access_ms: Utc::now().timestamp_millis(),
            has_history: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum PatientOrder {
    #[default]
    LastAccess,
    NumericId,
    Name,
}

impl PatientOrder {
    pub fn order_by_clause(&self) -> &'static str {
        match self {
            PatientOrder::LastAccess => "ORDER BY last_access_ms DESC, numeric_id DESC",
            PatientOrder::NumericId => "ORDER BY numeric_id ASC",
            PatientOrder::Name => "ORDER BY name COLLATE NOCASE ASC, numeric_id ASC",
        }
    }
}
