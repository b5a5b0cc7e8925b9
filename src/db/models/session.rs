//! Completed walk-test sessions and the per-patient count projection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Storage id a caller passes when the store should assign one.
pub const UNASSIGNED_SESSION_ID: i64 = 0;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TestSession {
    pub id: i64,
    pub patient_id: String,
    /// 1-based, per patient. Never renumbered after a deletion.
    pub sequence_number: u32,
    pub performed_at: DateTime<Utc>,
    pub distance_m: Option<f64>,
    /// Measurement payload owned by the test screens; stored verbatim.
    pub details: serde_json::Value,
}

impl TestSession {
    pub fn new(patient_id: impl Into<String>, sequence_number: u32) -> Self {
        Self {
            id: UNASSIGNED_SESSION_ID,
            patient_id: patient_id.into(),
            sequence_number,
            performed_at: Utc::now(),
            distance_m: None,
            details: serde_json::Value::Object(serde_json::Map::new()),
        }
    }

    pub fn is_unassigned(&self) -> bool {
        self.id == UNASSIGNED_SESSION_ID
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionCount {
    pub patient_id: String,
    pub count: u32,
}
