//! Pure part of the history reconciler: patients plus a count projection in,
//! annotated patients plus the list of drifted flags out.

use std::collections::HashMap;

use serde::Serialize;

use crate::db::{Patient, SessionCount};

/// A patient as the screens should display it: `has_history` comes from the
/// live session count, not from the stored flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatientWithHistory {
    pub patient: Patient,
    pub has_history: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagDiscrepancy {
    pub patient_id: String,
    pub stored: bool,
    pub computed: bool,
    pub session_count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciled {
    pub view: Vec<PatientWithHistory>,
    pub discrepancies: Vec<FlagDiscrepancy>,
}

pub fn reconcile(patients: &[Patient], counts: &[SessionCount]) -> Reconciled {
    let counts: HashMap<&str, u32> = counts
        .iter()
        .map(|entry| (entry.patient_id.as_str(), entry.count))
        .collect();

    let mut reconciled = Reconciled {
        view: Vec::with_capacity(patients.len()),
        discrepancies: Vec::new(),
    };

    for patient in patients {
        let session_count = counts.get(patient.id.as_str()).copied().unwrap_or(0);
        let computed = session_count > 0;

        if computed != patient.has_history {
            reconciled.discrepancies.push(FlagDiscrepancy {
                patient_id: patient.id.clone(),
                stored: patient.has_history,
                computed,
                session_count,
            });
        }

        reconciled.view.push(PatientWithHistory {
            patient: patient.clone(),
            has_history: computed,
        });
    }

    reconciled
}
