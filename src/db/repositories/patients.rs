use anyhow::{bail, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::db::{
    connection::{Database, Table},
    models::{Patient, PatientOrder},
};

const PATIENT_COLUMNS: &str = "id, name, numeric_id, last_access_ms, has_history";

fn row_to_patient(row: &Row) -> rusqlite::Result<Patient> {
    Ok(Patient {
        id: row.get("id")?,
        name: row.get("name")?,
        numeric_id: row.get("numeric_id")?,
        last_access_ms: row.get("last_access_ms")?,
        has_history: row.get("has_history")?,
    })
}

pub(crate) fn query_patients(conn: &Connection, order: PatientOrder) -> Result<Vec<Patient>> {
    let sql = format!(
        "SELECT {PATIENT_COLUMNS} FROM patients {}",
        order.order_by_clause()
    );
    let mut stmt = conn.prepare(&sql)?;
    let patients = stmt
        .query_map([], row_to_patient)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(patients)
}

fn query_max_numeric_id(conn: &Connection) -> Result<Option<i64>> {
    let max: Option<i64> =
        conn.query_row("SELECT MAX(numeric_id) FROM patients", [], |row| row.get(0))?;
    Ok(max)
}

impl Database {
    pub async fn upsert_patient(&self, patient: &Patient) -> Result<()> {
        let record = patient.clone();
        self.execute_write(&[Table::Patients], move |conn| {
            conn.execute(
                "INSERT INTO patients (id, name, numeric_id, last_access_ms, has_history)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                     name = excluded.name,
                     numeric_id = excluded.numeric_id,
                     last_access_ms = excluded.last_access_ms,
                     has_history = excluded.has_history",
                params![
                    record.id,
                    record.name,
                    record.numeric_id,
                    record.last_access_ms,
                    record.has_history,
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_patient(&self, patient_id: &str) -> Result<Option<Patient>> {
        let patient_id = patient_id.to_string();
        self.execute(move |conn| {
            let sql = format!("SELECT {PATIENT_COLUMNS} FROM patients WHERE id = ?1");
            let patient = conn
                .query_row(&sql, params![patient_id], row_to_patient)
                .optional()?;
            Ok(patient)
        })
        .await
    }

    pub async fn list_patients(&self, order: PatientOrder) -> Result<Vec<Patient>> {
        self.execute(move |conn| query_patients(conn, order)).await
    }

    /// Removes only the patient row. Callers delete the sessions first.
    pub async fn delete_patient_row(&self, patient_id: &str) -> Result<usize> {
        let patient_id = patient_id.to_string();
        self.execute_write(&[Table::Patients], move |conn| {
            Ok(conn.execute("DELETE FROM patients WHERE id = ?1", params![patient_id])?)
        })
        .await
    }

    pub async fn max_numeric_id(&self) -> Result<Option<i64>> {
        self.execute(|conn| query_max_numeric_id(conn)).await
    }

    /// Returns the number of rows touched (0 when the patient is gone).
    pub async fn touch_patient(&self, patient_id: &str, accessed_ms: i64) -> Result<usize> {
        let patient_id = patient_id.to_string();
        self.execute_write(&[Table::Patients], move |conn| {
            Ok(conn.execute(
                "UPDATE patients SET last_access_ms = ?1 WHERE id = ?2",
                params![accessed_ms, patient_id],
            )?)
        })
        .await
    }

    pub async fn rename_patient(
        &self,
        patient_id: &str,
        name: &str,
        accessed_ms: i64,
    ) -> Result<usize> {
        let patient_id = patient_id.to_string();
        let name = name.to_string();
        self.execute_write(&[Table::Patients], move |conn| {
            Ok(conn.execute(
                "UPDATE patients SET name = ?1, last_access_ms = ?2 WHERE id = ?3",
                params![name, accessed_ms, patient_id],
            )?)
        })
        .await
    }

    pub async fn set_history_flag(&self, patient_id: &str, has_history: bool) -> Result<()> {
        let patient_id = patient_id.to_string();
        self.execute_write(&[Table::Patients], move |conn| {
            let rows_affected = conn.execute(
                "UPDATE patients SET has_history = ?1 WHERE id = ?2",
                params![has_history, patient_id],
            )?;

            if rows_affected == 0 {
                bail!("Patient {patient_id} not found");
            }

            Ok(())
        })
        .await
    }

    /// Allocates the next numeric id and inserts the patient in one DB task,
    /// so two callers can never be handed the same number.
    pub async fn insert_patient_with_next_numeric_id(
        &self,
        name: &str,
        floor: i64,
    ) -> Result<Patient> {
        let name = name.to_string();
        self.execute_write(&[Table::Patients], move |conn| {
            let tx = conn.transaction()?;
            let numeric_id = query_max_numeric_id(&tx)?.unwrap_or(floor) + 1;
            let patient = Patient::new(name, numeric_id);

            tx.execute(
                "INSERT INTO patients (id, name, numeric_id, last_access_ms, has_history)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    patient.id,
                    patient.name,
                    patient.numeric_id,
                    patient.last_access_ms,
                    patient.has_history,
                ],
            )?;
            tx.commit()?;

            Ok(patient)
        })
        .await
    }

    /// Rewrites every stored history flag that disagrees with the live
    /// session count. Returns how many patients were corrected.
    pub async fn repair_history_flags(&self) -> Result<usize> {
        self.execute_write(&[Table::Patients], |conn| {
            let repaired = conn.execute(
                "UPDATE patients
                 SET has_history = (
                     SELECT COUNT(*) > 0 FROM sessions WHERE sessions.patient_id = patients.id
                 )
                 WHERE has_history != (
                     SELECT COUNT(*) > 0 FROM sessions WHERE sessions.patient_id = patients.id
                 )",
                [],
            )?;
            Ok(repaired)
        })
        .await
    }
}
