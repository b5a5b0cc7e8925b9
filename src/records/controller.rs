use anyhow::{anyhow, Result};
use log::{error, info, warn};

use crate::db::{helpers::now_ms, Database, Patient, TestSession};

/// Numeric ids start right above this value when no patient exists yet.
pub const NUMERIC_ID_FLOOR: i64 = 1000;

/// Patient and session operations the screens call. Every operation is a
/// sequence of separate storage round trips; only the `create_patient` and
/// `save_numbered_session` variants allocate numbers inside one DB task.
#[derive(Clone)]
pub struct PatientRecords {
    db: Database,
}

impl PatientRecords {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub async fn insert_or_update_patient(&self, patient: &Patient) -> Result<()> {
        let mut record = patient.clone();
        record.last_access_ms = now_ms();
        self.db.upsert_patient(&record).await
    }

    /// Sessions go first so none can outlive the patient row.
    pub async fn delete_patient(&self, patient_id: &str) -> Result<()> {
        let removed = self.db.delete_sessions_for_patient(patient_id).await?;
        self.db.delete_patient_row(patient_id).await?;
        info!("Deleted patient {patient_id} and {removed} session(s)");
        Ok(())
    }

    /// Reading a patient for use counts as an access.
    pub async fn get_patient_by_id(&self, patient_id: &str) -> Result<Option<Patient>> {
        let Some(mut patient) = self.db.get_patient(patient_id).await? else {
            return Ok(None);
        };

        let accessed = now_ms();
        self.db.touch_patient(patient_id, accessed).await?;
        patient.last_access_ms = accessed;
        Ok(Some(patient))
    }

    /// Not atomic: two callers that both read before either inserts get the
    /// same number. Use [`create_patient`](Self::create_patient) to avoid it.
    pub async fn next_numeric_identifier(&self) -> Result<i64> {
        let max = self.db.max_numeric_id().await?;
        Ok(max.unwrap_or(NUMERIC_ID_FLOOR) + 1)
    }

    pub async fn update_access_timestamp(&self, patient_id: &str) -> Result<()> {
        self.db.touch_patient(patient_id, now_ms()).await?;
        Ok(())
    }

    pub async fn update_patient_name(&self, patient_id: &str, name: &str) -> Result<()> {
        self.db.rename_patient(patient_id, name, now_ms()).await?;
        Ok(())
    }

    /// Inserts the session, then reads back the patient's newest session to
    /// learn the id the store assigned. Returns `None` when that read-back
    /// does not carry the requested sequence number. The history flag is
    /// raised either way, since a row was written.
    pub async fn save_completed_session(
        &self,
        session: &TestSession,
    ) -> Result<Option<TestSession>> {
        self.db.insert_session(session).await?;

        let read_back = self
            .db
            .most_recent_session_for_patient(&session.patient_id)
            .await;

        self.update_history_flag(&session.patient_id, true).await;
        let stored = read_back?;

        match stored {
            Some(stored) if stored.sequence_number == session.sequence_number => Ok(Some(stored)),
            Some(stored) => {
                warn!(
                    "Saved session for patient {} but newest stored session is #{} (expected #{})",
                    session.patient_id, stored.sequence_number, session.sequence_number
                );
                Ok(None)
            }
            None => {
                warn!(
                    "Saved session #{} for patient {} but it could not be read back",
                    session.sequence_number, session.patient_id
                );
                Ok(None)
            }
        }
    }

    /// The session is already counted, so the history flag is left alone.
    pub async fn update_completed_session(&self, session: &TestSession) -> Result<()> {
        self.db.update_session(session).await
    }

    /// Same race as [`next_numeric_identifier`](Self::next_numeric_identifier).
    pub async fn next_sequence_number_for_patient(&self, patient_id: &str) -> Result<u32> {
        let count = self.db.count_sessions_for_patient(patient_id).await?;
        Ok(count + 1)
    }

    /// Write-through of the denormalized flag. Failures are logged and
    /// dropped; the history reconciler masks the stale value until the next
    /// successful write or repair.
    pub async fn update_history_flag(&self, patient_id: &str, has_history: bool) {
        if let Err(err) = self.try_update_history_flag(patient_id, has_history).await {
            error!("Failed to set history flag of patient {patient_id} to {has_history}: {err:#}");
        }
    }

    async fn try_update_history_flag(&self, patient_id: &str, has_history: bool) -> Result<()> {
        self.db.set_history_flag(patient_id, has_history).await
    }

    pub async fn get_session(&self, session_id: i64) -> Result<Option<TestSession>> {
        self.db.get_session(session_id).await
    }

    pub async fn most_recent_session_for_patient(
        &self,
        patient_id: &str,
    ) -> Result<Option<TestSession>> {
        self.db.most_recent_session_for_patient(patient_id).await
    }

    pub async fn sessions_for_patient(&self, patient_id: &str) -> Result<Vec<TestSession>> {
        self.db.sessions_for_patient(patient_id).await
    }

    pub async fn sequence_number_for_session(&self, session_id: i64) -> Result<Option<u32>> {
        self.db.sequence_number_for_session(session_id).await
    }

    /// Returns `false` when no such session existed. Removing a patient's
    /// last session clears the history flag; remaining sessions keep their
    /// sequence numbers.
    pub async fn delete_session(&self, session_id: i64) -> Result<bool> {
        let Some(patient_id) = self.db.delete_session(session_id).await? else {
            return Ok(false);
        };

        let remaining = self.db.count_sessions_for_patient(&patient_id).await?;
        if remaining == 0 {
            self.update_history_flag(&patient_id, false).await;
        }

        Ok(true)
    }

    pub async fn repair_history_flags(&self) -> Result<usize> {
        let repaired = self.db.repair_history_flags().await?;
        if repaired > 0 {
            warn!("Repaired stale history flag on {repaired} patient(s)");
        }
        Ok(repaired)
    }

    /// Allocates the numeric id and inserts in a single storage task.
    pub async fn create_patient(&self, name: &str) -> Result<Patient> {
        let name = name.trim();
        if name.is_empty() {
            return Err(anyhow!("patient name must not be empty"));
        }
        self.db
            .insert_patient_with_next_numeric_id(name, NUMERIC_ID_FLOOR)
            .await
    }

    /// Assigns the sequence number and inserts in a single storage task,
    /// ignoring the caller's `sequence_number` and `id`.
    pub async fn save_numbered_session(&self, session: &TestSession) -> Result<TestSession> {
        let mut template = session.clone();
        template.id = crate::db::UNASSIGNED_SESSION_ID;

        let stored = self.db.insert_numbered_session(&template).await?;
        self.update_history_flag(&stored.patient_id, true).await;
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::PatientOrder;

    async fn records() -> PatientRecords {
        PatientRecords::new(Database::open_in_memory().unwrap())
    }

    async fn stored_patient(records: &PatientRecords, name: &str, numeric_id: i64) -> Patient {
        let patient = Patient::new(name, numeric_id);
        records.insert_or_update_patient(&patient).await.unwrap();
        patient
    }

    #[tokio::test]
    async fn first_numeric_identifier_is_1001() {
        let records = records().await;
        assert_eq!(records.next_numeric_identifier().await.unwrap(), 1001);
    }

    #[tokio::test]
    async fn numeric_identifier_follows_the_maximum() {
        let records = records().await;
        stored_patient(&records, "A", 1007).await;
        stored_patient(&records, "B", 1042).await;
        stored_patient(&records, "C", 1013).await;

        assert_eq!(records.next_numeric_identifier().await.unwrap(), 1043);
    }

    /// Known defect kept for compatibility: the read and the insert are
    /// separate round trips, so interleaved callers collide.
    #[tokio::test]
    async fn interleaved_numeric_identifier_callers_collide() {
        let records = records().await;

        let first = records.next_numeric_identifier().await.unwrap();
        let second = records.next_numeric_identifier().await.unwrap();
        stored_patient(&records, "A", first).await;
        stored_patient(&records, "B", second).await;

        assert_eq!(first, second);
        let numbers: Vec<i64> = records
            .database()
            .list_patients(PatientOrder::NumericId)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.numeric_id)
            .collect();
        assert_eq!(numbers, [1001, 1001]);
    }

    /// Same defect for per-patient sequence numbers.
    #[tokio::test]
    async fn interleaved_sequence_number_callers_collide() {
        let records = records().await;
        let patient = stored_patient(&records, "A", 1001).await;

        let first = records.next_sequence_number_for_patient(&patient.id).await.unwrap();
        let second = records.next_sequence_number_for_patient(&patient.id).await.unwrap();

        assert_eq!(first, 1);
        assert_eq!(second, 1);
    }

    #[tokio::test]
    async fn hardened_allocation_avoids_the_collision() {
        let records = records().await;
        let patient = stored_patient(&records, "A", 1001).await;
        let template = TestSession::new(&patient.id, 1);

        let (a, b) = tokio::join!(
            records.save_numbered_session(&template),
            records.save_numbered_session(&template),
        );
        let mut numbers = vec![a.unwrap().sequence_number, b.unwrap().sequence_number];
        numbers.sort_unstable();
        assert_eq!(numbers, [1, 2]);

        let created = records.create_patient("  Bea ").await.unwrap();
        assert_eq!(created.numeric_id, 1002);
        assert_eq!(created.name, "Bea");
        assert!(records.create_patient("   ").await.is_err());
    }

    #[tokio::test]
    async fn sequence_numbers_count_up_per_patient() {
        let records = records().await;
        let patient = stored_patient(&records, "A", 1001).await;
        let other = stored_patient(&records, "B", 1002).await;

        let first = records.next_sequence_number_for_patient(&patient.id).await.unwrap();
        assert_eq!(first, 1);
        records
            .save_completed_session(&TestSession::new(&patient.id, first))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(records.next_sequence_number_for_patient(&patient.id).await.unwrap(), 2);
        assert_eq!(records.next_sequence_number_for_patient(&other.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn saved_session_is_returned_with_its_assigned_id() {
        let records = records().await;
        let patient = stored_patient(&records, "A", 1001).await;

        let saved = records
            .save_completed_session(&TestSession::new(&patient.id, 1))
            .await
            .unwrap()
            .expect("verification should pass");

        assert!(!saved.is_unassigned());
        let newest = records
            .most_recent_session_for_patient(&patient.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(newest, saved);
        assert_eq!(records.get_session(saved.id).await.unwrap(), Some(saved.clone()));
        assert_eq!(
            records.sequence_number_for_session(saved.id).await.unwrap(),
            Some(1)
        );

        let stored = records.database().get_patient(&patient.id).await.unwrap().unwrap();
        assert!(stored.has_history);
    }

    #[tokio::test]
    async fn verification_mismatch_returns_none_but_still_flags_history() {
        let records = records().await;
        let patient = stored_patient(&records, "A", 1001).await;

        let mut later = TestSession::new(&patient.id, 7);
        later.id = 50;
        records.database().insert_session(&later).await.unwrap();

        let mut earlier = TestSession::new(&patient.id, 1);
        earlier.id = 10;
        let result = records.save_completed_session(&earlier).await.unwrap();

        assert!(result.is_none());
        assert_eq!(records.sessions_for_patient(&patient.id).await.unwrap().len(), 2);
        let stored = records.database().get_patient(&patient.id).await.unwrap().unwrap();
        assert!(stored.has_history);
    }

    #[tokio::test]
    async fn updating_a_session_keeps_the_flag_untouched() {
        let records = records().await;
        let patient = stored_patient(&records, "A", 1001).await;
        let mut saved = records
            .save_completed_session(&TestSession::new(&patient.id, 1))
            .await
            .unwrap()
            .unwrap();
        records.update_history_flag(&patient.id, false).await;

        saved.distance_m = Some(510.0);
        records.update_completed_session(&saved).await.unwrap();

        assert_eq!(
            records.get_session(saved.id).await.unwrap().unwrap().distance_m,
            Some(510.0)
        );
        let stored = records.database().get_patient(&patient.id).await.unwrap().unwrap();
        assert!(!stored.has_history);
    }

    #[tokio::test]
    async fn deleting_a_patient_removes_every_session() {
        let records = records().await;
        let patient = stored_patient(&records, "A", 1001).await;
        let survivor = stored_patient(&records, "B", 1002).await;
        for n in 1..=3 {
            records
                .save_completed_session(&TestSession::new(&patient.id, n))
                .await
                .unwrap();
        }
        records
            .save_completed_session(&TestSession::new(&survivor.id, 1))
            .await
            .unwrap();

        records.delete_patient(&patient.id).await.unwrap();

        let db = records.database();
        assert!(db.get_patient(&patient.id).await.unwrap().is_none());
        assert_eq!(db.count_sessions_for_patient(&patient.id).await.unwrap(), 0);
        assert!(db
            .session_counts()
            .await
            .unwrap()
            .iter()
            .all(|c| c.patient_id != patient.id));
        assert_eq!(db.count_sessions_for_patient(&survivor.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn lookup_touches_the_access_time() {
        let records = records().await;
        let mut patient = Patient::new("A", 1001);
        patient.last_access_ms = 0;
        records.database().upsert_patient(&patient).await.unwrap();

        let found = records.get_patient_by_id(&patient.id).await.unwrap().unwrap();

        assert!(found.last_access_ms > 0);
        let stored = records.database().get_patient(&patient.id).await.unwrap().unwrap();
        assert_eq!(stored.last_access_ms, found.last_access_ms);
        assert!(records.get_patient_by_id("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn insert_stamps_access_time_and_rename_touches_it() {
        let records = records().await;
        let mut patient = Patient::new("A", 1001);
        patient.last_access_ms = 0;
        records.insert_or_update_patient(&patient).await.unwrap();
        let db = records.database();
        assert!(db.get_patient(&patient.id).await.unwrap().unwrap().last_access_ms > 0);

        db.touch_patient(&patient.id, 0).await.unwrap();
        records.update_patient_name(&patient.id, "Alicia").await.unwrap();
        let renamed = db.get_patient(&patient.id).await.unwrap().unwrap();
        assert_eq!(renamed.name, "Alicia");
        assert!(renamed.last_access_ms > 0);

        db.touch_patient(&patient.id, 0).await.unwrap();
        records.update_access_timestamp(&patient.id).await.unwrap();
        assert!(db.get_patient(&patient.id).await.unwrap().unwrap().last_access_ms > 0);
    }

    #[tokio::test]
    async fn flag_update_failure_is_swallowed() {
        let records = records().await;
        // No such patient: the UPDATE fails, the caller sees nothing.
        records.update_history_flag("ghost", true).await;
    }

    #[tokio::test]
    async fn failed_read_back_still_raises_the_flag() {
        let records = records().await;
        let patient = stored_patient(&records, "A", 1001).await;
        let db = records.database();
        db.execute(|conn| {
            conn.execute_batch(
                "CREATE TRIGGER mangle_performed_at AFTER INSERT ON sessions
                 BEGIN
                     UPDATE sessions SET performed_at = 'not a date' WHERE id = NEW.id;
                 END;",
            )?;
            Ok(())
        })
        .await
        .unwrap();

        let saved = records
            .save_completed_session(&TestSession::new(&patient.id, 1))
            .await;

        assert!(saved.is_err());
        assert!(db.get_patient(&patient.id).await.unwrap().unwrap().has_history);
    }

    #[tokio::test]
    async fn deleting_the_last_session_clears_the_flag() {
        let records = records().await;
        let patient = stored_patient(&records, "A", 1001).await;
        let first = records
            .save_completed_session(&TestSession::new(&patient.id, 1))
            .await
            .unwrap()
            .unwrap();
        let second = records
            .save_completed_session(&TestSession::new(&patient.id, 2))
            .await
            .unwrap()
            .unwrap();
        let db = records.database();

        assert!(records.delete_session(first.id).await.unwrap());
        assert!(db.get_patient(&patient.id).await.unwrap().unwrap().has_history);
        // Count based, so a gap lets an existing number be handed out again.
        assert_eq!(
            records.next_sequence_number_for_patient(&patient.id).await.unwrap(),
            2
        );

        assert!(records.delete_session(second.id).await.unwrap());
        assert!(!db.get_patient(&patient.id).await.unwrap().unwrap().has_history);
        assert!(!records.delete_session(second.id).await.unwrap());
    }

    #[tokio::test]
    async fn repair_rewrites_only_drifted_flags() {
        let records = records().await;
        let with_sessions = stored_patient(&records, "A", 1001).await;
        let without = stored_patient(&records, "B", 1002).await;
        let db = records.database();
        db.insert_session(&TestSession::new(&with_sessions.id, 1)).await.unwrap();
        db.set_history_flag(&without.id, true).await.unwrap();

        assert_eq!(records.repair_history_flags().await.unwrap(), 2);
        assert!(db.get_patient(&with_sessions.id).await.unwrap().unwrap().has_history);
        assert!(!db.get_patient(&without.id).await.unwrap().unwrap().has_history);
        assert_eq!(records.repair_history_flags().await.unwrap(), 0);
    }
}
