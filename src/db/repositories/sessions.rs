use anyhow::{bail, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::db::{
    connection::{Database, Table},
    helpers::{parse_datetime, parse_json, to_u32},
    models::{SessionCount, TestSession},
};

const SESSION_COLUMNS: &str = "id, patient_id, sequence_number, performed_at, distance_m, details";

fn row_to_session(row: &Row) -> Result<TestSession> {
    let sequence_number: i64 = row.get("sequence_number")?;
    let performed_at: String = row.get("performed_at")?;
    let details: String = row.get("details")?;

    Ok(TestSession {
        id: row.get("id")?,
        patient_id: row.get("patient_id")?,
        sequence_number: to_u32(sequence_number, "sequence_number")?,
        performed_at: parse_datetime(&performed_at, "performed_at")?,
        distance_m: row.get("distance_m")?,
        details: parse_json(&details, "details")?,
    })
}

fn query_one_session(
    conn: &Connection,
    sql: &str,
    key: &dyn rusqlite::ToSql,
) -> Result<Option<TestSession>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query([key])?;
    let session = match rows.next()? {
        Some(row) => Some(row_to_session(row)?),
        None => None,
    };
    Ok(session)
}

fn query_count_for_patient(conn: &Connection, patient_id: &str) -> Result<u32> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sessions WHERE patient_id = ?1",
        params![patient_id],
        |row| row.get(0),
    )?;
    to_u32(count, "session count")
}

fn insert_row(conn: &Connection, record: &TestSession) -> Result<()> {
    let details = serde_json::to_string(&record.details)?;
    if record.is_unassigned() {
        conn.execute(
            "INSERT INTO sessions (patient_id, sequence_number, performed_at, distance_m, details)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.patient_id,
                record.sequence_number,
                record.performed_at.to_rfc3339(),
                record.distance_m,
                details,
            ],
        )?;
    } else {
        conn.execute(
            "INSERT INTO sessions (id, patient_id, sequence_number, performed_at, distance_m, details)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.id,
                record.patient_id,
                record.sequence_number,
                record.performed_at.to_rfc3339(),
                record.distance_m,
                details,
            ],
        )?;
    }
    Ok(())
}

pub(crate) fn query_session_counts(conn: &Connection) -> Result<Vec<SessionCount>> {
    let mut stmt = conn.prepare(
        "SELECT patient_id, COUNT(*) AS total
         FROM sessions
         GROUP BY patient_id
         ORDER BY patient_id",
    )?;

    let mut rows = stmt.query([])?;
    let mut counts = Vec::new();
    while let Some(row) = rows.next()? {
        let total: i64 = row.get("total")?;
        counts.push(SessionCount {
            patient_id: row.get("patient_id")?,
            count: to_u32(total, "session count")?,
        });
    }

    Ok(counts)
}

impl Database {
    /// Inserts without reporting the assigned id; read it back with
    /// [`most_recent_session_for_patient`](Self::most_recent_session_for_patient).
    pub async fn insert_session(&self, session: &TestSession) -> Result<()> {
        let record = session.clone();
        self.execute_write(&[Table::Sessions], move |conn| insert_row(conn, &record))
            .await
    }

    pub async fn update_session(&self, session: &TestSession) -> Result<()> {
        let record = session.clone();
        self.execute_write(&[Table::Sessions], move |conn| {
            let details = serde_json::to_string(&record.details)?;
            let rows_affected = conn.execute(
                "UPDATE sessions
                 SET patient_id = ?1,
                     sequence_number = ?2,
                     performed_at = ?3,
                     distance_m = ?4,
                     details = ?5
                 WHERE id = ?6",
                params![
                    record.patient_id,
                    record.sequence_number,
                    record.performed_at.to_rfc3339(),
                    record.distance_m,
                    details,
                    record.id,
                ],
            )?;

            if rows_affected == 0 {
                bail!("Session {} not found", record.id);
            }

            Ok(())
        })
        .await
    }

    pub async fn get_session(&self, session_id: i64) -> Result<Option<TestSession>> {
        self.execute(move |conn| {
            let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1");
            query_one_session(conn, &sql, &session_id)
        })
        .await
    }

    pub async fn most_recent_session_for_patient(
        &self,
        patient_id: &str,
    ) -> Result<Option<TestSession>> {
        let patient_id = patient_id.to_string();
        self.execute(move |conn| {
            let sql = format!(
                "SELECT {SESSION_COLUMNS} FROM sessions
                 WHERE patient_id = ?1
                 ORDER BY id DESC
                 LIMIT 1"
            );
            query_one_session(conn, &sql, &patient_id)
        })
        .await
    }

    pub async fn sessions_for_patient(&self, patient_id: &str) -> Result<Vec<TestSession>> {
        let patient_id = patient_id.to_string();
        self.execute(move |conn| {
            let sql = format!(
                "SELECT {SESSION_COLUMNS} FROM sessions
                 WHERE patient_id = ?1
                 ORDER BY sequence_number ASC, id ASC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(params![patient_id])?;
            let mut sessions = Vec::new();
            while let Some(row) = rows.next()? {
                sessions.push(row_to_session(row)?);
            }
            Ok(sessions)
        })
        .await
    }

    pub async fn count_sessions_for_patient(&self, patient_id: &str) -> Result<u32> {
        let patient_id = patient_id.to_string();
        self.execute(move |conn| query_count_for_patient(conn, &patient_id))
            .await
    }

    pub async fn sequence_number_for_session(&self, session_id: i64) -> Result<Option<u32>> {
        self.execute(move |conn| {
            let sequence_number: Option<i64> = conn
                .query_row(
                    "SELECT sequence_number FROM sessions WHERE id = ?1",
                    params![session_id],
                    |row| row.get(0),
                )
                .optional()?;
            sequence_number
                .map(|value| to_u32(value, "sequence_number"))
                .transpose()
        })
        .await
    }

    pub async fn session_counts(&self) -> Result<Vec<SessionCount>> {
        self.execute(|conn| query_session_counts(conn)).await
    }

    pub async fn delete_sessions_for_patient(&self, patient_id: &str) -> Result<usize> {
        let patient_id = patient_id.to_string();
        self.execute_write(&[Table::Sessions], move |conn| {
            Ok(conn.execute(
                "DELETE FROM sessions WHERE patient_id = ?1",
                params![patient_id],
            )?)
        })
        .await
    }

    /// Deletes one session and reports which patient it belonged to.
    pub async fn delete_session(&self, session_id: i64) -> Result<Option<String>> {
        self.execute_write(&[Table::Sessions], move |conn| {
            let owner: Option<String> = conn
                .query_row(
                    "SELECT patient_id FROM sessions WHERE id = ?1",
                    params![session_id],
                    |row| row.get(0),
                )
                .optional()?;

            if owner.is_some() {
                conn.execute("DELETE FROM sessions WHERE id = ?1", params![session_id])?;
            }

            Ok(owner)
        })
        .await
    }

    /// Assigns `count + 1` as the sequence number and inserts in the same DB
    /// task, so concurrent saves for one patient get distinct numbers.
    pub async fn insert_numbered_session(&self, session: &TestSession) -> Result<TestSession> {
        let mut record = session.clone();
        self.execute_write(&[Table::Sessions], move |conn| {
            let tx = conn.transaction()?;
            record.sequence_number = query_count_for_patient(&tx, &record.patient_id)? + 1;
            insert_row(&tx, &record)?;
            record.id = tx.last_insert_rowid();
            tx.commit()?;
            Ok(record)
        })
        .await
    }
}
