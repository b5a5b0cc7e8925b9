//! Observable queries: a query re-runs whenever one of the tables it reads
//! is written, and the result is republished on a `watch` channel.
//!
//! Receivers always hold the latest result. Identical consecutive results
//! are not republished, so `changed()` only fires on a real difference.
//! Query faults are published as values instead of ending the channel.

use std::sync::Arc;

use anyhow::Result;
use log::{debug, error};
use rusqlite::Connection;
use tokio::sync::watch;

use super::{
    connection::{Database, Table},
    models::{Patient, PatientOrder, SessionCount},
    repositories::{patients::query_patients, sessions::query_session_counts},
};

pub type Observed<T> = std::result::Result<T, Arc<anyhow::Error>>;

impl Database {
    /// All patients in `order`. The receiver starts with a real query result.
    pub async fn observe_patients(
        &self,
        order: PatientOrder,
    ) -> watch::Receiver<Observed<Vec<Patient>>> {
        let initial = self.list_patients(order).await.map_err(Arc::new);
        self.observe(&[Table::Patients], initial, move |conn| {
            query_patients(conn, order)
        })
    }

    /// Session count per patient id. The receiver starts with a real query
    /// result; a failed first query starts it with the error instead.
    pub async fn observe_session_counts(&self) -> watch::Receiver<Observed<Vec<SessionCount>>> {
        let initial = self.session_counts().await.map_err(Arc::new);
        self.observe(&[Table::Sessions], initial, |conn| {
            query_session_counts(conn)
        })
    }

    fn observe<T, F>(
        &self,
        tables: &'static [Table],
        seed: Observed<T>,
        query: F,
    ) -> watch::Receiver<Observed<T>>
    where
        T: PartialEq + Send + Sync + 'static,
        F: Fn(&mut Connection) -> Result<T> + Clone + Send + 'static,
    {
        let (tx, rx) = watch::channel(seed);
        let db = self.clone();
        let mut revisions = self.revisions();

        tokio::spawn(async move {
            let mut seen = *revisions.borrow_and_update();

            loop {
                let run = query.clone();
                let result = db.execute(move |conn| run(conn)).await;
                if let Err(err) = &result {
                    error!("Observable query over {tables:?} failed: {err:#}");
                }
                publish(&tx, result.map_err(Arc::new));

                loop {
                    tokio::select! {
                        changed = revisions.changed() => {
                            if changed.is_err() {
                                return;
                            }
                        }
                        _ = tx.closed() => {
                            debug!("Observable query over {tables:?} has no receivers left");
                            return;
                        }
                    }

                    let current = *revisions.borrow_and_update();
                    let touched = tables
                        .iter()
                        .any(|table| current.get(*table) != seen.get(*table));
                    seen = current;
                    if touched {
                        break;
                    }
                }
            }
        });

        rx
    }
}

fn publish<T: PartialEq>(tx: &watch::Sender<Observed<T>>, next: Observed<T>) {
    tx.send_if_modified(move |current| {
        let unchanged = matches!((&*current, &next), (Ok(a), Ok(b)) if a == b);
        if !unchanged {
            *current = next;
        }
        !unchanged
    });
}
