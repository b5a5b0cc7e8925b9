//! Live "patients with history" view.
//!
//! Two observable sources are combined with latest-value semantics: the
//! ordered patient list and the per-patient session count projection. Each
//! emission from either side recomputes the whole view from the newest value
//! of both and replaces the previous snapshot. The stored `has_history` flag
//! is never trusted for display and never written from here; disagreements
//! are handed to a [`DiscrepancyObserver`].
//!
//! A failed source query, or a panic while building a snapshot, publishes an
//! empty view and the task keeps running.

pub mod view;

use std::{
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use log::{debug, error, info, warn};
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::db::{Database, Observed, Patient, PatientOrder, SessionCount};

pub use view::{reconcile, FlagDiscrepancy, PatientWithHistory, Reconciled};

/// Side channel for flags that disagree with the live count.
pub trait DiscrepancyObserver: Send + Sync {
    fn on_discrepancy(&self, discrepancy: &FlagDiscrepancy);
}

/// Default observer: one warning per drifted patient.
pub struct LogDiscrepancies;

impl DiscrepancyObserver for LogDiscrepancies {
    fn on_discrepancy(&self, discrepancy: &FlagDiscrepancy) {
        warn!(
            "History flag drift for patient {}: stored={}, computed={} ({} session(s))",
            discrepancy.patient_id,
            discrepancy.stored,
            discrepancy.computed,
            discrepancy.session_count
        );
    }
}

pub struct HistoryReconciler {
    observer: Arc<dyn DiscrepancyObserver>,
}

impl Default for HistoryReconciler {
    fn default() -> Self {
        Self::new(Arc::new(LogDiscrepancies))
    }
}

impl HistoryReconciler {
    pub fn new(observer: Arc<dyn DiscrepancyObserver>) -> Self {
        Self { observer }
    }

    /// Subscribes to the database's observable queries and starts combining.
    pub async fn attach(
        self,
        db: &Database,
        order: PatientOrder,
        cancel: CancellationToken,
    ) -> ReconcilerHandle {
        let patients = db.observe_patients(order).await;
        let counts = db.observe_session_counts().await;
        self.spawn(patients, counts, cancel)
    }

    pub fn spawn(
        self,
        mut patients: watch::Receiver<Observed<Vec<Patient>>>,
        mut counts: watch::Receiver<Observed<Vec<SessionCount>>>,
        cancel: CancellationToken,
    ) -> ReconcilerHandle {
        let observer = self.observer;
        // Shutting the handle down must not cancel the caller's token.
        let cancel = cancel.child_token();

        let mut latest_counts = counts.borrow_and_update().clone();
        let initial = build_snapshot(&patients.borrow_and_update(), &latest_counts, &*observer);
        let (view_tx, view_rx) = watch::channel(initial);

        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let mut patients_open = true;
            let mut counts_open = true;

            loop {
                if !patients_open && !counts_open {
                    debug!("Both history sources closed; keeping last snapshot");
                    break;
                }

                tokio::select! {
                    _ = token.cancelled() => break,
                    changed = patients.changed(), if patients_open => {
                        if changed.is_err() {
                            patients_open = false;
                            continue;
                        }
                    }
                    changed = counts.changed(), if counts_open => {
                        if changed.is_err() {
                            counts_open = false;
                            continue;
                        }
                        let next = counts.borrow_and_update().clone();
                        if same_snapshot(&latest_counts, &next) {
                            continue;
                        }
                        latest_counts = next;
                    }
                }

                let snapshot =
                    build_snapshot(&patients.borrow_and_update(), &latest_counts, &*observer);
                view_tx.send_replace(snapshot);
            }

            info!("History reconciler stopped");
        });

        ReconcilerHandle {
            view: view_rx,
            cancel,
            task,
        }
    }
}

pub struct ReconcilerHandle {
    view: watch::Receiver<Vec<PatientWithHistory>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ReconcilerHandle {
    /// Receiver of whole-view snapshots; starts at the current one.
    pub fn subscribe(&self) -> watch::Receiver<Vec<PatientWithHistory>> {
        self.view.clone()
    }

    pub fn current(&self) -> Vec<PatientWithHistory> {
        self.view.borrow().clone()
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(err) = self.task.await {
            error!("History reconciler task failed to join: {err}");
        }
    }
}

fn same_snapshot<T: PartialEq>(a: &Observed<T>, b: &Observed<T>) -> bool {
    matches!((a, b), (Ok(a), Ok(b)) if a == b)
}

fn build_snapshot(
    patients: &Observed<Vec<Patient>>,
    counts: &Observed<Vec<SessionCount>>,
    observer: &dyn DiscrepancyObserver,
) -> Vec<PatientWithHistory> {
    let (patients, counts) = match (patients, counts) {
        (Ok(patients), Ok(counts)) => (patients, counts),
        (Err(err), _) | (_, Err(err)) => {
            error!("Failed to build patient history view: {err:#}");
            return Vec::new();
        }
    };

    let built = panic::catch_unwind(AssertUnwindSafe(|| {
        let reconciled = reconcile(patients, counts);
        for discrepancy in &reconciled.discrepancies {
            observer.on_discrepancy(discrepancy);
        }
        reconciled.view
    }));

    built.unwrap_or_else(|_| {
        error!("Building patient history view panicked; publishing an empty view");
        Vec::new()
    })
}
