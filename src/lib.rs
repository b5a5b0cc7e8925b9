pub mod db;
pub mod handoff;
pub mod reconciler;
pub mod records;
pub mod settings;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{info, warn};
use tokio_util::sync::CancellationToken;

use db::{Database, PatientOrder};
use handoff::RecoveryChannel;
use reconciler::{HistoryReconciler, ReconcilerHandle};
use records::PatientRecords;
use settings::SettingsStore;

/// Everything the screens talk to, wired once at startup.
pub struct AppState {
    pub db: Database,
    pub records: PatientRecords,
    pub history: ReconcilerHandle,
    pub recovery: RecoveryChannel,
    pub settings: SettingsStore,
    cancel: CancellationToken,
}

impl AppState {
    pub async fn open(data_dir: &Path, cancel: CancellationToken) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

        let settings = SettingsStore::new(data_dir.join("settings.json"))?;
        let database = Database::new(data_dir.join("walktest.sqlite3"))?;
        let records = PatientRecords::new(database.clone());

        // Flags may have drifted if the app died between a write and its
        // flag update.
        if let Err(err) = records.repair_history_flags().await {
            warn!("Startup history flag repair failed: {err:#}");
        }

        let history = HistoryReconciler::default()
            .attach(&database, settings.patient_order(), cancel.clone())
            .await;
        let recovery = RecoveryChannel::new(settings.recovery_overflow());

        Ok(Self {
            db: database,
            records,
            history,
            recovery,
            settings,
            cancel,
        })
    }

    /// Persists the new order and rebuilds the history view with it.
    /// Receivers taken from the previous view see their channel close and
    /// must subscribe again.
    pub async fn set_patient_order(&mut self, order: PatientOrder) -> Result<()> {
        self.settings.update_patient_order(order)?;

        let history = HistoryReconciler::default()
            .attach(&self.db, order, self.cancel.clone())
            .await;
        let previous = std::mem::replace(&mut self.history, history);
        previous.shutdown().await;
        info!("History view now ordered by {order:?}");
        Ok(())
    }

    pub async fn shutdown(self) {
        self.history.shutdown().await;
    }
}

fn data_dir_from_env() -> PathBuf {
    std::env::var_os("WALKTEST_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("data"))
}

pub async fn run() -> Result<()> {
    // Initialize logging (reads RUST_LOG env var)
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("walktest starting up...");

    let cancel = CancellationToken::new();
    let state = AppState::open(&data_dir_from_env(), cancel.clone()).await?;

    let patients = state.history.current();
    let with_history = patients.iter().filter(|entry| entry.has_history).count();
    info!(
        "{} patient(s) on record, {} with stored sessions",
        patients.len(),
        with_history
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    info!("Shutting down");
    cancel.cancel();
    state.shutdown().await;
    Ok(())
}
