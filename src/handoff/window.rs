use std::time::Duration;

use log::info;
use tokio::{sync::mpsc, time};
use tokio_util::sync::CancellationToken;

use super::{RecoveryChannel, RecoveryResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OximeterReading {
    pub spo2: i32,
    pub heart_rate: i32,
}

/// Watches `readings` for `duration`, then publishes the last reading seen.
///
/// The channel is reset to pending first. A window that ends without any
/// reading still publishes, with both values absent. A cancelled window
/// publishes nothing and returns `None`.
pub async fn run_recovery_window(
    mut readings: mpsc::Receiver<OximeterReading>,
    duration: Duration,
    cancel: CancellationToken,
    channel: &RecoveryChannel,
) -> Option<RecoveryResult> {
    channel.reset();

    let deadline = time::sleep(duration);
    tokio::pin!(deadline);

    let mut latest: Option<OximeterReading> = None;
    let mut sensor_open = true;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Recovery window cancelled");
                return None;
            }
            _ = &mut deadline => break,
            reading = readings.recv(), if sensor_open => match reading {
                Some(reading) => latest = Some(reading),
                None => {
                    info!("Oximeter stream closed before the recovery window ended");
                    sensor_open = false;
                }
            },
        }
    }

    let result = RecoveryResult {
        spo2: latest.map(|reading| reading.spo2),
        heart_rate: latest.map(|reading| reading.heart_rate),
        is_recovery_period_over: true,
        was_data_captured_during_period: latest.is_some(),
    };
    channel.publish(result);
    Some(result)
}
