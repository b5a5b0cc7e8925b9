//! Hand-off of the post-test recovery measurement to the results screen.
//!
//! The recovery monitor publishes once per test run, possibly with missing
//! values if the window ran out before the oximeter reported. The results
//! screen may subscribe before or after that publish; either way it sees the
//! latest result. Starting a new run resets the channel to
//! [`RecoveryResult::pending`] so a slow subscriber never reads the previous
//! patient's numbers.

pub mod slot;
pub mod window;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

pub use slot::{OverflowPolicy, SingleSlot, Subscription, TryPublishError};
pub use window::{run_recovery_window, OximeterReading};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryResult {
    pub spo2: Option<i32>,
    pub heart_rate: Option<i32>,
    pub is_recovery_period_over: bool,
    pub was_data_captured_during_period: bool,
}

impl RecoveryResult {
    /// Nothing measured yet, window still open.
    pub fn pending() -> Self {
        Self::default()
    }

    pub fn is_pending(&self) -> bool {
        *self == Self::pending()
    }
}

#[derive(Clone)]
pub struct RecoveryChannel {
    slot: SingleSlot<RecoveryResult>,
}

impl Default for RecoveryChannel {
    fn default() -> Self {
        Self::new(OverflowPolicy::default())
    }
}

impl RecoveryChannel {
    pub fn new(policy: OverflowPolicy) -> Self {
        Self {
            slot: SingleSlot::new(policy),
        }
    }

    /// Best effort: returns `false` and logs when the slot refused the value.
    /// There is no retry.
    pub fn publish(&self, result: RecoveryResult) -> bool {
        match self.slot.try_publish(result) {
            Ok(()) => {
                debug!("Published recovery result {result:?}");
                true
            }
            Err(err) => {
                warn!("Dropped recovery result {result:?}: {err}");
                false
            }
        }
    }

    pub fn reset(&self) -> bool {
        self.publish(RecoveryResult::pending())
    }

    pub fn subscribe(&self) -> Subscription<RecoveryResult> {
        self.slot.subscribe()
    }

    pub fn latest(&self) -> Option<RecoveryResult> {
        self.slot.latest()
    }
}
