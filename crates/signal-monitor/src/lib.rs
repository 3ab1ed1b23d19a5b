//! Signal Monitor
//!
//! Polls a tuner capability for lock, strength, and pending protocol
//! tables, and tells the recording scheduler when it is safe to start
//! writing. The monitor runs on its own worker thread; listeners receive
//! lock/strength/tuning events every poll tick and a one-shot all-good
//! event per acquisition.

mod monitor;
mod tuner;
mod value;

pub use monitor::{MonitorConfig, SignalListener, SignalMonitor};
pub use tuner::{FixedTuner, MonitorFlags, TunerCapability, TunerPoll};
pub use value::{GoodWhen, SignalSnapshot, SignalValue};

use thiserror::Error;

/// Signal monitor errors
#[derive(Debug, Error)]
pub enum MonitorError {
    /// The monitor worker thread could not be spawned
    #[error("monitor thread failed to start: {0}")]
    Thread(std::io::Error),
}
