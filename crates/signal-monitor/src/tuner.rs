//! Tuner capability abstraction

use serde::{Deserialize, Serialize};

/// Bit set of protocol tables a monitor can wait on, and the matching
/// "seen" accumulation. The same bits serve both roles: a wait set lists
/// what must arrive, a seen set lists what has.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MonitorFlags(u64);

impl MonitorFlags {
    /// Wait for the signal strength threshold, not just lock
    pub const SIGNAL_STRENGTH: MonitorFlags = MonitorFlags(1 << 0);
    /// Program association table
    pub const PAT: MonitorFlags = MonitorFlags(1 << 1);
    /// Program map table
    pub const PMT: MonitorFlags = MonitorFlags(1 << 2);
    /// Master guide table
    pub const MGT: MonitorFlags = MonitorFlags(1 << 3);
    /// Virtual channel table
    pub const VCT: MonitorFlags = MonitorFlags(1 << 4);
    /// Network information table
    pub const NIT: MonitorFlags = MonitorFlags(1 << 5);
    /// Service description table
    pub const SDT: MonitorFlags = MonitorFlags(1 << 6);

    const TABLE_MASK: u64 = (1 << 1) | (1 << 2) | (1 << 3) | (1 << 4) | (1 << 5) | (1 << 6);

    pub const fn empty() -> Self {
        MonitorFlags(0)
    }

    /// Every table bit set; what a source with no real table concept reports
    pub const fn all_tables() -> Self {
        MonitorFlags(Self::TABLE_MASK)
    }

    pub fn add(&mut self, flags: MonitorFlags) {
        self.0 |= flags.0;
    }

    pub fn remove(&mut self, flags: MonitorFlags) {
        self.0 &= !flags.0;
    }

    /// All of `flags` present
    pub fn has(&self, flags: MonitorFlags) -> bool {
        self.0 & flags.0 == flags.0
    }

    /// Any of `flags` present
    pub fn has_any(&self, flags: MonitorFlags) -> bool {
        self.0 & flags.0 != 0
    }

    /// Whether every table this set waits on appears in `seen`
    pub fn tables_satisfied(&self, seen: MonitorFlags) -> bool {
        self.0 & Self::TABLE_MASK & !seen.0 == 0
    }
}

impl std::ops::BitOr for MonitorFlags {
    type Output = MonitorFlags;

    fn bitor(self, rhs: MonitorFlags) -> MonitorFlags {
        MonitorFlags(self.0 | rhs.0)
    }
}

/// One poll's worth of tuner status
#[derive(Debug, Clone, Copy, Default)]
pub struct TunerPoll {
    pub locked: bool,
    pub strength_pct: i32,
    /// Tables decoded so far in this acquisition
    pub tables_seen: MonitorFlags,
}

/// Device-side status queries consumed by the monitor.
///
/// Device-family recorder backends (DVB, analog, network, ASI) implement
/// this once and hand it to the monitor at construction; [`FixedTuner`]
/// covers capture sources with no real signal concept.
pub trait TunerCapability: Send + 'static {
    /// Whether the device tunes through an external channel-change script
    fn supports_external_tuning(&self) -> bool;

    /// Progress of the external tuning script, 0..=3 (3 = complete)
    fn tuning_status(&mut self) -> i32;

    /// Current lock, strength, and table state
    fn poll(&mut self) -> TunerPoll;
}

/// Degraded capability for file- and network-backed pseudo-tuners: always
/// locked at a fixed strength, every table present.
#[derive(Debug, Clone, Copy)]
pub struct FixedTuner {
    strength_pct: i32,
}

impl FixedTuner {
    pub fn new(strength_pct: i32) -> Self {
        Self { strength_pct }
    }
}

impl Default for FixedTuner {
    fn default() -> Self {
        Self { strength_pct: 100 }
    }
}

impl TunerCapability for FixedTuner {
    fn supports_external_tuning(&self) -> bool {
        false
    }

    fn tuning_status(&mut self) -> i32 {
        3
    }

    fn poll(&mut self) -> TunerPoll {
        TunerPoll {
            locked: true,
            strength_pct: self.strength_pct,
            tables_seen: MonitorFlags::all_tables(),
        }
    }
}
