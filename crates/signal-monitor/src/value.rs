//! Signal value accounting

use serde::Serialize;

/// Comparison sense for a value's "good" threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GoodWhen {
    AtOrAbove,
    AtOrBelow,
}

/// One named, range-clamped signal reading
#[derive(Debug, Clone, Serialize)]
pub struct SignalValue {
    /// Short name used in serialized status lists
    name: &'static str,
    /// Human-readable display name
    label: &'static str,
    value: i32,
    min: i32,
    max: i32,
    threshold: i32,
    good_when: GoodWhen,
}

impl SignalValue {
    pub fn new(
        label: &'static str,
        name: &'static str,
        threshold: i32,
        min: i32,
        max: i32,
        good_when: GoodWhen,
    ) -> Self {
        Self {
            name,
            label,
            value: min,
            min,
            max,
            threshold,
            good_when,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn value(&self) -> i32 {
        self.value
    }

    /// Set the reading, clamped to the value's range
    pub fn set_value(&mut self, value: i32) {
        self.value = value.clamp(self.min, self.max);
    }

    /// Change the good/bad threshold
    pub fn set_threshold(&mut self, threshold: i32) {
        self.threshold = threshold;
    }

    /// Whether the reading satisfies the threshold
    pub fn is_good(&self) -> bool {
        match self.good_when {
            GoodWhen::AtOrAbove => self.value >= self.threshold,
            GoodWhen::AtOrBelow => self.value <= self.threshold,
        }
    }

    /// `(name, value)` pair for the serialized status list
    pub fn status_pair(&self) -> (String, String) {
        (self.name.to_string(), self.value.to_string())
    }
}

/// Aggregated monitor readings for one acquisition cycle.
///
/// Values only improve within a cycle; an explicit reset on channel change
/// starts the next one.
#[derive(Debug, Clone, Serialize)]
pub struct SignalSnapshot {
    /// External tuning script progress, 0..=3 (3 = complete)
    pub tuning: SignalValue,
    /// Signal lock, 0 or 1
    pub lock: SignalValue,
    /// Signal strength percentage
    pub strength: SignalValue,
}

impl SignalSnapshot {
    /// Fresh snapshot. When the tuner has no external tuning script the
    /// tuning value starts complete instead of pending.
    pub fn new(external_tuning: bool) -> Self {
        let mut tuning =
            SignalValue::new("Channel Tuning", "tuned", 3, 0, 3, GoodWhen::AtOrAbove);
        if !external_tuning {
            tuning.set_value(3);
        }
        Self {
            tuning,
            lock: SignalValue::new("Signal Lock", "slock", 1, 0, 1, GoodWhen::AtOrAbove),
            strength: SignalValue::new("Signal Power", "signal", 0, 0, 100, GoodWhen::AtOrAbove),
        }
    }

    /// Re-arm for a new acquisition cycle
    pub fn reset(&mut self, external_tuning: bool) {
        *self = Self::new(external_tuning);
    }

    /// Ordered name/value serialization: tuning, lock, then strength when
    /// the monitor is waiting on it
    pub fn status_pairs(&self, include_strength: bool) -> Vec<(String, String)> {
        let mut pairs = vec![self.tuning.status_pair(), self.lock.status_pair()];
        if include_strength {
            pairs.push(self.strength.status_pair());
        }
        pairs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_clamped_to_range() {
        let mut strength =
            SignalValue::new("Signal Power", "signal", 65, 0, 100, GoodWhen::AtOrAbove);
        strength.set_value(250);
        assert_eq!(strength.value(), 100);
        strength.set_value(-5);
        assert_eq!(strength.value(), 0);
    }

    #[test]
    fn test_threshold_sense() {
        let mut lock = SignalValue::new("Signal Lock", "slock", 1, 0, 1, GoodWhen::AtOrAbove);
        assert!(!lock.is_good());
        lock.set_value(1);
        assert!(lock.is_good());

        let mut errors = SignalValue::new("Error Rate", "ber", 10, 0, 1000, GoodWhen::AtOrBelow);
        errors.set_value(500);
        assert!(!errors.is_good());
        errors.set_value(3);
        assert!(errors.is_good());
    }

    #[test]
    fn test_status_pair_ordering() {
        let snapshot = SignalSnapshot::new(true);
        let pairs = snapshot.status_pairs(true);
        let names: Vec<&str> = pairs.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, ["tuned", "slock", "signal"]);

        let pairs = snapshot.status_pairs(false);
        assert_eq!(pairs.len(), 2);
    }

    #[test]
    fn test_snapshot_without_external_tuning_starts_tuned() {
        let snapshot = SignalSnapshot::new(false);
        assert!(snapshot.tuning.is_good());

        let snapshot = SignalSnapshot::new(true);
        assert!(!snapshot.tuning.is_good());
    }
}
