//! Signal monitor worker and event dispatch

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::tuner::{FixedTuner, MonitorFlags, TunerCapability};
use crate::value::{SignalSnapshot, SignalValue};
use crate::MonitorError;

/// Monitor tuning parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Poll interval in milliseconds (default: 25)
    pub update_rate_ms: u64,
    /// Lower bound for the poll interval (default: 5)
    pub minimum_update_rate_ms: u64,
    /// Preconditions beyond tuning and lock to wait on before all-good
    pub wait_for: MonitorFlags,
    /// Strength percentage required when waiting on signal strength
    pub strength_threshold: i32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            update_rate_ms: 25,
            minimum_update_rate_ms: 5,
            wait_for: MonitorFlags::empty(),
            strength_threshold: 0,
        }
    }
}

/// Receives monitor events. All callbacks run on the monitor thread, so
/// they must not block for long.
pub trait SignalListener: Send + Sync {
    fn signal_lock_changed(&self, _value: &SignalValue) {}
    fn signal_strength_changed(&self, _value: &SignalValue) {}
    fn channel_tuned(&self, _value: &SignalValue) {}
    fn all_good(&self) {}
}

struct MonitorState {
    snapshot: SignalSnapshot,
    /// What this acquisition waits on
    wait: MonitorFlags,
    /// Tables decoded so far; accumulates until the next channel change
    seen: MonitorFlags,
    /// One-shot latch for the all-good event
    all_good_sent: bool,
    /// Kick handshake: cleared by the kicker, set when a cycle completes
    update_done: bool,
    kick_requested: bool,
}

impl MonitorState {
    fn is_all_good(&self) -> bool {
        self.snapshot.tuning.is_good()
            && self.snapshot.lock.is_good()
            && (!self.wait.has(MonitorFlags::SIGNAL_STRENGTH) || self.snapshot.strength.is_good())
            && self.wait.tables_satisfied(self.seen)
    }
}

struct MonitorShared {
    tuner: Mutex<Box<dyn TunerCapability>>,
    state: Mutex<MonitorState>,
    /// Wakes the worker early (kick, stop)
    tick: Condvar,
    /// Signals cycle completion and run-state changes
    updated: Condvar,
    running: AtomicBool,
    exit: AtomicBool,
    update_rate_ms: AtomicU64,
    minimum_update_rate_ms: u64,
    strength_threshold: i32,
    listeners: Mutex<Vec<Arc<dyn SignalListener>>>,
}

impl MonitorShared {
    /// One poll: query the capability and fold the results into the
    /// snapshot. Lock and table state only improve within an acquisition;
    /// strength tracks the live reading.
    fn update_values(&self) {
        let (external, script_status, poll) = {
            let mut tuner = self.tuner.lock();
            let external = tuner.supports_external_tuning();
            let script_status = if external { tuner.tuning_status() } else { 3 };
            (external, script_status, tuner.poll())
        };

        let mut st = self.state.lock();
        if external && st.snapshot.tuning.value() < 2 {
            st.snapshot.tuning.set_value(script_status);
        }
        let lock = st.snapshot.lock.value().max(poll.locked as i32);
        st.snapshot.lock.set_value(lock);
        st.snapshot.strength.set_value(poll.strength_pct);
        st.seen.add(poll.tables_seen);
    }

    /// Dispatch the per-tick events, plus the one-shot all-good when every
    /// waited-on precondition is now satisfied
    fn emit_status(&self) {
        let (tuning, lock, strength, wait_sig, fire_all_good) = {
            let mut st = self.state.lock();
            let fire = st.is_all_good() && !st.all_good_sent;
            if fire {
                st.all_good_sent = true;
            }
            (
                st.snapshot.tuning.clone(),
                st.snapshot.lock.clone(),
                st.snapshot.strength.clone(),
                st.wait.has(MonitorFlags::SIGNAL_STRENGTH),
                fire,
            )
        };

        let listeners: Vec<_> = self.listeners.lock().clone();
        for listener in &listeners {
            listener.channel_tuned(&tuning);
            listener.signal_lock_changed(&lock);
            if wait_sig {
                listener.signal_strength_changed(&strength);
            }
        }
        if fire_all_good {
            info!("signal acquisition complete");
            for listener in &listeners {
                listener.all_good();
            }
        }
    }
}

fn monitor_loop(shared: &MonitorShared) {
    debug!("monitor loop starting");
    {
        let _st = shared.state.lock();
        shared.running.store(true, Ordering::Release);
        shared.updated.notify_all();
    }

    while !shared.exit.load(Ordering::Acquire) {
        shared.update_values();
        shared.emit_status();

        let mut st = shared.state.lock();
        st.update_done = true;
        shared.updated.notify_all();

        if !st.kick_requested && !shared.exit.load(Ordering::Acquire) {
            let rate = shared.update_rate_ms.load(Ordering::Relaxed);
            shared.tick.wait_for(&mut st, Duration::from_millis(rate));
        }
        st.kick_requested = false;
    }

    // A last emission: a status update may have landed while we slept.
    shared.emit_status();

    {
        let _st = shared.state.lock();
        shared.running.store(false, Ordering::Release);
        shared.updated.notify_all();
    }
    debug!("monitor loop stopped");
}

/// Polling state machine that gates when a recorder is safe to write.
///
/// `IDLE` until [`start`](Self::start) spawns the worker, `RUNNING` while
/// the poll loop is active, back to `IDLE` after [`stop`](Self::stop)
/// joins it. Events go to registered [`SignalListener`]s.
pub struct SignalMonitor {
    shared: Arc<MonitorShared>,
    worker: Option<JoinHandle<()>>,
}

impl SignalMonitor {
    /// Create a monitor over a device capability selected at recorder
    /// construction time
    pub fn new(tuner: Box<dyn TunerCapability>, config: MonitorConfig) -> Self {
        let external = tuner.supports_external_tuning();
        let mut snapshot = SignalSnapshot::new(external);
        snapshot.strength.set_threshold(config.strength_threshold);

        Self {
            shared: Arc::new(MonitorShared {
                tuner: Mutex::new(tuner),
                state: Mutex::new(MonitorState {
                    snapshot,
                    wait: config.wait_for,
                    seen: MonitorFlags::empty(),
                    all_good_sent: false,
                    update_done: false,
                    kick_requested: false,
                }),
                tick: Condvar::new(),
                updated: Condvar::new(),
                running: AtomicBool::new(false),
                exit: AtomicBool::new(false),
                update_rate_ms: AtomicU64::new(
                    config.update_rate_ms.max(config.minimum_update_rate_ms),
                ),
                minimum_update_rate_ms: config.minimum_update_rate_ms,
                strength_threshold: config.strength_threshold,
                listeners: Mutex::new(Vec::new()),
            }),
            worker: None,
        }
    }

    /// Monitor for a capture source with no real signal concept: reports a
    /// fixed always-locked status instead of erroring
    pub fn with_fixed_tuner(config: MonitorConfig) -> Self {
        Self::new(Box::new(FixedTuner::default()), config)
    }

    /// Spawn the poll loop and block until it reports running
    pub fn start(&mut self) -> Result<(), MonitorError> {
        if self.worker.is_some() {
            return Ok(());
        }
        debug!("signal monitor starting");
        self.shared.exit.store(false, Ordering::Release);

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("sigmon".into())
            .spawn(move || monitor_loop(&shared))
            .map_err(MonitorError::Thread)?;

        let mut st = self.shared.state.lock();
        while !self.shared.running.load(Ordering::Acquire) {
            self.shared.updated.wait_for(&mut st, Duration::from_millis(5));
        }
        drop(st);

        self.worker = Some(handle);
        Ok(())
    }

    /// Request exit, wake the worker, and join it
    pub fn stop(&mut self) {
        if let Some(handle) = self.worker.take() {
            debug!("signal monitor stopping");
            self.shared.exit.store(true, Ordering::Release);
            self.shared.tick.notify_all();
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Change the poll interval, clamped at the configured minimum
    pub fn set_update_rate(&self, ms: u64) {
        let clamped = ms.max(self.shared.minimum_update_rate_ms);
        self.shared.update_rate_ms.store(clamped, Ordering::Relaxed);
    }

    /// Add preconditions to wait on
    pub fn add_flags(&self, flags: MonitorFlags) {
        self.shared.state.lock().wait.add(flags);
    }

    /// Remove preconditions
    pub fn remove_flags(&self, flags: MonitorFlags) {
        self.shared.state.lock().wait.remove(flags);
    }

    pub fn has_flags(&self, flags: MonitorFlags) -> bool {
        self.shared.state.lock().wait.has(flags)
    }

    /// Force one poll cycle and block until it completes (including its
    /// event dispatch). No-op when the monitor is not running.
    pub fn kick(&self) {
        if !self.is_running() {
            return;
        }

        let mut st = self.shared.state.lock();
        st.update_done = false;
        st.kick_requested = true;
        self.shared.tick.notify_all();

        while !st.update_done && self.shared.running.load(Ordering::Acquire) {
            self.shared.updated.wait_for(&mut st, Duration::from_millis(50));
        }
    }

    /// Whether signal lock has been observed this acquisition
    pub fn has_lock(&self) -> bool {
        self.shared.state.lock().snapshot.lock.is_good()
    }

    /// Poll until lock is observed or `timeout` elapses.
    ///
    /// Usable whether or not the worker is running: a running monitor is
    /// kicked for fresh readings, otherwise the tuner is queried directly.
    /// A run-state flip mid-wait re-enters with the remaining time.
    pub fn wait_for_lock(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_running() {
                while Instant::now() < deadline && self.is_running() {
                    self.kick();
                    if self.has_lock() {
                        return true;
                    }
                    thread::sleep(Duration::from_micros(50));
                }
                if self.is_running() {
                    return false;
                }
            } else {
                while Instant::now() < deadline && !self.is_running() {
                    self.shared.update_values();
                    if self.has_lock() {
                        return true;
                    }
                    thread::sleep(Duration::from_micros(50));
                }
                if !self.is_running() {
                    return false;
                }
            }
        }
    }

    /// Ordered name/value pairs describing the current status.
    ///
    /// With `kick` set a running monitor takes a fresh reading first; a
    /// stopped monitor queries the tuner directly either way.
    pub fn status_list(&self, kick: bool) -> Vec<(String, String)> {
        if kick && self.is_running() {
            self.kick();
        } else if !self.is_running() {
            self.shared.update_values();
        }

        let st = self.shared.state.lock();
        st.snapshot
            .status_pairs(st.wait.has(MonitorFlags::SIGNAL_STRENGTH))
    }

    /// Re-arm the acquisition after a channel change: reset the snapshot,
    /// clear accumulated tables, and allow the next all-good to fire
    pub fn channel_changed(&self) {
        debug!("channel changed; re-arming acquisition");
        let external = self.shared.tuner.lock().supports_external_tuning();

        let mut st = self.shared.state.lock();
        st.snapshot.reset(external);
        st.snapshot
            .strength
            .set_threshold(self.shared.strength_threshold);
        st.seen = MonitorFlags::empty();
        st.all_good_sent = false;
    }

    /// Current readings
    pub fn snapshot(&self) -> SignalSnapshot {
        self.shared.state.lock().snapshot.clone()
    }

    /// Register a listener; already-registered listeners are ignored
    pub fn add_listener(&self, listener: Arc<dyn SignalListener>) {
        let mut listeners = self.shared.listeners.lock();
        if !listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            listeners.push(listener);
        }
    }

    pub fn remove_listener(&self, listener: &Arc<dyn SignalListener>) {
        self.shared
            .listeners
            .lock()
            .retain(|l| !Arc::ptr_eq(l, listener));
    }
}

impl Drop for SignalMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuner::TunerPoll;
    use std::sync::atomic::AtomicUsize;

    /// Locks once a fixed delay has elapsed since construction
    struct LockAfter {
        start: Instant,
        after: Duration,
    }

    impl LockAfter {
        fn new(after: Duration) -> Self {
            Self {
                start: Instant::now(),
                after,
            }
        }
    }

    impl TunerCapability for LockAfter {
        fn supports_external_tuning(&self) -> bool {
            false
        }

        fn tuning_status(&mut self) -> i32 {
            3
        }

        fn poll(&mut self) -> TunerPoll {
            let locked = self.start.elapsed() >= self.after;
            TunerPoll {
                locked,
                strength_pct: if locked { 80 } else { 10 },
                tables_seen: MonitorFlags::all_tables(),
            }
        }
    }

    /// Counts polls, locking after a fixed number of them
    struct LockAfterPolls {
        polls: Arc<AtomicUsize>,
        lock_at: usize,
    }

    impl TunerCapability for LockAfterPolls {
        fn supports_external_tuning(&self) -> bool {
            false
        }

        fn tuning_status(&mut self) -> i32 {
            3
        }

        fn poll(&mut self) -> TunerPoll {
            let n = self.polls.fetch_add(1, Ordering::Relaxed) + 1;
            TunerPoll {
                locked: n >= self.lock_at,
                strength_pct: 50,
                tables_seen: MonitorFlags::all_tables(),
            }
        }
    }

    #[derive(Default)]
    struct CountingListener {
        lock_events: AtomicUsize,
        all_good_events: AtomicUsize,
    }

    impl SignalListener for CountingListener {
        fn signal_lock_changed(&self, _value: &SignalValue) {
            self.lock_events.fetch_add(1, Ordering::Relaxed);
        }

        fn all_good(&self) {
            self.all_good_events.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn fast_config() -> MonitorConfig {
        MonitorConfig {
            update_rate_ms: 10,
            ..Default::default()
        }
    }

    #[test]
    fn test_wait_for_lock_within_deadline() {
        let tuner = LockAfter::new(Duration::from_millis(50));
        let mut monitor = SignalMonitor::new(Box::new(tuner), fast_config());
        monitor.start().unwrap();

        assert!(monitor.wait_for_lock(Duration::from_secs(10)));
        monitor.stop();
    }

    #[test]
    fn test_wait_for_lock_times_out() {
        let tuner = LockAfter::new(Duration::from_secs(60));
        let mut monitor = SignalMonitor::new(Box::new(tuner), fast_config());
        monitor.start().unwrap();

        assert!(!monitor.wait_for_lock(Duration::from_millis(80)));
        monitor.stop();
    }

    #[test]
    fn test_wait_for_lock_without_worker() {
        let tuner = LockAfter::new(Duration::ZERO);
        let monitor = SignalMonitor::new(Box::new(tuner), fast_config());

        // Not started: the wait polls the tuner directly.
        assert!(monitor.wait_for_lock(Duration::from_secs(5)));
    }

    #[test]
    fn test_all_good_fires_once_per_acquisition() {
        let mut config = fast_config();
        config.update_rate_ms = 10_000; // only kicked cycles tick
        let mut monitor = SignalMonitor::with_fixed_tuner(config);

        let listener = Arc::new(CountingListener::default());
        monitor.add_listener(listener.clone());
        monitor.start().unwrap();

        monitor.kick();
        monitor.kick();
        assert_eq!(listener.all_good_events.load(Ordering::Relaxed), 1);
        assert!(listener.lock_events.load(Ordering::Relaxed) >= 2);

        // A channel change re-arms the one-shot.
        monitor.channel_changed();
        monitor.kick();
        assert_eq!(listener.all_good_events.load(Ordering::Relaxed), 2);

        monitor.stop();
    }

    #[test]
    fn test_kick_forces_poll_cycles() {
        let polls = Arc::new(AtomicUsize::new(0));
        let tuner = LockAfterPolls {
            polls: polls.clone(),
            lock_at: 3,
        };
        let mut config = fast_config();
        config.update_rate_ms = 10_000;
        let mut monitor = SignalMonitor::new(Box::new(tuner), config);
        monitor.start().unwrap();

        let before = polls.load(Ordering::Relaxed);
        monitor.kick();
        monitor.kick();
        assert!(polls.load(Ordering::Relaxed) >= before + 2);

        monitor.stop();
    }

    #[test]
    fn test_fixed_tuner_status_list() {
        let monitor = SignalMonitor::with_fixed_tuner(MonitorConfig::default());

        // Not running: the list still reflects a direct tuner query.
        let pairs = monitor.status_list(false);
        let names: Vec<&str> = pairs.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, ["tuned", "slock"]);
        assert_eq!(pairs[1].1, "1");
    }

    #[test]
    fn test_strength_wait_flag_gates_all_good() {
        let config = MonitorConfig {
            update_rate_ms: 10_000,
            wait_for: MonitorFlags::SIGNAL_STRENGTH,
            strength_threshold: 60,
            ..Default::default()
        };
        let polls = Arc::new(AtomicUsize::new(0));
        let tuner = LockAfterPolls {
            polls,
            lock_at: 1, // locked immediately, but strength stays at 50
        };
        let listener = Arc::new(CountingListener::default());

        let mut monitor = SignalMonitor::new(Box::new(tuner), config);
        monitor.add_listener(listener.clone());
        monitor.start().unwrap();
        monitor.kick();

        // Locked but below the strength threshold: no all-good.
        assert!(monitor.has_lock());
        assert_eq!(listener.all_good_events.load(Ordering::Relaxed), 0);

        monitor.stop();
    }

    #[test]
    fn test_listener_registration_dedup() {
        let monitor = SignalMonitor::with_fixed_tuner(MonitorConfig::default());
        let listener: Arc<CountingListener> = Arc::new(CountingListener::default());
        let as_dyn: Arc<dyn SignalListener> = listener.clone();

        monitor.add_listener(as_dyn.clone());
        monitor.add_listener(as_dyn.clone());
        assert_eq!(monitor.shared.listeners.lock().len(), 1);

        monitor.remove_listener(&as_dyn);
        assert!(monitor.shared.listeners.lock().is_empty());
    }

    #[test]
    fn test_flag_accessors() {
        let monitor = SignalMonitor::with_fixed_tuner(MonitorConfig::default());

        monitor.add_flags(MonitorFlags::PAT | MonitorFlags::PMT);
        assert!(monitor.has_flags(MonitorFlags::PAT));

        monitor.remove_flags(MonitorFlags::PAT);
        assert!(!monitor.has_flags(MonitorFlags::PAT));
        assert!(monitor.has_flags(MonitorFlags::PMT));
    }
}
