//! Process-wide HAM clock.
//!
//! The source's global `machine counter` / process id become an explicit
//! owned type here (§9 design note) so tests can inject a fake instead of
//! reading real wall-clock time and a process-global counter.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Issues HAM timestamps (§4.1) and the monotonically increasing `machine`
/// counter (§3) for a single writing process.
pub trait ProcessClock: Send + Sync {
    /// Current wall-clock time in milliseconds since the epoch.
    fn now_ms(&self) -> u64;

    /// `machineId`: stable for the lifetime of the process (§3).
    fn machine_id(&self) -> &str;

    /// Bumps and returns the process-local `machine` counter (§3, §4.1).
    fn next_machine(&self) -> u64;

    /// Mutation timestamp generation (§4.1): `max(now_ms, max(existing_ts)+1)`.
    fn next_timestamp(&self, existing_max: Option<u64>) -> u64 {
        let now = self.now_ms();
        match existing_max {
            Some(t) => now.max(t.saturating_add(1)),
            None => now,
        }
    }
}

/// The real, wall-clock-backed `ProcessClock`.
pub struct SystemClock {
    machine_id: String,
    machine: AtomicU64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            machine_id: crate::id::random_id(8),
            machine: AtomicU64::new(0),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessClock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    fn machine_id(&self) -> &str {
        &self.machine_id
    }

    fn next_machine(&self) -> u64 {
        self.machine.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// A deterministic clock for tests: `now_ms` starts at a fixed value and
/// only advances when `advance` is called explicitly.
pub struct FakeClock {
    machine_id: String,
    millis: AtomicI64,
    machine: AtomicU64,
}

impl FakeClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            machine_id: "FAKE0001".to_string(),
            millis: AtomicI64::new(start_ms as i64),
            machine: AtomicU64::new(0),
        }
    }

    pub fn with_machine_id(start_ms: u64, machine_id: impl Into<String>) -> Self {
        Self {
            machine_id: machine_id.into(),
            millis: AtomicI64::new(start_ms as i64),
            machine: AtomicU64::new(0),
        }
    }

    pub fn advance(&self, delta_ms: i64) {
        self.millis.fetch_add(delta_ms, Ordering::SeqCst);
    }

    pub fn set(&self, ms: u64) {
        self.millis.store(ms as i64, Ordering::SeqCst);
    }
}

impl ProcessClock for FakeClock {
    fn now_ms(&self) -> u64 {
        self.millis.load(Ordering::SeqCst) as u64
    }

    fn machine_id(&self) -> &str {
        &self.machine_id
    }

    fn next_machine(&self) -> u64 {
        self.machine.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_clock_is_deterministic_until_advanced() {
        let clock = FakeClock::new(1000);
        assert_eq!(clock.now_ms(), 1000);
        assert_eq!(clock.now_ms(), 1000);
        clock.advance(500);
        assert_eq!(clock.now_ms(), 1500);
    }

    #[test]
    fn next_timestamp_respects_existing_max() {
        let clock = FakeClock::new(1000);
        assert_eq!(clock.next_timestamp(None), 1000);
        assert_eq!(clock.next_timestamp(Some(1500)), 1501);
        assert_eq!(clock.next_timestamp(Some(500)), 1000);
    }

    #[test]
    fn machine_counter_strictly_increases() {
        let clock = FakeClock::new(0);
        assert_eq!(clock.next_machine(), 1);
        assert_eq!(clock.next_machine(), 2);
        assert_eq!(clock.next_machine(), 3);
    }
}
