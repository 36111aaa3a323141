//! Mock devices for exercising the coordinators without hardware.
//!
//! [`MockScannable`] simulates a physically slow axis: its move loop sleeps in
//! small slices and polls a device-owned cancellation flag, so an `abort()`
//! from another task makes a blocked move return promptly. [`MockDetector`]
//! records its full acquisition lifecycle. Both can be pointed at a shared
//! [`EventLog`] to assert cross-device ordering in tests.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::time::sleep;

use crate::core::{Acquirable, Device, DeviceModel, Positionable, ScanPoint};

/// Shared, chronologically ordered record of device activity.
pub type EventLog = Arc<Mutex<Vec<String>>>;

/// Creates an empty shared event log.
pub fn new_event_log() -> EventLog {
    Arc::new(Mutex::new(Vec::new()))
}

/// Drains the log into a plain vector.
pub fn drain_events(log: &EventLog) -> Vec<String> {
    match log.lock() {
        Ok(mut entries) => std::mem::take(&mut *entries),
        Err(_) => Vec::new(),
    }
}

fn record(log: &Option<EventLog>, entry: String) {
    if let Some(log) = log {
        if let Ok(mut entries) = log.lock() {
            entries.push(entry);
        }
    }
}

/// How often a mock move loop polls its cancellation flag.
const MOVE_POLL: Duration = Duration::from_millis(5);

// =============================================================================
// MockScannable
// =============================================================================

/// A positionable device with a simulated, abortable move.
pub struct MockScannable {
    name: String,
    level: AtomicU32,
    position: Mutex<f64>,
    move_delay: Duration,
    fail_move: bool,
    fail_abort: bool,
    cancel: AtomicBool,
    abort_count: AtomicUsize,
    events: Option<EventLog>,
}

impl MockScannable {
    /// Creates a scannable at position 0.0 with an instantaneous move.
    pub fn new(name: &str, level: u32) -> Self {
        Self {
            name: name.to_string(),
            level: AtomicU32::new(level),
            position: Mutex::new(0.0),
            move_delay: Duration::ZERO,
            fail_move: false,
            fail_abort: false,
            cancel: AtomicBool::new(false),
            abort_count: AtomicUsize::new(0),
            events: None,
        }
    }

    /// Sets the starting position.
    pub fn with_position(self, position: f64) -> Self {
        if let Ok(mut current) = self.position.lock() {
            *current = position;
        }
        self
    }

    /// Makes every move take this long (polled in small slices).
    pub fn with_move_delay(self, delay: Duration) -> Self {
        Self {
            move_delay: delay,
            ..self
        }
    }

    /// Makes every move fail after its delay has elapsed.
    pub fn failing_move(self) -> Self {
        Self {
            fail_move: true,
            ..self
        }
    }

    /// Makes the abort handler itself fail (the flag is still raised).
    pub fn failing_abort(self) -> Self {
        Self {
            fail_abort: true,
            ..self
        }
    }

    /// Records start/end/abort events into the shared log.
    pub fn with_event_log(self, log: EventLog) -> Self {
        Self {
            events: Some(log),
            ..self
        }
    }

    /// How many times `abort()` has been invoked on this device.
    pub fn abort_count(&self) -> usize {
        self.abort_count.load(Ordering::SeqCst)
    }

    /// The last position this device settled at.
    pub fn last_position(&self) -> f64 {
        self.position.lock().map(|p| *p).unwrap_or(f64::NAN)
    }
}

#[async_trait]
impl Device for MockScannable {
    fn name(&self) -> &str {
        &self.name
    }

    fn level(&self) -> u32 {
        self.level.load(Ordering::SeqCst)
    }

    fn set_level(&self, level: u32) {
        self.level.store(level, Ordering::SeqCst);
    }

    async fn abort(&self) -> Result<()> {
        self.abort_count.fetch_add(1, Ordering::SeqCst);
        self.cancel.store(true, Ordering::SeqCst);
        record(&self.events, format!("{} abort", self.name));
        if self.fail_abort {
            return Err(anyhow!("abort handler of '{}' failed", self.name));
        }
        Ok(())
    }
}

#[async_trait]
impl Positionable for MockScannable {
    async fn position(&self) -> Result<f64> {
        Ok(self.last_position())
    }

    async fn set_position(&self, target: f64, _point: &ScanPoint) -> Result<f64> {
        self.cancel.store(false, Ordering::SeqCst);
        record(&self.events, format!("{} start", self.name));

        // The cancellation flag is polled inside the move loop; the
        // coordinator never reaches into this wait.
        let mut remaining = self.move_delay;
        while !remaining.is_zero() {
            let slice = remaining.min(MOVE_POLL);
            sleep(slice).await;
            remaining -= slice;
            if self.cancel.load(Ordering::SeqCst) {
                record(&self.events, format!("{} aborted", self.name));
                return Err(anyhow!("move of '{}' aborted", self.name));
            }
        }

        if self.fail_move {
            record(&self.events, format!("{} failed", self.name));
            return Err(anyhow!("'{}' refused to move", self.name));
        }
        if let Ok(mut position) = self.position.lock() {
            *position = target;
        }
        record(&self.events, format!("{} end", self.name));
        Ok(target)
    }
}

// =============================================================================
// MockDetector
// =============================================================================

/// An acquirable device that records its lifecycle.
pub struct MockDetector {
    name: String,
    level: AtomicU32,
    model: Option<DeviceModel>,
    run_delay: Duration,
    fail_run: bool,
    fail_will_perform: bool,
    fail_abort: bool,
    busy: AtomicBool,
    run_count: AtomicUsize,
    abort_count: AtomicUsize,
    events: Option<EventLog>,
}

impl MockDetector {
    /// Creates a detector with no model and an instantaneous acquisition.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            level: AtomicU32::new(1),
            model: None,
            run_delay: Duration::ZERO,
            fail_run: false,
            fail_will_perform: false,
            fail_abort: false,
            busy: AtomicBool::new(false),
            run_count: AtomicUsize::new(0),
            abort_count: AtomicUsize::new(0),
            events: None,
        }
    }

    /// Attaches exposure/timeout metadata.
    pub fn with_model(self, model: DeviceModel) -> Self {
        Self {
            model: Some(model),
            ..self
        }
    }

    /// Makes every acquisition take this long.
    pub fn with_run_delay(self, delay: Duration) -> Self {
        Self {
            run_delay: delay,
            ..self
        }
    }

    /// Makes every acquisition fail.
    pub fn failing_run(self) -> Self {
        Self {
            fail_run: true,
            ..self
        }
    }

    /// Makes the will-perform notification fail.
    pub fn failing_will_perform(self) -> Self {
        Self {
            fail_will_perform: true,
            ..self
        }
    }

    /// Makes the abort handler itself fail.
    pub fn failing_abort(self) -> Self {
        Self {
            fail_abort: true,
            ..self
        }
    }

    /// Records the acquisition lifecycle into the shared log.
    pub fn with_event_log(self, log: EventLog) -> Self {
        Self {
            events: Some(log),
            ..self
        }
    }

    /// How many acquisitions have been started on this device.
    pub fn run_count(&self) -> usize {
        self.run_count.load(Ordering::SeqCst)
    }

    /// How many times `abort()` has been invoked on this device.
    pub fn abort_count(&self) -> usize {
        self.abort_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Device for MockDetector {
    fn name(&self) -> &str {
        &self.name
    }

    fn level(&self) -> u32 {
        self.level.load(Ordering::SeqCst)
    }

    fn set_level(&self, level: u32) {
        self.level.store(level, Ordering::SeqCst);
    }

    async fn abort(&self) -> Result<()> {
        self.abort_count.fetch_add(1, Ordering::SeqCst);
        record(&self.events, format!("{} abort", self.name));
        if self.fail_abort {
            return Err(anyhow!("abort handler of '{}' failed", self.name));
        }
        Ok(())
    }
}

#[async_trait]
impl Acquirable for MockDetector {
    fn model(&self) -> Option<DeviceModel> {
        self.model
    }

    async fn run(&self, _point: &ScanPoint) -> Result<()> {
        self.run_count.fetch_add(1, Ordering::SeqCst);
        record(&self.events, format!("{} run", self.name));
        if !self.run_delay.is_zero() {
            sleep(self.run_delay).await;
        }
        if self.fail_run {
            return Err(anyhow!("'{}' failed to acquire", self.name));
        }
        Ok(())
    }

    async fn run_will_perform(&self, _point: &ScanPoint) -> Result<()> {
        record(&self.events, format!("{} will_perform", self.name));
        if self.fail_will_perform {
            return Err(anyhow!("'{}' is not ready to acquire", self.name));
        }
        Ok(())
    }

    async fn run_performed(&self, _point: &ScanPoint) -> Result<()> {
        record(&self.events, format!("{} performed", self.name));
        Ok(())
    }

    fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::SeqCst);
        record(&self.events, format!("{} busy={}", self.name, busy));
    }

    fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_move_settles_at_target() {
        let axis = MockScannable::new("x", 1).with_position(2.0);
        let point: ScanPoint = [("x", 3.0)].into_iter().collect();
        let reached = axis.set_position(3.0, &point).await.expect("move");
        assert_eq!(reached, 3.0);
        assert_eq!(axis.last_position(), 3.0);
    }

    #[tokio::test]
    async fn test_mock_move_returns_promptly_on_abort() {
        let axis = Arc::new(
            MockScannable::new("slow", 1).with_move_delay(Duration::from_secs(30)),
        );
        let point: ScanPoint = [("slow", 1.0)].into_iter().collect();

        let mover = Arc::clone(&axis);
        let moving =
            tokio::spawn(async move { mover.set_position(1.0, &point).await });
        sleep(Duration::from_millis(25)).await;

        let started = std::time::Instant::now();
        axis.abort().await.expect("abort");
        let outcome = moving.await.expect("join");
        assert!(outcome.is_err(), "aborted move should fail");
        assert!(
            started.elapsed() < Duration::from_secs(5),
            "blocked move did not return promptly"
        );
        assert_eq!(axis.abort_count(), 1);
    }

    #[tokio::test]
    async fn test_set_level_is_visible() {
        let axis = MockScannable::new("x", 1);
        axis.set_level(7);
        assert_eq!(axis.level(), 7);
    }
}
