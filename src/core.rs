//! Core traits and data types for per-point scan coordination.
//!
//! This module defines the capability traits the coordinators drive and the
//! plain data types shared with the outer scan engine.
//!
//! # Architecture Overview
//!
//! Devices are long-lived, created at beamline configuration time, and shared
//! across many scan points; the coordinators hold them as `Arc<dyn ...>`:
//!
//! - [`Device`]: base capability, name + priority level + abort.
//! - [`Positionable`]: a device that can be driven to a target value
//!   (motor, stage axis, temperature controller).
//! - [`Acquirable`]: a device that performs a triggered data collection
//!   (detector) and carries a [`DeviceModel`] describing its exposure.
//!
//! A [`ScanPoint`] is the immutable name-to-target mapping for one coordinate
//! of the scan. Devices sharing a level are concurrency peers; levels are
//! processed strictly ascending.
//!
//! # Thread Safety
//!
//! All traits require `Send + Sync`: a device's `abort()` must be callable
//! from another task while its own `set_position` or `run` is still blocked,
//! so implementations keep their mutable state behind interior mutability.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// =============================================================================
// Scan points
// =============================================================================

/// The target values for one scan point: device name to scalar target.
///
/// Built once per point by the outer scan loop and read-only for the duration
/// of that point. Lookup must be defined for every scannable a coordinator is
/// asked to move; a missing entry is a configuration error surfaced before any
/// device is commanded.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanPoint {
    values: HashMap<String, f64>,
}

impl ScanPoint {
    /// Creates an empty scan point.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the target value for the named device, if one is defined.
    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    /// Returns true if a target is defined for the named device.
    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Number of device targets in this point.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if the point holds no targets.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterates over the device names with targets at this point.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<(S, f64)> for ScanPoint {
    fn from_iter<I: IntoIterator<Item = (S, f64)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().map(|(n, v)| (n.into(), v)).collect(),
        }
    }
}

// =============================================================================
// Levels and roles
// =============================================================================

/// Which phase of a scan point a coordinator executes.
///
/// The outer scan loop uses this to order coordinators (move before run) and
/// to pick the watchdog timeout that applies to each.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LevelRole {
    /// Positioning phase: scannables are driven to their targets.
    Move,
    /// Acquisition phase: detectors are triggered.
    Run,
}

impl fmt::Display for LevelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LevelRole::Move => write!(f, "move"),
            LevelRole::Run => write!(f, "run"),
        }
    }
}

// =============================================================================
// Device models
// =============================================================================

/// Per-detector configuration used for defensive scheduling.
///
/// `timeout` of zero means "derive from exposure": the contribution becomes
/// the exposure time rounded up to the next whole second plus a one-second
/// safety margin.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceModel {
    /// Exposure time in seconds.
    pub exposure_time: f64,
    /// Explicit timeout in whole seconds; 0 derives one from the exposure.
    pub timeout: u64,
}

impl DeviceModel {
    /// Model with the given exposure time and a derived timeout.
    pub fn from_exposure(exposure_time: f64) -> Self {
        Self {
            exposure_time,
            timeout: 0,
        }
    }

    /// Sets an explicit timeout, which wins over the exposure-derived one.
    pub fn with_timeout(mut self, timeout: u64) -> Self {
        self.timeout = timeout;
        self
    }

    /// This device's contribution to the aggregate operation timeout.
    pub fn timeout_contribution(&self) -> Duration {
        if self.timeout != 0 {
            Duration::from_secs(self.timeout)
        } else {
            // exposure 3.4 s contributes ceil(3.4) + 1 = 5 s
            Duration::from_secs(self.exposure_time.ceil() as u64 + 1)
        }
    }
}

// =============================================================================
// Device capability traits
// =============================================================================

/// Base capability shared by every device the coordinators drive.
///
/// The level is the priority used for grouping: devices with equal level are
/// moved or run as concurrency peers, and levels are processed strictly
/// ascending. Levels are mutable so beamline configuration can reorder a
/// device between scans.
#[async_trait]
pub trait Device: Send + Sync {
    /// Unique device name, the key used to look up targets in a [`ScanPoint`].
    fn name(&self) -> &str;

    /// Current priority level.
    fn level(&self) -> u32;

    /// Reassigns the priority level.
    fn set_level(&self, level: u32);

    /// Signals the device to abandon whatever it is doing.
    ///
    /// Must be safely callable while this device is blocked inside its own
    /// move or acquisition, and must tolerate being called when the device is
    /// idle. The device is responsible for making its own blocked call return
    /// promptly; the coordinator only delivers the signal.
    async fn abort(&self) -> Result<()>;
}

/// A device that can be driven to a target value and read back.
#[async_trait]
pub trait Positionable: Device {
    /// Reads the current position.
    async fn position(&self) -> Result<f64>;

    /// Drives the device to `target`, blocking until the move settles.
    ///
    /// `point` is the full scan point the target came from, for devices whose
    /// motion depends on sibling axes. Returns the position actually reached.
    async fn set_position(&self, target: f64, point: &ScanPoint) -> Result<f64>;
}

/// A device that performs a triggered data-collection operation.
#[async_trait]
pub trait Acquirable: Device {
    /// Exposure/timeout metadata, if this device exposes any.
    fn model(&self) -> Option<DeviceModel>;

    /// Performs one acquisition at the given point, blocking until done.
    async fn run(&self, point: &ScanPoint) -> Result<()>;

    /// Notifies the device's own listeners that an acquisition is imminent.
    async fn run_will_perform(&self, point: &ScanPoint) -> Result<()> {
        let _ = point;
        Ok(())
    }

    /// Notifies the device's own listeners that an acquisition completed.
    async fn run_performed(&self, point: &ScanPoint) -> Result<()> {
        let _ = point;
        Ok(())
    }

    /// Marks the device busy or idle.
    fn set_busy(&self, busy: bool);

    /// Returns the current busy flag.
    fn is_busy(&self) -> bool;
}

// =============================================================================
// Listeners and resolution
// =============================================================================

/// Context handed to position listeners around a scannable's move.
pub struct PositionEvent<'a> {
    /// Name of the scannable being moved.
    pub device: &'a str,
    /// The scannable's level.
    pub level: u32,
    /// The scan point the move belongs to.
    pub point: &'a ScanPoint,
}

/// Observer of scannable moves, with veto power.
///
/// `position_will_perform` runs before the first command of a level bucket
/// goes out; returning `false` vetoes the entire point for that coordinator.
/// Veto checks should be side-effect-free, they may run for moves that are
/// subsequently vetoed by a later listener.
pub trait PositionListener: Send + Sync {
    /// Called before a scannable is commanded; `false` vetoes the point.
    fn position_will_perform(&self, event: &PositionEvent<'_>) -> bool {
        let _ = event;
        true
    }

    /// Called after a scannable's level bucket completed successfully.
    fn position_performed(&self, event: &PositionEvent<'_>) {
        let _ = event;
    }
}

/// Resolves a scannable by name.
///
/// This is the injection point for name-based device registration: a
/// [`Positioner`](crate::positioner::Positioner) built from names looks each
/// one up here at the start of every `run()`. A closure or a plain map both
/// work; there is deliberately no process-wide registry.
pub trait ScannableResolver: Send + Sync {
    /// Returns the device registered under `name`, if any.
    fn resolve(&self, name: &str) -> Option<Arc<dyn Positionable>>;
}

impl<F> ScannableResolver for F
where
    F: Fn(&str) -> Option<Arc<dyn Positionable>> + Send + Sync,
{
    fn resolve(&self, name: &str) -> Option<Arc<dyn Positionable>> {
        self(name)
    }
}

impl ScannableResolver for HashMap<String, Arc<dyn Positionable>> {
    fn resolve(&self, name: &str) -> Option<Arc<dyn Positionable>> {
        self.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_point_lookup() {
        let point: ScanPoint = [("x", 1.5), ("y", -2.0)].into_iter().collect();
        assert_eq!(point.get("x"), Some(1.5));
        assert_eq!(point.get("y"), Some(-2.0));
        assert_eq!(point.get("z"), None);
        assert_eq!(point.len(), 2);
    }

    #[test]
    fn test_level_role_display() {
        assert_eq!(LevelRole::Move.to_string(), "move");
        assert_eq!(LevelRole::Run.to_string(), "run");
    }

    #[test]
    fn test_derived_timeout_rounds_up_and_adds_margin() {
        let model = DeviceModel::from_exposure(3.4);
        assert_eq!(model.timeout_contribution(), Duration::from_secs(5));
    }

    #[test]
    fn test_explicit_timeout_wins_over_exposure() {
        let model = DeviceModel::from_exposure(3.4).with_timeout(1);
        assert_eq!(model.timeout_contribution(), Duration::from_secs(1));
    }

    #[test]
    fn test_whole_second_exposure_still_gets_margin() {
        let model = DeviceModel::from_exposure(2.0);
        assert_eq!(model.timeout_contribution(), Duration::from_secs(3));
    }
}
