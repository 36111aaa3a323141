//! Per-point coordination of scanning-experiment devices.
//!
//! At each coordinate of an experiment scan two phases run in order: a *move*
//! phase that drives positionable devices ("scannables") to their targets, and
//! a *run* phase that triggers acquirable devices (detectors). This library
//! owns both phases for a single scan point:
//!
//! - [`positioner::Positioner`] drives scannables level by level, with
//!   same-level moves issued concurrently and a veto-able listener pass
//!   before any command goes out.
//! - [`runner::DeviceRunner`] triggers detectors sequentially, derives a
//!   defensive timeout budget from their models, and keeps busy-state honest
//!   under failure.
//!
//! Both coordinators remember the devices actually commanded by their most
//! recent `run()` (the active set) and guarantee that `abort()` reaches every
//! one of them, even when an individual device's abort handler fails.
//!
//! The outer scan loop, file writing, and device drivers live elsewhere; this
//! crate is a library invoked once per scan point by an unseen scan engine.

pub mod core;
pub mod error;
mod level;
pub mod mock;
pub mod positioner;
pub mod runner;

pub use crate::core::{
    Acquirable, Device, DeviceModel, LevelRole, PositionEvent, PositionListener, Positionable,
    ScanPoint, ScannableResolver,
};
pub use crate::error::{ScanResult, SequencerError};
pub use crate::positioner::Positioner;
pub use crate::runner::{DeviceRunner, DEFAULT_TIMEOUT};
