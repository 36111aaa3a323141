//! Level-ordered concurrent positioning of scannable devices.
//!
//! The [`Positioner`] is the move-phase coordinator: given the scan point's
//! targets it drives every registered scannable into place, one level bucket
//! at a time, with all moves inside a bucket issued concurrently. Before any
//! command of a bucket goes out, registered [`PositionListener`]s get a
//! veto-able will-perform pass.
//!
//! The devices commanded by the most recent `run()` form the active set, and
//! [`Positioner::abort`] is scoped to exactly that set: every member gets its
//! `abort()` invoked, in independent tasks, even while the `run()` is still
//! blocked inside a move.

use std::sync::Arc;

use futures::future::join_all;
use log::{debug, info, warn};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::core::{
    LevelRole, PositionEvent, PositionListener, Positionable, ScanPoint,
    ScannableResolver,
};
use crate::error::{ScanResult, SequencerError};
use crate::level::{abort_all, check_unique_names, group_by_level};

/// Where the positioner's scannables come from.
enum ScannablePool {
    /// A concrete device list.
    Direct(Vec<Arc<dyn Positionable>>),
    /// Names resolved through an injected resolver at each `run()`.
    Named {
        names: Vec<String>,
        resolver: Arc<dyn ScannableResolver>,
    },
}

/// Move-phase coordinator for one scan.
///
/// Created once per scan by the outer scan loop and handed one [`ScanPoint`]
/// per coordinate. Holds no state that survives the scan except the active
/// set, which is overwritten at the start of every `run()`.
pub struct Positioner {
    owner: String,
    pool: ScannablePool,
    listeners: Vec<Arc<dyn PositionListener>>,
    /// Devices commanded by the most recent `run()`; the sole abort target.
    active: Mutex<Vec<Arc<dyn Positionable>>>,
}

impl Positioner {
    /// Creates a positioner over a concrete scannable pool.
    ///
    /// `owner` is an identifying context used in diagnostics only.
    pub fn new(owner: impl Into<String>, scannables: Vec<Arc<dyn Positionable>>) -> Self {
        Self {
            owner: owner.into(),
            pool: ScannablePool::Direct(scannables),
            listeners: Vec::new(),
            active: Mutex::new(Vec::new()),
        }
    }

    /// Creates a positioner whose scannables are registered by name and
    /// resolved through `resolver` at the start of every `run()`.
    pub fn from_names(
        owner: impl Into<String>,
        names: Vec<String>,
        resolver: Arc<dyn ScannableResolver>,
    ) -> Self {
        Self {
            owner: owner.into(),
            pool: ScannablePool::Named { names, resolver },
            listeners: Vec::new(),
            active: Mutex::new(Vec::new()),
        }
    }

    /// Replaces the registered pool used by subsequent `run()` calls.
    ///
    /// Does not affect a `run()` already in flight, nor the active set its
    /// `abort()` would target.
    pub fn set_scannables(&mut self, scannables: Vec<Arc<dyn Positionable>>) {
        self.pool = ScannablePool::Direct(scannables);
    }

    /// Registers a position listener. Listeners run in registration order.
    pub fn add_position_listener(&mut self, listener: Arc<dyn PositionListener>) {
        self.listeners.push(listener);
    }

    /// Deregisters a previously added listener.
    pub fn remove_position_listener(&mut self, listener: &Arc<dyn PositionListener>) {
        self.listeners.retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// This coordinator executes the move phase.
    pub fn level_role(&self) -> LevelRole {
        LevelRole::Move
    }

    fn resolve_pool(&self) -> ScanResult<Vec<Arc<dyn Positionable>>> {
        match &self.pool {
            ScannablePool::Direct(scannables) => Ok(scannables.clone()),
            ScannablePool::Named { names, resolver } => names
                .iter()
                .map(|name| {
                    resolver
                        .resolve(name)
                        .ok_or_else(|| SequencerError::UnknownScannable(name.clone()))
                })
                .collect(),
        }
    }

    /// Drives every registered scannable to its target at `point`.
    ///
    /// Level buckets run strictly in ascending order; moves inside a bucket
    /// run concurrently, and a blocked sibling never prevents the others from
    /// starting or finishing. If a move fails, every sibling in its bucket is
    /// still waited out, no later bucket is started, and the first failure is
    /// surfaced as [`SequencerError::Device`]. Configuration errors (missing
    /// target, duplicate or unresolvable name, listener veto) surface before
    /// any device is commanded.
    pub async fn run(&self, point: &ScanPoint) -> ScanResult<()> {
        let scannables = self.resolve_pool()?;
        check_unique_names(&scannables)?;
        // Every scannable needs a target before anything moves.
        for scannable in &scannables {
            if !point.contains(scannable.name()) {
                return Err(SequencerError::MissingTarget(scannable.name().to_string()));
            }
        }

        *self.active.lock().await = scannables.clone();

        let point = Arc::new(point.clone());
        for (level, bucket) in group_by_level(&scannables) {
            self.notify_will_perform(&bucket, &point)?;

            debug!(
                "{}: moving {} scannable(s) at level {}",
                self.owner,
                bucket.len(),
                level
            );
            let mut moves: Vec<JoinHandle<anyhow::Result<f64>>> =
                Vec::with_capacity(bucket.len());
            for scannable in &bucket {
                let target = point
                    .get(scannable.name())
                    .ok_or_else(|| SequencerError::MissingTarget(scannable.name().to_string()))?;
                let scannable = Arc::clone(scannable);
                let point = Arc::clone(&point);
                moves.push(tokio::spawn(async move {
                    scannable.set_position(target, &point).await
                }));
            }

            // The whole bucket is waited out before any failure is surfaced,
            // so no sibling is left stranded mid-flight.
            let mut first_failure: Option<SequencerError> = None;
            for (scannable, joined) in bucket.iter().zip(join_all(moves).await) {
                let failure = match joined {
                    Ok(Ok(_)) => continue,
                    Ok(Err(cause)) => {
                        warn!(
                            "{}: move of '{}' failed: {:#}",
                            self.owner,
                            scannable.name(),
                            cause
                        );
                        SequencerError::Device {
                            device: scannable.name().to_string(),
                            role: LevelRole::Move,
                            source: cause,
                        }
                    }
                    Err(join_err) => SequencerError::Worker {
                        device: scannable.name().to_string(),
                        source: join_err,
                    },
                };
                if first_failure.is_none() {
                    first_failure = Some(failure);
                }
            }
            if let Some(failure) = first_failure {
                return Err(failure);
            }

            self.notify_performed(&bucket, &point);
        }
        Ok(())
    }

    /// Signals `abort()` to every member of the active set.
    ///
    /// Safe to call from any task while a `run()` is in flight; the signal
    /// reaches devices currently blocked inside their own move. Each member is
    /// attempted unconditionally, and handler failures are aggregated into a
    /// single [`SequencerError::AbortFailed`] after all have been invoked.
    pub async fn abort(&self) -> ScanResult<()> {
        info!("{}: abort requested", self.owner);
        let active = self.active.lock().await.clone();
        abort_all(&self.owner, active).await
    }

    fn notify_will_perform(
        &self,
        bucket: &[Arc<dyn Positionable>],
        point: &ScanPoint,
    ) -> ScanResult<()> {
        for scannable in bucket {
            let event = PositionEvent {
                device: scannable.name(),
                level: scannable.level(),
                point,
            };
            for listener in &self.listeners {
                if !listener.position_will_perform(&event) {
                    info!(
                        "{}: move of '{}' vetoed, point abandoned",
                        self.owner,
                        scannable.name()
                    );
                    return Err(SequencerError::Vetoed(scannable.name().to_string()));
                }
            }
        }
        Ok(())
    }

    fn notify_performed(&self, bucket: &[Arc<dyn Positionable>], point: &ScanPoint) {
        for scannable in bucket {
            let event = PositionEvent {
                device: scannable.name(),
                level: scannable.level(),
                point,
            };
            for listener in &self.listeners {
                listener.position_performed(&event);
            }
        }
    }
}
