//! Sequential acquisition of runnable devices at one scan point.
//!
//! The [`DeviceRunner`] is the run-phase coordinator: once positioning is
//! complete it fires each detector in registration order, wrapping every
//! acquisition in the will-perform / busy / performed lifecycle. Unlike the
//! positioner it is fail-fast: the first failing device stops the point, with
//! its busy flag cleared before the error surfaces.
//!
//! The runner also advertises an aggregate timeout derived from the device
//! models. The value is a budget for the external scan supervisor to watch;
//! nothing in this crate enforces it.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::Mutex;

use crate::core::{Acquirable, LevelRole, ScanPoint};
use crate::error::{ScanResult, SequencerError};
use crate::level::{abort_all, check_unique_names};

/// Fallback operation timeout when no registered device exposes a model.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Run-phase coordinator for one scan.
///
/// The device set is fixed for the lifetime of the instance. Acquisition is a
/// single level by contract; if a scan needs multiple run levels that is the
/// outer scan loop's business.
pub struct DeviceRunner {
    owner: String,
    devices: Vec<Arc<dyn Acquirable>>,
    /// Devices commanded by the most recent `run()`; the sole abort target.
    active: Mutex<Vec<Arc<dyn Acquirable>>>,
}

impl DeviceRunner {
    /// Creates a runner over a fixed detector set.
    ///
    /// `owner` is an identifying context used in diagnostics only.
    pub fn new(owner: impl Into<String>, devices: Vec<Arc<dyn Acquirable>>) -> Self {
        Self {
            owner: owner.into(),
            devices,
            active: Mutex::new(Vec::new()),
        }
    }

    /// The registered device collection, read-only.
    pub fn devices(&self) -> &[Arc<dyn Acquirable>] {
        &self.devices
    }

    /// This coordinator executes the run phase.
    pub fn level_role(&self) -> LevelRole {
        LevelRole::Run
    }

    /// A safe upper bound on how long one `run()` should take.
    ///
    /// Each device with a model contributes its explicit timeout, or, when
    /// that is unset, its exposure time rounded up to the next whole second
    /// plus a one-second margin. The aggregate is the maximum contribution;
    /// with no model information at all it falls back to [`DEFAULT_TIMEOUT`].
    pub fn timeout(&self) -> Duration {
        self.devices
            .iter()
            .filter_map(|device| device.model())
            .map(|model| model.timeout_contribution())
            .max()
            .unwrap_or(DEFAULT_TIMEOUT)
    }

    /// Runs one acquisition cycle at `point`.
    ///
    /// Devices run in registration order. For each one the observed lifecycle
    /// is will-perform, busy set, acquisition, busy cleared, then performed on
    /// success. A failing acquisition stops the point immediately, but its
    /// device's busy flag is cleared before [`SequencerError::Device`] is
    /// raised; later devices are not attempted.
    pub async fn run(&self, point: &ScanPoint) -> ScanResult<()> {
        check_unique_names(&self.devices)?;
        *self.active.lock().await = self.devices.clone();

        for device in &self.devices {
            let name = device.name();
            debug!("{}: acquiring on '{}'", self.owner, name);

            device
                .run_will_perform(point)
                .await
                .map_err(|cause| self.device_failure(name, cause))?;

            device.set_busy(true);
            let outcome = device.run(point).await;
            // Busy must never be left set, whatever the acquisition did.
            device.set_busy(false);

            match outcome {
                Ok(()) => device
                    .run_performed(point)
                    .await
                    .map_err(|cause| self.device_failure(name, cause))?,
                Err(cause) => {
                    warn!("{}: acquisition on '{}' failed: {:#}", self.owner, name, cause);
                    return Err(self.device_failure(name, cause));
                }
            }
        }
        Ok(())
    }

    /// Signals `abort()` to every member of the active set.
    ///
    /// Same contract as the positioner's abort: every member is attempted in
    /// its own task, and handler failures are aggregated after all have been
    /// invoked.
    pub async fn abort(&self) -> ScanResult<()> {
        info!("{}: abort requested", self.owner);
        let active = self.active.lock().await.clone();
        abort_all(&self.owner, active).await
    }

    fn device_failure(&self, device: &str, cause: anyhow::Error) -> SequencerError {
        SequencerError::Device {
            device: device.to_string(),
            role: LevelRole::Run,
            source: cause,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DeviceModel;
    use crate::mock::MockDetector;

    fn runner_of(devices: Vec<Arc<dyn Acquirable>>) -> DeviceRunner {
        DeviceRunner::new("test", devices)
    }

    #[test]
    fn test_timeout_derived_from_exposure() {
        // exposure 3.4 s: ceil to 4, plus the 1 s margin
        let detector = Arc::new(MockDetector::new("det").with_model(DeviceModel::from_exposure(3.4)));
        let runner = runner_of(vec![detector]);
        assert_eq!(runner.timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_explicit_timeout_wins() {
        let detector = Arc::new(
            MockDetector::new("det").with_model(DeviceModel::from_exposure(3.4).with_timeout(1)),
        );
        let runner = runner_of(vec![detector]);
        assert_eq!(runner.timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_timeout_is_max_across_devices() {
        let one = Arc::new(
            MockDetector::new("one").with_model(DeviceModel::from_exposure(0.1).with_timeout(1)),
        );
        let two = Arc::new(
            MockDetector::new("two").with_model(DeviceModel::from_exposure(0.1).with_timeout(2)),
        );
        let runner = runner_of(vec![one, two]);
        assert_eq!(runner.timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_timeout_defaults_without_model_info() {
        let detector = Arc::new(MockDetector::new("modelless"));
        let runner = runner_of(vec![detector]);
        assert_eq!(runner.timeout(), DEFAULT_TIMEOUT);
    }

    #[test]
    fn test_modelless_device_ignored_in_aggregate() {
        let modelless = Arc::new(MockDetector::new("modelless"));
        let modelled = Arc::new(
            MockDetector::new("modelled").with_model(DeviceModel::from_exposure(1.0).with_timeout(3)),
        );
        let runner = runner_of(vec![modelless, modelled]);
        assert_eq!(runner.timeout(), Duration::from_secs(3));
    }

    #[test]
    fn test_level_role_is_run() {
        let runner = runner_of(Vec::new());
        assert_eq!(runner.level_role(), LevelRole::Run);
    }
}
