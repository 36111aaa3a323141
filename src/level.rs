//! Level bucketing and the total-abort fan-out shared by both coordinators.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use log::{debug, warn};
use tokio::task::JoinSet;

use crate::core::Device;
use crate::error::{ScanResult, SequencerError};

/// Fails with `DuplicateName` if two devices in the pool share a name.
pub(crate) fn check_unique_names<D: Device + ?Sized>(devices: &[Arc<D>]) -> ScanResult<()> {
    let mut seen = HashSet::new();
    for device in devices {
        if !seen.insert(device.name().to_string()) {
            return Err(SequencerError::DuplicateName(device.name().to_string()));
        }
    }
    Ok(())
}

/// Partitions devices into ascending level buckets.
///
/// Devices in one bucket are concurrency peers; ordering across buckets is
/// total. Within a bucket the registration order is preserved but carries no
/// meaning.
pub(crate) fn group_by_level<D: Device + ?Sized>(devices: &[Arc<D>]) -> Vec<(u32, Vec<Arc<D>>)> {
    let mut buckets: BTreeMap<u32, Vec<Arc<D>>> = BTreeMap::new();
    for device in devices {
        buckets.entry(device.level()).or_default().push(Arc::clone(device));
    }
    buckets.into_iter().collect()
}

/// Invokes `abort()` on every device, unconditionally.
///
/// Each abort runs in its own task, so a slow or failing handler never delays
/// the signal to the remaining devices, and none of them waits on an in-flight
/// move. Failures are collected and surfaced as one aggregate error only after
/// every device has been attempted.
pub(crate) async fn abort_all<D>(owner: &str, devices: Vec<Arc<D>>) -> ScanResult<()>
where
    D: Device + ?Sized + 'static,
{
    let attempted = devices.len();
    debug!("{}: aborting {} active device(s)", owner, attempted);

    let mut tasks = JoinSet::new();
    for device in devices {
        let name = device.name().to_string();
        tasks.spawn(async move { (name, device.abort().await) });
    }

    let mut failures = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((_, Ok(()))) => {}
            Ok((name, Err(cause))) => {
                warn!("{}: abort of '{}' failed: {:#}", owner, name, cause);
                failures.push((name, cause));
            }
            Err(join_err) => {
                warn!("{}: abort task panicked: {}", owner, join_err);
                failures.push(("<worker>".to_string(), anyhow::Error::new(join_err)));
            }
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(SequencerError::AbortFailed {
            attempted,
            failures,
        })
    }
}
