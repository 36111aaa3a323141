//! Integration tests for the run-phase coordinator.

use std::sync::Arc;
use std::time::Duration;

use scan_sequencer::mock::{drain_events, new_event_log, MockDetector};
use scan_sequencer::{
    Acquirable, Device, DeviceModel, DeviceRunner, LevelRole, ScanPoint, SequencerError,
    DEFAULT_TIMEOUT,
};

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn as_pool(detectors: &[Arc<MockDetector>]) -> Vec<Arc<dyn Acquirable>> {
    detectors
        .iter()
        .map(|d| Arc::clone(d) as Arc<dyn Acquirable>)
        .collect()
}

fn empty_point() -> ScanPoint {
    ScanPoint::new()
}

#[tokio::test]
async fn test_single_run_lifecycle_order() {
    init_logs();
    let log = new_event_log();
    let detector = Arc::new(MockDetector::new("det").with_event_log(log.clone()));
    let runner = DeviceRunner::new("scan", as_pool(&[detector]));
    assert_eq!(runner.level_role(), LevelRole::Run);

    runner.run(&empty_point()).await.expect("acquisition");

    assert_eq!(
        drain_events(&log),
        vec![
            "det will_perform".to_string(),
            "det busy=true".to_string(),
            "det run".to_string(),
            "det busy=false".to_string(),
            "det performed".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_devices_run_in_registration_order() {
    let log = new_event_log();
    let first = Arc::new(MockDetector::new("first").with_event_log(log.clone()));
    let second = Arc::new(MockDetector::new("second").with_event_log(log.clone()));
    let runner = DeviceRunner::new("scan", as_pool(&[first, second]));

    runner.run(&empty_point()).await.expect("acquisition");

    let events = drain_events(&log);
    assert_eq!(events[0], "first will_perform");
    assert_eq!(events[4], "first performed");
    assert_eq!(events[5], "second will_perform");
    assert_eq!(events[9], "second performed");
}

#[tokio::test]
async fn test_failing_run_is_fail_fast_and_clears_busy() {
    init_logs();
    let log = new_event_log();
    let broken = Arc::new(
        MockDetector::new("broken")
            .failing_run()
            .with_event_log(log.clone()),
    );
    let never_reached = Arc::new(MockDetector::new("never_reached").with_event_log(log.clone()));
    let runner = DeviceRunner::new("scan", as_pool(&[broken.clone(), never_reached.clone()]));

    let err = runner
        .run(&empty_point())
        .await
        .expect_err("broken detector fails the point");
    match err {
        SequencerError::Device { device, role, .. } => {
            assert_eq!(device, "broken");
            assert_eq!(role, LevelRole::Run);
        }
        other => panic!("unexpected error: {other}"),
    }

    assert!(!broken.is_busy(), "busy must be cleared on failure");
    assert_eq!(never_reached.run_count(), 0, "later devices are not attempted");

    let events = drain_events(&log);
    assert_eq!(
        events,
        vec![
            "broken will_perform".to_string(),
            "broken busy=true".to_string(),
            "broken run".to_string(),
            "broken busy=false".to_string(),
        ],
        "no performed event after a failure"
    );
}

#[tokio::test]
async fn test_failing_will_perform_never_sets_busy() {
    let log = new_event_log();
    let unready = Arc::new(
        MockDetector::new("unready")
            .failing_will_perform()
            .with_event_log(log.clone()),
    );
    let runner = DeviceRunner::new("scan", as_pool(&[unready.clone()]));

    let err = runner.run(&empty_point()).await.expect_err("not ready");
    assert!(matches!(err, SequencerError::Device { device, .. } if device == "unready"));
    assert!(!unready.is_busy());
    assert_eq!(unready.run_count(), 0);
    assert_eq!(drain_events(&log), vec!["unready will_perform".to_string()]);
}

#[tokio::test]
async fn test_abort_reaches_every_active_detector() {
    init_logs();
    let detectors = vec![
        Arc::new(MockDetector::new("a")),
        Arc::new(MockDetector::new("b").failing_abort()),
        Arc::new(MockDetector::new("c")),
    ];
    let runner = DeviceRunner::new("scan", as_pool(&detectors));
    runner.run(&empty_point()).await.expect("acquisition");

    let err = runner.abort().await.expect_err("one handler fails");
    match err {
        SequencerError::AbortFailed {
            attempted,
            failures,
        } => {
            assert_eq!(attempted, 3);
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].0, "b");
        }
        other => panic!("unexpected error: {other}"),
    }
    for detector in &detectors {
        assert_eq!(detector.abort_count(), 1, "detector {}", detector.name());
    }
}

#[tokio::test]
async fn test_abort_before_any_run_is_a_no_op() {
    let detector = Arc::new(MockDetector::new("idle"));
    let runner = DeviceRunner::new("scan", as_pool(&[detector.clone()]));

    runner.abort().await.expect("nothing active");
    assert_eq!(detector.abort_count(), 0);
}

#[tokio::test]
async fn test_duplicate_detector_name_is_rejected() {
    let detectors = vec![
        Arc::new(MockDetector::new("det")),
        Arc::new(MockDetector::new("det")),
    ];
    let runner = DeviceRunner::new("scan", as_pool(&detectors));

    let err = runner.run(&empty_point()).await.expect_err("duplicate name");
    assert!(matches!(err, SequencerError::DuplicateName(name) if name == "det"));
    assert_eq!(detectors[0].run_count(), 0);
}

#[tokio::test]
async fn test_timeout_covers_the_slowest_device() {
    // One detector derives 5 s from its 3.4 s exposure, the other declares 2 s.
    let slow = Arc::new(MockDetector::new("slow").with_model(DeviceModel::from_exposure(3.4)));
    let quick = Arc::new(
        MockDetector::new("quick").with_model(DeviceModel::from_exposure(0.2).with_timeout(2)),
    );
    let runner = DeviceRunner::new("scan", as_pool(&[slow, quick]));
    assert_eq!(runner.timeout(), Duration::from_secs(5));
}

#[tokio::test]
async fn test_timeout_falls_back_without_models() {
    let runner = DeviceRunner::new(
        "scan",
        as_pool(&[
            Arc::new(MockDetector::new("one")),
            Arc::new(MockDetector::new("two")),
        ]),
    );
    assert_eq!(runner.timeout(), DEFAULT_TIMEOUT);
    assert_eq!(runner.devices().len(), 2);
}
