//! Integration tests for the Start/Stop controller
//!
//! Runs the controller, locator and traffic worker together against the
//! scripted mock backend.

use common::test_utils::{DEFAULT_TEST_TIMEOUT, MockBackend, OpenFailure, wait_until};
use common::{
    DeviceDescriptor, Error, LogEntry, LogFeed, LogLevel, SetupOptions, UsbBackend,
    create_log_channel,
};
use generator::config::TrafficConfig;
use generator::controller::BackendLoader;
use generator::usb::locator;
use generator::{ControllerState, StartOutcome, StopOutcome, TrafficController};
use proptest::prelude::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

const TARGET_VID: u16 = 0x1fae;
const TARGET_PID: u16 = 0x0013;

/// Loader handing out `backends` one per call, then failing
fn loader(backends: Vec<common::Result<MockBackend>>) -> BackendLoader {
    let mut backends = backends.into_iter();
    Box::new(move || match backends.next() {
        Some(Ok(backend)) => Ok(Box::new(backend) as Box<dyn UsbBackend>),
        Some(Err(e)) => Err(e),
        None => Err(Error::BackendUnavailable("no more backends".to_string())),
    })
}

fn controller_with(config: &TrafficConfig, backend: MockBackend) -> (TrafficController, LogFeed) {
    let (sink, feed) = create_log_channel(4096);
    let controller = TrafficController::new(config, loader(vec![Ok(backend)]), sink);
    (controller, feed)
}

fn target_backend() -> MockBackend {
    MockBackend::new()
        .with_device(0x046d, 0xc077)
        .with_device(TARGET_VID, TARGET_PID)
}

/// Drain `feed` until an entry satisfies `predicate` or the timeout passes
fn wait_for_entry(feed: &LogFeed, mut predicate: impl FnMut(&LogEntry) -> bool) -> bool {
    wait_until(DEFAULT_TEST_TIMEOUT, || feed.drain().iter().any(&mut predicate))
}

#[test]
fn test_start_with_device_present() {
    let (mut controller, feed) = controller_with(&TrafficConfig::default(), target_backend());

    assert_eq!(controller.start().unwrap(), StartOutcome::Started);
    assert_eq!(controller.state(), ControllerState::Running);
    assert_eq!(controller.device().map(|d| d.address), Some(2));

    assert!(wait_for_entry(&feed, |e| {
        e.level == LogLevel::Debug && e.message.starts_with("OUT 64 bytes in")
    }));

    assert_eq!(controller.stop(), StopOutcome::Stopped);
}

#[test]
fn test_start_with_device_absent() {
    let backend = MockBackend::new().with_device(0x046d, 0xc077);
    let opens = backend.open_counter();
    let (mut controller, feed) = controller_with(&TrafficConfig::default(), backend);

    let err = controller.start().unwrap_err();
    assert!(matches!(
        err,
        Error::DeviceNotFound {
            vendor_id: TARGET_VID,
            product_id: TARGET_PID
        }
    ));
    assert_eq!(controller.state(), ControllerState::Idle);
    assert_eq!(opens.load(Ordering::SeqCst), 0);

    let entries = feed.drain();
    assert!(entries.iter().any(|e| {
        e.level == LogLevel::Error && e.message.contains("Device 1fae:0013 not found")
    }));
}

#[test]
fn test_start_twice_is_noop() {
    let backend = target_backend();
    let opens = backend.open_counter();
    let (mut controller, _feed) = controller_with(&TrafficConfig::default(), backend);

    controller.start().unwrap();
    let worker = controller.worker_thread_id();
    assert!(worker.is_some());

    assert_eq!(controller.start().unwrap(), StartOutcome::AlreadyRunning);
    assert_eq!(controller.worker_thread_id(), worker);
    assert_eq!(controller.state(), ControllerState::Running);
    assert_eq!(opens.load(Ordering::SeqCst), 1);

    controller.stop();
}

#[test]
fn test_stop_joins_and_releases() {
    let backend = target_backend();
    let probe = backend.probe();
    let (mut controller, _feed) = controller_with(&TrafficConfig::default(), backend);

    controller.start().unwrap();
    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || probe.transfers() > 10));

    assert_eq!(controller.stop(), StopOutcome::Stopped);
    assert_eq!(controller.state(), ControllerState::Idle);
    assert!(controller.worker_thread_id().is_none());
    assert!(probe.released());

    // The worker is gone, nothing touches the device any more
    let transfers = probe.transfers();
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(probe.transfers(), transfers);

    assert_eq!(controller.stop(), StopOutcome::NotRunning);
}

#[test]
fn test_stop_bounded_by_in_flight_transfer() {
    let backend = target_backend().with_transfer_delay(Duration::from_millis(200));
    let (mut controller, _feed) = controller_with(&TrafficConfig::default(), backend);

    controller.start().unwrap();
    std::thread::sleep(Duration::from_millis(50));

    let started = Instant::now();
    assert_eq!(controller.stop(), StopOutcome::Stopped);
    // The write in flight finishes, no read-back follows it
    assert!(started.elapsed() < Duration::from_millis(200) + Duration::from_millis(100));
}

#[test]
fn test_errors_do_not_stop_loop() {
    let backend = target_backend().with_script(vec![
        Err(rusb::Error::Timeout),
        Err(rusb::Error::Pipe),
        Err(rusb::Error::NoDevice),
        Err(rusb::Error::Timeout),
    ]);
    let (mut controller, feed) = controller_with(&TrafficConfig::default(), backend);

    controller.start().unwrap();
    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || {
        controller.stats().packets >= 5
    }));
    assert_eq!(controller.state(), ControllerState::Running);

    controller.stop();
    let stats = controller.stats();
    assert_eq!(stats.timeouts, 2);
    assert_eq!(stats.errors, 2);

    let warnings = feed
        .drain()
        .into_iter()
        .filter(|e| e.level == LogLevel::Warn)
        .count();
    assert_eq!(warnings, 4);
}

#[test]
fn test_backend_unavailable_then_available() {
    let (sink, feed) = create_log_channel(4096);
    let mut controller = TrafficController::new(
        &TrafficConfig::default(),
        loader(vec![
            Err(Error::BackendUnavailable("libusb missing".to_string())),
            Ok(target_backend()),
        ]),
        sink,
    );

    let err = controller.start().unwrap_err();
    assert!(matches!(err, Error::BackendUnavailable(_)));
    assert_eq!(controller.state(), ControllerState::Idle);
    assert!(
        feed.drain()
            .iter()
            .any(|e| e.level == LogLevel::Error && e.message.contains("libusb missing"))
    );

    assert_eq!(controller.start().unwrap(), StartOutcome::Started);
    controller.stop();
}

#[test]
fn test_failed_enumeration_reloads_backend() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let mut backends = vec![target_backend(), MockBackend::new().failing_enumeration()];
    let loader: BackendLoader = Box::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        backends
            .pop()
            .map(|b| Box::new(b) as Box<dyn UsbBackend>)
            .ok_or_else(|| Error::BackendUnavailable("exhausted".to_string()))
    });
    let (sink, _feed) = create_log_channel(4096);
    let mut controller = TrafficController::new(&TrafficConfig::default(), loader, sink);

    assert!(matches!(
        controller.start(),
        Err(Error::BackendUnavailable(_))
    ));
    assert_eq!(controller.start().unwrap(), StartOutcome::Started);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    controller.stop();
}

#[test]
fn test_permission_denied_stays_idle() {
    let backend = target_backend().failing_open(OpenFailure::PermissionDenied);
    let (mut controller, _feed) = controller_with(&TrafficConfig::default(), backend);

    assert!(matches!(
        controller.start(),
        Err(Error::PermissionDenied { .. })
    ));
    assert_eq!(controller.state(), ControllerState::Idle);
}

#[test]
fn test_restart_after_stop() {
    let backend = target_backend();
    let opens = backend.open_counter();
    let (mut controller, _feed) = controller_with(&TrafficConfig::default(), backend);

    controller.start().unwrap();
    let first = controller.worker_thread_id();
    controller.stop();

    controller.start().unwrap();
    assert_ne!(controller.worker_thread_id(), first);
    assert_eq!(opens.load(Ordering::SeqCst), 2);
    controller.stop();
}

#[test]
fn test_drop_while_running_releases_device() {
    let backend = target_backend();
    let probe = backend.probe();
    let (mut controller, _feed) = controller_with(&TrafficConfig::default(), backend);

    controller.start().unwrap();
    drop(controller);
    assert!(probe.released());
}

#[test]
fn test_configured_descriptor_is_used() {
    let mut config = TrafficConfig::default();
    config.device.vendor_id = 0x046d;
    config.device.product_id = 0xc077;
    let (mut controller, _feed) = controller_with(&config, target_backend());

    controller.start().unwrap();
    assert_eq!(controller.device().map(|d| d.address), Some(1));
    controller.stop();
}

#[tokio::test]
async fn test_log_feed_delivers_start_entries() {
    let (mut controller, feed) = controller_with(&TrafficConfig::default(), target_backend());
    controller.start().unwrap();

    let first = tokio::time::timeout(DEFAULT_TEST_TIMEOUT, feed.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.level, LogLevel::Info);
    assert_eq!(first.message, "Looking for device 1fae:0013");

    controller.stop();
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_unmatched_descriptor_not_found(vid in any::<u16>(), pid in any::<u16>()) {
        prop_assume!((vid, pid) != (TARGET_VID, TARGET_PID) && (vid, pid) != (0x046d, 0xc077));

        let backend = target_backend();
        let (sink, _feed) = create_log_channel(16);
        let result = locator::find(
            &backend,
            &DeviceDescriptor::new(vid, pid),
            &SetupOptions::default(),
            &sink,
        );

        match result {
            Err(Error::DeviceNotFound { vendor_id, product_id }) => {
                prop_assert_eq!(vendor_id, vid);
                prop_assert_eq!(product_id, pid);
            }
            other => prop_assert!(false, "unexpected result: {:?}", other),
        }
    }
}
