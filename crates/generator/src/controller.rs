//! Start/Stop control of the traffic worker
//!
//! The controller is owned by the UI thread. It loads the USB backend on
//! the first Start, resolves the device, spawns the worker and, on Stop,
//! clears the running flag, joins the worker and releases the device the
//! worker hands back.

use crate::config::{TrafficConfig, TransferSettings};
use crate::usb::{RusbBackend, TrafficWorker, TransferPlan, locator, spawn_traffic_worker};
use common::{
    DeviceDescriptor, DeviceSummary, Error, LogSink, OpenDevice, SetupOptions, StatsSnapshot,
    TrafficDevice, TrafficStats, UsbBackend,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{JoinHandle, ThreadId};
use tracing::{debug, info};

/// Produces the USB backend on demand
///
/// Called on every Start until it succeeds, so a missing platform driver
/// can be fixed without restarting the process.
pub type BackendLoader = Box<dyn FnMut() -> common::Result<Box<dyn UsbBackend>> + Send>;

/// Loader for the libusb backend
pub fn rusb_loader() -> BackendLoader {
    Box::new(|| Ok(Box::new(RusbBackend::new()?) as Box<dyn UsbBackend>))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// A worker is already active; nothing was changed
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    NotRunning,
}

/// A running worker and what it was started with
struct Session {
    running: Arc<AtomicBool>,
    worker: JoinHandle<Box<dyn TrafficDevice>>,
    device: DeviceSummary,
    plan: TransferPlan,
}

pub struct TrafficController {
    loader: BackendLoader,
    backend: Option<Box<dyn UsbBackend>>,
    descriptor: DeviceDescriptor,
    setup: SetupOptions,
    transfer: TransferSettings,
    sink: LogSink,
    stats: Arc<TrafficStats>,
    session: Option<Session>,
}

impl TrafficController {
    pub fn new(config: &TrafficConfig, loader: BackendLoader, sink: LogSink) -> Self {
        Self {
            loader,
            backend: None,
            descriptor: config.device.descriptor(),
            setup: config.device.setup_options(),
            transfer: config.transfer.clone(),
            sink,
            stats: Arc::new(TrafficStats::new()),
            session: None,
        }
    }

    /// Start generating traffic
    ///
    /// Errors are written to the log pane and returned; the controller
    /// stays Idle.
    pub fn start(&mut self) -> common::Result<StartOutcome> {
        if self.session.is_some() {
            self.sink.info("Traffic already running");
            return Ok(StartOutcome::AlreadyRunning);
        }

        self.sink.info(format!("Looking for device {}", self.descriptor));

        match self.launch() {
            Ok(session) => {
                self.sink.info(format!(
                    "Started traffic on {}: {}",
                    session.device, session.plan
                ));
                self.session = Some(session);
                Ok(StartOutcome::Started)
            }
            Err(e) => {
                if matches!(e, Error::BackendUnavailable(_)) {
                    // Load it again on the next Start
                    self.backend = None;
                }
                self.sink.error(format!("Start failed: {}", e));
                Err(e)
            }
        }
    }

    fn launch(&mut self) -> common::Result<Session> {
        if self.backend.is_none() {
            let backend = (self.loader)()?;
            debug!("USB backend loaded");
            self.backend = Some(backend);
        }
        let backend = self
            .backend
            .as_deref()
            .ok_or_else(|| Error::BackendUnavailable("backend not loaded".to_string()))?;

        let OpenDevice {
            summary,
            mut handle,
            endpoints,
        } = locator::find(backend, &self.descriptor, &self.setup, &self.sink)?;

        let plan = match TransferPlan::resolve(&self.transfer, &endpoints, self.setup.interface) {
            Ok(plan) => plan,
            Err(e) => {
                handle.release();
                return Err(e);
            }
        };

        self.stats.reset();
        let running = Arc::new(AtomicBool::new(true));
        let worker = spawn_traffic_worker(TrafficWorker {
            device: handle,
            plan: plan.clone(),
            running: running.clone(),
            sink: self.sink.clone(),
            stats: self.stats.clone(),
        })
        .inspect_err(|_| self.stats.mark_stopped())?;

        info!("Traffic worker spawned for {}", summary);
        Ok(Session {
            running,
            worker,
            device: summary,
            plan,
        })
    }

    /// Stop generating traffic
    ///
    /// Blocks until the worker has finished its in-flight transfer, then
    /// releases the device.
    pub fn stop(&mut self) -> StopOutcome {
        let Some(session) = self.session.take() else {
            return StopOutcome::NotRunning;
        };

        session.running.store(false, Ordering::Release);
        match session.worker.join() {
            Ok(mut device) => {
                device.release();
                self.sink.info(format!("Released {}", session.device));
            }
            Err(_) => {
                self.sink
                    .error(format!("Traffic worker for {} panicked", session.device));
            }
        }
        self.stats.mark_stopped();

        let snapshot = self.stats.snapshot();
        self.sink.info(format!(
            "Stopped: {} packets, {} errors, {} timeouts",
            snapshot.packets, snapshot.errors, snapshot.timeouts
        ));
        StopOutcome::Stopped
    }

    pub fn state(&self) -> ControllerState {
        if self.session.is_some() {
            ControllerState::Running
        } else {
            ControllerState::Idle
        }
    }

    /// Thread id of the active worker
    pub fn worker_thread_id(&self) -> Option<ThreadId> {
        self.session.as_ref().map(|s| s.worker.thread().id())
    }

    /// Whether the worker thread has exited on its own
    pub fn worker_finished(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.worker.is_finished())
    }

    pub fn descriptor(&self) -> DeviceDescriptor {
        self.descriptor
    }

    /// Device the active session runs against
    pub fn device(&self) -> Option<DeviceSummary> {
        self.session.as_ref().map(|s| s.device)
    }

    /// Description of the active transfer plan
    pub fn plan(&self) -> Option<&TransferPlan> {
        self.session.as_ref().map(|s| &s.plan)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Enumerate attached devices into the log pane
    pub fn list_devices(&mut self) -> common::Result<Vec<DeviceSummary>> {
        if self.backend.is_none() {
            match (self.loader)() {
                Ok(backend) => self.backend = Some(backend),
                Err(e) => {
                    self.sink.error(format!("Cannot list devices: {}", e));
                    return Err(e);
                }
            }
        }
        let backend = self
            .backend
            .as_deref()
            .ok_or_else(|| Error::BackendUnavailable("backend not loaded".to_string()))?;

        match locator::list_devices(backend) {
            Ok(devices) => {
                self.sink.info(format!("{} USB devices attached", devices.len()));
                for device in &devices {
                    let marker = if self.descriptor.matches(device) {
                        " (target)"
                    } else {
                        ""
                    };
                    self.sink.info(format!("  {}{}", device, marker));
                }
                Ok(devices)
            }
            Err(e) => {
                if matches!(e, Error::BackendUnavailable(_)) {
                    self.backend = None;
                }
                self.sink.error(format!("Cannot list devices: {}", e));
                Err(e)
            }
        }
    }
}

impl Drop for TrafficController {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::create_log_channel;
    use common::test_utils::MockBackend;

    fn controller(backend: MockBackend) -> TrafficController {
        let mut backend = Some(backend);
        let loader: BackendLoader = Box::new(move || {
            backend
                .take()
                .map(|b| Box::new(b) as Box<dyn UsbBackend>)
                .ok_or_else(|| Error::BackendUnavailable("already taken".to_string()))
        });
        let (sink, _feed) = create_log_channel(16);
        TrafficController::new(&TrafficConfig::default(), loader, sink)
    }

    #[test]
    fn test_initial_state() {
        let controller = controller(MockBackend::new());
        assert_eq!(controller.state(), ControllerState::Idle);
        assert!(controller.worker_thread_id().is_none());
        assert!(controller.plan().is_none());
        assert_eq!(controller.descriptor(), DeviceDescriptor::default());
    }

    #[test]
    fn test_stop_when_idle() {
        let mut controller = controller(MockBackend::new());
        assert_eq!(controller.stop(), StopOutcome::NotRunning);
    }

    #[test]
    fn test_plan_failure_releases_device() {
        let backend = MockBackend::new()
            .with_device(0x1fae, 0x0013)
            .with_endpoints(Vec::new());
        let probe = backend.probe();
        let mut controller = controller(backend);

        let err = controller.start().unwrap_err();
        assert!(matches!(err, Error::NoEndpoint { .. }));
        assert!(probe.released());
        assert_eq!(controller.state(), ControllerState::Idle);
    }

    #[test]
    fn test_list_devices_keeps_backend() {
        let mut controller = controller(MockBackend::new().with_device(0x1fae, 0x0013));
        assert_eq!(controller.list_devices().unwrap().len(), 1);
        // The loader only yields once; a second call must reuse the backend
        assert_eq!(controller.list_devices().unwrap().len(), 1);
    }
}
