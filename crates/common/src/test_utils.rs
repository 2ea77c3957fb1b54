//! Test utilities for usb-traffic
//!
//! Provides a scripted in-memory USB backend so the locator, the traffic
//! loop and the controller can be exercised without hardware.

use crate::usb_types::{
    DeviceSummary, EndpointInfo, OpenDevice, SetupOptions, TrafficDevice, TransferKind,
    TransferRequest, UsbBackend,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Byte pattern returned by mock reads
pub const MOCK_READ_FILL: u8 = 0xa5;

/// Poll `condition` until it holds or `timeout` elapses
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Create a device summary on bus 1
pub fn mock_summary(address: u8, vendor_id: u16, product_id: u16) -> DeviceSummary {
    DeviceSummary {
        bus_number: 1,
        address,
        vendor_id,
        product_id,
    }
}

/// Bulk OUT 0x01 and bulk IN 0x81
pub fn bulk_endpoints() -> Vec<EndpointInfo> {
    vec![
        EndpointInfo {
            address: 0x01,
            kind: TransferKind::Bulk,
        },
        EndpointInfo {
            address: 0x81,
            kind: TransferKind::Bulk,
        },
    ]
}

/// Shared view of what happened to the mock devices a backend handed out
#[derive(Debug, Clone, Default)]
pub struct DeviceProbe {
    inner: Arc<ProbeInner>,
}

#[derive(Debug, Default)]
struct ProbeInner {
    writes: AtomicU64,
    reads: AtomicU64,
    released: AtomicBool,
    last_request: Mutex<Option<TransferRequest>>,
}

impl DeviceProbe {
    pub fn writes(&self) -> u64 {
        self.inner.writes.load(Ordering::SeqCst)
    }

    pub fn reads(&self) -> u64 {
        self.inner.reads.load(Ordering::SeqCst)
    }

    pub fn transfers(&self) -> u64 {
        self.writes() + self.reads()
    }

    pub fn released(&self) -> bool {
        self.inner.released.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<TransferRequest> {
        self.inner.last_request.lock().ok().and_then(|r| *r)
    }

    fn remember(&self, request: &TransferRequest) {
        if let Ok(mut last) = self.inner.last_request.lock() {
            *last = Some(*request);
        }
    }
}

/// Scripted device
///
/// Each transfer pops the next scripted result; once the script is empty
/// every transfer succeeds with the full buffer length.
pub struct MockDevice {
    script: Arc<Mutex<VecDeque<rusb::Result<usize>>>>,
    delay: Duration,
    probe: DeviceProbe,
}

impl MockDevice {
    pub fn new(script: Vec<rusb::Result<usize>>) -> Self {
        Self {
            script: Arc::new(Mutex::new(script.into())),
            delay: Duration::ZERO,
            probe: DeviceProbe::default(),
        }
    }

    /// Sleep this long inside every transfer
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn probe(&self) -> DeviceProbe {
        self.probe.clone()
    }

    fn next_result(&self, len: usize) -> rusb::Result<usize> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let scripted = self.script.lock().ok().and_then(|mut s| s.pop_front());
        match scripted {
            Some(Ok(n)) => Ok(n.min(len)),
            Some(Err(e)) => Err(e),
            None => Ok(len),
        }
    }
}

impl TrafficDevice for MockDevice {
    fn write(&mut self, request: &TransferRequest, data: &[u8]) -> rusb::Result<usize> {
        self.probe.remember(request);
        self.probe.inner.writes.fetch_add(1, Ordering::SeqCst);
        self.next_result(data.len())
    }

    fn read(&mut self, request: &TransferRequest, buf: &mut [u8]) -> rusb::Result<usize> {
        self.probe.remember(request);
        self.probe.inner.reads.fetch_add(1, Ordering::SeqCst);
        let n = self.next_result(buf.len())?;
        buf[..n].fill(MOCK_READ_FILL);
        Ok(n)
    }

    fn release(&mut self) {
        self.probe.inner.released.store(true, Ordering::SeqCst);
    }
}

/// How [`MockBackend::open`] should fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenFailure {
    PermissionDenied,
    Setup(String),
}

/// In-memory backend with a fixed device list
pub struct MockBackend {
    devices: Vec<DeviceSummary>,
    endpoints: Vec<EndpointInfo>,
    script: Vec<rusb::Result<usize>>,
    delay: Duration,
    enumeration_fails: bool,
    open_failure: Option<OpenFailure>,
    opened: Arc<AtomicUsize>,
    probe: DeviceProbe,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    /// Backend with no attached devices and bulk endpoints 0x01/0x81
    pub fn new() -> Self {
        Self {
            devices: Vec::new(),
            endpoints: bulk_endpoints(),
            script: Vec::new(),
            delay: Duration::ZERO,
            enumeration_fails: false,
            open_failure: None,
            opened: Arc::new(AtomicUsize::new(0)),
            probe: DeviceProbe::default(),
        }
    }

    /// Attach a device at the next free address
    pub fn with_device(mut self, vendor_id: u16, product_id: u16) -> Self {
        let address = self.devices.len() as u8 + 1;
        self.devices
            .push(mock_summary(address, vendor_id, product_id));
        self
    }

    pub fn with_endpoints(mut self, endpoints: Vec<EndpointInfo>) -> Self {
        self.endpoints = endpoints;
        self
    }

    /// Transfer results for the device handed out by `open`
    pub fn with_script(mut self, script: Vec<rusb::Result<usize>>) -> Self {
        self.script = script;
        self
    }

    pub fn with_transfer_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Make `devices` fail as if libusb could not enumerate
    pub fn failing_enumeration(mut self) -> Self {
        self.enumeration_fails = true;
        self
    }

    pub fn failing_open(mut self, failure: OpenFailure) -> Self {
        self.open_failure = Some(failure);
        self
    }

    /// Probe shared by every device this backend opens
    pub fn probe(&self) -> DeviceProbe {
        self.probe.clone()
    }

    /// Shared counter of successful opens
    pub fn open_counter(&self) -> Arc<AtomicUsize> {
        self.opened.clone()
    }
}

impl UsbBackend for MockBackend {
    fn devices(&self) -> crate::Result<Vec<DeviceSummary>> {
        if self.enumeration_fails {
            return Err(crate::Error::BackendUnavailable(
                "mock enumeration failure".to_string(),
            ));
        }
        Ok(self.devices.clone())
    }

    fn open(&self, device: &DeviceSummary, _options: &SetupOptions) -> crate::Result<OpenDevice> {
        match &self.open_failure {
            Some(OpenFailure::PermissionDenied) => {
                return Err(crate::Error::PermissionDenied {
                    vendor_id: device.vendor_id,
                    product_id: device.product_id,
                });
            }
            Some(OpenFailure::Setup(message)) => {
                return Err(crate::Error::DeviceSetup(message.clone()));
            }
            None => {}
        }

        let handle = MockDevice {
            script: Arc::new(Mutex::new(self.script.clone().into())),
            delay: self.delay,
            probe: self.probe.clone(),
        };
        self.opened.fetch_add(1, Ordering::SeqCst);

        Ok(OpenDevice {
            summary: *device,
            handle: Box::new(handle),
            endpoints: self.endpoints.clone(),
        })
    }
}
