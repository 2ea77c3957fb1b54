//! USB type abstractions and utilities
//!
//! Value types shared by the locator, the traffic loop and the controller,
//! plus the two traits that form the seam to the USB host library. The
//! generator implements them on top of `rusb`; tests use the mocks in
//! `test_utils`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Default vendor ID of the target device
pub const DEFAULT_VENDOR_ID: u16 = 0x1FAE;

/// Default product ID of the target device
pub const DEFAULT_PRODUCT_ID: u16 = 0x0013;

/// Bit 7 of an endpoint address or bmRequestType selects device-to-host
const DIRECTION_IN_BIT: u8 = 0x80;

/// Vendor/product pair identifying the device to drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceDescriptor {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl DeviceDescriptor {
    pub const fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
        }
    }

    /// Check whether an enumerated device carries this VID/PID
    pub fn matches(&self, device: &DeviceSummary) -> bool {
        device.vendor_id == self.vendor_id && device.product_id == self.product_id
    }
}

impl Default for DeviceDescriptor {
    fn default() -> Self {
        Self::new(DEFAULT_VENDOR_ID, DEFAULT_PRODUCT_ID)
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor_id, self.product_id)
    }
}

/// Parse a 16-bit USB ID written as hex, with or without a `0x` prefix
pub fn parse_hex_id(s: &str) -> crate::Result<u16> {
    let trimmed = s.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);

    if digits.is_empty() || digits.len() > 4 {
        return Err(crate::Error::Config(format!(
            "Invalid USB ID '{}', expected 1-4 hex digits",
            s
        )));
    }

    u16::from_str_radix(digits, 16)
        .map_err(|e| crate::Error::Config(format!("Invalid USB ID '{}': {}", s, e)))
}

/// One device found during enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceSummary {
    pub bus_number: u8,
    pub address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
}

impl fmt::Display for DeviceSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Bus {:03} Device {:03}: {:04x}:{:04x}",
            self.bus_number, self.address, self.vendor_id, self.product_id
        )
    }
}

/// USB transfer type used by the traffic loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferKind {
    #[default]
    Bulk,
    Interrupt,
    Control,
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransferKind::Bulk => "bulk",
            TransferKind::Interrupt => "interrupt",
            TransferKind::Control => "control",
        };
        f.write_str(name)
    }
}

/// Data direction relative to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Host to device
    #[default]
    Out,
    /// Device to host
    In,
}

impl Direction {
    /// Direction encoded in an endpoint address (or bmRequestType)
    pub fn of_address(address: u8) -> Self {
        if address & DIRECTION_IN_BIT != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    /// Replace the direction bit of an endpoint address or bmRequestType
    pub fn apply_to(self, address: u8) -> u8 {
        match self {
            Direction::In => address | DIRECTION_IN_BIT,
            Direction::Out => address & !DIRECTION_IN_BIT,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Out => f.write_str("OUT"),
            Direction::In => f.write_str("IN"),
        }
    }
}

/// Endpoint of the claimed interface, as reported by the backend on open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointInfo {
    pub address: u8,
    pub kind: TransferKind,
}

impl EndpointInfo {
    pub fn direction(&self) -> Direction {
        Direction::of_address(self.address)
    }
}

/// Setup packet fields for control transfers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlSetup {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

/// A single transfer as issued against a [`TrafficDevice`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferRequest {
    pub kind: TransferKind,
    /// Endpoint address including the direction bit (0 for control)
    pub endpoint: u8,
    pub control: ControlSetup,
    pub timeout: Duration,
}

impl TransferRequest {
    pub fn direction(&self) -> Direction {
        match self.kind {
            TransferKind::Control => Direction::of_address(self.control.request_type),
            TransferKind::Bulk | TransferKind::Interrupt => Direction::of_address(self.endpoint),
        }
    }
}

/// How the device is prepared before traffic starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupOptions {
    /// Interface to claim
    pub interface: u8,
    /// Reset the device right after opening it
    pub reset: bool,
    /// Detach an active kernel driver from the interface
    pub detach_kernel_driver: bool,
    /// Select the first configuration before claiming
    pub set_configuration: bool,
}

impl Default for SetupOptions {
    fn default() -> Self {
        Self {
            interface: 0,
            reset: false,
            detach_kernel_driver: true,
            set_configuration: true,
        }
    }
}

/// An opened, configured device owned by exactly one thread at a time
pub trait TrafficDevice: Send {
    /// Host-to-device transfer, returns bytes written
    fn write(&mut self, request: &TransferRequest, data: &[u8]) -> rusb::Result<usize>;

    /// Device-to-host transfer, returns bytes read
    fn read(&mut self, request: &TransferRequest, buf: &mut [u8]) -> rusb::Result<usize>;

    /// Release claimed interfaces and give the device back to the kernel
    fn release(&mut self);
}

/// Access to attached devices through the host library
pub trait UsbBackend: Send {
    /// Enumerate attached devices
    fn devices(&self) -> crate::Result<Vec<DeviceSummary>>;

    /// Open and prepare a previously enumerated device
    fn open(&self, device: &DeviceSummary, options: &SetupOptions) -> crate::Result<OpenDevice>;
}

/// Result of a successful [`UsbBackend::open`]
pub struct OpenDevice {
    pub summary: DeviceSummary,
    pub handle: Box<dyn TrafficDevice>,
    /// Endpoints of the claimed interface
    pub endpoints: Vec<EndpointInfo>,
}

impl fmt::Debug for OpenDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenDevice")
            .field("summary", &self.summary)
            .field("endpoints", &self.endpoints)
            .finish_non_exhaustive()
    }
}
