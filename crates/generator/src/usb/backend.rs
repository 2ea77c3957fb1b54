//! libusb backend
//!
//! Implements the [`UsbBackend`] and [`TrafficDevice`] seams on top of
//! `rusb`. Opening a device performs the same preparation for every
//! platform: optional reset, kernel driver detach, configuration select,
//! interface claim.

use common::{
    DeviceSummary, EndpointInfo, Error, OpenDevice, SetupOptions, TrafficDevice, TransferKind,
    TransferRequest, UsbBackend,
};
use rusb::{Context, Device, DeviceHandle, UsbContext};
use tracing::{debug, info, warn};

/// Backend owning the libusb context
pub struct RusbBackend {
    context: Context,
}

impl RusbBackend {
    /// Initialise libusb
    ///
    /// Fails with [`Error::BackendUnavailable`] when the library or the
    /// platform driver cannot be loaded.
    pub fn new() -> common::Result<Self> {
        let context = Context::new().map_err(|e| {
            warn!("Failed to initialise libusb: {}", e);
            Error::BackendUnavailable(e.to_string())
        })?;

        let version = rusb::version();
        info!(
            "Using libusb {}.{}.{}.{}",
            version.major(),
            version.minor(),
            version.micro(),
            version.nano()
        );

        Ok(Self { context })
    }

    /// Find the rusb device behind an enumerated summary
    fn find_device(&self, summary: &DeviceSummary) -> common::Result<Device<Context>> {
        let devices = self
            .context
            .devices()
            .map_err(|e| Error::BackendUnavailable(e.to_string()))?;

        devices
            .iter()
            .find(|d| d.bus_number() == summary.bus_number && d.address() == summary.address)
            .ok_or(Error::DeviceNotFound {
                vendor_id: summary.vendor_id,
                product_id: summary.product_id,
            })
    }
}

impl UsbBackend for RusbBackend {
    fn devices(&self) -> common::Result<Vec<DeviceSummary>> {
        let devices = self
            .context
            .devices()
            .map_err(|e| Error::BackendUnavailable(e.to_string()))?;

        let mut summaries = Vec::with_capacity(devices.len());
        for device in devices.iter() {
            match device.device_descriptor() {
                Ok(descriptor) => summaries.push(DeviceSummary {
                    bus_number: device.bus_number(),
                    address: device.address(),
                    vendor_id: descriptor.vendor_id(),
                    product_id: descriptor.product_id(),
                }),
                Err(e) => warn!(
                    "Skipping device bus={} addr={}: {}",
                    device.bus_number(),
                    device.address(),
                    e
                ),
            }
        }

        Ok(summaries)
    }

    fn open(&self, summary: &DeviceSummary, options: &SetupOptions) -> common::Result<OpenDevice> {
        let device = self.find_device(summary)?;

        let handle = device.open().map_err(|e| {
            warn!("Failed to open device: {}", e);
            map_open_error(e, summary)
        })?;
        debug!("Opened device {}", summary);

        // Dropping `opened` on a setup error reattaches a detached driver
        let mut opened = RusbDevice {
            handle: Some(handle),
            interface: options.interface,
            claimed: false,
            detached: false,
        };
        opened.prepare(&device, options, summary)?;

        let endpoints = read_endpoints(&device, opened.interface);
        debug!("Interface {} endpoints: {:?}", opened.interface, endpoints);

        Ok(OpenDevice {
            summary: *summary,
            handle: Box::new(opened),
            endpoints,
        })
    }
}

/// Endpoints of alternate setting 0 of `interface` in the active configuration
fn read_endpoints(device: &Device<Context>, interface: u8) -> Vec<EndpointInfo> {
    let config = match device.active_config_descriptor() {
        Ok(config) => config,
        Err(e) => {
            warn!("Failed to get active config descriptor: {}", e);
            return Vec::new();
        }
    };

    config
        .interfaces()
        .filter(|i| i.number() == interface)
        .flat_map(|i| i.descriptors())
        .filter(|d| d.setting_number() == 0)
        .flat_map(|d| {
            d.endpoint_descriptors()
                .filter_map(|ep| {
                    map_transfer_type(ep.transfer_type()).map(|kind| EndpointInfo {
                        address: ep.address(),
                        kind,
                    })
                })
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Isochronous endpoints are not driven by the traffic loop
fn map_transfer_type(transfer_type: rusb::TransferType) -> Option<TransferKind> {
    match transfer_type {
        rusb::TransferType::Bulk => Some(TransferKind::Bulk),
        rusb::TransferType::Interrupt => Some(TransferKind::Interrupt),
        rusb::TransferType::Control => Some(TransferKind::Control),
        rusb::TransferType::Isochronous => None,
    }
}

fn map_open_error(err: rusb::Error, summary: &DeviceSummary) -> Error {
    match err {
        rusb::Error::Access => Error::PermissionDenied {
            vendor_id: summary.vendor_id,
            product_id: summary.product_id,
        },
        rusb::Error::NoDevice | rusb::Error::NotFound => Error::DeviceNotFound {
            vendor_id: summary.vendor_id,
            product_id: summary.product_id,
        },
        rusb::Error::NotSupported => Error::BackendUnavailable(err.to_string()),
        other => Error::DeviceSetup(format!("Failed to open device: {}", other)),
    }
}

/// Opened device with one claimed interface
pub struct RusbDevice {
    handle: Option<DeviceHandle<Context>>,
    interface: u8,
    /// Whether the interface is claimed and must be released
    claimed: bool,
    /// Whether we detached a kernel driver and must reattach it
    detached: bool,
}

impl RusbDevice {
    fn handle(&self) -> rusb::Result<&DeviceHandle<Context>> {
        self.handle.as_ref().ok_or(rusb::Error::NoDevice)
    }

    /// Reset, detach, configure and claim, recording what must be undone
    fn prepare(
        &mut self,
        device: &Device<Context>,
        options: &SetupOptions,
        summary: &DeviceSummary,
    ) -> common::Result<()> {
        let interface = self.interface;
        let handle = self
            .handle
            .as_mut()
            .ok_or_else(|| Error::DeviceSetup("Device handle already released".to_string()))?;

        if options.reset {
            match handle.reset() {
                Ok(()) => debug!("Device reset"),
                Err(e) => warn!("Device reset failed: {}", e),
            }
        }

        if options.detach_kernel_driver {
            match handle.kernel_driver_active(interface) {
                Ok(true) => {
                    handle.detach_kernel_driver(interface).map_err(|e| {
                        Error::DeviceSetup(format!(
                            "Failed to detach kernel driver from interface {}: {}",
                            interface, e
                        ))
                    })?;
                    debug!("Kernel driver detached from interface {}", interface);
                    self.detached = true;
                }
                Ok(false) => {
                    debug!("No kernel driver active on interface {}", interface);
                }
                Err(e) => {
                    // NotSupported on platforms without kernel drivers to detach
                    debug!(
                        "Could not check kernel driver status for interface {}: {}",
                        interface, e
                    );
                }
            }
        }

        if options.set_configuration {
            let config = device.config_descriptor(0).map_err(|e| {
                Error::DeviceSetup(format!("Failed to read configuration descriptor: {}", e))
            })?;
            match handle.set_active_configuration(config.number()) {
                Ok(()) => debug!("Configuration {} set", config.number()),
                // Busy when another interface of the device is already in use
                Err(e) => warn!("Configuration warning: {}", e),
            }
        }

        handle
            .claim_interface(interface)
            .map_err(|e| match e {
                rusb::Error::Access => Error::PermissionDenied {
                    vendor_id: summary.vendor_id,
                    product_id: summary.product_id,
                },
                other => Error::DeviceSetup(format!(
                    "Failed to claim interface {}: {}",
                    interface, other
                )),
            })?;
        self.claimed = true;
        debug!("Claimed interface {} on device {}", interface, summary);

        Ok(())
    }
}

/// The two calls needed to hand an interface back to the system
trait InterfaceRelease {
    fn release_interface(&mut self, interface: u8) -> rusb::Result<()>;
    fn attach_kernel_driver(&mut self, interface: u8) -> rusb::Result<()>;
}

impl InterfaceRelease for DeviceHandle<Context> {
    fn release_interface(&mut self, interface: u8) -> rusb::Result<()> {
        DeviceHandle::release_interface(self, interface)
    }

    fn attach_kernel_driver(&mut self, interface: u8) -> rusb::Result<()> {
        DeviceHandle::attach_kernel_driver(self, interface)
    }
}

/// Undo whatever setup steps succeeded: release a claimed interface, then
/// reattach a detached kernel driver
fn restore_interface(
    handle: &mut impl InterfaceRelease,
    interface: u8,
    claimed: bool,
    detached: bool,
) {
    if claimed {
        if let Err(e) = handle.release_interface(interface) {
            warn!("Failed to release interface {}: {}", interface, e);
        }
    }

    if detached {
        match handle.attach_kernel_driver(interface) {
            Ok(()) => debug!("Reattached kernel driver to interface {}", interface),
            Err(e) => debug!(
                "Could not reattach kernel driver to interface {}: {}",
                interface, e
            ),
        }
    }
}

impl TrafficDevice for RusbDevice {
    fn write(&mut self, request: &TransferRequest, data: &[u8]) -> rusb::Result<usize> {
        let handle = self.handle()?;
        match request.kind {
            TransferKind::Bulk => handle.write_bulk(request.endpoint, data, request.timeout),
            TransferKind::Interrupt => {
                handle.write_interrupt(request.endpoint, data, request.timeout)
            }
            TransferKind::Control => {
                let setup = &request.control;
                handle.write_control(
                    setup.request_type,
                    setup.request,
                    setup.value,
                    setup.index,
                    data,
                    request.timeout,
                )
            }
        }
    }

    fn read(&mut self, request: &TransferRequest, buf: &mut [u8]) -> rusb::Result<usize> {
        let handle = self.handle()?;
        match request.kind {
            TransferKind::Bulk => handle.read_bulk(request.endpoint, buf, request.timeout),
            TransferKind::Interrupt => handle.read_interrupt(request.endpoint, buf, request.timeout),
            TransferKind::Control => {
                let setup = &request.control;
                handle.read_control(
                    setup.request_type,
                    setup.request,
                    setup.value,
                    setup.index,
                    buf,
                    request.timeout,
                )
            }
        }
    }

    fn release(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            restore_interface(&mut handle, self.interface, self.claimed, self.detached);
            self.claimed = false;
            self.detached = false;
            debug!("Disposed USB resources");
        }
    }
}

impl Drop for RusbDevice {
    fn drop(&mut self) {
        self.release();
    }
}
