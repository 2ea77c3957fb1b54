//! Device locator
//!
//! Enumerates attached devices, picks the first one carrying the wanted
//! VID/PID and opens it through the backend.

use common::{DeviceDescriptor, DeviceSummary, Error, LogSink, OpenDevice, SetupOptions, UsbBackend};
use tracing::debug;

/// Enumerate attached devices
pub fn list_devices(backend: &dyn UsbBackend) -> common::Result<Vec<DeviceSummary>> {
    let devices = backend.devices()?;
    debug!("Enumerated {} devices", devices.len());
    Ok(devices)
}

/// Find and open the device matching `descriptor`
///
/// Every enumerated device is logged at debug level. When several devices
/// match, the first one in enumeration order wins.
pub fn find(
    backend: &dyn UsbBackend,
    descriptor: &DeviceDescriptor,
    options: &SetupOptions,
    sink: &LogSink,
) -> common::Result<OpenDevice> {
    let devices = list_devices(backend)?;

    let mut found = None;
    for device in &devices {
        sink.debug(format!("Found {}", device));
        if found.is_none() && descriptor.matches(device) {
            found = Some(*device);
        }
    }

    let device = found.ok_or(Error::DeviceNotFound {
        vendor_id: descriptor.vendor_id,
        product_id: descriptor.product_id,
    })?;

    let matching = devices.iter().filter(|d| descriptor.matches(d)).count();
    if matching > 1 {
        sink.warn(format!(
            "{} devices match {}, using {}",
            matching, descriptor, device
        ));
    }

    let opened = backend.open(&device, options)?;
    sink.info(format!(
        "Opened {} (interface {}, {} endpoints)",
        opened.summary,
        options.interface,
        opened.endpoints.len()
    ));
    Ok(opened)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{MockBackend, OpenFailure};
    use common::{LogLevel, create_log_channel};

    #[test]
    fn test_find_first_match() {
        let backend = MockBackend::new()
            .with_device(0x046d, 0xc077)
            .with_device(0x1fae, 0x0013)
            .with_device(0x1fae, 0x0013);
        let (sink, feed) = create_log_channel(64);

        let opened = find(
            &backend,
            &DeviceDescriptor::default(),
            &SetupOptions::default(),
            &sink,
        )
        .unwrap();
        assert_eq!(opened.summary.address, 2);

        let entries = feed.drain();
        let found = entries
            .iter()
            .filter(|e| e.level == LogLevel::Debug && e.message.starts_with("Found"))
            .count();
        assert_eq!(found, 3);
        assert!(entries.iter().any(|e| e.level == LogLevel::Warn));
    }

    #[test]
    fn test_find_not_found() {
        let backend = MockBackend::new().with_device(0x046d, 0xc077);
        let (sink, _feed) = create_log_channel(64);

        let err = find(
            &backend,
            &DeviceDescriptor::default(),
            &SetupOptions::default(),
            &sink,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            Error::DeviceNotFound {
                vendor_id: 0x1fae,
                product_id: 0x0013
            }
        ));
        assert_eq!(backend.open_counter().load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[test]
    fn test_find_propagates_open_failure() {
        let backend = MockBackend::new()
            .with_device(0x1fae, 0x0013)
            .failing_open(OpenFailure::PermissionDenied);
        let (sink, _feed) = create_log_channel(64);

        let err = find(
            &backend,
            &DeviceDescriptor::default(),
            &SetupOptions::default(),
            &sink,
        )
        .unwrap_err();
        assert!(matches!(err, Error::PermissionDenied { .. }));
    }

    #[test]
    fn test_list_devices_backend_unavailable() {
        let backend = MockBackend::new().failing_enumeration();
        assert!(matches!(
            list_devices(&backend),
            Err(Error::BackendUnavailable(_))
        ));
    }
}
