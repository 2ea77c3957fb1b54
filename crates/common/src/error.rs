//! Common error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// libusb could not be initialised or could not enumerate devices
    #[error("No USB backend available: {0}")]
    BackendUnavailable(String),

    #[error("Device {vendor_id:04x}:{product_id:04x} not found")]
    DeviceNotFound { vendor_id: u16, product_id: u16 },

    #[error("Permission denied opening device {vendor_id:04x}:{product_id:04x}")]
    PermissionDenied { vendor_id: u16, product_id: u16 },

    /// Opening, configuring or claiming the device failed
    #[error("Device setup failed: {0}")]
    DeviceSetup(String),

    #[error("No {kind} {direction} endpoint on interface {interface}")]
    NoEndpoint {
        kind: crate::TransferKind,
        direction: crate::Direction,
        interface: u8,
    },

    #[error("Transfer on endpoint {endpoint:#04x} timed out")]
    TransferTimeout { endpoint: u8 },

    #[error("Transfer on endpoint {endpoint:#04x} failed: {source}")]
    Transfer {
        endpoint: u8,
        #[source]
        source: rusb::Error,
    },

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

impl Error {
    /// Map a failed transfer to `TransferTimeout` or `Transfer`
    pub fn from_transfer(endpoint: u8, err: rusb::Error) -> Self {
        match err {
            rusb::Error::Timeout => Error::TransferTimeout { endpoint },
            source => Error::Transfer { endpoint, source },
        }
    }

    /// Whether the error only affects a single loop iteration
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::TransferTimeout { .. } | Error::Transfer { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
