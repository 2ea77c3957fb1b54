//! Common utilities for usb-traffic
//!
//! This crate provides the pieces shared by the generator binary and its
//! tests: the error type, logging setup, the log channel feeding the UI,
//! traffic statistics, and the USB abstractions the traffic loop runs
//! against.

pub mod channel;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod usb_types;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use channel::{LogEntry, LogFeed, LogLevel, LogSink, create_log_channel};
pub use error::{Error, Result};
pub use logging::{LogOutput, setup_logging};
pub use metrics::{StatsSnapshot, TrafficStats};
pub use usb_types::{
    ControlSetup, DeviceDescriptor, DeviceSummary, Direction, EndpointInfo, OpenDevice,
    SetupOptions, TrafficDevice, TransferKind, TransferRequest, UsbBackend,
};
