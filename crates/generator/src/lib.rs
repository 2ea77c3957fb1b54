//! USB traffic generator
//!
//! Library side of the `usb-traffic` binary: configuration, the USB
//! subsystem, the Start/Stop controller and the terminal UI.

pub mod config;
pub mod controller;
pub mod tui;
pub mod usb;

pub use config::TrafficConfig;
pub use controller::{ControllerState, StartOutcome, StopOutcome, TrafficController};
