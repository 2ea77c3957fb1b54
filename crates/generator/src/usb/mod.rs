//! USB subsystem
//!
//! - `backend`: libusb access through `rusb`
//! - `locator`: enumeration and VID/PID matching
//! - `transfers`: transfer planning, payloads and single-transfer execution
//! - `worker`: the traffic loop on its dedicated thread
//!
//! Transfers are blocking libusb calls, so the loop runs on a plain OS
//! thread and never touches the Tokio runtime.

pub mod backend;
pub mod locator;
pub mod transfers;
pub mod worker;

pub use backend::{RusbBackend, RusbDevice};
pub use locator::{find, list_devices};
pub use transfers::{Payload, PayloadGenerator, TransferPlan};
pub use worker::{TrafficWorker, spawn_traffic_worker};
