//! Terminal User Interface
//!
//! Start/Stop controls, live statistics and a scrollback log pane.

pub mod app;
pub mod events;
pub mod ui;

pub use app::{App, run};
