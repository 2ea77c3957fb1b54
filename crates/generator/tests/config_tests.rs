//! Integration tests for configuration parsing
//!
//! Tests loading from disk, saving, and the values that reach the traffic
//! loop through the transfer plan.

use common::test_utils::bulk_endpoints;
use common::{Direction, TransferKind};
use generator::config::TrafficConfig;
use generator::usb::{Payload, TransferPlan};
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

const FULL_CONFIG: &str = r#"
[general]
log_level = "debug"
log_file = "/tmp/usb-traffic-test.log"

[device]
vendor_id = "0x04f9"
product_id = "0x0042"
interface = 1
reset_on_open = true
detach_kernel_driver = false
set_configuration = false

[transfer]
kind = "interrupt"
direction = "in"
endpoint = 0x83
length = 512
timeout_ms = 250
payload = "counter"
read_back = false
interval_ms = 10
error_backoff_ms = 100

[ui]
tick_rate_ms = 250
scrollback = 5000
log_channel_capacity = 64
"#;

#[test]
fn test_load_full_config() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");
    fs::write(&path, FULL_CONFIG).unwrap();

    let config = TrafficConfig::load(Some(path)).unwrap();

    assert_eq!(config.general.log_level, "debug");
    assert_eq!(
        config.general.log_file_path(),
        std::path::PathBuf::from("/tmp/usb-traffic-test.log")
    );

    assert_eq!(config.device.vendor_id, 0x04f9);
    assert_eq!(config.device.product_id, 0x0042);
    let setup = config.device.setup_options();
    assert_eq!(setup.interface, 1);
    assert!(setup.reset);
    assert!(!setup.detach_kernel_driver);
    assert!(!setup.set_configuration);

    assert_eq!(config.transfer.kind, TransferKind::Interrupt);
    assert_eq!(config.transfer.direction, Direction::In);
    assert_eq!(config.transfer.endpoint, Some(0x83));
    assert_eq!(config.transfer.length, 512);
    assert_eq!(config.transfer.timeout(), Duration::from_millis(250));
    assert_eq!(config.transfer.payload, Payload::Counter);
    assert_eq!(config.transfer.interval(), Duration::from_millis(10));
    assert_eq!(config.transfer.error_backoff(), Duration::from_millis(100));

    assert_eq!(config.ui.tick_rate(), Duration::from_millis(250));
    assert_eq!(config.ui.scrollback, 5000);
    assert_eq!(config.ui.log_channel_capacity, 64);
}

#[test]
fn test_partial_config_keeps_defaults() {
    let config = TrafficConfig::from_toml(
        r#"
[device]
vendor_id = "1234"
"#,
    )
    .unwrap();

    assert_eq!(config.device.vendor_id, 0x1234);
    assert_eq!(config.device.product_id, 0x0013);
    assert_eq!(config.transfer.kind, TransferKind::Bulk);
    assert_eq!(config.transfer.length, 64);
    assert!(config.transfer.read_back);
    assert_eq!(config.ui.scrollback, 1000);
}

#[test]
fn test_save_and_reload() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("config.toml");

    let mut config = TrafficConfig::default();
    config.device.vendor_id = 0xabcd;
    config.transfer.length = 128;
    config.transfer.kind = TransferKind::Control;
    config.transfer.control.request_type = 0x40;
    config.transfer.control.request = 0x09;
    config.save(&path).unwrap();

    let content = fs::read_to_string(&path).unwrap();
    assert!(content.contains("vendor_id = \"0xabcd\""));

    let reloaded = TrafficConfig::load(Some(path)).unwrap();
    assert_eq!(reloaded.device.vendor_id, 0xabcd);
    assert_eq!(reloaded.transfer.length, 128);
    assert_eq!(reloaded.transfer.kind, TransferKind::Control);
    assert_eq!(reloaded.transfer.control.request, 0x09);
}

#[test]
fn test_load_missing_file() {
    let dir = TempDir::new().unwrap();
    let result = TrafficConfig::load(Some(dir.path().join("absent.toml")));
    assert!(result.is_err());
}

#[test]
fn test_load_invalid_documents() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");

    let invalid = [
        "[device\nvendor_id = 1",
        "[device]\nvendor_id = \"0xzzzz\"",
        "[device]\nproduct_id = \"0x123456\"",
        "[transfer]\nkind = \"isochronous\"",
        "[transfer]\nlength = 0",
        "[transfer]\ntimeout_ms = 0",
        "[transfer]\nkind = \"control\"\nendpoint = 1",
        "[ui]\nscrollback = 0",
        "[general]\nlog_level = \"loud\"",
    ];

    for document in invalid {
        fs::write(&path, document).unwrap();
        assert!(
            TrafficConfig::load(Some(path.clone())).is_err(),
            "accepted: {document}"
        );
    }
}

#[test]
fn test_config_drives_transfer_plan() {
    let config = TrafficConfig::from_toml(
        r#"
[transfer]
direction = "in"
length = 32
timeout_ms = 20
"#,
    )
    .unwrap();

    let plan = TransferPlan::resolve(&config.transfer, &bulk_endpoints(), 0).unwrap();
    assert_eq!(plan.request.endpoint, 0x81);
    assert_eq!(plan.request.timeout, Duration::from_millis(20));
    assert_eq!(plan.length, 32);
    assert!(plan.read_back.is_none());
}
