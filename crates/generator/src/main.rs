//! usb-traffic
//!
//! Opens a USB device by vendor/product ID and issues transfers against it
//! in a tight loop to generate sustained traffic on its port. Start and
//! Stop from the terminal UI, or run headless until Ctrl+C.

use anyhow::{Context, Result};
use clap::Parser;
use common::metrics::{format_bytes, format_rate};
use common::usb_types::parse_hex_id;
use common::{LogOutput, UsbBackend, create_log_channel, setup_logging};
use generator::config::TrafficConfig;
use generator::controller::{TrafficController, rusb_loader};
use generator::tui;
use generator::usb::{RusbBackend, list_devices};
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "usb-traffic")]
#[command(
    author,
    version,
    about = "USB traffic generator - saturate one USB port with transfers"
)]
#[command(long_about = "
Opens the USB device matching a vendor/product ID, claims an interface and
issues fixed-size transfers against it until stopped.

EXAMPLES:
    # Interactive terminal UI with the configured device
    usb-traffic

    # Drive another device
    usb-traffic --vid 0x04f9 --pid 0x0042

    # Run without the UI for 60 seconds, then print statistics
    usb-traffic --headless --duration 60

    # List attached USB devices
    usb-traffic --list-devices

CONFIGURATION:
    The configuration is looked up in the following order:
    1. Path specified with --config
    2. ~/.config/usb-traffic/config.toml
    3. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List USB devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Generate traffic without the TUI until Ctrl+C
    #[arg(long)]
    headless: bool,

    /// Stop a headless run after this many seconds
    #[arg(long, value_name = "SECS", requires = "headless")]
    duration: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Vendor ID of the target device (hex)
    #[arg(long, value_name = "HEX", value_parser = parse_id)]
    vid: Option<u16>,

    /// Product ID of the target device (hex)
    #[arg(long, value_name = "HEX", value_parser = parse_id)]
    pid: Option<u16>,
}

fn parse_id(s: &str) -> std::result::Result<u16, String> {
    parse_hex_id(s).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = TrafficConfig::default();
        let path = TrafficConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let mut config = if let Some(ref path) = args.config {
        TrafficConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        TrafficConfig::load_or_default()
    };

    if let Some(vid) = args.vid {
        config.device.vendor_id = vid;
    }
    if let Some(pid) = args.pid {
        config.device.product_id = pid;
    }
    if let Some(level) = &args.log_level {
        config.general.log_level = level.clone();
    }
    config.validate().context("Invalid configuration")?;

    let log_file = config.general.log_file_path();
    let output = if args.headless || args.list_devices {
        LogOutput::ConsoleAndFile(&log_file)
    } else {
        LogOutput::File(&log_file)
    };
    setup_logging(&config.general.log_level, output).context("Failed to setup logging")?;

    info!("usb-traffic v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", config.general.log_level);
    info!("Target device: {}", config.device.descriptor());

    if args.list_devices {
        return list_devices_mode(&config);
    }

    if args.headless {
        run_headless(config, args.duration.map(Duration::from_secs)).await
    } else {
        run_tui(config).await
    }
}

/// List USB devices and exit
fn list_devices_mode(config: &TrafficConfig) -> Result<()> {
    let backend = RusbBackend::new().context("Failed to initialise USB backend")?;
    let devices = list_devices(&backend as &dyn UsbBackend).context("Failed to enumerate devices")?;
    let target = config.device.descriptor();

    if devices.is_empty() {
        println!("No USB devices found.");
    } else {
        println!("Found {} USB device(s):\n", devices.len());
        for device in devices {
            let marker = if target.matches(&device) { "  <- target" } else { "" };
            println!("  {}{}", device, marker);
        }
    }

    Ok(())
}

/// Run without the TUI until Ctrl+C or the optional duration elapses
async fn run_headless(config: TrafficConfig, duration: Option<Duration>) -> Result<()> {
    // Entries still reach stderr and the log file through tracing
    let (sink, feed) = create_log_channel(config.ui.log_channel_capacity);
    drop(feed);

    let mut controller = TrafficController::new(&config, rusb_loader(), sink);
    controller.start().context("Failed to start traffic")?;

    info!("Generating traffic, press Ctrl+C to stop");

    let deadline = async {
        match duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        result = signal::ctrl_c() => {
            match result {
                Ok(()) => info!("Received Ctrl+C, stopping..."),
                Err(e) => error!("Error waiting for Ctrl+C: {}", e),
            }
        }
        _ = deadline => {
            info!("Duration elapsed, stopping...");
        }
    }

    tokio::task::block_in_place(|| controller.stop());

    let stats = controller.stats();
    println!();
    println!("Packets:   {}", stats.packets);
    println!("Sent:      {}", format_bytes(stats.bytes_sent));
    println!("Received:  {}", format_bytes(stats.bytes_received));
    println!("Total:     {}", format_bytes(stats.total_bytes()));
    println!("Errors:    {}", stats.errors);
    println!("Timeouts:  {}", stats.timeouts);
    println!("Failures:  {:.1}%", stats.failure_rate() * 100.0);
    println!("Latency:   {}", stats.latency.format_avg());
    println!("Rate:      {}", format_rate(stats.throughput_bps));
    if let Some(elapsed) = stats.elapsed {
        println!("Elapsed:   {}", tui::ui::format_duration(elapsed));
    }

    Ok(())
}

/// Run in TUI mode (interactive terminal UI)
async fn run_tui(config: TrafficConfig) -> Result<()> {
    let (sink, feed) = create_log_channel(config.ui.log_channel_capacity);
    sink.info(format!(
        "Ready. Target {}, press s to start",
        config.device.descriptor()
    ));

    let controller = TrafficController::new(&config, rusb_loader(), sink);
    tui::run(controller, feed, &config.ui).await
}
