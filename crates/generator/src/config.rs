//! Traffic generator configuration management

use crate::usb::transfers::Payload;
use anyhow::{Context, Result, anyhow};
use common::{ControlSetup, DeviceDescriptor, Direction, SetupOptions, TransferKind};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Log file name inside the data directory
const LOG_FILE_NAME: &str = "usb_traffic.log";

/// Largest transfer the loop will issue in one iteration
pub const MAX_TRANSFER_LENGTH: usize = 1024 * 1024;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrafficConfig {
    #[serde(default)]
    pub general: GeneralSettings,
    #[serde(default)]
    pub device: DeviceSettings,
    #[serde(default)]
    pub transfer: TransferSettings,
    #[serde(default)]
    pub ui: UiSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralSettings {
    #[serde(default = "GeneralSettings::default_log_level")]
    pub log_level: String,
    /// Log file path; `~` is expanded. Defaults to the local data directory.
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            log_file: None,
        }
    }
}

impl GeneralSettings {
    fn default_log_level() -> String {
        "info".to_string()
    }

    /// Resolved log file path
    pub fn log_file_path(&self) -> PathBuf {
        match &self.log_file {
            Some(path) => PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).as_ref()),
            None => match dirs::data_local_dir() {
                Some(data_dir) => data_dir.join("usb-traffic").join(LOG_FILE_NAME),
                None => PathBuf::from(LOG_FILE_NAME),
            },
        }
    }
}

/// Which device to open and how to prepare it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSettings {
    #[serde(with = "hex_id", default = "DeviceSettings::default_vendor_id")]
    pub vendor_id: u16,
    #[serde(with = "hex_id", default = "DeviceSettings::default_product_id")]
    pub product_id: u16,
    #[serde(default)]
    pub interface: u8,
    #[serde(default)]
    pub reset_on_open: bool,
    #[serde(default = "default_true")]
    pub detach_kernel_driver: bool,
    #[serde(default = "default_true")]
    pub set_configuration: bool,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        let setup = SetupOptions::default();
        let descriptor = DeviceDescriptor::default();
        Self {
            vendor_id: descriptor.vendor_id,
            product_id: descriptor.product_id,
            interface: setup.interface,
            reset_on_open: setup.reset,
            detach_kernel_driver: setup.detach_kernel_driver,
            set_configuration: setup.set_configuration,
        }
    }
}

impl DeviceSettings {
    fn default_vendor_id() -> u16 {
        common::usb_types::DEFAULT_VENDOR_ID
    }

    fn default_product_id() -> u16 {
        common::usb_types::DEFAULT_PRODUCT_ID
    }

    pub fn descriptor(&self) -> DeviceDescriptor {
        DeviceDescriptor::new(self.vendor_id, self.product_id)
    }

    pub fn setup_options(&self) -> SetupOptions {
        SetupOptions {
            interface: self.interface,
            reset: self.reset_on_open,
            detach_kernel_driver: self.detach_kernel_driver,
            set_configuration: self.set_configuration,
        }
    }
}

/// What the loop sends on every iteration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSettings {
    #[serde(default)]
    pub kind: TransferKind,
    #[serde(default)]
    pub direction: Direction,
    /// Endpoint address; the first matching endpoint is used when unset
    #[serde(default)]
    pub endpoint: Option<u8>,
    #[serde(default = "TransferSettings::default_length")]
    pub length: usize,
    #[serde(default = "TransferSettings::default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub payload: Payload,
    /// Read from the paired IN endpoint after every OUT transfer
    #[serde(default = "default_true")]
    pub read_back: bool,
    /// Pause between iterations (0 = saturate the bus)
    #[serde(default)]
    pub interval_ms: u64,
    /// Pause after a failed iteration (0 = retry immediately)
    #[serde(default)]
    pub error_backoff_ms: u64,
    #[serde(default)]
    pub control: ControlSetup,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            kind: TransferKind::default(),
            direction: Direction::default(),
            endpoint: None,
            length: Self::default_length(),
            timeout_ms: Self::default_timeout_ms(),
            payload: Payload::default(),
            read_back: true,
            interval_ms: 0,
            error_backoff_ms: 0,
            control: ControlSetup::default(),
        }
    }
}

impl TransferSettings {
    fn default_length() -> usize {
        64
    }

    fn default_timeout_ms() -> u64 {
        1000
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UiSettings {
    /// Status refresh period
    #[serde(default = "UiSettings::default_tick_rate_ms")]
    pub tick_rate_ms: u64,
    /// Lines kept in the log pane
    #[serde(default = "UiSettings::default_scrollback")]
    pub scrollback: usize,
    /// Entries buffered between the worker and the log pane
    #[serde(default = "UiSettings::default_log_channel_capacity")]
    pub log_channel_capacity: usize,
}

impl Default for UiSettings {
    fn default() -> Self {
        Self {
            tick_rate_ms: Self::default_tick_rate_ms(),
            scrollback: Self::default_scrollback(),
            log_channel_capacity: Self::default_log_channel_capacity(),
        }
    }
}

impl UiSettings {
    fn default_tick_rate_ms() -> u64 {
        100
    }

    fn default_scrollback() -> usize {
        1000
    }

    fn default_log_channel_capacity() -> usize {
        common::channel::DEFAULT_LOG_CAPACITY
    }

    pub fn tick_rate(&self) -> Duration {
        Duration::from_millis(self.tick_rate_ms)
    }
}

fn default_true() -> bool {
    true
}

/// Serde adapter writing USB IDs as `"0x1fae"`
mod hex_id {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(id: &u16, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("0x{:04x}", id))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u16, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        common::usb_types::parse_hex_id(&s).map_err(serde::de::Error::custom)
    }
}

/// An explicit path always wins; otherwise the per-user file, if present
fn locate(explicit: Option<PathBuf>, user_default: PathBuf) -> Result<PathBuf> {
    match explicit {
        Some(p) => Ok(p),
        None if user_default.exists() => Ok(user_default),
        None => Err(anyhow!("No configuration file found, using defaults")),
    }
}

impl TrafficConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = locate(path, Self::default_path())?;

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Parse and validate a TOML document
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: TrafficConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usb-traffic").join("config.toml")
        } else {
            PathBuf::from(".config/usb-traffic/config.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.general.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.general.log_level,
                valid_levels.join(", ")
            ));
        }

        let transfer = &self.transfer;
        if transfer.length == 0 || transfer.length > MAX_TRANSFER_LENGTH {
            return Err(anyhow!(
                "Invalid transfer length {}, must be between 1 and {}",
                transfer.length,
                MAX_TRANSFER_LENGTH
            ));
        }
        if transfer.kind == TransferKind::Control && transfer.length > u16::MAX as usize {
            return Err(anyhow!(
                "Control transfer length {} exceeds wLength maximum {}",
                transfer.length,
                u16::MAX
            ));
        }
        if transfer.timeout_ms == 0 {
            return Err(anyhow!("Transfer timeout must be greater than 0"));
        }

        if let Some(endpoint) = transfer.endpoint {
            if transfer.kind == TransferKind::Control {
                return Err(anyhow!("Control transfers always use endpoint 0"));
            }
            if endpoint & 0x0f == 0 {
                return Err(anyhow!(
                    "Endpoint {:#04x} is the default control pipe",
                    endpoint
                ));
            }
            // A bare endpoint number takes its direction from `direction`
            if endpoint & 0x80 != 0 && Direction::of_address(endpoint) != transfer.direction {
                return Err(anyhow!(
                    "Endpoint {:#04x} is an IN endpoint but direction is {}",
                    endpoint,
                    transfer.direction
                ));
            }
        }

        if self.ui.tick_rate_ms == 0 {
            return Err(anyhow!("UI tick rate must be greater than 0"));
        }
        if self.ui.scrollback == 0 {
            return Err(anyhow!("Scrollback must hold at least one line"));
        }
        if self.ui.log_channel_capacity == 0 {
            return Err(anyhow!("Log channel capacity must be greater than 0"));
        }

        Ok(())
    }
}
