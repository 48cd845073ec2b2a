//! Configuration types and loading
//!
//! Target device ids, the write workaround and the defaults used by the
//! CLI effects. Stored as JSON in `$TURTLE_RUMBLE_HOME/config.json` or
//! `<config dir>/turtle-rumble/config.json`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};

use crate::backend::WriteQuirk;
use crate::effects::Motor;
use crate::session::{MICROSOFT_VENDOR_ID, TURTLE_BEACH_PRODUCT_ID, TURTLE_BEACH_VENDOR_ID};

/// Config directory environment variable
pub const CONFIG_DIR_ENV: &str = "TURTLE_RUMBLE_HOME";

/// Sub-directory under the platform config dir
pub const DEFAULT_CONFIG_DIR: &str = "turtle-rumble";

pub const CONFIG_FILE: &str = "config.json";

/// Root configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Controller to connect to
    #[serde(default)]
    pub device: DeviceTarget,

    /// Retry behavior for rejected writes
    #[serde(default)]
    pub write_quirk: WriteQuirk,

    /// Defaults for `pulse`
    #[serde(default)]
    pub pulse: PulseConfig,

    /// Default duration for `vibrate`, in seconds
    #[serde(default = "default_hold_seconds")]
    pub hold_seconds: f64,

    /// Vendors shown by `list`
    #[serde(default = "default_known_vendors")]
    pub known_vendors: Vec<u16>,
}

fn default_hold_seconds() -> f64 {
    1.0
}

fn default_known_vendors() -> Vec<u16> {
    vec![TURTLE_BEACH_VENDOR_ID, MICROSOFT_VENDOR_ID]
}

/// Vendor/product pair identifying a controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceTarget {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl Default for DeviceTarget {
    fn default() -> Self {
        Self {
            vendor_id: TURTLE_BEACH_VENDOR_ID,
            product_id: TURTLE_BEACH_PRODUCT_ID,
        }
    }
}

/// Pulse train defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PulseConfig {
    /// Intensity (0-100)
    #[serde(default = "default_pulse_intensity")]
    pub intensity: i32,

    /// Length of each pulse and of the gap after it
    #[serde(default = "default_pulse_duration")]
    pub duration_ms: u64,

    #[serde(default = "default_pulse_count")]
    pub count: u32,

    #[serde(default)]
    pub motor: Motor,
}

fn default_pulse_intensity() -> i32 {
    80
}

fn default_pulse_duration() -> u64 {
    200
}

fn default_pulse_count() -> u32 {
    1
}

impl Default for PulseConfig {
    fn default() -> Self {
        Self {
            intensity: default_pulse_intensity(),
            duration_ms: default_pulse_duration(),
            count: default_pulse_count(),
            motor: Motor::default(),
        }
    }
}

impl PulseConfig {
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: DeviceTarget::default(),
            write_quirk: WriteQuirk::default(),
            pulse: PulseConfig::default(),
            hold_seconds: default_hold_seconds(),
            known_vendors: default_known_vendors(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Load from a file or a directory containing `config.json`. Missing
    /// files give the defaults.
    pub fn load_dir<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if path.is_file() {
            return Self::load(path);
        }

        let main_config = path.join(CONFIG_FILE);
        if main_config.exists() {
            return Self::load(&main_config);
        }

        Ok(Config::default())
    }

    /// Save configuration to a JSON file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    pub fn hold_duration(&self) -> Result<Duration> {
        seconds_to_duration(self.hold_seconds)
            .map_err(anyhow::Error::msg)
            .context("Invalid hold_seconds in config")
    }
}

/// Convert seconds to a duration. Negative values become zero; infinite or
/// out-of-range values are rejected.
pub fn seconds_to_duration(seconds: f64) -> std::result::Result<Duration, String> {
    Duration::try_from_secs_f64(seconds.max(0.0))
        .map_err(|e| format!("invalid duration '{}' seconds: {}", seconds, e))
}

/// Parse a duration in seconds, as given on the command line
pub fn parse_seconds(s: &str) -> std::result::Result<Duration, String> {
    let seconds: f64 = s
        .trim()
        .parse()
        .map_err(|e| format!("invalid number '{}': {}", s, e))?;
    seconds_to_duration(seconds)
}

/// Directory holding the config file
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
        return PathBuf::from(dir);
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(DEFAULT_CONFIG_DIR)
}

/// Parse a USB id given as hex (`0x10F5`, `10f5h`) or decimal
pub fn parse_usb_id(s: &str) -> std::result::Result<u16, String> {
    let s = s.trim();
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u16::from_str_radix(hex, 16)
    } else if let Some(hex) = s.strip_suffix('h').or_else(|| s.strip_suffix('H')) {
        u16::from_str_radix(hex, 16)
    } else {
        s.parse::<u16>()
    };
    parsed.map_err(|e| format!("invalid USB id '{}': {}", s, e))
}
