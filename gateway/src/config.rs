use crate::errors::{Error, Result};
use crate::parser::{InferencePolicy, DEFAULT_HISTORY_CAPACITY};
use crate::relay::{RelayConfig, DEFAULT_MAX_PENDING};
use crate::transport::DEFAULT_BAUD_RATE;
use clap::{Parser, ValueEnum};
use std::time::Duration;
use uuid::Uuid;

pub const DEFAULT_SECRET: &str = "default-secret-change-me";

const MAX_CAPACITY: usize = 1_000_000;
const MAX_INTERVAL_SECS: u64 = 24 * 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TransportKind {
    /// Bluetooth classic serial port profile, exposed as a serial device
    Spp,
    /// Bluetooth Low Energy notifications
    Ble,
    /// Generated readings, no hardware needed
    Simulated,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Spp => "SPP",
            TransportKind::Ble => "BLE",
            TransportKind::Simulated => "SIMULATED",
        }
    }
}

#[derive(Debug, Clone, Parser)]
#[command(name = "gateway", about = "Relays wearable vital signs to the aggregator")]
pub struct Config {
    /// Base URL of the aggregator
    #[arg(long, env = "CLOUD_SERVER_URL", default_value = "http://localhost:8000")]
    pub cloud_url: String,

    /// Shared secret presented on every aggregator call
    #[arg(long, env = "GATEWAY_SECRET_KEY", default_value = DEFAULT_SECRET, hide_env_values = true)]
    pub gateway_secret: String,

    #[arg(long, env = "GATEWAY_ID", default_value = "gateway-001")]
    pub gateway_id: String,

    #[arg(long, env = "BLUETOOTH_TYPE", value_enum, ignore_case = true, default_value = "spp")]
    pub transport: TransportKind,

    /// Serial device for the SPP link
    #[arg(long, env = "BLUETOOTH_PORT", default_value = "/dev/rfcomm0")]
    pub serial_port: String,

    #[arg(long, env = "BAUD_RATE", default_value_t = DEFAULT_BAUD_RATE)]
    pub baud_rate: u32,

    /// Advertised name (or a substring of it) of the BLE wearable
    #[arg(long, env = "BLE_DEVICE_NAME", default_value = "Filsync-ESP32")]
    pub ble_device_name: String,

    #[arg(long, env = "BLE_SERVICE_UUID")]
    pub ble_service_uuid: Option<Uuid>,

    /// Notify characteristic to subscribe to. When unset, the device's
    /// services are logged and the link gives up.
    #[arg(long, env = "BLE_CHAR_UUID")]
    pub ble_char_uuid: Option<Uuid>,

    #[arg(long, env = "BLE_SCAN_SECS", default_value_t = 10)]
    pub ble_scan_secs: u64,

    #[arg(long, env = "HISTORY_CAPACITY", default_value_t = DEFAULT_HISTORY_CAPACITY)]
    pub history_capacity: usize,

    /// Samples held while the aggregator is unreachable; the oldest are dropped beyond this
    #[arg(long, env = "MAX_PENDING", default_value_t = DEFAULT_MAX_PENDING)]
    pub max_pending: usize,

    #[arg(long, env = "LIVENESS_INTERVAL_SECS", default_value_t = 30)]
    pub liveness_interval_secs: u64,

    #[arg(long, env = "RECONNECT_BACKOFF_SECS", default_value_t = 5)]
    pub reconnect_backoff_secs: u64,

    #[arg(long, env = "SAMPLE_CHANNEL_CAPACITY", default_value_t = 256)]
    pub sample_channel_capacity: usize,

    #[arg(long, env = "INFERENCE_POLICY", value_enum, default_value_t = InferencePolicy::default())]
    pub inference_policy: InferencePolicy,

    #[arg(long, env = "SIMULATED_INTERVAL_MS", default_value_t = 1000)]
    pub simulated_interval_ms: u64,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.gateway_id.trim().is_empty() {
            return Err(Error::Config("gateway id cannot be empty".to_string()));
        }
        if !self.cloud_url.starts_with("http://") && !self.cloud_url.starts_with("https://") {
            return Err(Error::Config(format!(
                "cloud url must be http(s), got {}",
                self.cloud_url
            )));
        }
        for (name, value) in [
            ("history capacity", self.history_capacity),
            ("max pending", self.max_pending),
            ("sample channel capacity", self.sample_channel_capacity),
        ] {
            if value == 0 || value > MAX_CAPACITY {
                return Err(Error::Config(format!(
                    "{} must be between 1 and {}, got {}",
                    name, MAX_CAPACITY, value
                )));
            }
        }
        for (name, secs) in [
            ("liveness interval", self.liveness_interval_secs),
            ("reconnect backoff", self.reconnect_backoff_secs),
            ("BLE scan", self.ble_scan_secs),
            ("simulated interval", self.simulated_interval_ms / 1000),
        ] {
            if secs > MAX_INTERVAL_SECS {
                return Err(Error::Config(format!(
                    "{} must be at most {} seconds, got {}",
                    name, MAX_INTERVAL_SECS, secs
                )));
            }
        }
        if self.liveness_interval_secs == 0 {
            return Err(Error::Config("liveness interval must be positive".to_string()));
        }
        Ok(())
    }

    pub fn uses_default_secret(&self) -> bool {
        self.gateway_secret == DEFAULT_SECRET
    }

    /// Name reported to the aggregator for the attached device.
    pub fn device_name(&self) -> &str {
        match self.transport {
            TransportKind::Spp => &self.serial_port,
            TransportKind::Ble => &self.ble_device_name,
            TransportKind::Simulated => "simulator",
        }
    }

    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            gateway_id: self.gateway_id.clone(),
            transport_type: self.transport.as_str().to_string(),
            device_name: self.device_name().to_string(),
            max_pending: self.max_pending,
        }
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_secs(self.liveness_interval_secs)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_secs(self.reconnect_backoff_secs)
    }

    pub fn simulated_interval(&self) -> Duration {
        Duration::from_millis(self.simulated_interval_ms)
    }

    #[cfg_attr(not(feature = "ble"), allow(dead_code))]
    pub fn ble_scan_timeout(&self) -> Duration {
        Duration::from_secs(self.ble_scan_secs)
    }
}
