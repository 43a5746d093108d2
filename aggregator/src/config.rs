use crate::errors::{Error, Result};
use crate::store::{
    StoreConfig, DEFAULT_ALERT_CAPACITY, DEFAULT_BROADCAST_CAPACITY, DEFAULT_HISTORY_CAPACITY,
    DEFAULT_LIVENESS_WINDOW_SECS,
};
use chrono::TimeDelta;
use clap::Parser;

pub const DEFAULT_SECRET: &str = "default-secret-change-me";

const MAX_CAPACITY: usize = 1_000_000;
const MAX_LIVENESS_WINDOW_SECS: i64 = 7 * 24 * 3600;

#[derive(Debug, Clone, Parser)]
#[command(name = "aggregator", about = "Aggregates vital-sign telemetry relayed by gateways")]
pub struct Config {
    /// Address the HTTP server binds to
    #[arg(long, env = "HTTP_ADDR", default_value = "0.0.0.0:8000")]
    pub http_addr: String,

    /// Shared secret every gateway must present
    #[arg(long, env = "GATEWAY_SECRET_KEY", default_value = DEFAULT_SECRET, hide_env_values = true)]
    pub gateway_secret: String,

    #[arg(long, env = "HISTORY_CAPACITY", default_value_t = DEFAULT_HISTORY_CAPACITY)]
    pub history_capacity: usize,

    #[arg(long, env = "ALERT_CAPACITY", default_value_t = DEFAULT_ALERT_CAPACITY)]
    pub alert_capacity: usize,

    /// Seconds since last contact before a gateway stops counting as connected
    #[arg(long, env = "LIVENESS_WINDOW_SECS", default_value_t = DEFAULT_LIVENESS_WINDOW_SECS)]
    pub liveness_window_secs: i64,

    #[arg(long, env = "BROADCAST_CAPACITY", default_value_t = DEFAULT_BROADCAST_CAPACITY)]
    pub broadcast_capacity: usize,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.gateway_secret.is_empty() {
            return Err(Error::Config("gateway secret cannot be empty".to_string()));
        }
        if self.liveness_window_secs <= 0 || self.liveness_window_secs > MAX_LIVENESS_WINDOW_SECS {
            return Err(Error::Config(format!(
                "liveness window must be between 1 and {} seconds, got {}",
                MAX_LIVENESS_WINDOW_SECS, self.liveness_window_secs
            )));
        }
        for (name, value) in [
            ("history capacity", self.history_capacity),
            ("alert capacity", self.alert_capacity),
            ("broadcast capacity", self.broadcast_capacity),
        ] {
            if value == 0 || value > MAX_CAPACITY {
                return Err(Error::Config(format!(
                    "{} must be between 1 and {}, got {}",
                    name, MAX_CAPACITY, value
                )));
            }
        }
        Ok(())
    }

    pub fn uses_default_secret(&self) -> bool {
        self.gateway_secret == DEFAULT_SECRET
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            history_capacity: self.history_capacity,
            alert_capacity: self.alert_capacity,
            liveness_window: TimeDelta::seconds(self.liveness_window_secs),
            broadcast_capacity: self.broadcast_capacity,
        }
    }
}
