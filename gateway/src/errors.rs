use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Uplink error: {0}")]
    Uplink(#[from] UplinkError),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failures on the device link.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "ble")]
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("link closed")]
    Closed,

    #[error("link worker failed: {0}")]
    Worker(String),

    /// Misconfiguration with no safe default. The handler gives up instead
    /// of retrying.
    #[cfg_attr(not(feature = "ble"), allow(dead_code))]
    #[error("invalid link configuration: {0}")]
    Config(String),
}

impl TransportError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::Config(_))
    }
}

impl From<tokio::task::JoinError> for TransportError {
    fn from(err: tokio::task::JoinError) -> Self {
        TransportError::Worker(err.to_string())
    }
}

/// Failures talking to the aggregator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UplinkError {
    #[error("aggregator unreachable: {0}")]
    Unreachable(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("aggregator responded with status {0}")]
    Status(u16),
}

impl UplinkError {
    /// True when the aggregator could not be reached at all, as opposed to
    /// answering with an error.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, UplinkError::Unreachable(_))
    }
}

impl From<reqwest::Error> for UplinkError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            UplinkError::Unreachable(err.to_string())
        } else {
            UplinkError::Request(err.to_string())
        }
    }
}
