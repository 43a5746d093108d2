use crate::history::{HistoryBuffer, HistorySnapshot};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Physiological state reported by the device or inferred from heart rate.
///
/// Wire names match the tags the firmware emits on its `STATE:` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum VitalState {
    #[default]
    #[serde(rename = "SIN_DEDO")]
    NoContact,
    #[serde(rename = "RELAX")]
    Relaxed,
    #[serde(rename = "NORMAL")]
    Normal,
    #[serde(rename = "STRESS")]
    Stress,
}

impl VitalState {
    /// Derives a state from heart rate alone: 0 means the sensor has no
    /// contact, below 65 is relaxed, 65 to 80 inclusive is normal, above is stress.
    pub fn infer_from_heart_rate(heart_rate: u32) -> Self {
        match heart_rate {
            0 => VitalState::NoContact,
            1..=64 => VitalState::Relaxed,
            65..=80 => VitalState::Normal,
            _ => VitalState::Stress,
        }
    }

    pub fn as_tag(&self) -> &'static str {
        match self {
            VitalState::NoContact => "SIN_DEDO",
            VitalState::Relaxed => "RELAX",
            VitalState::Normal => "NORMAL",
            VitalState::Stress => "STRESS",
        }
    }
}

impl fmt::Display for VitalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_tag())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown vital state tag: {0}")]
pub struct ParseStateError(pub String);

impl FromStr for VitalState {
    type Err = ParseStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SIN_DEDO" => Ok(VitalState::NoContact),
            "RELAX" => Ok(VitalState::Relaxed),
            "NORMAL" => Ok(VitalState::Normal),
            "STRESS" => Ok(VitalState::Stress),
            other => Err(ParseStateError(other.to_string())),
        }
    }
}

/// One telemetry reading as it travels from gateway to aggregator.
///
/// Every field is optional on the wire: missing values fall back to zero,
/// `NoContact` or `None`. A missing `timestamp` is resolved by the receiver.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Sample {
    #[serde(rename = "fc")]
    pub heart_rate: u32,
    pub spo2: u32,
    #[serde(rename = "temp")]
    pub temperature: f64,
    pub state: VitalState,
    #[serde(rename = "ir", skip_serializing_if = "Option::is_none")]
    pub infrared: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub received_at: Option<DateTime<Utc>>,
}

/// Current reading plus its rolling history, as pushed to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub fc: u32,
    pub spo2: u32,
    pub temp: f64,
    pub state: VitalState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ir: Option<u32>,
    pub timestamp: DateTime<Utc>,
    pub buffers: HistorySnapshot,
}

impl Snapshot {
    pub fn new(sample: &Sample, timestamp: DateTime<Utc>, history: &HistoryBuffer) -> Self {
        Self {
            fc: sample.heart_rate,
            spo2: sample.spo2,
            temp: round2(sample.temperature),
            state: sample.state,
            ir: sample.infrared,
            timestamp,
            buffers: history.snapshot(),
        }
    }

    /// The reading without its history, ready to be relayed upstream.
    pub fn to_sample(&self) -> Sample {
        Sample {
            heart_rate: self.fc,
            spo2: self.spo2,
            temperature: self.temp,
            state: self.state,
            infrared: self.ir,
            timestamp: Some(self.timestamp),
            gateway_id: None,
            received_at: None,
        }
    }
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
