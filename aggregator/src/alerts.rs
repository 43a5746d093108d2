use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use telemetry::{Sample, VitalState};

const LOW_SPO2_THRESHOLD: u32 = 90;
const HIGH_HEART_RATE_THRESHOLD: u32 = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertKind {
    #[serde(rename = "stress")]
    Stress,
    #[serde(rename = "low_spo2")]
    LowOxygen,
    #[serde(rename = "high_hr")]
    HighHeartRate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Danger,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    #[serde(rename = "type")]
    pub kind: AlertKind,
    pub message: String,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
}

/// Derives at most one alert from a sample.
///
/// Rules are checked in order and the first match wins: stress state, then
/// low SpO2 (a reading of 0 means no measurement), then high heart rate.
pub fn derive_alert(sample: &Sample, now: DateTime<Utc>) -> Option<Alert> {
    let (kind, severity, message) = if sample.state == VitalState::Stress {
        (
            AlertKind::Stress,
            Severity::Warning,
            format!("Stress detected - HR: {} bpm", sample.heart_rate),
        )
    } else if sample.spo2 > 0 && sample.spo2 < LOW_SPO2_THRESHOLD {
        (
            AlertKind::LowOxygen,
            Severity::Danger,
            format!("Low SpO2 - {}%", sample.spo2),
        )
    } else if sample.heart_rate > HIGH_HEART_RATE_THRESHOLD {
        (
            AlertKind::HighHeartRate,
            Severity::Warning,
            format!("High heart rate - {} bpm", sample.heart_rate),
        )
    } else {
        return None;
    };

    Some(Alert {
        kind,
        message,
        severity,
        timestamp: now,
    })
}
