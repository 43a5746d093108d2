use crate::alerts::Alert;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use telemetry::Snapshot;

/// Descriptive metadata a gateway sends when it registers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewayInfo {
    pub transport_type: Option<String>,
    pub device_name: Option<String>,
    pub registered_at: Option<DateTime<Utc>>,
}

/// Registry entry for one gateway
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GatewayRecord {
    pub gateway_id: String,
    pub info: GatewayInfo,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RegisterRequest {
    pub gateway_id: Option<String>,
    #[serde(alias = "bluetooth_type")]
    pub transport_type: Option<String>,
    pub device_name: Option<String>,
    pub registered_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct PingQuery {
    pub gateway_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub success: bool,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Acknowledgement for heartbeats and ingested samples
#[derive(Debug, Serialize, Deserialize)]
pub struct AckResponse {
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub success: bool,
    pub connected: bool,
    pub gateways_connected: usize,
    pub snapshot: Snapshot,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AlertsResponse {
    pub success: bool,
    pub alerts: Vec<Alert>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub gateways: usize,
}
