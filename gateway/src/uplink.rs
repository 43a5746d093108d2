//! HTTP client side of the gateway-to-aggregator protocol.

use crate::errors::UplinkError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder};
use serde::Serialize;
use std::time::Duration;
use telemetry::Sample;
use tracing::debug;

pub const SECRET_HEADER: &str = "X-Gateway-Secret";

const DELIVER_TIMEOUT: Duration = Duration::from_secs(5);
const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(5);

/// Metadata sent when the gateway announces itself.
#[derive(Debug, Clone, Serialize)]
pub struct Registration {
    pub gateway_id: String,
    pub transport_type: String,
    pub device_name: String,
    pub registered_at: DateTime<Utc>,
}

#[async_trait]
pub trait Uplink: Send + Sync {
    async fn register(&self, registration: &Registration) -> Result<(), UplinkError>;

    async fn heartbeat(&self, gateway_id: &str) -> Result<(), UplinkError>;

    async fn deliver(&self, sample: &Sample) -> Result<(), UplinkError>;
}

pub struct HttpUplink {
    client: Client,
    base_url: String,
    secret: String,
}

impl HttpUplink {
    pub fn new(base_url: &str, secret: &str) -> crate::errors::Result<Self> {
        let client = Client::builder()
            .connect_timeout(DELIVER_TIMEOUT)
            .build()
            .map_err(UplinkError::from)?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            secret: secret.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, request: RequestBuilder, timeout: Duration) -> Result<(), UplinkError> {
        let response = request
            .header(SECRET_HEADER, &self.secret)
            .timeout(timeout)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            debug!("Aggregator answered {}", status);
            Err(UplinkError::Status(status.as_u16()))
        }
    }
}

#[async_trait]
impl Uplink for HttpUplink {
    async fn register(&self, registration: &Registration) -> Result<(), UplinkError> {
        let request = self
            .client
            .post(self.url("/api/gateway/register"))
            .json(registration);
        self.send(request, REGISTER_TIMEOUT).await
    }

    async fn heartbeat(&self, gateway_id: &str) -> Result<(), UplinkError> {
        let request = self
            .client
            .get(self.url("/api/gateway/ping"))
            .query(&[("gateway_id", gateway_id)]);
        self.send(request, HEARTBEAT_TIMEOUT).await
    }

    async fn deliver(&self, sample: &Sample) -> Result<(), UplinkError> {
        let request = self.client.post(self.url("/api/gateway/data")).json(sample);
        self.send(request, DELIVER_TIMEOUT).await
    }
}
