use super::DeviceLink;
use crate::errors::TransportError;
use async_trait::async_trait;
use btleplug::api::{
    Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, ValueNotification,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::{Stream, StreamExt};
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

const NOTIFICATION_TIMEOUT: Duration = Duration::from_secs(1);

type Notifications = Pin<Box<dyn Stream<Item = ValueNotification> + Send>>;

struct Session {
    // The adapter keeps the backend session alive for as long as the peripheral is in use.
    _adapter: Adapter,
    peripheral: Peripheral,
    characteristic: Characteristic,
    notifications: Notifications,
}

/// BLE link that subscribes to a notify characteristic on the wearable.
pub struct BleLink {
    device_name: String,
    service_uuid: Option<Uuid>,
    char_uuid: Option<Uuid>,
    scan_timeout: Duration,
    session: Option<Session>,
}

impl BleLink {
    pub fn new(
        device_name: &str,
        service_uuid: Option<Uuid>,
        char_uuid: Option<Uuid>,
        scan_timeout: Duration,
    ) -> Self {
        Self {
            device_name: device_name.to_string(),
            service_uuid,
            char_uuid,
            scan_timeout,
            session: None,
        }
    }

    async fn find_peripheral(&self, adapter: &Adapter) -> Result<Peripheral, TransportError> {
        info!("Scanning {:?} for '{}'", self.scan_timeout, self.device_name);
        adapter.start_scan(ScanFilter::default()).await?;
        tokio::time::sleep(self.scan_timeout).await;

        let peripherals = adapter.peripherals().await?;
        if let Err(e) = adapter.stop_scan().await {
            debug!("Failed to stop scan: {}", e);
        }

        for peripheral in peripherals {
            let name = peripheral
                .properties()
                .await?
                .and_then(|props| props.local_name);
            if let Some(name) = name {
                debug!("Found {} ({})", name, peripheral.address());
                if name.contains(&self.device_name) {
                    return Ok(peripheral);
                }
            }
        }

        Err(TransportError::DeviceNotFound(self.device_name.clone()))
    }

    fn select_characteristic(
        &self,
        peripheral: &Peripheral,
    ) -> Result<Characteristic, TransportError> {
        let Some(char_uuid) = self.char_uuid else {
            log_services(peripheral);
            return Err(TransportError::Config(
                "BLE characteristic uuid not set; services were logged above".to_string(),
            ));
        };

        peripheral
            .characteristics()
            .into_iter()
            .find(|c| {
                c.uuid == char_uuid && self.service_uuid.map_or(true, |s| c.service_uuid == s)
            })
            .ok_or_else(|| {
                log_services(peripheral);
                TransportError::Config(format!(
                    "characteristic {} not offered by '{}'",
                    char_uuid, self.device_name
                ))
            })
    }
}

/// Each notification carries one line, occasionally several.
fn payload_lines(payload: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(payload)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

fn log_services(peripheral: &Peripheral) {
    for service in peripheral.services() {
        info!("Service {}", service.uuid);
        for characteristic in &service.characteristics {
            info!(
                "  Characteristic {} {:?}",
                characteristic.uuid, characteristic.properties
            );
        }
    }
}

#[async_trait]
impl DeviceLink for BleLink {
    fn describe(&self) -> String {
        format!("BLE device '{}'", self.device_name)
    }

    async fn open(&mut self) -> Result<(), TransportError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::DeviceNotFound("bluetooth adapter".to_string()))?;

        let peripheral = self.find_peripheral(&adapter).await?;
        peripheral.connect().await?;
        peripheral.discover_services().await?;

        let characteristic = match self.select_characteristic(&peripheral) {
            Ok(c) => c,
            Err(e) => {
                let _ = peripheral.disconnect().await;
                return Err(e);
            }
        };

        peripheral.subscribe(&characteristic).await?;
        let notifications = peripheral.notifications().await?;
        info!("Subscribed to {}", characteristic.uuid);

        self.session = Some(Session {
            _adapter: adapter,
            peripheral,
            characteristic,
            notifications,
        });
        Ok(())
    }

    async fn next_lines(&mut self) -> Result<Vec<String>, TransportError> {
        let session = self.session.as_mut().ok_or(TransportError::Closed)?;
        loop {
            match tokio::time::timeout(NOTIFICATION_TIMEOUT, session.notifications.next()).await {
                Ok(Some(notification)) => {
                    if notification.uuid != session.characteristic.uuid {
                        continue;
                    }
                    let lines = payload_lines(&notification.value);
                    if !lines.is_empty() {
                        return Ok(lines);
                    }
                }
                Ok(None) => return Err(TransportError::Closed),
                Err(_) => {
                    if !session.peripheral.is_connected().await? {
                        return Err(TransportError::Closed);
                    }
                }
            }
        }
    }

    async fn close(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        if let Err(e) = session.peripheral.unsubscribe(&session.characteristic).await {
            debug!("Unsubscribe failed: {}", e);
        }
        if let Err(e) = session.peripheral.disconnect().await {
            warn!("Disconnect from '{}' failed: {}", self.device_name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_lines() {
        assert_eq!(payload_lines(b"FC:72 SpO2:97"), vec!["FC:72 SpO2:97"]);
        assert_eq!(payload_lines(b"FC:72\r\nTemp:36.5\n"), vec!["FC:72", "Temp:36.5"]);
        assert!(payload_lines(b"  \n").is_empty());
    }
}
