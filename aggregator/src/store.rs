use crate::alerts::{derive_alert, Alert};
use crate::metrics::{ALERTS_TOTAL, INGEST_LATENCY_SECONDS, SAMPLES_TOTAL};
use crate::model::{GatewayInfo, GatewayRecord};
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use telemetry::{HistoryBuffer, Sample, Snapshot};
use tokio::sync::broadcast;
use tracing::{debug, info};

pub const DEFAULT_HISTORY_CAPACITY: usize = 100;
pub const DEFAULT_ALERT_CAPACITY: usize = 50;
pub const DEFAULT_LIVENESS_WINDOW_SECS: i64 = 120;
pub const DEFAULT_BROADCAST_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub history_capacity: usize,
    pub alert_capacity: usize,
    pub liveness_window: TimeDelta,
    pub broadcast_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            alert_capacity: DEFAULT_ALERT_CAPACITY,
            liveness_window: TimeDelta::seconds(DEFAULT_LIVENESS_WINDOW_SECS),
            broadcast_capacity: DEFAULT_BROADCAST_CAPACITY,
        }
    }
}

/// Events fanned out to live subscribers
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Snapshot(Snapshot),
    Alert(Alert),
}

#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub snapshot: Snapshot,
    pub alert: Option<Alert>,
}

struct StoreState {
    current: Sample,
    current_at: DateTime<Utc>,
    history: HistoryBuffer,
    alerts: VecDeque<Alert>,
    gateways: HashMap<String, GatewayRecord>,
}

impl StoreState {
    fn snapshot(&self) -> Snapshot {
        Snapshot::new(&self.current, self.current_at, &self.history)
    }
}

/// Authoritative in-memory state: current reading, rolling history, gateway
/// registry and recent alerts.
///
/// All mutations go through one mutex. Events are broadcast while it is
/// still held, so subscribers see snapshots in the order they were applied.
pub struct TelemetryStore {
    config: StoreConfig,
    state: Mutex<StoreState>,
    events: broadcast::Sender<StreamEvent>,
}

impl TelemetryStore {
    pub fn new(config: StoreConfig) -> Self {
        let (events, _) = broadcast::channel(config.broadcast_capacity.max(1));
        let state = StoreState {
            current: Sample::default(),
            current_at: Utc::now(),
            history: HistoryBuffer::new(config.history_capacity),
            alerts: VecDeque::with_capacity(config.alert_capacity.min(DEFAULT_ALERT_CAPACITY)),
            gateways: HashMap::new(),
        };

        Self {
            config,
            state: Mutex::new(state),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        // Every critical section is infallible, so a poisoned lock still
        // guards consistent data.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn ingest(&self, sample: Sample) -> IngestOutcome {
        self.ingest_at(sample, Utc::now())
    }

    /// Applies one sample: snapshot, history row and alert log are updated
    /// together under the lock, then the snapshot and any alert are broadcast
    /// before it is released.
    pub fn ingest_at(&self, sample: Sample, now: DateTime<Utc>) -> IngestOutcome {
        let start = Instant::now();
        let alert = derive_alert(&sample, now);
        let timestamp = sample.timestamp.unwrap_or(now);
        let label = timestamp.format("%H:%M:%S").to_string();

        let snapshot = {
            let mut state = self.lock();
            state.history.push(sample.heart_rate, sample.spo2, sample.temperature, label);
            if let Some(alert) = &alert {
                if state.alerts.len() >= self.config.alert_capacity.max(1) {
                    state.alerts.pop_front();
                }
                state.alerts.push_back(alert.clone());
            }
            state.current = sample;
            state.current_at = timestamp;
            let snapshot = state.snapshot();

            // send never blocks; an error only means nobody is subscribed.
            let receivers = self
                .events
                .send(StreamEvent::Snapshot(snapshot.clone()))
                .unwrap_or(0);
            debug!("Broadcast snapshot to {} subscribers", receivers);
            if let Some(alert) = &alert {
                let _ = self.events.send(StreamEvent::Alert(alert.clone()));
            }
            snapshot
        };

        SAMPLES_TOTAL.inc();
        INGEST_LATENCY_SECONDS.observe(start.elapsed().as_secs_f64());
        if let Some(alert) = &alert {
            ALERTS_TOTAL.inc();
            info!("Alert raised: {}", alert.message);
        }

        IngestOutcome { snapshot, alert }
    }

    pub fn snapshot(&self) -> Snapshot {
        self.lock().snapshot()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.lock().alerts.iter().cloned().collect()
    }

    pub fn register_gateway(&self, gateway_id: &str, info: GatewayInfo, now: DateTime<Utc>) {
        let mut state = self.lock();
        state.gateways.insert(
            gateway_id.to_string(),
            GatewayRecord {
                gateway_id: gateway_id.to_string(),
                info,
                last_seen: now,
            },
        );
        info!("Gateway registered: {}", gateway_id);
    }

    /// Refreshes a gateway's last-seen time. Unknown gateways get an entry
    /// with empty metadata until they register.
    pub fn heartbeat(&self, gateway_id: &str, now: DateTime<Utc>) {
        let mut state = self.lock();
        state
            .gateways
            .entry(gateway_id.to_string())
            .and_modify(|record| record.last_seen = now)
            .or_insert_with(|| GatewayRecord {
                gateway_id: gateway_id.to_string(),
                info: GatewayInfo::default(),
                last_seen: now,
            });
    }

    pub fn gateway(&self, gateway_id: &str) -> Option<GatewayRecord> {
        self.lock().gateways.get(gateway_id).cloned()
    }

    pub fn gateway_count(&self) -> usize {
        self.lock().gateways.len()
    }

    /// Gateways seen within the liveness window. Stale entries stay in the
    /// registry; they just stop counting.
    pub fn connected_gateways(&self, now: DateTime<Utc>) -> usize {
        let window = self.config.liveness_window;
        self.lock()
            .gateways
            .values()
            .filter(|record| now - record.last_seen < window)
            .count()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.events.subscribe()
    }
}
