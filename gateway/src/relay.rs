//! Local relay: buffers samples and delivers them to the aggregator,
//! re-announcing and flushing whenever connectivity comes back.

use crate::uplink::{Registration, Uplink};
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use telemetry::{Sample, Snapshot};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

pub const DEFAULT_MAX_PENDING: usize = 1000;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub gateway_id: String,
    pub transport_type: String,
    pub device_name: String,
    pub max_pending: usize,
}

#[derive(Debug, Clone)]
pub struct PendingItem {
    pub seq: u64,
    pub sample: Sample,
}

/// Bounded FIFO of undelivered samples. When full, the oldest item is
/// dropped and counted.
struct PendingQueue {
    items: VecDeque<PendingItem>,
    capacity: usize,
    next_seq: u64,
    dropped: u64,
}

impl PendingQueue {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity.min(DEFAULT_MAX_PENDING)),
            capacity,
            next_seq: 0,
            dropped: 0,
        }
    }

    fn push(&mut self, sample: Sample) -> PendingItem {
        if self.items.len() == self.capacity {
            self.items.pop_front();
            self.dropped += 1;
        }
        let item = PendingItem {
            seq: self.next_seq,
            sample,
        };
        self.next_seq += 1;
        self.items.push_back(item.clone());
        item
    }

    fn remove(&mut self, seq: u64) -> bool {
        match self.items.iter().position(|item| item.seq == seq) {
            Some(index) => self.items.remove(index).is_some(),
            None => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// The aggregator could not be reached. The item stays queued.
    ConnectionLost,
    /// The aggregator answered with an error. The item stays queued.
    Rejected,
}

pub struct Relay {
    config: RelayConfig,
    uplink: Arc<dyn Uplink>,
    queue: Mutex<PendingQueue>,
    connected: AtomicBool,
    consecutive_failures: AtomicU32,
}

impl Relay {
    pub fn new(config: RelayConfig, uplink: Arc<dyn Uplink>) -> Self {
        let queue = PendingQueue::new(config.max_pending);
        Self {
            config,
            uplink,
            queue: Mutex::new(queue),
            connected: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    // Held only around queue mutation, never across an await.
    fn queue(&self) -> MutexGuard<'_, PendingQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn pending(&self) -> usize {
        self.queue().items.len()
    }

    pub fn dropped(&self) -> u64 {
        self.queue().dropped
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    fn mark_connected(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        if !self.connected.swap(true, Ordering::SeqCst) {
            info!("Aggregator connection established");
        }
    }

    fn mark_disconnected(&self) {
        self.consecutive_failures.fetch_add(1, Ordering::SeqCst);
        if self.connected.swap(false, Ordering::SeqCst) {
            warn!("Aggregator connection lost, buffering samples");
        }
    }

    /// Stamps a snapshot with this gateway's identity, queues it, and tries
    /// to deliver it straight away when the aggregator is believed reachable.
    pub async fn accept(&self, snapshot: Snapshot) {
        let mut sample = snapshot.to_sample();
        sample.gateway_id = Some(self.config.gateway_id.clone());
        sample.received_at = Some(Utc::now());

        let item = {
            let mut queue = self.queue();
            let dropped = queue.dropped;
            let item = queue.push(sample);
            if queue.dropped > dropped {
                warn!(
                    "Pending queue full ({}), dropped oldest sample",
                    queue.capacity
                );
            }
            item
        };

        if self.is_connected() {
            self.deliver(&item).await;
        }
    }

    pub async fn deliver(&self, item: &PendingItem) -> DeliveryOutcome {
        match self.uplink.deliver(&item.sample).await {
            Ok(()) => {
                self.queue().remove(item.seq);
                self.mark_connected();
                debug!("Delivered sample #{}", item.seq);
                DeliveryOutcome::Delivered
            }
            Err(e) if e.is_connection_lost() => {
                warn!("Delivery of sample #{} failed: {}", item.seq, e);
                self.mark_disconnected();
                DeliveryOutcome::ConnectionLost
            }
            Err(e) => {
                warn!("Aggregator rejected sample #{}: {}", item.seq, e);
                DeliveryOutcome::Rejected
            }
        }
    }

    fn registration(&self) -> Registration {
        Registration {
            gateway_id: self.config.gateway_id.clone(),
            transport_type: self.config.transport_type.clone(),
            device_name: self.config.device_name.clone(),
            registered_at: Utc::now(),
        }
    }

    /// Registers with the aggregator and, on success, flushes the backlog.
    /// Returns false when the gateway stays offline.
    pub async fn announce(&self) -> bool {
        match self.uplink.register(&self.registration()).await {
            Ok(()) => {
                info!("Registered as {}", self.config.gateway_id);
                self.mark_connected();
                self.flush().await;
                true
            }
            Err(e) => {
                warn!("Registration failed, running offline: {}", e);
                self.mark_disconnected();
                false
            }
        }
    }

    /// One liveness cycle: re-announce when offline, heartbeat otherwise.
    pub async fn liveness_tick(&self) {
        if !self.is_connected() {
            self.announce().await;
            return;
        }

        match self.uplink.heartbeat(&self.config.gateway_id).await {
            Ok(()) => debug!("Heartbeat acknowledged"),
            Err(e) => {
                warn!("Heartbeat failed: {}", e);
                self.mark_disconnected();
            }
        }
    }

    /// Delivers everything queued at the time of the call, oldest first.
    /// Stops at the first connection-level failure; items queued meanwhile
    /// wait for the next cycle.
    pub async fn flush(&self) -> usize {
        let backlog: Vec<PendingItem> = self.queue().items.iter().cloned().collect();
        if backlog.is_empty() {
            return 0;
        }
        info!("Flushing {} pending samples", backlog.len());

        let mut delivered = 0;
        for item in &backlog {
            match self.deliver(item).await {
                DeliveryOutcome::Delivered => delivered += 1,
                DeliveryOutcome::Rejected => {}
                DeliveryOutcome::ConnectionLost => break,
            }
        }

        info!("Flushed {}/{} pending samples", delivered, backlog.len());
        delivered
    }

    pub fn log_status(&self) {
        info!(
            "Status: aggregator {} | pending {} | dropped {} | failures {}",
            if self.is_connected() {
                "connected"
            } else {
                "disconnected"
            },
            self.pending(),
            self.dropped(),
            self.consecutive_failures()
        );
    }
}

/// Feeds snapshots from the transport into the relay until the channel
/// closes or a stop is signalled.
pub async fn run_forwarder(
    relay: Arc<Relay>,
    mut snapshots: mpsc::Receiver<Snapshot>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            snapshot = snapshots.recv() => match snapshot {
                Some(snapshot) => relay.accept(snapshot).await,
                None => break,
            },
        }
    }
    debug!("Forwarder stopped");
}

/// Periodic liveness cycle. The first tick fires one interval after start,
/// since `announce` already ran at startup.
pub async fn run_liveness(relay: Arc<Relay>, period: Duration, mut stop: watch::Receiver<bool>) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = ticker.tick() => {
                relay.liveness_tick().await;
                relay.log_status();
            }
        }
    }
    debug!("Liveness worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::UplinkError;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use telemetry::HistoryBuffer;

    #[derive(Default)]
    struct FakeUplink {
        unreachable: AtomicBool,
        rejected: Mutex<Vec<u32>>,
        delivered: Mutex<Vec<u32>>,
        registrations: AtomicUsize,
        heartbeats: AtomicUsize,
    }

    impl FakeUplink {
        fn set_reachable(&self, reachable: bool) {
            self.unreachable.store(!reachable, Ordering::SeqCst);
        }

        fn check(&self) -> Result<(), UplinkError> {
            if self.unreachable.load(Ordering::SeqCst) {
                Err(UplinkError::Unreachable("connection refused".to_string()))
            } else {
                Ok(())
            }
        }

        fn delivered(&self) -> Vec<u32> {
            self.delivered.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Uplink for FakeUplink {
        async fn register(&self, registration: &Registration) -> Result<(), UplinkError> {
            assert_eq!(registration.gateway_id, "gw-test");
            self.registrations.fetch_add(1, Ordering::SeqCst);
            self.check()
        }

        async fn heartbeat(&self, _gateway_id: &str) -> Result<(), UplinkError> {
            self.heartbeats.fetch_add(1, Ordering::SeqCst);
            self.check()
        }

        async fn deliver(&self, sample: &Sample) -> Result<(), UplinkError> {
            self.check()?;
            assert_eq!(sample.gateway_id.as_deref(), Some("gw-test"));
            assert!(sample.received_at.is_some());
            if self.rejected.lock().unwrap().contains(&sample.heart_rate) {
                return Err(UplinkError::Status(400));
            }
            self.delivered.lock().unwrap().push(sample.heart_rate);
            Ok(())
        }
    }

    fn relay(max_pending: usize) -> (Arc<FakeUplink>, Relay) {
        let uplink = Arc::new(FakeUplink::default());
        let config = RelayConfig {
            gateway_id: "gw-test".to_string(),
            transport_type: "simulated".to_string(),
            device_name: "wearable".to_string(),
            max_pending,
        };
        (uplink.clone(), Relay::new(config, uplink))
    }

    fn snapshot(fc: u32) -> Snapshot {
        let sample = Sample {
            heart_rate: fc,
            ..Sample::default()
        };
        Snapshot::new(&sample, Utc::now(), &HistoryBuffer::new(1))
    }

    #[tokio::test]
    async fn test_failed_deliveries_flush_in_order_after_probe() {
        let (uplink, relay) = relay(DEFAULT_MAX_PENDING);
        assert!(relay.announce().await);

        uplink.set_reachable(false);
        for fc in [61, 62, 63] {
            relay.accept(snapshot(fc)).await;
        }
        assert!(!relay.is_connected());
        assert_eq!(relay.pending(), 3);
        assert!(uplink.delivered().is_empty());

        uplink.set_reachable(true);
        relay.liveness_tick().await;

        assert!(relay.is_connected());
        assert_eq!(uplink.delivered(), vec![61, 62, 63]);
        assert_eq!(relay.pending(), 0);
        assert_eq!(relay.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_queue_drops_oldest_when_full() {
        let (uplink, relay) = relay(3);
        uplink.set_reachable(false);

        for fc in 1..=5 {
            relay.accept(snapshot(fc)).await;
        }
        assert_eq!(relay.pending(), 3);
        assert_eq!(relay.dropped(), 2);

        uplink.set_reachable(true);
        assert!(relay.announce().await);
        assert_eq!(uplink.delivered(), vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn test_rejected_sample_stays_queued() {
        let (uplink, relay) = relay(DEFAULT_MAX_PENDING);
        uplink.rejected.lock().unwrap().push(62);
        assert!(relay.announce().await);

        for fc in [61, 62, 63] {
            relay.accept(snapshot(fc)).await;
        }
        assert_eq!(uplink.delivered(), vec![61, 63]);
        assert_eq!(relay.pending(), 1);
        assert!(relay.is_connected());

        // Flushes keep retrying it; it never leaves the queue on its own.
        assert_eq!(relay.flush().await, 0);
        assert_eq!(relay.pending(), 1);
    }

    #[tokio::test]
    async fn test_liveness_heartbeat_and_reannounce() {
        let (uplink, relay) = relay(DEFAULT_MAX_PENDING);
        assert!(relay.announce().await);

        relay.liveness_tick().await;
        assert_eq!(uplink.heartbeats.load(Ordering::SeqCst), 1);
        assert!(relay.is_connected());

        uplink.set_reachable(false);
        relay.liveness_tick().await;
        assert!(!relay.is_connected());

        // Offline: the next cycle re-registers instead of pinging.
        relay.liveness_tick().await;
        assert_eq!(uplink.heartbeats.load(Ordering::SeqCst), 2);
        assert_eq!(uplink.registrations.load(Ordering::SeqCst), 2);
        assert!(!relay.is_connected());
    }

    #[tokio::test]
    async fn test_forwarder_drains_channel() {
        let (uplink, relay) = relay(DEFAULT_MAX_PENDING);
        let relay = Arc::new(relay);
        assert!(relay.announce().await);

        let (tx, rx) = mpsc::channel(8);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let forwarder = tokio::spawn(run_forwarder(relay.clone(), rx, stop_rx));

        tx.send(snapshot(70)).await.unwrap();
        tx.send(snapshot(71)).await.unwrap();
        drop(tx);
        forwarder.await.unwrap();

        assert_eq!(uplink.delivered(), vec![70, 71]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_worker_skips_first_tick() {
        let (uplink, relay) = relay(DEFAULT_MAX_PENDING);
        let relay = Arc::new(relay);
        let (stop_tx, stop_rx) = watch::channel(false);
        let worker = tokio::spawn(run_liveness(relay.clone(), Duration::from_secs(30), stop_rx));

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert_eq!(uplink.registrations.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(uplink.registrations.load(Ordering::SeqCst), 1);
        assert!(relay.is_connected());

        stop_tx.send(true).unwrap();
        worker.await.unwrap();
    }
}
