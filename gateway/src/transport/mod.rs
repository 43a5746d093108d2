//! Device transport: keeps a link to the wearable open, parses what it
//! sends and forwards snapshots to the relay.

#[cfg(feature = "ble")]
mod ble;
mod serial;
mod simulated;

use crate::config::{Config, TransportKind};
use crate::errors::{Result, TransportError};
use crate::parser::SampleParser;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use telemetry::Snapshot;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub use serial::{SerialLink, DEFAULT_BAUD_RATE};
pub use simulated::SimulatedLink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

/// One physical or logical channel to the device.
#[async_trait]
pub trait DeviceLink: Send {
    fn describe(&self) -> String;

    async fn open(&mut self) -> std::result::Result<(), TransportError>;

    /// Waits for the next batch of complete lines. Returns an error once the
    /// link is lost.
    async fn next_lines(&mut self) -> std::result::Result<Vec<String>, TransportError>;

    /// Releases the underlying connection. Safe to call when not open.
    async fn close(&mut self);
}

/// Builds the link variant selected in configuration.
pub fn build_link(config: &Config) -> Result<Box<dyn DeviceLink>> {
    match config.transport {
        TransportKind::Spp => Ok(Box::new(SerialLink::new(
            &config.serial_port,
            config.baud_rate,
        ))),
        TransportKind::Simulated => Ok(Box::new(SimulatedLink::new(config.simulated_interval()))),
        #[cfg(feature = "ble")]
        TransportKind::Ble => Ok(Box::new(ble::BleLink::new(
            &config.ble_device_name,
            config.ble_service_uuid,
            config.ble_char_uuid,
            config.ble_scan_timeout(),
        ))),
        #[cfg(not(feature = "ble"))]
        TransportKind::Ble => Err(crate::errors::Error::Config(
            "BLE transport requested but the gateway was built without the `ble` feature"
                .to_string(),
        )),
    }
}

/// Runs one device link on a dedicated task until stopped.
pub struct TransportHandler {
    state: Arc<watch::Sender<LinkState>>,
    stop: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TransportHandler {
    pub fn start(
        link: Box<dyn DeviceLink>,
        parser: Arc<SampleParser>,
        sink: mpsc::Sender<Snapshot>,
        reconnect_backoff: Duration,
    ) -> Self {
        let state = Arc::new(watch::Sender::new(LinkState::Disconnected));
        let (stop, stop_rx) = watch::channel(false);

        let worker = tokio::spawn(run_link(
            link,
            parser,
            sink,
            state.clone(),
            stop_rx,
            reconnect_backoff,
        ));

        Self {
            state,
            stop,
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    /// Signals the worker to release the link and exit. Repeated calls are no-ops.
    pub fn stop(&self) {
        if !self.stop.send_replace(true) {
            info!("Stopping transport");
        }
        self.state.send_replace(LinkState::Disconnected);
    }

    /// Waits for the worker to exit, either after `stop` or on a fatal error.
    pub async fn join(&self) {
        let mut worker = self.worker.lock().await;
        if let Some(handle) = worker.as_mut() {
            if let Err(e) = handle.await {
                error!("Transport worker panicked: {}", e);
            }
            *worker = None;
        }
    }
}

async fn run_link(
    mut link: Box<dyn DeviceLink>,
    parser: Arc<SampleParser>,
    sink: mpsc::Sender<Snapshot>,
    state: Arc<watch::Sender<LinkState>>,
    mut stop: watch::Receiver<bool>,
    reconnect_backoff: Duration,
) {
    let name = link.describe();
    info!("Transport worker started for {}", name);

    while !is_stopped(&stop) {
        state.send_replace(LinkState::Connecting);
        info!("Connecting to {}...", name);

        let opened = tokio::select! {
            _ = stop.changed() => None,
            result = link.open() => Some(result),
        };

        let result = match opened {
            None => Ok(()),
            Some(Ok(())) => {
                state.send_replace(LinkState::Connected);
                info!("Connected to {}", name);
                pump(link.as_mut(), &parser, &sink, &mut stop).await
            }
            Some(Err(e)) => Err(e),
        };

        link.close().await;
        state.send_replace(LinkState::Disconnected);

        match result {
            Ok(()) => break,
            Err(e) if e.is_fatal() => {
                error!("Fatal transport error on {}, giving up: {}", name, e);
                break;
            }
            Err(e) => {
                warn!(
                    "Link to {} lost: {}. Retrying in {:?}",
                    name, e, reconnect_backoff
                );
            }
        }

        tokio::select! {
            _ = stop.changed() => break,
            _ = tokio::time::sleep(reconnect_backoff) => {}
        }
    }

    state.send_replace(LinkState::Disconnected);
    info!("Transport worker stopped for {}", name);
}

fn is_stopped(stop: &watch::Receiver<bool>) -> bool {
    *stop.borrow()
}

/// Reads lines until the link fails, a stop is requested or the sink closes.
async fn pump(
    link: &mut dyn DeviceLink,
    parser: &SampleParser,
    sink: &mpsc::Sender<Snapshot>,
    stop: &mut watch::Receiver<bool>,
) -> std::result::Result<(), TransportError> {
    loop {
        let lines = tokio::select! {
            _ = stop.changed() => return Ok(()),
            lines = link.next_lines() => lines?,
        };

        for line in lines {
            debug!("Received: {}", line);
            let snapshot = parser.process_line(&line);
            if !forward(sink, snapshot).await {
                return Ok(());
            }
        }
    }
}

async fn forward(sink: &mpsc::Sender<Snapshot>, snapshot: Snapshot) -> bool {
    match sink.try_send(snapshot) {
        Ok(()) => true,
        Err(TrySendError::Full(snapshot)) => {
            debug!("Sample channel full, waiting for the relay");
            sink.send(snapshot).await.is_ok()
        }
        Err(TrySendError::Closed(_)) => {
            warn!("Sample channel closed, stopping transport");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::InferencePolicy;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type OpenResult = std::result::Result<(), TransportError>;
    type ReadResult = std::result::Result<Vec<String>, TransportError>;

    /// Plays back scripted open and read results. Once the reads run out it
    /// blocks forever, like an idle device.
    #[derive(Default)]
    struct ScriptedLink {
        opens: VecDeque<OpenResult>,
        reads: VecDeque<ReadResult>,
        open_calls: Arc<AtomicUsize>,
        close_calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl DeviceLink for ScriptedLink {
        fn describe(&self) -> String {
            "scripted link".to_string()
        }

        async fn open(&mut self) -> OpenResult {
            self.open_calls.fetch_add(1, Ordering::SeqCst);
            self.opens.pop_front().unwrap_or(Ok(()))
        }

        async fn next_lines(&mut self) -> ReadResult {
            match self.reads.pop_front() {
                Some(result) => result,
                None => std::future::pending().await,
            }
        }

        async fn close(&mut self) {
            self.close_calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn lines(items: &[&str]) -> ReadResult {
        Ok(items.iter().map(|s| s.to_string()).collect())
    }

    fn parser() -> Arc<SampleParser> {
        Arc::new(SampleParser::new(10, InferencePolicy::Always))
    }

    async fn wait_for(handler: &TransportHandler, wanted: LinkState) {
        let mut changes = handler.state_changes();
        changes.wait_for(|state| *state == wanted).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_lines_are_parsed_and_forwarded() {
        let link = ScriptedLink {
            reads: VecDeque::from([lines(&["FC:72 SpO2:97", "noise", "Temp:36.5"])]),
            ..ScriptedLink::default()
        };
        let (tx, mut rx) = mpsc::channel(8);
        let handler = TransportHandler::start(Box::new(link), parser(), tx, Duration::from_secs(5));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.fc, 72);
        assert_eq!(first.spo2, 97);
        // Unmatched lines still produce a snapshot.
        let second = rx.recv().await.unwrap();
        assert_eq!(second, first);
        let third = rx.recv().await.unwrap();
        assert_eq!(third.temp, 36.5);

        assert_eq!(handler.state(), LinkState::Connected);
        handler.stop();
        handler.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_failures() {
        let open_calls = Arc::new(AtomicUsize::new(0));
        let close_calls = Arc::new(AtomicUsize::new(0));
        let link = ScriptedLink {
            opens: VecDeque::from([
                Err(TransportError::DeviceNotFound("wearable".to_string())),
                Ok(()),
                Ok(()),
            ]),
            reads: VecDeque::from([
                lines(&["FC:60"]),
                Err(TransportError::Closed),
                lines(&["FC:61"]),
            ]),
            open_calls: open_calls.clone(),
            close_calls: close_calls.clone(),
        };
        let (tx, mut rx) = mpsc::channel(8);
        let handler = TransportHandler::start(Box::new(link), parser(), tx, Duration::from_secs(5));

        assert_eq!(rx.recv().await.unwrap().fc, 60);
        assert_eq!(rx.recv().await.unwrap().fc, 61);
        assert_eq!(open_calls.load(Ordering::SeqCst), 3);
        assert_eq!(close_calls.load(Ordering::SeqCst), 2);

        handler.stop();
        handler.join().await;
        assert_eq!(close_calls.load(Ordering::SeqCst), 3);
        assert_eq!(handler.state(), LinkState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_stops_worker() {
        let open_calls = Arc::new(AtomicUsize::new(0));
        let link = ScriptedLink {
            opens: VecDeque::from([Err(TransportError::Config(
                "characteristic uuid not configured".to_string(),
            ))]),
            open_calls: open_calls.clone(),
            ..ScriptedLink::default()
        };
        let (tx, _rx) = mpsc::channel(8);
        let handler = TransportHandler::start(Box::new(link), parser(), tx, Duration::from_secs(5));

        handler.join().await;
        assert_eq!(open_calls.load(Ordering::SeqCst), 1);
        assert_eq!(handler.state(), LinkState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent() {
        let (tx, _rx) = mpsc::channel(8);
        let handler = TransportHandler::start(
            Box::new(ScriptedLink::default()),
            parser(),
            tx,
            Duration::from_secs(5),
        );
        wait_for(&handler, LinkState::Connected).await;

        handler.stop();
        handler.stop();
        handler.join().await;
        handler.stop();
        handler.join().await;
        assert_eq!(handler.state(), LinkState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_sink_stops_worker() {
        let link = ScriptedLink {
            reads: VecDeque::from([lines(&["FC:70"])]),
            ..ScriptedLink::default()
        };
        let (tx, rx) = mpsc::channel(8);
        drop(rx);
        let handler = TransportHandler::start(Box::new(link), parser(), tx, Duration::from_secs(5));

        handler.join().await;
        assert_eq!(handler.state(), LinkState::Disconnected);
    }
}
