use super::DeviceLink;
use crate::errors::TransportError;
use async_trait::async_trait;
use serialport::SerialPort;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_BAUD_RATE: u32 = 115_200;
const POLL_INTERVAL: Duration = Duration::from_millis(50);
const READ_TIMEOUT: Duration = Duration::from_secs(2);
const MAX_PENDING_LINE: usize = 4096;

/// Bluetooth SPP (or any serial) port polled for newline-terminated text.
///
/// Port I/O is blocking, so every call into the port runs on the blocking pool.
pub struct SerialLink {
    port_name: String,
    baud_rate: u32,
    port: Option<Box<dyn SerialPort>>,
    splitter: LineSplitter,
}

impl SerialLink {
    pub fn new(port_name: &str, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.to_string(),
            baud_rate,
            port: None,
            splitter: LineSplitter::default(),
        }
    }
}

#[async_trait]
impl DeviceLink for SerialLink {
    fn describe(&self) -> String {
        format!("serial port {} @ {} baud", self.port_name, self.baud_rate)
    }

    async fn open(&mut self) -> Result<(), TransportError> {
        let name = self.port_name.clone();
        let baud_rate = self.baud_rate;
        let port = tokio::task::spawn_blocking(move || {
            serialport::new(name, baud_rate).timeout(READ_TIMEOUT).open()
        })
        .await?
        .map_err(|e| match e.kind() {
            serialport::ErrorKind::NoDevice => {
                TransportError::DeviceNotFound(self.port_name.clone())
            }
            _ => TransportError::Serial(e),
        })?;

        self.splitter = LineSplitter::default();
        self.port = Some(port);
        Ok(())
    }

    async fn next_lines(&mut self) -> Result<Vec<String>, TransportError> {
        loop {
            let mut port = self.port.take().ok_or(TransportError::Closed)?;
            let (port, bytes) = tokio::task::spawn_blocking(move || {
                let bytes = read_available(port.as_mut());
                (port, bytes)
            })
            .await?;
            self.port = Some(port);

            let lines = self.splitter.push(&bytes?);
            if !lines.is_empty() {
                return Ok(lines);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn close(&mut self) {
        if self.port.take().is_some() {
            debug!("Closed {}", self.port_name);
        }
    }
}

fn read_available(port: &mut dyn SerialPort) -> Result<Vec<u8>, TransportError> {
    let available = port.bytes_to_read()? as usize;
    if available == 0 {
        return Ok(Vec::new());
    }

    let mut buffer = vec![0u8; available];
    let read = port.read(&mut buffer)?;
    buffer.truncate(read);
    Ok(buffer)
}

/// Reassembles newline-terminated lines from arbitrary byte chunks.
#[derive(Debug, Default)]
pub(crate) struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    /// Appends bytes and returns every completed, non-empty line. Invalid
    /// UTF-8 is replaced rather than rejected.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(end) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=end).collect();
            let line = String::from_utf8_lossy(&raw).trim().to_string();
            if !line.is_empty() {
                lines.push(line);
            }
        }

        if self.pending.len() > MAX_PENDING_LINE {
            warn!(
                "Discarding {} bytes without a line break",
                self.pending.len()
            );
            self.pending.clear();
        }

        lines
    }
}
