use crate::model::round2;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

// Larger buffers grow on demand instead of reserving everything up front.
const MAX_PREALLOCATED_ROWS: usize = 1024;

/// Four parallel ring buffers holding the most recent readings.
///
/// Rows are pushed as a unit, so all four buffers always have the same length.
/// Once full, each push evicts the oldest row.
#[derive(Debug, Clone)]
pub struct HistoryBuffer {
    capacity: usize,
    heart_rate: VecDeque<u32>,
    spo2: VecDeque<u32>,
    temperature: VecDeque<f64>,
    timestamps: VecDeque<String>,
}

/// Serializable copy of a [`HistoryBuffer`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistorySnapshot {
    pub fc: Vec<u32>,
    pub spo2: Vec<u32>,
    pub temp: Vec<f64>,
    pub timestamps: Vec<String>,
}

impl HistoryBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let reserved = capacity.min(MAX_PREALLOCATED_ROWS);
        Self {
            capacity,
            heart_rate: VecDeque::with_capacity(reserved),
            spo2: VecDeque::with_capacity(reserved),
            temperature: VecDeque::with_capacity(reserved),
            timestamps: VecDeque::with_capacity(reserved),
        }
    }

    pub fn push(&mut self, heart_rate: u32, spo2: u32, temperature: f64, label: String) {
        if self.heart_rate.len() == self.capacity {
            self.heart_rate.pop_front();
            self.spo2.pop_front();
            self.temperature.pop_front();
            self.timestamps.pop_front();
        }
        self.heart_rate.push_back(heart_rate);
        self.spo2.push_back(spo2);
        self.temperature.push_back(temperature);
        self.timestamps.push_back(label);
    }

    pub fn len(&self) -> usize {
        self.heart_rate.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heart_rate.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn snapshot(&self) -> HistorySnapshot {
        HistorySnapshot {
            fc: self.heart_rate.iter().copied().collect(),
            spo2: self.spo2.iter().copied().collect(),
            temp: self.temperature.iter().copied().map(round2).collect(),
            timestamps: self.timestamps.iter().cloned().collect(),
        }
    }
}
