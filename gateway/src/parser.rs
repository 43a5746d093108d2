//! Line parser for the wearable's tagged telemetry output.
//!
//! The firmware prints lines such as `FC:72 SpO2:97 Temp:36.52 STATE:NORMAL IR:10234`.
//! Any subset of tags may appear, in any order. Unknown tokens and values
//! that fail to parse are skipped without error.

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use std::sync::{Mutex, MutexGuard, PoisonError};
use telemetry::{HistoryBuffer, Sample, Snapshot, VitalState};
use tracing::debug;

pub const DEFAULT_HISTORY_CAPACITY: usize = 200;

/// When heart-rate based state inference applies to a line without a `STATE:` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum InferencePolicy {
    /// Infer only while the current state is `NoContact`. Once the device
    /// reports, or inference yields, any other state, it sticks until an
    /// explicit `STATE:` tag changes it.
    #[default]
    WhileNoContact,
    /// Infer on every line that updates heart rate or SpO2.
    Always,
}

/// Tags recognised on a single line. The first occurrence of a tag wins.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct LineUpdate {
    pub heart_rate: Option<u32>,
    pub spo2: Option<u32>,
    pub temperature: Option<f64>,
    pub state: Option<VitalState>,
    pub infrared: Option<u32>,
}

impl LineUpdate {
    fn is_empty(&self) -> bool {
        *self == LineUpdate::default()
    }

    fn touches_history(&self) -> bool {
        self.heart_rate.is_some() || self.spo2.is_some() || self.temperature.is_some()
    }
}

pub(crate) fn parse_tags(line: &str) -> LineUpdate {
    let mut update = LineUpdate::default();

    for token in line.split(|c: char| c.is_whitespace() || c == ',') {
        let Some((key, value)) = token.split_once(':') else {
            continue;
        };
        match key {
            "FC" if update.heart_rate.is_none() => update.heart_rate = value.parse::<u32>().ok(),
            "SpO2" if update.spo2.is_none() => {
                update.spo2 = value.parse::<u32>().ok().filter(|v| *v <= 100)
            }
            "Temp" if update.temperature.is_none() => {
                update.temperature = value.parse::<f64>().ok().filter(|v| v.is_finite())
            }
            "STATE" if update.state.is_none() => update.state = value.parse().ok(),
            "IR" if update.infrared.is_none() => update.infrared = value.parse::<u32>().ok(),
            _ => {}
        }
    }

    update
}

struct DeviceState {
    sample: Sample,
    updated_at: DateTime<Utc>,
    history: HistoryBuffer,
}

/// Holds the device's current reading and local history.
///
/// Lines are applied one at a time under a mutex; readers always see a whole
/// line's worth of changes.
pub struct SampleParser {
    policy: InferencePolicy,
    state: Mutex<DeviceState>,
}

impl SampleParser {
    pub fn new(history_capacity: usize, policy: InferencePolicy) -> Self {
        Self {
            policy,
            state: Mutex::new(DeviceState {
                sample: Sample::default(),
                updated_at: Utc::now(),
                history: HistoryBuffer::new(history_capacity),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies one line and returns the resulting snapshot. A line with no
    /// recognised tags still yields the (unchanged) snapshot.
    pub fn process_line(&self, line: &str) -> Snapshot {
        self.process_line_at(line, Utc::now())
    }

    pub fn process_line_at(&self, line: &str, now: DateTime<Utc>) -> Snapshot {
        let update = parse_tags(line);
        let mut state = self.lock();
        if update.is_empty() {
            return Snapshot::new(&state.sample, state.updated_at, &state.history);
        }
        debug!("Parsed {:?}", update);

        let sample = &mut state.sample;
        if let Some(heart_rate) = update.heart_rate {
            sample.heart_rate = heart_rate;
        }
        if let Some(spo2) = update.spo2 {
            sample.spo2 = spo2;
        }
        if let Some(temperature) = update.temperature {
            sample.temperature = temperature;
        }
        if let Some(infrared) = update.infrared {
            sample.infrared = Some(infrared);
        }

        let vitals_changed = update.heart_rate.is_some() || update.spo2.is_some();
        let infer = match self.policy {
            InferencePolicy::WhileNoContact => {
                vitals_changed && sample.state == VitalState::NoContact
            }
            InferencePolicy::Always => vitals_changed && update.state.is_none(),
        };
        if infer {
            sample.state = VitalState::infer_from_heart_rate(sample.heart_rate);
        }
        if let Some(explicit) = update.state {
            sample.state = explicit;
        }

        let (heart_rate, spo2, temperature) = (sample.heart_rate, sample.spo2, sample.temperature);
        if update.touches_history() {
            let label = now.format("%H:%M:%S").to_string();
            state.history.push(heart_rate, spo2, temperature, label);
        }
        state.updated_at = now;

        Snapshot::new(&state.sample, state.updated_at, &state.history)
    }

    pub fn snapshot(&self) -> Snapshot {
        let state = self.lock();
        Snapshot::new(&state.sample, state.updated_at, &state.history)
    }
}
