//! Shared telemetry model for the gateway and the aggregator.

mod history;
mod model;

pub use history::{HistoryBuffer, HistorySnapshot};
pub use model::{round2, ParseStateError, Sample, Snapshot, VitalState};
