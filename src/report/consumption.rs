//! Consumption deltas from cumulative counters (energy, gas volume).

use super::TimeWindow;
use crate::db::{DbError, Sample, SampleFilter, TimeSeriesStore};

use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// What to do when a cumulative counter goes down inside a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CounterResetPolicy {
    /// `last - first`, negative if the counter went down.
    #[default]
    SurfaceRaw,
    /// Treat every decrease as a restart from zero: the value after the drop
    /// is counted in full and summing continues from there.
    ResetToZeroBaseline,
}

impl FromStr for CounterResetPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "raw" | "surface-raw" => Ok(Self::SurfaceRaw),
            "zero-baseline" | "reset-to-zero-baseline" => Ok(Self::ResetToZeroBaseline),
            other => Err(format!("unknown counter reset policy: {}", other)),
        }
    }
}

impl fmt::Display for CounterResetPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SurfaceRaw => f.write_str("raw"),
            Self::ResetToZeroBaseline => f.write_str("zero-baseline"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct ConsumptionDelta {
    pub start_reading: f64,
    pub end_reading: f64,
    pub consumption: f64,
}

/// Delta over time-ordered counter samples.
pub fn delta_from_samples(samples: &[Sample], policy: CounterResetPolicy) -> ConsumptionDelta {
    let (first, last) = match samples {
        [] => return ConsumptionDelta::default(),
        [only] => {
            return ConsumptionDelta {
                start_reading: only.value,
                end_reading: only.value,
                consumption: 0.0,
            }
        }
        [first, .., last] => (first.value, last.value),
    };

    let consumption = match policy {
        CounterResetPolicy::SurfaceRaw => last - first,
        CounterResetPolicy::ResetToZeroBaseline => samples
            .windows(2)
            .map(|pair| {
                let (prev, cur) = (pair[0].value, pair[1].value);
                if cur >= prev {
                    cur - prev
                } else {
                    cur
                }
            })
            .sum(),
    };

    ConsumptionDelta {
        start_reading: first,
        end_reading: last,
        consumption,
    }
}

/// Counter delta for one device field inside `window`.
pub fn consumption<S: TimeSeriesStore + ?Sized>(
    store: &S,
    device_id: &str,
    counter_field: &str,
    window: &TimeWindow,
    policy: CounterResetPolicy,
) -> Result<ConsumptionDelta, DbError> {
    let samples = store.query_range(device_id, counter_field, window, SampleFilter::All)?;
    Ok(delta_from_samples(&samples, policy))
}
