//! Device history at a chosen resolution.

use super::TimeWindow;
use crate::db::{DbError, Sample, SampleFilter, TimeSeriesStore};

use chrono::Duration;
use std::collections::BTreeMap;

/// Most buckets one history request may produce.
pub const MAX_HISTORY_POINTS: i64 = 10_000;

/// Mean of the samples in each `every`-long bucket of `window`, stamped with
/// the bucket start. Buckets without samples are left out.
pub fn downsample(samples: &[Sample], window: &TimeWindow, every: Duration) -> Vec<Sample> {
    let step = every.num_milliseconds();
    if step <= 0 {
        return samples.to_vec();
    }

    let mut buckets: BTreeMap<i64, (f64, u32)> = BTreeMap::new();
    for sample in samples {
        let offset = (sample.time - window.start).num_milliseconds();
        if offset < 0 {
            continue;
        }
        let (sum, count) = buckets.entry(offset / step).or_default();
        *sum += sample.value;
        *count += 1;
    }

    buckets
        .into_iter()
        .map(|(index, (sum, count))| Sample {
            time: window.start + Duration::milliseconds(index * step),
            value: sum / f64::from(count),
        })
        .collect()
}

/// History of one field, averaged per `every` when given, raw otherwise.
pub fn device_history<S: TimeSeriesStore + ?Sized>(
    store: &S,
    device_id: &str,
    field: &str,
    window: &TimeWindow,
    filter: SampleFilter,
    every: Option<Duration>,
) -> Result<Vec<Sample>, DbError> {
    let samples = store.query_range(device_id, field, window, filter)?;
    Ok(match every {
        Some(every) => downsample(&samples, window, every),
        None => samples,
    })
}
