//! Hopper refill detection from the weight signal.

use crate::db::FeedingRecord;
use crate::layout::FeedingThresholds;

use chrono::{DateTime, Utc};

/// Drain per poll assumed until a hopper has shown its own, in kg.
pub const DEFAULT_FEED_RATE: f64 = 0.5;

#[derive(Debug, Clone, Copy)]
struct Refill {
    started: DateTime<Utc>,
    start_weight: f64,
    peak: f64,
    /// Polls from the valley to the peak.
    intervals: u32,
    /// Drain per poll while the refill ran.
    feed_rate: f64,
}

impl Refill {
    /// Weight put in, counting what the kiln drew while the hopper filled.
    fn added_weight(&self) -> f64 {
        self.raw_increase() + self.feed_rate * f64::from(self.intervals)
    }

    fn raw_increase(&self) -> f64 {
        self.peak - self.start_weight
    }
}

/// Watches one hopper's weight and emits a record per completed refill.
///
/// A jump above `rising_threshold` between two polls starts a refill; it ends
/// at the first poll that does not exceed the running peak. Refills whose
/// weight gain is no more than `min_feeding_threshold` are ignored.
///
/// The hopper keeps draining into the kiln while it is filled, so the emitted
/// amount adds the drain over the valley-to-peak polls. The drain rate is the
/// drop seen in the poll before the valley, or the last rate used when that
/// poll shows no drop.
#[derive(Debug, Clone)]
pub struct FeedingDetector {
    device_id: String,
    thresholds: FeedingThresholds,
    last: Option<f64>,
    before_last: Option<f64>,
    feed_rate: f64,
    refill: Option<Refill>,
}

impl FeedingDetector {
    pub fn new(device_id: &str, thresholds: FeedingThresholds) -> Self {
        Self {
            device_id: device_id.to_string(),
            thresholds,
            last: None,
            before_last: None,
            feed_rate: DEFAULT_FEED_RATE,
            refill: None,
        }
    }

    pub fn observe(&mut self, time: DateTime<Utc>, weight: f64) -> Option<FeedingRecord> {
        let previous = self.last.replace(weight);
        let before_previous = std::mem::replace(&mut self.before_last, previous);

        if let Some(mut refill) = self.refill.take() {
            if weight > refill.peak {
                refill.peak = weight;
                refill.intervals += 1;
                self.refill = Some(refill);
                return None;
            }
            if refill.raw_increase() > self.thresholds.min_feeding_threshold {
                self.feed_rate = refill.feed_rate;
                return Some(FeedingRecord {
                    time: refill.started,
                    device_id: self.device_id.clone(),
                    added_weight: refill.added_weight(),
                });
            }
            return None;
        }

        if let Some(previous) = previous {
            if weight - previous > self.thresholds.rising_threshold {
                let drop = before_previous.map_or(0.0, |before| before - previous);
                self.refill = Some(Refill {
                    started: time,
                    start_weight: previous,
                    peak: weight,
                    intervals: 1,
                    feed_rate: if drop > 0.0 { drop } else { self.feed_rate },
                });
            }
        }
        None
    }
}
