//! Time-series storage.
//!
//! The poller and the report builder only see [`TimeSeriesStore`]; the SQLite
//! [`Store`] is the production implementation.

mod models;
mod store;

pub use models::*;
pub use store::*;

use crate::report::TimeWindow;

/// Write/query contract for sensor points and feeding records.
pub trait TimeSeriesStore: Send + Sync + 'static {
    /// Persist readings, feeding records and alarm events in one transaction:
    /// either all of the batch is stored or none of it. Returns the number of
    /// points written.
    fn write_batch(&self, batch: &WriteBatch) -> Result<usize, DbError>;

    /// Samples of one field inside `window`, oldest first.
    fn query_range(
        &self,
        device_id: &str,
        field: &str,
        window: &TimeWindow,
        filter: SampleFilter,
    ) -> Result<Vec<Sample>, DbError>;

    /// Number of samples in `window` strictly above `threshold`.
    fn count_above_threshold(
        &self,
        device_id: &str,
        field: &str,
        threshold: f64,
        window: &TimeWindow,
    ) -> Result<u64, DbError>;

    /// Total weight added to a hopper inside `window`.
    fn sum_feeding(&self, device_id: &str, window: &TimeWindow) -> Result<f64, DbError>;
}
