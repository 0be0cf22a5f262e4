//! Calendar-day windows.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::Serialize;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    /// `None` unless `start < end`.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    pub fn hours(&self) -> f64 {
        self.duration().num_milliseconds() as f64 / 3_600_000.0
    }
}

/// The part of a query range that falls on one local calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayWindow {
    pub date: NaiveDate,
    pub window: TimeWindow,
}

/// Partition `[start, end)` at local midnights.
///
/// The first and last windows are clamped to the range, so the windows are
/// contiguous and their durations sum to `end - start`. An empty or inverted
/// range yields no windows.
pub fn split_by_day(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    offset: FixedOffset,
) -> Vec<DayWindow> {
    let mut days = Vec::new();
    let mut cursor = start;

    while cursor < end {
        let date = cursor.with_timezone(&offset).date_naive();
        let next_midnight = date
            .succ_opt()
            .map(|next| local_midnight(next, offset))
            .unwrap_or(end);
        let window_end = next_midnight.min(end);

        days.push(DayWindow {
            date,
            window: TimeWindow {
                start: cursor,
                end: window_end,
            },
        });
        cursor = window_end;
    }

    days
}

/// Midnight at the start of `date` in the given offset, as UTC.
pub fn local_midnight(date: NaiveDate, offset: FixedOffset) -> DateTime<Utc> {
    let local = date.and_time(NaiveTime::MIN);
    Utc.from_utc_datetime(&(local - Duration::seconds(offset.local_minus_utc() as i64)))
}

/// From local midnight `days - 1` days before `now` until `now`.
pub fn last_days(now: DateTime<Utc>, days: u32, offset: FixedOffset) -> Option<TimeWindow> {
    if days == 0 {
        return None;
    }
    let today = now.with_timezone(&offset).date_naive();
    let first = today.checked_sub_days(chrono::Days::new(u64::from(days - 1)))?;
    TimeWindow::new(local_midnight(first, offset), now)
}
