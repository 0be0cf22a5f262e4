//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, Result as SqlResult};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

use super::models::*;
use super::TimeSeriesStore;
use crate::layout::AlarmLevel;
use crate::report::TimeWindow;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the database at `path`.
    ///
    /// `busy_timeout` bounds how long a statement waits for a locked database.
    pub fn new<P: AsRef<Path>>(path: P, busy_timeout: Duration) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the database with migrations.
    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;
        conn.execute_batch(include_str!("../../migrations/000002_alarm_events.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 2 failed: {}", e)))?;
        Ok(())
    }

    /// Feeding records for a hopper inside a window, oldest first.
    pub fn get_feeding_records(
        &self,
        device_id: &str,
        window: &TimeWindow,
    ) -> Result<Vec<FeedingRecord>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT time, device_id, added_weight FROM feeding_records
             WHERE device_id = ?1 AND time >= ?2 AND time < ?3 ORDER BY time ASC",
        )?;

        let records = stmt
            .query_map(
                params![device_id, format_db_time(window.start), format_db_time(window.end)],
                |row| {
                    let time_str: String = row.get(0)?;
                    Ok(FeedingRecord {
                        time: parse_db_time(&time_str).unwrap_or(window.start),
                        device_id: row.get(1)?,
                        added_weight: row.get(2)?,
                    })
                },
            )?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(records)
    }

    /// Row counts and file size for the status endpoint.
    pub fn get_stats(&self) -> Result<StoreStats, DbError> {
        let conn = self.conn.lock().unwrap();
        let point_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM sensor_points", [], |r| r.get(0))?;
        let feeding_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM feeding_records", [], |r| r.get(0))?;
        let alarm_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM alarm_events", [], |r| r.get(0))?;
        let page_count: i64 = conn.query_row("PRAGMA page_count", [], |r| r.get(0))?;
        let page_size: i64 = conn.query_row("PRAGMA page_size", [], |r| r.get(0))?;
        Ok(StoreStats {
            point_count,
            feeding_count,
            alarm_count,
            db_size_bytes: page_count * page_size,
        })
    }

    /// Alarm events inside a window, newest first.
    pub fn query_alarms(
        &self,
        window: &TimeWindow,
        query: &AlarmQuery,
    ) -> Result<Vec<AlarmEvent>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT time, device_id, device_type, field, level, value, threshold
             FROM alarm_events
             WHERE time >= ?1 AND time < ?2
               AND (?3 IS NULL OR level = ?3)
               AND (?4 IS NULL OR device_id = ?4)
               AND (?5 IS NULL OR substr(field, 1, length(?5)) = ?5)
             ORDER BY time DESC
             LIMIT ?6",
        )?;

        let rows = stmt
            .query_map(
                params![
                    format_db_time(window.start),
                    format_db_time(window.end),
                    query.level.map(AlarmLevel::as_str),
                    query.device_id,
                    query.field_prefix,
                    query.limit as i64,
                ],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, f64>(5)?,
                        row.get::<_, f64>(6)?,
                    ))
                },
            )?
            .collect::<SqlResult<Vec<_>>>()?;

        // Rows written by an older layout may name unknown categories; skip them.
        let events = rows
            .into_iter()
            .filter_map(|(time, device_id, device_type, field, level, value, threshold)| {
                Some(AlarmEvent {
                    time: parse_db_time(&time)?,
                    device_id,
                    device_type: device_type.parse().ok()?,
                    field,
                    level: level.parse().ok()?,
                    value,
                    threshold,
                })
            })
            .collect();
        Ok(events)
    }

    /// Alarm events per level inside a window.
    pub fn alarm_counts(&self, window: &TimeWindow) -> Result<AlarmCounts, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT level, COUNT(*) FROM alarm_events
             WHERE time >= ?1 AND time < ?2 GROUP BY level",
        )?;
        let rows = stmt
            .query_map(
                params![format_db_time(window.start), format_db_time(window.end)],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
            )?
            .collect::<SqlResult<Vec<_>>>()?;

        let mut counts = AlarmCounts::default();
        for (level, count) in rows {
            let count = count.max(0) as u64;
            match level.parse() {
                Ok(AlarmLevel::Warning) => counts.warning += count,
                Ok(AlarmLevel::Alarm) => counts.alarm += count,
                Err(_) => continue,
            }
            counts.total += count;
        }
        Ok(counts)
    }
}

impl TimeSeriesStore for Store {
    fn write_batch(&self, batch: &WriteBatch) -> Result<usize, DbError> {
        if batch.is_empty() {
            return Ok(0);
        }

        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;
        let mut written = 0;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO sensor_points (time, device_id, device_type, module_tag, field, value)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;

            for r in &batch.readings {
                let time = format_db_time(r.timestamp);
                for (field, value) in &r.fields {
                    stmt.execute(params![
                        time,
                        r.device_id,
                        r.device_type.as_str(),
                        r.module_tag,
                        field,
                        value,
                    ])?;
                    written += 1;
                }
            }

            let mut stmt = tx.prepare(
                "INSERT INTO feeding_records (time, device_id, added_weight) VALUES (?1, ?2, ?3)",
            )?;
            for r in &batch.feedings {
                stmt.execute(params![format_db_time(r.time), r.device_id, r.added_weight])?;
            }

            let mut stmt = tx.prepare(
                "INSERT INTO alarm_events
                 (time, device_id, device_type, field, level, value, threshold)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for a in &batch.alarms {
                stmt.execute(params![
                    format_db_time(a.time),
                    a.device_id,
                    a.device_type.as_str(),
                    a.field,
                    a.level.as_str(),
                    a.value,
                    a.threshold,
                ])?;
            }
        }

        tx.commit()?;
        Ok(written)
    }

    fn query_range(
        &self,
        device_id: &str,
        field: &str,
        window: &TimeWindow,
        filter: SampleFilter,
    ) -> Result<Vec<Sample>, DbError> {
        let conn = self.conn.lock().unwrap();
        let (sql, bound) = match filter {
            SampleFilter::All => (
                "SELECT time, value FROM sensor_points
                 WHERE device_id = ?1 AND field = ?2 AND time >= ?3 AND time < ?4
                 ORDER BY time ASC",
                None,
            ),
            SampleFilter::Above(bound) => (
                "SELECT time, value FROM sensor_points
                 WHERE device_id = ?1 AND field = ?2 AND time >= ?3 AND time < ?4 AND value > ?5
                 ORDER BY time ASC",
                Some(bound),
            ),
        };

        let mut stmt = conn.prepare(sql)?;
        let start = format_db_time(window.start);
        let end = format_db_time(window.end);
        let map_row = |row: &rusqlite::Row<'_>| -> SqlResult<Sample> {
            let time_str: String = row.get(0)?;
            Ok(Sample {
                time: parse_db_time(&time_str).unwrap_or(window.start),
                value: row.get(1)?,
            })
        };

        let samples = match bound {
            None => stmt
                .query_map(params![device_id, field, start, end], map_row)?
                .collect::<SqlResult<Vec<_>>>()?,
            Some(bound) => stmt
                .query_map(params![device_id, field, start, end, bound], map_row)?
                .collect::<SqlResult<Vec<_>>>()?,
        };

        Ok(samples)
    }

    fn count_above_threshold(
        &self,
        device_id: &str,
        field: &str,
        threshold: f64,
        window: &TimeWindow,
    ) -> Result<u64, DbError> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sensor_points
             WHERE device_id = ?1 AND field = ?2 AND time >= ?3 AND time < ?4 AND value > ?5",
            params![
                device_id,
                field,
                format_db_time(window.start),
                format_db_time(window.end),
                threshold,
            ],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    fn sum_feeding(&self, device_id: &str, window: &TimeWindow) -> Result<f64, DbError> {
        let conn = self.conn.lock().unwrap();
        let total: Option<f64> = conn.query_row(
            "SELECT SUM(added_weight) FROM feeding_records
             WHERE device_id = ?1 AND time >= ?2 AND time < ?3",
            params![device_id, format_db_time(window.start), format_db_time(window.end)],
            |row| row.get(0),
        )?;
        Ok(total.unwrap_or(0.0))
    }
}

fn format_db_time(t: DateTime<Utc>) -> String {
    t.format(TIME_FORMAT).to_string()
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [TIME_FORMAT, "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{DeviceType, ENERGY, POWER};
    use chrono::Duration as ChronoDuration;
    use std::collections::BTreeMap;
    use tempfile::NamedTempFile;

    fn open() -> (NamedTempFile, Store) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path(), Duration::from_secs(1)).unwrap();
        (tmp, store)
    }

    fn base() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-19T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn meter_reading(t: DateTime<Utc>, power: f64, energy: f64) -> SensorReading {
        SensorReading {
            device_id: "fan_1".to_string(),
            timestamp: t,
            device_type: DeviceType::Fan,
            module_tag: "meter".to_string(),
            fields: BTreeMap::from([(POWER.to_string(), power), (ENERGY.to_string(), energy)]),
        }
    }

    #[test]
    fn test_write_and_query_range() {
        let (_tmp, store) = open();
        let t0 = base();
        let readings: Vec<_> = (0..5)
            .map(|i| meter_reading(t0 + ChronoDuration::seconds(6 * i), i as f64, 100.0 + i as f64))
            .collect();

        assert_eq!(store.write_batch(&WriteBatch::from(readings)).unwrap(), 10);

        let window = TimeWindow::new(t0, t0 + ChronoDuration::seconds(24)).unwrap();
        let samples = store
            .query_range("fan_1", ENERGY, &window, SampleFilter::All)
            .unwrap();
        // end is exclusive
        assert_eq!(samples.len(), 4);
        assert_eq!(samples[0].time, t0);
        assert_eq!(samples[3].value, 103.0);

        let above = store
            .query_range("fan_1", POWER, &window, SampleFilter::Above(1.0))
            .unwrap();
        assert_eq!(above.iter().map(|s| s.value).collect::<Vec<_>>(), vec![2.0, 3.0]);
    }

    #[test]
    fn test_count_above_threshold() {
        let (_tmp, store) = open();
        let t0 = base();
        let readings = vec![
            meter_reading(t0, 0.0, 1.0),
            meter_reading(t0 + ChronoDuration::seconds(6), 0.01, 1.0),
            meter_reading(t0 + ChronoDuration::seconds(12), 0.02, 1.0),
            meter_reading(t0 + ChronoDuration::seconds(18), 5.0, 1.0),
        ];
        store.write_batch(&WriteBatch::from(readings)).unwrap();

        let window = TimeWindow::new(t0, t0 + ChronoDuration::hours(1)).unwrap();
        assert_eq!(store.count_above_threshold("fan_1", POWER, 0.01, &window).unwrap(), 2);
        assert_eq!(store.count_above_threshold("fan_2", POWER, 0.01, &window).unwrap(), 0);
    }

    #[test]
    fn test_feeding_records() {
        let (_tmp, store) = open();
        let t0 = base();
        let batch = WriteBatch {
            feedings: vec![
                FeedingRecord {
                    time: t0 + ChronoDuration::hours(1),
                    device_id: "short_hopper_1".to_string(),
                    added_weight: 120.5,
                },
                FeedingRecord {
                    time: t0 + ChronoDuration::hours(30),
                    device_id: "short_hopper_1".to_string(),
                    added_weight: 80.0,
                },
            ],
            ..Default::default()
        };
        assert_eq!(store.write_batch(&batch).unwrap(), 0);

        let day = TimeWindow::new(t0, t0 + ChronoDuration::days(1)).unwrap();
        assert_eq!(store.sum_feeding("short_hopper_1", &day).unwrap(), 120.5);
        assert_eq!(store.sum_feeding("short_hopper_2", &day).unwrap(), 0.0);
        assert_eq!(store.get_feeding_records("short_hopper_1", &day).unwrap().len(), 1);

        let stats = store.get_stats().unwrap();
        assert_eq!(stats.feeding_count, 2);
        assert!(stats.db_size_bytes > 0);
    }

    fn alarm(t: DateTime<Utc>, device_id: &str, field: &str, level: AlarmLevel) -> AlarmEvent {
        AlarmEvent {
            time: t,
            device_id: device_id.to_string(),
            device_type: DeviceType::Fan,
            field: field.to_string(),
            level,
            value: 95.0,
            threshold: 80.0,
        }
    }

    #[test]
    fn test_failed_batch_writes_nothing() {
        let (_tmp, store) = open();
        let t0 = base();
        store
            .conn
            .lock()
            .unwrap()
            .execute_batch("DROP TABLE alarm_events")
            .unwrap();

        let batch = WriteBatch {
            readings: vec![meter_reading(t0, 12.0, 1.0)],
            alarms: vec![alarm(t0, "fan_1", POWER, AlarmLevel::Alarm)],
            ..Default::default()
        };
        assert!(store.write_batch(&batch).is_err());

        let window = TimeWindow::new(t0, t0 + ChronoDuration::hours(1)).unwrap();
        assert_eq!(store.count_above_threshold("fan_1", POWER, 0.01, &window).unwrap(), 0);
    }

    #[test]
    fn test_alarm_queries() {
        let (_tmp, store) = open();
        let t0 = base();
        let batch = WriteBatch {
            alarms: vec![
                alarm(t0, "fan_1", POWER, AlarmLevel::Warning),
                alarm(t0 + ChronoDuration::minutes(5), "fan_1", POWER, AlarmLevel::Alarm),
                alarm(t0 + ChronoDuration::minutes(10), "fan_2", "temperature", AlarmLevel::Alarm),
                alarm(t0 + ChronoDuration::days(2), "fan_2", POWER, AlarmLevel::Alarm),
            ],
            ..Default::default()
        };
        store.write_batch(&batch).unwrap();

        let day = TimeWindow::new(t0, t0 + ChronoDuration::days(1)).unwrap();
        let all = store.query_alarms(&day, &AlarmQuery::default()).unwrap();
        assert_eq!(all.len(), 3);
        // newest first
        assert_eq!(all[0].device_id, "fan_2");
        assert_eq!(all[2].level, AlarmLevel::Warning);

        let alarms_only = AlarmQuery {
            level: Some(AlarmLevel::Alarm),
            field_prefix: Some("P".to_string()),
            ..Default::default()
        };
        let events = store.query_alarms(&day, &alarms_only).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].time, t0 + ChronoDuration::minutes(5));

        let limited = AlarmQuery {
            limit: 1,
            ..Default::default()
        };
        assert_eq!(store.query_alarms(&day, &limited).unwrap().len(), 1);

        let counts = store.alarm_counts(&day).unwrap();
        assert_eq!(
            counts,
            AlarmCounts {
                warning: 1,
                alarm: 2,
                total: 3
            }
        );
        assert_eq!(store.get_stats().unwrap().alarm_count, 4);
    }

    #[test]
    fn test_reopen_keeps_data() {
        let tmp = NamedTempFile::new().unwrap();
        let t0 = base();
        {
            let store = Store::new(tmp.path(), Duration::from_secs(1)).unwrap();
            store
                .write_batch(&WriteBatch::from(vec![meter_reading(t0, 1.0, 2.0)]))
                .unwrap();
        }
        let store = Store::new(tmp.path(), Duration::from_secs(1)).unwrap();
        assert_eq!(store.get_stats().unwrap().point_count, 2);
    }

    #[test]
    fn test_parse_db_time() {
        let t = base() + ChronoDuration::nanoseconds(123_456_789);
        assert_eq!(parse_db_time(&format_db_time(t)), Some(t));
        assert!(parse_db_time("2026-01-19 00:00:00").is_some());
        assert!(parse_db_time("not a time").is_none());
    }
}
