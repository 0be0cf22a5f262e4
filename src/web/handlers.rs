//! HTTP request handlers.

use super::AppState;
use crate::codec::ModuleStatus;
use crate::db::{AlarmQuery, SampleFilter, SensorReading, StoreStats};
use crate::layout::{AlarmLevel, DeviceType};
use crate::poller::{DeviceHealth, WriterStatsSnapshot};
use crate::report::{device_history, last_days, local_midnight, TimeWindow, MAX_HISTORY_POINTS};

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::broadcast;

/// Longest range a single report may cover.
const MAX_REPORT_DAYS: i64 = 366;

// ============================================================================
// Health and status
// ============================================================================

pub async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    let devices = state.poller.health.snapshot();
    let stale = devices.iter().filter(|d| d.stale).count();
    Json(serde_json::json!({
        "status": "ok",
        "devices": devices.len(),
        "stale": stale,
    }))
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub simulate: bool,
    pub poll_interval_secs: f64,
    pub counter_reset: String,
    pub devices_total: usize,
    pub devices_stale: usize,
    pub writer: WriterStatsSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<StoreStats>,
    pub db_size: String,
    pub devices: Vec<DeviceHealth>,
}

pub async fn handle_status(State(state): State<AppState>) -> impl IntoResponse {
    let store = state.store.clone();
    let stats = match tokio::task::spawn_blocking(move || store.get_stats()).await {
        Ok(Ok(stats)) => Some(stats),
        Ok(Err(e)) => {
            tracing::warn!("Failed to read store stats: {}", e);
            None
        }
        Err(e) => {
            tracing::warn!("Store stats task failed: {}", e);
            None
        }
    };

    let devices = state.poller.health.snapshot();
    Json(StatusResponse {
        simulate: state.config.simulate,
        poll_interval_secs: state.config.poll_interval_secs,
        counter_reset: state.config.counter_reset.to_string(),
        devices_total: devices.len(),
        devices_stale: devices.iter().filter(|d| d.stale).count(),
        writer: state.poller.writer_stats.snapshot(),
        db_size: format_bytes(stats.as_ref().map_or(0, |s| s.db_size_bytes)),
        store: stats,
        devices,
    })
}

fn format_bytes(bytes: i64) -> String {
    const KB: i64 = 1024;
    const MB: i64 = KB * 1024;
    const GB: i64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

// ============================================================================
// API: Latest values
// ============================================================================

#[derive(Debug, Serialize)]
pub struct LatestReading {
    pub device_id: String,
    pub device_type: DeviceType,
    pub stale: bool,
    pub last_success: Option<DateTime<Utc>>,
    pub values: BTreeMap<String, f64>,
    pub modules: BTreeMap<String, ModuleStatus>,
}

pub async fn handle_latest(State(state): State<AppState>) -> impl IntoResponse {
    let latest: Vec<LatestReading> = state
        .poller
        .health
        .snapshot()
        .into_iter()
        .map(|h| LatestReading {
            device_id: h.device_id,
            device_type: h.device_type,
            stale: h.stale,
            last_success: h.last_success,
            values: h.latest,
            modules: h.modules,
        })
        .collect();
    Json(latest)
}

// ============================================================================
// API: Reports
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct ReportQuery {
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
    /// Whole local days back from today, today included.
    #[serde(default)]
    pub days: Option<u32>,
    /// Comma-separated device categories; all when absent.
    #[serde(default)]
    pub categories: Option<String>,
}

pub async fn handle_report(
    State(state): State<AppState>,
    Query(query): Query<ReportQuery>,
) -> impl IntoResponse {
    let offset = state.aggregator.settings().utc_offset;
    let range = match resolve_range(&query, Utc::now(), offset) {
        Ok(range) => range,
        Err(e) => return (StatusCode::BAD_REQUEST, e).into_response(),
    };
    let categories = match parse_categories(query.categories.as_deref()) {
        Ok(categories) => categories,
        Err(e) => return (StatusCode::BAD_REQUEST, e).into_response(),
    };

    let reports = state.aggregator.build_report(&categories, range).await;
    Json(reports).into_response()
}

/// Report range from either `start`/`end` or `days`. Defaults to today.
pub fn resolve_range(
    query: &ReportQuery,
    now: DateTime<Utc>,
    offset: FixedOffset,
) -> Result<TimeWindow, String> {
    let range = if query.start.is_some() || query.end.is_some() {
        let start = query
            .start
            .as_deref()
            .ok_or_else(|| "start is required when end is given".to_string())
            .and_then(|s| parse_time(s, offset))?;
        let end = match query.end.as_deref() {
            Some(s) => parse_time(s, offset)?,
            None => now,
        };
        TimeWindow::new(start, end).ok_or_else(|| "start must be before end".to_string())?
    } else {
        let days = query.days.unwrap_or(1);
        last_days(now, days, offset).ok_or_else(|| "days must be at least 1".to_string())?
    };

    if range.duration() > chrono::Duration::days(MAX_REPORT_DAYS) {
        return Err(format!("range exceeds {} days", MAX_REPORT_DAYS));
    }
    Ok(range)
}

/// RFC 3339, or a local date/time without offset.
fn parse_time(s: &str, offset: FixedOffset) -> Result<DateTime<Utc>, String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            if let Some(local) = offset.from_local_datetime(&naive).single() {
                return Ok(local.with_timezone(&Utc));
            }
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Ok(local_midnight(date, offset));
    }
    Err(format!("invalid time: {}", s))
}

fn parse_categories(raw: Option<&str>) -> Result<Vec<DeviceType>, String> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::parse)
        .collect()
}

// ============================================================================
// API: History
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    pub device: String,
    pub field: String,
    /// Defaults to 24 hours before `end`.
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
    /// Bucket length such as `30s`, `5m` or `1h`; `raw` for stored samples.
    #[serde(default)]
    pub interval: Option<String>,
    /// Only samples strictly above this value.
    #[serde(default)]
    pub above: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub device_id: String,
    pub field: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub interval_secs: Option<i64>,
    pub points: Vec<crate::db::Sample>,
}

pub async fn handle_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> impl IntoResponse {
    let table = state.layout.current();
    let Some(device) = table.device(&query.device) else {
        return (
            StatusCode::NOT_FOUND,
            format!("unknown device: {}", query.device),
        )
            .into_response();
    };
    if !device.fields.iter().any(|f| f.name == query.field && !f.is_status()) {
        return (
            StatusCode::BAD_REQUEST,
            format!("{} has no field {}", query.device, query.field),
        )
            .into_response();
    }

    let offset = state.aggregator.settings().utc_offset;
    let window = match history_window(&query, Utc::now(), offset) {
        Ok(window) => window,
        Err(e) => return (StatusCode::BAD_REQUEST, e).into_response(),
    };
    let every = match query.interval.as_deref().map(parse_interval).transpose() {
        Ok(every) => every.unwrap_or(Some(chrono::Duration::minutes(1))),
        Err(e) => return (StatusCode::BAD_REQUEST, e).into_response(),
    };
    let buckets = every.map(|e| window.duration().num_seconds() / e.num_seconds().max(1));
    if buckets.is_some_and(|n| n > MAX_HISTORY_POINTS) {
        return (
            StatusCode::BAD_REQUEST,
            format!("interval too small: more than {} points", MAX_HISTORY_POINTS),
        )
            .into_response();
    }
    let filter = match query.above {
        Some(bound) if bound.is_finite() => SampleFilter::Above(bound),
        Some(_) => return (StatusCode::BAD_REQUEST, "above must be finite").into_response(),
        None => SampleFilter::All,
    };

    let store = state.store.clone();
    let (device_id, field) = (query.device, query.field);
    let task_device = device_id.clone();
    let task_field = field.clone();
    let result = tokio::task::spawn_blocking(move || {
        device_history(&*store, &task_device, &task_field, &window, filter, every)
    })
    .await;

    match result {
        Ok(Ok(points)) => Json(HistoryResponse {
            device_id,
            field,
            start: window.start,
            end: window.end,
            interval_secs: every.map(|e| e.num_seconds()),
            points,
        })
        .into_response(),
        Ok(Err(e)) => {
            tracing::error!("History query for {} failed: {}", device_id, e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

fn history_window(
    query: &HistoryQuery,
    now: DateTime<Utc>,
    offset: FixedOffset,
) -> Result<TimeWindow, String> {
    let end = match query.end.as_deref() {
        Some(s) => parse_time(s, offset)?,
        None => now,
    };
    let start = match query.start.as_deref() {
        Some(s) => parse_time(s, offset)?,
        None => end - chrono::Duration::hours(24),
    };
    let window = TimeWindow::new(start, end).ok_or_else(|| "start must be before end".to_string())?;
    if window.duration() > chrono::Duration::days(MAX_REPORT_DAYS) {
        return Err(format!("range exceeds {} days", MAX_REPORT_DAYS));
    }
    Ok(window)
}

/// `30s`, `5m`, `1h` or `1d`; `raw` means no bucketing.
fn parse_interval(s: &str) -> Result<Option<chrono::Duration>, String> {
    let s = s.trim();
    if s == "raw" {
        return Ok(None);
    }
    let invalid = || format!("invalid interval: {}", s);
    let unit = s.chars().last().ok_or_else(invalid)?;
    let amount: i64 = s[..s.len() - unit.len_utf8()]
        .parse()
        .map_err(|_| invalid())?;
    if amount <= 0 {
        return Err(invalid());
    }
    let every = match unit {
        's' => chrono::Duration::try_seconds(amount),
        'm' => chrono::Duration::try_minutes(amount),
        'h' => chrono::Duration::try_hours(amount),
        'd' => chrono::Duration::try_days(amount),
        _ => None,
    };
    every.map(Some).ok_or_else(invalid)
}

// ============================================================================
// API: Feeding records
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct FeedingQuery {
    pub device: String,
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
    #[serde(default)]
    pub days: Option<u32>,
}

pub async fn handle_feeding(
    State(state): State<AppState>,
    Query(query): Query<FeedingQuery>,
) -> impl IntoResponse {
    let table = state.layout.current();
    match table.device(&query.device) {
        Some(device) if device.device_type.facets().feeding => {}
        Some(_) => {
            return (
                StatusCode::BAD_REQUEST,
                format!("{} has no weighing module", query.device),
            )
                .into_response()
        }
        None => {
            return (
                StatusCode::NOT_FOUND,
                format!("unknown device: {}", query.device),
            )
                .into_response()
        }
    }

    let range_query = ReportQuery {
        start: query.start,
        end: query.end,
        days: query.days,
        categories: None,
    };
    let offset = state.aggregator.settings().utc_offset;
    let window = match resolve_range(&range_query, Utc::now(), offset) {
        Ok(window) => window,
        Err(e) => return (StatusCode::BAD_REQUEST, e).into_response(),
    };

    let store = state.store.clone();
    let device_id = query.device;
    match tokio::task::spawn_blocking(move || store.get_feeding_records(&device_id, &window)).await
    {
        Ok(Ok(records)) => Json(records).into_response(),
        Ok(Err(e)) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

// ============================================================================
// API: Alarms
// ============================================================================

/// Largest `limit` accepted by the alarm listing.
const MAX_ALARM_RECORDS: usize = 1000;

#[derive(Debug, Default, Deserialize)]
pub struct AlarmRecordsQuery {
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
    #[serde(default)]
    pub days: Option<u32>,
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub device: Option<String>,
    /// Matches fields starting with this prefix.
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Newest first.
pub async fn handle_alarm_records(
    State(state): State<AppState>,
    Query(query): Query<AlarmRecordsQuery>,
) -> impl IntoResponse {
    let level = match query.level.as_deref().map(str::parse::<AlarmLevel>).transpose() {
        Ok(level) => level,
        Err(e) => return (StatusCode::BAD_REQUEST, e).into_response(),
    };
    let limit = query.limit.unwrap_or(AlarmQuery::default().limit);
    if !(1..=MAX_ALARM_RECORDS).contains(&limit) {
        return (
            StatusCode::BAD_REQUEST,
            format!("limit must be between 1 and {}", MAX_ALARM_RECORDS),
        )
            .into_response();
    }

    let range_query = ReportQuery {
        start: query.start,
        end: query.end,
        days: query.days,
        categories: None,
    };
    let offset = state.aggregator.settings().utc_offset;
    let window = match resolve_range(&range_query, Utc::now(), offset) {
        Ok(window) => window,
        Err(e) => return (StatusCode::BAD_REQUEST, e).into_response(),
    };

    let filter = AlarmQuery {
        level,
        device_id: query.device,
        field_prefix: query.field.filter(|f| !f.is_empty()),
        limit,
    };
    let store = state.store.clone();
    match tokio::task::spawn_blocking(move || store.query_alarms(&window, &filter)).await {
        Ok(Ok(events)) => Json(events).into_response(),
        Ok(Err(e)) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct AlarmCountQuery {
    /// Look-back in hours, 1 to 168 (default: 24).
    #[serde(default)]
    pub hours: Option<u32>,
}

pub async fn handle_alarm_count(
    State(state): State<AppState>,
    Query(query): Query<AlarmCountQuery>,
) -> impl IntoResponse {
    let hours = query.hours.unwrap_or(24);
    if !(1..=168).contains(&hours) {
        return (StatusCode::BAD_REQUEST, "hours must be between 1 and 168").into_response();
    }
    let now = Utc::now();
    let Some(window) = TimeWindow::new(now - chrono::Duration::hours(i64::from(hours)), now) else {
        return (StatusCode::BAD_REQUEST, "empty window").into_response();
    };

    let store = state.store.clone();
    match tokio::task::spawn_blocking(move || store.alarm_counts(&window)).await {
        Ok(Ok(counts)) => Json(counts).into_response(),
        Ok(Err(e)) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

pub async fn handle_alarm_limits(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.layout.current().alarm_limits().to_vec())
}

// ============================================================================
// API: Layout
// ============================================================================

pub async fn handle_layout_reload(State(state): State<AppState>) -> impl IntoResponse {
    let Some(path) = state.config.plant_path.clone() else {
        return (
            StatusCode::BAD_REQUEST,
            "No plant file configured (KILNWATCH_PLANT_PATH)",
        )
            .into_response();
    };

    let layout = state.layout.clone();
    match tokio::task::spawn_blocking(move || layout.reload_from_file(&path)).await {
        Ok(Ok(devices)) => {
            state.layout_version.send_modify(|v| *v += 1);
            Json(serde_json::json!({ "devices": devices })).into_response()
        }
        Ok(Err(e)) => {
            tracing::warn!("Layout reload rejected: {}", e);
            (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()).into_response()
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

// ============================================================================
// Live readings
// ============================================================================

pub async fn handle_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let rx = state.poller.live.subscribe();
    ws.on_upgrade(move |socket| stream_live(socket, rx))
}

async fn stream_live(mut socket: WebSocket, mut rx: broadcast::Receiver<SensorReading>) {
    loop {
        tokio::select! {
            reading = rx.recv() => {
                match reading {
                    Ok(reading) => {
                        let json = match serde_json::to_string(&reading) {
                            Ok(json) => json,
                            Err(e) => {
                                tracing::error!("Failed to encode reading: {}", e);
                                continue;
                            }
                        };
                        if socket.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!("Live subscriber lagged, skipped {} readings", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}
