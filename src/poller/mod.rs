//! Polling orchestrator.
//!
//! One task per controller reads its blocks in sequence on a fixed interval,
//! decodes them and hands the readings to a batching writer and to live
//! subscribers. Controllers are polled independently of each other.

mod alarm;
mod feeding;
mod health;

pub use alarm::*;
pub use feeding::*;
pub use health::*;

use crate::codec::{self, DecodedBlock};
use crate::db::{AlarmEvent, FeedingRecord, SensorReading, TimeSeriesStore, WriteBatch};
use crate::fieldbus::{FieldBus, FieldBusError};
use crate::layout::{DeviceDescriptor, LayoutHandle, LayoutTable, WEIGHT};

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, RwLock};

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub interval: Duration,
    pub read_timeout: Duration,
    /// How often the writer flushes its buffer.
    pub flush_interval: Duration,
    /// Buffered points that force an early flush.
    pub flush_threshold: usize,
    /// Failed flushes of one buffer before it is dropped.
    pub max_write_retries: u32,
    /// Quiet period before a standing alarm is raised again.
    pub alarm_repeat: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(6),
            read_timeout: Duration::from_secs(5),
            flush_interval: Duration::from_secs(2),
            flush_threshold: 500,
            max_write_retries: 3,
            alarm_repeat: Duration::from_secs(60),
        }
    }
}

/// Messages consumed by the batch writer.
#[derive(Debug, Clone)]
pub enum WriterMessage {
    Readings(Vec<SensorReading>),
    Feeding(FeedingRecord),
    Alarm(AlarmEvent),
}

/// Poller state shared with the web layer.
#[derive(Clone)]
pub struct PollerHandles {
    pub health: Arc<HealthRegistry>,
    pub writer_stats: Arc<WriterStats>,
    pub live: broadcast::Sender<SensorReading>,
}

impl PollerHandles {
    pub fn new() -> Self {
        let (live, _) = broadcast::channel(1024);
        Self {
            health: Arc::new(HealthRegistry::new()),
            writer_stats: Arc::new(WriterStats::default()),
            live,
        }
    }
}

impl Default for PollerHandles {
    fn default() -> Self {
        Self::new()
    }
}

/// Drives all controller loops.
pub struct Poller<B: FieldBus> {
    bus: Arc<B>,
    layout: LayoutHandle,
    config: PollerConfig,
    handles: PollerHandles,
    stop_chans: Arc<RwLock<HashMap<String, broadcast::Sender<()>>>>,
    writer_tx: mpsc::Sender<WriterMessage>,
}

impl<B: FieldBus> Poller<B> {
    /// Create a poller and start its batch writer.
    pub fn new<S: TimeSeriesStore>(
        bus: Arc<B>,
        store: Arc<S>,
        layout: LayoutHandle,
        config: PollerConfig,
        handles: PollerHandles,
    ) -> Self {
        let (tx, rx) = mpsc::channel(1000);

        tokio::spawn(run_batch_writer(
            rx,
            store,
            handles.writer_stats.clone(),
            config.clone(),
        ));

        Self {
            bus,
            layout,
            config,
            handles,
            stop_chans: Arc::new(RwLock::new(HashMap::new())),
            writer_tx: tx,
        }
    }

    /// Start a loop for every configured controller.
    pub async fn start(&self) {
        let table = self.layout.current();
        tracing::info!(
            "Starting poller: {} controllers, {} devices, every {:?}",
            table.controllers().count(),
            table.devices().count(),
            self.config.interval
        );
        self.sync_controllers().await;
    }

    /// Match running loops to the active layout: new controllers are started,
    /// removed ones stopped. Call after a layout reload.
    pub async fn sync_controllers(&self) {
        let table = self.layout.current();
        register_devices(&self.handles.health, &table);

        let configured: BTreeSet<String> = table.controllers().map(|c| c.id.clone()).collect();
        let running: Vec<String> = self.stop_chans.read().await.keys().cloned().collect();

        for id in running.iter().filter(|id| !configured.contains(*id)) {
            self.remove_controller(id).await;
        }
        for id in configured {
            self.add_controller(&id).await;
        }
    }

    async fn add_controller(&self, controller_id: &str) {
        let mut stop_chans = self.stop_chans.write().await;

        if stop_chans.contains_key(controller_id) {
            return;
        }

        let (stop_tx, _) = broadcast::channel(1);
        stop_chans.insert(controller_id.to_string(), stop_tx.clone());
        drop(stop_chans);

        tracing::info!("Poller: Adding controller {}", controller_id);

        let worker = ControllerWorker {
            controller_id: controller_id.to_string(),
            bus: self.bus.clone(),
            layout: self.layout.clone(),
            config: self.config.clone(),
            handles: self.handles.clone(),
            writer_tx: self.writer_tx.clone(),
            session: None,
            detectors: HashMap::new(),
            alarms: AlarmChecker::new(self.config.alarm_repeat),
        };
        let id = controller_id.to_string();
        let stop_chans = self.stop_chans.clone();

        tokio::spawn(async move {
            worker.run(stop_tx.subscribe()).await;

            let mut chans = stop_chans.write().await;
            chans.remove(&id);
        });
    }

    async fn remove_controller(&self, controller_id: &str) {
        let mut stop_chans = self.stop_chans.write().await;

        if let Some(stop_tx) = stop_chans.remove(controller_id) {
            let _ = stop_tx.send(());
            tracing::info!("Poller: Removed controller {}", controller_id);
        }
    }

    /// Stop every controller loop.
    pub async fn stop(&self) {
        let mut stop_chans = self.stop_chans.write().await;
        for (_, stop_tx) in stop_chans.drain() {
            let _ = stop_tx.send(());
        }
    }
}

fn register_devices(health: &HealthRegistry, table: &LayoutTable) {
    let ids: BTreeSet<String> = table
        .devices()
        .filter(|d| !d.is_derived())
        .map(|d| d.device_id.clone())
        .collect();
    health.retain(&ids);
    for device in table.devices().filter(|d| !d.is_derived()) {
        health.register(&device.device_id, device.device_type);
    }
}

/// Poll loop state for one controller.
struct ControllerWorker<B: FieldBus> {
    controller_id: String,
    bus: Arc<B>,
    layout: LayoutHandle,
    config: PollerConfig,
    handles: PollerHandles,
    writer_tx: mpsc::Sender<WriterMessage>,
    /// Dropped on any failure so the next tick reconnects.
    session: Option<B::Session>,
    detectors: HashMap<String, FeedingDetector>,
    alarms: AlarmChecker,
}

impl<B: FieldBus> ControllerWorker<B> {
    async fn run(mut self, mut stop_rx: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = stop_rx.recv() => {
                    break;
                }
                _ = interval.tick() => {
                    self.poll_once().await;
                }
            }
        }
    }

    /// One cycle: read every block of this controller, in order.
    async fn poll_once(&mut self) {
        let table = self.layout.current();
        let controller_id = self.controller_id.clone();
        let Some(controller) = table.controller(&controller_id) else {
            return;
        };

        if self.session.is_none() {
            match tokio::time::timeout(self.config.read_timeout, self.bus.connect(controller)).await
            {
                Ok(Ok(session)) => {
                    tracing::info!("Connected to {} ({})", controller.id, controller.address);
                    self.session = Some(session);
                }
                Ok(Err(e)) => {
                    self.fail_controller(&table, &e.to_string());
                    return;
                }
                Err(_) => {
                    let e = FieldBusError::Connection {
                        controller: controller.id.clone(),
                        reason: format!("timed out after {:?}", self.config.read_timeout),
                    };
                    self.fail_controller(&table, &e.to_string());
                    return;
                }
            }
        }

        for block in table.blocks_for_controller(&controller_id) {
            let devices: Vec<&DeviceDescriptor> = table.devices_in_block(block.block_id).collect();
            if devices.is_empty() {
                continue;
            }
            for device in &devices {
                self.handles
                    .health
                    .set_state(&device.device_id, PollState::Reading);
            }

            let Some(session) = self.session.as_mut() else {
                self.fail_devices(&devices, "not connected");
                continue;
            };

            let read = tokio::time::timeout(
                self.config.read_timeout,
                self.bus
                    .read_block(session, block.block_id, block.offset, block.length),
            )
            .await
            .unwrap_or(Err(FieldBusError::Timeout {
                block_id: block.block_id,
                timeout: self.config.read_timeout,
            }));

            match read {
                Ok(raw) => {
                    if raw.len() < block.length {
                        tracing::warn!(
                            "{}",
                            FieldBusError::ShortRead {
                                block_id: block.block_id,
                                expected: block.length,
                                got: raw.len(),
                            }
                        );
                    }
                    self.publish_block(block.block_id, &raw, &devices, Utc::now())
                        .await;
                }
                Err(e) => {
                    tracing::warn!("{}: {}", controller_id, e);
                    self.session = None;
                    self.fail_devices(&devices, &e.to_string());
                }
            }
        }
    }

    /// Decode, queue for the store, then fan out to live subscribers.
    async fn publish_block(
        &mut self,
        block_id: u16,
        raw: &[u8],
        devices: &[&DeviceDescriptor],
        now: DateTime<Utc>,
    ) {
        let table = self.layout.current();
        let feeding_thresholds = table.feeding();
        let mut readings = Vec::new();
        let mut feedings = Vec::new();
        let mut alarms = Vec::new();

        for device in devices {
            let decoded = codec::decode(block_id, raw, &device.fields);
            for e in &decoded.errors {
                tracing::warn!("{}: {}", device.device_id, e);
            }

            self.handles.health.record_success(
                &device.device_id,
                now,
                &decoded.fields,
                &decoded.status,
                decoded.errors.len(),
            );
            self.handles
                .health
                .set_state(&device.device_id, PollState::Idle);

            if let Some(&weight) = decoded.fields.get(WEIGHT) {
                let detector = self
                    .detectors
                    .entry(device.device_id.clone())
                    .or_insert_with(|| FeedingDetector::new(&device.device_id, feeding_thresholds));
                if let Some(record) = detector.observe(now, weight) {
                    tracing::info!(
                        "{} refilled with {:.1} kg",
                        record.device_id,
                        record.added_weight
                    );
                    feedings.push(record);
                }
            }

            for event in self.alarms.check(&table, device, &decoded.fields, now) {
                tracing::warn!(
                    "{} {} {} = {:.1} (limit {:.1})",
                    event.device_id,
                    event.level,
                    event.field,
                    event.value,
                    event.threshold
                );
                alarms.push(event);
            }

            readings.extend(readings_by_module(device, &decoded, now));
        }

        if readings.is_empty() && feedings.is_empty() && alarms.is_empty() {
            return;
        }

        if self
            .writer_tx
            .send(WriterMessage::Readings(readings.clone()))
            .await
            .is_err()
        {
            tracing::error!("Batch writer closed, dropping readings of block {}", block_id);
            return;
        }
        for record in feedings {
            let _ = self.writer_tx.send(WriterMessage::Feeding(record)).await;
        }
        for event in alarms {
            let _ = self.writer_tx.send(WriterMessage::Alarm(event)).await;
        }

        for reading in readings {
            // no subscribers is fine
            let _ = self.handles.live.send(reading);
        }
    }

    fn fail_devices(&self, devices: &[&DeviceDescriptor], error: &str) {
        for device in devices {
            self.handles.health.record_failure(&device.device_id, error);
            self.handles
                .health
                .set_state(&device.device_id, PollState::Idle);
        }
    }

    fn fail_controller(&self, table: &LayoutTable, error: &str) {
        tracing::warn!("{}: {}", self.controller_id, error);
        for block in table.blocks_for_controller(&self.controller_id) {
            let devices: Vec<&DeviceDescriptor> = table.devices_in_block(block.block_id).collect();
            self.fail_devices(&devices, error);
        }
    }
}

/// One reading per sub-module that produced at least one value.
pub fn readings_by_module(
    device: &DeviceDescriptor,
    decoded: &DecodedBlock,
    timestamp: DateTime<Utc>,
) -> Vec<SensorReading> {
    let mut modules: BTreeMap<&str, BTreeMap<String, f64>> = BTreeMap::new();
    for field in device.fields.iter().filter(|f| !f.is_status()) {
        if let Some(&value) = decoded.fields.get(&field.name) {
            modules
                .entry(field.module.as_str())
                .or_default()
                .insert(field.name.clone(), value);
        }
    }

    modules
        .into_iter()
        .map(|(module, fields)| SensorReading {
            device_id: device.device_id.clone(),
            timestamp,
            device_type: device.device_type,
            module_tag: module.to_string(),
            fields,
        })
        .collect()
}

/// Run the batch writer that accumulates and flushes readings, feeding
/// records and alarm events.
async fn run_batch_writer<S: TimeSeriesStore>(
    mut rx: mpsc::Receiver<WriterMessage>,
    store: Arc<S>,
    stats: Arc<WriterStats>,
    config: PollerConfig,
) {
    let mut buffer = WriteBuffer::default();
    let mut interval = tokio::time::interval(config.flush_interval);
    let retries = config.max_write_retries;

    loop {
        tokio::select! {
            msg = rx.recv() => {
                match msg {
                    Some(WriterMessage::Readings(readings)) => {
                        buffer.batch.readings.extend(readings);
                        if buffer.batch.point_count() >= config.flush_threshold {
                            flush_buffer(store.as_ref(), &stats, &mut buffer, retries);
                        }
                    }
                    Some(WriterMessage::Feeding(record)) => buffer.batch.feedings.push(record),
                    Some(WriterMessage::Alarm(event)) => buffer.batch.alarms.push(event),
                    None => {
                        // Channel closed, flush remaining and exit
                        flush_buffer(store.as_ref(), &stats, &mut buffer, retries);
                        break;
                    }
                }
            }
            _ = interval.tick() => {
                flush_buffer(store.as_ref(), &stats, &mut buffer, retries);
            }
        }
    }
}

#[derive(Default)]
struct WriteBuffer {
    batch: WriteBatch,
    failed_attempts: u32,
}

impl WriteBuffer {
    fn clear(&mut self) {
        self.batch.clear();
        self.failed_attempts = 0;
    }
}

/// Write the buffer as one batch. A failed batch leaves nothing in the store
/// and is kept for the next flush until it has failed `max_retries` times,
/// then dropped.
fn flush_buffer<S: TimeSeriesStore + ?Sized>(
    store: &S,
    stats: &WriterStats,
    buffer: &mut WriteBuffer,
    max_retries: u32,
) {
    if buffer.batch.is_empty() {
        return;
    }

    match store.write_batch(&buffer.batch) {
        Ok(points) => {
            let batch = &buffer.batch;
            stats.record_flush(points, batch.feedings.len(), batch.alarms.len());
            buffer.clear();
        }
        Err(e) => {
            buffer.failed_attempts += 1;
            stats.record_failure();
            tracing::error!(
                "Failed to flush {} points (attempt {}/{}): {}",
                buffer.batch.point_count(),
                buffer.failed_attempts,
                max_retries,
                e
            );
            if buffer.failed_attempts >= max_retries {
                let dropped = buffer.batch.point_count();
                tracing::error!(
                    "Dropping {} points after {} failed flushes",
                    dropped,
                    max_retries
                );
                stats.record_dropped(dropped);
                buffer.clear();
            }
        }
    }
}
