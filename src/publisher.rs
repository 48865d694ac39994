//! Batched telemetry publishing with start/pause/resume/stop control.
//!
//! The publisher owns a background thread that reads framed telegrams from
//! the link, decodes them through the external decoder seam, batches the
//! resulting high-frequency records and ships them to the broker as
//! compressed binary payloads. Environment frames go out individually on
//! their own topic and their own cadence. Telemetry is best effort: a failed
//! publish is logged and its records are dropped, in contrast to the
//! lossless disk logging path.
//!
//! Lifecycle is `Stopped -> Active <-> Paused -> Stopped`. Pausing parks the
//! thread on a gate at the top of its loop (a blocking wait, not a spin);
//! stopping releases the gate so a paused thread can observe the stop flag
//! and exit. On the way out the thread flushes any partial batch and
//! releases the broker connection, whether the loop ended normally or not,
//! so no buffered sample is silently discarded within a run.

use crate::auxiliary::AuxiliarySource;
use crate::broker::{self, BrokerSink, MqttSink};
use crate::config::PublisherSettings;
use crate::error::{AppResult, SensorError};
use crate::frame::{self, DecodedFrame, TelegramDecoder};
use crate::link::SharedLink;
use crate::records::{self, EnvRecord, HighFreqRecord};
use log::{debug, info, trace, warn};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Bound on one telegram read cycle; an empty cycle completes the iteration
/// so the loop re-checks its control flags.
const READ_WINDOW: Duration = Duration::from_millis(500);

/// How long [`TelemetryPublisher::stop`] waits for the thread to exit.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Publisher lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublisherState {
    /// No task is running.
    Stopped,
    /// The task is reading, batching and publishing.
    Active,
    /// The task is parked at the pause gate.
    Paused,
}

/// Gate the task blocks on while paused. Opening wakes the waiter; no
/// busy-spinning happens at the suspension point.
struct PauseGate {
    open: Mutex<bool>,
    condvar: Condvar,
}

impl PauseGate {
    fn new() -> Self {
        Self {
            open: Mutex::new(true),
            condvar: Condvar::new(),
        }
    }

    fn close(&self) {
        *self.open.lock() = false;
    }

    fn open(&self) {
        let mut open = self.open.lock();
        *open = true;
        self.condvar.notify_all();
    }

    fn is_closed(&self) -> bool {
        !*self.open.lock()
    }

    fn wait_until_open(&self) {
        let mut open = self.open.lock();
        while !*open {
            self.condvar.wait(&mut open);
        }
    }
}

struct PublisherShared {
    stop: AtomicBool,
    gate: PauseGate,
    sample_count: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl PublisherShared {
    fn record_error(&self, message: String) {
        *self.last_error.lock() = Some(message);
    }
}

/// Handle to the telemetry publishing task. One instance per sensor id.
pub struct TelemetryPublisher {
    settings: PublisherSettings,
    shared: Arc<PublisherShared>,
    handle: Option<JoinHandle<()>>,
}

impl TelemetryPublisher {
    /// Creates a stopped publisher for the given settings.
    pub fn new(settings: PublisherSettings) -> Self {
        Self {
            settings,
            shared: Arc::new(PublisherShared {
                stop: AtomicBool::new(false),
                gate: PauseGate::new(),
                sample_count: AtomicU64::new(0),
                last_error: Mutex::new(None),
            }),
            handle: None,
        }
    }

    /// Connects to the configured MQTT broker and starts the task.
    ///
    /// Refuses when already running. If the broker or the decoder setup
    /// fails, whatever was acquired is released and no task is launched.
    pub fn start(
        &mut self,
        link: SharedLink,
        decoder: Box<dyn TelegramDecoder>,
        aux: Box<dyn AuxiliarySource>,
    ) -> AppResult<()> {
        if self.is_running() {
            return Err(SensorError::AlreadyRunning);
        }
        let sink = MqttSink::connect(&self.settings).map_err(|e| {
            self.shared.record_error(e.to_string());
            e
        })?;
        self.start_with_sink(link, decoder, aux, Box::new(sink))
    }

    /// Starts the task against an already-connected broker sink.
    ///
    /// The seam for broker implementations other than MQTT, and for tests.
    pub fn start_with_sink(
        &mut self,
        link: SharedLink,
        mut decoder: Box<dyn TelegramDecoder>,
        aux: Box<dyn AuxiliarySource>,
        mut sink: Box<dyn BrokerSink>,
    ) -> AppResult<()> {
        if self.is_running() {
            return Err(SensorError::AlreadyRunning);
        }

        if let Err(e) = decoder.init() {
            let message = format!("decoder setup failed: {e}");
            self.shared.record_error(message.clone());
            // release the broker connection acquired for this attempt
            if let Err(e) = sink.disconnect() {
                warn!("Broker disconnect after failed setup: {e}");
            }
            return Err(SensorError::ConnectionSetup(message));
        }

        self.shared.stop.store(false, Ordering::SeqCst);
        self.shared.gate.open();
        self.shared.sample_count.store(0, Ordering::SeqCst);
        *self.shared.last_error.lock() = None;

        let settings = self.settings.clone();
        let shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name("telemetry-publisher".to_string())
            .spawn(move || run_loop(&settings, &link, decoder, aux, sink, &shared))?;
        self.handle = Some(handle);
        Ok(())
    }

    /// Pauses publishing; the task parks at its gate after the current
    /// iteration.
    pub fn pause(&self) -> AppResult<()> {
        if !self.is_running() {
            return Err(SensorError::NotRunning);
        }
        self.shared.gate.close();
        info!("Telemetry publishing paused");
        Ok(())
    }

    /// Resumes a paused task.
    pub fn resume(&self) -> AppResult<()> {
        if !self.is_running() {
            return Err(SensorError::NotRunning);
        }
        self.shared.gate.open();
        info!("Telemetry publishing resumed");
        Ok(())
    }

    /// Stops the task and waits up to five seconds for it to exit.
    ///
    /// The pause gate is released first so a paused task can observe the
    /// stop. A task that does not exit in time is left running and reported
    /// as stuck.
    pub fn stop(&mut self) -> AppResult<()> {
        let Some(handle) = self.handle.take() else {
            return Err(SensorError::NotRunning);
        };
        info!("Stopping telemetry publisher");
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.gate.open();

        let deadline = Instant::now() + STOP_TIMEOUT;
        while !handle.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        if !handle.is_finished() {
            warn!("Publisher task did not stop within {STOP_TIMEOUT:?}");
            self.handle = Some(handle);
            return Err(SensorError::PublisherStuck(STOP_TIMEOUT));
        }
        if handle.join().is_err() {
            let message = "publisher task panicked".to_string();
            self.shared.record_error(message);
        }
        Ok(())
    }

    /// Whether the task is alive.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Whether the task is alive and parked at the pause gate.
    pub fn is_paused(&self) -> bool {
        self.is_running() && self.shared.gate.is_closed()
    }

    /// Reports the lifecycle state.
    pub fn state(&self) -> PublisherState {
        if !self.is_running() {
            PublisherState::Stopped
        } else if self.shared.gate.is_closed() {
            PublisherState::Paused
        } else {
            PublisherState::Active
        }
    }

    /// High-frequency samples batched since the task started.
    pub fn sample_count(&self) -> u64 {
        self.shared.sample_count.load(Ordering::SeqCst)
    }

    /// Most recent fatal condition, if any.
    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.lock().clone()
    }
}

impl Drop for TelemetryPublisher {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.gate.open();
    }
}

/// Nanoseconds since the Unix epoch.
fn timestamp_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

fn run_loop(
    settings: &PublisherSettings,
    link: &SharedLink,
    mut decoder: Box<dyn TelegramDecoder>,
    mut aux: Box<dyn AuxiliarySource>,
    mut sink: Box<dyn BrokerSink>,
    shared: &PublisherShared,
) {
    let data_topic = broker::data_topic(settings.sensor_id);
    let env_topic = broker::env_topic(settings.sensor_id);
    let sample_interval = Duration::from_secs_f64(1.0 / settings.sample_rate.max(1) as f64);
    let env_interval = Duration::from_secs_f64(1.0 / settings.env_sample_rate.max(f64::MIN_POSITIVE));

    let mut batch: Vec<HighFreqRecord> = Vec::with_capacity(settings.sample_rate);
    let mut last_env: Option<Instant> = None;

    info!(
        "Telemetry publisher started (sensor {}, {} Hz data, {} Hz environment)",
        settings.sensor_id, settings.sample_rate, settings.env_sample_rate
    );

    while !shared.stop.load(Ordering::SeqCst) {
        shared.gate.wait_until_open();
        // a stop issued while paused must exit before any further I/O
        if shared.stop.load(Ordering::SeqCst) {
            break;
        }

        let iteration_start = Instant::now();
        let stamp = timestamp_ns();

        match frame::read_telegram(link, READ_WINDOW) {
            Ok(Some(telegram)) => match decoder.decode(&telegram) {
                DecodedFrame::Strain(strain) => {
                    let extra = aux.sample();
                    batch.push(HighFreqRecord {
                        strain_x: strain.x,
                        strain_y: strain.y,
                        strain_z: strain.z,
                        strain_p1: extra.principal_1,
                        strain_p2: extra.principal_2,
                        strain_pdeg: extra.principal_angle_deg,
                        accel_x: extra.accel_x,
                        accel_y: extra.accel_y,
                        accel_z: extra.accel_z,
                        timestamp_ns: stamp,
                    });
                    shared.sample_count.fetch_add(1, Ordering::SeqCst);
                }
                DecodedFrame::Environment(env) => {
                    let due = last_env.map_or(true, |t| t.elapsed() >= env_interval);
                    if due {
                        let record = EnvRecord {
                            v_batt: env.v_batt,
                            temperature: env.temperature,
                            humidity: env.humidity,
                            pressure: env.pressure,
                            timestamp_ns: stamp,
                            sensor_id: settings.sensor_id,
                        };
                        publish_env(&mut sink, &env_topic, &record);
                        // reset the cadence whether or not the publish landed
                        last_env = Some(Instant::now());
                    }
                }
                DecodedFrame::Invalid => {
                    trace!("Discarded undecodable telegram ({} bytes)", telegram.len());
                }
            },
            Ok(None) => {}
            Err(e) => warn!("Telegram read failed: {e}"),
        }

        if batch.len() >= settings.sample_rate {
            flush_batch(&mut batch, &mut sink, &data_topic);
        }

        // pace the loop to the sample rate
        if let Some(remaining) = sample_interval.checked_sub(iteration_start.elapsed()) {
            std::thread::sleep(remaining);
        }
    }

    // Final flush and broker release run on every exit path so buffered
    // samples are not silently discarded.
    if !batch.is_empty() {
        info!("Flushing final {} buffered samples", batch.len());
        flush_batch(&mut batch, &mut sink, &data_topic);
    }
    if let Err(e) = sink.disconnect() {
        warn!("Broker disconnect failed: {e}");
    }
    info!(
        "Telemetry publisher stopped, {} samples batched this run",
        shared.sample_count.load(Ordering::SeqCst)
    );
}

fn publish_env(sink: &mut Box<dyn BrokerSink>, topic: &str, record: &EnvRecord) {
    match records::compress(&record.encode()) {
        Ok(payload) => match sink.publish(topic, &payload) {
            Ok(()) => debug!(
                "[env] batt {:.2} V, {:.1} C, {:.1} %RH, {:.1} hPa",
                record.v_batt, record.temperature, record.humidity, record.pressure
            ),
            Err(e) => warn!("Environment publish failed: {e}"),
        },
        Err(e) => warn!("Environment record compression failed: {e}"),
    }
}

fn flush_batch(batch: &mut Vec<HighFreqRecord>, sink: &mut Box<dyn BrokerSink>, topic: &str) {
    if batch.is_empty() {
        return;
    }
    let raw = records::encode_batch(batch);
    match records::compress(&raw) {
        Ok(payload) => match sink.publish(topic, &payload) {
            Ok(()) => debug!(
                "[data] published {} samples, {} -> {} bytes",
                batch.len(),
                raw.len(),
                payload.len()
            ),
            Err(e) => warn!("Data batch publish failed, dropping {} samples: {e}", batch.len()),
        },
        Err(e) => warn!("Batch compression failed, dropping {} samples: {e}", batch.len()),
    }
    batch.clear();
}
