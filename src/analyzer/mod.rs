//! Stream aggregation: worker loop, per-PID fan-out and periodic snapshots

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::constants::RTP_HEADER_SIZE;
use crate::metrics::network::NetworkMetric;
use crate::metrics::pid::PidMetric;
use crate::metrics::rtp::RtpMetric;
use crate::metrics::Windowed;
use crate::packet_factory::TsPacketFactory;
use crate::ring_buffer::RingBuffer;
use crate::types::{AnalyzerConfig, MonitorEvent, TsMetricLogRecord, TsPacket, TsRollup};

/// External PSI/SI table decoder fed with every analyzed packet.
pub trait TableDecoder: Send {
    fn add_packet(&mut self, packet: &TsPacket);
}

/// Cumulative whole-stream counters, summed across all PID metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamTotals {
    pub pid_count: usize,
    pub packet_count: u64,
    pub cc_errors: u64,
    pub tei_count: u64,
}

struct Shared {
    config: AnalyzerConfig,
    ring: Arc<RingBuffer>,

    network: Mutex<NetworkMetric>,
    rtp: Option<Mutex<RtpMetric>>,
    pids: Mutex<HashMap<u16, Arc<Mutex<PidMetric>>>>,
    decoder: Mutex<Option<Box<dyn TableDecoder>>>,

    events: broadcast::Sender<MonitorEvent>,
    records: broadcast::Sender<TsMetricLogRecord>,

    // latched first PCR-bearing PID when no authoritative PID is configured
    pcr_reference_pid: AtomicU32,
    last_pcr: AtomicU64,
    last_video_pts: AtomicU64,
    last_subtitle_pts: AtomicU64,
    corrupted_frames: AtomicU64,
    dropped_frames: AtomicU64,

    sampling_period_ms: AtomicU64,
    stopping: AtomicBool,
    timer_generation: Mutex<u64>,
    timer_wake: Condvar,
}

/// Owns the analysis worker thread, the periodic rollover timer and the live
/// collection of per-PID metrics.
///
/// `start` must be called at most once per instance; `stop` is idempotent
/// and joins both threads.
pub struct Analyzer {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
    timer: Option<JoinHandle<()>>,
    started: bool,
}

impl Analyzer {
    pub fn new(config: AnalyzerConfig, ring: Arc<RingBuffer>) -> Self {
        let (events, _) = broadcast::channel(1024);
        let (records, _) = broadcast::channel(64);

        let network = NetworkMetric::new(
            config.sampling_period_ms,
            config.source_label.clone(),
            config.source_port,
        );
        let rtp = config
            .has_rtp_headers
            .then(|| Mutex::new(RtpMetric::new(config.sampling_period_ms)));

        let sampling_period_ms = config.sampling_period_ms;
        Self {
            shared: Arc::new(Shared {
                config,
                ring,
                network: Mutex::new(network),
                rtp,
                pids: Mutex::new(HashMap::new()),
                decoder: Mutex::new(None),
                events,
                records,
                pcr_reference_pid: AtomicU32::new(0),
                last_pcr: AtomicU64::new(0),
                last_video_pts: AtomicU64::new(0),
                last_subtitle_pts: AtomicU64::new(0),
                corrupted_frames: AtomicU64::new(0),
                dropped_frames: AtomicU64::new(0),
                sampling_period_ms: AtomicU64::new(sampling_period_ms),
                stopping: AtomicBool::new(false),
                timer_generation: Mutex::new(0),
                timer_wake: Condvar::new(),
            }),
            worker: None,
            timer: None,
            started: false,
        }
    }

    pub fn set_table_decoder(&self, decoder: Box<dyn TableDecoder>) {
        *self.shared.decoder.lock().expect("decoder lock poisoned") = Some(decoder);
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<MonitorEvent> {
        self.shared.events.subscribe()
    }

    pub fn subscribe_records(&self) -> broadcast::Receiver<TsMetricLogRecord> {
        self.shared.records.subscribe()
    }

    /// Spawns the worker and rollover-timer threads. Call once.
    pub fn start(&mut self) {
        assert!(!self.started, "Analyzer::start called twice");
        self.started = true;

        let worker_shared = Arc::clone(&self.shared);
        self.worker = Some(
            std::thread::Builder::new()
                .name("ts-analysis".into())
                .spawn(move || run_worker(worker_shared))
                .expect("failed to spawn analysis worker"),
        );

        let timer_shared = Arc::clone(&self.shared);
        self.timer = Some(
            std::thread::Builder::new()
                .name("ts-rollover".into())
                .spawn(move || run_timer(timer_shared))
                .expect("failed to spawn rollover timer"),
        );
    }

    /// Signals cancellation, drains buffered frames and joins both threads.
    pub fn stop(&mut self) {
        self.shared.stopping.store(true, Ordering::SeqCst);
        self.shared.ring.close();

        // bump under the lock so a timer mid-wait cannot miss the wakeup
        {
            let mut generation = self
                .shared
                .timer_generation
                .lock()
                .expect("timer lock poisoned");
            *generation += 1;
        }
        self.shared.timer_wake.notify_all();

        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        if let Some(timer) = self.timer.take() {
            let _ = timer.join();
        }
    }

    /// Routes a batch of packets through the per-PID metrics and the table
    /// decoder. Used by the worker thread and directly by tests.
    pub fn process_packets(&self, packets: &[TsPacket], timestamp: i64) {
        self.shared.process_packets(packets, timestamp);
    }

    /// Rolls every live metric over and emits the aggregate record, exactly
    /// as a timer tick does.
    pub fn rollover_now(&self) {
        self.shared.rollover();
    }

    /// Changes the sampling period, firing an immediate rollover and
    /// re-arming the timer with the new interval.
    pub fn set_sampling_period(&self, period_ms: u64) {
        self.shared
            .sampling_period_ms
            .store(period_ms, Ordering::SeqCst);

        if let Ok(mut network) = self.shared.network.lock() {
            network.set_sampling_period_ms(period_ms);
        }

        let mut generation = self
            .shared
            .timer_generation
            .lock()
            .expect("timer lock poisoned");
        *generation += 1;
        drop(generation);
        self.shared.timer_wake.notify_all();
    }

    /// Called by the ingest layer when a frame could not be buffered.
    pub fn note_dropped_frame(&self) {
        self.shared.dropped_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn totals(&self) -> StreamTotals {
        self.shared.totals()
    }

    pub fn corrupted_frames(&self) -> u64 {
        self.shared.corrupted_frames.load(Ordering::Relaxed)
    }

    /// Most recent PCR from the authoritative PCR PID, in 27 MHz ticks.
    /// When no PID is configured the first PCR-bearing PID observed becomes
    /// the reference.
    pub fn last_pcr(&self) -> u64 {
        self.shared.last_pcr.load(Ordering::Relaxed)
    }

    pub fn last_video_pts(&self) -> u64 {
        self.shared.last_video_pts.load(Ordering::Relaxed)
    }

    pub fn last_subtitle_pts(&self) -> u64 {
        self.shared.last_subtitle_pts.load(Ordering::Relaxed)
    }
}

impl Drop for Analyzer {
    fn drop(&mut self) {
        if self.started {
            self.stop();
        }
    }
}

impl Shared {
    fn process_packets(&self, packets: &[TsPacket], timestamp: i64) {
        for packet in packets {
            if let Some(pcr) = packet.pcr() {
                let authoritative = match self.config.selected_pcr_pid {
                    0 => {
                        // first PCR-bearing PID becomes the reference
                        let _ = self.pcr_reference_pid.compare_exchange(
                            0,
                            u32::from(packet.pid),
                            Ordering::Relaxed,
                            Ordering::Relaxed,
                        );
                        self.pcr_reference_pid.load(Ordering::Relaxed)
                    }
                    selected => u32::from(selected),
                };
                if u32::from(packet.pid) == authoritative {
                    self.last_pcr.store(pcr, Ordering::Relaxed);
                }
            }

            if let Some(pes) = packet.pes_header {
                if pes.pts > 0 {
                    if packet.pid == self.config.video_pts_pid {
                        self.last_video_pts.store(pes.pts, Ordering::Relaxed);
                    }
                    if packet.pid == self.config.subtitle_pts_pid {
                        self.last_subtitle_pts.store(pes.pts, Ordering::Relaxed);
                    }
                }
            }

            let metric = {
                let mut pids = self.pids.lock().expect("pid map lock poisoned");
                let period = self.sampling_period_ms.load(Ordering::Relaxed);
                Arc::clone(
                    pids.entry(packet.pid)
                        .or_insert_with(|| Arc::new(Mutex::new(PidMetric::new(packet.pid, period)))),
                )
            };

            match metric
                .lock()
                .expect("pid metric lock poisoned")
                .add_packet(packet, timestamp)
            {
                Ok(Some(event)) => self.emit_event(event),
                Ok(None) => {}
                // a single bad packet never aborts the session
                Err(err) => warn!(pid = packet.pid, %err, "packet rejected by PID metric"),
            }

            if let Ok(mut decoder) = self.decoder.lock() {
                if let Some(decoder) = decoder.as_mut() {
                    decoder.add_packet(packet);
                }
            }
        }
    }

    fn emit_event(&self, event: MonitorEvent) {
        match event {
            MonitorEvent::Discontinuity { pid } => {
                warn!(pid, "continuity counter discontinuity");
            }
            MonitorEvent::TransportError { pid } => {
                warn!(pid, "transport error indicator set");
            }
            MonitorEvent::SequenceDiscontinuity => {
                warn!("discontinuity in RTP sequence");
            }
            MonitorEvent::BufferOverflow => {
                error!("network buffer > 99% - probably loss of data from overflow");
            }
        }
        // fire-and-forget; a missing subscriber is not an error
        let _ = self.events.send(event);
    }

    fn rollover(&self) {
        let net = {
            let mut network = self.network.lock().expect("network metric lock poisoned");
            network.rollover();
            network.snapshot()
        };

        let rtp = self.rtp.as_ref().map(|rtp| {
            let mut rtp = rtp.lock().expect("rtp metric lock poisoned");
            rtp.rollover();
            rtp.snapshot()
        });

        let metrics: Vec<Arc<Mutex<PidMetric>>> = {
            let pids = self.pids.lock().expect("pid map lock poisoned");
            pids.values().cloned().collect()
        };

        let mut ts = TsRollup::default();
        for metric in metrics {
            let mut metric = metric.lock().expect("pid metric lock poisoned");
            metric.rollover();

            ts.pid_count += 1;
            ts.pid_packets += metric.period_packet_count();
            ts.pid_cc_errors += metric.period_cc_error_count();
            ts.tei_errors += metric.period_tei_count();

            if metric.period_largest_pcr_delta_ms() > ts.longest_pcr_delta_ms {
                ts.longest_pcr_delta_ms = metric.period_largest_pcr_delta_ms();
            }
            if metric.period_largest_pcr_drift_ms() > ts.largest_pcr_drift_ms {
                ts.largest_pcr_drift_ms = metric.period_largest_pcr_drift_ms();
            }
            if metric.period_lowest_pcr_drift_ms() > ts.lowest_pcr_drift_ms {
                ts.lowest_pcr_drift_ms = metric.period_lowest_pcr_drift_ms();
            }
        }

        let record = TsMetricLogRecord {
            sample_time: chrono::Utc::now().to_rfc3339(),
            net,
            rtp,
            ts,
            corrupted_frames: self.corrupted_frames.load(Ordering::Relaxed),
            dropped_frames: self.dropped_frames.load(Ordering::Relaxed),
        };

        match serde_json::to_string(&record) {
            Ok(json) => info!(target: "mpegts_monitor::telemetry", key = "TSD", record = %json),
            Err(err) => error!(%err, "problem generating time-slice log record"),
        }

        let _ = self.records.send(record);
    }

    fn totals(&self) -> StreamTotals {
        let pids = self.pids.lock().expect("pid map lock poisoned");
        let mut totals = StreamTotals {
            pid_count: pids.len(),
            ..StreamTotals::default()
        };
        for metric in pids.values() {
            let metric = metric.lock().expect("pid metric lock poisoned");
            totals.packet_count += metric.packet_count();
            totals.cc_errors += metric.cc_error_count();
            totals.tei_count += metric.tei_count();
        }
        totals
    }
}

/// Drains the ingest buffer until it closes, feeding every frame through
/// the network/RTP metrics and the packet factory.
fn run_worker(shared: Arc<Shared>) {
    let mut factory = TsPacketFactory::new();

    while let Some(frame) = shared.ring.dequeue() {
        let queue_depth = shared.ring.len();
        let buffer_usage = shared.ring.fullness_percent();

        let overflow = shared
            .network
            .lock()
            .expect("network metric lock poisoned")
            .add_frame(frame.data.len(), frame.timestamp, queue_depth, buffer_usage);
        if let Some(event) = overflow {
            shared.emit_event(event);
        }

        if let Some(rtp) = &shared.rtp {
            let gap = rtp
                .lock()
                .expect("rtp metric lock poisoned")
                .add_frame(&frame.data);
            if let Some(event) = gap {
                shared.emit_event(event);
            }
        }

        let payload = if shared.config.has_rtp_headers && frame.data.len() > RTP_HEADER_SIZE {
            &frame.data[RTP_HEADER_SIZE..]
        } else {
            &frame.data[..]
        };

        match factory.packets_from_data(payload) {
            Some(batch) => shared.process_packets(&batch, frame.timestamp),
            None => {
                shared.corrupted_frames.fetch_add(1, Ordering::Relaxed);
                info!("frame received with no detected TS packets");
            }
        }
        // pooled batch storage returns to the factory on drop, error path
        // included
    }

    info!("stopping analysis thread due to exit request");
}

/// Fires a rollover every sampling period; a period change wakes it early
/// for an immediate rollover with the new interval.
fn run_timer(shared: Arc<Shared>) {
    loop {
        let period = shared.sampling_period_ms.load(Ordering::SeqCst);
        let guard = shared
            .timer_generation
            .lock()
            .expect("timer lock poisoned");
        let generation = *guard;
        let (guard, _timeout) = shared
            .timer_wake
            .wait_timeout_while(guard, Duration::from_millis(period), |gen| {
                !shared.stopping.load(Ordering::SeqCst) && *gen == generation
            })
            .expect("timer lock poisoned");
        drop(guard);

        if shared.stopping.load(Ordering::SeqCst) {
            break;
        }

        shared.rollover();
    }
}
