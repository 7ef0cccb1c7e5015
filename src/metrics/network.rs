//! Network ingest statistics for the raw frame stream

use serde::Serialize;

use crate::constants::{BUFFER_OVERFLOW_THRESHOLD, IAT_WARMUP_PACKETS, TICKS_PER_SECOND};
use crate::metrics::{WindowActivity, Windowed};
use crate::types::MonitorEvent;

/// Frame-level ingest statistics: bitrate, inter-packet timing, queue depth
/// and receive-buffer occupancy. One instance per analyzer.
///
/// Buffer usage is supplied by the caller as a percentage (-1.0 when the
/// transport cannot report it) since the socket belongs to the ingest layer.
pub struct NetworkMetric {
    window: WindowActivity,
    source_label: String,
    source_port: u16,

    start_timestamp: Option<i64>,
    total_packets: u64,
    total_data: u64,
    current_packets: u64,
    period_packets: u64,
    current_data: u64,
    period_data: u64,

    last_packet_timestamp: i64,
    time_between_last_packet: f64,
    longest_time_between_packets: f64,
    shortest_time_between_packets: Option<f64>,
    current_longest_iat: f64,
    current_shortest_iat: Option<f64>,
    period_longest_time_between_packets: f64,
    period_shortest_time_between_packets: f64,

    second_start_timestamp: i64,
    data_this_second: u64,
    averages_ready: bool,
    current_bitrate: u64,
    highest_bitrate: u64,
    lowest_bitrate: Option<u64>,

    current_queue_depth: usize,
    max_queue_depth: usize,
    current_max_queue: usize,
    period_max_queue_depth: usize,

    buffer_usage: f32,
    max_buffer_usage: f32,
    current_max_buffer: f32,
    period_max_buffer_usage: f32,
    overflow_latched: bool,
}

/// Published values for the last completed sampling period
#[derive(Debug, Clone, Default, Serialize)]
pub struct NetworkSnapshot {
    pub source_label: String,
    pub source_port: u16,
    pub total_packets: u64,
    pub period_packets: u64,
    pub total_data: u64,
    pub period_data: u64,
    pub current_bitrate: u64,
    pub highest_bitrate: u64,
    pub lowest_bitrate: u64,
    pub period_average_bitrate: u64,
    pub longest_time_between_packets: f64,
    pub shortest_time_between_packets: f64,
    pub period_longest_time_between_packets: f64,
    pub period_shortest_time_between_packets: f64,
    pub max_queue_depth: usize,
    pub period_max_queue_depth: usize,
    pub buffer_usage: f32,
    pub max_buffer_usage: f32,
    pub period_max_buffer_usage: f32,
}

impl NetworkMetric {
    pub fn new(sampling_period_ms: u64, source_label: String, source_port: u16) -> Self {
        Self {
            window: WindowActivity::new(sampling_period_ms),
            source_label,
            source_port,
            start_timestamp: None,
            total_packets: 0,
            total_data: 0,
            current_packets: 0,
            period_packets: 0,
            current_data: 0,
            period_data: 0,
            last_packet_timestamp: 0,
            time_between_last_packet: 0.0,
            longest_time_between_packets: 0.0,
            shortest_time_between_packets: None,
            current_longest_iat: 0.0,
            current_shortest_iat: None,
            period_longest_time_between_packets: 0.0,
            period_shortest_time_between_packets: 0.0,
            second_start_timestamp: 0,
            data_this_second: 0,
            averages_ready: false,
            current_bitrate: 0,
            highest_bitrate: 0,
            lowest_bitrate: None,
            current_queue_depth: 0,
            max_queue_depth: 0,
            current_max_queue: 0,
            period_max_queue_depth: 0,
            buffer_usage: -1.0,
            max_buffer_usage: 0.0,
            current_max_buffer: 0.0,
            period_max_buffer_usage: 0.0,
            overflow_latched: false,
        }
    }

    pub fn set_sampling_period_ms(&mut self, period_ms: u64) {
        self.window.set_sampling_period_ms(period_ms);
    }

    pub fn total_packets(&self) -> u64 {
        self.total_packets
    }

    pub fn total_data(&self) -> u64 {
        self.total_data
    }

    pub fn current_bitrate(&self) -> u64 {
        self.current_bitrate
    }

    pub fn time_between_last_packet(&self) -> f64 {
        self.time_between_last_packet
    }

    pub fn snapshot(&self) -> NetworkSnapshot {
        let period_secs = (self.window.sampling_period_ms() / 1000).max(1);
        NetworkSnapshot {
            source_label: self.source_label.clone(),
            source_port: self.source_port,
            total_packets: self.total_packets,
            period_packets: self.period_packets,
            total_data: self.total_data,
            period_data: self.period_data,
            current_bitrate: self.current_bitrate,
            highest_bitrate: self.highest_bitrate,
            lowest_bitrate: self.lowest_bitrate.unwrap_or(0),
            period_average_bitrate: self.period_data / period_secs * 8,
            longest_time_between_packets: self.longest_time_between_packets,
            shortest_time_between_packets: self.shortest_time_between_packets.unwrap_or(0.0),
            period_longest_time_between_packets: self.period_longest_time_between_packets,
            period_shortest_time_between_packets: self.period_shortest_time_between_packets,
            max_queue_depth: self.max_queue_depth,
            period_max_queue_depth: self.period_max_queue_depth,
            buffer_usage: self.buffer_usage,
            max_buffer_usage: self.max_buffer_usage,
            period_max_buffer_usage: self.period_max_buffer_usage,
        }
    }

    /// Accounts for one received network frame.
    ///
    /// `timestamp` is monotonic nanoseconds, `queue_depth` the number of
    /// frames waiting in the ingest buffer and `buffer_usage_pct` the
    /// receive-buffer occupancy (-1.0 when unavailable). Returns a
    /// `BufferOverflow` event on the first excursion above the threshold.
    pub fn add_frame(
        &mut self,
        data_size: usize,
        timestamp: i64,
        queue_depth: usize,
        buffer_usage_pct: f32,
    ) -> Option<MonitorEvent> {
        if self.start_timestamp.is_none() {
            self.start_timestamp = Some(timestamp);
            self.second_start_timestamp = timestamp;
            self.last_packet_timestamp = timestamp;
        }

        self.current_queue_depth = queue_depth;
        if queue_depth > self.max_queue_depth {
            self.max_queue_depth = queue_depth;
        }
        if queue_depth > self.current_max_queue {
            self.current_max_queue = queue_depth;
        }

        let iat = (timestamp - self.last_packet_timestamp) as f64 / TICKS_PER_SECOND as f64;
        self.time_between_last_packet = iat;
        self.last_packet_timestamp = timestamp;

        // the first few arrivals carry startup jitter, keep them out of the
        // extrema
        if self.total_packets > IAT_WARMUP_PACKETS {
            if iat > self.longest_time_between_packets {
                self.longest_time_between_packets = iat;
            }
            if iat > self.current_longest_iat {
                self.current_longest_iat = iat;
            }
            if self.shortest_time_between_packets.map_or(true, |s| iat < s) {
                self.shortest_time_between_packets = Some(iat);
            }
            if self.current_shortest_iat.map_or(true, |s| iat < s) {
                self.current_shortest_iat = Some(iat);
            }
        }

        self.total_packets += 1;
        self.current_packets += 1;
        self.total_data += data_size as u64;
        self.current_data += data_size as u64;

        if timestamp - self.second_start_timestamp < TICKS_PER_SECOND {
            self.data_this_second += data_size as u64;
        } else {
            // a misleadingly low first sample is skipped until a full
            // second has elapsed since start
            if !self.averages_ready {
                let start = self.start_timestamp.unwrap_or(timestamp);
                if timestamp - start >= TICKS_PER_SECOND {
                    self.averages_ready = true;
                }
            }

            if self.averages_ready {
                self.current_bitrate = self.data_this_second * 8;
                if self.current_bitrate > self.highest_bitrate {
                    self.highest_bitrate = self.current_bitrate;
                }
                if self.lowest_bitrate.map_or(true, |l| self.current_bitrate < l) {
                    self.lowest_bitrate = Some(self.current_bitrate);
                }
            }

            self.data_this_second = data_size as u64;
            self.second_start_timestamp = timestamp;
        }

        self.update_buffer_usage(buffer_usage_pct)
    }

    fn update_buffer_usage(&mut self, usage: f32) -> Option<MonitorEvent> {
        if usage < 0.0 {
            self.buffer_usage = -1.0;
            return None;
        }

        self.buffer_usage = usage;
        if usage > self.max_buffer_usage {
            self.max_buffer_usage = usage;
        }
        if usage > self.current_max_buffer {
            self.current_max_buffer = usage;
        }

        if usage > BUFFER_OVERFLOW_THRESHOLD {
            // latched until the excursion ends so one overflow does not
            // storm the event sink
            if !self.overflow_latched {
                self.overflow_latched = true;
                return Some(MonitorEvent::BufferOverflow);
            }
        } else {
            self.overflow_latched = false;
        }
        None
    }
}

impl Windowed for NetworkMetric {
    fn rollover(&mut self) {
        self.period_packets = self.current_packets;
        self.current_packets = 0;

        self.period_data = self.current_data;
        self.current_data = 0;

        self.period_longest_time_between_packets = self.current_longest_iat;
        self.current_longest_iat = 0.0;

        self.period_shortest_time_between_packets = self.current_shortest_iat.take().unwrap_or(0.0);

        self.period_max_buffer_usage = self.current_max_buffer;
        self.current_max_buffer = 0.0;

        self.period_max_queue_depth = self.current_max_queue;
        self.current_max_queue = 0;

        self.window.finish_rollover();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: i64 = 1_000_000;

    fn metric() -> NetworkMetric {
        NetworkMetric::new(5000, "239.1.1.2".to_string(), 1234)
    }

    #[test]
    fn bitrate_needs_one_second_warmup() {
        let mut m = metric();
        // ten 1316-byte frames inside the first second
        for i in 0..10i64 {
            m.add_frame(1316, i * 100 * MS, 0, -1.0);
        }
        assert_eq!(m.current_bitrate(), 0);

        // crossing the second boundary publishes the accumulated rate
        m.add_frame(1316, 1000 * MS, 0, -1.0);
        assert_eq!(m.current_bitrate(), 1316 * 10 * 8);
    }

    #[test]
    fn iat_extrema_ignore_startup_packets() {
        let mut m = metric();
        // huge gap inside the warm-up window must not register
        m.add_frame(188, 0, 0, -1.0);
        m.add_frame(188, 5 * 1000 * MS, 0, -1.0);
        assert_eq!(m.snapshot().longest_time_between_packets, 0.0);

        let mut ts = 5 * 1000 * MS;
        for _ in 0..10 {
            ts += 10 * MS;
            m.add_frame(188, ts, 0, -1.0);
        }
        ts += 50 * MS;
        m.add_frame(188, ts, 0, -1.0);
        let snap = m.snapshot();
        assert!((snap.longest_time_between_packets - 0.05).abs() < 1e-9);
        assert!((snap.shortest_time_between_packets - 0.01).abs() < 1e-9);
    }

    #[test]
    fn queue_depth_extrema_roll_per_window() {
        let mut m = metric();
        m.add_frame(188, 0, 3, -1.0);
        m.add_frame(188, MS, 17, -1.0);
        m.add_frame(188, 2 * MS, 5, -1.0);
        assert_eq!(m.snapshot().period_max_queue_depth, 0);

        m.rollover();
        let snap = m.snapshot();
        assert_eq!(snap.period_max_queue_depth, 17);
        assert_eq!(snap.max_queue_depth, 17);

        m.add_frame(188, 3 * MS, 4, -1.0);
        m.rollover();
        let snap = m.snapshot();
        assert_eq!(snap.period_max_queue_depth, 4);
        assert_eq!(snap.max_queue_depth, 17);
    }

    #[test]
    fn overflow_fires_once_per_excursion() {
        let mut m = metric();
        let first = m.add_frame(188, 0, 0, 99.5);
        let repeat = m.add_frame(188, MS, 0, 99.7);
        assert_eq!(first, Some(MonitorEvent::BufferOverflow));
        assert_eq!(repeat, None);

        // excursion ends, latch clears
        assert_eq!(m.add_frame(188, 2 * MS, 0, 50.0), None);
        let again = m.add_frame(188, 3 * MS, 0, 99.9);
        assert_eq!(again, Some(MonitorEvent::BufferOverflow));
    }

    #[test]
    fn unavailable_buffer_usage_reports_negative_one() {
        let mut m = metric();
        m.add_frame(188, 0, 0, -1.0);
        assert_eq!(m.snapshot().buffer_usage, -1.0);
    }

    #[test]
    fn window_counts_are_exact() {
        let mut m = metric();
        for i in 0..7i64 {
            m.add_frame(1316, i * MS, 0, -1.0);
        }
        m.rollover();
        let snap = m.snapshot();
        assert_eq!(snap.period_packets, 7);
        assert_eq!(snap.period_data, 7 * 1316);
        assert_eq!(snap.total_packets, 7);

        m.rollover();
        assert_eq!(m.snapshot().period_packets, 0);
    }
}
