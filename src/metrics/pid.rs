//! Per-PID continuity and PCR timing analysis

use tracing::debug;

use crate::constants::{
    NULL_PID, PCR_CONVERSION_FACTOR, PCR_DRIFT_EXCURSION_LIMIT, PCR_DRIFT_LIMIT_MS,
    PCR_REFERENCE_WARMUP_SECS, PCR_WRAP_THRESHOLD,
};
use crate::metrics::{seconds_to_ticks, WindowActivity, Windowed};
use crate::types::{MetricError, MonitorEvent, TsPacket};

/// 27 MHz ticks per millisecond, used when converting deltas and drift
const TICKS_PER_MS: f64 = 27_000.0;

/// Reference pair anchoring drift measurement. PCR and wall clock are set
/// and cleared together; the wall clock is pre-converted to 27 MHz units.
#[derive(Debug, Clone, Copy)]
struct PcrReference {
    pcr: u64,
    clock: f64,
}

/// Continuity-counter validation and PCR drift estimation for one PID.
///
/// Created lazily by the analyzer on the first packet seen for a PID and
/// kept for the whole session.
pub struct PidMetric {
    pid: u16,
    window: WindowActivity,

    packet_count: u64,
    cc_error_count: u64,
    tei_count: u64,

    current_packets: u64,
    current_cc_errors: u64,
    current_tei: u64,

    period_packet_count: u64,
    period_cc_error_count: u64,
    period_tei_count: u64,

    last_cc: Option<u8>,

    start_timestamp: Option<i64>,
    last_pcr: Option<u64>,
    reference: Option<PcrReference>,
    large_drift_count: u32,

    current_largest_pcr_delta: u64,
    current_largest_drift: f32,
    current_lowest_drift: f32,

    period_largest_pcr_delta_ms: u64,
    period_largest_pcr_drift_ms: f32,
    period_lowest_pcr_drift_ms: f32,
}

impl PidMetric {
    pub fn new(pid: u16, sampling_period_ms: u64) -> Self {
        Self {
            pid,
            window: WindowActivity::new(sampling_period_ms),
            packet_count: 0,
            cc_error_count: 0,
            tei_count: 0,
            current_packets: 0,
            current_cc_errors: 0,
            current_tei: 0,
            period_packet_count: 0,
            period_cc_error_count: 0,
            period_tei_count: 0,
            last_cc: None,
            start_timestamp: None,
            last_pcr: None,
            reference: None,
            large_drift_count: 0,
            current_largest_pcr_delta: 0,
            current_largest_drift: 0.0,
            current_lowest_drift: 0.0,
            period_largest_pcr_delta_ms: 0,
            period_largest_pcr_drift_ms: 0.0,
            period_lowest_pcr_drift_ms: 0.0,
        }
    }

    pub fn pid(&self) -> u16 {
        self.pid
    }

    pub fn packet_count(&self) -> u64 {
        self.packet_count
    }

    pub fn cc_error_count(&self) -> u64 {
        self.cc_error_count
    }

    pub fn tei_count(&self) -> u64 {
        self.tei_count
    }

    pub fn period_packet_count(&self) -> u64 {
        self.period_packet_count
    }

    pub fn period_cc_error_count(&self) -> u64 {
        self.period_cc_error_count
    }

    pub fn period_tei_count(&self) -> u64 {
        self.period_tei_count
    }

    /// Longest gap between consecutive PCRs in the last period, milliseconds
    pub fn period_largest_pcr_delta_ms(&self) -> u64 {
        self.period_largest_pcr_delta_ms
    }

    /// Largest positive drift (wall clock ahead of PCR) in the last period,
    /// milliseconds
    pub fn period_largest_pcr_drift_ms(&self) -> f32 {
        self.period_largest_pcr_drift_ms
    }

    /// Largest negative drift (PCR ahead of wall clock) in the last period,
    /// milliseconds
    pub fn period_lowest_pcr_drift_ms(&self) -> f32 {
        self.period_lowest_pcr_drift_ms
    }

    /// Accounts for one packet belonging to this PID.
    ///
    /// `timestamp` is a monotonic nanosecond stamp taken when the enclosing
    /// frame was received. Returns the anomaly event the packet raised, if
    /// any; a packet carrying a foreign PID is rejected without touching any
    /// counter.
    pub fn add_packet(
        &mut self,
        packet: &TsPacket,
        timestamp: i64,
    ) -> Result<Option<MonitorEvent>, MetricError> {
        if packet.pid != self.pid {
            return Err(MetricError::PidMismatch {
                expected: self.pid,
                got: packet.pid,
            });
        }

        if self.start_timestamp.is_none() {
            self.start_timestamp = Some(timestamp);
        }

        let event = if packet.transport_error_indicator {
            self.tei_count += 1;
            self.current_tei += 1;
            // a corrupted packet cannot be trusted for sequencing or timing
            self.reset_reference(packet.pcr(), timestamp);
            Some(MonitorEvent::TransportError { pid: self.pid })
        } else {
            let event = self.check_continuity(packet);
            self.check_pcr(packet, timestamp);
            self.last_cc = Some(packet.continuity_counter);
            event
        };

        self.packet_count += 1;
        self.current_packets += 1;

        Ok(event)
    }

    fn check_continuity(&mut self, packet: &TsPacket) -> Option<MonitorEvent> {
        if packet.pid == NULL_PID {
            return None;
        }

        let last = self.last_cc?;
        let cc = packet.continuity_counter;

        if cc == last {
            // a repeated counter is legal on payload-less packets, e.g. a
            // PCR-only PID never advances its counter
            if packet.contains_payload {
                self.cc_error_count += 1;
                self.current_cc_errors += 1;
            }
            return None;
        }

        if cc == (last + 1) & 0x0F {
            return None;
        }

        self.cc_error_count += 1;
        self.current_cc_errors += 1;
        // sequencing and timing are both presumed disrupted
        self.clear_reference();
        Some(MonitorEvent::Discontinuity { pid: self.pid })
    }

    fn check_pcr(&mut self, packet: &TsPacket, timestamp: i64) {
        let Some(af) = packet.adaptation_field else {
            return;
        };
        if !af.pcr_flag {
            return;
        }
        if af.discontinuity_indicator {
            debug!(pid = self.pid, "adaptation field discontinuity indicator set, skipping PCR");
            return;
        }

        let pcr = af.pcr;

        match self.reference {
            Some(reference) => {
                if let Some(last_pcr) = self.last_pcr {
                    let delta = Self::pcr_elapsed(last_pcr, pcr);
                    if delta > self.current_largest_pcr_delta {
                        self.current_largest_pcr_delta = delta;
                    }
                }

                let elapsed_pcr = Self::pcr_elapsed(reference.pcr, pcr) as f64;
                let elapsed_clock = timestamp as f64 * PCR_CONVERSION_FACTOR - reference.clock;

                let drift = ((elapsed_clock - elapsed_pcr) / TICKS_PER_MS) as f32;
                if drift > self.current_largest_drift {
                    self.current_largest_drift = drift;
                }

                let inverse_drift = ((elapsed_pcr - elapsed_clock) / TICKS_PER_MS) as f32;
                if inverse_drift > self.current_lowest_drift {
                    self.current_lowest_drift = inverse_drift;
                }

                if drift.abs() > PCR_DRIFT_LIMIT_MS {
                    self.large_drift_count += 1;
                } else {
                    self.large_drift_count = 0;
                }

                if self.large_drift_count > PCR_DRIFT_EXCURSION_LIMIT {
                    // prolonged drift is a discontinuity, not an ever-growing
                    // number - resync the reference clocks
                    self.reset_reference(Some(pcr), timestamp);
                }
            }
            None => {
                // no drift datum until the startup window has passed,
                // otherwise scheduling jitter at launch skews everything
                if let Some(start) = self.start_timestamp {
                    if timestamp - start >= seconds_to_ticks(PCR_REFERENCE_WARMUP_SECS) {
                        self.reset_reference(Some(pcr), timestamp);
                    }
                }
            }
        }

        self.last_pcr = Some(pcr);
    }

    /// Modular distance on the 42-bit 27 MHz clock
    fn pcr_elapsed(from: u64, to: u64) -> u64 {
        (to + PCR_WRAP_THRESHOLD - from) % PCR_WRAP_THRESHOLD
    }

    fn reset_reference(&mut self, pcr: Option<u64>, timestamp: i64) {
        match pcr {
            Some(pcr) => {
                self.reference = Some(PcrReference {
                    pcr,
                    clock: timestamp as f64 * PCR_CONVERSION_FACTOR,
                });
                self.last_pcr = Some(pcr);
            }
            None => {
                self.reference = None;
                self.last_pcr = None;
            }
        }
        self.large_drift_count = 0;
    }

    fn clear_reference(&mut self) {
        self.reference = None;
        self.last_pcr = None;
        self.large_drift_count = 0;
    }
}

impl Windowed for PidMetric {
    fn rollover(&mut self) {
        self.period_packet_count = self.current_packets;
        self.current_packets = 0;

        self.period_cc_error_count = self.current_cc_errors;
        self.current_cc_errors = 0;

        self.period_tei_count = self.current_tei;
        self.current_tei = 0;

        self.period_largest_pcr_delta_ms =
            (self.current_largest_pcr_delta as f64 / TICKS_PER_MS) as u64;
        self.current_largest_pcr_delta = 0;

        self.period_largest_pcr_drift_ms = self.current_largest_drift;
        self.current_largest_drift = 0.0;

        self.period_lowest_pcr_drift_ms = self.current_lowest_drift;
        self.current_lowest_drift = 0.0;

        self.window.finish_rollover();
    }
}
