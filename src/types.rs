use serde::Serialize;
use thiserror::Error;

/// Adaptation field contents relevant to timing analysis
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AdaptationField {
    pub length: u8,
    pub discontinuity_indicator: bool,
    pub random_access_indicator: bool,
    pub pcr_flag: bool,
    /// Full 27 MHz value (base * 300 + extension) when `pcr_flag` is set
    pub pcr: u64,
    pub opcr_flag: bool,
    pub opcr: u64,
}

/// PES header fields surfaced to the analyzer
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PesHeader {
    /// 33-bit presentation timestamp, 0 when absent
    pub pts: u64,
}

/// A parsed view over one 188-byte transport packet.
/// Valid for the duration of a single processing call.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TsPacket {
    pub pid: u16,
    pub continuity_counter: u8,
    pub transport_error_indicator: bool,
    pub payload_unit_start: bool,
    pub contains_payload: bool,
    pub adaptation_field: Option<AdaptationField>,
    pub pes_header: Option<PesHeader>,
}

impl TsPacket {
    pub fn pcr(&self) -> Option<u64> {
        self.adaptation_field.filter(|af| af.pcr_flag).map(|af| af.pcr)
    }
}

/// Discrete observable anomalies, decoupled from the processing path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorEvent {
    /// Continuity counter jump on a PID
    Discontinuity { pid: u16 },
    /// Transport error indicator flagged on a PID
    TransportError { pid: u16 },
    /// Gap in the RTP sequence space
    SequenceDiscontinuity,
    /// Receive buffer usage exceeded the overflow threshold
    BufferOverflow,
}

#[derive(Debug, Error)]
pub enum MetricError {
    #[error("cannot add TS packet for PID {got} to metric tracking PID {expected}")]
    PidMismatch { expected: u16, got: u16 },
}

/// Roll-up across all PID metrics for one completed sampling period
#[derive(Debug, Clone, Default, Serialize)]
pub struct TsRollup {
    pub pid_count: usize,
    pub pid_packets: u64,
    pub pid_cc_errors: u64,
    pub tei_errors: u64,
    /// Longest gap between consecutive PCRs, milliseconds
    pub longest_pcr_delta_ms: u64,
    /// Largest positive PCR drift, milliseconds
    pub largest_pcr_drift_ms: f32,
    /// Largest negative PCR drift, milliseconds
    pub lowest_pcr_drift_ms: f32,
}

/// Point-in-time aggregate handed to the telemetry sink every sampling period
#[derive(Debug, Clone, Serialize)]
pub struct TsMetricLogRecord {
    pub sample_time: String,
    pub net: crate::metrics::network::NetworkSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rtp: Option<crate::metrics::rtp::RtpSnapshot>,
    pub ts: TsRollup,
    pub corrupted_frames: u64,
    pub dropped_frames: u64,
}

/// Analyzer configuration surface
#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    /// Sampling period of aggregated analytics in milliseconds
    pub sampling_period_ms: u64,
    /// Whether inbound frames carry RTP headers ahead of the TS payload
    pub has_rtp_headers: bool,
    /// Authoritative PCR PID; 0 means use any PCR-bearing PID
    pub selected_pcr_pid: u16,
    /// PID whose PES PTS is tracked as the video observable
    pub video_pts_pid: u16,
    /// PID whose PES PTS is tracked as the subtitle observable
    pub subtitle_pts_pid: u16,
    /// Label describing the ingest source, used in log records
    pub source_label: String,
    pub source_port: u16,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            sampling_period_ms: crate::constants::DEFAULT_SAMPLING_PERIOD_MS,
            has_rtp_headers: true,
            selected_pcr_pid: 0,
            video_pts_pid: 4096,
            subtitle_pts_pid: 2049,
            source_label: String::new(),
            source_port: 0,
        }
    }
}
