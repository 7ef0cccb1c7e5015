//! Constants for MPEG-TS transport analysis

/// MPEG-TS packet constants
pub const TS_PACKET_SIZE: usize = 188;
pub const TS_SYNC_BYTE: u8 = 0x47;

/// Null/stuffing PID, exempt from continuity checking
pub const NULL_PID: u16 = 0x1FFF;

/// PCR constants
pub const PCR_CLOCK_HZ: f64 = 27_000_000.0; // 27 MHz
pub const PCR_WRAP_THRESHOLD: u64 = (1u64 << 33) * 300; // PCR wrap-around point

/// Monotonic timestamps are nanoseconds since the process clock epoch
pub const TICKS_PER_SECOND: i64 = 1_000_000_000;

/// Platform timestamp ticks -> 27 MHz PCR ticks
pub const PCR_CONVERSION_FACTOR: f64 = PCR_CLOCK_HZ / TICKS_PER_SECOND as f64;

/// Drift above this magnitude (milliseconds) counts as an excursion
pub const PCR_DRIFT_LIMIT_MS: f32 = 100.0; // 2_700_000 ticks at 27 MHz

/// Consecutive drift excursions tolerated before the reference clocks resync
pub const PCR_DRIFT_EXCURSION_LIMIT: u32 = 5;

/// Seconds to wait after the first packet before establishing the PCR drift reference
pub const PCR_REFERENCE_WARMUP_SECS: i64 = 10;

/// RTP fixed header length preceding the TS payload
pub const RTP_HEADER_SIZE: usize = 12;

/// Sequence gaps larger than this are treated as stream resets, not loss
pub const RTP_MAX_PLAUSIBLE_GAP: u32 = 30_000;

/// Default aggregated-analytics sampling period in milliseconds
pub const DEFAULT_SAMPLING_PERIOD_MS: u64 = 5000;

/// Frames the ingest ring buffer holds before dropping input
pub const DEFAULT_RING_CAPACITY: usize = 4096;

/// Network buffer usage percentage above which overflow is assumed
pub const BUFFER_OVERFLOW_THRESHOLD: f32 = 99.0;

/// Packets observed before inter-packet timing extrema are trusted
pub const IAT_WARMUP_PACKETS: u64 = 10;
