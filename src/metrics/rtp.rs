//! RTP sequence tracking and loss estimation

use serde::Serialize;

use crate::constants::{RTP_HEADER_SIZE, RTP_MAX_PLAUSIBLE_GAP};
use crate::metrics::{WindowActivity, Windowed};
use crate::types::MonitorEvent;

/// Tracks the 16-bit RTP sequence space across inbound frames and estimates
/// how many packets were lost. One instance per analyzer, active only when
/// the input carries RTP headers.
pub struct RtpMetric {
    window: WindowActivity,
    total_packets: u64,
    last_sequence_number: u16,
    ssrc: u32,
    last_timestamp: u32,

    estimated_lost_packets: u64,
    current_lost: u64,
    period_estimated_lost_packets: u64,
}

/// Published values for the last completed sampling period
#[derive(Debug, Clone, Default, Serialize)]
pub struct RtpSnapshot {
    pub estimated_lost_packets: u64,
    pub period_estimated_lost_packets: u64,
    pub last_sequence_number: u16,
    pub ssrc: u32,
}

impl RtpMetric {
    pub fn new(sampling_period_ms: u64) -> Self {
        Self {
            window: WindowActivity::new(sampling_period_ms),
            total_packets: 0,
            last_sequence_number: 0,
            ssrc: 0,
            last_timestamp: 0,
            estimated_lost_packets: 0,
            current_lost: 0,
            period_estimated_lost_packets: 0,
        }
    }

    pub fn estimated_lost_packets(&self) -> u64 {
        self.estimated_lost_packets
    }

    pub fn last_sequence_number(&self) -> u16 {
        self.last_sequence_number
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn last_timestamp(&self) -> u32 {
        self.last_timestamp
    }

    pub fn snapshot(&self) -> RtpSnapshot {
        RtpSnapshot {
            estimated_lost_packets: self.estimated_lost_packets,
            period_estimated_lost_packets: self.period_estimated_lost_packets,
            last_sequence_number: self.last_sequence_number,
            ssrc: self.ssrc,
        }
    }

    /// Reads the RTP header of one raw frame and accounts for any sequence
    /// gap. Returns a `SequenceDiscontinuity` event when a gap was detected.
    pub fn add_frame(&mut self, data: &[u8]) -> Option<MonitorEvent> {
        if data.len() < RTP_HEADER_SIZE {
            return None;
        }

        let seq = u16::from_be_bytes([data[2], data[3]]);
        self.last_timestamp = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        self.ssrc = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

        if self.total_packets == 0 {
            // first frame seeds the sequence, no loss can be computed yet
            self.total_packets = 1;
            self.last_sequence_number = seq;
            return None;
        }

        self.total_packets += 1;

        let mut event = None;

        if seq == 0 {
            if self.last_sequence_number != u16::MAX {
                let gap = u32::from(u16::MAX - self.last_sequence_number);
                self.add_lost(Self::clamp_gap(gap));
                event = Some(MonitorEvent::SequenceDiscontinuity);
            }
        } else if seq != self.last_sequence_number.wrapping_add(1) {
            // forward distance in the 16-bit space; the received packet
            // itself is not lost, so a gap of `diff` means `diff - 1` missing
            let diff = u32::from(seq.wrapping_sub(self.last_sequence_number));
            let lost = if diff > RTP_MAX_PLAUSIBLE_GAP {
                // anomalous jump - reset or reordering burst, count one
                1
            } else {
                u64::from(diff.saturating_sub(1))
            };
            self.add_lost(lost);
            event = Some(MonitorEvent::SequenceDiscontinuity);
        }

        self.last_sequence_number = seq;
        event
    }

    fn clamp_gap(gap: u32) -> u64 {
        if gap > RTP_MAX_PLAUSIBLE_GAP {
            1
        } else {
            u64::from(gap)
        }
    }

    fn add_lost(&mut self, lost: u64) {
        self.estimated_lost_packets += lost;
        self.current_lost += lost;
    }
}

impl Windowed for RtpMetric {
    fn rollover(&mut self) {
        self.period_estimated_lost_packets = self.current_lost;
        self.current_lost = 0;

        self.window.finish_rollover();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(seq: u16) -> Vec<u8> {
        let mut data = vec![0u8; RTP_HEADER_SIZE + 188];
        data[2..4].copy_from_slice(&seq.to_be_bytes());
        data
    }

    fn feed(metric: &mut RtpMetric, seqs: &[u16]) -> usize {
        seqs.iter()
            .filter(|&&s| metric.add_frame(&frame(s)).is_some())
            .count()
    }

    #[test]
    fn clean_wraparound_is_not_loss() {
        let mut metric = RtpMetric::new(5000);
        let gaps = feed(&mut metric, &[65533, 65534, 65535, 0, 1]);
        assert_eq!(metric.estimated_lost_packets(), 0);
        assert_eq!(gaps, 0);
    }

    #[test]
    fn single_missing_packet() {
        let mut metric = RtpMetric::new(5000);
        let gaps = feed(&mut metric, &[10, 12]);
        assert_eq!(metric.estimated_lost_packets(), 1);
        assert_eq!(gaps, 1);
    }

    #[test]
    fn loss_across_wraparound() {
        let mut metric = RtpMetric::new(5000);
        feed(&mut metric, &[65534, 3]);
        assert_eq!(metric.estimated_lost_packets(), 4);
    }

    #[test]
    fn wrap_to_zero_with_loss() {
        let mut metric = RtpMetric::new(5000);
        feed(&mut metric, &[65533, 0]);
        assert_eq!(metric.estimated_lost_packets(), 2);
    }

    #[test]
    fn duplicate_raises_gap_without_loss() {
        let mut metric = RtpMetric::new(5000);
        let gaps = feed(&mut metric, &[7, 7]);
        assert_eq!(metric.estimated_lost_packets(), 0);
        assert_eq!(gaps, 1);
    }

    #[test]
    fn implausible_jump_clamps_to_one() {
        let mut metric = RtpMetric::new(5000);
        feed(&mut metric, &[40000, 5000]);
        assert_eq!(metric.estimated_lost_packets(), 1);
    }

    #[test]
    fn first_frame_only_seeds() {
        let mut metric = RtpMetric::new(5000);
        assert!(metric.add_frame(&frame(500)).is_none());
        assert_eq!(metric.last_sequence_number(), 500);
        assert_eq!(metric.estimated_lost_packets(), 0);
    }

    #[test]
    fn rollover_publishes_window_losses() {
        let mut metric = RtpMetric::new(5000);
        feed(&mut metric, &[10, 12, 14]);
        assert_eq!(metric.snapshot().period_estimated_lost_packets, 0);

        metric.rollover();
        assert_eq!(metric.snapshot().period_estimated_lost_packets, 2);
        assert_eq!(metric.estimated_lost_packets(), 2);

        metric.rollover();
        assert_eq!(metric.snapshot().period_estimated_lost_packets, 0);
    }

    #[test]
    fn short_frame_is_ignored() {
        let mut metric = RtpMetric::new(5000);
        assert!(metric.add_frame(&[0u8; 4]).is_none());
        assert_eq!(metric.estimated_lost_packets(), 0);
    }
}
