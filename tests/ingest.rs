//! End-to-end ingest: frames through the ring buffer, worker and metrics

use std::sync::Arc;

use bytes::Bytes;
use mpegts_monitor::analyzer::Analyzer;
use mpegts_monitor::constants::{RTP_HEADER_SIZE, TS_PACKET_SIZE, TS_SYNC_BYTE};
use mpegts_monitor::ring_buffer::RingBuffer;
use mpegts_monitor::types::AnalyzerConfig;

const MS: i64 = 1_000_000;

fn raw_packet(pid: u16, cc: u8) -> [u8; TS_PACKET_SIZE] {
    let mut pkt = [0xFFu8; TS_PACKET_SIZE];
    pkt[0] = TS_SYNC_BYTE;
    pkt[1] = ((pid >> 8) & 0x1F) as u8;
    pkt[2] = (pid & 0xFF) as u8;
    pkt[3] = 0x10 | (cc & 0x0F);
    pkt
}

fn stream(pid: u16, count: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(count * TS_PACKET_SIZE);
    for i in 0..count {
        out.extend_from_slice(&raw_packet(pid, (i % 16) as u8));
    }
    out
}

fn analyzer(config: AnalyzerConfig) -> (Analyzer, Arc<RingBuffer>) {
    let ring = Arc::new(RingBuffer::new(8192));
    (Analyzer::new(config, Arc::clone(&ring)), ring)
}

#[test]
fn frame_chunking_does_not_change_stream_totals() {
    let data = stream(256, 1000);

    for chunk_size in [188, 189, 512, 1316, 2048] {
        let config = AnalyzerConfig {
            has_rtp_headers: false,
            source_label: "test".to_string(),
            ..AnalyzerConfig::default()
        };
        let (mut analyzer, ring) = analyzer(config);
        analyzer.start();

        for (i, chunk) in data.chunks(chunk_size).enumerate() {
            ring.enqueue(Bytes::copy_from_slice(chunk), i as i64 * MS)
                .expect("ring holds the whole run");
        }

        // stop drains everything still buffered before joining
        analyzer.stop();

        let totals = analyzer.totals();
        assert_eq!(totals.packet_count, 1000, "chunk size {chunk_size}");
        assert_eq!(totals.pid_count, 1, "chunk size {chunk_size}");
        assert_eq!(totals.cc_errors, 0, "chunk size {chunk_size}");
        assert_eq!(totals.tei_count, 0, "chunk size {chunk_size}");
        assert_eq!(analyzer.corrupted_frames(), 0, "chunk size {chunk_size}");
    }
}

#[test]
fn lost_rtp_frame_shows_in_both_metrics() {
    // sender-side frames: RTP header plus seven TS packets each, with the
    // continuity counter advancing across the whole run
    let mut frames = Vec::new();
    let mut cc = 0u8;
    for seq in 0..10u16 {
        let mut frame = vec![0u8; RTP_HEADER_SIZE];
        frame[2..4].copy_from_slice(&seq.to_be_bytes());
        for _ in 0..7 {
            frame.extend_from_slice(&raw_packet(256, cc));
            cc = (cc + 1) & 0x0F;
        }
        frames.push(frame);
    }
    // frame 5 never arrives
    frames.remove(5);

    let config = AnalyzerConfig {
        source_label: "test".to_string(),
        ..AnalyzerConfig::default()
    };
    let (mut analyzer, ring) = analyzer(config);
    analyzer.start();

    for (i, frame) in frames.iter().enumerate() {
        ring.enqueue(Bytes::copy_from_slice(frame), i as i64 * MS)
            .expect("ring holds the whole run");
    }
    analyzer.stop();

    let mut records = analyzer.subscribe_records();
    analyzer.rollover_now();
    let record = records.try_recv().expect("rollover emits a record");

    let rtp = record.rtp.expect("rtp metric is active");
    assert_eq!(rtp.estimated_lost_packets, 1);
    assert_eq!(rtp.last_sequence_number, 9);

    // the seven packets inside the lost frame broke the counter chain once
    assert_eq!(record.ts.pid_cc_errors, 1);
    assert_eq!(record.ts.pid_packets, 9 * 7);
    assert_eq!(analyzer.totals().packet_count, 9 * 7);
}

#[test]
fn frame_without_sync_counts_as_corrupted() {
    let config = AnalyzerConfig {
        has_rtp_headers: false,
        source_label: "test".to_string(),
        ..AnalyzerConfig::default()
    };
    let (mut analyzer, ring) = analyzer(config);
    analyzer.start();

    ring.enqueue(Bytes::from(vec![0xFFu8; TS_PACKET_SIZE]), 0)
        .expect("ring holds the frame");
    analyzer.stop();

    assert_eq!(analyzer.corrupted_frames(), 1);
    assert_eq!(analyzer.totals().packet_count, 0);
}
