//! Raw network frames -> transport packet views
//!
//! Frames arrive at whatever size the network delivered, rarely aligned to
//! the 188-byte packet grid. The factory keeps the unconsumed tail of the
//! previous frame and realigns on the sync byte, validating a candidate
//! against the following packet's sync byte so payload bytes that happen to
//! be 0x47 do not derail the scan.

use std::sync::{Arc, Mutex};

use crate::constants::{TS_PACKET_SIZE, TS_SYNC_BYTE};
use crate::types::{AdaptationField, PesHeader, TsPacket};

type Pool = Arc<Mutex<Vec<Vec<TsPacket>>>>;

/// A batch of parsed packets borrowed from the factory pool. Storage goes
/// back to the pool when the batch is dropped, on every exit path.
pub struct PacketBatch {
    packets: Vec<TsPacket>,
    pool: Pool,
}

impl std::ops::Deref for PacketBatch {
    type Target = [TsPacket];

    fn deref(&self) -> &[TsPacket] {
        &self.packets
    }
}

impl Drop for PacketBatch {
    fn drop(&mut self) {
        let mut packets = std::mem::take(&mut self.packets);
        packets.clear();
        if let Ok(mut pool) = self.pool.lock() {
            pool.push(packets);
        }
    }
}

/// Stateful splitter turning raw byte frames into [`TsPacket`] views.
pub struct TsPacketFactory {
    pending: Vec<u8>,
    pool: Pool,
}

impl Default for TsPacketFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl TsPacketFactory {
    pub fn new() -> Self {
        Self {
            pending: Vec::with_capacity(TS_PACKET_SIZE * 16),
            pool: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Consumes one raw frame and returns the complete packets now
    /// available, or `None` when the frame (plus any pending tail) holds no
    /// complete sync-aligned packet.
    pub fn packets_from_data(&mut self, data: &[u8]) -> Option<PacketBatch> {
        self.pending.extend_from_slice(data);

        let mut packets = self
            .pool
            .lock()
            .ok()
            .and_then(|mut p| p.pop())
            .unwrap_or_else(|| Vec::with_capacity(16));

        let mut pos = 0usize;
        while pos + TS_PACKET_SIZE <= self.pending.len() {
            if self.pending[pos] != TS_SYNC_BYTE {
                pos += 1;
                continue;
            }

            // a candidate is only trusted when the next packet slot also
            // starts with a sync byte (or the buffer ends exactly here)
            let next = pos + TS_PACKET_SIZE;
            if next < self.pending.len() && self.pending[next] != TS_SYNC_BYTE {
                pos += 1;
                continue;
            }

            packets.push(parse_packet(&self.pending[pos..next]));
            pos = next;
        }

        self.pending.drain(..pos);

        if packets.is_empty() {
            if let Ok(mut pool) = self.pool.lock() {
                pool.push(packets);
            }
            return None;
        }

        Some(PacketBatch {
            packets,
            pool: Arc::clone(&self.pool),
        })
    }
}

fn parse_packet(chunk: &[u8]) -> TsPacket {
    debug_assert_eq!(chunk.len(), TS_PACKET_SIZE);

    let transport_error_indicator = chunk[1] & 0x80 != 0;
    let payload_unit_start = chunk[1] & 0x40 != 0;
    let pid = (u16::from(chunk[1] & 0x1F) << 8) | u16::from(chunk[2]);
    let adaptation_field_ctrl = (chunk[3] & 0x30) >> 4;
    let continuity_counter = chunk[3] & 0x0F;
    let contains_payload = adaptation_field_ctrl & 0x01 != 0;

    let adaptation_field = if adaptation_field_ctrl & 0x02 != 0 {
        Some(parse_adaptation_field(chunk))
    } else {
        None
    };

    let mut packet = TsPacket {
        pid,
        continuity_counter,
        transport_error_indicator,
        payload_unit_start,
        contains_payload,
        adaptation_field,
        pes_header: None,
    };

    if payload_unit_start && contains_payload {
        let payload_offset = match adaptation_field {
            Some(af) => 4 + 1 + af.length as usize,
            None => 4,
        };
        if payload_offset < TS_PACKET_SIZE {
            packet.pes_header = parse_pes_header(&chunk[payload_offset..]);
        }
    }

    packet
}

fn parse_adaptation_field(chunk: &[u8]) -> AdaptationField {
    let length = chunk[4];
    let mut af = AdaptationField {
        length,
        ..AdaptationField::default()
    };

    if length < 1 {
        return af;
    }

    let flags = chunk[5];
    af.discontinuity_indicator = flags & 0x80 != 0;
    af.random_access_indicator = flags & 0x40 != 0;
    af.pcr_flag = flags & 0x10 != 0;
    af.opcr_flag = flags & 0x08 != 0;

    let mut offset = 6;
    if af.pcr_flag && length >= 7 {
        af.pcr = parse_pcr(&chunk[offset..offset + 6]);
        offset += 6;
    }
    if af.opcr_flag && length >= 13 {
        af.opcr = parse_pcr(&chunk[offset..offset + 6]);
    }

    af
}

/// 33-bit base at 90 kHz plus 9-bit extension -> full 27 MHz ticks
fn parse_pcr(p: &[u8]) -> u64 {
    let base = (u64::from(p[0]) << 25)
        | (u64::from(p[1]) << 17)
        | (u64::from(p[2]) << 9)
        | (u64::from(p[3]) << 1)
        | (u64::from(p[4]) >> 7);
    let ext = (u64::from(p[4] & 0x01) << 8) | u64::from(p[5]);
    base * 300 + ext
}

fn parse_pes_header(payload: &[u8]) -> Option<PesHeader> {
    if payload.len() < 14 || !payload.starts_with(&[0x00, 0x00, 0x01]) {
        return None;
    }

    let pts_dts_flags = (payload[7] & 0xC0) >> 6;
    if pts_dts_flags & 0b10 == 0 {
        return Some(PesHeader { pts: 0 });
    }

    let p = &payload[9..14];
    let pts = ((u64::from(p[0]) & 0x0E) << 29)
        | (u64::from(p[1]) << 22)
        | (((u64::from(p[2]) & 0xFE) >> 1) << 15)
        | (u64::from(p[3]) << 7)
        | (u64::from(p[4]) >> 1);

    Some(PesHeader { pts })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal payload-bearing packet with an advancing continuity counter
    fn raw_packet(pid: u16, cc: u8) -> [u8; TS_PACKET_SIZE] {
        let mut pkt = [0xFFu8; TS_PACKET_SIZE];
        pkt[0] = TS_SYNC_BYTE;
        pkt[1] = ((pid >> 8) & 0x1F) as u8;
        pkt[2] = (pid & 0xFF) as u8;
        pkt[3] = 0x10 | (cc & 0x0F); // payload only
        pkt
    }

    fn stream(pid: u16, count: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(count * TS_PACKET_SIZE);
        for i in 0..count {
            out.extend_from_slice(&raw_packet(pid, (i % 16) as u8));
        }
        out
    }

    fn count_packets(factory: &mut TsPacketFactory, data: &[u8], chunk_size: usize) -> usize {
        let mut total = 0;
        for chunk in data.chunks(chunk_size) {
            if let Some(batch) = factory.packets_from_data(chunk) {
                total += batch.len();
            }
        }
        total
    }

    #[test]
    fn chunk_boundaries_do_not_change_packet_count() {
        let data = stream(256, 1000);
        for chunk_size in [188, 189, 512, 1316, 2048] {
            let mut factory = TsPacketFactory::new();
            let total = count_packets(&mut factory, &data, chunk_size);
            assert_eq!(total, 1000, "chunk size {chunk_size}");
        }
    }

    #[test]
    fn leading_garbage_is_skipped() {
        let mut data = vec![0xAB, 0xCD, 0x47, 0x99]; // note the stray sync byte
        data.extend_from_slice(&stream(256, 10));

        let mut factory = TsPacketFactory::new();
        let total = count_packets(&mut factory, &data, 512);
        assert_eq!(total, 10);
    }

    #[test]
    fn too_short_input_returns_none() {
        let mut factory = TsPacketFactory::new();
        assert!(factory.packets_from_data(&[0x47, 0x00, 0x00]).is_none());
        // the fragment is retained and completed by the next frame
        let rest = &raw_packet(0, 0)[3..];
        let batch = factory.packets_from_data(rest).expect("completed packet");
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn header_fields_are_extracted() {
        let mut pkt = raw_packet(0x1ABC & 0x1FFF, 7);
        pkt[1] |= 0x80; // TEI

        let mut factory = TsPacketFactory::new();
        let batch = factory.packets_from_data(&pkt).unwrap();
        let parsed = batch[0];
        assert_eq!(parsed.pid, 0x1ABC & 0x1FFF);
        assert_eq!(parsed.continuity_counter, 7);
        assert!(parsed.transport_error_indicator);
        assert!(parsed.contains_payload);
        assert!(parsed.adaptation_field.is_none());
    }

    #[test]
    fn pcr_is_decoded_from_adaptation_field() {
        let mut pkt = [0xFFu8; TS_PACKET_SIZE];
        pkt[0] = TS_SYNC_BYTE;
        pkt[1] = 0x01;
        pkt[2] = 0x00;
        pkt[3] = 0x20; // adaptation field only
        pkt[4] = 183; // adaptation field length
        pkt[5] = 0x10; // PCR flag

        // base = 1000, ext = 5
        let base: u64 = 1000;
        let ext: u64 = 5;
        pkt[6] = (base >> 25) as u8;
        pkt[7] = (base >> 17) as u8;
        pkt[8] = (base >> 9) as u8;
        pkt[9] = (base >> 1) as u8;
        pkt[10] = (((base & 0x01) << 7) | ((ext >> 8) & 0x01)) as u8;
        pkt[11] = (ext & 0xFF) as u8;

        let mut factory = TsPacketFactory::new();
        let batch = factory.packets_from_data(&pkt).unwrap();
        let af = batch[0].adaptation_field.expect("adaptation field");
        assert!(af.pcr_flag);
        assert_eq!(af.pcr, base * 300 + ext);
        assert!(!batch[0].contains_payload);
    }

    #[test]
    fn pool_storage_is_reused() {
        let data = stream(256, 4);
        let mut factory = TsPacketFactory::new();
        {
            let batch = factory.packets_from_data(&data).unwrap();
            assert_eq!(batch.len(), 4);
        } // batch dropped, storage returned

        let batch = factory.packets_from_data(&data).unwrap();
        assert_eq!(batch.len(), 4);
    }
}
