/*
 * Copyright 2025 Security Union LLC
 *
 * Licensed under either of
 *
 * * Apache License, Version 2.0
 *   (http://www.apache.org/licenses/LICENSE-2.0)
 * * MIT license
 *   (http://opensource.org/licenses/MIT)
 *
 * at your option.
 *
 * Unless you explicitly state otherwise, any contribution intentionally
 * submitted for inclusion in the work by you, as defined in the Apache-2.0
 * license, shall be dual licensed as above, without any additional terms or
 * conditions.
 */

//! Ring buffer that turns depacketized RTP packets into complete packet runs.
//!
//! Packets are addressed by their unwrapped sequence number modulo the ring
//! size. A packet is *continuous* when it starts a frame or follows a
//! continuous packet of the same RTP timestamp. Once a continuous packet is
//! the last one of its frame, the whole run is handed out and its slots freed.

use std::sync::Arc;

use crate::environment::Clock;
use crate::packet::Packet;
use crate::sequence_number_unwrapper::SequenceNumberUnwrapper;

/// Outcome of a buffer insertion.
#[derive(Debug, Default)]
pub struct InsertResult {
    /// Unwrapped sequence number the buffer assigned to the inserted packet
    pub seq_num: i64,
    /// Packets of completed frames, frame after frame in sequence order
    pub packets: Vec<Packet>,
    /// The buffer ran out of space and dropped everything; a key frame is needed
    pub buffer_cleared: bool,
}

#[derive(Debug)]
struct Slot {
    packet: Packet,
    continuous: bool,
}

pub struct PacketBuffer {
    clock: Arc<dyn Clock>,
    max_size: usize,
    buffer: Vec<Option<Slot>>,
    seq_num_unwrapper: SequenceNumberUnwrapper,
    /// Oldest sequence number the buffer still accepts
    first_seq_num: i64,
    first_packet_received: bool,
    /// Set by `clear_to`, packets older than `first_seq_num` are then rejected
    is_cleared_to_first_seq_num: bool,
    last_received_packet_ms: Option<i64>,
    last_received_keyframe_packet_ms: Option<i64>,
    last_received_keyframe_rtp_timestamp: Option<u32>,
}

impl PacketBuffer {
    /// Both sizes must be powers of two with `start_size <= max_size`.
    pub fn new(clock: Arc<dyn Clock>, start_size: usize, max_size: usize) -> Self {
        debug_assert!(start_size.is_power_of_two() && max_size.is_power_of_two());
        debug_assert!(start_size <= max_size);
        Self {
            clock,
            max_size,
            buffer: (0..start_size).map(|_| None).collect(),
            seq_num_unwrapper: SequenceNumberUnwrapper::new(),
            first_seq_num: 0,
            first_packet_received: false,
            is_cleared_to_first_seq_num: false,
            last_received_packet_ms: None,
            last_received_keyframe_packet_ms: None,
            last_received_keyframe_rtp_timestamp: None,
        }
    }

    pub fn insert_packet(&mut self, mut packet: Packet) -> InsertResult {
        let seq_num = self.seq_num_unwrapper.unwrap(packet.seq_num);
        packet.unwrapped_seq_num = seq_num;
        let mut result = InsertResult {
            seq_num,
            ..Default::default()
        };

        if !self.first_packet_received {
            self.first_seq_num = seq_num;
            self.first_packet_received = true;
        } else if seq_num < self.first_seq_num {
            if self.is_cleared_to_first_seq_num {
                log::trace!("Dropping packet {seq_num}, buffer is cleared past it");
                return result;
            }
            self.first_seq_num = seq_num;
        }

        let mut index = self.index_of(seq_num);
        if let Some(slot) = &self.buffer[index] {
            if slot.packet.unwrapped_seq_num == seq_num {
                log::trace!("Duplicate packet {seq_num} ignored");
                return result;
            }
            while self.expand_buffer_size() && self.buffer[self.index_of(seq_num)].is_some() {}
            index = self.index_of(seq_num);
            if self.buffer[index].is_some() {
                log::warn!("Clear PacketBuffer and request key frame");
                self.clear();
                result.buffer_cleared = true;
                return result;
            }
        }

        let now_ms = self.clock.now_ms();
        self.last_received_packet_ms = Some(now_ms);
        if packet.is_keyframe()
            || self.last_received_keyframe_rtp_timestamp == Some(packet.timestamp)
        {
            self.last_received_keyframe_packet_ms = Some(now_ms);
            self.last_received_keyframe_rtp_timestamp = Some(packet.timestamp);
        }

        self.buffer[index] = Some(Slot {
            packet,
            continuous: false,
        });
        result.packets = self.find_frames(seq_num);
        result
    }

    /// A padding packet carries no media, but the sequence number after it may
    /// now start a complete frame.
    pub fn insert_padding(&mut self, seq_num: u16) -> InsertResult {
        let seq_num = self.seq_num_unwrapper.unwrap(seq_num);
        InsertResult {
            seq_num,
            packets: self.find_frames(seq_num + 1),
            buffer_cleared: false,
        }
    }

    /// Forgets every packet with an unwrapped sequence number at or before `seq_num`.
    pub fn clear_to(&mut self, seq_num: i64) {
        if self.is_cleared_to_first_seq_num && self.first_seq_num > seq_num {
            return;
        }
        if !self.first_packet_received {
            return;
        }

        let clear_before = seq_num + 1;
        let diff = clear_before - self.first_seq_num;
        if diff > 0 {
            let iterations = (diff as usize).min(self.buffer.len());
            for i in 0..iterations {
                let index = self.index_of(self.first_seq_num + i as i64);
                let stale = matches!(
                    &self.buffer[index],
                    Some(slot) if slot.packet.unwrapped_seq_num < clear_before
                );
                if stale {
                    self.buffer[index] = None;
                }
            }
        }
        self.first_seq_num = clear_before;
        self.is_cleared_to_first_seq_num = true;
    }

    /// Drops all packets. The unwrapper keeps its history so that sequence
    /// numbers stay comparable across the reset.
    pub fn clear(&mut self) {
        let dropped = self.len();
        for slot in self.buffer.iter_mut() {
            *slot = None;
        }
        self.first_packet_received = false;
        self.is_cleared_to_first_seq_num = false;
        self.last_received_packet_ms = None;
        self.last_received_keyframe_packet_ms = None;
        self.last_received_keyframe_rtp_timestamp = None;
        log::debug!("Cleared {dropped} packets from PacketBuffer");
    }

    /// Current number of slots.
    pub fn size(&self) -> usize {
        self.buffer.len()
    }

    /// Number of buffered packets.
    pub fn len(&self) -> usize {
        self.buffer.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.iter().all(|slot| slot.is_none())
    }

    pub fn last_received_packet_ms(&self) -> Option<i64> {
        self.last_received_packet_ms
    }

    pub fn last_received_keyframe_packet_ms(&self) -> Option<i64> {
        self.last_received_keyframe_packet_ms
    }

    fn index_of(&self, seq_num: i64) -> usize {
        seq_num.rem_euclid(self.buffer.len() as i64) as usize
    }

    fn expand_buffer_size(&mut self) -> bool {
        let size = self.buffer.len();
        if size == self.max_size {
            log::warn!(
                "PacketBuffer is already at max size ({}), failed to increase size",
                self.max_size
            );
            return false;
        }
        let new_size = (2 * size).min(self.max_size);
        let old_buffer = std::mem::take(&mut self.buffer);
        self.buffer = (0..new_size).map(|_| None).collect();
        for slot in old_buffer.into_iter().flatten() {
            let index = self.index_of(slot.packet.unwrapped_seq_num);
            self.buffer[index] = Some(slot);
        }
        log::debug!("PacketBuffer size expanded to {new_size}");
        true
    }

    fn slot(&self, seq_num: i64) -> Option<&Slot> {
        self.buffer[self.index_of(seq_num)]
            .as_ref()
            .filter(|slot| slot.packet.unwrapped_seq_num == seq_num)
    }

    fn potential_new_frame(&self, seq_num: i64) -> bool {
        let Some(entry) = self.slot(seq_num) else {
            return false;
        };
        if entry.packet.is_first_packet_in_frame() {
            return true;
        }
        match self.slot(seq_num - 1) {
            Some(prev) => prev.continuous && prev.packet.timestamp == entry.packet.timestamp,
            None => false,
        }
    }

    fn find_frames(&mut self, mut seq_num: i64) -> Vec<Packet> {
        let mut found_packets = Vec::new();
        for _ in 0..self.buffer.len() {
            if !self.potential_new_frame(seq_num) {
                break;
            }
            let index = self.index_of(seq_num);
            let Some(slot) = self.buffer[index].as_mut() else {
                break;
            };
            slot.continuous = true;

            if slot.packet.is_last_packet_in_frame() {
                let mut start_seq_num = seq_num;
                let mut tested_packets = 1;
                while tested_packets < self.buffer.len() {
                    match self.slot(start_seq_num) {
                        Some(start) if !start.packet.is_first_packet_in_frame() => {
                            start_seq_num -= 1;
                            tested_packets += 1;
                        }
                        _ => break,
                    }
                }
                for frame_seq_num in start_seq_num..=seq_num {
                    let index = self.index_of(frame_seq_num);
                    if let Some(slot) = self.buffer[index].take() {
                        found_packets.push(slot.packet);
                    }
                }
            }
            seq_num += 1;
        }
        found_packets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::SimulatedClock;
    use crate::frame::FrameType;
    use crate::video_header::{VideoCodec, VideoHeader};

    const START_SIZE: usize = 16;
    const MAX_SIZE: usize = 64;

    fn create_test_buffer() -> PacketBuffer {
        PacketBuffer::new(Arc::new(SimulatedClock::new(0)), START_SIZE, MAX_SIZE)
    }

    fn create_test_packet(
        seq_num: u16,
        timestamp: u32,
        first: bool,
        last: bool,
        data: &[u8],
    ) -> Packet {
        let mut video_header = VideoHeader::new(VideoCodec::Generic);
        video_header.is_first_packet_in_frame = first;
        video_header.is_last_packet_in_frame = last;
        Packet {
            seq_num,
            unwrapped_seq_num: i64::from(seq_num),
            timestamp,
            marker_bit: last,
            payload_type: 96,
            video_header,
            payload: data.to_vec(),
        }
    }

    fn seq_nums(result: &InsertResult) -> Vec<u16> {
        result.packets.iter().map(|p| p.seq_num).collect()
    }

    #[test]
    fn test_insert_one_packet_frame() {
        let mut buffer = create_test_buffer();
        let result = buffer.insert_packet(create_test_packet(10, 1000, true, true, b"a"));
        assert_eq!(seq_nums(&result), vec![10]);
        assert!(!result.buffer_cleared);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_insert_frame_out_of_order() {
        let mut buffer = create_test_buffer();
        assert!(buffer
            .insert_packet(create_test_packet(12, 1000, false, true, b"c"))
            .packets
            .is_empty());
        assert!(buffer
            .insert_packet(create_test_packet(11, 1000, false, false, b"b"))
            .packets
            .is_empty());
        let result = buffer.insert_packet(create_test_packet(10, 1000, true, false, b"a"));
        assert_eq!(seq_nums(&result), vec![10, 11, 12]);
        assert_eq!(result.packets[1].unwrapped_seq_num, 11);
    }

    #[test]
    fn test_duplicate_packet_is_ignored() {
        let mut buffer = create_test_buffer();
        assert!(buffer
            .insert_packet(create_test_packet(5, 1000, true, false, b"a"))
            .packets
            .is_empty());
        assert!(buffer
            .insert_packet(create_test_packet(5, 1000, true, false, b"x"))
            .packets
            .is_empty());
        assert_eq!(buffer.len(), 1);
        let result = buffer.insert_packet(create_test_packet(6, 1000, false, true, b"b"));
        assert_eq!(seq_nums(&result), vec![5, 6]);
        assert_eq!(result.packets[0].payload, b"a".to_vec());
    }

    #[test]
    fn test_frame_across_sequence_number_wraparound() {
        let mut buffer = create_test_buffer();
        buffer.insert_packet(create_test_packet(65534, 1000, true, false, b"a"));
        buffer.insert_packet(create_test_packet(0, 1000, false, false, b"c"));
        buffer.insert_packet(create_test_packet(1, 1000, false, true, b"d"));
        let result = buffer.insert_packet(create_test_packet(65535, 1000, false, false, b"b"));
        assert_eq!(seq_nums(&result), vec![65534, 65535, 0, 1]);
        let unwrapped: Vec<i64> = result.packets.iter().map(|p| p.unwrapped_seq_num).collect();
        assert_eq!(unwrapped, vec![65534, 65535, 65536, 65537]);
    }

    #[test]
    fn test_different_timestamps_break_the_run() {
        let mut buffer = create_test_buffer();
        buffer.insert_packet(create_test_packet(1, 1000, true, false, b"a"));
        let result = buffer.insert_packet(create_test_packet(2, 2000, false, true, b"b"));
        assert!(result.packets.is_empty());
    }

    #[test]
    fn test_frames_complete_independently() {
        let mut buffer = create_test_buffer();
        let result = buffer.insert_packet(create_test_packet(2, 2000, true, true, b"b"));
        assert_eq!(seq_nums(&result), vec![2]);
        let result = buffer.insert_packet(create_test_packet(1, 1000, true, true, b"a"));
        assert_eq!(seq_nums(&result), vec![1]);

        buffer.insert_packet(create_test_packet(4, 3000, false, true, b"d"));
        let result = buffer.insert_packet(create_test_packet(3, 3000, true, false, b"c"));
        assert_eq!(seq_nums(&result), vec![3, 4]);
    }

    #[test]
    fn test_missing_first_packet_never_completes() {
        let mut buffer = create_test_buffer();
        buffer.insert_packet(create_test_packet(11, 1000, false, false, b"b"));
        let result = buffer.insert_packet(create_test_packet(12, 1000, false, true, b"c"));
        assert!(result.packets.is_empty());
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn test_buffer_grows_instead_of_clearing() {
        let mut buffer = create_test_buffer();
        for seq in 0..(START_SIZE as u16 + 4) {
            let result = buffer.insert_packet(create_test_packet(seq, 1000, seq == 0, false, b"x"));
            assert!(!result.buffer_cleared);
        }
        assert_eq!(buffer.size(), START_SIZE * 2);
        assert_eq!(buffer.len(), START_SIZE + 4);
        let result = buffer.insert_packet(create_test_packet(
            START_SIZE as u16 + 4,
            1000,
            false,
            true,
            b"x",
        ));
        assert_eq!(result.packets.len(), START_SIZE + 5);
    }

    #[test]
    fn test_buffer_clears_when_it_cannot_grow() {
        let mut buffer =
            PacketBuffer::new(Arc::new(SimulatedClock::new(0)), START_SIZE, START_SIZE);
        buffer.insert_packet(create_test_packet(0, 1000, true, false, b"a"));
        let result = buffer.insert_packet(create_test_packet(
            START_SIZE as u16,
            2000,
            true,
            false,
            b"b",
        ));
        assert!(result.buffer_cleared);
        assert!(result.packets.is_empty());
        assert!(buffer.is_empty());

        let result = buffer.insert_packet(create_test_packet(100, 3000, true, true, b"c"));
        assert_eq!(seq_nums(&result), vec![100]);
    }

    #[test]
    fn test_clear_to_drops_old_packets_and_rejects_late_ones() {
        let mut buffer = create_test_buffer();
        buffer.insert_packet(create_test_packet(10, 1000, true, false, b"a"));
        buffer.insert_packet(create_test_packet(12, 1000, false, true, b"c"));
        buffer.insert_packet(create_test_packet(20, 2000, true, false, b"d"));

        buffer.clear_to(12);
        assert_eq!(buffer.len(), 1);

        let result = buffer.insert_packet(create_test_packet(11, 1000, false, false, b"b"));
        assert!(result.packets.is_empty());
        assert_eq!(buffer.len(), 1);

        let result = buffer.insert_packet(create_test_packet(21, 2000, false, true, b"e"));
        assert_eq!(seq_nums(&result), vec![20, 21]);
    }

    #[test]
    fn test_clear_to_before_first_packet_is_noop() {
        let mut buffer = create_test_buffer();
        buffer.clear_to(100);
        let result = buffer.insert_packet(create_test_packet(5, 1000, true, true, b"a"));
        assert_eq!(seq_nums(&result), vec![5]);
    }

    #[test]
    fn test_insert_padding_without_pending_frame_returns_nothing() {
        let mut buffer = create_test_buffer();
        buffer.insert_packet(create_test_packet(1, 1000, true, true, b"a"));
        let result = buffer.insert_padding(2);
        assert!(result.packets.is_empty());
        assert!(!result.buffer_cleared);
    }

    #[test]
    fn test_receive_times_use_injected_clock() {
        let clock = Arc::new(SimulatedClock::new(500));
        let mut buffer = PacketBuffer::new(clock.clone(), START_SIZE, MAX_SIZE);
        assert_eq!(buffer.last_received_packet_ms(), None);

        let mut key = create_test_packet(1, 1000, true, false, b"k");
        key.video_header.frame_type = FrameType::KeyFrame;
        buffer.insert_packet(key);
        clock.advance_ms(10);
        buffer.insert_packet(create_test_packet(2, 1000, false, false, b"k"));
        clock.advance_ms(10);
        buffer.insert_packet(create_test_packet(3, 2000, true, true, b"d"));

        assert_eq!(buffer.last_received_packet_ms(), Some(520));
        assert_eq!(buffer.last_received_keyframe_packet_ms(), Some(510));
    }
}
