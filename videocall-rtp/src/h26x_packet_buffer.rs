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

//! Packet buffer for H264 and H265, which carry no frame boundaries besides
//! the marker bit.
//!
//! A packet becomes usable once it continues one of a few tracked
//! "last continuous" cursors, or when it starts a new coded video sequence.
//! From there the buffer walks forward to each marker bit and backward to the
//! first packet sharing its RTP timestamp.

use std::sync::Arc;

use crate::depacketizer::h264::{NALU_IDR, NALU_PPS, NALU_SPS};
use crate::depacketizer::h265::{self, NALU_VPS};
use crate::environment::Clock;
use crate::frame::FrameType;
use crate::packet::Packet;
use crate::packet_buffer::InsertResult;
use crate::sequence_number_unwrapper::SequenceNumberUnwrapper;
use crate::video_header::CodecHeader;

const BUFFER_SIZE: usize = 2048;
const NUM_TRACKED_SEQUENCES: usize = 5;

#[derive(Debug)]
enum Slot {
    Packet(Packet),
    /// Sequence number received without media.
    Padding(i64),
}

impl Slot {
    fn seq_num(&self) -> i64 {
        match self {
            Slot::Packet(packet) => packet.unwrapped_seq_num,
            Slot::Padding(seq_num) => *seq_num,
        }
    }
}

#[derive(Debug, Default)]
struct ParameterSets {
    has_vps: bool,
    has_sps: bool,
    has_pps: bool,
    has_idr: bool,
}

pub struct H26xPacketBuffer {
    clock: Arc<dyn Clock>,
    idr_only_keyframes_allowed: bool,
    buffer: Vec<Option<Slot>>,
    seq_num_unwrapper: SequenceNumberUnwrapper,
    last_continuous_in_sequence: [i64; NUM_TRACKED_SEQUENCES],
    last_continuous_in_sequence_index: usize,
    cleared_to: Option<i64>,
    last_received_packet_ms: Option<i64>,
    last_received_keyframe_packet_ms: Option<i64>,
}

impl H26xPacketBuffer {
    pub fn new(clock: Arc<dyn Clock>, idr_only_keyframes_allowed: bool) -> Self {
        Self {
            clock,
            idr_only_keyframes_allowed,
            buffer: (0..BUFFER_SIZE).map(|_| None).collect(),
            seq_num_unwrapper: SequenceNumberUnwrapper::new(),
            last_continuous_in_sequence: [i64::MIN; NUM_TRACKED_SEQUENCES],
            last_continuous_in_sequence_index: 0,
            cleared_to: None,
            last_received_packet_ms: None,
            last_received_keyframe_packet_ms: None,
        }
    }

    pub fn insert_packet(&mut self, mut packet: Packet) -> InsertResult {
        debug_assert!(packet.video_header.codec.is_h26x());
        let seq_num = self.seq_num_unwrapper.unwrap(packet.seq_num);
        packet.unwrapped_seq_num = seq_num;
        if !self.store(Slot::Packet(packet)) {
            return InsertResult {
                seq_num,
                ..Default::default()
            };
        }

        let now_ms = self.clock.now_ms();
        self.last_received_packet_ms = Some(now_ms);
        if matches!(self.packet_at(seq_num), Some(p) if p.is_keyframe()) {
            self.last_received_keyframe_packet_ms = Some(now_ms);
        }
        self.find_frames(seq_num)
    }

    /// Padding fills a sequence number so a cursor can move past it.
    pub fn insert_padding(&mut self, seq_num: u16) -> InsertResult {
        let seq_num = self.seq_num_unwrapper.unwrap(seq_num);
        if !self.store(Slot::Padding(seq_num)) {
            return InsertResult {
                seq_num,
                ..Default::default()
            };
        }
        self.find_frames(seq_num)
    }

    /// Drops buffered packets at or before `seq_num` and rejects them from now on.
    pub fn clear_to(&mut self, seq_num: i64) {
        if self.cleared_to.is_some_and(|cleared| cleared >= seq_num) {
            return;
        }
        for slot in self.buffer.iter_mut() {
            if slot.as_ref().is_some_and(|s| s.seq_num() <= seq_num) {
                *slot = None;
            }
        }
        self.cleared_to = Some(seq_num);
    }

    pub fn last_received_packet_ms(&self) -> Option<i64> {
        self.last_received_packet_ms
    }

    pub fn last_received_keyframe_packet_ms(&self) -> Option<i64> {
        self.last_received_keyframe_packet_ms
    }

    /// Number of occupied slots, padding included.
    pub fn len(&self) -> usize {
        self.buffer.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn index_of(seq_num: i64) -> usize {
        seq_num.rem_euclid(BUFFER_SIZE as i64) as usize
    }

    /// Stores `slot` unless it is cleared, a duplicate, or older than what
    /// already occupies its position.
    fn store(&mut self, slot: Slot) -> bool {
        let seq_num = slot.seq_num();
        if self.cleared_to.is_some_and(|cleared| seq_num <= cleared) {
            log::trace!("Dropping H26x packet {seq_num}, buffer is cleared past it");
            return false;
        }
        let entry = &mut self.buffer[Self::index_of(seq_num)];
        if entry.as_ref().is_some_and(|existing| existing.seq_num() >= seq_num) {
            log::trace!("H26x packet {seq_num} is old or a duplicate");
            return false;
        }
        *entry = Some(slot);
        true
    }

    fn slot_at(&self, seq_num: i64) -> Option<&Slot> {
        self.buffer[Self::index_of(seq_num)]
            .as_ref()
            .filter(|slot| slot.seq_num() == seq_num)
    }

    fn packet_at(&self, seq_num: i64) -> Option<&Packet> {
        match self.slot_at(seq_num) {
            Some(Slot::Packet(packet)) => Some(packet),
            _ => None,
        }
    }

    fn continuous_cursor(&self, seq_num: i64) -> Option<usize> {
        self.last_continuous_in_sequence
            .iter()
            .position(|&last| last != i64::MIN && seq_num - 1 == last)
    }

    fn beginning_of_stream(&self, packet: &Packet) -> bool {
        match &packet.video_header.codec_header {
            CodecHeader::H264(h264) => {
                h264.nalus.iter().any(|nalu| nalu.nalu_type == NALU_SPS)
                    || (self.idr_only_keyframes_allowed
                        && h264.nalus.iter().any(|nalu| nalu.nalu_type == NALU_IDR))
            }
            CodecHeader::H265(h265) => {
                h265.nalu_types.contains(&NALU_VPS)
                    || (self.idr_only_keyframes_allowed
                        && h265.nalu_types.iter().any(|&t| h265::is_irap(t)))
            }
            _ => false,
        }
    }

    fn find_frames(&mut self, unwrapped_seq_num: i64) -> InsertResult {
        let mut result = InsertResult {
            seq_num: unwrapped_seq_num,
            ..Default::default()
        };

        let cursor = match self.continuous_cursor(unwrapped_seq_num) {
            Some(cursor) => cursor,
            None => {
                let starts_stream = matches!(
                    self.packet_at(unwrapped_seq_num),
                    Some(packet) if self.beginning_of_stream(packet)
                );
                if !starts_stream {
                    return result;
                }
                let cursor = self.last_continuous_in_sequence_index;
                self.last_continuous_in_sequence_index = (cursor + 1) % NUM_TRACKED_SEQUENCES;
                log::debug!("New coded video sequence at {unwrapped_seq_num}, cursor {cursor}");
                cursor
            }
        };

        let end = unwrapped_seq_num + BUFFER_SIZE as i64;
        let mut seq_num = unwrapped_seq_num;
        while seq_num < end {
            let frame_end = match self.slot_at(seq_num) {
                None => return result,
                Some(Slot::Packet(packet)) if packet.marker_bit => Some(packet.timestamp),
                Some(_) => None,
            };
            self.last_continuous_in_sequence[cursor] = seq_num;

            if let Some(rtp_timestamp) = frame_end {
                let mut start_seq_num = seq_num;
                while start_seq_num > seq_num - BUFFER_SIZE as i64 {
                    match self.packet_at(start_seq_num - 1) {
                        Some(prev) if prev.timestamp == rtp_timestamp => start_seq_num -= 1,
                        _ => break,
                    }
                }
                if !self.maybe_assemble_frame(start_seq_num, seq_num, &mut result) {
                    return result;
                }
            }
            seq_num += 1;
        }
        result
    }

    fn maybe_assemble_frame(&mut self, start: i64, end: i64, result: &mut InsertResult) -> bool {
        let mut sets = ParameterSets::default();
        let mut width = 0;
        let mut height = 0;

        for seq_num in start..=end {
            let Some(packet) = self.packet_at(seq_num) else {
                return false;
            };
            match &packet.video_header.codec_header {
                CodecHeader::H264(h264) => {
                    for nalu in &h264.nalus {
                        sets.has_idr |= nalu.nalu_type == NALU_IDR;
                        sets.has_sps |= nalu.nalu_type == NALU_SPS;
                        sets.has_pps |= nalu.nalu_type == NALU_PPS;
                    }
                    if sets.has_idr
                        && !self.idr_only_keyframes_allowed
                        && (!sets.has_sps || !sets.has_pps)
                    {
                        log::debug!("H264 IDR at {seq_num} without SPS/PPS, not assembling");
                        return false;
                    }
                }
                CodecHeader::H265(h265) => {
                    for &nalu_type in &h265.nalu_types {
                        sets.has_idr |= h265::is_irap(nalu_type);
                        sets.has_vps |= nalu_type == NALU_VPS;
                        sets.has_sps |= nalu_type == h265::NALU_SPS;
                        sets.has_pps |= nalu_type == h265::NALU_PPS;
                    }
                    if sets.has_idr
                        && !self.idr_only_keyframes_allowed
                        && (!sets.has_vps || !sets.has_sps || !sets.has_pps)
                    {
                        log::debug!("H265 IRAP at {seq_num} without VPS/SPS/PPS, not assembling");
                        return false;
                    }
                }
                _ => {}
            }
            width = width.max(packet.video_header.width);
            height = height.max(packet.video_header.height);
        }

        for seq_num in start..=end {
            let index = Self::index_of(seq_num);
            let Some(Slot::Packet(mut packet)) = self.buffer[index].take() else {
                continue;
            };
            packet.video_header.is_first_packet_in_frame = seq_num == start;
            packet.video_header.is_last_packet_in_frame = seq_num == end;
            if packet.video_header.is_first_packet_in_frame {
                if width > 0 && height > 0 {
                    packet.video_header.width = width;
                    packet.video_header.height = height;
                }
                packet.video_header.frame_type = if sets.has_idr {
                    FrameType::KeyFrame
                } else {
                    FrameType::DeltaFrame
                };
            }
            result.packets.push(packet);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::depacketizer::h264::{NALU_FU_A, NALU_SLICE, NALU_STAP_A};
    use crate::environment::SimulatedClock;
    use crate::video_header::{
        H264Header, H264PacketizationType, H265Header, NaluInfo, VideoCodec, VideoHeader,
    };

    struct H264PacketBuilder {
        seq_num: u16,
        timestamp: u32,
        marker: bool,
        packetization_type: H264PacketizationType,
        nalus: Vec<u8>,
        width: u16,
        height: u16,
    }

    fn h264(packetization_type: H264PacketizationType) -> H264PacketBuilder {
        H264PacketBuilder {
            seq_num: 0,
            timestamp: 0,
            marker: false,
            packetization_type,
            nalus: Vec::new(),
            width: 0,
            height: 0,
        }
    }

    impl H264PacketBuilder {
        fn sps(mut self) -> Self {
            self.nalus.push(NALU_SPS);
            self
        }
        fn pps(mut self) -> Self {
            self.nalus.push(NALU_PPS);
            self
        }
        fn idr(mut self) -> Self {
            self.nalus.push(NALU_IDR);
            self
        }
        fn slice(mut self) -> Self {
            self.nalus.push(NALU_SLICE);
            self
        }
        fn seq_num(mut self, seq_num: u16) -> Self {
            self.seq_num = seq_num;
            self
        }
        fn time(mut self, timestamp: u32) -> Self {
            self.timestamp = timestamp;
            self
        }
        fn marker(mut self) -> Self {
            self.marker = true;
            self
        }
        fn resolution(mut self, width: u16, height: u16) -> Self {
            self.width = width;
            self.height = height;
            self
        }
        fn build(self) -> Packet {
            let mut video_header = VideoHeader::new(VideoCodec::H264);
            video_header.width = self.width;
            video_header.height = self.height;
            let nalu_type = match self.packetization_type {
                H264PacketizationType::StapA => NALU_STAP_A,
                H264PacketizationType::FuA => NALU_FU_A,
                H264PacketizationType::SingleNalu => self.nalus.first().copied().unwrap_or(0),
            };
            video_header.codec_header = CodecHeader::H264(H264Header {
                packetization_type: self.packetization_type,
                nalu_type,
                nalus: self
                    .nalus
                    .iter()
                    .map(|&nalu_type| NaluInfo {
                        nalu_type,
                        sps_id: None,
                        pps_id: None,
                    })
                    .collect(),
            });
            Packet {
                seq_num: self.seq_num,
                unwrapped_seq_num: i64::from(self.seq_num),
                timestamp: self.timestamp,
                marker_bit: self.marker,
                payload_type: 96,
                video_header,
                payload: vec![self.seq_num as u8],
            }
        }
    }

    fn h265_packet(seq_num: u16, timestamp: u32, marker: bool, nalu_types: &[u8]) -> Packet {
        let mut video_header = VideoHeader::new(VideoCodec::H265);
        video_header.codec_header = CodecHeader::H265(H265Header {
            nalu_types: nalu_types.to_vec(),
            is_fragment: false,
        });
        Packet {
            seq_num,
            unwrapped_seq_num: i64::from(seq_num),
            timestamp,
            marker_bit: marker,
            payload_type: 96,
            video_header,
            payload: vec![seq_num as u8],
        }
    }

    fn create_buffer(idr_only_keyframes_allowed: bool) -> H26xPacketBuffer {
        H26xPacketBuffer::new(Arc::new(SimulatedClock::new(0)), idr_only_keyframes_allowed)
    }

    use H264PacketizationType::{FuA, SingleNalu, StapA};

    #[test]
    fn test_idr_is_keyframe_when_idr_only_allowed() {
        let mut buffer = create_buffer(true);
        let result = buffer.insert_packet(h264(SingleNalu).idr().marker().build());
        assert_eq!(result.packets.len(), 1);
        assert_eq!(result.packets[0].video_header.frame_type, FrameType::KeyFrame);
    }

    #[test]
    fn test_idr_is_not_keyframe_without_parameter_sets() {
        let mut buffer = create_buffer(false);
        let result = buffer.insert_packet(h264(SingleNalu).idr().marker().build());
        assert!(result.packets.is_empty());
    }

    #[test]
    fn test_idr_sps_pps_is_keyframe_single_nalus() {
        let mut buffer = create_buffer(false);
        assert!(buffer
            .insert_packet(h264(SingleNalu).sps().seq_num(0).build())
            .packets
            .is_empty());
        assert!(buffer
            .insert_packet(h264(SingleNalu).pps().seq_num(1).build())
            .packets
            .is_empty());
        let result = buffer.insert_packet(h264(SingleNalu).idr().seq_num(2).marker().build());
        assert_eq!(result.packets.len(), 3);
        assert_eq!(result.packets[0].video_header.frame_type, FrameType::KeyFrame);
    }

    #[test]
    fn test_inserting_sps_pps_last_generates_keyframe() {
        let mut buffer = create_buffer(false);
        assert!(buffer
            .insert_packet(h264(SingleNalu).idr().seq_num(2).marker().build())
            .packets
            .is_empty());
        assert!(buffer
            .insert_packet(h264(SingleNalu).pps().seq_num(1).build())
            .packets
            .is_empty());
        let result = buffer.insert_packet(h264(SingleNalu).sps().seq_num(0).build());
        assert_eq!(result.packets.len(), 3);
    }

    #[test]
    fn test_inserting_mid_fua_completes_frame() {
        let mut buffer = create_buffer(false);
        assert_eq!(
            buffer
                .insert_packet(h264(StapA).sps().pps().idr().seq_num(0).time(0).marker().build())
                .packets
                .len(),
            1
        );
        assert!(buffer
            .insert_packet(h264(FuA).slice().seq_num(1).time(1).build())
            .packets
            .is_empty());
        assert!(buffer
            .insert_packet(h264(FuA).seq_num(3).time(1).marker().build())
            .packets
            .is_empty());
        let result = buffer.insert_packet(h264(FuA).seq_num(2).time(1).build());
        assert_eq!(result.packets.len(), 3);
        assert_eq!(result.packets[0].video_header.frame_type, FrameType::DeltaFrame);
    }

    #[test]
    fn test_seq_num_jump_does_not_complete_frame() {
        let mut buffer = create_buffer(false);
        assert_eq!(
            buffer
                .insert_packet(h264(StapA).sps().pps().idr().seq_num(0).time(0).marker().build())
                .packets
                .len(),
            1
        );
        assert!(buffer
            .insert_packet(h264(FuA).slice().seq_num(1).time(1).build())
            .packets
            .is_empty());
        let result = buffer.insert_packet(
            h264(FuA)
                .slice()
                .seq_num(2 + BUFFER_SIZE as u16)
                .time(3)
                .marker()
                .build(),
        );
        assert!(result.packets.is_empty());
    }

    #[test]
    fn test_different_timestamps_do_not_complete_frame() {
        let mut buffer = create_buffer(false);
        assert!(buffer
            .insert_packet(h264(SingleNalu).sps().seq_num(0).time(0).build())
            .packets
            .is_empty());
        let result =
            buffer.insert_packet(h264(SingleNalu).pps().seq_num(1).time(1).marker().build());
        assert_eq!(result.packets.len(), 1);
        assert_eq!(result.packets[0].seq_num, 1);
    }

    #[test]
    fn test_frame_boundaries_and_resolution_are_set() {
        let mut buffer = create_buffer(false);
        buffer.insert_packet(
            h264(StapA)
                .sps()
                .pps()
                .seq_num(1)
                .time(1)
                .resolution(320, 240)
                .build(),
        );
        buffer.insert_packet(h264(FuA).idr().seq_num(2).time(1).build());
        let result = buffer.insert_packet(h264(FuA).seq_num(3).time(1).marker().build());
        assert_eq!(result.packets.len(), 3);
        let first = &result.packets[0].video_header;
        assert!(first.is_first_packet_in_frame);
        assert!(!first.is_last_packet_in_frame);
        assert_eq!((first.width, first.height), (320, 240));
        assert!(!result.packets[1].video_header.is_first_packet_in_frame);
        assert!(!result.packets[1].video_header.is_last_packet_in_frame);
        assert!(result.packets[2].video_header.is_last_packet_in_frame);
    }

    #[test]
    fn test_rtp_seq_num_wrap() {
        let mut buffer = create_buffer(false);
        assert!(buffer
            .insert_packet(h264(StapA).sps().pps().seq_num(65534).time(0).build())
            .packets
            .is_empty());
        let result = buffer.insert_packet(h264(FuA).idr().seq_num(65535).time(0).marker().build());
        assert_eq!(result.packets.len(), 2);
        let result = buffer.insert_packet(h264(FuA).slice().seq_num(0).time(1).marker().build());
        assert_eq!(result.packets.len(), 1);
        assert_eq!(result.packets[0].unwrapped_seq_num, 65536);
    }

    #[test]
    fn test_duplicate_packet_is_ignored() {
        let mut buffer = create_buffer(false);
        buffer.insert_packet(h264(SingleNalu).sps().seq_num(0).time(0).build());
        let duplicate = buffer.insert_packet(h264(SingleNalu).sps().seq_num(0).time(0).build());
        assert!(duplicate.packets.is_empty());
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_padding_bridges_gap_between_frames() {
        let mut buffer = create_buffer(false);
        assert_eq!(
            buffer
                .insert_packet(h264(StapA).sps().pps().idr().seq_num(10).time(0).marker().build())
                .packets
                .len(),
            1
        );
        assert!(buffer
            .insert_packet(h264(SingleNalu).slice().seq_num(12).time(1).marker().build())
            .packets
            .is_empty());
        let result = buffer.insert_padding(11);
        assert_eq!(result.packets.len(), 1);
        assert_eq!(result.packets[0].seq_num, 12);
    }

    #[test]
    fn test_interleaved_sequences_use_separate_cursors() {
        let mut buffer = create_buffer(false);
        buffer.insert_packet(h264(StapA).sps().pps().idr().seq_num(100).time(0).marker().build());
        buffer.insert_packet(h264(StapA).sps().pps().idr().seq_num(200).time(5).marker().build());
        let a =
            buffer.insert_packet(h264(SingleNalu).slice().seq_num(101).time(1).marker().build());
        let b =
            buffer.insert_packet(h264(SingleNalu).slice().seq_num(201).time(6).marker().build());
        assert_eq!(a.packets.len(), 1);
        assert_eq!(b.packets.len(), 1);
    }

    #[test]
    fn test_clear_to_rejects_old_packets() {
        let mut buffer = create_buffer(false);
        buffer.insert_packet(h264(SingleNalu).sps().seq_num(0).time(0).build());
        buffer.insert_packet(h264(SingleNalu).slice().seq_num(5).time(9).build());
        buffer.clear_to(3);
        assert_eq!(buffer.len(), 1);
        let result = buffer.insert_packet(h264(SingleNalu).pps().seq_num(1).time(0).build());
        assert!(result.packets.is_empty());
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_h265_requires_vps_sps_pps() {
        let mut buffer = create_buffer(false);
        let result = buffer.insert_packet(h265_packet(0, 0, true, &[NALU_VPS, h265::NALU_SPS, 19]));
        assert!(result.packets.is_empty());

        let result = buffer.insert_packet(h265_packet(
            1,
            1,
            true,
            &[NALU_VPS, h265::NALU_SPS, h265::NALU_PPS, 19],
        ));
        assert_eq!(result.packets.len(), 1);
        assert_eq!(result.packets[0].video_header.frame_type, FrameType::KeyFrame);

        let result = buffer.insert_packet(h265_packet(2, 2, true, &[1]));
        assert_eq!(result.packets.len(), 1);
        assert_eq!(result.packets[0].video_header.frame_type, FrameType::DeltaFrame);
    }
}
