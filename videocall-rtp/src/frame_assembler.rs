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

//! Turns RTP packets into complete, decodable encoded frames.
//!
//! The assembler owns the depacketizer of one codec, a packet buffer and a
//! reference finder. Every call to [`FrameAssembler::insert_packet`] returns the
//! frames that became decodable because of that packet, which may be none or
//! several when the packet closes a gap.

use std::collections::VecDeque;

use crate::config::AssemblerConfig;
use crate::depacketizer::{CodecDepacketizer, Depacketizer};
use crate::dependency_descriptor::{DependencyDescriptor, FrameDependencyStructure};
use crate::environment::Environment;
use crate::error::{Result, RtpError};
use crate::frame::{EncodedFrame, FrameType};
use crate::generic_frame_descriptor::GenericFrameDescriptor;
use crate::h26x_packet_buffer::H26xPacketBuffer;
use crate::packet::Packet;
use crate::packet_buffer::{InsertResult, PacketBuffer};
use crate::reference_finder::ReferenceFinder;
use crate::rtp_packet::{RtpExtension, RtpPacketReceived};
use crate::sequence_number_unwrapper::SequenceNumberUnwrapper;
use crate::statistics::{AssemblerStatistics, StatisticsCalculator};
use crate::video_header::{GenericDescriptorInfo, VideoCodec, VideoHeader};

/// H264 and H265 carry no frame boundaries in their payload headers and use
/// the continuity tracker instead of the generic ring buffer.
enum FramePacketBuffer {
    Generic(PacketBuffer),
    H26x(H26xPacketBuffer),
}

impl FramePacketBuffer {
    fn insert_packet(&mut self, packet: Packet) -> InsertResult {
        match self {
            Self::Generic(buffer) => buffer.insert_packet(packet),
            Self::H26x(buffer) => buffer.insert_packet(packet),
        }
    }

    fn insert_padding(&mut self, seq_num: u16) -> InsertResult {
        match self {
            Self::Generic(buffer) => buffer.insert_padding(seq_num),
            Self::H26x(buffer) => buffer.insert_padding(seq_num),
        }
    }

    fn clear_to(&mut self, seq_num: i64) {
        match self {
            Self::Generic(buffer) => buffer.clear_to(seq_num),
            Self::H26x(buffer) => buffer.clear_to(seq_num),
        }
    }

    fn last_received_packet_ms(&self) -> Option<i64> {
        match self {
            Self::Generic(buffer) => buffer.last_received_packet_ms(),
            Self::H26x(buffer) => buffer.last_received_packet_ms(),
        }
    }

    fn last_received_keyframe_packet_ms(&self) -> Option<i64> {
        match self {
            Self::Generic(buffer) => buffer.last_received_keyframe_packet_ms(),
            Self::H26x(buffer) => buffer.last_received_keyframe_packet_ms(),
        }
    }
}

/// RTP video frame assembler for a single SSRC.
pub struct FrameAssembler {
    config: AssemblerConfig,
    depacketizer: CodecDepacketizer,
    packet_buffer: FramePacketBuffer,
    reference_finder: ReferenceFinder,
    statistics: StatisticsCalculator,
    /// Dependency descriptor frame numbers
    frame_id_unwrapper: SequenceNumberUnwrapper,
    /// Generic frame descriptor frame ids
    generic_frame_id_unwrapper: SequenceNumberUnwrapper,
    video_structure: Option<FrameDependencyStructure>,
    video_structure_frame_id: Option<i64>,
    /// Emitted frame id to its last sequence number, sorted by frame id
    frame_id_to_seq_num: VecDeque<(i64, i64)>,
    cleared_frame_id: Option<i64>,
    keyframe_requested: bool,
}

impl FrameAssembler {
    pub fn new(env: &Environment, config: AssemblerConfig) -> Result<Self> {
        config.validate()?;

        let packet_buffer = if config.codec.is_h26x() {
            FramePacketBuffer::H26x(H26xPacketBuffer::new(
                env.clock(),
                config.h26x.idr_only_keyframes_allowed,
            ))
        } else {
            FramePacketBuffer::Generic(PacketBuffer::new(
                env.clock(),
                config.packet_buffer.start_size,
                config.packet_buffer.max_size,
            ))
        };
        log::debug!("Creating frame assembler for {:?}", config.codec);

        Ok(Self {
            depacketizer: CodecDepacketizer::new(config.codec),
            packet_buffer,
            reference_finder: ReferenceFinder::new(&config),
            statistics: StatisticsCalculator::new(),
            frame_id_unwrapper: SequenceNumberUnwrapper::new(),
            generic_frame_id_unwrapper: SequenceNumberUnwrapper::new(),
            video_structure: None,
            video_structure_frame_id: None,
            frame_id_to_seq_num: VecDeque::new(),
            cleared_frame_id: None,
            keyframe_requested: false,
            config,
        })
    }

    pub fn codec(&self) -> VideoCodec {
        self.config.codec
    }

    /// Inserts one RTP packet and returns every frame it made decodable.
    ///
    /// Malformed packets are logged, counted in [`Self::statistics`] and
    /// otherwise ignored.
    pub fn insert_packet(&mut self, rtp_packet: &RtpPacketReceived) -> Vec<EncodedFrame> {
        self.statistics.packet_received();
        let seq_num = rtp_packet.sequence_number();

        if rtp_packet.payload().is_empty() {
            return self.update_with_padding(seq_num);
        }

        let parsed = match self.depacketizer.parse(rtp_packet.payload()) {
            Ok(parsed) => parsed,
            Err(e) => {
                log::warn!(
                    "ssrc: {} dropping packet {seq_num}: {e}",
                    rtp_packet.ssrc()
                );
                self.statistics.malformed_packet();
                return Vec::new();
            }
        };
        if parsed.payload.is_empty() {
            return self.update_with_padding(seq_num);
        }

        let mut video_header = parsed.video_header;
        if let Err(e) = self.apply_descriptor_extensions(rtp_packet, &mut video_header) {
            log::warn!(
                "ssrc: {} dropping packet {seq_num}: {e}",
                rtp_packet.ssrc()
            );
            match e {
                RtpError::StaleStructure { .. } => self.statistics.stale_structure(),
                _ => self.statistics.malformed_extension(),
            }
            return Vec::new();
        }
        video_header.is_last_packet_in_frame |= rtp_packet.marker();

        let packet = Packet::new(rtp_packet, video_header, parsed.payload);
        let result = self.packet_buffer.insert_packet(packet);
        if result.buffer_cleared {
            self.statistics.buffer_cleared();
            self.keyframe_requested = true;
        }

        let frames = self.assemble_frames(result.packets);
        let frames = self.find_references(frames);
        self.emit(frames)
    }

    /// Forgets everything up to and including `frame_id`. Frames at or before
    /// it are never returned afterwards, even if their packets arrive late.
    pub fn clear_to(&mut self, frame_id: i64) {
        let known = self
            .frame_id_to_seq_num
            .partition_point(|&(id, _)| id <= frame_id);
        if known == 0 {
            log::debug!("No sequence number known for frame {frame_id}");
        } else {
            let (_, seq_num) = self.frame_id_to_seq_num[known - 1];
            log::trace!("Clearing to frame {frame_id}, sequence number {seq_num}");
            self.packet_buffer.clear_to(seq_num);
            self.reference_finder.clear_to(seq_num);
            self.frame_id_to_seq_num.drain(..known);
        }
        self.cleared_frame_id = Some(
            self.cleared_frame_id
                .map_or(frame_id, |cleared| cleared.max(frame_id)),
        );
    }

    pub fn statistics(&self) -> AssemblerStatistics {
        self.statistics.statistics()
    }

    /// Returns true once after the packet buffer had to drop its content. The
    /// caller should then ask the sender for a key frame.
    pub fn take_keyframe_request(&mut self) -> bool {
        std::mem::take(&mut self.keyframe_requested)
    }

    pub fn last_received_packet_ms(&self) -> Option<i64> {
        self.packet_buffer.last_received_packet_ms()
    }

    pub fn last_received_keyframe_packet_ms(&self) -> Option<i64> {
        self.packet_buffer.last_received_keyframe_packet_ms()
    }

    /// Frames assembled but held back until their references arrive.
    pub fn num_pending_frames(&self) -> usize {
        self.reference_finder.num_pending_frames()
    }

    /// Padding is unwrapped by the packet buffer so the reference finder sees
    /// the same sequence number space as the frames it has stashed.
    fn update_with_padding(&mut self, seq_num: u16) -> Vec<EncodedFrame> {
        log::trace!("Padding packet {seq_num}");
        self.statistics.padding_received();
        let result = self.packet_buffer.insert_padding(seq_num);
        let frames = self.assemble_frames(result.packets);
        let mut frames = self.find_references(frames);
        frames.extend(self.reference_finder.padding_received(result.seq_num));
        self.emit(frames)
    }

    fn apply_descriptor_extensions(
        &mut self,
        rtp_packet: &RtpPacketReceived,
        video_header: &mut VideoHeader,
    ) -> Result<()> {
        if let Some(data) = rtp_packet.extension(RtpExtension::DependencyDescriptor) {
            self.apply_dependency_descriptor(data, video_header)
        } else if let Some(data) = rtp_packet.extension(RtpExtension::GenericFrameDescriptor00) {
            self.apply_generic_frame_descriptor(data, video_header)
        } else {
            Ok(())
        }
    }

    fn apply_dependency_descriptor(
        &mut self,
        data: &[u8],
        video_header: &mut VideoHeader,
    ) -> Result<()> {
        let descriptor = DependencyDescriptor::parse(data, self.video_structure.as_ref())?;
        if descriptor.attached_structure.is_some() && !descriptor.first_packet_in_frame {
            return Err(RtpError::MalformedExtension(
                "structure attached to a packet that does not start a frame".to_string(),
            ));
        }

        video_header.is_first_packet_in_frame = descriptor.first_packet_in_frame;
        video_header.is_last_packet_in_frame = descriptor.last_packet_in_frame;

        let frame_id = self.frame_id_unwrapper.unwrap(descriptor.frame_number);
        let dependencies = &descriptor.frame_dependencies;
        video_header.generic = Some(GenericDescriptorInfo {
            frame_id,
            spatial_index: dependencies.spatial_id,
            temporal_index: dependencies.temporal_id,
            dependencies: dependencies
                .frame_diffs
                .iter()
                .map(|&diff| frame_id - i64::from(diff))
                .collect(),
            decode_target_indications: dependencies.decode_target_indications.clone(),
            chain_diffs: dependencies.chain_diffs.clone(),
        });
        if let Some(resolution) = descriptor.resolution {
            video_header.width = u16::try_from(resolution.width).unwrap_or(u16::MAX);
            video_header.height = u16::try_from(resolution.height).unwrap_or(u16::MAX);
        }

        match descriptor.attached_structure {
            Some(structure) => {
                if let Some(structure_frame_id) = self.video_structure_frame_id {
                    if structure_frame_id > frame_id {
                        return Err(RtpError::StaleStructure {
                            structure_frame_id,
                            frame_id,
                        });
                    }
                }
                log::debug!(
                    "Key frame {frame_id} attaches structure {}",
                    structure.structure_id
                );
                self.video_structure = Some(structure);
                self.video_structure_frame_id = Some(frame_id);
                video_header.frame_type = FrameType::KeyFrame;
            }
            None => video_header.frame_type = FrameType::DeltaFrame,
        }
        Ok(())
    }

    fn apply_generic_frame_descriptor(
        &mut self,
        data: &[u8],
        video_header: &mut VideoHeader,
    ) -> Result<()> {
        let descriptor = GenericFrameDescriptor::parse(data)?;
        video_header.is_first_packet_in_frame = descriptor.first_packet_in_subframe;
        video_header.is_last_packet_in_frame = descriptor.last_packet_in_subframe;

        if descriptor.first_packet_in_subframe {
            video_header.frame_type = if descriptor.is_independent() {
                FrameType::KeyFrame
            } else {
                FrameType::DeltaFrame
            };
            let frame_id = self.generic_frame_id_unwrapper.unwrap(descriptor.frame_id);
            video_header.generic = Some(GenericDescriptorInfo {
                frame_id,
                spatial_index: spatial_index(descriptor.spatial_layers_bitmask),
                temporal_index: descriptor.temporal_layer,
                dependencies: descriptor
                    .frame_dependency_diffs
                    .iter()
                    .map(|&diff| frame_id - i64::from(diff))
                    .collect(),
                ..Default::default()
            });
            if descriptor.width > 0 && descriptor.height > 0 {
                video_header.width = descriptor.width;
                video_header.height = descriptor.height;
            }
        }
        Ok(())
    }

    /// Stitches completed packet runs into frames. A run whose bitstream
    /// cannot be built is dropped.
    fn assemble_frames(&mut self, packets: Vec<Packet>) -> Vec<EncodedFrame> {
        let mut frames = Vec::new();
        let mut first_index = None;
        for (index, packet) in packets.iter().enumerate() {
            if packet.is_first_packet_in_frame() {
                first_index = Some(index);
            }
            if !packet.is_last_packet_in_frame() {
                continue;
            }
            let Some(start) = first_index.take() else {
                log::debug!(
                    "Packet run ending at {} has no first packet",
                    packet.unwrapped_seq_num
                );
                continue;
            };

            let run = &packets[start..=index];
            let payloads: Vec<&[u8]> = run.iter().map(|p| p.payload.as_slice()).collect();
            match self.depacketizer.assemble_frame(&payloads) {
                Ok(data) => frames.push(create_frame(&run[0], packet, data)),
                Err(e) => {
                    log::warn!(
                        "Dropping frame {}..={}: {e}",
                        run[0].unwrapped_seq_num,
                        packet.unwrapped_seq_num
                    );
                    self.statistics.assembly_failure();
                }
            }
        }
        self.statistics.frames_assembled(frames.len());
        frames
    }

    fn find_references(&mut self, frames: Vec<EncodedFrame>) -> Vec<EncodedFrame> {
        let mut complete = Vec::new();
        for frame in frames {
            match self.reference_finder.manage_frame(frame) {
                Ok(frames) => complete.extend(frames),
                Err(e) => log::warn!("Dropping frame: {e}"),
            }
        }
        complete
    }

    fn emit(&mut self, frames: Vec<EncodedFrame>) -> Vec<EncodedFrame> {
        let before = frames.len();
        let frames: Vec<EncodedFrame> = match self.cleared_frame_id {
            Some(cleared) => frames.into_iter().filter(|f| f.id > cleared).collect(),
            None => frames,
        };
        if frames.len() < before {
            log::debug!("Dropped {} frames older than the clear point", before - frames.len());
            self.statistics.frames_dropped_after_clear(before - frames.len());
        }
        for frame in &frames {
            self.save_frame_id_to_seq_num(frame.id, frame.last_seq_num);
        }
        self.statistics.frames_emitted(frames.len());
        frames
    }

    fn save_frame_id_to_seq_num(&mut self, frame_id: i64, seq_num: i64) {
        let index = self
            .frame_id_to_seq_num
            .partition_point(|&(id, _)| id < frame_id);
        match self.frame_id_to_seq_num.get_mut(index) {
            Some(entry) if entry.0 == frame_id => entry.1 = seq_num,
            _ => self.frame_id_to_seq_num.insert(index, (frame_id, seq_num)),
        }
        while self.frame_id_to_seq_num.len() > self.config.max_frame_id_mappings {
            self.frame_id_to_seq_num.pop_front();
        }
    }
}

/// Index of the lowest spatial layer set in a generic descriptor bitmask.
fn spatial_index(spatial_layers_bitmask: u8) -> u8 {
    if spatial_layers_bitmask == 0 {
        0
    } else {
        spatial_layers_bitmask.trailing_zeros() as u8
    }
}

fn create_frame(first_packet: &Packet, last_packet: &Packet, data: Vec<u8>) -> EncodedFrame {
    EncodedFrame {
        id: first_packet.unwrapped_seq_num,
        first_seq_num: first_packet.unwrapped_seq_num,
        last_seq_num: last_packet.unwrapped_seq_num,
        rtp_timestamp: first_packet.timestamp,
        payload_type: first_packet.payload_type,
        marker: last_packet.marker_bit,
        spatial_index: 0,
        temporal_index: 0,
        references: Vec::new(),
        video_header: first_packet.video_header.clone(),
        data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PacketBufferConfig;
    use crate::dependency_descriptor::{
        DecodeTargetIndication::*, FrameDependencyTemplate, RenderResolution,
    };
    use crate::environment::SimulatedClock;
    use std::sync::Arc;

    const KEY_FIRST: u8 = 0x03;
    const DELTA_FIRST: u8 = 0x02;

    fn create_assembler(config: AssemblerConfig) -> FrameAssembler {
        let env = Environment::new(Arc::new(SimulatedClock::new(1_000)));
        FrameAssembler::new(&env, config).unwrap()
    }

    fn generic_packet(seq_num: u16, timestamp: u32, flags: u8, data: &[u8]) -> RtpPacketReceived {
        let mut payload = vec![flags];
        payload.extend_from_slice(data);
        RtpPacketReceived::new(seq_num, timestamp, true, payload)
    }

    fn l1t2_structure() -> FrameDependencyStructure {
        FrameDependencyStructure {
            structure_id: 0,
            num_decode_targets: 2,
            num_chains: 1,
            decode_target_protected_by_chain: vec![0, 0],
            resolutions: vec![RenderResolution {
                width: 320,
                height: 180,
            }],
            templates: vec![
                FrameDependencyTemplate::new(0, 0)
                    .with_dtis(&[Switch, Switch])
                    .with_chain_diffs(&[0]),
                FrameDependencyTemplate::new(0, 0)
                    .with_dtis(&[Switch, Switch])
                    .with_frame_diffs(&[2])
                    .with_chain_diffs(&[2]),
                FrameDependencyTemplate::new(0, 1)
                    .with_dtis(&[NotPresent, Discardable])
                    .with_frame_diffs(&[1])
                    .with_chain_diffs(&[1]),
            ],
        }
    }

    fn dd_packet(
        seq_num: u16,
        frame_number: u16,
        template: usize,
        attach_structure: bool,
    ) -> RtpPacketReceived {
        let structure = l1t2_structure();
        let descriptor = DependencyDescriptor {
            first_packet_in_frame: true,
            last_packet_in_frame: true,
            frame_number,
            frame_dependencies: structure.templates[template].clone(),
            attached_structure: attach_structure.then(|| structure.clone()),
            ..Default::default()
        };
        let extension = descriptor.write(&structure).unwrap();
        RtpPacketReceived::new(seq_num, u32::from(frame_number) * 3000, true, vec![0xaa, 0xbb])
            .with_extension(RtpExtension::DependencyDescriptor, extension)
    }

    #[test]
    fn test_rejects_invalid_config() {
        let env = Environment::default();
        let mut config = AssemblerConfig::default();
        config.packet_buffer.start_size = 100;
        assert!(matches!(
            FrameAssembler::new(&env, config),
            Err(RtpError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_single_packet_key_frame() {
        let mut assembler = create_assembler(AssemblerConfig::default());
        let frames = assembler.insert_packet(&generic_packet(10, 90_000, KEY_FIRST, b"key"));
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_keyframe());
        assert_eq!(frames[0].data, b"key".to_vec());
        assert_eq!(frames[0].id, 10);
        assert!(frames[0].references.is_empty());
        assert_eq!(assembler.last_received_packet_ms(), Some(1_000));
    }

    #[test]
    fn test_multi_packet_frame_is_concatenated() {
        let mut assembler = create_assembler(AssemblerConfig::default());
        let first = RtpPacketReceived::new(1, 0, false, vec![KEY_FIRST, b'a', b'b']);
        let second = RtpPacketReceived::new(2, 0, true, vec![0x00, b'c', b'd']);

        assert!(assembler.insert_packet(&second).is_empty());
        let frames = assembler.insert_packet(&first);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, b"abcd".to_vec());
        assert_eq!(frames[0].first_seq_num, 1);
        assert_eq!(frames[0].last_seq_num, 2);
    }

    #[test]
    fn test_malformed_payload_is_counted() {
        let mut assembler = create_assembler(AssemblerConfig::for_codec(VideoCodec::Vp8));
        // X bit set but the extension byte is missing
        let packet = RtpPacketReceived::new(1, 0, true, vec![0x80]);
        assert!(assembler.insert_packet(&packet).is_empty());
        assert_eq!(assembler.statistics().malformed_packets, 1);
    }

    #[test]
    fn test_empty_payload_takes_padding_path() {
        let mut assembler = create_assembler(AssemblerConfig::default());
        assert!(assembler
            .insert_packet(&RtpPacketReceived::new(5, 0, false, Vec::new()))
            .is_empty());
        let stats = assembler.statistics();
        assert_eq!(stats.packets_received, 1);
        assert_eq!(stats.padding_packets, 1);
    }

    #[test]
    fn test_buffer_clear_requests_key_frame() {
        let config = AssemblerConfig {
            packet_buffer: PacketBufferConfig {
                start_size: 16,
                max_size: 16,
            },
            ..Default::default()
        };
        let mut assembler = create_assembler(config);
        let first = RtpPacketReceived::new(0, 0, false, vec![KEY_FIRST, 1]);
        let colliding = RtpPacketReceived::new(16, 100, false, vec![KEY_FIRST, 2]);
        assert!(assembler.insert_packet(&first).is_empty());
        assert!(assembler.insert_packet(&colliding).is_empty());

        assert!(assembler.take_keyframe_request());
        assert!(!assembler.take_keyframe_request());
        assert_eq!(assembler.statistics().buffer_clears, 1);
    }

    #[test]
    fn test_dependency_descriptor_frames() {
        let mut assembler = create_assembler(AssemblerConfig::for_codec(VideoCodec::Raw));

        let key = assembler.insert_packet(&dd_packet(100, 1, 0, true));
        assert_eq!(key.len(), 1);
        assert_eq!(key[0].id, 1);
        assert!(key[0].is_keyframe());
        assert_eq!((key[0].width(), key[0].height()), (320, 180));

        let delta = assembler.insert_packet(&dd_packet(101, 3, 1, false));
        assert_eq!(delta.len(), 1);
        assert_eq!(delta[0].id, 3);
        assert_eq!(delta[0].references, vec![1]);

        let upper = assembler.insert_packet(&dd_packet(102, 2, 2, false));
        assert_eq!(upper.len(), 1);
        assert_eq!(upper[0].id, 2);
        assert_eq!(upper[0].temporal_index, 1);
        assert_eq!(upper[0].references, vec![1]);
    }

    #[test]
    fn test_dependency_descriptor_without_structure_is_dropped() {
        let mut assembler = create_assembler(AssemblerConfig::for_codec(VideoCodec::Raw));
        assert!(assembler.insert_packet(&dd_packet(100, 3, 1, false)).is_empty());
        assert_eq!(assembler.statistics().malformed_extensions, 1);
    }

    #[test]
    fn test_stale_structure_is_rejected() {
        let mut assembler = create_assembler(AssemblerConfig::for_codec(VideoCodec::Raw));
        assert_eq!(assembler.insert_packet(&dd_packet(100, 5, 0, true)).len(), 1);
        assert!(assembler.insert_packet(&dd_packet(99, 3, 0, true)).is_empty());
        assert_eq!(assembler.statistics().stale_structures, 1);

        // The accepted structure still parses later frames.
        let delta = assembler.insert_packet(&dd_packet(101, 7, 1, false));
        assert_eq!(delta.len(), 1);
        assert_eq!(delta[0].references, vec![5]);
    }

    #[test]
    fn test_structure_on_non_first_packet_is_rejected() {
        let mut assembler = create_assembler(AssemblerConfig::for_codec(VideoCodec::Raw));
        assert_eq!(assembler.insert_packet(&dd_packet(100, 1, 0, true)).len(), 1);

        let structure = l1t2_structure();
        let descriptor = DependencyDescriptor {
            first_packet_in_frame: false,
            last_packet_in_frame: true,
            frame_number: 2,
            frame_dependencies: structure.templates[2].clone(),
            attached_structure: Some(structure.clone()),
            ..Default::default()
        };
        let packet = RtpPacketReceived::new(101, 6000, true, vec![0xcc]).with_extension(
            RtpExtension::DependencyDescriptor,
            descriptor.write(&structure).unwrap(),
        );
        assert!(assembler.insert_packet(&packet).is_empty());
        assert_eq!(assembler.statistics().malformed_extensions, 1);

        // Frame 1 still anchors the structure used to parse later frames.
        let delta = assembler.insert_packet(&dd_packet(102, 3, 1, false));
        assert_eq!(delta.len(), 1);
        assert_eq!(delta[0].id, 3);
        assert_eq!(delta[0].references, vec![1]);
    }

    #[test]
    fn test_padding_after_dropped_packet_across_rollover() {
        let mut assembler = create_assembler(AssemblerConfig::default());
        // Extended header flag without the picture id bytes.
        let malformed = RtpPacketReceived::new(65535, 0, true, vec![0x04]);
        assert!(assembler.insert_packet(&malformed).is_empty());
        assert_eq!(assembler.statistics().malformed_packets, 1);

        let key = assembler.insert_packet(&generic_packet(0, 0, KEY_FIRST, b"k"));
        assert_eq!(key.len(), 1);
        assert!(assembler
            .insert_packet(&generic_packet(2, 6000, DELTA_FIRST, b"d"))
            .is_empty());
        assert_eq!(assembler.num_pending_frames(), 1);

        let frames = assembler.insert_packet(&RtpPacketReceived::new(1, 0, false, Vec::new()));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].id, key[0].id + 2);
        assert_eq!(frames[0].references, vec![key[0].id]);
        assert_eq!(assembler.num_pending_frames(), 0);
    }

    #[test]
    fn test_generic_frame_descriptor_frames() {
        let mut assembler = create_assembler(AssemblerConfig::for_codec(VideoCodec::Raw));
        let key = GenericFrameDescriptor {
            first_packet_in_subframe: true,
            last_packet_in_subframe: true,
            spatial_layers_bitmask: 0b1,
            frame_id: 40,
            width: 640,
            height: 480,
            ..Default::default()
        };
        let delta = GenericFrameDescriptor {
            frame_id: 41,
            frame_dependency_diffs: vec![1],
            width: 0,
            height: 0,
            ..key.clone()
        };

        let packet = RtpPacketReceived::new(7, 0, false, vec![1, 2, 3])
            .with_extension(RtpExtension::GenericFrameDescriptor00, key.write().unwrap());
        let frames = assembler.insert_packet(&packet);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].id, 40);
        assert!(frames[0].is_keyframe());
        assert_eq!(frames[0].width(), 640);

        let packet = RtpPacketReceived::new(8, 3000, false, vec![4, 5])
            .with_extension(RtpExtension::GenericFrameDescriptor00, delta.write().unwrap());
        let frames = assembler.insert_packet(&packet);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].id, 41);
        assert_eq!(frames[0].references, vec![40]);
        assert!(!frames[0].is_keyframe());
    }

    #[test]
    fn test_clear_to_drops_older_frames() {
        let mut assembler = create_assembler(AssemblerConfig::default());
        assert_eq!(
            assembler
                .insert_packet(&generic_packet(1, 0, KEY_FIRST, b"k"))
                .len(),
            1
        );
        assembler.clear_to(1);

        // A late packet at or before the cleared frame never produces a frame.
        assert!(assembler
            .insert_packet(&generic_packet(0, 0, KEY_FIRST, b"old"))
            .is_empty());

        let frames = assembler.insert_packet(&generic_packet(2, 3000, DELTA_FIRST, b"d"));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].references, vec![1]);
    }

    #[test]
    fn test_frame_id_mappings_are_bounded() {
        let config = AssemblerConfig {
            max_frame_id_mappings: 2,
            ..Default::default()
        };
        let mut assembler = create_assembler(config);
        for seq_num in 0..5u16 {
            let frames = assembler.insert_packet(&generic_packet(
                seq_num,
                u32::from(seq_num) * 3000,
                KEY_FIRST,
                b"k",
            ));
            assert_eq!(frames.len(), 1);
        }
        assert_eq!(assembler.frame_id_to_seq_num.len(), 2);
        assert_eq!(assembler.frame_id_to_seq_num.front(), Some(&(3, 3)));
    }

    #[test]
    fn test_spatial_index_from_bitmask() {
        assert_eq!(spatial_index(0), 0);
        assert_eq!(spatial_index(0b1), 0);
        assert_eq!(spatial_index(0b100), 2);
    }
}
