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

//! Per-packet video metadata produced by the depacketizers and descriptor parsers.

use serde::{Deserialize, Serialize};

use crate::dependency_descriptor::DecodeTargetIndication;
use crate::frame::FrameType;

/// Codec carried by an RTP video stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    /// Payload is opaque, frame boundaries come from header extensions.
    Raw,
    #[default]
    Generic,
    Vp8,
    Vp9,
    Av1,
    H264,
    H265,
}

impl VideoCodec {
    pub fn is_h26x(&self) -> bool {
        matches!(self, VideoCodec::H264 | VideoCodec::H265)
    }
}

/// VP8 payload descriptor fields (RFC 7741).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vp8Header {
    pub non_reference: bool,
    /// 7 or 15 bit picture id.
    pub picture_id: Option<u16>,
    pub tl0_pic_idx: Option<u8>,
    pub temporal_idx: Option<u8>,
    /// Y bit: the frame only depends on the base layer.
    pub layer_sync: bool,
    pub key_idx: Option<u8>,
    pub partition_id: u8,
    pub beginning_of_partition: bool,
}

/// VP9 payload descriptor fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vp9Header {
    pub inter_pic_predicted: bool,
    pub flexible_mode: bool,
    pub beginning_of_frame: bool,
    pub end_of_frame: bool,
    pub ss_data_available: bool,
    pub non_ref_for_inter_layer_pred: bool,
    pub picture_id: Option<u16>,
    pub tl0_pic_idx: Option<u8>,
    pub temporal_idx: Option<u8>,
    pub spatial_idx: u8,
    pub temporal_up_switch: bool,
    pub inter_layer_predicted: bool,
    /// Reference picture id differences, flexible mode only.
    pub pid_diffs: Vec<u8>,
    pub num_spatial_layers: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum H264PacketizationType {
    #[default]
    SingleNalu,
    StapA,
    FuA,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NaluInfo {
    pub nalu_type: u8,
    pub sps_id: Option<u32>,
    pub pps_id: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct H264Header {
    pub packetization_type: H264PacketizationType,
    /// Type of the first NAL unit, or the fragmented one.
    pub nalu_type: u8,
    pub nalus: Vec<NaluInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct H265Header {
    /// NAL unit types present in the packet, in order.
    pub nalu_types: Vec<u8>,
    pub is_fragment: bool,
}

/// Header of the legacy generic packetization with an extended picture id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyGenericHeader {
    pub picture_id: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodecHeader {
    #[default]
    None,
    Generic(LegacyGenericHeader),
    Vp8(Vp8Header),
    Vp9(Vp9Header),
    H264(H264Header),
    H265(H265Header),
}

/// Frame identity and references taken from a dependency descriptor or a
/// generic frame descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenericDescriptorInfo {
    pub frame_id: i64,
    pub spatial_index: u8,
    pub temporal_index: u8,
    pub dependencies: Vec<i64>,
    pub decode_target_indications: Vec<DecodeTargetIndication>,
    pub chain_diffs: Vec<u32>,
}

/// Video metadata of a single RTP packet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoHeader {
    pub frame_type: FrameType,
    pub codec: VideoCodec,
    pub width: u16,
    pub height: u16,
    pub is_first_packet_in_frame: bool,
    pub is_last_packet_in_frame: bool,
    pub codec_header: CodecHeader,
    pub generic: Option<GenericDescriptorInfo>,
}

impl VideoHeader {
    pub fn new(codec: VideoCodec) -> Self {
        Self {
            codec,
            ..Default::default()
        }
    }

    pub fn is_keyframe(&self) -> bool {
        self.frame_type == FrameType::KeyFrame
    }
}
