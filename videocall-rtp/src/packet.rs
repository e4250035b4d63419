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

use crate::frame::FrameType;
use crate::rtp_packet::RtpPacketReceived;
use crate::video_header::VideoHeader;

/// A depacketized RTP packet waiting in a packet buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// RTP sequence number as received
    pub seq_num: u16,
    /// Sequence number in the unwrapped space, assigned on buffer insertion
    pub unwrapped_seq_num: i64,
    /// RTP timestamp, equal for every packet of a frame
    pub timestamp: u32,
    pub marker_bit: bool,
    pub payload_type: u8,
    pub video_header: VideoHeader,
    /// Media payload as returned by the depacketizer
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(
        rtp_packet: &RtpPacketReceived,
        video_header: VideoHeader,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            seq_num: rtp_packet.sequence_number(),
            unwrapped_seq_num: i64::from(rtp_packet.sequence_number()),
            timestamp: rtp_packet.timestamp(),
            marker_bit: rtp_packet.marker(),
            payload_type: rtp_packet.payload_type(),
            video_header,
            payload,
        }
    }

    pub fn is_first_packet_in_frame(&self) -> bool {
        self.video_header.is_first_packet_in_frame
    }

    pub fn is_last_packet_in_frame(&self) -> bool {
        self.video_header.is_last_packet_in_frame
    }

    pub fn is_keyframe(&self) -> bool {
        self.video_header.frame_type == FrameType::KeyFrame
    }

    pub fn payload_size(&self) -> usize {
        self.payload.len()
    }
}
