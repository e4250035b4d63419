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

//! Legacy generic packetization: one header byte with key frame and first
//! packet flags, optionally followed by a 15 bit picture id.

use super::{Depacketizer, ParsedPayload};
use crate::error::{Result, RtpError};
use crate::frame::FrameType;
use crate::video_header::{CodecHeader, LegacyGenericHeader, VideoCodec, VideoHeader};

const KEY_FRAME_BIT: u8 = 0x01;
const FIRST_PACKET_BIT: u8 = 0x02;
const EXTENDED_HEADER_BIT: u8 = 0x04;
const GENERIC_HEADER_LENGTH: usize = 1;
const EXTENDED_HEADER_LENGTH: usize = 2;

#[derive(Debug, Default, Clone, Copy)]
pub struct GenericDepacketizer;

impl Depacketizer for GenericDepacketizer {
    fn parse(&self, rtp_payload: &[u8]) -> Result<ParsedPayload> {
        let Some(&flags) = rtp_payload.first() else {
            return Err(RtpError::MalformedPayload(
                "empty generic payload".to_string(),
            ));
        };

        let mut video_header = VideoHeader::new(VideoCodec::Generic);
        video_header.frame_type = if flags & KEY_FRAME_BIT != 0 {
            FrameType::KeyFrame
        } else {
            FrameType::DeltaFrame
        };
        video_header.is_first_packet_in_frame = flags & FIRST_PACKET_BIT != 0;

        let mut offset = GENERIC_HEADER_LENGTH;
        if flags & EXTENDED_HEADER_BIT != 0 {
            if rtp_payload.len() < GENERIC_HEADER_LENGTH + EXTENDED_HEADER_LENGTH {
                return Err(RtpError::truncated("generic extended header"));
            }
            let picture_id = (u16::from(rtp_payload[1] & 0x7f) << 8) | u16::from(rtp_payload[2]);
            video_header.codec_header = CodecHeader::Generic(LegacyGenericHeader { picture_id });
            offset += EXTENDED_HEADER_LENGTH;
        }

        Ok(ParsedPayload {
            video_header,
            payload: rtp_payload[offset..].to_vec(),
        })
    }
}
