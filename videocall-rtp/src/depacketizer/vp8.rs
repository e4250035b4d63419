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

//! VP8 payload descriptor (RFC 7741).
//!
//! ```text
//!       0 1 2 3 4 5 6 7
//!      +-+-+-+-+-+-+-+-+
//!      |X|R|N|S|R| PID | (REQUIRED)
//!      +-+-+-+-+-+-+-+-+
//! X:   |I|L|T|K| RSV   | (OPTIONAL)
//!      +-+-+-+-+-+-+-+-+
//! I:   |M| PictureID   | (OPTIONAL)
//!      +-+-+-+-+-+-+-+-+
//!      |   PictureID   | (present when M is set)
//!      +-+-+-+-+-+-+-+-+
//! L:   |   TL0PICIDX   | (OPTIONAL)
//!      +-+-+-+-+-+-+-+-+
//! T/K: |TID|Y| KEYIDX  | (OPTIONAL)
//!      +-+-+-+-+-+-+-+-+
//! ```

use super::{Depacketizer, ParsedPayload};
use crate::error::{Result, RtpError};
use crate::frame::FrameType;
use crate::video_header::{CodecHeader, VideoCodec, VideoHeader, Vp8Header};

const EXTENSION_BIT: u8 = 0x80;
const NON_REFERENCE_BIT: u8 = 0x20;
const START_OF_PARTITION_BIT: u8 = 0x10;
const PARTITION_ID_MASK: u8 = 0x0f;

const PICTURE_ID_PRESENT_BIT: u8 = 0x80;
const TL0_PIC_IDX_PRESENT_BIT: u8 = 0x40;
const TID_PRESENT_BIT: u8 = 0x20;
const KEY_IDX_PRESENT_BIT: u8 = 0x10;

const LONG_PICTURE_ID_BIT: u8 = 0x80;
const LAYER_SYNC_BIT: u8 = 0x20;
const KEY_IDX_MASK: u8 = 0x1f;

/// Frame tag (3 bytes), start code (3 bytes) and dimensions (4 bytes).
const KEY_FRAME_HEADER_SIZE: usize = 10;
const KEY_FRAME_START_CODE: [u8; 3] = [0x9d, 0x01, 0x2a];

#[derive(Debug, Default, Clone, Copy)]
pub struct Vp8Depacketizer;

impl Vp8Depacketizer {
    /// Parses the payload descriptor, returning it together with its length.
    fn parse_descriptor(data: &[u8]) -> Result<(Vp8Header, usize)> {
        let truncated = || RtpError::truncated("VP8 payload descriptor");
        let first = *data.first().ok_or_else(truncated)?;
        let mut header = Vp8Header {
            non_reference: first & NON_REFERENCE_BIT != 0,
            beginning_of_partition: first & START_OF_PARTITION_BIT != 0,
            partition_id: first & PARTITION_ID_MASK,
            ..Default::default()
        };
        let mut offset = 1;
        if first & EXTENSION_BIT == 0 {
            return Ok((header, offset));
        }

        let extension = *data.get(offset).ok_or_else(truncated)?;
        offset += 1;

        if extension & PICTURE_ID_PRESENT_BIT != 0 {
            let byte = *data.get(offset).ok_or_else(truncated)?;
            offset += 1;
            let picture_id = if byte & LONG_PICTURE_ID_BIT != 0 {
                let low = *data.get(offset).ok_or_else(truncated)?;
                offset += 1;
                (u16::from(byte & 0x7f) << 8) | u16::from(low)
            } else {
                u16::from(byte & 0x7f)
            };
            header.picture_id = Some(picture_id);
        }

        if extension & TL0_PIC_IDX_PRESENT_BIT != 0 {
            header.tl0_pic_idx = Some(*data.get(offset).ok_or_else(truncated)?);
            offset += 1;
        }

        if extension & (TID_PRESENT_BIT | KEY_IDX_PRESENT_BIT) != 0 {
            let byte = *data.get(offset).ok_or_else(truncated)?;
            offset += 1;
            if extension & TID_PRESENT_BIT != 0 {
                header.temporal_idx = Some(byte >> 6);
                header.layer_sync = byte & LAYER_SYNC_BIT != 0;
            }
            if extension & KEY_IDX_PRESENT_BIT != 0 {
                header.key_idx = Some(byte & KEY_IDX_MASK);
            }
        }

        Ok((header, offset))
    }
}

impl Depacketizer for Vp8Depacketizer {
    fn parse(&self, rtp_payload: &[u8]) -> Result<ParsedPayload> {
        let (vp8_header, offset) = Self::parse_descriptor(rtp_payload)?;
        let payload = &rtp_payload[offset..];
        if payload.is_empty() {
            return Err(RtpError::MalformedPayload(
                "VP8 payload descriptor without data".to_string(),
            ));
        }

        let mut video_header = VideoHeader::new(VideoCodec::Vp8);
        let starts_frame = vp8_header.beginning_of_partition && vp8_header.partition_id == 0;
        video_header.is_first_packet_in_frame = starts_frame;
        // Inverse key frame flag in the first bit of the frame tag.
        if starts_frame && payload[0] & 0x01 == 0 {
            video_header.frame_type = FrameType::KeyFrame;
            if payload.len() >= KEY_FRAME_HEADER_SIZE && payload[3..6] == KEY_FRAME_START_CODE {
                video_header.width = u16::from_le_bytes([payload[6], payload[7]]) & 0x3fff;
                video_header.height = u16::from_le_bytes([payload[8], payload[9]]) & 0x3fff;
            }
        }
        video_header.codec_header = CodecHeader::Vp8(vp8_header);

        Ok(ParsedPayload {
            video_header,
            payload: payload.to_vec(),
        })
    }
}
