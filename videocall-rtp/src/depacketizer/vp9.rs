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

//! VP9 payload descriptor.
//!
//! ```text
//!       0 1 2 3 4 5 6 7
//!      +-+-+-+-+-+-+-+-+
//!      |I|P|L|F|B|E|V|Z| (REQUIRED)
//!      +-+-+-+-+-+-+-+-+
//! I:   |M| PICTURE ID  |
//!      +-+-+-+-+-+-+-+-+
//! M:   | EXTENDED PID  |
//!      +-+-+-+-+-+-+-+-+
//! L:   |  T  |U|  S  |D|
//!      +-+-+-+-+-+-+-+-+
//!      |   TL0PICIDX   | (non-flexible mode only)
//!      +-+-+-+-+-+-+-+-+
//! P,F: | P_DIFF      |N| (up to 3 times)
//!      +-+-+-+-+-+-+-+-+
//! V:   | SS            |
//!      +-+-+-+-+-+-+-+-+
//! ```

use super::{Depacketizer, ParsedPayload};
use crate::error::{Result, RtpError};
use crate::frame::FrameType;
use crate::video_header::{CodecHeader, VideoCodec, VideoHeader, Vp9Header};

pub const MAX_SPATIAL_LAYERS: u8 = 5;
const MAX_REF_PICS: usize = 3;

struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn read_u8(&mut self) -> Result<u8> {
        let byte = *self
            .data
            .get(self.offset)
            .ok_or_else(|| RtpError::truncated("VP9 payload descriptor"))?;
        self.offset += 1;
        Ok(byte)
    }

    fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes([self.read_u8()?, self.read_u8()?]))
    }

    fn remaining(&self) -> &'a [u8] {
        &self.data[self.offset.min(self.data.len())..]
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Vp9Depacketizer;

impl Vp9Depacketizer {
    fn parse_layer_info(reader: &mut Reader<'_>, header: &mut Vp9Header) -> Result<()> {
        let byte = reader.read_u8()?;
        header.temporal_idx = Some(byte >> 5);
        header.temporal_up_switch = byte & 0x10 != 0;
        header.spatial_idx = (byte >> 1) & 0x07;
        if header.spatial_idx >= MAX_SPATIAL_LAYERS {
            return Err(RtpError::MalformedPayload(format!(
                "VP9 spatial index {} out of range",
                header.spatial_idx
            )));
        }
        header.inter_layer_predicted = byte & 0x01 != 0;
        if !header.flexible_mode {
            header.tl0_pic_idx = Some(reader.read_u8()?);
        }
        Ok(())
    }

    fn parse_ref_indices(reader: &mut Reader<'_>, header: &mut Vp9Header) -> Result<()> {
        if header.picture_id.is_none() {
            return Err(RtpError::MalformedPayload(
                "VP9 reference indices without picture id".to_string(),
            ));
        }
        loop {
            if header.pid_diffs.len() == MAX_REF_PICS {
                return Err(RtpError::MalformedPayload(
                    "too many VP9 reference pictures".to_string(),
                ));
            }
            let byte = reader.read_u8()?;
            header.pid_diffs.push(byte >> 1);
            if byte & 0x01 == 0 {
                return Ok(());
            }
        }
    }

    /// Reads the scalability structure, returning the resolution of the
    /// lowest spatial layer when present.
    fn parse_ss_data(
        reader: &mut Reader<'_>,
        header: &mut Vp9Header,
    ) -> Result<Option<(u16, u16)>> {
        let byte = reader.read_u8()?;
        header.num_spatial_layers = (byte >> 5) + 1;
        let resolution_present = byte & 0x10 != 0;
        let gof_present = byte & 0x08 != 0;

        let mut resolution = None;
        if resolution_present {
            for layer in 0..header.num_spatial_layers {
                let width = reader.read_u16()?;
                let height = reader.read_u16()?;
                if layer == 0 {
                    resolution = Some((width, height));
                }
            }
        }
        if gof_present {
            let num_frames_in_gof = reader.read_u8()?;
            for _ in 0..num_frames_in_gof {
                let gof_byte = reader.read_u8()?;
                let num_ref_pics = (gof_byte >> 2) & 0x03;
                for _ in 0..num_ref_pics {
                    reader.read_u8()?;
                }
            }
        }
        Ok(resolution)
    }
}

impl Depacketizer for Vp9Depacketizer {
    fn parse(&self, rtp_payload: &[u8]) -> Result<ParsedPayload> {
        let mut reader = Reader {
            data: rtp_payload,
            offset: 0,
        };
        let first = reader.read_u8()?;
        let picture_id_present = first & 0x80 != 0;
        let layer_info_present = first & 0x20 != 0;

        let mut vp9 = Vp9Header {
            inter_pic_predicted: first & 0x40 != 0,
            flexible_mode: first & 0x10 != 0,
            beginning_of_frame: first & 0x08 != 0,
            end_of_frame: first & 0x04 != 0,
            ss_data_available: first & 0x02 != 0,
            non_ref_for_inter_layer_pred: first & 0x01 != 0,
            num_spatial_layers: 1,
            ..Default::default()
        };

        if picture_id_present {
            let byte = reader.read_u8()?;
            let picture_id = if byte & 0x80 != 0 {
                (u16::from(byte & 0x7f) << 8) | u16::from(reader.read_u8()?)
            } else {
                u16::from(byte)
            };
            vp9.picture_id = Some(picture_id);
        }
        if layer_info_present {
            Self::parse_layer_info(&mut reader, &mut vp9)?;
        }
        if vp9.inter_pic_predicted && vp9.flexible_mode {
            Self::parse_ref_indices(&mut reader, &mut vp9)?;
        }

        let mut video_header = VideoHeader::new(VideoCodec::Vp9);
        if vp9.ss_data_available {
            if let Some((width, height)) = Self::parse_ss_data(&mut reader, &mut vp9)? {
                video_header.width = width;
                video_header.height = height;
            }
        }

        let payload = reader.remaining();
        if payload.is_empty() {
            return Err(RtpError::MalformedPayload(
                "VP9 payload descriptor without data".to_string(),
            ));
        }

        video_header.frame_type = if vp9.inter_pic_predicted {
            FrameType::DeltaFrame
        } else {
            FrameType::KeyFrame
        };
        video_header.is_first_packet_in_frame =
            vp9.beginning_of_frame && (!layer_info_present || !vp9.inter_layer_predicted);
        video_header.is_last_packet_in_frame = vp9.end_of_frame;
        video_header.codec_header = CodecHeader::Vp9(vp9);

        Ok(ParsedPayload {
            video_header,
            payload: payload.to_vec(),
        })
    }
}
