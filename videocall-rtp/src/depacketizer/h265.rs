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

//! H265 RTP payload format (RFC 7798): single NAL units, aggregation
//! packets and fragmentation units. The stored payload is already in
//! Annex B form, so assembly is plain concatenation.

use super::{Depacketizer, ParsedPayload};
use crate::error::{Result, RtpError};
use crate::frame::FrameType;
use crate::video_header::{CodecHeader, H265Header, VideoCodec, VideoHeader};

pub const NALU_BLA_W_LP: u8 = 16;
pub const NALU_IDR_W_RADL: u8 = 19;
pub const NALU_IDR_N_LP: u8 = 20;
pub const NALU_CRA: u8 = 21;
pub const NALU_RSV_IRAP_23: u8 = 23;
pub const NALU_VPS: u8 = 32;
pub const NALU_SPS: u8 = 33;
pub const NALU_PPS: u8 = 34;
pub const NALU_AP: u8 = 48;
pub const NALU_FU: u8 = 49;
pub const NALU_PACI: u8 = 50;

const NAL_HEADER_SIZE: usize = 2;
const FU_HEADER_SIZE: usize = 1;
const LENGTH_FIELD_SIZE: usize = 2;
const FU_START_BIT: u8 = 0x80;
const FU_TYPE_MASK: u8 = 0x3f;
const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// Intra random access point picture.
pub fn is_irap(nalu_type: u8) -> bool {
    (NALU_BLA_W_LP..=NALU_RSV_IRAP_23).contains(&nalu_type)
}

fn nalu_type(header_byte: u8) -> u8 {
    (header_byte & 0x7e) >> 1
}

fn starts_key_frame(nalu_type: u8) -> bool {
    matches!(
        nalu_type,
        NALU_VPS | NALU_SPS | NALU_PPS | NALU_IDR_W_RADL | NALU_IDR_N_LP | NALU_CRA
    )
}

/// Splits an aggregation packet into its NAL units.
fn parse_aggregation_packet(payload: &[u8]) -> Result<Vec<&[u8]>> {
    let mut rest = &payload[NAL_HEADER_SIZE..];
    let mut nalus = Vec::new();
    while !rest.is_empty() {
        if rest.len() < LENGTH_FIELD_SIZE {
            return Err(RtpError::truncated("H265 aggregation packet length"));
        }
        let size = usize::from(u16::from_be_bytes([rest[0], rest[1]]));
        rest = &rest[LENGTH_FIELD_SIZE..];
        if size > rest.len() {
            return Err(RtpError::MalformedPayload(
                "H265 aggregation packet with incorrect NAL unit lengths".to_string(),
            ));
        }
        nalus.push(&rest[..size]);
        rest = &rest[size..];
    }
    if nalus.is_empty() {
        return Err(RtpError::MalformedPayload(
            "empty H265 aggregation packet".to_string(),
        ));
    }
    Ok(nalus)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct H265Depacketizer;

impl H265Depacketizer {
    fn parse_ap_or_single_nalu(rtp_payload: &[u8]) -> Result<ParsedPayload> {
        if rtp_payload.len() <= NAL_HEADER_SIZE {
            return Err(RtpError::truncated("H265 NAL unit header"));
        }
        let nalus = if nalu_type(rtp_payload[0]) == NALU_AP {
            parse_aggregation_packet(rtp_payload)?
        } else {
            vec![rtp_payload]
        };

        let mut video_header = VideoHeader::new(VideoCodec::H265);
        video_header.is_first_packet_in_frame = true;
        let mut h265 = H265Header::default();
        let mut payload = Vec::with_capacity(rtp_payload.len() + nalus.len() * START_CODE.len());

        for nalu in nalus {
            if nalu.len() < NAL_HEADER_SIZE {
                return Err(RtpError::MalformedPayload(
                    "aggregated H265 NAL unit too short".to_string(),
                ));
            }
            let nalu_type = nalu_type(nalu[0]);
            if matches!(nalu_type, NALU_AP | NALU_FU | NALU_PACI) {
                return Err(RtpError::MalformedPayload(format!(
                    "unexpected H265 NAL unit type {nalu_type} in aggregate"
                )));
            }
            if starts_key_frame(nalu_type) {
                video_header.frame_type = FrameType::KeyFrame;
            }
            h265.nalu_types.push(nalu_type);
            payload.extend_from_slice(&START_CODE);
            payload.extend_from_slice(nalu);
        }

        video_header.codec_header = CodecHeader::H265(h265);
        Ok(ParsedPayload {
            video_header,
            payload,
        })
    }

    fn parse_fu(rtp_payload: &[u8]) -> Result<ParsedPayload> {
        if rtp_payload.len() < NAL_HEADER_SIZE + FU_HEADER_SIZE {
            return Err(RtpError::truncated("H265 fragmentation unit"));
        }
        let fu_header = rtp_payload[NAL_HEADER_SIZE];
        let original_type = fu_header & FU_TYPE_MASK;
        let first_fragment = fu_header & FU_START_BIT != 0;
        let data = &rtp_payload[NAL_HEADER_SIZE + FU_HEADER_SIZE..];

        let payload = if first_fragment {
            // F bit and layer id high bit kept, type replaced by the original one.
            let header = [
                (rtp_payload[0] & 0x81) | (original_type << 1),
                rtp_payload[1],
            ];
            let mut payload = Vec::with_capacity(START_CODE.len() + header.len() + data.len());
            payload.extend_from_slice(&START_CODE);
            payload.extend_from_slice(&header);
            payload.extend_from_slice(data);
            payload
        } else {
            data.to_vec()
        };

        let mut video_header = VideoHeader::new(VideoCodec::H265);
        video_header.is_first_packet_in_frame = first_fragment;
        if matches!(original_type, NALU_IDR_W_RADL | NALU_IDR_N_LP | NALU_CRA) {
            video_header.frame_type = FrameType::KeyFrame;
        }
        video_header.codec_header = CodecHeader::H265(H265Header {
            nalu_types: if first_fragment {
                vec![original_type]
            } else {
                Vec::new()
            },
            is_fragment: true,
        });
        Ok(ParsedPayload {
            video_header,
            payload,
        })
    }
}

impl Depacketizer for H265Depacketizer {
    fn parse(&self, rtp_payload: &[u8]) -> Result<ParsedPayload> {
        let Some(&first) = rtp_payload.first() else {
            return Err(RtpError::MalformedPayload("empty H265 payload".to_string()));
        };
        match nalu_type(first) {
            NALU_FU => Self::parse_fu(rtp_payload),
            NALU_PACI => Err(RtpError::MalformedPayload(
                "H265 PACI packets are not supported".to_string(),
            )),
            _ => Self::parse_ap_or_single_nalu(rtp_payload),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nal_header(nalu_type: u8) -> [u8; 2] {
        [nalu_type << 1, 0x01]
    }

    fn h265_header(parsed: &ParsedPayload) -> &H265Header {
        match &parsed.video_header.codec_header {
            CodecHeader::H265(header) => header,
            other => panic!("expected H265 header, got {other:?}"),
        }
    }

    #[test]
    fn test_single_nalu_gets_start_code() {
        let mut payload = nal_header(NALU_IDR_W_RADL).to_vec();
        payload.push(0xaf);
        let parsed = H265Depacketizer.parse(&payload).unwrap();
        assert!(parsed.video_header.is_keyframe());
        assert!(parsed.video_header.is_first_packet_in_frame);
        assert_eq!(h265_header(&parsed).nalu_types, vec![NALU_IDR_W_RADL]);
        assert_eq!(parsed.payload, vec![0, 0, 0, 1, 0x26, 0x01, 0xaf]);
    }

    #[test]
    fn test_trailing_picture_is_delta() {
        let mut payload = nal_header(1).to_vec();
        payload.push(0x11);
        let parsed = H265Depacketizer.parse(&payload).unwrap();
        assert!(!parsed.video_header.is_keyframe());
    }

    #[test]
    fn test_aggregation_packet() {
        let mut payload = nal_header(NALU_AP).to_vec();
        for nalu_type in [NALU_VPS, NALU_SPS, NALU_PPS] {
            payload.extend_from_slice(&[0x00, 0x03]);
            payload.extend_from_slice(&nal_header(nalu_type));
            payload.push(0xee);
        }
        let parsed = H265Depacketizer.parse(&payload).unwrap();
        assert!(parsed.video_header.is_keyframe());
        assert_eq!(
            h265_header(&parsed).nalu_types,
            vec![NALU_VPS, NALU_SPS, NALU_PPS]
        );
        assert_eq!(parsed.payload.len(), 3 * (4 + 3));
        assert_eq!(&parsed.payload[..7], &[0, 0, 0, 1, 0x40, 0x01, 0xee]);
    }

    #[test]
    fn test_aggregation_packet_bad_length() {
        let mut payload = nal_header(NALU_AP).to_vec();
        payload.extend_from_slice(&[0x00, 0x09, 0x40, 0x01]);
        assert!(H265Depacketizer.parse(&payload).is_err());
    }

    #[test]
    fn test_fragmentation_units() {
        let mut first = nal_header(NALU_FU).to_vec();
        first.push(FU_START_BIT | NALU_IDR_W_RADL);
        first.extend_from_slice(&[0xaa, 0xbb]);
        let parsed = H265Depacketizer.parse(&first).unwrap();
        assert!(parsed.video_header.is_first_packet_in_frame);
        assert!(parsed.video_header.is_keyframe());
        let header = h265_header(&parsed);
        assert!(header.is_fragment);
        assert_eq!(header.nalu_types, vec![NALU_IDR_W_RADL]);
        assert_eq!(parsed.payload, vec![0, 0, 0, 1, 0x26, 0x01, 0xaa, 0xbb]);

        let mut last = nal_header(NALU_FU).to_vec();
        last.push(0x40 | NALU_IDR_W_RADL);
        last.push(0xcc);
        let parsed = H265Depacketizer.parse(&last).unwrap();
        assert!(!parsed.video_header.is_first_packet_in_frame);
        assert!(h265_header(&parsed).nalu_types.is_empty());
        assert_eq!(parsed.payload, vec![0xcc]);
    }

    #[test]
    fn test_paci_and_truncated_rejected() {
        assert!(H265Depacketizer.parse(&nal_header(NALU_PACI)).is_err());
        assert!(H265Depacketizer.parse(&nal_header(1)).is_err());
        assert!(H265Depacketizer.parse(&[]).is_err());
    }

    #[test]
    fn test_irap_range() {
        assert!(is_irap(NALU_BLA_W_LP));
        assert!(is_irap(NALU_CRA));
        assert!(!is_irap(NALU_VPS));
        assert!(!is_irap(1));
    }
}
