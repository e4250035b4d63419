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

//! H264 RTP payload format (RFC 6184): single NAL units, STAP-A and FU-A.

use super::{Depacketizer, ParsedPayload};
use crate::bit_io::BitReader;
use crate::error::{Result, RtpError};
use crate::frame::FrameType;
use crate::video_header::{
    CodecHeader, H264Header, H264PacketizationType, NaluInfo, VideoCodec, VideoHeader,
};

pub const NALU_SLICE: u8 = 1;
pub const NALU_IDR: u8 = 5;
pub const NALU_SEI: u8 = 6;
pub const NALU_SPS: u8 = 7;
pub const NALU_PPS: u8 = 8;
pub const NALU_AUD: u8 = 9;
pub const NALU_END_OF_SEQUENCE: u8 = 10;
pub const NALU_END_OF_STREAM: u8 = 11;
pub const NALU_FILLER: u8 = 12;
pub const NALU_STAP_A: u8 = 24;
pub const NALU_FU_A: u8 = 28;

const NALU_TYPE_MASK: u8 = 0x1f;
const F_NRI_MASK: u8 = 0xe0;
const FU_START_BIT: u8 = 0x80;
const NAL_HEADER_SIZE: usize = 1;
const FU_A_HEADER_SIZE: usize = 2;
const START_CODE: [u8; 4] = [0, 0, 0, 1];

fn payload_error(what: &str) -> impl Fn(RtpError) -> RtpError + '_ {
    move |err| RtpError::MalformedPayload(format!("H264 {what}: {err}"))
}

/// Removes emulation prevention bytes (`00 00 03`).
pub(crate) fn unescape_rbsp(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut zeros = 0;
    for &byte in data {
        if zeros >= 2 && byte == 0x03 {
            zeros = 0;
            continue;
        }
        zeros = if byte == 0 { zeros + 1 } else { 0 };
        out.push(byte);
    }
    out
}

fn read_signed_exp_golomb(reader: &mut BitReader<'_>) -> Result<i32> {
    let code = reader.read_exp_golomb()?;
    let magnitude = ((u64::from(code) + 1) / 2) as i32;
    Ok(if code % 2 == 1 { magnitude } else { -magnitude })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpsInfo {
    pub id: u32,
    pub width: u32,
    pub height: u32,
}

/// Reads the id and the cropped picture size from an SPS body (after the
/// NAL header).
pub fn parse_sps(body: &[u8]) -> Result<SpsInfo> {
    let rbsp = unescape_rbsp(body);
    let mut reader = BitReader::new(&rbsp);
    let profile_idc = reader.read_u8()?;
    // constraint flags and level_idc
    reader.read_bits(16)?;
    let id = reader.read_exp_golomb()?;

    let mut chroma_format_idc = 1;
    let mut separate_colour_plane = false;
    if matches!(
        profile_idc,
        100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135
    ) {
        chroma_format_idc = reader.read_exp_golomb()?;
        if chroma_format_idc == 3 {
            separate_colour_plane = reader.read_bit()?;
        }
        // bit depths
        reader.read_exp_golomb()?;
        reader.read_exp_golomb()?;
        // qpprime_y_zero_transform_bypass_flag
        reader.read_bit()?;
        if reader.read_bit()? {
            let num_lists = if chroma_format_idc == 3 { 12 } else { 8 };
            for list in 0..num_lists {
                if reader.read_bit()? {
                    let size = if list < 6 { 16 } else { 64 };
                    let mut last_scale = 8i32;
                    let mut next_scale = 8i32;
                    for _ in 0..size {
                        if next_scale != 0 {
                            let delta = read_signed_exp_golomb(&mut reader)?;
                            next_scale = (last_scale + delta + 256).rem_euclid(256);
                        }
                        if next_scale != 0 {
                            last_scale = next_scale;
                        }
                    }
                }
            }
        }
    }

    // log2_max_frame_num_minus4
    reader.read_exp_golomb()?;
    match reader.read_exp_golomb()? {
        0 => {
            reader.read_exp_golomb()?;
        }
        1 => {
            reader.read_bit()?;
            read_signed_exp_golomb(&mut reader)?;
            read_signed_exp_golomb(&mut reader)?;
            let cycle = reader.read_exp_golomb()?;
            for _ in 0..cycle {
                read_signed_exp_golomb(&mut reader)?;
            }
        }
        _ => {}
    }
    // max_num_ref_frames, gaps_in_frame_num_value_allowed_flag
    reader.read_exp_golomb()?;
    reader.read_bit()?;

    let width_in_mbs = reader.read_exp_golomb()? + 1;
    let height_in_map_units = reader.read_exp_golomb()? + 1;
    let frame_mbs_only = reader.read_bit()?;
    if !frame_mbs_only {
        // mb_adaptive_frame_field_flag
        reader.read_bit()?;
    }
    // direct_8x8_inference_flag
    reader.read_bit()?;

    let (mut crop_left, mut crop_right, mut crop_top, mut crop_bottom) = (0, 0, 0, 0);
    if reader.read_bit()? {
        crop_left = reader.read_exp_golomb()?;
        crop_right = reader.read_exp_golomb()?;
        crop_top = reader.read_exp_golomb()?;
        crop_bottom = reader.read_exp_golomb()?;
    }

    let frame_height_factor = if frame_mbs_only { 1 } else { 2 };
    let chroma_array_type = if separate_colour_plane { 0 } else { chroma_format_idc };
    let (crop_unit_x, crop_unit_y) = match chroma_array_type {
        0 => (1, frame_height_factor),
        1 => (2, 2 * frame_height_factor),
        2 => (2, frame_height_factor),
        _ => (1, frame_height_factor),
    };

    let width = (width_in_mbs * 16)
        .checked_sub((crop_left + crop_right) * crop_unit_x)
        .ok_or_else(|| RtpError::MalformedPayload("H264 SPS cropping exceeds width".to_string()))?;
    let height = (height_in_map_units * 16 * frame_height_factor)
        .checked_sub((crop_top + crop_bottom) * crop_unit_y)
        .ok_or_else(|| RtpError::MalformedPayload("H264 SPS cropping exceeds height".to_string()))?;

    Ok(SpsInfo { id, width, height })
}

/// Returns `(pps_id, sps_id)` from a PPS body.
pub fn parse_pps_ids(body: &[u8]) -> Result<(u32, u32)> {
    let rbsp = unescape_rbsp(body);
    let mut reader = BitReader::new(&rbsp);
    let pps_id = reader.read_exp_golomb()?;
    let sps_id = reader.read_exp_golomb()?;
    Ok((pps_id, sps_id))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceHeader {
    pub first_mb_in_slice: u32,
    pub pps_id: u32,
}

pub fn parse_slice_header(body: &[u8]) -> Result<SliceHeader> {
    let rbsp = unescape_rbsp(body);
    let mut reader = BitReader::new(&rbsp);
    let first_mb_in_slice = reader.read_exp_golomb()?;
    // slice_type
    reader.read_exp_golomb()?;
    let pps_id = reader.read_exp_golomb()?;
    Ok(SliceHeader {
        first_mb_in_slice,
        pps_id,
    })
}

/// Splits a STAP-A payload into its NAL units.
fn parse_stap_a(payload: &[u8]) -> Result<Vec<&[u8]>> {
    let mut rest = payload.get(NAL_HEADER_SIZE..).unwrap_or_default();
    let mut nalus = Vec::new();
    while !rest.is_empty() {
        if rest.len() < 2 {
            return Err(RtpError::truncated("H264 STAP-A length"));
        }
        let size = usize::from(u16::from_be_bytes([rest[0], rest[1]]));
        rest = &rest[2..];
        if size == 0 || size > rest.len() {
            return Err(RtpError::MalformedPayload(format!(
                "H264 STAP-A NAL unit of {size} bytes with {} left",
                rest.len()
            )));
        }
        nalus.push(&rest[..size]);
        rest = &rest[size..];
    }
    if nalus.is_empty() {
        return Err(RtpError::MalformedPayload("empty H264 STAP-A".to_string()));
    }
    Ok(nalus)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct H264Depacketizer;

impl H264Depacketizer {
    fn parse_stap_a_or_single_nalu(rtp_payload: &[u8]) -> Result<ParsedPayload> {
        let mut video_header = VideoHeader::new(VideoCodec::H264);
        let mut h264 = H264Header::default();

        let nalus = if rtp_payload[0] & NALU_TYPE_MASK == NALU_STAP_A {
            let nalus = parse_stap_a(rtp_payload)?;
            h264.packetization_type = H264PacketizationType::StapA;
            h264.nalu_type = nalus[0][0] & NALU_TYPE_MASK;
            nalus
        } else {
            h264.packetization_type = H264PacketizationType::SingleNalu;
            h264.nalu_type = rtp_payload[0] & NALU_TYPE_MASK;
            vec![rtp_payload]
        };

        for nalu in nalus {
            let mut info = NaluInfo {
                nalu_type: nalu[0] & NALU_TYPE_MASK,
                sps_id: None,
                pps_id: None,
            };
            let body = &nalu[NAL_HEADER_SIZE..];
            if body.is_empty() {
                return Err(RtpError::MalformedPayload("empty H264 NAL unit".to_string()));
            }
            match info.nalu_type {
                NALU_SPS => {
                    let sps = parse_sps(body).map_err(payload_error("SPS"))?;
                    info.sps_id = Some(sps.id);
                    video_header.width = u16::try_from(sps.width).unwrap_or(u16::MAX);
                    video_header.height = u16::try_from(sps.height).unwrap_or(u16::MAX);
                    video_header.frame_type = FrameType::KeyFrame;
                    video_header.is_first_packet_in_frame = true;
                }
                NALU_PPS => {
                    let (pps_id, sps_id) = parse_pps_ids(body).map_err(payload_error("PPS"))?;
                    info.pps_id = Some(pps_id);
                    info.sps_id = Some(sps_id);
                    video_header.is_first_packet_in_frame = true;
                }
                NALU_IDR | NALU_SLICE => {
                    if info.nalu_type == NALU_IDR {
                        video_header.frame_type = FrameType::KeyFrame;
                    }
                    let slice = parse_slice_header(body).map_err(payload_error("slice header"))?;
                    info.pps_id = Some(slice.pps_id);
                    if slice.first_mb_in_slice == 0 {
                        video_header.is_first_packet_in_frame = true;
                    }
                }
                NALU_AUD | NALU_SEI => {
                    video_header.is_first_packet_in_frame = true;
                }
                NALU_END_OF_SEQUENCE | NALU_END_OF_STREAM | NALU_FILLER | NALU_STAP_A
                | NALU_FU_A => {
                    return Err(RtpError::MalformedPayload(format!(
                        "unexpected H264 NAL unit type {} in aggregate",
                        info.nalu_type
                    )));
                }
                _ => {}
            }
            h264.nalus.push(info);
        }

        video_header.codec_header = CodecHeader::H264(h264);
        Ok(ParsedPayload {
            video_header,
            payload: rtp_payload.to_vec(),
        })
    }

    fn parse_fu_a(rtp_payload: &[u8]) -> Result<ParsedPayload> {
        if rtp_payload.len() < FU_A_HEADER_SIZE {
            return Err(RtpError::truncated("H264 FU-A header"));
        }
        let original_nalu_type = rtp_payload[1] & NALU_TYPE_MASK;
        let first_fragment = rtp_payload[1] & FU_START_BIT != 0;

        let mut video_header = VideoHeader::new(VideoCodec::H264);
        let mut info = NaluInfo {
            nalu_type: original_nalu_type,
            sps_id: None,
            pps_id: None,
        };
        if first_fragment && matches!(original_nalu_type, NALU_IDR | NALU_SLICE) {
            let slice = parse_slice_header(&rtp_payload[FU_A_HEADER_SIZE..])
                .map_err(payload_error("FU-A slice header"))?;
            info.pps_id = Some(slice.pps_id);
            video_header.is_first_packet_in_frame = slice.first_mb_in_slice == 0;
            if original_nalu_type == NALU_IDR {
                video_header.frame_type = FrameType::KeyFrame;
            }
        }

        video_header.codec_header = CodecHeader::H264(H264Header {
            packetization_type: H264PacketizationType::FuA,
            nalu_type: original_nalu_type,
            nalus: if first_fragment { vec![info] } else { Vec::new() },
        });
        Ok(ParsedPayload {
            video_header,
            payload: rtp_payload.to_vec(),
        })
    }
}

impl Depacketizer for H264Depacketizer {
    fn parse(&self, rtp_payload: &[u8]) -> Result<ParsedPayload> {
        let Some(&first) = rtp_payload.first() else {
            return Err(RtpError::MalformedPayload("empty H264 payload".to_string()));
        };
        if first & NALU_TYPE_MASK == NALU_FU_A {
            Self::parse_fu_a(rtp_payload)
        } else {
            Self::parse_stap_a_or_single_nalu(rtp_payload)
        }
    }

    /// Rebuilds an Annex B bitstream: every NAL unit gets a start code and
    /// FU-A fragments are joined under their original NAL header.
    fn assemble_frame(&self, payloads: &[&[u8]]) -> Result<Vec<u8>> {
        let mut frame =
            Vec::with_capacity(payloads.iter().map(|p| p.len() + START_CODE.len()).sum());
        for payload in payloads {
            let Some(&first) = payload.first() else {
                return Err(RtpError::AssemblyFailure("empty H264 payload".to_string()));
            };
            match first & NALU_TYPE_MASK {
                NALU_FU_A => {
                    if payload.len() < FU_A_HEADER_SIZE {
                        return Err(RtpError::AssemblyFailure("H264 FU-A truncated".to_string()));
                    }
                    if payload[1] & FU_START_BIT != 0 {
                        frame.extend_from_slice(&START_CODE);
                        frame.push((first & F_NRI_MASK) | (payload[1] & NALU_TYPE_MASK));
                    }
                    frame.extend_from_slice(&payload[FU_A_HEADER_SIZE..]);
                }
                NALU_STAP_A => {
                    let nalus = parse_stap_a(payload)
                        .map_err(|err| RtpError::AssemblyFailure(err.to_string()))?;
                    for nalu in nalus {
                        frame.extend_from_slice(&START_CODE);
                        frame.extend_from_slice(nalu);
                    }
                }
                _ => {
                    frame.extend_from_slice(&START_CODE);
                    frame.extend_from_slice(payload);
                }
            }
        }
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bit_io::BitWriter;

    fn write_ue(writer: &mut BitWriter, value: u32) {
        let code = u64::from(value) + 1;
        let bits = u64::BITS - code.leading_zeros();
        writer.write_bits(0, bits - 1);
        writer.write_bits(code, bits);
    }

    /// Baseline SPS body for a 1280x720 stream.
    fn sps_body() -> Vec<u8> {
        let mut writer = BitWriter::new();
        writer.write_bits(66, 8);
        writer.write_bits(0, 8);
        writer.write_bits(31, 8);
        write_ue(&mut writer, 0); // sps id
        write_ue(&mut writer, 0); // log2_max_frame_num_minus4
        write_ue(&mut writer, 0); // pic_order_cnt_type
        write_ue(&mut writer, 0); // log2_max_pic_order_cnt_lsb_minus4
        write_ue(&mut writer, 1); // max_num_ref_frames
        writer.write_bit(false);
        write_ue(&mut writer, 79);
        write_ue(&mut writer, 44);
        writer.write_bit(true); // frame_mbs_only
        writer.write_bit(true);
        writer.write_bit(false); // no cropping
        writer.write_bit(false); // no VUI
        writer.write_bit(true); // stop bit
        writer.into_bytes()
    }

    fn slice_body(first_mb: u32, pps_id: u32) -> Vec<u8> {
        let mut writer = BitWriter::new();
        write_ue(&mut writer, first_mb);
        write_ue(&mut writer, 7);
        write_ue(&mut writer, pps_id);
        writer.write_bit(true);
        writer.into_bytes()
    }

    fn nalu(nalu_type: u8, body: &[u8]) -> Vec<u8> {
        let mut out = vec![0x60 | nalu_type];
        out.extend_from_slice(body);
        out
    }

    fn stap_a(nalus: &[Vec<u8>]) -> Vec<u8> {
        let mut out = vec![0x78];
        for nalu in nalus {
            out.extend_from_slice(&(nalu.len() as u16).to_be_bytes());
            out.extend_from_slice(nalu);
        }
        out
    }

    fn h264_header(parsed: &ParsedPayload) -> &H264Header {
        match &parsed.video_header.codec_header {
            CodecHeader::H264(header) => header,
            other => panic!("expected H264 header, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_sps_resolution() {
        let sps = parse_sps(&sps_body()).unwrap();
        assert_eq!(sps, SpsInfo { id: 0, width: 1280, height: 720 });
    }

    #[test]
    fn test_unescape_rbsp() {
        assert_eq!(unescape_rbsp(&[0, 0, 3, 1, 0, 0, 3]), vec![0, 0, 1, 0, 0]);
        assert_eq!(unescape_rbsp(&[0, 3, 0, 0]), vec![0, 3, 0, 0]);
    }

    #[test]
    fn test_single_idr_nalu() {
        let payload = nalu(NALU_IDR, &slice_body(0, 2));
        let parsed = H264Depacketizer.parse(&payload).unwrap();
        assert!(parsed.video_header.is_keyframe());
        assert!(parsed.video_header.is_first_packet_in_frame);
        let header = h264_header(&parsed);
        assert_eq!(header.packetization_type, H264PacketizationType::SingleNalu);
        assert_eq!(header.nalus[0].pps_id, Some(2));
        assert_eq!(parsed.payload, payload);
    }

    #[test]
    fn test_slice_not_starting_frame() {
        let parsed = H264Depacketizer.parse(&nalu(NALU_SLICE, &slice_body(40, 0))).unwrap();
        assert!(!parsed.video_header.is_keyframe());
        assert!(!parsed.video_header.is_first_packet_in_frame);
    }

    #[test]
    fn test_stap_a_with_parameter_sets() {
        let pps_body = {
            let mut writer = BitWriter::new();
            write_ue(&mut writer, 3);
            write_ue(&mut writer, 0);
            writer.write_bit(true);
            writer.into_bytes()
        };
        let payload = stap_a(&[
            nalu(NALU_SPS, &sps_body()),
            nalu(NALU_PPS, &pps_body),
            nalu(NALU_IDR, &slice_body(0, 3)),
        ]);
        let parsed = H264Depacketizer.parse(&payload).unwrap();
        assert!(parsed.video_header.is_keyframe());
        assert!(parsed.video_header.is_first_packet_in_frame);
        assert_eq!(parsed.video_header.width, 1280);
        assert_eq!(parsed.video_header.height, 720);
        let header = h264_header(&parsed);
        assert_eq!(header.packetization_type, H264PacketizationType::StapA);
        assert_eq!(header.nalu_type, NALU_SPS);
        let types: Vec<u8> = header.nalus.iter().map(|n| n.nalu_type).collect();
        assert_eq!(types, vec![NALU_SPS, NALU_PPS, NALU_IDR]);
        assert_eq!(header.nalus[1].pps_id, Some(3));
    }

    #[test]
    fn test_stap_a_bad_length_fails() {
        assert!(H264Depacketizer.parse(&[0x78, 0x00, 0x05, 0x65, 0x88]).is_err());
        assert!(H264Depacketizer.parse(&[0x78]).is_err());
    }

    #[test]
    fn test_fu_a_fragments() {
        let mut first = vec![0x7c, 0x80 | NALU_IDR];
        first.extend_from_slice(&slice_body(0, 0));
        let parsed = H264Depacketizer.parse(&first).unwrap();
        assert!(parsed.video_header.is_first_packet_in_frame);
        assert!(parsed.video_header.is_keyframe());
        let header = h264_header(&parsed);
        assert_eq!(header.packetization_type, H264PacketizationType::FuA);
        assert_eq!(header.nalu_type, NALU_IDR);
        assert_eq!(header.nalus.len(), 1);

        let parsed = H264Depacketizer.parse(&[0x7c, 0x40 | NALU_IDR, 0xaa]).unwrap();
        assert!(!parsed.video_header.is_first_packet_in_frame);
        assert!(h264_header(&parsed).nalus.is_empty());

        assert!(H264Depacketizer.parse(&[0x7c]).is_err());
    }

    #[test]
    fn test_assemble_frame_adds_start_codes() {
        let stap = stap_a(&[vec![0x67, 0x01], vec![0x68, 0x02]]);
        let fu_start = [0x7c, 0x85, 0xaa];
        let fu_end = [0x7c, 0x45, 0xbb];
        let frame = H264Depacketizer
            .assemble_frame(&[&stap[..], &fu_start[..], &fu_end[..]])
            .unwrap();
        assert_eq!(
            frame,
            vec![0, 0, 0, 1, 0x67, 0x01, 0, 0, 0, 1, 0x68, 0x02, 0, 0, 0, 1, 0x65, 0xaa, 0xbb]
        );
    }

    #[test]
    fn test_assemble_single_nalu() {
        let frame = H264Depacketizer.assemble_frame(&[&[0x41, 0x9a][..]]).unwrap();
        assert_eq!(frame, vec![0, 0, 0, 1, 0x41, 0x9a]);
    }
}
