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

//! AV1 RTP payload format.
//!
//! Parsing only reads the aggregation header; the OBU elements stay in the
//! stored payload and are stitched back together when the frame is
//! assembled, since an OBU may span several packets.
//!
//! ```text
//! +-+-+-+-+-+-+-+-+
//! |Z|Y| W |N|-|-|-|
//! +-+-+-+-+-+-+-+-+
//! ```

use super::{Depacketizer, ParsedPayload};
use crate::bit_io::{read_leb128, write_leb128};
use crate::error::{Result, RtpError};
use crate::frame::FrameType;
use crate::video_header::{VideoCodec, VideoHeader};

const CONTINUES_PREVIOUS_BIT: u8 = 0x80;
const CONTINUES_NEXT_BIT: u8 = 0x40;
const ELEMENT_COUNT_MASK: u8 = 0x30;
const NEW_SEQUENCE_BIT: u8 = 0x08;

const OBU_TYPE_MASK: u8 = 0x78;
const OBU_EXTENSION_PRESENT_BIT: u8 = 0x04;
const OBU_SIZE_PRESENT_BIT: u8 = 0x02;

const OBU_TYPE_TEMPORAL_DELIMITER: u8 = 2;
const OBU_TYPE_TILE_LIST: u8 = 8;
const OBU_TYPE_PADDING: u8 = 15;

#[derive(Debug, Default, Clone, Copy)]
pub struct Av1Depacketizer;

fn obu_type(header: u8) -> u8 {
    (header & OBU_TYPE_MASK) >> 3
}

fn assembly_error(message: &str) -> RtpError {
    RtpError::AssemblyFailure(format!("AV1: {message}"))
}

/// Splits one RTP payload into its OBU elements.
fn payload_elements(payload: &[u8]) -> Result<Vec<&[u8]>> {
    let Some((&aggregation_header, mut rest)) = payload.split_first() else {
        return Err(assembly_error("empty payload"));
    };
    let element_count = usize::from((aggregation_header & ELEMENT_COUNT_MASK) >> 4);

    let mut elements = Vec::new();
    while !rest.is_empty() {
        let is_last_counted = element_count != 0 && elements.len() + 1 == element_count;
        let length = if is_last_counted {
            rest.len()
        } else {
            let (length, consumed) =
                read_leb128(rest).ok_or_else(|| assembly_error("bad element length"))?;
            rest = &rest[consumed..];
            usize::try_from(length).map_err(|_| assembly_error("element length overflow"))?
        };
        if length > rest.len() {
            return Err(assembly_error("element exceeds payload"));
        }
        let (element, tail) = rest.split_at(length);
        elements.push(element);
        rest = tail;
        if is_last_counted {
            break;
        }
    }
    if element_count != 0 && elements.len() != element_count {
        return Err(assembly_error("element count mismatch"));
    }
    Ok(elements)
}

/// Writes one OBU with an explicit size field, dropping types that carry
/// nothing for the decoder.
fn write_obu(obu: &[u8], out: &mut Vec<u8>) -> Result<()> {
    let Some(&header) = obu.first() else {
        return Err(assembly_error("empty OBU"));
    };
    if matches!(
        obu_type(header),
        OBU_TYPE_TEMPORAL_DELIMITER | OBU_TYPE_TILE_LIST | OBU_TYPE_PADDING
    ) {
        return Ok(());
    }

    let mut offset = 1;
    let extension = if header & OBU_EXTENSION_PRESENT_BIT != 0 {
        let byte = *obu
            .get(1)
            .ok_or_else(|| assembly_error("missing OBU extension"))?;
        offset += 1;
        Some(byte)
    } else {
        None
    };

    let payload = if header & OBU_SIZE_PRESENT_BIT != 0 {
        let (size, consumed) = read_leb128(&obu[offset..])
            .ok_or_else(|| assembly_error("bad OBU size field"))?;
        offset += consumed;
        let size = usize::try_from(size).map_err(|_| assembly_error("OBU size overflow"))?;
        obu.get(offset..offset + size)
            .ok_or_else(|| assembly_error("OBU shorter than its size field"))?
    } else {
        &obu[offset..]
    };

    out.push(header | OBU_SIZE_PRESENT_BIT);
    if let Some(extension) = extension {
        out.push(extension);
    }
    write_leb128(payload.len() as u64, out);
    out.extend_from_slice(payload);
    Ok(())
}

impl Depacketizer for Av1Depacketizer {
    fn parse(&self, rtp_payload: &[u8]) -> Result<ParsedPayload> {
        if rtp_payload.len() < 2 {
            return Err(RtpError::MalformedPayload(
                "AV1 payload without OBU data".to_string(),
            ));
        }
        let aggregation_header = rtp_payload[0];
        let continues_previous = aggregation_header & CONTINUES_PREVIOUS_BIT != 0;
        let new_sequence = aggregation_header & NEW_SEQUENCE_BIT != 0;
        if continues_previous && new_sequence {
            return Err(RtpError::MalformedPayload(
                "AV1 new sequence cannot continue an OBU".to_string(),
            ));
        }

        let mut video_header = VideoHeader::new(VideoCodec::Av1);
        video_header.is_first_packet_in_frame = !continues_previous;
        if new_sequence {
            video_header.frame_type = FrameType::KeyFrame;
        }
        Ok(ParsedPayload {
            video_header,
            payload: rtp_payload.to_vec(),
        })
    }

    fn assemble_frame(&self, payloads: &[&[u8]]) -> Result<Vec<u8>> {
        let mut obus: Vec<Vec<u8>> = Vec::new();
        let mut open_obu = false;

        for payload in payloads {
            let aggregation_header = payload
                .first()
                .copied()
                .ok_or_else(|| assembly_error("empty payload"))?;
            let continues_previous = aggregation_header & CONTINUES_PREVIOUS_BIT != 0;
            let continues_next = aggregation_header & CONTINUES_NEXT_BIT != 0;
            let elements = payload_elements(payload)?;

            for (index, element) in elements.iter().enumerate() {
                if index == 0 && continues_previous {
                    if !open_obu {
                        return Err(assembly_error("OBU continuation without a start"));
                    }
                    if let Some(last) = obus.last_mut() {
                        last.extend_from_slice(element);
                    }
                } else {
                    obus.push(element.to_vec());
                }
            }
            open_obu = continues_next && !elements.is_empty();
        }
        if open_obu {
            return Err(assembly_error("last OBU is incomplete"));
        }

        let mut frame =
            Vec::with_capacity(obus.iter().map(Vec::len).sum::<usize>() + obus.len() * 2);
        for obu in &obus {
            write_obu(obu, &mut frame)?;
        }
        Ok(frame)
    }
}
