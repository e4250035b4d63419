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

//! Legacy generic frame descriptor header extension, version 00.
//!
//! ```text
//!  0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+
//! |B|E|F|L|D|  T  |  B/E: first/last packet in subframe, F/L deprecated subframe flags
//! +-+-+-+-+-+-+-+-+  D: dependency diffs follow, T: temporal layer
//! |  spatial mask |  only when B is set
//! +---------------+
//! |  frame id (LE)|  16 bits
//! +---------------+
//! |  frame diffs  |  1 or 2 bytes each, when D is set
//! +---------------+
//! |  width, height|  16 bits each, big endian, independent frames only
//! +---------------+
//! ```

use crate::error::{Result, RtpError};

const FLAG_BEGIN_OF_SUBFRAME: u8 = 0x80;
const FLAG_END_OF_SUBFRAME: u8 = 0x40;
const FLAG_FIRST_SUBFRAME: u8 = 0x20;
const FLAG_LAST_SUBFRAME: u8 = 0x10;
const FLAG_DEPENDENCIES: u8 = 0x08;
const MASK_TEMPORAL_LAYER: u8 = 0x07;

const FLAG_MORE_DEPENDENCIES: u8 = 0x01;
const FLAG_EXTENDED_OFFSET: u8 = 0x02;

/// Largest frame diff that fits the two byte encoding.
pub const MAX_FRAME_DIFF: u16 = 0x3fff;
pub const MAX_NUM_FRAME_DEPENDENCIES: usize = 8;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenericFrameDescriptor {
    pub first_packet_in_subframe: bool,
    pub last_packet_in_subframe: bool,
    pub first_subframe_in_frame: bool,
    pub last_subframe_in_frame: bool,
    pub temporal_layer: u8,
    pub spatial_layers_bitmask: u8,
    pub frame_id: u16,
    pub frame_dependency_diffs: Vec<u16>,
    pub width: u16,
    pub height: u16,
}

impl GenericFrameDescriptor {
    /// A frame without dependencies can be decoded on its own.
    pub fn is_independent(&self) -> bool {
        self.frame_dependency_diffs.is_empty()
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        let Some(&flags) = data.first() else {
            return Err(RtpError::MalformedExtension(
                "empty generic frame descriptor".to_string(),
            ));
        };
        let mut descriptor = GenericFrameDescriptor {
            first_packet_in_subframe: flags & FLAG_BEGIN_OF_SUBFRAME != 0,
            last_packet_in_subframe: flags & FLAG_END_OF_SUBFRAME != 0,
            first_subframe_in_frame: flags & FLAG_FIRST_SUBFRAME != 0,
            last_subframe_in_frame: flags & FLAG_LAST_SUBFRAME != 0,
            ..Default::default()
        };
        if !descriptor.first_packet_in_subframe {
            return Ok(descriptor);
        }

        if data.len() < 4 {
            return Err(RtpError::MalformedExtension(format!(
                "generic frame descriptor of {} bytes on first packet",
                data.len()
            )));
        }
        descriptor.temporal_layer = flags & MASK_TEMPORAL_LAYER;
        descriptor.spatial_layers_bitmask = data[1];
        descriptor.frame_id = u16::from_le_bytes([data[2], data[3]]);

        let mut offset = 4;
        if flags & FLAG_DEPENDENCIES == 0 {
            if data.len() >= offset + 4 {
                descriptor.width = u16::from_be_bytes([data[offset], data[offset + 1]]);
                descriptor.height = u16::from_be_bytes([data[offset + 2], data[offset + 3]]);
            }
            return Ok(descriptor);
        }

        loop {
            let Some(&byte) = data.get(offset) else {
                return Err(RtpError::MalformedExtension(
                    "frame dependency diff truncated".to_string(),
                ));
            };
            offset += 1;
            let mut diff = u16::from(byte >> 2);
            if byte & FLAG_EXTENDED_OFFSET != 0 {
                let Some(&high) = data.get(offset) else {
                    return Err(RtpError::MalformedExtension(
                        "extended frame dependency diff truncated".to_string(),
                    ));
                };
                offset += 1;
                diff |= u16::from(high) << 6;
            }
            if descriptor.frame_dependency_diffs.len() == MAX_NUM_FRAME_DEPENDENCIES {
                return Err(RtpError::MalformedExtension(
                    "too many frame dependencies".to_string(),
                ));
            }
            descriptor.frame_dependency_diffs.push(diff);
            if byte & FLAG_MORE_DEPENDENCIES == 0 {
                break;
            }
        }
        Ok(descriptor)
    }

    /// Writes the descriptor. Subframes are deprecated, so both subframe flags
    /// are always set.
    pub fn write(&self) -> Result<Vec<u8>> {
        let mut flags = FLAG_FIRST_SUBFRAME | FLAG_LAST_SUBFRAME;
        if self.first_packet_in_subframe {
            flags |= FLAG_BEGIN_OF_SUBFRAME;
        }
        if self.last_packet_in_subframe {
            flags |= FLAG_END_OF_SUBFRAME;
        }
        if !self.first_packet_in_subframe {
            return Ok(vec![flags]);
        }

        flags |= self.temporal_layer & MASK_TEMPORAL_LAYER;
        if !self.frame_dependency_diffs.is_empty() {
            flags |= FLAG_DEPENDENCIES;
        }
        let mut out = vec![flags, self.spatial_layers_bitmask];
        out.extend_from_slice(&self.frame_id.to_le_bytes());

        if self.frame_dependency_diffs.is_empty() {
            if self.width > 0 && self.height > 0 {
                out.extend_from_slice(&self.width.to_be_bytes());
                out.extend_from_slice(&self.height.to_be_bytes());
            }
            return Ok(out);
        }

        let last = self.frame_dependency_diffs.len() - 1;
        for (i, &diff) in self.frame_dependency_diffs.iter().enumerate() {
            if diff == 0 || diff > MAX_FRAME_DIFF {
                return Err(RtpError::MalformedExtension(format!(
                    "frame diff {diff} out of range"
                )));
            }
            let extended = diff > 0x3f;
            let mut byte = ((diff & 0x3f) as u8) << 2;
            if extended {
                byte |= FLAG_EXTENDED_OFFSET;
            }
            if i != last {
                byte |= FLAG_MORE_DEPENDENCIES;
            }
            out.push(byte);
            if extended {
                out.push((diff >> 6) as u8);
            }
        }
        Ok(out)
    }
}
