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

//! Received RTP packets and their header extensions.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{Result, RtpError};

const RTP_VERSION: u8 = 2;
const FIXED_HEADER_SIZE: usize = 12;
const ONE_BYTE_EXTENSION_PROFILE: u16 = 0xBEDE;
const TWO_BYTE_EXTENSION_PROFILE_MASK: u16 = 0xFFF0;
const TWO_BYTE_EXTENSION_PROFILE: u16 = 0x1000;

/// Header extensions understood by the frame assembler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RtpExtension {
    DependencyDescriptor,
    GenericFrameDescriptor00,
}

/// Maps negotiated extension ids to [`RtpExtension`] kinds.
#[derive(Debug, Clone, Default)]
pub struct ExtensionMap {
    ids: HashMap<u8, RtpExtension>,
}

impl ExtensionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: u8, extension: RtpExtension) -> Result<()> {
        if id == 0 {
            return Err(RtpError::InvalidConfig(format!(
                "extension id {id} out of range"
            )));
        }
        if let Some(existing) = self.ids.get(&id) {
            if *existing != extension {
                return Err(RtpError::InvalidConfig(format!(
                    "extension id {id} already registered for {existing:?}"
                )));
            }
        }
        self.ids.insert(id, extension);
        Ok(())
    }

    pub fn kind(&self, id: u8) -> Option<RtpExtension> {
        self.ids.get(&id).copied()
    }
}

/// An RTP packet as received from the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacketReceived {
    marker: bool,
    payload_type: u8,
    sequence_number: u16,
    timestamp: u32,
    ssrc: u32,
    csrcs: Vec<u32>,
    extensions: Vec<(RtpExtension, Vec<u8>)>,
    payload: Vec<u8>,
}

impl RtpPacketReceived {
    pub fn new(sequence_number: u16, timestamp: u32, marker: bool, payload: Vec<u8>) -> Self {
        Self {
            marker,
            payload_type: 96,
            sequence_number,
            timestamp,
            ssrc: 0,
            csrcs: Vec::new(),
            extensions: Vec::new(),
            payload,
        }
    }

    pub fn with_payload_type(mut self, payload_type: u8) -> Self {
        self.payload_type = payload_type;
        self
    }

    pub fn with_ssrc(mut self, ssrc: u32) -> Self {
        self.ssrc = ssrc;
        self
    }

    pub fn with_extension(mut self, extension: RtpExtension, data: Vec<u8>) -> Self {
        self.set_extension(extension, data);
        self
    }

    pub fn set_extension(&mut self, extension: RtpExtension, data: Vec<u8>) {
        self.extensions.retain(|(kind, _)| *kind != extension);
        self.extensions.push((extension, data));
    }

    /// Parses a wire packet. Extensions not present in `extension_map` are ignored.
    pub fn parse(data: &[u8], extension_map: &ExtensionMap) -> Result<Self> {
        if data.len() < FIXED_HEADER_SIZE {
            return Err(RtpError::MalformedPacket(format!(
                "{} bytes is shorter than the fixed header",
                data.len()
            )));
        }
        let version = data[0] >> 6;
        if version != RTP_VERSION {
            return Err(RtpError::MalformedPacket(format!(
                "unsupported version {version}"
            )));
        }
        let has_padding = data[0] & 0x20 != 0;
        let has_extension = data[0] & 0x10 != 0;
        let csrc_count = (data[0] & 0x0f) as usize;
        let mut packet = RtpPacketReceived {
            marker: data[1] & 0x80 != 0,
            payload_type: data[1] & 0x7f,
            sequence_number: u16::from_be_bytes([data[2], data[3]]),
            timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            csrcs: Vec::with_capacity(csrc_count),
            extensions: Vec::new(),
            payload: Vec::new(),
        };

        let mut offset = FIXED_HEADER_SIZE;
        if data.len() < offset + 4 * csrc_count {
            return Err(RtpError::MalformedPacket("CSRC list truncated".to_string()));
        }
        for chunk in data[offset..offset + 4 * csrc_count].chunks_exact(4) {
            packet
                .csrcs
                .push(u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
        }
        offset += 4 * csrc_count;

        if has_extension {
            if data.len() < offset + 4 {
                return Err(RtpError::MalformedPacket(
                    "extension header truncated".to_string(),
                ));
            }
            let profile = u16::from_be_bytes([data[offset], data[offset + 1]]);
            let length = 4 * u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            offset += 4;
            if data.len() < offset + length {
                return Err(RtpError::MalformedPacket(
                    "extension block truncated".to_string(),
                ));
            }
            let block = &data[offset..offset + length];
            if profile == ONE_BYTE_EXTENSION_PROFILE {
                packet.parse_one_byte_extensions(block, extension_map);
            } else if profile & TWO_BYTE_EXTENSION_PROFILE_MASK == TWO_BYTE_EXTENSION_PROFILE {
                packet.parse_two_byte_extensions(block, extension_map);
            } else {
                log::trace!("Ignoring extension block with profile {profile:#06x}");
            }
            offset += length;
        }

        let mut end = data.len();
        if has_padding {
            let padding = data[end - 1] as usize;
            if padding == 0 || offset + padding > end {
                return Err(RtpError::MalformedPacket(format!(
                    "invalid padding size {padding}"
                )));
            }
            end -= padding;
        }
        packet.payload = data[offset..end].to_vec();
        Ok(packet)
    }

    fn parse_one_byte_extensions(&mut self, block: &[u8], extension_map: &ExtensionMap) {
        let mut i = 0;
        while i < block.len() {
            let id = block[i] >> 4;
            if id == 0 {
                i += 1;
                continue;
            }
            if id == 15 {
                break;
            }
            let len = (block[i] & 0x0f) as usize + 1;
            i += 1;
            if i + len > block.len() {
                log::warn!("One-byte extension {id} overruns the extension block");
                break;
            }
            self.store_extension(id, &block[i..i + len], extension_map);
            i += len;
        }
    }

    fn parse_two_byte_extensions(&mut self, block: &[u8], extension_map: &ExtensionMap) {
        let mut i = 0;
        while i + 1 < block.len() {
            let id = block[i];
            if id == 0 {
                i += 1;
                continue;
            }
            let len = block[i + 1] as usize;
            i += 2;
            if i + len > block.len() {
                log::warn!("Two-byte extension {id} overruns the extension block");
                break;
            }
            self.store_extension(id, &block[i..i + len], extension_map);
            i += len;
        }
    }

    fn store_extension(&mut self, id: u8, data: &[u8], extension_map: &ExtensionMap) {
        if let Some(kind) = extension_map.kind(id) {
            self.set_extension(kind, data.to_vec());
        }
    }

    pub fn marker(&self) -> bool {
        self.marker
    }

    pub fn payload_type(&self) -> u8 {
        self.payload_type
    }

    pub fn sequence_number(&self) -> u16 {
        self.sequence_number
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn csrcs(&self) -> &[u32] {
        &self.csrcs
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn has_extension(&self, extension: RtpExtension) -> bool {
        self.extensions.iter().any(|(kind, _)| *kind == extension)
    }

    pub fn extension(&self, extension: RtpExtension) -> Option<&[u8]> {
        self.extensions
            .iter()
            .find(|(kind, _)| *kind == extension)
            .map(|(_, data)| data.as_slice())
    }
}
