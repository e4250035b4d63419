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

//! Codec specific RTP payload parsing.
//!
//! A [`Depacketizer`] turns one RTP payload into video metadata plus the
//! bytes that go into the frame, and later concatenates the payloads of a
//! complete frame into a decodable bitstream.

pub mod av1;
pub mod generic;
pub mod h264;
pub mod h265;
pub mod raw;
pub mod vp8;
pub mod vp9;

use crate::error::Result;
use crate::video_header::{VideoCodec, VideoHeader};

/// Result of parsing a single RTP payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPayload {
    pub video_header: VideoHeader,
    /// Bytes stored in the packet buffer for this packet.
    pub payload: Vec<u8>,
}

pub trait Depacketizer: Send {
    fn parse(&self, rtp_payload: &[u8]) -> Result<ParsedPayload>;

    /// Builds the frame bitstream from the payloads of its packets, in order.
    fn assemble_frame(&self, payloads: &[&[u8]]) -> Result<Vec<u8>> {
        Ok(payloads.concat())
    }
}

/// The depacketizer of one codec, selected once and owned by the assembler.
#[derive(Debug, Clone, Copy)]
pub enum CodecDepacketizer {
    Raw(raw::RawDepacketizer),
    Generic(generic::GenericDepacketizer),
    Vp8(vp8::Vp8Depacketizer),
    Vp9(vp9::Vp9Depacketizer),
    Av1(av1::Av1Depacketizer),
    H264(h264::H264Depacketizer),
    H265(h265::H265Depacketizer),
}

impl CodecDepacketizer {
    pub fn new(codec: VideoCodec) -> Self {
        match codec {
            VideoCodec::Raw => Self::Raw(raw::RawDepacketizer),
            VideoCodec::Generic => Self::Generic(generic::GenericDepacketizer),
            VideoCodec::Vp8 => Self::Vp8(vp8::Vp8Depacketizer),
            VideoCodec::Vp9 => Self::Vp9(vp9::Vp9Depacketizer),
            VideoCodec::Av1 => Self::Av1(av1::Av1Depacketizer),
            VideoCodec::H264 => Self::H264(h264::H264Depacketizer),
            VideoCodec::H265 => Self::H265(h265::H265Depacketizer),
        }
    }

    fn inner(&self) -> &dyn Depacketizer {
        match self {
            Self::Raw(d) => d,
            Self::Generic(d) => d,
            Self::Vp8(d) => d,
            Self::Vp9(d) => d,
            Self::Av1(d) => d,
            Self::H264(d) => d,
            Self::H265(d) => d,
        }
    }
}

impl Depacketizer for CodecDepacketizer {
    fn parse(&self, rtp_payload: &[u8]) -> Result<ParsedPayload> {
        self.inner().parse(rtp_payload)
    }

    fn assemble_frame(&self, payloads: &[&[u8]]) -> Result<Vec<u8>> {
        self.inner().assemble_frame(payloads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_assembly_concatenates_payloads() {
        let depacketizer = CodecDepacketizer::new(VideoCodec::Raw);
        let frame = depacketizer
            .assemble_frame(&[&[1, 2][..], &[3][..], &[][..]])
            .unwrap();
        assert_eq!(frame, vec![1, 2, 3]);
    }

    #[test]
    fn test_assembly_is_dispatched_to_codec() {
        let depacketizer = CodecDepacketizer::new(VideoCodec::H264);
        let frame = depacketizer.assemble_frame(&[&[0x41, 0x01][..]]).unwrap();
        assert_eq!(frame, vec![0, 0, 0, 1, 0x41, 0x01]);
    }

    #[test]
    fn test_factory_sets_codec() {
        for codec in [VideoCodec::Raw, VideoCodec::Generic, VideoCodec::Vp9] {
            let depacketizer = CodecDepacketizer::new(codec);
            let parsed = depacketizer.parse(&[0x00, 0xaa]).unwrap();
            assert_eq!(parsed.video_header.codec, codec);
        }
    }
}
