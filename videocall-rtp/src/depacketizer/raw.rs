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

use super::{Depacketizer, ParsedPayload};
use crate::error::Result;
use crate::video_header::{VideoCodec, VideoHeader};

/// Passes payloads through untouched.
///
/// Frame boundaries and key frames are only known from a dependency
/// descriptor or generic frame descriptor attached to the packet.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawDepacketizer;

impl Depacketizer for RawDepacketizer {
    fn parse(&self, rtp_payload: &[u8]) -> Result<ParsedPayload> {
        Ok(ParsedPayload {
            video_header: VideoHeader::new(VideoCodec::Raw),
            payload: rtp_payload.to_vec(),
        })
    }
}
