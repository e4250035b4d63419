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

//! Contains the fundamental data structures for assembled video frames.

use serde::{Deserialize, Serialize};

use crate::video_header::{VideoCodec, VideoHeader};

/// Maximum number of references a single frame may declare.
pub const MAX_FRAME_REFERENCES: usize = 5;

/// The type of a video frame, indicating its dependency on other frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FrameType {
    /// A KeyFrame (or I-frame) can be decoded independently of any other frame.
    KeyFrame,
    /// A DeltaFrame (or P-frame) can only be decoded once its references have been decoded.
    #[default]
    DeltaFrame,
}

/// A complete encoded frame assembled from one or more RTP packets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedFrame {
    /// Unwrapped frame id, assigned by the reference finder.
    pub id: i64,
    /// Unwrapped sequence number of the first packet of the frame.
    pub first_seq_num: i64,
    /// Unwrapped sequence number of the last packet of the frame.
    pub last_seq_num: i64,
    /// RTP timestamp shared by every packet of the frame.
    pub rtp_timestamp: u32,
    pub payload_type: u8,
    pub marker: bool,
    pub spatial_index: u8,
    pub temporal_index: u8,
    /// Ids of the frames this frame depends on.
    pub references: Vec<i64>,
    /// Video header of the first packet.
    pub video_header: VideoHeader,
    /// Assembled bitstream.
    pub data: Vec<u8>,
}

impl EncodedFrame {
    pub fn frame_type(&self) -> FrameType {
        self.video_header.frame_type
    }

    pub fn is_keyframe(&self) -> bool {
        self.video_header.frame_type == FrameType::KeyFrame
    }

    pub fn codec(&self) -> VideoCodec {
        self.video_header.codec
    }

    pub fn width(&self) -> u16 {
        self.video_header.width
    }

    pub fn height(&self) -> u16 {
        self.video_header.height
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// References sorted ascending, convenient for comparisons.
    pub fn sorted_references(&self) -> Vec<i64> {
        let mut references = self.references.clone();
        references.sort_unstable();
        references
    }
}
