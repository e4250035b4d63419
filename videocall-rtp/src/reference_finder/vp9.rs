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

use crate::depacketizer::vp9::MAX_SPATIAL_LAYERS;
use crate::frame::{EncodedFrame, MAX_FRAME_REFERENCES};
use crate::sequence_number_unwrapper::PictureIdUnwrapper;
use crate::video_header::CodecHeader;

/// Reference finding for VP9 in flexible mode, where every packet lists the
/// picture id differences of its references.
///
/// Each spatial layer frame gets its own id, `picture_id * 5 + spatial_idx`,
/// so layer frames of one picture stay distinct.
#[derive(Debug, Default)]
pub struct Vp9RefFinder {
    unwrapper: PictureIdUnwrapper,
}

impl Vp9RefFinder {
    pub fn manage_frame(&mut self, mut frame: EncodedFrame) -> Vec<EncodedFrame> {
        let CodecHeader::Vp9(vp9) = &frame.video_header.codec_header else {
            return Vec::new();
        };
        let Some(picture_id) = vp9.picture_id else {
            return Vec::new();
        };
        let spatial_idx = vp9.spatial_idx;
        let layers = i64::from(MAX_SPATIAL_LAYERS);
        let unwrapped = self.unwrapper.unwrap(picture_id & 0x7fff);

        let mut references: Vec<i64> = vp9
            .pid_diffs
            .iter()
            .map(|&diff| (unwrapped - i64::from(diff)) * layers + i64::from(spatial_idx))
            .collect();
        let id = unwrapped * layers + i64::from(spatial_idx);
        if vp9.inter_layer_predicted && references.len() < MAX_FRAME_REFERENCES {
            references.push(id - 1);
        }
        let temporal_idx = vp9.temporal_idx.unwrap_or(0);

        frame.id = id;
        frame.spatial_index = spatial_idx;
        frame.temporal_index = temporal_idx;
        frame.references = references;
        vec![frame]
    }
}
