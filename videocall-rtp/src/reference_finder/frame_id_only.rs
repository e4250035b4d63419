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

use crate::frame::EncodedFrame;
use crate::sequence_number_unwrapper::PictureIdUnwrapper;
use crate::video_header::CodecHeader;

/// Uses the picture id as frame id; a delta frame references the picture
/// right before it.
#[derive(Debug, Default)]
pub struct FrameIdOnlyRefFinder {
    unwrapper: PictureIdUnwrapper,
}

fn picture_id(frame: &EncodedFrame) -> Option<u16> {
    match &frame.video_header.codec_header {
        CodecHeader::Vp8(vp8) => vp8.picture_id,
        CodecHeader::Vp9(vp9) => vp9.picture_id,
        CodecHeader::Generic(generic) => Some(generic.picture_id),
        _ => None,
    }
}

impl FrameIdOnlyRefFinder {
    pub fn manage_frame(&mut self, mut frame: EncodedFrame) -> EncodedFrame {
        let Some(picture_id) = picture_id(&frame) else {
            return frame;
        };
        frame.id = self.unwrapper.unwrap(picture_id & 0x7fff);
        frame.spatial_index = 0;
        frame.references = if frame.is_keyframe() {
            Vec::new()
        } else {
            vec![frame.id - 1]
        };
        frame
    }
}
