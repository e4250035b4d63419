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

use crate::error::{Result, RtpError};
use crate::frame::{EncodedFrame, MAX_FRAME_REFERENCES};

/// Takes id, layer indices and references from a dependency descriptor or
/// generic frame descriptor.
#[derive(Debug, Default)]
pub struct DescriptorRefFinder;

impl DescriptorRefFinder {
    pub fn manage_frame(&mut self, mut frame: EncodedFrame) -> Result<EncodedFrame> {
        let Some(generic) = frame.video_header.generic.as_ref() else {
            return Ok(frame);
        };
        if generic.dependencies.len() > MAX_FRAME_REFERENCES {
            log::warn!(
                "Frame {} has {} dependencies, dropping it",
                generic.frame_id,
                generic.dependencies.len()
            );
            return Err(RtpError::TooManyReferences(generic.dependencies.len()));
        }
        frame.id = generic.frame_id;
        frame.spatial_index = generic.spatial_index;
        frame.temporal_index = generic.temporal_index;
        frame.references = generic.dependencies.clone();
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference_finder::test_util::create_frame;
    use crate::video_header::GenericDescriptorInfo;

    #[test]
    fn test_copies_descriptor_fields() {
        let mut frame = create_frame(100, 101, false);
        frame.video_header.generic = Some(GenericDescriptorInfo {
            frame_id: 7,
            spatial_index: 1,
            temporal_index: 2,
            dependencies: vec![5, 6],
            ..Default::default()
        });
        let frame = DescriptorRefFinder.manage_frame(frame).unwrap();
        assert_eq!(frame.id, 7);
        assert_eq!(frame.spatial_index, 1);
        assert_eq!(frame.temporal_index, 2);
        assert_eq!(frame.references, vec![5, 6]);
    }

    #[test]
    fn test_too_many_references() {
        let mut frame = create_frame(0, 0, false);
        frame.video_header.generic = Some(GenericDescriptorInfo {
            frame_id: 9,
            dependencies: vec![1, 2, 3, 4, 5, 6],
            ..Default::default()
        });
        assert_eq!(
            DescriptorRefFinder.manage_frame(frame),
            Err(RtpError::TooManyReferences(6))
        );
    }
}
