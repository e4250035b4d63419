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

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

use super::{FrameDecision, FrameStash};
use crate::frame::EncodedFrame;

const MAX_PADDING_AGE: i64 = 100;
const MAX_GOP_AGE: i64 = 2048;

/// Last frame id of a group of pictures, with and without the padding that
/// followed it.
#[derive(Debug, Clone, Copy)]
struct GopInfo {
    last_picture_id: i64,
    last_picture_id_with_padding: i64,
}

/// Reference finding from sequence number continuity alone.
///
/// Every frame gets its last sequence number as id. A delta frame is handed
/// off once the sequence number right before it is its group's last frame
/// or padding, and references that last frame.
#[derive(Debug)]
pub struct SeqNumOnlyRefFinder {
    /// Keyed by the last sequence number of each key frame.
    last_seq_num_gop: BTreeMap<i64, GopInfo>,
    stashed_padding: BTreeSet<i64>,
    stashed_frames: FrameStash<EncodedFrame>,
}

impl SeqNumOnlyRefFinder {
    pub fn new(max_stashed_frames: usize) -> Self {
        Self {
            last_seq_num_gop: BTreeMap::new(),
            stashed_padding: BTreeSet::new(),
            stashed_frames: FrameStash::new(max_stashed_frames),
        }
    }

    pub fn manage_frame(&mut self, mut frame: EncodedFrame) -> Vec<EncodedFrame> {
        match self.manage_frame_internal(&mut frame) {
            FrameDecision::Stash => {
                log::trace!("Stashing frame {}..{}", frame.first_seq_num, frame.last_seq_num);
                self.stashed_frames.push(frame);
                Vec::new()
            }
            FrameDecision::HandOff => {
                let mut frames = vec![frame];
                frames.extend(self.retry_stashed_frames());
                frames
            }
            FrameDecision::Drop => Vec::new(),
        }
    }

    pub fn padding_received(&mut self, seq_num: i64) -> Vec<EncodedFrame> {
        let keep_from = seq_num - MAX_PADDING_AGE;
        self.stashed_padding = self.stashed_padding.split_off(&keep_from);
        self.stashed_padding.insert(seq_num);
        self.update_last_picture_id_with_padding(seq_num);
        self.retry_stashed_frames()
    }

    pub fn clear_to(&mut self, seq_num: i64) {
        self.stashed_frames.retain(|frame| frame.first_seq_num > seq_num);
    }

    pub fn num_stashed_frames(&self) -> usize {
        self.stashed_frames.len()
    }

    fn retry_stashed_frames(&mut self) -> Vec<EncodedFrame> {
        let mut stash = std::mem::replace(&mut self.stashed_frames, FrameStash::new(0));
        let released = stash.retry(|frame| self.manage_frame_internal(frame));
        self.stashed_frames = stash;
        released
    }

    /// The group of pictures `seq_num` belongs to.
    fn gop_for(&mut self, seq_num: i64) -> Option<(&i64, &mut GopInfo)> {
        self.last_seq_num_gop
            .range_mut((Bound::Unbounded, Bound::Included(seq_num)))
            .next_back()
    }

    fn manage_frame_internal(&mut self, frame: &mut EncodedFrame) -> FrameDecision {
        if frame.is_keyframe() {
            // A key frame seen again keeps the progress of its group.
            self.last_seq_num_gop
                .entry(frame.last_seq_num)
                .or_insert(GopInfo {
                    last_picture_id: frame.last_seq_num,
                    last_picture_id_with_padding: frame.last_seq_num,
                });
        }

        if self.last_seq_num_gop.is_empty() {
            return FrameDecision::Stash;
        }

        // Forget old groups of pictures but always keep the newest one.
        let clean_to = frame.last_seq_num - MAX_GOP_AGE;
        while self.last_seq_num_gop.len() > 1 {
            match self.last_seq_num_gop.first_key_value() {
                Some((&first, _)) if first < clean_to => {
                    self.last_seq_num_gop.remove(&first);
                }
                _ => break,
            }
        }

        let first_seq_num = frame.first_seq_num;
        let last_seq_num = frame.last_seq_num;
        let is_delta = !frame.is_keyframe();
        let Some((_, gop)) = self.gop_for(last_seq_num) else {
            log::debug!(
                "Frame {first_seq_num}..{last_seq_num} has no group of pictures, dropping it"
            );
            return FrameDecision::Drop;
        };

        if is_delta && first_seq_num - 1 != gop.last_picture_id_with_padding {
            return FrameDecision::Stash;
        }

        frame.id = last_seq_num;
        frame.spatial_index = 0;
        frame.references = if is_delta {
            vec![gop.last_picture_id]
        } else {
            Vec::new()
        };
        if frame.id > gop.last_picture_id {
            gop.last_picture_id = frame.id;
            gop.last_picture_id_with_padding = frame.id;
        }
        self.update_last_picture_id_with_padding(frame.id);
        FrameDecision::HandOff
    }

    /// Advances the padding watermark of the group `seq_num` belongs to over
    /// stashed padding that continues it.
    fn update_last_picture_id_with_padding(&mut self, seq_num: i64) {
        let Some((_, gop)) = self
            .last_seq_num_gop
            .range_mut((Bound::Unbounded, Bound::Included(seq_num)))
            .next_back()
        else {
            return;
        };
        let mut next_seq_num = gop.last_picture_id_with_padding + 1;
        while self.stashed_padding.remove(&next_seq_num) {
            gop.last_picture_id_with_padding = next_seq_num;
            next_seq_num += 1;
        }
    }
}
