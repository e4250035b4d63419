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
use crate::sequence_number_unwrapper::{PictureIdUnwrapper, Tl0PicIdxUnwrapper};
use crate::video_header::CodecHeader;

const MAX_LAYER_INFO: i64 = 50;
const MAX_NOT_YET_RECEIVED_FRAMES: i64 = 100;
pub const MAX_TEMPORAL_LAYERS: usize = 5;

/// Last picture id seen on each temporal layer.
type LayerInfo = [Option<i64>; MAX_TEMPORAL_LAYERS];

#[derive(Debug)]
struct PendingFrame {
    frame: EncodedFrame,
    tl0_pic_idx: i64,
    temporal_idx: usize,
    layer_sync: bool,
}

/// Reference finding for VP8 with temporal layers.
///
/// Base layer frames reference the previous base layer frame. Upper layer
/// frames reference the newest frame of every layer up to their own, for the
/// same TL0PICIDX. Picture ids that have not been completed yet block the
/// frames above them.
#[derive(Debug)]
pub struct Vp8RefFinder {
    last_picture_id: Option<i64>,
    not_yet_received_frames: BTreeSet<i64>,
    layer_info: BTreeMap<i64, LayerInfo>,
    stashed_frames: FrameStash<PendingFrame>,
    picture_id_unwrapper: PictureIdUnwrapper,
    tl0_unwrapper: Tl0PicIdxUnwrapper,
}

impl Vp8RefFinder {
    pub fn new(max_stashed_frames: usize) -> Self {
        Self {
            last_picture_id: None,
            not_yet_received_frames: BTreeSet::new(),
            layer_info: BTreeMap::new(),
            stashed_frames: FrameStash::new(max_stashed_frames),
            picture_id_unwrapper: PictureIdUnwrapper::new(),
            tl0_unwrapper: Tl0PicIdxUnwrapper::new(),
        }
    }

    pub fn manage_frame(&mut self, frame: EncodedFrame) -> Vec<EncodedFrame> {
        let CodecHeader::Vp8(vp8) = &frame.video_header.codec_header else {
            return Vec::new();
        };
        let (Some(picture_id), Some(temporal_idx), Some(tl0_pic_idx)) =
            (vp8.picture_id, vp8.temporal_idx, vp8.tl0_pic_idx)
        else {
            return Vec::new();
        };
        let temporal_idx = usize::from(temporal_idx);
        if temporal_idx >= MAX_TEMPORAL_LAYERS {
            log::warn!("VP8 temporal index {temporal_idx} out of range, dropping frame");
            return Vec::new();
        }
        let layer_sync = vp8.layer_sync;

        let mut pending = PendingFrame {
            tl0_pic_idx: self.tl0_unwrapper.unwrap(tl0_pic_idx),
            temporal_idx,
            layer_sync,
            frame,
        };
        pending.frame.id = self.picture_id_unwrapper.unwrap(picture_id & 0x7fff);
        pending.frame.spatial_index = 0;
        pending.frame.temporal_index = temporal_idx as u8;

        match self.manage_frame_internal(&mut pending) {
            FrameDecision::Stash => {
                self.stashed_frames.push(pending);
                Vec::new()
            }
            FrameDecision::HandOff => {
                let mut frames = vec![pending.frame];
                frames.extend(self.retry_stashed_frames());
                frames
            }
            FrameDecision::Drop => Vec::new(),
        }
    }

    pub fn clear_to(&mut self, seq_num: i64) {
        self.stashed_frames
            .retain(|pending| pending.frame.first_seq_num > seq_num);
    }

    pub fn num_stashed_frames(&self) -> usize {
        self.stashed_frames.len()
    }

    fn retry_stashed_frames(&mut self) -> Vec<EncodedFrame> {
        let mut stash = std::mem::replace(&mut self.stashed_frames, FrameStash::new(0));
        let released = stash.retry(|pending| self.manage_frame_internal(pending));
        self.stashed_frames = stash;
        released.into_iter().map(|pending| pending.frame).collect()
    }

    fn manage_frame_internal(&mut self, pending: &mut PendingFrame) -> FrameDecision {
        let picture_id = pending.frame.id;
        let tl0 = pending.tl0_pic_idx;
        let temporal_idx = pending.temporal_idx;

        let last_picture_id = *self.last_picture_id.get_or_insert(picture_id);

        // Forget about missing frames that are too old.
        let old_picture_id = picture_id - MAX_NOT_YET_RECEIVED_FRAMES;
        self.not_yet_received_frames = self.not_yet_received_frames.split_off(&old_picture_id);
        let mut last_picture_id = last_picture_id.max(old_picture_id);

        while last_picture_id < picture_id {
            last_picture_id += 1;
            self.not_yet_received_frames.insert(last_picture_id);
        }
        self.last_picture_id = Some(last_picture_id);

        self.layer_info = self.layer_info.split_off(&(tl0 - MAX_LAYER_INFO));

        if pending.frame.is_keyframe() {
            if temporal_idx != 0 {
                return FrameDecision::Drop;
            }
            pending.frame.references.clear();
            self.layer_info.insert(tl0, [None; MAX_TEMPORAL_LAYERS]);
            self.update_layer_info(picture_id, tl0, temporal_idx);
            return FrameDecision::HandOff;
        }

        let base_tl0 = if temporal_idx == 0 { tl0 - 1 } else { tl0 };
        let Some(&layer_info) = self.layer_info.get(&base_tl0) else {
            return FrameDecision::Stash;
        };

        if temporal_idx == 0 {
            // A base layer delta frame continues the previous base layer.
            let layer_info = *self.layer_info.entry(tl0).or_insert(layer_info);
            let Some(last_pid_on_layer) = layer_info[0] else {
                return FrameDecision::Stash;
            };
            if last_pid_on_layer >= picture_id {
                return FrameDecision::Drop;
            }
            pending.frame.references = vec![last_pid_on_layer];
            self.update_layer_info(picture_id, tl0, temporal_idx);
            return FrameDecision::HandOff;
        }

        if pending.layer_sync {
            if layer_info[temporal_idx].is_some_and(|last| last >= picture_id) {
                return FrameDecision::Drop;
            }
            let Some(base) = layer_info[0] else {
                return FrameDecision::Stash;
            };
            pending.frame.references = vec![base];
            self.update_layer_info(picture_id, tl0, temporal_idx);
            return FrameDecision::HandOff;
        }

        let mut references = Vec::with_capacity(temporal_idx + 1);
        for layer in 0..=temporal_idx {
            let Some(last_on_layer) = layer_info[layer] else {
                return FrameDecision::Stash;
            };
            if last_on_layer > picture_id {
                // A layer sync frame newer than this one already moved on.
                return FrameDecision::Drop;
            }
            let missing_in_between = self
                .not_yet_received_frames
                .range((Bound::Excluded(last_on_layer), Bound::Unbounded))
                .next()
                .is_some_and(|&missing| missing < picture_id);
            if missing_in_between {
                return FrameDecision::Stash;
            }
            if last_on_layer == picture_id {
                log::warn!("VP8 frame with picture id {picture_id} already received, dropping it");
                return FrameDecision::Drop;
            }
            references.push(last_on_layer);
        }
        pending.frame.references = references;
        self.update_layer_info(picture_id, tl0, temporal_idx);
        FrameDecision::HandOff
    }

    /// Records `picture_id` on `temporal_idx` for `tl0` and every newer base
    /// layer frame that has not seen a newer picture on that layer.
    fn update_layer_info(&mut self, picture_id: i64, tl0: i64, temporal_idx: usize) {
        for (_, info) in self.layer_info.range_mut(tl0..) {
            if info[temporal_idx].is_some_and(|last| last > picture_id) {
                break;
            }
            info[temporal_idx] = Some(picture_id);
        }
        self.not_yet_received_frames.remove(&picture_id);
    }
}
