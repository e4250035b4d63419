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

//! Assigns frame ids and references to assembled frames and releases them
//! once everything they reference has been released.
//!
//! The strategy is picked per frame from the metadata it carries. Switching
//! strategy resets the state of the previous one, which only happens when a
//! sender changes how it signals dependencies.

mod dependency_gate;
mod descriptor;
mod frame_id_only;
mod seq_num_only;
mod vp8;
mod vp9;

use std::collections::VecDeque;

pub use dependency_gate::DependencyGate;
pub use descriptor::DescriptorRefFinder;
pub use frame_id_only::FrameIdOnlyRefFinder;
pub use seq_num_only::SeqNumOnlyRefFinder;
pub use vp8::Vp8RefFinder;
pub use vp9::Vp9RefFinder;

use crate::config::AssemblerConfig;
use crate::error::Result;
use crate::frame::EncodedFrame;
use crate::video_header::CodecHeader;

/// What a strategy decided for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDecision {
    /// Wait for more frames or padding.
    Stash,
    /// References are assigned, pass the frame on.
    HandOff,
    Drop,
}

/// Frames a strategy holds back, newest first.
#[derive(Debug)]
pub(crate) struct FrameStash<T> {
    entries: VecDeque<T>,
    max_entries: usize,
}

impl<T> FrameStash<T> {
    pub(crate) fn new(max_entries: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            max_entries,
        }
    }

    /// Stashes `entry`, evicting the oldest one when full.
    pub(crate) fn push(&mut self, entry: T) {
        if self.entries.len() >= self.max_entries {
            self.entries.pop_back();
            log::debug!("Frame stash full, evicting its oldest frame");
        }
        self.entries.push_front(entry);
    }

    /// Runs `decide` over the stash until no entry is handed off anymore and
    /// returns the handed off entries in release order.
    pub(crate) fn retry(&mut self, mut decide: impl FnMut(&mut T) -> FrameDecision) -> Vec<T> {
        let mut released = Vec::new();
        loop {
            let mut handed_off = false;
            let mut index = 0;
            while index < self.entries.len() {
                match decide(&mut self.entries[index]) {
                    FrameDecision::Stash => index += 1,
                    FrameDecision::HandOff => {
                        handed_off = true;
                        if let Some(entry) = self.entries.remove(index) {
                            released.push(entry);
                        }
                    }
                    FrameDecision::Drop => {
                        self.entries.remove(index);
                    }
                }
            }
            if !handed_off {
                return released;
            }
        }
    }

    pub(crate) fn retain(&mut self, keep: impl FnMut(&T) -> bool) {
        self.entries.retain(keep);
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

enum Strategy {
    None,
    Descriptor(DescriptorRefFinder),
    FrameIdOnly(FrameIdOnlyRefFinder),
    SeqNumOnly(SeqNumOnlyRefFinder),
    Vp8(Vp8RefFinder),
    Vp9(Vp9RefFinder),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StrategyKind {
    Descriptor,
    FrameIdOnly,
    SeqNumOnly,
    Vp8,
    Vp9,
}

impl Strategy {
    fn kind(&self) -> Option<StrategyKind> {
        match self {
            Strategy::None => None,
            Strategy::Descriptor(_) => Some(StrategyKind::Descriptor),
            Strategy::FrameIdOnly(_) => Some(StrategyKind::FrameIdOnly),
            Strategy::SeqNumOnly(_) => Some(StrategyKind::SeqNumOnly),
            Strategy::Vp8(_) => Some(StrategyKind::Vp8),
            Strategy::Vp9(_) => Some(StrategyKind::Vp9),
        }
    }
}

/// Chooses how references are derived for `frame`.
fn strategy_for(frame: &EncodedFrame) -> StrategyKind {
    if frame.video_header.generic.is_some() {
        return StrategyKind::Descriptor;
    }
    match &frame.video_header.codec_header {
        CodecHeader::Vp8(vp8) => match (vp8.picture_id, vp8.temporal_idx, vp8.tl0_pic_idx) {
            (None, _, _) => StrategyKind::SeqNumOnly,
            (Some(_), Some(_), Some(_)) => StrategyKind::Vp8,
            (Some(_), _, _) => StrategyKind::FrameIdOnly,
        },
        CodecHeader::Vp9(vp9) => match vp9.picture_id {
            None => StrategyKind::SeqNumOnly,
            Some(_) if vp9.flexible_mode => StrategyKind::Vp9,
            Some(_) => StrategyKind::FrameIdOnly,
        },
        CodecHeader::Generic(_) => StrategyKind::FrameIdOnly,
        _ => StrategyKind::SeqNumOnly,
    }
}

/// Reference finding followed by the dependency gate.
pub struct ReferenceFinder {
    strategy: Strategy,
    gate: DependencyGate,
    max_stashed_frames: usize,
    cleared_to_seq_num: Option<i64>,
}

impl ReferenceFinder {
    pub fn new(config: &AssemblerConfig) -> Self {
        Self {
            strategy: Strategy::None,
            gate: DependencyGate::new(config.max_stashed_frames, config.max_released_history),
            max_stashed_frames: config.max_stashed_frames,
            cleared_to_seq_num: None,
        }
    }

    /// Returns `frame` and any frames it unblocked, in release order.
    ///
    /// Fails only when the frame carries more references than supported; the
    /// frame is dropped in that case.
    pub fn manage_frame(&mut self, frame: EncodedFrame) -> Result<Vec<EncodedFrame>> {
        if self
            .cleared_to_seq_num
            .is_some_and(|cleared| frame.first_seq_num <= cleared)
        {
            log::debug!(
                "Dropping frame starting at {}, cleared to {:?}",
                frame.first_seq_num,
                self.cleared_to_seq_num
            );
            return Ok(Vec::new());
        }

        let kind = strategy_for(&frame);
        if self.strategy.kind() != Some(kind) {
            if self.strategy.kind().is_some() {
                log::debug!("Reference finding switches to {kind:?}");
            }
            self.strategy = self.create_strategy(kind);
        }

        let frames = match &mut self.strategy {
            Strategy::Descriptor(finder) => vec![finder.manage_frame(frame)?],
            Strategy::FrameIdOnly(finder) => vec![finder.manage_frame(frame)],
            Strategy::SeqNumOnly(finder) => finder.manage_frame(frame),
            Strategy::Vp8(finder) => finder.manage_frame(frame),
            Strategy::Vp9(finder) => finder.manage_frame(frame),
            Strategy::None => Vec::new(),
        };
        Ok(self.release(frames))
    }

    /// Padding can close a sequence number gap that frames are waiting on.
    pub fn padding_received(&mut self, seq_num: i64) -> Vec<EncodedFrame> {
        let frames = match &mut self.strategy {
            Strategy::SeqNumOnly(finder) => finder.padding_received(seq_num),
            _ => Vec::new(),
        };
        self.release(frames)
    }

    /// Forgets every frame that starts at or before `seq_num`.
    pub fn clear_to(&mut self, seq_num: i64) {
        self.cleared_to_seq_num = Some(self.cleared_to_seq_num.map_or(seq_num, |c| c.max(seq_num)));
        match &mut self.strategy {
            Strategy::SeqNumOnly(finder) => finder.clear_to(seq_num),
            Strategy::Vp8(finder) => finder.clear_to(seq_num),
            _ => {}
        }
        self.gate.clear_to(seq_num);
    }

    /// Frames held by the strategy stash and the dependency gate.
    pub fn num_pending_frames(&self) -> usize {
        let stashed = match &self.strategy {
            Strategy::SeqNumOnly(finder) => finder.num_stashed_frames(),
            Strategy::Vp8(finder) => finder.num_stashed_frames(),
            _ => 0,
        };
        stashed + self.gate.num_withheld_frames()
    }

    fn create_strategy(&self, kind: StrategyKind) -> Strategy {
        match kind {
            StrategyKind::Descriptor => Strategy::Descriptor(DescriptorRefFinder::default()),
            StrategyKind::FrameIdOnly => Strategy::FrameIdOnly(FrameIdOnlyRefFinder::default()),
            StrategyKind::SeqNumOnly => {
                Strategy::SeqNumOnly(SeqNumOnlyRefFinder::new(self.max_stashed_frames))
            }
            StrategyKind::Vp8 => Strategy::Vp8(Vp8RefFinder::new(self.max_stashed_frames)),
            StrategyKind::Vp9 => Strategy::Vp9(Vp9RefFinder::default()),
        }
    }

    fn release(&mut self, frames: Vec<EncodedFrame>) -> Vec<EncodedFrame> {
        frames
            .into_iter()
            .flat_map(|frame| self.gate.manage_frame(frame))
            .collect()
    }
}
