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

use crate::frame::EncodedFrame;

/// Withholds frames until every frame they reference has been released.
///
/// Release is transitive: handing out one frame may unblock withheld frames
/// that depend on it, in the same call. Only a bounded window of released
/// ids is remembered; a reference that fell out of the window without ever
/// being released can no longer be satisfied and its frame is dropped.
#[derive(Debug)]
pub struct DependencyGate {
    withheld: BTreeMap<i64, EncodedFrame>,
    released: BTreeSet<i64>,
    /// Released ids at or below this value have been forgotten.
    forgotten_up_to: Option<i64>,
    max_withheld_frames: usize,
    max_released_history: usize,
}

impl DependencyGate {
    pub fn new(max_withheld_frames: usize, max_released_history: usize) -> Self {
        Self {
            withheld: BTreeMap::new(),
            released: BTreeSet::new(),
            forgotten_up_to: None,
            max_withheld_frames,
            max_released_history,
        }
    }

    pub fn manage_frame(&mut self, frame: EncodedFrame) -> Vec<EncodedFrame> {
        if self.released.contains(&frame.id) || self.is_forgotten(frame.id) {
            log::debug!("Frame {} was already released or is too old, dropping it", frame.id);
            return Vec::new();
        }
        if frame.references.iter().any(|&reference| reference >= frame.id) {
            log::warn!(
                "Frame {} references {:?}, only older frames can be referenced",
                frame.id,
                frame.references
            );
            return Vec::new();
        }
        if self.has_unsatisfiable_reference(&frame) {
            log::debug!("Frame {} depends on a frame that was never released", frame.id);
            return Vec::new();
        }

        if !self.references_released(&frame) {
            if self.withheld.len() >= self.max_withheld_frames {
                if let Some((evicted, _)) = self.withheld.pop_first() {
                    log::debug!("Dependency gate full, dropping withheld frame {evicted}");
                }
            }
            log::trace!("Withholding frame {} until {:?} are released", frame.id, frame.references);
            self.withheld.insert(frame.id, frame);
            return Vec::new();
        }

        let mut released = Vec::new();
        self.release(frame, &mut released);
        self.release_withheld(&mut released);
        released
    }

    /// Drops withheld frames whose last packet is at or before `seq_num`.
    pub fn clear_to(&mut self, seq_num: i64) {
        let before = self.withheld.len();
        self.withheld.retain(|_, frame| frame.last_seq_num > seq_num);
        let dropped = before - self.withheld.len();
        if dropped > 0 {
            log::debug!("Cleared {dropped} withheld frames up to sequence number {seq_num}");
        }
    }

    pub fn num_withheld_frames(&self) -> usize {
        self.withheld.len()
    }

    fn is_forgotten(&self, id: i64) -> bool {
        self.forgotten_up_to.is_some_and(|forgotten| id <= forgotten)
    }

    fn references_released(&self, frame: &EncodedFrame) -> bool {
        frame
            .references
            .iter()
            .all(|reference| self.released.contains(reference))
    }

    fn has_unsatisfiable_reference(&self, frame: &EncodedFrame) -> bool {
        frame
            .references
            .iter()
            .any(|&reference| self.is_forgotten(reference) && !self.released.contains(&reference))
    }

    fn release(&mut self, frame: EncodedFrame, released: &mut Vec<EncodedFrame>) {
        self.released.insert(frame.id);
        while self.released.len() > self.max_released_history {
            if let Some(oldest) = self.released.pop_first() {
                self.forgotten_up_to = Some(self.forgotten_up_to.map_or(oldest, |f| f.max(oldest)));
            }
        }
        released.push(frame);
    }

    fn release_withheld(&mut self, released: &mut Vec<EncodedFrame>) {
        loop {
            let ready: Vec<i64> = self
                .withheld
                .values()
                .filter(|frame| self.references_released(frame))
                .map(|frame| frame.id)
                .collect();
            if ready.is_empty() {
                break;
            }
            for id in ready {
                if let Some(frame) = self.withheld.remove(&id) {
                    self.release(frame, released);
                }
            }
        }

        let unsatisfiable: Vec<i64> = self
            .withheld
            .values()
            .filter(|frame| self.has_unsatisfiable_reference(frame))
            .map(|frame| frame.id)
            .collect();
        for id in unsatisfiable {
            self.withheld.remove(&id);
            log::debug!("Dropping withheld frame {id}, a reference can no longer be released");
        }
    }
}
