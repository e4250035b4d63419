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

//! Wraparound resolution for fixed-width RTP counters.
//!
//! RTP sequence numbers, timestamps, picture ids and frame numbers all wrap.
//! [`Unwrapper`] maps such a stream onto `i64` by always choosing the
//! representative nearest to the previously unwrapped value.

/// Unwraps a counter of modulus `MODULUS` into a monotonically comparable `i64`.
///
/// A forward distance of exactly half the modulus is treated as forward motion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Unwrapper<const MODULUS: i64> {
    last_value: Option<i64>,
}

/// 16-bit RTP sequence numbers and descriptor frame numbers.
pub type SequenceNumberUnwrapper = Unwrapper<65_536>;
/// 15-bit VP8/VP9/generic picture ids.
pub type PictureIdUnwrapper = Unwrapper<32_768>;
/// 8-bit VP8/VP9 TL0PICIDX.
pub type Tl0PicIdxUnwrapper = Unwrapper<256>;

impl<const MODULUS: i64> Unwrapper<MODULUS> {
    pub fn new() -> Self {
        Self { last_value: None }
    }

    /// Unwraps `value` and remembers the result as the new reference point.
    pub fn unwrap(&mut self, value: impl Into<i64>) -> i64 {
        let unwrapped = self.unwrap_without_update(value);
        self.last_value = Some(unwrapped);
        unwrapped
    }

    fn unwrap_without_update(&self, value: impl Into<i64>) -> i64 {
        let value = value.into().rem_euclid(MODULUS);
        let Some(last) = self.last_value else {
            return value;
        };
        let mut delta = (value - last.rem_euclid(MODULUS)).rem_euclid(MODULUS);
        if delta > MODULUS / 2 {
            delta -= MODULUS;
        }
        last + delta
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_value_is_returned_as_is() {
        let mut unwrapper = SequenceNumberUnwrapper::new();
        assert_eq!(unwrapper.unwrap(1234u16), 1234);
    }

    #[test]
    fn test_forward_wraparound() {
        let mut unwrapper = SequenceNumberUnwrapper::new();
        let unwrapped: Vec<i64> = [65534u16, 65535, 0, 1]
            .into_iter()
            .map(|seq| unwrapper.unwrap(seq))
            .collect();
        assert_eq!(unwrapped, vec![65534, 65535, 65536, 65537]);
    }

    #[test]
    fn test_backward_wraparound() {
        let mut unwrapper = SequenceNumberUnwrapper::new();
        assert_eq!(unwrapper.unwrap(1u16), 1);
        assert_eq!(unwrapper.unwrap(65535u16), -1);
        assert_eq!(unwrapper.unwrap(2u16), 2);
    }

    #[test]
    fn test_reordering_inside_half_range() {
        let mut unwrapper = SequenceNumberUnwrapper::new();
        assert_eq!(unwrapper.unwrap(65000u16), 65000);
        assert_eq!(unwrapper.unwrap(100u16), 65636);
        assert_eq!(unwrapper.unwrap(64000u16), 64000);
        assert_eq!(unwrapper.unwrap(200u16), 65736);
    }

    #[test]
    fn test_half_range_tie_is_forward() {
        let mut unwrapper = SequenceNumberUnwrapper::new();
        unwrapper.unwrap(0u16);
        assert_eq!(unwrapper.unwrap(32768u16), 32768);
        assert_eq!(unwrapper.unwrap(0u16), 65536);
    }

    #[test]
    fn test_unwrap_without_update_keeps_state() {
        let mut unwrapper = SequenceNumberUnwrapper::new();
        unwrapper.unwrap(65535u16);
        assert_eq!(unwrapper.unwrap_without_update(3u16), 65539);
        assert_eq!(unwrapper.unwrap(65534u16), 65534);
    }

    #[test]
    fn test_picture_id_wraparound() {
        let mut unwrapper = PictureIdUnwrapper::new();
        assert_eq!(unwrapper.unwrap(0x7fffu16), 0x7fff);
        assert_eq!(unwrapper.unwrap(0u16), 0x8000);
    }
}
