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

//! MSB-first bit reading and writing used by the header extension codecs
//! and the H264 slice header probe.

use crate::error::{Result, RtpError};

#[derive(Debug)]
pub struct BitReader<'a> {
    data: &'a [u8],
    bit_offset: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            bit_offset: 0,
        }
    }

    pub fn remaining_bits(&self) -> usize {
        self.data.len() * 8 - self.bit_offset
    }

    /// Reads `count` bits (at most 32), most significant first.
    pub fn read_bits(&mut self, count: u32) -> Result<u32> {
        debug_assert!(count <= 32);
        if count as usize > self.remaining_bits() {
            return Err(RtpError::MalformedExtension(format!(
                "need {count} bits, {} left",
                self.remaining_bits()
            )));
        }
        let mut value: u64 = 0;
        for _ in 0..count {
            let byte = self.data[self.bit_offset / 8];
            let bit = (byte >> (7 - self.bit_offset % 8)) & 1;
            value = (value << 1) | u64::from(bit);
            self.bit_offset += 1;
        }
        Ok(value as u32)
    }

    pub fn read_bit(&mut self) -> Result<bool> {
        Ok(self.read_bits(1)? == 1)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bits(8)? as u8)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(self.read_bits(16)? as u16)
    }

    /// Reads a value in `[0, num_values)` coded with the non-symmetric
    /// unsigned encoding (`ns(n)` in AV1).
    pub fn read_non_symmetric(&mut self, num_values: u32) -> Result<u32> {
        let count_bits = u32::BITS - num_values.leading_zeros();
        let num_min_bits_values = (1u32 << count_bits) - num_values;
        let value = self.read_bits(count_bits.saturating_sub(1))?;
        if value < num_min_bits_values {
            return Ok(value);
        }
        let extra = self.read_bits(1)?;
        Ok((value << 1) + extra - num_min_bits_values)
    }

    /// Unsigned exponential Golomb code, ue(v).
    pub fn read_exp_golomb(&mut self) -> Result<u32> {
        let mut leading_zeros = 0;
        while !self.read_bit()? {
            leading_zeros += 1;
            if leading_zeros > 31 {
                return Err(RtpError::MalformedPayload(
                    "exp-golomb code too long".to_string(),
                ));
            }
        }
        let suffix = self.read_bits(leading_zeros)?;
        Ok(((1u64 << leading_zeros) - 1 + u64::from(suffix)) as u32)
    }
}

#[derive(Debug, Default)]
pub struct BitWriter {
    data: Vec<u8>,
    bit_offset: usize,
}

impl BitWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_bits(&mut self, value: u64, count: u32) {
        for i in (0..count).rev() {
            if self.bit_offset % 8 == 0 {
                self.data.push(0);
            }
            if (value >> i) & 1 == 1 {
                let last = self.data.len() - 1;
                self.data[last] |= 1 << (7 - self.bit_offset % 8);
            }
            self.bit_offset += 1;
        }
    }

    pub fn write_bit(&mut self, value: bool) {
        self.write_bits(u64::from(value), 1);
    }

    pub fn write_non_symmetric(&mut self, value: u32, num_values: u32) {
        let count_bits = u32::BITS - num_values.leading_zeros();
        let num_min_bits_values = (1u32 << count_bits) - num_values;
        if value < num_min_bits_values {
            self.write_bits(u64::from(value), count_bits.saturating_sub(1));
        } else {
            self.write_bits(u64::from(value + num_min_bits_values), count_bits);
        }
    }

    /// Returns the written bytes, zero padded to a whole byte.
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

/// Reads an unsigned LEB128 value, returning it with the number of bytes consumed.
pub fn read_leb128(data: &[u8]) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    for (i, byte) in data.iter().enumerate().take(8) {
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}

pub fn write_leb128(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}
