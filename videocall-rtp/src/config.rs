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

use serde::{Deserialize, Serialize};

use crate::error::{Result, RtpError};
use crate::video_header::VideoCodec;

/// Sizing of the generic packet ring buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacketBufferConfig {
    /// Initial number of slots, a power of two
    pub start_size: usize,
    /// Upper bound for growth, a power of two
    pub max_size: usize,
}

impl Default for PacketBufferConfig {
    fn default() -> Self {
        Self {
            start_size: 512,
            max_size: 2048,
        }
    }
}

/// Key frame rules of the H264/H265 continuity tracker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct H26xConfig {
    /// Accept an IDR without parameter sets as the start of a stream and as a key frame
    pub idr_only_keyframes_allowed: bool,
}

/// Configuration for [`crate::FrameAssembler`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssemblerConfig {
    /// Codec of the stream, selects the depacketizer
    pub codec: VideoCodec,
    /// Packet ring buffer sizing
    pub packet_buffer: PacketBufferConfig,
    /// H264/H265 specific behaviour
    pub h26x: H26xConfig,
    /// Frames a reference finder may hold back while waiting for references
    pub max_stashed_frames: usize,
    /// Entries kept in the frame id to sequence number table
    pub max_frame_id_mappings: usize,
    /// Released frame ids remembered for dependency checks
    pub max_released_history: usize,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            codec: VideoCodec::Generic,
            packet_buffer: PacketBufferConfig::default(),
            h26x: H26xConfig::default(),
            max_stashed_frames: 100,
            max_frame_id_mappings: 1000,
            max_released_history: 8192,
        }
    }
}

impl AssemblerConfig {
    pub fn for_codec(codec: VideoCodec) -> Self {
        Self {
            codec,
            ..Default::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: AssemblerConfig = serde_json::from_str(json)
            .map_err(|e| RtpError::InvalidConfig(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let PacketBufferConfig {
            start_size,
            max_size,
        } = self.packet_buffer;
        if !start_size.is_power_of_two() || !max_size.is_power_of_two() {
            return Err(RtpError::InvalidConfig(format!(
                "packet buffer sizes must be powers of two, got {start_size} and {max_size}"
            )));
        }
        if start_size > max_size {
            return Err(RtpError::InvalidConfig(format!(
                "packet buffer start size {start_size} exceeds max size {max_size}"
            )));
        }
        if self.max_stashed_frames == 0 {
            return Err(RtpError::InvalidConfig(
                "max_stashed_frames must be positive".to_string(),
            ));
        }
        if self.max_frame_id_mappings == 0 || self.max_released_history == 0 {
            return Err(RtpError::InvalidConfig(
                "history sizes must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
