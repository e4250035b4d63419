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

use thiserror::Error;

/// Result type for RTP frame assembly operations
pub type Result<T> = std::result::Result<T, RtpError>;

/// Errors raised while parsing and assembling RTP video.
///
/// Only configuration and packet parsing errors reach the caller. Everything that
/// goes wrong with a single packet inside [`crate::FrameAssembler`] is logged,
/// counted and dropped.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RtpError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Malformed RTP packet: {0}")]
    MalformedPacket(String),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Malformed header extension: {0}")]
    MalformedExtension(String),

    #[error("Dependency descriptor received without a template structure")]
    MissingStructure,

    #[error("Stale template structure: structure frame {structure_frame_id} is newer than frame {frame_id}")]
    StaleStructure { structure_frame_id: i64, frame_id: i64 },

    #[error("Frame assembly failed: {0}")]
    AssemblyFailure(String),

    #[error("Frame declares {0} references, more than supported")]
    TooManyReferences(usize),
}

impl RtpError {
    pub(crate) fn truncated(what: &str) -> Self {
        RtpError::MalformedPayload(format!("{what} truncated"))
    }
}
