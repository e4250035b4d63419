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

//! # videocall-rtp
//!
//! Receive-side RTP video frame assembly. Packets go in through
//! [`FrameAssembler::insert_packet`] in whatever order the network delivers
//! them; complete frames whose references have all been delivered come out,
//! each with its id, references and assembled bitstream.
//!
//! ```
//! use videocall_rtp::{
//!     AssemblerConfig, Environment, FrameAssembler, RtpPacketReceived, VideoCodec,
//! };
//!
//! let env = Environment::default();
//! let config = AssemblerConfig::for_codec(VideoCodec::Generic);
//! let mut assembler = FrameAssembler::new(&env, config).unwrap();
//! // Generic payload header: key frame, first packet.
//! let packet = RtpPacketReceived::new(1, 90_000, true, vec![0x03, 0xde, 0xad]);
//! let frames = assembler.insert_packet(&packet);
//! assert_eq!(frames.len(), 1);
//! assert!(frames[0].is_keyframe());
//! ```

mod bit_io;
pub mod config;
pub mod depacketizer;
pub mod dependency_descriptor;
pub mod environment;
pub mod error;
pub mod frame;
pub mod frame_assembler;
pub mod generic_frame_descriptor;
pub mod h26x_packet_buffer;
pub mod packet;
pub mod packet_buffer;
pub mod reference_finder;
pub mod rtp_packet;
pub mod sequence_number_unwrapper;
pub mod statistics;
pub mod video_header;

pub use config::{AssemblerConfig, H26xConfig, PacketBufferConfig};
pub use environment::{Clock, Environment, SimulatedClock, SystemClock};
pub use error::{Result, RtpError};
pub use frame::{EncodedFrame, FrameType};
pub use frame_assembler::FrameAssembler;
pub use rtp_packet::{ExtensionMap, RtpExtension, RtpPacketReceived};
pub use statistics::AssemblerStatistics;
pub use video_header::{VideoCodec, VideoHeader};
