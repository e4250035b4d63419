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

use std::sync::Arc;

use clap::Parser;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use videocall_rtp::{
    AssemblerConfig, AssemblerStatistics, Environment, FrameAssembler, RtpPacketReceived,
    SimulatedClock, VideoCodec,
};

// Packetizes a synthetic VP8 stream, shuffles packets inside a reorder
// window, drops a share of them and feeds the rest to a FrameAssembler.
// The emitted frames are consumed right away, like a decoder would.

const FRAME_INTERVAL_MS: i64 = 33;
const RTP_TICKS_PER_FRAME: u32 = 3000;
const PICTURE_ID_MODULUS: u16 = 0x8000;

#[derive(Parser, Debug)]
#[clap(about = "Feeds a lossy, reordered VP8 stream through the RTP frame assembler", version)]
struct Args {
    #[clap(long, default_value_t = 300, help = "Number of video frames to send")]
    frames: u32,

    #[clap(long, default_value_t = 4, help = "RTP packets per video frame")]
    packets_per_frame: u16,

    #[clap(long, default_value_t = 30, help = "Send a key frame every N frames")]
    keyframe_interval: u32,

    #[clap(long, default_value_t = 1.0, help = "Packet loss in percent")]
    loss_percent: f64,

    #[clap(long, default_value_t = 8, help = "Packets shuffled together, 1 disables reordering")]
    reorder_window: usize,

    #[clap(long, default_value_t = 42, help = "Seed for loss and reordering")]
    seed: u64,

    #[clap(long, default_value_t = 65_000, help = "First RTP sequence number")]
    first_seq_num: u16,
}

#[derive(Debug, Serialize)]
struct DemoReport {
    frames_sent: u32,
    packets_sent: usize,
    packets_lost: usize,
    frames_decoded: usize,
    keyframes_decoded: usize,
    keyframe_requests: usize,
    assembler: AssemblerStatistics,
}

fn vp8_frame_packets(
    args: &Args,
    frame_index: u32,
    seq_num: &mut u16,
) -> Vec<RtpPacketReceived> {
    let keyframe = frame_index % args.keyframe_interval.max(1) == 0;
    let picture_id = (frame_index % u32::from(PICTURE_ID_MODULUS)) as u16;
    let timestamp = frame_index.wrapping_mul(RTP_TICKS_PER_FRAME);

    let mut frame = Vec::new();
    if keyframe {
        // Frame tag with the key frame bit cleared, start code, 640x360.
        frame.extend_from_slice(&[0x10, 0x02, 0x00, 0x9d, 0x01, 0x2a]);
        frame.extend_from_slice(&640u16.to_le_bytes());
        frame.extend_from_slice(&360u16.to_le_bytes());
    } else {
        frame.extend_from_slice(&[0x11, 0x02, 0x00]);
    }
    frame.resize(frame.len() + 64 * usize::from(args.packets_per_frame), frame_index as u8);

    let packet_count = usize::from(args.packets_per_frame.max(1));
    let chunk_size = frame.len().div_ceil(packet_count);
    let chunks: Vec<&[u8]> = frame.chunks(chunk_size).collect();
    chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| {
            let start_of_frame = if i == 0 { 0x10 } else { 0x00 };
            // X set, I set, 15 bit picture id.
            let mut payload = vec![
                0x80 | start_of_frame,
                0x80,
                0x80 | (picture_id >> 8) as u8,
                picture_id as u8,
            ];
            payload.extend_from_slice(chunk);
            let packet =
                RtpPacketReceived::new(*seq_num, timestamp, i == chunks.len() - 1, payload)
                    .with_payload_type(96)
                    .with_ssrc(0x1234_5678);
            *seq_num = seq_num.wrapping_add(1);
            packet
        })
        .collect()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();
    let loss_percent = args.loss_percent.clamp(0.0, 100.0);
    let reorder_window = args.reorder_window.max(1);

    let clock = Arc::new(SimulatedClock::new(0));
    let env = Environment::new(clock.clone());
    let mut assembler = FrameAssembler::new(&env, AssemblerConfig::for_codec(VideoCodec::Vp8))?;
    let mut rng = StdRng::seed_from_u64(args.seed);

    log::info!(
        "Sending {} frames, {loss_percent:.1}% loss, reorder window {reorder_window}",
        args.frames
    );

    let mut seq_num = args.first_seq_num;
    let mut pending = Vec::new();
    for frame_index in 0..args.frames {
        pending.extend(vp8_frame_packets(&args, frame_index, &mut seq_num));
    }
    let packets_sent = pending.len();

    let mut report = DemoReport {
        frames_sent: args.frames,
        packets_sent,
        packets_lost: 0,
        frames_decoded: 0,
        keyframes_decoded: 0,
        keyframe_requests: 0,
        assembler: AssemblerStatistics::default(),
    };

    for window in pending.chunks_mut(reorder_window) {
        window.shuffle(&mut rng);
        for packet in window.iter() {
            if rng.gen_bool(loss_percent / 100.0) {
                log::debug!("Dropping packet {}", packet.sequence_number());
                report.packets_lost += 1;
                continue;
            }
            clock.advance_ms(FRAME_INTERVAL_MS / i64::from(args.packets_per_frame.max(1)));

            let frames = assembler.insert_packet(packet);
            if assembler.take_keyframe_request() {
                log::info!("Assembler asked for a key frame");
                report.keyframe_requests += 1;
            }
            for frame in &frames {
                log::debug!(
                    "Frame {} ({} bytes, {:?}) references {:?}",
                    frame.id,
                    frame.size(),
                    frame.frame_type(),
                    frame.references
                );
                report.frames_decoded += 1;
                if frame.is_keyframe() {
                    report.keyframes_decoded += 1;
                }
            }
            if let Some(last) = frames.iter().map(|frame| frame.id).max() {
                assembler.clear_to(last);
            }
        }
    }

    report.assembler = assembler.statistics();
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
