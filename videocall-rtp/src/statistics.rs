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

/// Counters describing what the frame assembler did with its input.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssemblerStatistics {
    /// RTP packets handed to `insert_packet`
    pub packets_received: u64,
    /// Packets without media payload
    pub padding_packets: u64,
    /// Packets whose payload the depacketizer rejected
    pub malformed_packets: u64,
    /// Packets with an unparsable descriptor extension
    pub malformed_extensions: u64,
    /// Packets rejected for carrying an outdated template structure
    pub stale_structures: u64,
    /// Completed packet runs that could not be turned into a bitstream
    pub assembly_failures: u64,
    /// Times the packet buffer had to drop everything
    pub buffer_clears: u64,
    /// Frames built from completed packet runs
    pub frames_assembled: u64,
    /// Frames handed to the caller
    pub frames_emitted: u64,
    /// Frames discarded because they are older than the clear watermark
    pub frames_dropped_after_clear: u64,
}

/// Accumulates [`AssemblerStatistics`].
#[derive(Debug, Default)]
pub struct StatisticsCalculator {
    stats: AssemblerStatistics,
}

impl StatisticsCalculator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn packet_received(&mut self) {
        self.stats.packets_received += 1;
    }

    pub fn padding_received(&mut self) {
        self.stats.padding_packets += 1;
    }

    pub fn malformed_packet(&mut self) {
        self.stats.malformed_packets += 1;
    }

    pub fn malformed_extension(&mut self) {
        self.stats.malformed_extensions += 1;
    }

    pub fn stale_structure(&mut self) {
        self.stats.stale_structures += 1;
    }

    pub fn assembly_failure(&mut self) {
        self.stats.assembly_failures += 1;
    }

    pub fn buffer_cleared(&mut self) {
        self.stats.buffer_clears += 1;
    }

    pub fn frames_assembled(&mut self, count: usize) {
        self.stats.frames_assembled += count as u64;
    }

    pub fn frames_emitted(&mut self, count: usize) {
        self.stats.frames_emitted += count as u64;
    }

    pub fn frames_dropped_after_clear(&mut self, count: usize) {
        self.stats.frames_dropped_after_clear += count as u64;
    }

    /// Snapshot of the current counters.
    pub fn statistics(&self) -> AssemblerStatistics {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let mut calc = StatisticsCalculator::new();
        calc.packet_received();
        calc.packet_received();
        calc.padding_received();
        calc.frames_assembled(3);
        calc.frames_emitted(2);

        let stats = calc.statistics();
        assert_eq!(stats.packets_received, 2);
        assert_eq!(stats.padding_packets, 1);
        assert_eq!(stats.frames_assembled, 3);
        assert_eq!(stats.frames_emitted, 2);
    }

    #[test]
    fn test_statistics_serialize_to_json() {
        let mut calc = StatisticsCalculator::new();
        calc.buffer_cleared();
        let json = serde_json::to_string(&calc.statistics()).unwrap();
        assert!(json.contains("\"buffer_clears\":1"));
        let back: AssemblerStatistics = serde_json::from_str(&json).unwrap();
        assert_eq!(back.buffer_clears, 1);
    }
}
