/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Production of miniblocks.
//!
//! On every registry block the [producer](producer::MiniblockProducer) picks the streams this node leads and
//! that have events waiting, and runs one [job](job::MbJob) per stream. A job gathers proposals from the
//! stream's quorum, combines them into a candidate, and saves the candidate on the quorum. The
//! [candidate tracker](candidate_tracker::CandidateTracker) then registers candidates with the registry in
//! batches, after which they are promoted.
//!
//! While the registry is not confirming candidates, candidates for the same miniblock pile up in storage.
//! [`skip_candidate`] thins out new attempts as that count grows.

use crate::types::data_types::BlockNumber;

pub(crate) mod candidate_tracker;

pub(crate) mod job;

pub mod producer;
pub use producer::MiniblockProducer;

/// Whether to skip producing another candidate for a miniblock that already has `candidate_count` stored
/// candidates, at registry block `block_num`.
///
/// Below 10 candidates nothing is skipped. From then on, production is allowed only on every
/// `2^(candidate_count / 10)`-th block, capped at every 450th.
pub fn skip_candidate(candidate_count: usize, block_num: BlockNumber) -> bool {
    let phase = block_num.int();
    if phase == 0 {
        return false;
    }
    let c = candidate_count / 10;
    if c == 0 {
        return false;
    }
    let slow = (1u64 << c.min(10)).min(450);
    if slow <= 1 {
        return false;
    }
    phase % slow != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_candidate_table() {
        let cases: &[(usize, u64, bool)] = &[
            (0, 1, false),
            (5, 7, false),
            (9, 3, false),
            (10, 0, false),
            (10, 1, true),
            (10, 2, false),
            (10, 3, true),
            (10, 4, false),
            (19, 5, true),
            (20, 2, true),
            (20, 4, false),
            (20, 6, true),
            (20, 8, false),
            (30, 4, true),
            (30, 8, false),
            (30, 16, false),
            (40, 8, true),
            (40, 16, false),
            (50, 16, true),
            (50, 32, false),
            (80, 128, true),
            (80, 256, false),
            (90, 256, true),
            (90, 450, true),
            (90, 900, true),
            (90, 512, false),
            (100, 450, false),
            (100, 451, true),
            (100, 900, false),
            (1000, 450, false),
            (1000, 449, true),
        ];
        for (candidate_count, block_num, skip) in cases {
            assert_eq!(
                skip_candidate(*candidate_count, BlockNumber::new(*block_num)),
                *skip,
                "candidate_count {} block_num {}",
                candidate_count,
                block_num
            );
        }
    }
}
