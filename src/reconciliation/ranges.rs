/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Arithmetic over the [ranges](MiniblockRange) of miniblocks present in storage.

use crate::storage::MiniblockRange;

/// The ranges in `[start_inclusive, end_inclusive]` that are not covered by `present`, in ascending order.
/// `present` may be unsorted and its ranges may overlap. An empty window has nothing missing.
pub fn calculate_missing_ranges(present: &[MiniblockRange], start_inclusive: i64, end_inclusive: i64) -> Vec<MiniblockRange> {
    let mut missing = Vec::new();
    if start_inclusive > end_inclusive {
        return missing;
    }

    let mut sorted: Vec<&MiniblockRange> = present.iter().collect();
    sorted.sort_by_key(|range| range.start_inclusive);

    let mut next = start_inclusive;
    for range in sorted {
        if next > end_inclusive {
            break;
        }
        if range.end_inclusive < next {
            continue;
        }
        if range.start_inclusive > next {
            missing.push(gap(next, (range.start_inclusive - 1).min(end_inclusive)));
        }
        next = next.max(range.end_inclusive + 1);
    }
    if next <= end_inclusive {
        missing.push(gap(next, end_inclusive));
    }
    missing
}

fn gap(start_inclusive: i64, end_inclusive: i64) -> MiniblockRange {
    MiniblockRange { start_inclusive, end_inclusive, snapshot_seq_nums: Vec::new() }
}

/// The last miniblock at or before `num` that carries a snapshot. Falls back to `num` if no such snapshot is
/// stored.
pub fn find_closest_snapshot_miniblock(present: &[MiniblockRange], num: i64) -> i64 {
    present
        .iter()
        .flat_map(|range| range.snapshot_seq_nums.iter().copied())
        .filter(|snapshot| *snapshot <= num)
        .max()
        .unwrap_or(num)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(start: i64, end: i64) -> MiniblockRange {
        MiniblockRange { start_inclusive: start, end_inclusive: end, snapshot_seq_nums: Vec::new() }
    }

    fn bounds(ranges: &[MiniblockRange]) -> Vec<(i64, i64)> {
        ranges.iter().map(|r| (r.start_inclusive, r.end_inclusive)).collect()
    }

    #[test]
    fn missing_ranges_between_and_around_present() {
        let present = vec![range(10, 20), range(30, 40)];
        assert_eq!(bounds(&calculate_missing_ranges(&present, 0, 50)), vec![(0, 9), (21, 29), (41, 50)]);
    }

    #[test]
    fn missing_ranges_clipped_to_window() {
        let present = vec![range(10, 20), range(30, 40)];
        assert_eq!(bounds(&calculate_missing_ranges(&present, 15, 35)), vec![(21, 29)]);
        assert_eq!(bounds(&calculate_missing_ranges(&present, 0, 5)), vec![(0, 5)]);
        assert_eq!(bounds(&calculate_missing_ranges(&present, 10, 40)), vec![(21, 29)]);
    }

    #[test]
    fn nothing_missing() {
        let present = vec![range(0, 50)];
        assert!(calculate_missing_ranges(&present, 0, 50).is_empty());
        assert!(calculate_missing_ranges(&present, 20, 30).is_empty());
        assert_eq!(bounds(&calculate_missing_ranges(&[], 3, 4)), vec![(3, 4)]);
    }

    #[test]
    fn missing_ranges_of_unsorted_and_overlapping_present() {
        // 1. Unsorted.
        let present = vec![range(30, 40), range(10, 20)];
        assert_eq!(bounds(&calculate_missing_ranges(&present, 0, 50)), vec![(0, 9), (21, 29), (41, 50)]);

        // 2. Overlapping, including a range nested in another.
        let present = vec![range(15, 25), range(10, 20), range(12, 14), range(24, 30)];
        assert_eq!(bounds(&calculate_missing_ranges(&present, 0, 40)), vec![(0, 9), (31, 40)]);

        // 3. Duplicated.
        let present = vec![range(5, 5), range(5, 5)];
        assert_eq!(bounds(&calculate_missing_ranges(&present, 4, 6)), vec![(4, 4), (6, 6)]);
    }

    #[test]
    fn empty_window_has_nothing_missing() {
        assert!(calculate_missing_ranges(&[range(0, 10)], 20, 10).is_empty());
        assert!(calculate_missing_ranges(&[], 1, 0).is_empty());
    }

    #[test]
    fn closest_snapshot() {
        let present = vec![
            MiniblockRange { start_inclusive: 0, end_inclusive: 20, snapshot_seq_nums: vec![0, 10, 20] },
            MiniblockRange { start_inclusive: 30, end_inclusive: 40, snapshot_seq_nums: vec![35] },
        ];
        assert_eq!(find_closest_snapshot_miniblock(&present, 15), 10);
        assert_eq!(find_closest_snapshot_miniblock(&present, 34), 20);
        assert_eq!(find_closest_snapshot_miniblock(&present, 100), 35);
        assert_eq!(find_closest_snapshot_miniblock(&[range(5, 9)], 7), 7);
    }
}
