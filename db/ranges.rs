// This file is part of Argus NVR, a security camera network video recorder.
// Copyright (C) 2024 The Argus NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Arithmetic on sorted lists of inclusive `(start, end)` millisecond
//! ranges, as used for saved times and availability timelines.

/// Where a point falls relative to a sorted list of disjoint ranges.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Placement {
    /// `ranges[i].0 <= x <= ranges[i].1`.
    Inside(usize),

    /// `x` falls strictly in the gap before `ranges[i]`. `Before(0)` means
    /// before all ranges (or an empty list); `Before(len)` means after all.
    Before(usize),
}

/// Merges a **sorted** list of inclusive ranges into the minimal disjoint
/// list with the same union. Adjacent ranges (`end + 1 == next_start`) are
/// merged as well as overlapping ones. Does not modify the input.
pub fn compress_ranges(ranges: &[(i64, i64)]) -> Vec<(i64, i64)> {
    let mut out: Vec<(i64, i64)> = Vec::with_capacity(ranges.len());
    for &(start, end) in ranges {
        match out.last_mut() {
            Some((_, prev_end)) if *prev_end >= start - 1 => *prev_end = (*prev_end).max(end),
            _ => out.push((start, end)),
        }
    }
    out
}

/// Binary-searches a sorted list of disjoint inclusive ranges for `x`.
pub fn find_place_in_range_list(ranges: &[(i64, i64)], x: i64) -> Placement {
    // partition_point gives the count of ranges entirely before x.
    let i = ranges.partition_point(|&(_, end)| end < x);
    match ranges.get(i) {
        Some(&(start, _)) if start <= x => Placement::Inside(i),
        _ => Placement::Before(i),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compress_basic() {
        assert_eq!(
            compress_ranges(&[(1, 4), (2, 6), (9, 20), (21, 23)]),
            vec![(1, 6), (9, 23)]
        );
        assert_eq!(
            compress_ranges(&[(0, 12), (1, 4), (2, 6), (9, 20), (21, 23)]),
            vec![(0, 23)]
        );
        assert_eq!(
            compress_ranges(&[(0, 12), (1, 4), (2, 6), (9, 20), (22, 23)]),
            vec![(0, 20), (22, 23)]
        );
        assert_eq!(
            compress_ranges(&[(0, 0), (1, 1), (2, 2), (4, 4)]),
            vec![(0, 2), (4, 4)]
        );
        assert_eq!(compress_ranges(&[]), Vec::<(i64, i64)>::new());
    }

    #[test]
    fn compress_is_idempotent() {
        let cases: &[&[(i64, i64)]] = &[
            &[(1, 4), (2, 6), (9, 20), (21, 23)],
            &[(0, 0)],
            &[(0, 5), (7, 9), (10, 10)],
        ];
        for c in cases {
            let once = compress_ranges(c);
            assert_eq!(compress_ranges(&once), once);
        }
    }

    #[test]
    fn compress_preserves_union() {
        let input = [(1, 4), (2, 6), (9, 20), (21, 23)];
        let out = compress_ranges(&input);
        let covered = |ranges: &[(i64, i64)], x: i64| ranges.iter().any(|&(s, e)| s <= x && x <= e);
        for x in 0..30 {
            assert_eq!(covered(&input, x), covered(&out, x), "x={x}");
        }
    }

    #[test]
    fn placement() {
        let r = [(1, 2), (4, 5), (7, 8), (10, 11)];
        assert_eq!(find_place_in_range_list(&r, 3), Placement::Before(1));
        assert_eq!(find_place_in_range_list(&r, 4), Placement::Inside(1));
        assert_eq!(find_place_in_range_list(&r, 0), Placement::Before(0));
        assert_eq!(find_place_in_range_list(&r, 12), Placement::Before(4));
        assert_eq!(find_place_in_range_list(&r, 1), Placement::Inside(0));
        assert_eq!(find_place_in_range_list(&r, 11), Placement::Inside(3));
        assert_eq!(find_place_in_range_list(&[], 5), Placement::Before(0));
    }
}
