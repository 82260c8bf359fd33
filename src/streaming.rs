// This file is part of Argus NVR, a security camera network video recorder.
// Copyright (C) 2024 The Argus NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Streaming search: the incremental analogue of [`crate::search`].
//!
//! Consumers arrive with a monotonically advancing high-water mark and the
//! detection ranges for the newly processed window. Pending ranges
//! accumulate until a clip can no longer be extended — its real stop is
//! more than `start_offset + stop_offset` behind the mark — at which point
//! it is emitted and its source ranges retired.

use base::time::{Duration, Time};
use db::objects::ObjectRange;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::error;

use crate::search::{make_results_from_ranges, MatchingClip};

/// Detection ranges per object: `uid -> [((first_frame, first_time),
/// (last_frame, last_time))]`.
pub type RangeDict = BTreeMap<i64, Vec<((i64, Time), (i64, Time))>>;

/// Counts emissions dropped because merging pulled a later-arriving event
/// behind the already-emitted watermark. Should stay at zero; a nonzero
/// value is a diagnosable bug, not a crash.
static NONMONOTONIC_DROPS: AtomicU64 = AtomicU64::new(0);

pub fn nonmonotonic_drop_count() -> u64 {
    NONMONOTONIC_DROPS.load(Ordering::Relaxed)
}

/// Groups raw `(uid, frame, time)` trigger points into per-object ranges.
/// With combining, consecutive frame numbers collapse into one range;
/// without, every point stands alone. Input must be sorted when combining.
pub fn parse_search_results(results: &[(i64, i64, Time)], should_combine: bool) -> RangeDict {
    let mut dict = RangeDict::new();
    if !should_combine {
        for &(uid, frame, time) in results {
            dict.entry(uid)
                .or_default()
                .push(((frame, time), (frame, time)));
        }
        return dict;
    }

    let mut per_object: BTreeMap<i64, Vec<(i64, Time)>> = BTreeMap::new();
    for &(uid, frame, time) in results {
        per_object.entry(uid).or_default().push((frame, time));
    }
    for (uid, points) in per_object {
        let ranges = dict.entry(uid).or_default();
        let mut start = 0;
        for i in 1..=points.len() {
            let is_break = i == points.len() || points[i].0 != points[i - 1].0 + 1;
            if is_break {
                let (f1, t1) = points[start];
                let (f2, t2) = points[i - 1];
                ranges.push(((f1, t1), (f2, t2)));
                start = i;
            }
        }
    }
    dict
}

/// Appends `range_dict` onto the pending list, keeping it sorted. With
/// combining, adjacent same-object entries whose frames differ by exactly
/// one are merged (an object exists only once at any instant, so sorting
/// by uid and start time makes this a single backwards pass).
pub fn extend_pending_ranges(
    pending: &mut Vec<ObjectRange>,
    range_dict: &RangeDict,
    should_combine_ranges: bool,
) {
    for (&uid, ranges) in range_dict {
        for &((first_frame, first_time), (last_frame, last_time)) in ranges {
            pending.push(ObjectRange {
                uid,
                first: (first_time, first_frame),
                last: (last_time, last_frame),
                camera: String::new(),
            });
        }
    }
    pending.sort_by(|a, b| (a.uid, a.first, a.last).cmp(&(b.uid, b.first, b.last)));

    if !should_combine_ranges {
        return;
    }

    // Work backwards so deletion doesn't disturb the walk.
    for i in (1..pending.len()).rev() {
        let prev = &pending[i - 1];
        let cur = &pending[i];
        if prev.uid == cur.uid && cur.first.1 == prev.last.1 + 1 {
            let last = cur.last;
            pending[i - 1].last = last;
            pending.remove(i);
        }
    }
}

/// Pulls out clips that are done: they can no longer be extended by data
/// at or after `ms`, so they're ready to send and their entries leave
/// `pending`. `ms == None` drains everything.
///
/// With combining, each emitted clip is clipped against the previous
/// emission so successive clips never overlap; the returned watermark
/// feeds the next call.
pub fn pull_out_done_clips(
    mut cur_results: Vec<MatchingClip>,
    pending: &mut Vec<ObjectRange>,
    ms: Option<Time>,
    start_offset: Duration,
    stop_offset: Duration,
    should_combine_clips: bool,
    mut prev_stop_time: Time,
) -> (Time, Vec<MatchingClip>) {
    // Anything whose real stop precedes this can't change anymore. When
    // combining, a clip may still be extended by an event up to
    // `start_offset + stop_offset` after its real stop; without combining
    // we're finished as soon as the video exists.
    let finished_ms = ms.map(|m| {
        if should_combine_clips {
            Time(m.0 - start_offset.0 - stop_offset.0 - 1)
        } else {
            m
        }
    });

    // Earlier clips first; also what keeps the emission watermark correct.
    cur_results.sort_by_key(|c| (c.start_time, c.stop_time));

    let mut done = Vec::new();
    let mut ranges_to_kill: Vec<usize> = Vec::new();
    for mut clip in cur_results {
        if let Some(finished) = finished_ms {
            if clip.real_stop > finished {
                continue;
            }
        }
        ranges_to_kill.extend(clip.source_items.iter().copied());

        if should_combine_clips {
            // Never re-emit time that already went out.
            clip.start_time = clip.start_time.max(Time(prev_stop_time.0 + 1));
            clip.play_start = clip.play_start.max(clip.start_time);

            if clip.stop_time < clip.start_time || clip.stop_time < prev_stop_time {
                // Aggressive merging can pull a late-arriving event behind
                // the watermark. Drop it (its ranges are consumed) and
                // count, rather than emit out of order.
                NONMONOTONIC_DROPS.fetch_add(1, Ordering::Relaxed);
                error!(
                    stop = clip.stop_time.0,
                    start = clip.start_time.0,
                    watermark = prev_stop_time.0,
                    "dropping non-monotonic streaming emission"
                );
                continue;
            }
            prev_stop_time = clip.stop_time;
        }
        done.push(clip);
    }

    // Retire consumed entries, highest index first.
    ranges_to_kill.sort_unstable_by(|a, b| b.cmp(a));
    debug_assert!(
        ranges_to_kill.windows(2).all(|w| w[0] != w[1]),
        "no duplication in ranges_to_kill"
    );
    for i in ranges_to_kill {
        pending.remove(i);
    }

    (prev_stop_time, done)
}

/// Holds streaming state for one camera+rule: the pending ranges and the
/// emission watermark.
pub struct StreamingAssembler {
    play_offset: Duration,
    preserve_play_offset: bool,
    start_offset: Duration,
    stop_offset: Duration,
    should_combine_clips: bool,
    pending: Vec<ObjectRange>,
    prev_stop_time: Time,
}

impl StreamingAssembler {
    pub fn new(
        play_offset: Duration,
        preserve_play_offset: bool,
        start_offset: Duration,
        stop_offset: Duration,
        should_combine_clips: bool,
    ) -> Self {
        StreamingAssembler {
            play_offset,
            preserve_play_offset,
            start_offset,
            stop_offset,
            should_combine_clips,
            pending: Vec::new(),
            prev_stop_time: Time(0),
        }
    }

    /// Feeds one batch; returns the clips that became final.
    pub fn add_ranges(&mut self, ms: Option<Time>, range_dict: &RangeDict) -> Vec<MatchingClip> {
        extend_pending_ranges(&mut self.pending, range_dict, self.should_combine_clips);

        // Real-time paths never use the interactive merge threshold.
        let disabled = [(Time(0), 0)];
        let cur = make_results_from_ranges(
            &self.pending,
            self.play_offset,
            self.start_offset,
            self.stop_offset,
            self.should_combine_clips,
            self.preserve_play_offset,
            &disabled,
        );

        let (watermark, done) = pull_out_done_clips(
            cur,
            &mut self.pending,
            ms,
            self.start_offset,
            self.stop_offset,
            self.should_combine_clips,
            self.prev_stop_time,
        );
        self.prev_stop_time = watermark;
        done
    }

    /// Drains everything pending; nothing more is coming.
    pub fn flush(&mut self) -> Vec<MatchingClip> {
        self.add_ranges(None, &RangeDict::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dict_of(entries: &[(i64, (i64, i64), (i64, i64))]) -> RangeDict {
        let mut d = RangeDict::new();
        for &(uid, (f1, t1), (f2, t2)) in entries {
            d.entry(uid)
                .or_default()
                .push(((f1, Time(t1)), (f2, Time(t2))));
        }
        d
    }

    #[test]
    fn parse_groups_consecutive_frames() {
        let results: Vec<(i64, i64, Time)> = [
            (1, 10, 1_000),
            (1, 11, 1_100),
            (1, 12, 1_200),
            (1, 20, 2_000),
            (2, 5, 1_050),
        ]
        .map(|(u, f, t)| (u, f, Time(t)))
        .to_vec();
        let dict = parse_search_results(&results, true);
        assert_eq!(
            dict[&1],
            vec![
                ((10, Time(1_000)), (12, Time(1_200))),
                ((20, Time(2_000)), (20, Time(2_000))),
            ]
        );
        assert_eq!(dict[&2], vec![((5, Time(1_050)), (5, Time(1_050)))]);

        let flat = parse_search_results(&results, false);
        assert_eq!(flat[&1].len(), 4);
    }

    #[test]
    fn extend_merges_adjacent_frames() {
        let mut pending = Vec::new();
        extend_pending_ranges(&mut pending, &dict_of(&[(1, (10, 1_000), (20, 2_000))]), true);
        // Next batch continues exactly at frame 21.
        extend_pending_ranges(&mut pending, &dict_of(&[(1, (21, 2_100), (30, 3_000))]), true);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].first, (Time(1_000), 10));
        assert_eq!(pending[0].last, (Time(3_000), 30));

        // A frame gap stays separate.
        extend_pending_ranges(&mut pending, &dict_of(&[(1, (40, 4_000), (50, 5_000))]), true);
        assert_eq!(pending.len(), 2);
    }

    #[test]
    fn emission_waits_for_horizon_then_is_monotonic() {
        let mut assembler = StreamingAssembler::new(
            Duration::ZERO,
            false,
            Duration(1_000),
            Duration(1_000),
            true,
        );

        // Event finishes at 3_000; horizon is ms - 2_001, so at ms=5_000
        // it's still extendable.
        let done = assembler.add_ranges(
            Some(Time(5_000)),
            &dict_of(&[(1, (10, 1_000), (20, 3_000))]),
        );
        assert!(done.is_empty());

        // At ms=5_001 + a new later event, the first clip finalizes.
        let done = assembler.add_ranges(
            Some(Time(5_100)),
            &dict_of(&[(2, (100, 9_000), (110, 9_500))]),
        );
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].obj_list, vec![1]);
        let first_stop = done[0].stop_time;

        // Flush drains the rest; emissions never overlap.
        let done = assembler.flush();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].obj_list, vec![2]);
        assert!(done[0].start_time > first_stop);
        assert!(assembler.pending.is_empty());
    }

    #[test]
    fn instantaneous_mode_emits_immediately() {
        let mut assembler = StreamingAssembler::new(
            Duration::ZERO,
            false,
            Duration(3_000),
            Duration(3_000),
            false,
        );
        let done = assembler.add_ranges(
            Some(Time(1_000_000)),
            &dict_of(&[(7, (100, 1_000_000), (100, 1_000_000))]),
        );
        // Without combining, "finished" is simply the high-water mark.
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].start_time, Time(997_000));
        assert_eq!(done[0].stop_time, Time(1_003_000));
        assert_eq!(done[0].play_start, Time(1_000_000));
        assert_eq!(done[0].preview_ms, Time(1_000_000));
        assert_eq!(done[0].obj_list, vec![7]);
    }

    /// A batch search over the same ground truth produces the same clip
    /// intervals as feeding the detections through streaming batches.
    #[test]
    fn batch_and_streaming_agree() {
        use crate::search::make_results_from_ranges;
        const T0: i64 = 1_600_000_000_000;
        let all = [
            (1i64, (10i64, T0 + 1_000), (20i64, T0 + 3_000)),
            (2, (15, T0 + 1_500), (25, T0 + 3_500)),
            (1, (200, T0 + 20_000), (220, T0 + 22_000)),
        ];

        // Batch.
        let items: Vec<ObjectRange> = {
            let mut v: Vec<ObjectRange> = all
                .iter()
                .map(|&(uid, (f1, t1), (f2, t2))| ObjectRange {
                    uid,
                    first: (Time(t1), f1),
                    last: (Time(t2), f2),
                    camera: String::new(),
                })
                .collect();
            v.sort_by(|a, b| (a.uid, a.first).cmp(&(b.uid, b.first)));
            v
        };
        let batch = make_results_from_ranges(
            &items,
            Duration::ZERO,
            Duration(1_000),
            Duration(1_000),
            true,
            false,
            &[(Time(0), 0)],
        );

        // Streaming, in time order, then flush.
        let mut assembler = StreamingAssembler::new(
            Duration::ZERO,
            false,
            Duration(1_000),
            Duration(1_000),
            true,
        );
        let mut streamed = Vec::new();
        streamed.extend(assembler.add_ranges(
            Some(Time(T0 + 4_000)),
            &dict_of(&[
                (1, (10, T0 + 1_000), (20, T0 + 3_000)),
                (2, (15, T0 + 1_500), (25, T0 + 3_500)),
            ]),
        ));
        streamed.extend(assembler.add_ranges(
            Some(Time(T0 + 23_000)),
            &dict_of(&[(1, (200, T0 + 20_000), (220, T0 + 22_000))]),
        ));
        streamed.extend(assembler.flush());

        let intervals = |clips: &[MatchingClip]| {
            let mut v: Vec<(Time, Time)> =
                clips.iter().map(|c| (c.start_time, c.stop_time)).collect();
            v.sort();
            v
        };
        assert_eq!(intervals(&batch), intervals(&streamed));
        assert_eq!(streamed.len(), 2);
    }
}
