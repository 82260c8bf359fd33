// This file is part of Argus NVR, a security camera network video recorder.
// Copyright (C) 2024 The Argus NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Batch search: translates a rule query over a camera set and time window
//! into sorted matching clips.
//!
//! Assembly runs in stages per camera:
//!
//! 1. parse per-object trigger ranges into preliminary clips (folding
//!    identical instantaneous triggers, extending a clip when the same
//!    object re-triggers within its padding);
//! 2. annotate each clip's saved state from the clip index (and the flush
//!    response when searching the present);
//! 3. for combining queries, merge clips across objects whose *real*
//!    (unpadded) extents overlap or nearly touch, and split the padding of
//!    neighbors so emitted clips never overlap.

use base::clock::Clocks;
use base::time::{Duration, Time, MS_PER_SEC};
use base::{shutdown, Error, FastHashMap};
use db::clips::{ClipIndex, ProcSizeRange};
use db::objects::{ObjectIndex, ObjectRange};
use tracing::error;

use crate::query::Query;
use crate::video::{Flusher, FlushInfo};

/// Searches include +/- this much around the requested day, so events
/// crossing midnight show up on both days.
pub const SEARCH_SLOP: Duration = Duration(1000 * 60 * 5);

/// For combined clips, the allowable frame gap between objects: object A
/// stopping at frame 10 may combine with object B starting at frame 13.
pub const FRAME_TOLERANCE: i64 = 3;

/// The frame-tolerance check also requires the millisecond times to be
/// close. Frame numbers reset whenever a camera's pipeline restarts, so
/// without this guard constant restarts could merge unrelated events.
const MS_TOLERANCE: Duration = Duration(3000);

/// Window ends within this much of now still trigger a flush.
const FLUSH_RECENT: Duration = Duration(30 * 60 * 1000);

/// Whether a matching clip's interval is known to be durably saved.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SavedState {
    No,
    Yes,

    /// Not determinable yet: video up to the clip's real stop was still
    /// being flushed when asked. Re-check once the flush catches up to the
    /// carried time.
    Pending(Time),
}

impl SavedState {
    /// Combination rule for merged clips: saved (or pending) wins over not.
    fn or(self, other: SavedState) -> SavedState {
        match self {
            SavedState::No => other,
            s => s,
        }
    }
}

/// A clip selected by a search, with padded playback bounds.
#[derive(Clone, Debug)]
pub struct MatchingClip {
    pub camera: Option<String>,
    pub start_time: Time,
    pub stop_time: Time,
    pub play_start: Time,
    pub preview_ms: Time,

    /// Objects contributing to this clip.
    pub obj_list: Vec<i64>,

    /// Per-trigger start times of the events folded into this clip.
    pub start_list: Vec<Time>,

    pub is_saved: SavedState,

    /// For imported cameras whose identity is by file.
    pub filename: Option<String>,
    pub file_start: Option<Time>,

    // Internal assembly state; meaningless outside this module and the
    // streaming engine.
    pub(crate) real_start: Time,
    pub(crate) real_stop: Time,
    pub(crate) start_frame: i64,
    pub(crate) stop_frame: i64,

    /// Indices into the source range list that produced this clip; the
    /// streaming engine retires them on emission.
    pub(crate) source_items: Vec<usize>,
}

impl MatchingClip {
    fn from_range(
        item: &ObjectRange,
        index: usize,
        play_offset: Duration,
        start_offset: Duration,
        stop_offset: Duration,
    ) -> Self {
        let (start, start_frame) = item.first;
        let (stop, stop_frame) = item.last;
        MatchingClip {
            camera: (!item.camera.is_empty()).then(|| item.camera.clone()),
            start_time: start - start_offset,
            stop_time: stop + stop_offset,
            play_start: start - play_offset,
            preview_ms: Time((start.0 + stop.0) / 2),
            obj_list: vec![item.uid],
            start_list: vec![start],
            is_saved: SavedState::No,
            filename: None,
            file_start: None,
            real_start: start,
            real_stop: stop,
            start_frame,
            stop_frame,
            source_items: vec![index],
        }
    }
}

/// Merge-threshold overrides for one query.
#[derive(Clone, Debug, Default)]
pub struct SearchConfig {
    merge_thresholds: Option<Vec<(Time, i64)>>,
}

impl SearchConfig {
    /// Forces clip merging off regardless of the stored threshold history.
    /// Aggressive merging is only wanted interactively; real-time paths
    /// disable it.
    pub fn disable_clip_merging(&mut self) {
        self.merge_thresholds = Some(vec![(Time(0), 0)]);
    }

    /// Sets the thresholds for this query. By default the first value
    /// sticks; pass `override_existing` to replace it.
    pub fn set_merge_thresholds_for_query(
        &mut self,
        value: Vec<(Time, i64)>,
        override_existing: bool,
    ) {
        if self.merge_thresholds.is_some() && !override_existing {
            return;
        }
        self.merge_thresholds = Some(value);
    }

    pub fn merge_thresholds_for_query(&self) -> Option<&[(Time, i64)]> {
        self.merge_thresholds.as_deref()
    }
}

/// The resolved time bounds of one search.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SearchWindow {
    /// Search bound including slop.
    pub start: Time,
    /// Search bound including slop, clamped to now.
    pub end: Time,
    /// Events must end at/after this...
    pub midnight: Time,
    /// ...and start before this to count.
    pub next_midnight: Time,
}

/// Translates any time within a calendar day into that day's search
/// window. Midnight arithmetic is DST-correct: the next midnight may be
/// 23, 24, or 25 hours away.
pub fn search_times_for_day(day: Time, now: Time) -> Result<SearchWindow, Error> {
    let (midnight, next_midnight) = base::time::day_bounds(day)?;
    let midnight = Time(midnight.0.max(0));
    let start = Time((midnight - SEARCH_SLOP).0.max(0));
    let full_day = next_midnight + SEARCH_SLOP - Duration(1);
    Ok(SearchWindow {
        start,
        end: full_day.min(now),
        midnight,
        next_midnight,
    })
}

/// Per-camera flush results gathered before searching the present.
pub type FlushMap = FastHashMap<String, FlushInfo>;

/// Searches the calendar day containing `day` and returns matching clips
/// plus the flush state consulted (empty unless searching today).
#[allow(clippy::too_many_arguments)]
pub fn get_search_results<C: Clocks>(
    query: &dyn Query<C>,
    cameras: &[String],
    day: Time,
    objects: &mut ObjectIndex<C>,
    clips: &mut ClipIndex<C>,
    config: Option<&mut SearchConfig>,
    flusher: &dyn Flusher,
    progress: Option<&mut dyn FnMut(&str)>,
    abort: Option<&shutdown::Receiver>,
) -> Result<(FlushMap, Vec<MatchingClip>), Error> {
    let now = clips.clocks().realtime();
    let window = search_times_for_day(day, now)?;

    // Ensure video for everything we search today will be available for
    // playback.
    let mut flush = FlushMap::default();
    if window.midnight <= now && now < window.next_midnight {
        for camera in cameras {
            flush.insert(camera.clone(), flusher.flush(camera));
        }
    }
    real_get_search_results(
        query, cameras, &window, objects, clips, flush, config, progress, abort,
    )
}

/// Like [`get_search_results`] over an arbitrary window; `slop` widens the
/// search to catch events extending past the edges.
#[allow(clippy::too_many_arguments)]
pub fn get_search_results_between_times<C: Clocks>(
    query: &dyn Query<C>,
    cameras: &[String],
    start: Time,
    end: Time,
    slop: Duration,
    objects: &mut ObjectIndex<C>,
    clips: &mut ClipIndex<C>,
    config: Option<&mut SearchConfig>,
    flusher: &dyn Flusher,
    progress: Option<&mut dyn FnMut(&str)>,
    abort: Option<&shutdown::Receiver>,
) -> Result<(FlushMap, Vec<MatchingClip>), Error> {
    let now = clips.clocks().realtime();
    let mut flush = FlushMap::default();
    if end > now - FLUSH_RECENT {
        for camera in cameras {
            flush.insert(camera.clone(), flusher.flush(camera));
        }
    }
    let window = SearchWindow {
        start: start - slop,
        end: end + slop,
        midnight: start,
        next_midnight: end,
    };
    real_get_search_results(
        query, cameras, &window, objects, clips, flush, config, progress, abort,
    )
}

/// Fetches the query's matching ranges, bounded to the window.
fn matching_ranges<C: Clocks>(
    query: &dyn Query<C>,
    objects: &mut ObjectIndex<C>,
    window: &SearchWindow,
    proc_sizes: &[ProcSizeRange],
    combine: bool,
) -> Result<Vec<ObjectRange>, Error> {
    let mut items = if combine {
        query.search_for_ranges(objects, Some(window.start), Some(window.end), proc_sizes)?
    } else {
        query
            .search(objects, Some(window.start), Some(window.end), proc_sizes)?
            .into_iter()
            .map(|h| ObjectRange {
                uid: h.uid,
                first: (h.time, h.frame),
                last: (h.time, h.frame),
                camera: h.camera,
            })
            .collect()
    };
    // Each item must start or end within the requested day.
    items.retain(|item| item.first.0 < window.next_midnight && item.last.0 >= window.midnight);
    Ok(items)
}

#[allow(clippy::too_many_arguments)]
fn real_get_search_results<C: Clocks>(
    query: &dyn Query<C>,
    cameras: &[String],
    window: &SearchWindow,
    objects: &mut ObjectIndex<C>,
    clips: &mut ClipIndex<C>,
    flush: FlushMap,
    mut config: Option<&mut SearchConfig>,
    mut progress: Option<&mut dyn FnMut(&str)>,
    abort: Option<&shutdown::Receiver>,
) -> Result<(FlushMap, Vec<MatchingClip>), Error> {
    let mut matching = Vec::new();
    let (play_offset, preserve_play_offset) = query.play_time_offset();
    let (start_offset, stop_offset) = query.clip_length_offsets();
    let combine = query.should_combine_clips();

    // Spatially-aware queries depend on per-camera processing sizes and
    // must run camera by camera; everything else searches all cameras in
    // one pass.
    let individual = query.spatially_aware();
    let mut range_items: Vec<ObjectRange> = Vec::new();
    if !individual {
        objects.set_camera_filter(if cameras.len() > 1 {
            None
        } else {
            Some(cameras)
        });
        range_items = matching_ranges(query, objects, window, &[], combine)?;
        objects.set_camera_filter(None);
    }

    // Fetch thresholds once rather than per camera.
    let db_thresholds = clips.get_clip_merge_thresholds(window.start, window.end)?;
    if let Some(config) = config.as_deref_mut() {
        config.set_merge_thresholds_for_query(db_thresholds.clone(), false);
    }
    let thresholds = config
        .as_deref()
        .and_then(|c| c.merge_thresholds_for_query().map(<[_]>::to_vec))
        .unwrap_or(db_thresholds);

    for camera in cameras {
        if let Some(progress) = progress.as_deref_mut() {
            progress(camera);
        }
        if let Some(abort) = abort {
            abort.check()?;
        }

        let mut camera_items: Vec<ObjectRange>;
        if individual {
            objects.set_camera_filter(Some(std::slice::from_ref(camera)));
            let proc_sizes = clips.get_unique_proc_sizes_between_times(
                camera,
                Some(window.start),
                Some(window.end),
            )?;
            camera_items = matching_ranges(query, objects, window, &proc_sizes, combine)?;
            objects.set_camera_filter(None);
            // Trigger-level searches can't always attach the camera.
            for item in &mut camera_items {
                item.camera = camera.clone();
            }
        } else {
            let mut rest = Vec::with_capacity(range_items.len());
            camera_items = Vec::new();
            for item in range_items.drain(..) {
                if &item.camera == camera {
                    camera_items.push(item);
                } else {
                    rest.push(item);
                }
            }
            range_items = rest;
        }

        // Group same-object ranges together, ordered by time.
        camera_items.sort_by(|a, b| {
            (a.uid, a.first, a.last).cmp(&(b.uid, b.first, b.last))
        });

        let mut cur = make_results_stage1(
            &camera_items,
            play_offset,
            start_offset,
            stop_offset,
            false,
        );

        if !cur.is_empty() {
            let saved_ranges = clips.get_times_from_location(
                camera,
                Some(window.start),
                Some(window.end),
                true,
            )?;
            add_cam_and_save_info(&mut cur, camera, &flush, &saved_ranges);
        }

        if !cur.is_empty() && combine {
            combine_overlapping_clips(&mut cur, preserve_play_offset, &thresholds);
        }
        matching.extend(cur);
    }

    Ok((flush, matching))
}

/// Stage 1: parses (sorted, single-camera) ranges into preliminary clips.
///
/// Without combining, every range stands alone, except that identical
/// instantaneous triggers fold into one clip so merged boxes don't yield
/// duplicate results. With combining, a range of the same object whose
/// padded start touches the previous clip extends it.
///
/// Output is sorted by stop time; `source_items` holds indices into
/// `items`.
pub(crate) fn make_results_stage1(
    items: &[ObjectRange],
    play_offset: Duration,
    start_offset: Duration,
    stop_offset: Duration,
    should_combine_clips: bool,
) -> Vec<MatchingClip> {
    let mut results: Vec<MatchingClip> = Vec::new();

    if !should_combine_clips {
        let mut instant: FastHashMap<(Time, i64), usize> = FastHashMap::default();
        for (i, item) in items.iter().enumerate() {
            let (start, start_frame) = item.first;
            let (stop, _) = item.last;
            if let Some(&at) = instant.get(&(start, start_frame)) {
                let clip = &mut results[at];
                clip.source_items.push(i);
                if !clip.obj_list.contains(&item.uid) {
                    clip.obj_list.push(item.uid);
                }
                continue;
            }
            results.push(MatchingClip::from_range(
                item,
                i,
                play_offset,
                start_offset,
                stop_offset,
            ));
            if start == stop {
                instant.insert((start, start_frame), results.len() - 1);
            }
        }
    } else {
        let mut prev_uid: Option<i64> = None;
        for (i, item) in items.iter().enumerate() {
            let (start, _) = item.first;
            let (stop, stop_frame) = item.last;
            if prev_uid == Some(item.uid) {
                let prev = results.last_mut().expect("prev_uid implies a clip");
                if start - start_offset <= prev.stop_time {
                    prev.stop_time = stop + stop_offset;
                    prev.start_list.push(start);
                    prev.real_stop = stop;
                    prev.stop_frame = stop_frame;
                    prev.source_items.push(i);
                    continue;
                }
            }
            results.push(MatchingClip::from_range(
                item,
                i,
                play_offset,
                start_offset,
                stop_offset,
            ));
            prev_uid = Some(item.uid);
        }
    }

    results.sort_by_key(|c| c.stop_time);
    results
}

/// The minimum merge threshold in effect between two times. This bounds
/// how much excess video was spared between two events, and thus whether
/// bridging them yields a playable clip.
fn min_merge_threshold(thresholds: &[(Time, i64)], start: Time, end: Time) -> i64 {
    let mut result: Option<i64> = None;
    for &(update_time, value) in thresholds {
        if update_time < start && update_time <= end {
            result = Some(value);
        } else if update_time >= start && update_time <= end {
            result = Some(match result {
                None => value,
                Some(r) => r.min(value),
            });
        } else {
            break;
        }
    }
    result.unwrap_or(0)
}

/// Stages 2/3 combined entry point used by the streaming engine: stage-1
/// parse plus (for combining queries) the cross-object overlap merge.
pub(crate) fn make_results_from_ranges(
    items: &[ObjectRange],
    play_offset: Duration,
    start_offset: Duration,
    stop_offset: Duration,
    should_combine_clips: bool,
    preserve_play_offset: bool,
    thresholds: &[(Time, i64)],
) -> Vec<MatchingClip> {
    let mut results = make_results_stage1(
        items,
        play_offset,
        start_offset,
        stop_offset,
        should_combine_clips,
    );
    if should_combine_clips && !results.is_empty() {
        combine_overlapping_clips(&mut results, preserve_play_offset, thresholds);
    }
    results
}

/// Merges clips whose *actual* (unpadded) ranges overlap or nearly touch,
/// regardless of object identity, and splits the padding of neighbors that
/// remain distinct so their emitted intervals never overlap.
///
/// `results` must be sorted by stop time.
pub(crate) fn combine_overlapping_clips(
    results: &mut Vec<MatchingClip>,
    preserve_play_offset: bool,
    thresholds: &[(Time, i64)],
) {
    let mut i = results.len().saturating_sub(1);
    while i > 0 {
        let (prev, cur) = {
            let (head, tail) = results.split_at_mut(i);
            (&mut head[i - 1], &mut tail[0])
        };

        let merge_threshold_ms =
            min_merge_threshold(thresholds, prev.stop_time, cur.start_time) * MS_PER_SEC;

        // Three ways to merge: within the configured distance, actual
        // overlap, or frame adjacency (with the time sanity check against
        // frame-counter resets).
        let should_merge = (merge_threshold_ms > 0
            && (cur.real_start - prev.real_stop).0 <= merge_threshold_ms)
            || cur.real_start < prev.real_stop
            || ((0..=FRAME_TOLERANCE).contains(&(cur.start_frame - prev.stop_frame))
                && cur.real_start - prev.real_stop <= MS_TOLERANCE);

        if should_merge {
            let prev = results.remove(i - 1);
            let cur = &mut results[i - 1];
            cur.start_time = cur.start_time.min(prev.start_time);
            cur.play_start = cur.play_start.min(prev.play_start);
            cur.preview_ms = cur.preview_ms.min(prev.preview_ms);
            cur.obj_list.extend(prev.obj_list);
            cur.obj_list.sort_unstable();
            cur.obj_list.dedup();
            cur.start_list.extend(prev.start_list);
            cur.real_start = cur.real_start.min(prev.real_start);
            cur.start_frame = cur.start_frame.min(prev.start_frame);
            cur.source_items.extend(prev.source_items);
            // If either side is saved because of a rule, so is the merged
            // clip.
            cur.is_saved = cur.is_saved.or(prev.is_saved);
        } else if cur.start_time <= prev.stop_time {
            // Distinct clips whose padding overlaps: split the gap.
            let diff = if preserve_play_offset {
                // The play offset counts as content here, so the split
                // point backs off from it rather than the real start.
                if cur.play_start <= prev.real_stop {
                    Duration::ZERO
                } else {
                    cur.play_start - prev.real_stop
                }
            } else {
                cur.real_start - prev.real_stop
            };
            let new_prev_stop = prev.real_stop + Duration(diff.0 / 2);
            if new_prev_stop.0 + 1 < cur.start_time.0 {
                prev.stop_time = Time(cur.start_time.0 - 1);
            } else if new_prev_stop >= prev.stop_time {
                cur.start_time = Time(prev.stop_time.0 + 1);
            } else {
                prev.stop_time = new_prev_stop;
                cur.start_time = Time(new_prev_stop.0 + 1);
            }
            cur.play_start = cur.play_start.max(cur.start_time);

            if prev.stop_time < prev.real_stop
                || cur.start_time > cur.real_start
                || prev.stop_time >= cur.start_time
            {
                error!(
                    prev_stop = prev.stop_time.0,
                    prev_real_stop = prev.real_stop.0,
                    cur_start = cur.start_time.0,
                    cur_real_start = cur.real_start.0,
                    "padding split broke clip bounds"
                );
                debug_assert!(false, "padding split broke clip bounds");
            }
        }

        i -= 1;
    }
}

/// Stage: assigns each clip its camera and saved state.
///
/// When a flush is pending and the clip's real stop falls in the interval
/// `(cur_max_tagged, real_max_tagged]` reported by the flush, the state is
/// [`SavedState::Pending`] carrying the real stop to re-check after.
/// Otherwise the camera's saved ranges decide.
pub(crate) fn add_cam_and_save_info(
    results: &mut [MatchingClip],
    camera: &str,
    flush: &FlushMap,
    saved_ranges: &[(Time, Time)],
) {
    let flush_pending = !flush.is_empty();
    let real_max_tagged = flush
        .get(camera)
        .map(|f| f.last_tagged)
        .unwrap_or(Time(0));
    let cur_max_tagged = saved_ranges.last().map(|r| r.1).unwrap_or(Time(0));

    for clip in results.iter_mut() {
        let (start, stop) = (clip.real_start, clip.real_stop);
        let mut is_saved = SavedState::No;

        if flush_pending && stop > cur_max_tagged && stop <= real_max_tagged {
            is_saved = SavedState::Pending(stop);
        } else if !saved_ranges.is_empty() {
            let idx = saved_ranges.partition_point(|&(s, _)| s < start);
            if idx < saved_ranges.len()
                && start == saved_ranges[idx].0
                && stop <= saved_ranges[idx].1
            {
                is_saved = SavedState::Yes;
            } else if idx != 0 && stop <= saved_ranges[idx - 1].1 {
                // start is past the previous range's start, so only the
                // stop needs checking.
                is_saved = SavedState::Yes;
            }
        }

        clip.camera = Some(camera.to_owned());
        clip.is_saved = is_saved;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::TargetQuery;
    use crate::video::testutil::FakeFlusher;
    use db::clips::{CacheStatus, ClipToInsert};
    use db::objects::BBox;

    fn range(uid: i64, first: (i64, i64), last: (i64, i64)) -> ObjectRange {
        ObjectRange {
            uid,
            first: (Time(first.0), first.1),
            last: (Time(last.0), last.1),
            camera: "Door".to_owned(),
        }
    }

    /// Instantaneous doorbell: a single trigger becomes one padded clip.
    #[test]
    fn instant_trigger_single_clip() {
        let items = vec![range(7, (1_000_000, 100), (1_000_000, 100))];
        let results = make_results_stage1(
            &items,
            Duration::ZERO,
            Duration(3_000),
            Duration(3_000),
            false,
        );
        assert_eq!(results.len(), 1);
        let c = &results[0];
        assert_eq!(c.start_time, Time(997_000));
        assert_eq!(c.stop_time, Time(1_003_000));
        assert_eq!(c.play_start, Time(1_000_000));
        assert_eq!(c.preview_ms, Time(1_000_000));
        assert_eq!(c.obj_list, vec![7]);
    }

    #[test]
    fn identical_instant_triggers_fold() {
        let items = vec![
            range(7, (1_000_000, 100), (1_000_000, 100)),
            range(9, (1_000_000, 100), (1_000_000, 100)),
        ];
        let results = make_results_stage1(
            &items,
            Duration::ZERO,
            Duration(3_000),
            Duration(3_000),
            false,
        );
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].obj_list, vec![7, 9]);
        assert_eq!(results[0].source_items, vec![0, 1]);
    }

    /// Two objects crossing the scene merge into one clip because their
    /// real intervals overlap.
    #[test]
    fn overlapping_objects_combine() {
        let items = vec![
            range(1, (1_000, 10), (3_000, 20)),
            range(2, (1_500, 15), (3_500, 25)),
        ];
        let results = make_results_from_ranges(
            &items,
            Duration::ZERO,
            Duration(1_000),
            Duration(1_000),
            true,
            false,
            &[],
        );
        assert_eq!(results.len(), 1);
        let c = &results[0];
        assert_eq!(c.start_time, Time(0));
        assert_eq!(c.stop_time, Time(4_500));
        assert_eq!(c.obj_list, vec![1, 2]);
    }

    /// Merge decisions don't depend on which object owns which range.
    #[test]
    fn merge_is_symmetric_in_object_identity() {
        let a = vec![
            range(1, (1_000, 10), (3_000, 20)),
            range(2, (1_500, 15), (3_500, 25)),
        ];
        let b = vec![
            range(2, (1_000, 10), (3_000, 20)),
            range(1, (1_500, 15), (3_500, 25)),
        ];
        for items in [a, b] {
            let results = make_results_from_ranges(
                &items,
                Duration::ZERO,
                Duration(1_000),
                Duration(1_000),
                true,
                false,
                &[],
            );
            assert_eq!(results.len(), 1);
            assert_eq!(results[0].obj_list, vec![1, 2]);
            assert_eq!(
                (results[0].start_time, results[0].stop_time),
                (Time(0), Time(4_500))
            );
        }
    }

    /// Frame numbers reset across pipeline restarts; adjacency in frame
    /// numbers alone must not merge events 17 s apart.
    #[test]
    fn frame_adjacency_requires_close_times() {
        let items = vec![
            range(1, (1_000, 10), (3_000, 20)),
            range(1, (20_000, 21), (22_000, 31)),
        ];
        let results = make_results_from_ranges(
            &items,
            Duration::ZERO,
            Duration(1_000),
            Duration(1_000),
            true,
            false,
            &[],
        );
        assert_eq!(results.len(), 2, "17 s gap must not merge");

        // The same frame gap within the time tolerance does merge.
        let items = vec![
            range(1, (1_000, 10), (3_000, 20)),
            range(1, (5_500, 21), (7_000, 31)),
        ];
        let results = make_results_from_ranges(
            &items,
            Duration::ZERO,
            Duration(1_000),
            Duration(1_000),
            true,
            false,
            &[],
        );
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn merge_threshold_bridges_distant_events() {
        let items = vec![
            range(1, (1_000, 10), (3_000, 20)),
            range(2, (9_000, 200), (10_000, 220)),
        ];
        // No threshold: distinct clips with split padding.
        let results = make_results_from_ranges(
            &items,
            Duration::ZERO,
            Duration(1_000),
            Duration(1_000),
            true,
            false,
            &[],
        );
        assert_eq!(results.len(), 2);
        assert!(results[0].stop_time < results[1].start_time);

        // A 10 s threshold in effect for the whole window bridges them.
        let results = make_results_from_ranges(
            &items,
            Duration::ZERO,
            Duration(1_000),
            Duration(1_000),
            true,
            false,
            &[(Time(0), 10)],
        );
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].obj_list, vec![1, 2]);
    }

    #[test]
    fn padding_split_keeps_clips_disjoint() {
        // Real gap of 4 s with 3 s of padding on each side: the padded
        // intervals overlap and must be split around the midpoint.
        let items = vec![
            range(1, (1_000, 10), (3_000, 20)),
            range(2, (7_000, 100), (9_000, 120)),
        ];
        let results = make_results_from_ranges(
            &items,
            Duration::ZERO,
            Duration(3_000),
            Duration(3_000),
            true,
            false,
            &[],
        );
        assert_eq!(results.len(), 2);
        let (a, b) = (&results[0], &results[1]);
        assert!(a.stop_time < b.start_time);
        assert!(a.stop_time >= a.real_stop);
        assert!(b.start_time <= b.real_start);
        // Split point is the midpoint of the real gap.
        assert_eq!(a.stop_time, Time(5_000));
        assert_eq!(b.start_time, Time(5_001));
    }

    #[test]
    fn min_merge_threshold_picks_minimum_in_window() {
        let t = vec![(Time(0), 10), (Time(5_000), 2), (Time(9_000), 7)];
        assert_eq!(min_merge_threshold(&t, Time(1_000), Time(2_000)), 10);
        assert_eq!(min_merge_threshold(&t, Time(1_000), Time(6_000)), 2);
        assert_eq!(min_merge_threshold(&t, Time(6_000), Time(10_000)), 2);
        assert_eq!(min_merge_threshold(&t, Time(9_500), Time(10_000)), 7);
        assert_eq!(min_merge_threshold(&[], Time(0), Time(1)), 0);
    }

    #[test]
    fn save_info_pending_and_bisect() {
        let mut clips = vec![
            MatchingClip::from_range(
                &range(1, (1_000, 1), (2_000, 5)),
                0,
                Duration::ZERO,
                Duration(500),
                Duration(500),
            ),
            MatchingClip::from_range(
                &range(2, (8_000, 50), (9_000, 60)),
                1,
                Duration::ZERO,
                Duration(500),
                Duration(500),
            ),
            MatchingClip::from_range(
                &range(3, (12_000, 80), (14_000, 95)),
                2,
                Duration::ZERO,
                Duration(500),
                Duration(500),
            ),
        ];
        let saved = vec![(Time(500), Time(2_500)), (Time(7_000), Time(9_500))];
        let mut flush = FlushMap::default();
        flush.insert(
            "Door".to_owned(),
            FlushInfo {
                last_processed: Time(15_000),
                last_tagged: Time(14_500),
            },
        );
        add_cam_and_save_info(&mut clips, "Door", &flush, &saved);
        assert_eq!(clips[0].is_saved, SavedState::Yes);
        assert_eq!(clips[0].camera.as_deref(), Some("Door"));
        assert_eq!(clips[1].is_saved, SavedState::Yes);
        // Real stop past the saved ranges but within the flush's tagged
        // bound: pending, carrying the time to re-check after.
        assert_eq!(clips[2].is_saved, SavedState::Pending(Time(14_000)));
    }

    /// End-to-end: detections in the object index, availability in the
    /// clip index, clip assembly through the public entry point.
    #[test]
    fn end_to_end_between_times() {
        let mut objects = db::testutil::object_index(Time(1_000_000));
        let mut clips = db::testutil::clip_index(Time(1_000_000));

        clips
            .add_clip(ClipToInsert {
                filename: "door1.mp4".to_owned(),
                camera: "Door".to_owned(),
                first: Time(0),
                last: Time(60_000),
                cache_status: CacheStatus::NonCache,
                proc_width: 320,
                proc_height: 240,
                ..Default::default()
            })
            .unwrap();

        let uid1 = objects.add_object(Time(1_000), "person", "Door").unwrap();
        let uid2 = objects.add_object(Time(1_500), "person", "Door").unwrap();
        for (uid, t0, frames) in [(uid1, 1_000, 10..=20), (uid2, 1_500, 15..=25)] {
            for (i, frame) in frames.enumerate() {
                objects
                    .add_frame(
                        uid,
                        frame,
                        Time(t0 + i as i64 * 200),
                        BBox {
                            x1: 10,
                            y1: 10,
                            x2: 60,
                            y2: 110,
                        },
                        "person",
                        None,
                    )
                    .unwrap();
            }
        }

        let query = TargetQuery {
            targets: vec![("person".to_owned(), "any".to_owned())],
            start_offset: Duration(1_000),
            stop_offset: Duration(1_000),
            combine_clips: true,
            ..Default::default()
        };
        let flusher = FakeFlusher::default();
        let cameras = vec!["Door".to_owned()];
        let (_flush, results) = get_search_results_between_times(
            &query,
            &cameras,
            Time(0),
            Time(30_000),
            Duration::ZERO,
            &mut objects,
            &mut clips,
            None,
            &flusher,
            None,
            None,
        )
        .unwrap();

        assert_eq!(results.len(), 1);
        let c = &results[0];
        assert_eq!(c.camera.as_deref(), Some("Door"));
        assert_eq!(c.obj_list, vec![uid1, uid2]);
        assert_eq!(c.start_time, Time(0));
        assert_eq!(c.stop_time, Time(4_500));
        // Non-cache video counts as saved.
        assert_eq!(c.is_saved, SavedState::Yes);
        // Ordering invariant of assembled clips.
        assert!(c.start_time <= c.play_start);
        assert!(c.play_start <= c.preview_ms);
        assert!(c.preview_ms <= c.real_stop);
        assert!(c.real_stop <= c.stop_time);
    }
}
