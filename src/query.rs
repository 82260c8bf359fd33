// This file is part of Argus NVR, a security camera network video recorder.
// Copyright (C) 2024 The Argus NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The query surface a rule presents to the search engine.

use base::clock::Clocks;
use base::time::{Duration, Time};
use base::Error;
use db::clips::ProcSizeRange;
use db::objects::{ObjectIndex, ObjectRange};

/// One trigger point of a non-combining query.
#[derive(Clone, Debug, PartialEq)]
pub struct SearchHit {
    pub uid: i64,
    pub frame: i64,
    pub time: Time,
    pub camera: String,
}

/// What a rule's query tells the search engine.
///
/// `proc_sizes` gives the processing-resolution history of the searched
/// window so spatially-aware queries can rescale stored boxes; queries
/// that don't look at geometry ignore it.
pub trait Query<C: Clocks> {
    /// `(play_offset, preserve_play_offset)`: how far before the trigger
    /// playback should start, and whether that offset counts as clip
    /// content rather than padding.
    fn play_time_offset(&self) -> (Duration, bool);

    /// `(start_offset, stop_offset)` padding around the real event.
    fn clip_length_offsets(&self) -> (Duration, Duration);

    /// False for instantaneous rules (doorbells, line crossings) whose
    /// every trigger stands alone.
    fn should_combine_clips(&self) -> bool;

    /// True when matching depends on geometry and therefore on the
    /// per-camera processing size; such queries search camera by camera.
    fn spatially_aware(&self) -> bool {
        false
    }

    /// Individual trigger points within the window.
    fn search(
        &self,
        index: &mut ObjectIndex<C>,
        start: Option<Time>,
        end: Option<Time>,
        proc_sizes: &[ProcSizeRange],
    ) -> Result<Vec<SearchHit>, Error>;

    /// Per-object trigger ranges within the window.
    fn search_for_ranges(
        &self,
        index: &mut ObjectIndex<C>,
        start: Option<Time>,
        end: Option<Time>,
        proc_sizes: &[ProcSizeRange],
    ) -> Result<Vec<ObjectRange>, Error>;
}

/// A plain target query: object types (with optional specific actions) and
/// a minimum size, over whatever cameras the caller selects.
#[derive(Clone, Debug, Default)]
pub struct TargetQuery {
    /// `(type, action)` pairs; `"any"` matches any action. Empty = all.
    pub targets: Vec<(String, String)>,

    /// Minimum object height (against the normalized 240-high frame).
    pub min_height: Option<i32>,

    pub play_offset: Duration,
    pub preserve_play_offset: bool,
    pub start_offset: Duration,
    pub stop_offset: Duration,
    pub combine_clips: bool,
}

impl TargetQuery {
    fn apply_filters<C: Clocks>(
        &self,
        index: &mut ObjectIndex<C>,
        start: Option<Time>,
        end: Option<Time>,
    ) -> Result<(), Error> {
        index.set_target_filter(&self.targets, start, end)?;
        index.set_min_size_filter(self.min_height);
        Ok(())
    }

    /// Clears the filters this query set, leaving any camera filter the
    /// orchestrator owns untouched.
    fn reset_filters<C: Clocks>(index: &mut ObjectIndex<C>) -> Result<(), Error> {
        index.set_target_filter(&[], None, None)?;
        index.set_min_size_filter(None);
        Ok(())
    }
}

impl<C: Clocks> Query<C> for TargetQuery {
    fn play_time_offset(&self) -> (Duration, bool) {
        (self.play_offset, self.preserve_play_offset)
    }

    fn clip_length_offsets(&self) -> (Duration, Duration) {
        (self.start_offset, self.stop_offset)
    }

    fn should_combine_clips(&self) -> bool {
        self.combine_clips
    }

    fn search(
        &self,
        index: &mut ObjectIndex<C>,
        start: Option<Time>,
        end: Option<Time>,
        _proc_sizes: &[ProcSizeRange],
    ) -> Result<Vec<SearchHit>, Error> {
        self.apply_filters(index, start, end)?;
        let result = (|| -> Result<Vec<SearchHit>, Error> {
            let uids = index.get_objects_between_times(start, end)?;
            let rows = index.get_object_bboxes_between_times(&uids, start, end)?;
            let cameras = index.get_object_cameras(&uids)?;
            Ok(rows
                .into_iter()
                .map(|r| SearchHit {
                    uid: r.obj_uid,
                    frame: r.frame,
                    time: r.time,
                    camera: cameras.get(&r.obj_uid).cloned().unwrap_or_default(),
                })
                .collect())
        })();
        Self::reset_filters(index)?;
        result
    }

    fn search_for_ranges(
        &self,
        index: &mut ObjectIndex<C>,
        start: Option<Time>,
        end: Option<Time>,
        _proc_sizes: &[ProcSizeRange],
    ) -> Result<Vec<ObjectRange>, Error> {
        self.apply_filters(index, start, end)?;
        let result = index.get_object_ranges_between_times(start, end);
        Self::reset_filters(index)?;
        result
    }
}
