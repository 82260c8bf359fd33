// This file is part of Argus NVR, a security camera network video recorder.
// Copyright (C) 2024 The Argus NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Recording tags: flags matched intervals (with pre/post padding) to be
//! saved out of cache. Never leaves the backend.

use base::time::{Duration, Time};
use crossbeam_channel::Sender;
use tracing::warn;

use crate::msg::EngineEvent;
use crate::responses::Response;
use crate::streaming::RangeDict;

pub struct RecordResponse {
    camera: String,
    pre_record: Duration,
    post_record: Duration,
    backend_tx: Sender<EngineEvent>,

    /// The highest time already marked for saving. Nothing prior ever
    /// needs marking again, which saves database hits near file
    /// boundaries when a long trigger re-reports the same interval.
    highest_saved_time: Time,
}

impl RecordResponse {
    pub fn new(
        camera: String,
        pre_record_secs: i64,
        post_record_secs: i64,
        backend_tx: Sender<EngineEvent>,
    ) -> Self {
        RecordResponse {
            camera,
            pre_record: Duration::from_secs(pre_record_secs),
            post_record: Duration::from_secs(post_record_secs),
            backend_tx,
            highest_saved_time: Time(0),
        }
    }
}

impl Response for RecordResponse {
    fn add_ranges(&mut self, _ms: Time, range_dict: &RangeDict) {
        if range_dict.is_empty() {
            return;
        }

        let prev_highest = self.highest_saved_time;
        let mut time_ranges: Vec<(Time, Time)> = Vec::new();
        for ranges in range_dict.values() {
            for &((_, first_ms), (_, last_ms)) in ranges {
                let last_to_save = last_ms + self.post_record;
                time_ranges.push((
                    (first_ms - self.pre_record).max(Time(prev_highest.0 + 1)),
                    last_to_save,
                ));
                self.highest_saved_time = self.highest_saved_time.max(last_to_save);
            }
        }
        time_ranges.sort_unstable();

        if self
            .backend_tx
            .send(EngineEvent::AddSavedTimes {
                camera: self.camera.clone(),
                ranges: time_ranges,
            })
            .is_err()
        {
            warn!("backend queue is gone; dropping saved-times request");
        }
    }

    fn start_new_session(&mut self) {
        // A quick camera toggle leaves the rule remembering a record into
        // the future the new stream knows nothing about; the first tags of
        // a new session must carry the full request range.
        self.highest_saved_time = Time(0);
    }
}
