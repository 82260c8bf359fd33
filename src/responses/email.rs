// This file is part of Argus NVR, a security camera network video recorder.
// Copyright (C) 2024 The Argus NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Email responses: tracks active objects so one loitering person yields a
//! slow drip of emails rather than a flood, and merges notifications for
//! objects whose presence substantially overlaps.

use base::time::{Duration, Time};
use crossbeam_channel::Sender;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

use crate::msg::{EmailSettings, EngineEvent, Message, ResponseConfig};
use crate::responses::Response;
use crate::streaming::RangeDict;

/// Do not email sooner than this after an object's first appearance; brief
/// flickers aren't worth a message.
const MIN_TIME_SINCE_START: Duration = Duration(2_000);

/// If the object is hanging around this long, email about it again.
const MIN_REPEAT_TIME: Duration = Duration(10_000);

/// If we haven't seen an object for this long, forget about it.
const OBJECT_TIMEOUT: Duration = Duration(30_000);

/// Minimum overlap ratio (`2·overlap / (len1 + len2)`) at which two
/// objects' notifications merge into one email.
const MIN_OBJECT_OVERLAP_RATIO: f64 = 0.7;

static MESSAGE_ID_SEQ: AtomicU64 = AtomicU64::new(0);

pub struct EmailResponse {
    rule_name: String,
    camera: String,
    email_settings: EmailSettings,
    config: ResponseConfig,
    backend_tx: Sender<EngineEvent>,
    runner_tx: Sender<Message>,

    want_limiting: bool,
    limit: Duration,
    last_email_time: Time,

    /// Per object: `(first_seen, last_seen, last_email)`; `last_email` of
    /// zero means never emailed.
    active_objects: BTreeMap<i64, (Time, Time, Time)>,
}

impl EmailResponse {
    pub fn new(
        rule_name: String,
        camera: String,
        email_settings: EmailSettings,
        config: ResponseConfig,
        backend_tx: Sender<EngineEvent>,
        runner_tx: Sender<Message>,
    ) -> Self {
        let want_limiting = config.want_limit;
        let limit = Duration::from_secs(config.limit_seconds);
        EmailResponse {
            rule_name,
            camera,
            email_settings,
            config,
            backend_tx,
            runner_tx,
            want_limiting,
            limit,
            last_email_time: Time(0),
            active_objects: BTreeMap::new(),
        }
    }

    fn request_email(&mut self, num_triggers: usize, obj_list: Vec<i64>, first: Time, last: Time) {
        if self.want_limiting && first - self.last_email_time < self.limit {
            return;
        }

        // Flush the video so the response runner can read the thumbnail.
        let _ = self.backend_tx.send(EngineEvent::FlushVideo {
            camera: self.camera.clone(),
            ms: None,
        });

        let seq = MESSAGE_ID_SEQ.fetch_add(1, Ordering::Relaxed);
        let message_id = format!("<{}.{}.argus@{}>", first.0, seq, self.camera);
        if self
            .runner_tx
            .send(Message::SendEmail {
                rule_name: self.rule_name.clone(),
                camera: self.camera.clone(),
                email_settings: self.email_settings.clone(),
                config: self.config.clone(),
                num_triggers,
                obj_list,
                first,
                last,
                message_id,
            })
            .is_err()
        {
            warn!("response runner queue is gone; dropping email request");
        }

        self.last_email_time = first;
    }
}

impl Response for EmailResponse {
    fn add_ranges(&mut self, ms: Time, range_dict: &RangeDict) {
        // Fold the new ranges into the active-object table.
        for (&uid, ranges) in range_dict {
            let Some(first) = ranges.first() else {
                continue;
            };
            let last = ranges.last().expect("nonempty has last");
            let (first_ms, last_ms) = ((first.0).1, (last.1).1);
            let prev = self
                .active_objects
                .get(&uid)
                .copied()
                .unwrap_or((first_ms, last_ms, Time(0)));
            self.active_objects.insert(uid, (prev.0, last_ms, prev.2));
        }

        // Decide per object whether to (re)email or forget it.
        let mut to_email: Vec<(i64, Time, Time)> = Vec::new();
        let uids: Vec<i64> = self.active_objects.keys().copied().collect();
        for uid in uids {
            let (first, last, emailed) = self.active_objects[&uid];
            let should_email =
                ms - first > MIN_TIME_SINCE_START && last - emailed > MIN_REPEAT_TIME;
            let should_remove = ms - last > OBJECT_TIMEOUT && emailed > Time(0);
            if should_email {
                let start = if emailed == Time(0) { first } else { emailed };
                to_email.push((uid, start, last));
            }
            if should_remove {
                self.active_objects.remove(&uid);
            } else {
                let emailed = if should_email { ms } else { emailed };
                self.active_objects.insert(uid, (first, last, emailed));
            }
        }

        // Merge notifications whose presence overlaps substantially.
        let mut already_emailed: Vec<i64> = Vec::new();
        for i in 0..to_email.len() {
            let (uid, mut first, mut last) = to_email[i];
            if already_emailed.contains(&uid) {
                continue;
            }
            let mut obj_set = vec![uid];
            already_emailed.push(uid);
            debug!(uid, delay = (ms - first).0, "requesting email notification");

            for &(uid2, first2, last2) in &to_email[i + 1..] {
                if already_emailed.contains(&uid2) {
                    continue;
                }
                if first2 <= last && last2 >= first {
                    // The ranges overlap, but do they overlap enough?
                    let len_sum = (last - first).0 + (last2 - first2).0;
                    let overlap_first = first.max(first2);
                    let overlap_last = last.min(last2);
                    let overlap = (overlap_last - overlap_first).0;
                    if len_sum > 0 && (2 * overlap) as f64 / len_sum as f64 > MIN_OBJECT_OVERLAP_RATIO
                    {
                        debug!(uid, uid2, "merging email notifications");
                        already_emailed.push(uid2);
                        obj_set.push(uid2);
                        first = overlap_first;
                        last = overlap_last;
                    }
                }
            }

            obj_set.sort_unstable();
            self.request_email(obj_set.len(), obj_set, first, last);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    // Tests use realistic epoch-scale times; the "never emailed" marker is
    // time zero, which tiny test times would collide with.
    const T0: i64 = 1_600_000_000_000;

    fn dict_of(entries: &[(i64, i64, i64)]) -> RangeDict {
        let mut d = RangeDict::new();
        for &(uid, first, last) in entries {
            d.entry(uid)
                .or_default()
                .push(((0, Time(T0 + first)), (0, Time(T0 + last))));
        }
        d
    }

    fn response() -> (
        EmailResponse,
        crossbeam_channel::Receiver<EngineEvent>,
        crossbeam_channel::Receiver<Message>,
    ) {
        let (backend_tx, backend_rx) = unbounded();
        let (runner_tx, runner_rx) = unbounded();
        let r = EmailResponse::new(
            "People".to_owned(),
            "Door".to_owned(),
            EmailSettings::default(),
            ResponseConfig::default(),
            backend_tx,
            runner_tx,
        );
        (r, backend_rx, runner_rx)
    }

    #[test]
    fn waits_for_minimum_presence() {
        let (mut r, backend, runner) = response();
        // Object just appeared: too soon to email.
        r.add_ranges(Time(T0 + 1_000), &dict_of(&[(1, 500, 1_000)]));
        assert!(runner.try_recv().is_err());

        // Still present past the minimum age: one email, with a flush
        // requested first.
        r.add_ranges(Time(T0 + 4_000), &dict_of(&[(1, 3_500, 4_000)]));
        assert!(matches!(
            backend.try_recv(),
            Ok(EngineEvent::FlushVideo { .. })
        ));
        match runner.try_recv().unwrap() {
            Message::SendEmail {
                obj_list,
                num_triggers,
                first,
                ..
            } => {
                assert_eq!(obj_list, vec![1]);
                assert_eq!(num_triggers, 1);
                assert_eq!(first, Time(T0 + 500));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn re_emails_only_after_continuous_presence() {
        let (mut r, _backend, runner) = response();
        r.add_ranges(Time(T0 + 4_000), &dict_of(&[(1, 500, 4_000)]));
        assert!(matches!(runner.try_recv(), Ok(Message::SendEmail { .. })));

        // Shortly after: suppressed.
        r.add_ranges(Time(T0 + 6_000), &dict_of(&[(1, 5_000, 6_000)]));
        assert!(runner.try_recv().is_err());

        // After 10 s of continued presence: emailed again, picking up from
        // the previous email's time.
        r.add_ranges(Time(T0 + 15_000), &dict_of(&[(1, 14_500, 15_000)]));
        match runner.try_recv().unwrap() {
            Message::SendEmail { first, .. } => assert_eq!(first, Time(T0 + 4_000)),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn merges_substantially_overlapping_objects() {
        let (mut r, _backend, runner) = response();
        r.add_ranges(
            Time(T0 + 10_000),
            &dict_of(&[(1, 1_000, 9_900), (2, 1_200, 9_800)]),
        );
        match runner.try_recv().unwrap() {
            Message::SendEmail {
                obj_list,
                num_triggers,
                ..
            } => {
                assert_eq!(obj_list, vec![1, 2]);
                assert_eq!(num_triggers, 2);
            }
            other => panic!("unexpected message: {other:?}"),
        }
        assert!(runner.try_recv().is_err(), "merged into a single email");
    }
}
