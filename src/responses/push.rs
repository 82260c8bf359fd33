// This file is part of Argus NVR, a security camera network video recorder.
// Copyright (C) 2024 The Argus NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Push-notification responses (also used for IFTTT triggers, which differ
//! only in the message queued).
//!
//! Instantaneous rules fire on every trigger; for everything else,
//! overlapping per-object ranges within the query's padding collapse into
//! a single notification, and a `stop_frame` watermark suppresses
//! continuation pushes across successive batches.

use base::time::{Duration, Time};
use crossbeam_channel::Sender;
use std::collections::BTreeMap;
use tracing::warn;

use crate::msg::Message;
use crate::responses::Response;
use crate::search::FRAME_TOLERANCE;
use crate::streaming::RangeDict;

/// Arbitrary, but must be negative: the first frame of a session could be
/// any non-negative number, and must not be flagged as a continuation.
const STOP_FRAME_DEFAULT: i64 = -20;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PushKind {
    /// Queue a `SendPush` (mobile gateway notification).
    Push,

    /// Queue a `TriggerIfttt` (epoch seconds instead of ms).
    Ifttt,
}

pub struct PushResponse {
    camera: String,
    rule_name: String,
    kind: PushKind,
    combine: bool,
    runner_tx: Sender<Message>,

    /// Recurring triggers within the possible padding are combined in the
    /// app's clip view; notifications mimic that.
    padding: Duration,

    stop_frame: i64,

    /// Per object: `(first_frame, first_time, last_frame, last_time)` of
    /// its ongoing trigger run.
    obj_lookup: BTreeMap<i64, (i64, Time, i64, Time)>,
}

impl PushResponse {
    pub fn new(
        camera: String,
        rule_name: String,
        kind: PushKind,
        combine: bool,
        start_offset: Duration,
        stop_offset: Duration,
        runner_tx: Sender<Message>,
    ) -> Self {
        PushResponse {
            camera,
            rule_name,
            kind,
            combine,
            runner_tx,
            padding: start_offset + stop_offset,
            stop_frame: STOP_FRAME_DEFAULT,
            obj_lookup: BTreeMap::new(),
        }
    }

    fn queue_notification(&self, ms: Time) {
        let msg = match self.kind {
            PushKind::Push => Message::SendPush {
                camera: self.camera.clone(),
                rule_name: self.rule_name.clone(),
                ms,
            },
            PushKind::Ifttt => Message::TriggerIfttt {
                camera: self.camera.clone(),
                rule_name: self.rule_name.clone(),
                epoch_secs: ms.unix_seconds(),
            },
        };
        if self.runner_tx.send(msg).is_err() {
            warn!("response runner queue is gone; dropping notification");
        }
    }
}

impl Response for PushResponse {
    fn add_ranges(&mut self, ms: Time, range_dict: &RangeDict) {
        // (start_frame, trigger_ms, stop_frame) per raw trigger span.
        let mut raw_list: Vec<(i64, Time, i64)> = Vec::new();

        for (&uid, ranges) in range_dict {
            for &((first_frame, first_time), (last_frame, last_time)) in ranges {
                if !self.combine {
                    raw_list.push((first_frame, first_time, first_frame));
                    continue;
                }
                // If this object triggered within our padding tolerance,
                // pretend it has been triggering the whole time.
                match self.obj_lookup.get(&uid) {
                    Some(&(prev_first_frame, prev_first_time, _, prev_last_time))
                        if prev_last_time > first_time - self.padding =>
                    {
                        raw_list.push((prev_first_frame, prev_first_time, last_frame));
                        self.obj_lookup.insert(
                            uid,
                            (prev_first_frame, prev_first_time, last_frame, last_time),
                        );
                    }
                    _ => {
                        raw_list.push((first_frame, first_time, last_frame));
                        self.obj_lookup
                            .insert(uid, (first_frame, first_time, last_frame, last_time));
                    }
                }
            }
        }

        if raw_list.is_empty() {
            return;
        }

        if !self.combine {
            raw_list.sort_unstable();
            raw_list.dedup();
            for &(_, trigger_ms, _) in &raw_list {
                self.queue_notification(trigger_ms);
            }
            return;
        }

        // Combine overlapping spans regardless of object id.
        raw_list.sort_unstable();
        let mut span_list: Vec<(i64, Time, i64)> = vec![raw_list[0]];
        for &(start, trigger_ms, stop) in &raw_list[1..] {
            let last = span_list.last_mut().expect("nonempty");
            if start - last.2 <= FRAME_TOLERANCE {
                last.2 = last.2.max(stop);
            } else {
                span_list.push((start, trigger_ms, stop));
            }
        }

        // If the first span merely extends the previous batch's
        // notification, swallow it.
        let mut first = 0;
        if let Some(&(start, _, stop)) = span_list.first() {
            if start - self.stop_frame <= FRAME_TOLERANCE {
                self.stop_frame = stop;
                first = 1;
            }
        }

        for &(_, trigger_ms, stop) in &span_list[first..] {
            self.queue_notification(trigger_ms);
            self.stop_frame = stop;
        }

        // Forget objects unseen for longer than the padding.
        self.obj_lookup
            .retain(|_, &mut (_, _, _, last_time)| last_time >= ms - self.padding);
    }

    fn start_new_session(&mut self) {
        self.stop_frame = STOP_FRAME_DEFAULT;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    fn dict_of(entries: &[(i64, (i64, i64), (i64, i64))]) -> RangeDict {
        let mut d = RangeDict::new();
        for &(uid, (f1, t1), (f2, t2)) in entries {
            d.entry(uid)
                .or_default()
                .push(((f1, Time(t1)), (f2, Time(t2))));
        }
        d
    }

    fn response(kind: PushKind, combine: bool) -> (PushResponse, crossbeam_channel::Receiver<Message>) {
        let (tx, rx) = unbounded();
        (
            PushResponse::new(
                "Door".to_owned(),
                "People".to_owned(),
                kind,
                combine,
                Duration(2_000),
                Duration(2_000),
                tx,
            ),
            rx,
        )
    }

    #[test]
    fn continuation_across_batches_is_suppressed() {
        let (mut r, rx) = response(PushKind::Push, true);
        r.add_ranges(Time(3_000), &dict_of(&[(1, (10, 1_000), (20, 3_000))]));
        assert!(matches!(
            rx.try_recv(),
            Ok(Message::SendPush { ms: Time(1_000), .. })
        ));

        // Frames continue from 21: same event, no second push.
        r.add_ranges(Time(5_000), &dict_of(&[(1, (21, 3_100), (30, 5_000))]));
        assert!(rx.try_recv().is_err());

        // A distinct later run pushes again.
        r.add_ranges(Time(60_000), &dict_of(&[(2, (200, 58_000), (210, 60_000))]));
        assert!(matches!(
            rx.try_recv(),
            Ok(Message::SendPush { ms: Time(58_000), .. })
        ));
    }

    #[test]
    fn session_reset_allows_fresh_notification() {
        let (mut r, rx) = response(PushKind::Push, true);
        r.add_ranges(Time(3_000), &dict_of(&[(1, (10, 1_000), (20, 3_000))]));
        rx.try_recv().unwrap();

        r.start_new_session();
        // New session's frames happen to continue the numbering; the reset
        // watermark must not treat them as a continuation.
        r.add_ranges(Time(93_000), &dict_of(&[(3, (21, 91_000), (30, 93_000))]));
        assert!(matches!(rx.try_recv(), Ok(Message::SendPush { .. })));
    }

    #[test]
    fn overlapping_objects_one_notification() {
        let (mut r, rx) = response(PushKind::Push, true);
        r.add_ranges(
            Time(4_000),
            &dict_of(&[
                (1, (10, 1_000), (20, 3_000)),
                (2, (18, 1_500), (25, 3_500)),
            ]),
        );
        assert!(matches!(rx.try_recv(), Ok(Message::SendPush { .. })));
        assert!(rx.try_recv().is_err(), "overlapping spans collapse");
    }

    #[test]
    fn instantaneous_mode_fires_each_trigger_once() {
        let (mut r, rx) = response(PushKind::Push, false);
        // Two objects at the same instant/frame fold; a later one fires
        // separately.
        r.add_ranges(
            Time(5_000),
            &dict_of(&[
                (1, (10, 1_000), (10, 1_000)),
                (2, (10, 1_000), (10, 1_000)),
                (3, (80, 4_000), (80, 4_000)),
            ]),
        );
        let mut times = Vec::new();
        while let Ok(Message::SendPush { ms, .. }) = rx.try_recv() {
            times.push(ms);
        }
        assert_eq!(times, vec![Time(1_000), Time(4_000)]);
    }

    #[test]
    fn ifttt_kind_sends_epoch_seconds() {
        let (mut r, rx) = response(PushKind::Ifttt, true);
        r.add_ranges(
            Time(1_600_000_003_000),
            &dict_of(&[(1, (10, 1_600_000_001_000), (20, 1_600_000_003_000))]),
        );
        assert!(matches!(
            rx.try_recv(),
            Ok(Message::TriggerIfttt {
                epoch_secs: 1_600_000_001,
                ..
            })
        ));
    }
}
