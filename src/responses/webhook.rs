// This file is part of Argus NVR, a security camera network video recorder.
// Copyright (C) 2024 The Argus NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Webhook responses: POST user-supplied content on an object's first
//! sighting, with `{SvRuleName}` / `{SvCameraName}` / `{SvEventTime}`
//! placeholders substituted.

use base::clock::Clocks;
use base::time::{Duration, Time};
use crossbeam_channel::Sender;
use std::collections::BTreeMap;
use tracing::warn;

use crate::msg::{Message, ResponseConfig};
use crate::responses::Response;
use crate::streaming::RangeDict;

/// After this long unseen, an object is forgotten (and so would trigger
/// again on reappearance).
const OBJ_TIMEOUT: Duration = Duration(10_000);

pub struct WebhookResponse<C: Clocks> {
    rule_name: String,
    camera: String,
    runner_tx: Sender<Message>,
    clocks: C,

    uri: String,
    content_type: String,

    /// Content with the rule/camera placeholders pre-substituted;
    /// `{SvEventTime}` is filled per event.
    content: String,

    /// Object id -> last time seen.
    objects_seen: BTreeMap<i64, Time>,
}

impl<C: Clocks> WebhookResponse<C> {
    pub fn new(
        rule_name: String,
        camera: String,
        config: &ResponseConfig,
        clocks: C,
        runner_tx: Sender<Message>,
    ) -> Self {
        let content = config
            .webhook_content
            .replace("{SvRuleName}", &format!("'{rule_name}'"))
            .replace("{SvCameraName}", &format!("'{camera}'"));
        WebhookResponse {
            rule_name,
            camera,
            runner_tx,
            clocks,
            uri: config.webhook_uri.clone(),
            content_type: config.webhook_content_type.clone(),
            content,
            objects_seen: BTreeMap::new(),
        }
    }

    /// Newly appearing objects (updating last-seen for the rest).
    fn new_active_objects(&mut self, range_dict: &RangeDict) -> Vec<(i64, Time)> {
        let mut triggers = Vec::new();
        for (&uid, ranges) in range_dict {
            let (Some(first), Some(last)) = (ranges.first(), ranges.last()) else {
                continue;
            };
            if !self.objects_seen.contains_key(&uid) {
                triggers.push((uid, (first.0).1));
            }
            self.objects_seen.insert(uid, (last.1).1);
        }
        triggers
    }

    fn format_event_time(t: Time) -> String {
        match jiff::Timestamp::from_millisecond(t.0) {
            Ok(ts) => ts
                .to_zoned(base::time::global_zone())
                .strftime("%Y-%m-%d %H:%M:%S")
                .to_string(),
            Err(_) => t.0.to_string(),
        }
    }
}

impl<C: Clocks> Response for WebhookResponse<C> {
    fn add_ranges(&mut self, _ms: Time, range_dict: &RangeDict) {
        let triggers = self.new_active_objects(range_dict);

        // GC timed-out ids so the map can't grow forever.
        let now = self.clocks.realtime();
        self.objects_seen.retain(|_, &mut last| now - last <= OBJ_TIMEOUT);

        for (uid, event_time) in triggers {
            let content = self
                .content
                .replace("{SvEventTime}", &Self::format_event_time(event_time));
            if self
                .runner_tx
                .send(Message::SendWebhook {
                    camera: self.camera.clone(),
                    rule_name: self.rule_name.clone(),
                    uri: self.uri.clone(),
                    ms: event_time,
                    content_type: self.content_type.clone(),
                    content,
                    obj: (uid, event_time),
                })
                .is_err()
            {
                warn!("response runner queue is gone; dropping webhook");
            }
        }
    }
}
