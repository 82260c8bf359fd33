// This file is part of Argus NVR, a security camera network video recorder.
// Copyright (C) 2024 The Argus NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The push-notification send handler: stores the payload for later fetch
//! by uid, then fires the gateway request.

use base::clock::Clocks;
use base::time::{Duration, Time};
use tracing::{error, info};

use crate::runner::action::ActionContext;
use crate::runner::services::VERSION_STRING;
use crate::runner::supervisor::WorkerShared;
use crate::runner::{wait_until_video_available, ExecutionContext, NOTIFICATION_RETRIES_SECS};

const GET_IMAGE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(2);
const GET_IMAGE_RETRY_SLEEP: std::time::Duration = std::time::Duration::from_millis(500);

/// Notification content as shown on the receiving device; structured data
/// travels alongside in the JSON payload.
fn notification_content(rule_name: &str) -> String {
    format!("Alert for rule \"{}\"", limit_text(rule_name, 64))
}

fn limit_text(text: &str, max_len: usize) -> String {
    if text.chars().count() <= max_len {
        return text.to_owned();
    }
    let mut s: String = text.chars().take(max_len).collect();
    s.push_str("...");
    s
}

/// The next deadline on the fixed `[2, 4, 20, 90]` s schedule, or `None`
/// once the schedule is exhausted.
pub(crate) fn notification_retry_at<C: Clocks>(clocks: &C, try_num: u32) -> Option<Time> {
    let idx = (try_num as usize).checked_sub(1)?;
    let secs = NOTIFICATION_RETRIES_SECS.get(idx)?;
    Some(clocks.realtime() + Duration::from_secs(*secs))
}

pub(crate) fn process_send_push<C: Clocks + Clone>(
    shared: &WorkerShared<C>,
    ctx: &mut ExecutionContext<C>,
    try_num: u32,
    camera: &str,
    rule_name: &str,
    ms: Time,
) -> Option<Time> {
    let settings = shared.notification_settings.lock().clone();
    if !settings.enabled {
        info!("notifications disabled");
        return None;
    }

    let mut action = ActionContext::begin(
        "push notification",
        camera,
        rule_name,
        ms,
        None,
        try_num,
        None,
        shared.clocks.realtime(),
    );

    // Initiate a flush if needed, on the first attempt only; don't wait
    // long for the video.
    if !wait_until_video_available(
        &ctx.clips,
        None,
        try_num == 1,
        camera,
        ms,
        &shared.backend_tx,
        GET_IMAGE_TIMEOUT,
        GET_IMAGE_RETRY_SLEEP,
        &shared.clocks,
    ) {
        action.set_status(false, "image isn't available yet");
        action.finish(shared.clocks.realtime());
        return notification_retry_at(&shared.clocks, try_num);
    }

    if settings.gateway_guid.is_empty() || settings.gateway_password.is_empty() {
        action.set_status(false, "missing gateway credentials!?");
        action.finish(shared.clocks.realtime());
        return None;
    }

    let content = notification_content(rule_name);
    let mut data = serde_json::json!({
        "camLoc": camera,
        "ruleName": rule_name,
        "ms": ms.0,
    });
    let uid = match shared
        .response_db
        .add_push_notification(&content, &data.to_string())
    {
        Ok(uid) => uid,
        Err(e) => {
            action.set_status(false, format!("error storing push notification: {}", e.chain()));
            action.finish(shared.clocks.realtime());
            return None;
        }
    };
    // Send the pointer (uid) along: the full JSON can exceed the device
    // notification limit, and the gateway decides which form goes out.
    data["uid"] = uid.into();

    let params = [
        ("action", "createMessage".to_owned()),
        ("iosBadges", "+1".to_owned()),
        ("content", content),
        ("data", data.to_string()),
        ("guid", settings.gateway_guid.clone()),
        ("password", settings.gateway_password.clone()),
        ("svversionstring", VERSION_STRING.to_owned()),
    ];
    match shared.http.post_form(&shared.gateway_url, &params) {
        Ok((200, _)) => {
            action.set_status(true, "");
            action.finish(shared.clocks.realtime());
            return None;
        }
        Ok((status, body)) => {
            action.set_status(false, format!("sending failed, {status}: {body}"));
            if status != 500 {
                // Something fundamental is wrong; no point retrying.
                action.finish(shared.clocks.realtime());
                return None;
            }
        }
        Err(e) => {
            action.set_status(false, format!("invalid API response: {}", e.chain()));
        }
    }
    action.finish(shared.clocks.realtime());

    match notification_retry_at(&shared.clocks, try_num) {
        Some(at) => Some(at),
        None => {
            error!("maximum number of retries, giving up this push");
            None
        }
    }
}
