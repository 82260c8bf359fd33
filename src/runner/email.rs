// This file is part of Argus NVR, a security camera network video recorder.
// Copyright (C) 2024 The Argus NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The email send handler: builds the MIME message (body plus a thumbnail
//! of the event) and submits it over SMTP.

use base::clock::Clocks;
use base::time::{Duration, Time};
use tracing::warn;

use crate::msg::{EmailSettings, ResponseConfig};
use crate::runner::action::ActionContext;
use crate::runner::services::{format_local, OutgoingEmail};
use crate::runner::supervisor::WorkerShared;
use crate::runner::{wait_until_video_available, ExecutionContext};

pub const DEFAULT_NOTIFICATION_SUBJECT: &str = "Video event alert";

/// How long we'll keep trying to get the thumbnail.
const GET_IMAGE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(2);
const GET_IMAGE_RETRY_SLEEP: std::time::Duration = std::time::Duration::from_millis(500);

/// How long we'll keep trying to send.
const SEND_EMAIL_NUM_TRIES: u32 = 3;
const SEND_EMAIL_RETRY_SLEEP: Duration = Duration(120 * 1000);

const NOT_CONFIGURED: &str = "Email response requested, but email is not configured.";

#[allow(clippy::too_many_arguments)]
pub(crate) fn process_send_email<C: Clocks + Clone>(
    shared: &WorkerShared<C>,
    ctx: &mut ExecutionContext<C>,
    try_num: u32,
    rule_name: &str,
    camera: &str,
    email_settings: &EmailSettings,
    config: &ResponseConfig,
    num_triggers: usize,
    obj_list: &[i64],
    first: Time,
    last: Time,
    message_id: &str,
) -> Option<Time> {
    let preview = Time((first.0 + last.0) / 2);

    // First priority is the per-rule config; fall back to the site-wide
    // setting.
    let to_addrs = config
        .to_addrs
        .clone()
        .unwrap_or_else(|| email_settings.to_addrs.clone());
    let subject = config
        .subject
        .clone()
        .unwrap_or_else(|| DEFAULT_NOTIFICATION_SUBJECT.to_owned());

    let mut action = ActionContext::begin(
        "send email",
        camera,
        rule_name,
        first,
        Some((last - first).0),
        try_num,
        Some(to_addrs.clone()),
        shared.clocks.realtime(),
    );

    if to_addrs.trim().is_empty() {
        action.set_status(false, NOT_CONFIGURED);
        action.finish(shared.clocks.realtime());
        return None;
    }

    if !wait_until_video_available(
        &ctx.clips,
        None,
        false,
        camera,
        preview,
        &shared.backend_tx,
        GET_IMAGE_TIMEOUT,
        GET_IMAGE_RETRY_SLEEP,
        &shared.clocks,
    ) {
        action.set_status(false, "image isn't available yet");
        action.finish(shared.clocks.realtime());
        return super::push::notification_retry_at(&shared.clocks, try_num);
    }

    let attachment = match shared
        .frame_source
        .single_frame_jpeg(camera, preview, obj_list, config.max_res)
    {
        Ok(img) => Some((
            format!(
                "{camera}-{}-{}.jpg",
                format_local(preview, "%Y-%m-%d"),
                format_local(preview, "%H-%M-%S")
            ),
            img,
        )),
        Err(e) => {
            warn!(
                rule = rule_name,
                camera,
                ts = preview.0,
                err = %e.chain(),
                "failed to get image to email"
            );
            None
        }
    };

    let time_str = format_local(first, "%H:%M:%S");
    let date_str = format_local(first, "%Y-%m-%d");
    let body = if num_triggers == 1 {
        format!("The rule \"{rule_name}\" triggered a video event at {time_str} on {date_str}.\n\n")
    } else {
        format!(
            "The rule \"{rule_name}\" triggered {num_triggers} video events at {time_str} on {date_str}.\n\n"
        )
    };

    let email = OutgoingEmail {
        to_addrs,
        subject,
        body,
        message_id: message_id.to_owned(),
        attachment,
    };
    match shared.mailer.send(email_settings, &email) {
        Ok(()) => {
            action.set_status(true, format!("objs={obj_list:?}"));
            action.finish(shared.clocks.realtime());
            None
        }
        Err(e) => {
            let now = shared.clocks.realtime();
            if try_num < SEND_EMAIL_NUM_TRIES {
                let tries_left = SEND_EMAIL_NUM_TRIES - try_num;
                action.set_status(
                    false,
                    format!("will retry {tries_left} time(s): {}", e.chain()),
                );
                action.finish(now);
                Some(now + SEND_EMAIL_RETRY_SLEEP)
            } else {
                action.set_status(false, format!("{}", e.chain()));
                action.finish(now);
                None
            }
        }
    }
}
