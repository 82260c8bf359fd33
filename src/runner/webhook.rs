// This file is part of Argus NVR, a security camera network video recorder.
// Copyright (C) 2024 The Argus NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The webhook send handler. Webhooks go to user-controlled endpoints and
//! are never retried: a 4xx won't fix itself, and re-POSTing side effects
//! is worse than dropping one.

use base::clock::Clocks;
use base::time::Time;

use crate::runner::action::ActionContext;
use crate::runner::supervisor::WorkerShared;

#[allow(clippy::too_many_arguments)]
pub(crate) fn process_webhook<C: Clocks + Clone>(
    shared: &WorkerShared<C>,
    try_num: u32,
    camera: &str,
    rule_name: &str,
    uri: &str,
    ms: Time,
    content_type: &str,
    content: &str,
) -> Option<Time> {
    let mut action = ActionContext::begin(
        "webhook trigger",
        camera,
        rule_name,
        ms,
        None,
        try_num,
        Some(uri.to_owned()),
        shared.clocks.realtime(),
    );

    match shared.http.post(uri, content_type, content, &[]) {
        Ok((200, _)) => action.set_status(true, ""),
        Ok((status, body)) => {
            action.set_status(false, format!("{status}: {body} ({content})"))
        }
        Err(e) => action.set_status(false, e.chain().to_string()),
    }
    action.finish(shared.clocks.realtime());

    // Never retry webhooks.
    None
}
