// This file is part of Argus NVR, a security camera network video recorder.
// Copyright (C) 2024 The Argus NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The IFTTT trigger handler.

use base::clock::Clocks;
use base::time::Time;

use crate::runner::action::ActionContext;
use crate::runner::push::notification_retry_at;
use crate::runner::services::ifttt_trigger;
use crate::runner::supervisor::WorkerShared;

pub(crate) fn process_ifttt<C: Clocks + Clone>(
    shared: &WorkerShared<C>,
    try_num: u32,
    camera: &str,
    rule_name: &str,
    epoch_secs: i64,
) -> Option<Time> {
    let mut action = ActionContext::begin(
        "IFTTT trigger",
        camera,
        rule_name,
        Time::from_secs(epoch_secs),
        None,
        try_num,
        None,
        shared.clocks.realtime(),
    );

    let ok = match ifttt_trigger(shared.http.as_ref(), &shared.auth, camera, rule_name, epoch_secs)
    {
        Ok((status, _)) if (200..300).contains(&status) => {
            action.set_status(true, "");
            true
        }
        Ok((status, body)) => {
            action.set_status(false, format!("{status}: {body}"));
            false
        }
        Err(e) => {
            action.set_status(false, e.chain().to_string());
            false
        }
    };
    action.finish(shared.clocks.realtime());

    if ok {
        return None;
    }
    notification_retry_at(&shared.clocks, try_num)
}
