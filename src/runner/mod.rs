// This file is part of Argus NVR, a security camera network video recorder.
// Copyright (C) 2024 The Argus NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The response runner: the supervisor message loop, its per-channel
//! handlers, and the dedicated clip-sender threads.

mod action;
pub mod context;
pub mod email;
pub mod ifttt;
pub mod push;
pub mod sendclip;
pub mod services;
pub mod supervisor;
pub mod webhook;

pub use context::ExecutionContext;
pub use supervisor::{Supervisor, SupervisorOptions};

use base::clock::Clocks;
use base::shutdown;
use base::time::Time;
use crossbeam_channel::Sender;
use db::clips::ClipIndex;
use tracing::{debug, info};

use crate::msg::EngineEvent;

/// Fixed retry schedule for push and IFTTT sends, in seconds.
pub(crate) const NOTIFICATION_RETRIES_SECS: [i64; 4] = [2, 4, 20, 90];

/// Blocks until the clip index covers `camera` through `ms`, or the
/// deadline / shutdown hits.
///
/// With `need_flush`, asks the capture pipeline to flush first (callers
/// pass it on their first attempt only, so retries don't spam flushes).
pub(crate) fn wait_until_video_available<C: Clocks>(
    clips: &ClipIndex<C>,
    shutdown: Option<&shutdown::Receiver>,
    need_flush: bool,
    camera: &str,
    ms: Time,
    backend_tx: &Sender<EngineEvent>,
    max_delay: std::time::Duration,
    poll_delay: std::time::Duration,
    clocks: &C,
) -> bool {
    let available = |clips: &ClipIndex<C>| {
        clips
            .get_most_recent_time_at(camera)
            .ok()
            .flatten()
            .is_some_and(|t| t >= ms)
    };
    if available(clips) {
        return true;
    }
    if need_flush {
        info!(camera, ms = ms.0, "requesting flush");
        let _ = backend_tx.send(EngineEvent::FlushVideo {
            camera: camera.to_owned(),
            ms: Some(ms),
        });
    }
    let start = clocks.monotonic();
    while clocks.monotonic().saturating_sub(start) < max_delay {
        if available(clips) {
            debug!(
                camera,
                waited = ?clocks.monotonic().saturating_sub(start),
                "video became available"
            );
            return true;
        }
        match shutdown {
            Some(rx) => {
                if rx.wait_for(poll_delay).is_err() {
                    return false;
                }
            }
            None => clocks.sleep(poll_delay),
        }
    }
    available(clips)
}
