// This file is part of Argus NVR, a security camera network video recorder.
// Copyright (C) 2024 The Argus NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Telemetry for one outstanding response action, logged as a single
//! completion summary line.

use base::time::Time;
use tracing::{error, info};

pub(crate) struct ActionContext {
    action_name: &'static str,
    camera: String,
    rule_name: String,
    event_time: Time,
    event_duration: Option<i64>,
    attempt: u32,
    uri: Option<String>,
    action_start: Time,
    success: bool,
    descr: String,
}

impl ActionContext {
    #[allow(clippy::too_many_arguments)]
    pub fn begin(
        action_name: &'static str,
        camera: &str,
        rule_name: &str,
        event_time: Time,
        event_duration: Option<i64>,
        attempt: u32,
        uri: Option<String>,
        now: Time,
    ) -> Self {
        ActionContext {
            action_name,
            camera: camera.to_owned(),
            rule_name: rule_name.to_owned(),
            event_time,
            event_duration,
            attempt,
            uri,
            action_start: now,
            success: false,
            descr: String::new(),
        }
    }

    pub fn set_status(&mut self, success: bool, descr: impl Into<String>) {
        self.success = success;
        self.descr = descr.into();
    }

    /// Emits the completion summary, e.g. `send email (2) for People in
    /// Door has completed successfully in 842ms. triggerDelay=1200`.
    pub fn finish(&self, now: Time) {
        let duration = (now - self.action_start).0;
        let status = if self.success {
            "completed successfully"
        } else {
            "failed"
        };
        let mut line = format!(
            "{} ({}) for {} in {} has {} in {}ms. triggerDelay={}",
            self.action_name,
            self.attempt,
            self.rule_name,
            self.camera,
            status,
            duration,
            (self.action_start - self.event_time).0,
        );
        if let Some(d) = self.event_duration {
            line.push_str(&format!(" evtDuration={d}"));
        }
        if let Some(uri) = &self.uri {
            line.push_str(&format!(" uri={uri}"));
        }
        if !self.descr.is_empty() {
            line.push(' ');
            line.push_str(&self.descr);
        }
        if self.success {
            info!("{line}");
        } else {
            error!("{line}");
        }
    }
}
