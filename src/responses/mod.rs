// This file is part of Argus NVR, a security camera network video recorder.
// Copyright (C) 2024 The Argus NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Rule-side responses: always-on consumers of streaming detection batches
//! that translate matches into supervisor messages (email, push, IFTTT,
//! webhook, clip uploads) or recording tags.
//!
//! Each response receives time-ordered batches: the high-water mark `ms`
//! of processed video plus the detection ranges for the new window.

pub mod email;
pub mod push;
pub mod record;
pub mod sendclip;
pub mod webhook;

pub use email::EmailResponse;
pub use push::{PushKind, PushResponse};
pub use record::RecordResponse;
pub use sendclip::{SendClipResponse, FTP_PROTOCOL, LOCAL_EXPORT_PROTOCOL, RECORD_TAG_PROTOCOL};
pub use webhook::WebhookResponse;

use crate::streaming::RangeDict;
use base::time::Time;

pub trait Response {
    /// Feeds one batch of detection ranges; `ms` is the most recent time
    /// that has been processed.
    fn add_ranges(&mut self, ms: Time, range_dict: &RangeDict);

    /// Nothing more is coming; emit anything held back.
    fn flush(&mut self) {}

    /// The camera's capture session restarted: frame counters reset and
    /// any cross-batch continuation state must not bridge the gap.
    fn start_new_session(&mut self) {}
}
