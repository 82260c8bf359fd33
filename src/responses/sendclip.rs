// This file is part of Argus NVR, a security camera network video recorder.
// Copyright (C) 2024 The Argus NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Clip-upload responses (FTP and local export): accumulates streaming
//! detections and, once a clip is final, queues it in the durable response
//! database for the matching sender thread.

use base::clock::Clocks;
use base::time::{Duration, Time};
use crossbeam_channel::Sender;
use db::respdb::{PendingClip, SharedResponseDb};
use tracing::{error, warn};

use crate::msg::Message;
use crate::responses::Response;
use crate::search::MatchingClip;
use crate::streaming::{RangeDict, StreamingAssembler};

pub const FTP_PROTOCOL: &str = "ftp";
pub const LOCAL_EXPORT_PROTOCOL: &str = "localExport";
pub const RECORD_TAG_PROTOCOL: &str = "recordTag";

pub struct SendClipResponse<C: Clocks> {
    protocol: &'static str,
    rule_name: String,
    camera: String,
    response_db: SharedResponseDb<C>,
    runner_tx: Sender<Message>,
    assembler: StreamingAssembler,
}

impl<C: Clocks> SendClipResponse<C> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        protocol: &'static str,
        rule_name: String,
        camera: String,
        response_db: SharedResponseDb<C>,
        runner_tx: Sender<Message>,
        play_offset: Duration,
        preserve_play_offset: bool,
        start_offset: Duration,
        stop_offset: Duration,
        should_combine_clips: bool,
    ) -> Self {
        SendClipResponse {
            protocol,
            rule_name,
            camera,
            response_db,
            runner_tx,
            assembler: StreamingAssembler::new(
                play_offset,
                preserve_play_offset,
                start_offset,
                stop_offset,
                should_combine_clips,
            ),
        }
    }

    fn send_out_clip(&self, clip: MatchingClip) {
        let pending = PendingClip {
            uid: 0,
            protocol: self.protocol.to_owned(),
            camera: self.camera.clone(),
            rule_name: self.rule_name.clone(),
            start_time: clip.start_time,
            stop_time: clip.stop_time,
            play_start: clip.play_start,
            preview_ms: clip.preview_ms,
            obj_list: clip.obj_list,
            start_list: clip.start_list,
        };
        if let Err(e) = self.response_db.add_clip_to_send(&pending) {
            error!(err = %e.chain(), "couldn't queue clip to send");
            return;
        }
        // Just a wakeup; the job itself travels through the database.
        if self.runner_tx.send(Message::SendClip).is_err() {
            warn!("response runner queue is gone");
        }
    }
}

impl<C: Clocks> Response for SendClipResponse<C> {
    fn add_ranges(&mut self, ms: Time, range_dict: &RangeDict) {
        for clip in self.assembler.add_ranges(Some(ms), range_dict) {
            self.send_out_clip(clip);
        }
    }

    /// Nothing more will be given (e.g. the camera turned off); emit what
    /// remains even though its padding may be short.
    fn flush(&mut self) {
        for clip in self.assembler.flush() {
            self.send_out_clip(clip);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    #[test]
    fn queues_final_clips_and_wakes_runner() {
        let db = db::testutil::response_db(Time(1_000_000));
        let shared = SharedResponseDb::new(db);
        let (tx, rx) = unbounded();
        let mut r = SendClipResponse::new(
            FTP_PROTOCOL,
            "People".to_owned(),
            "Door".to_owned(),
            shared.clone(),
            tx,
            Duration::ZERO,
            false,
            Duration(1_000),
            Duration(1_000),
            true,
        );

        const T0: i64 = 1_600_000_000_000;
        let mut dict = RangeDict::new();
        dict.entry(7)
            .or_default()
            .push(((10, Time(T0 + 1_000)), (20, Time(T0 + 3_000))));
        r.add_ranges(Time(T0 + 3_000), &dict);
        // Still extendable: nothing queued yet.
        assert!(!shared.are_responses_pending(FTP_PROTOCOL).unwrap());

        r.flush();
        assert!(matches!(rx.try_recv(), Ok(Message::SendClip)));
        let job = shared.get_next_clip_to_send(FTP_PROTOCOL).unwrap().unwrap();
        assert_eq!(job.camera, "Door");
        assert_eq!(job.rule_name, "People");
        assert_eq!(job.obj_list, vec![7]);
        assert_eq!(job.start_time, Time(T0));
        assert_eq!(job.stop_time, Time(T0 + 4_000));
    }
}
