// This file is part of Argus NVR, a security camera network video recorder.
// Copyright (C) 2024 The Argus NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Interfaces to the external video collaborators: the capture pipeline
//! (flush) and the video toolkit (clip extraction, thumbnails). The engine
//! never decodes video itself.

use base::time::Time;
use base::Error;
use std::path::Path;

/// What the capture pipeline reports after a flush request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlushInfo {
    /// Last ms whose frames have been processed for detection.
    pub last_processed: Time,

    /// Last ms durably on disk and represented in the clip index.
    pub last_tagged: Time,
}

/// Synchronous flush interface to the capture pipeline.
pub trait Flusher: Send + Sync {
    fn flush(&self, camera: &str) -> FlushInfo;
}

/// Retrieves a single representative frame as an encoded JPEG, for email
/// thumbnails. `max_height` bounds the output size.
pub trait FrameSource: Send + Sync {
    fn single_frame_jpeg(
        &self,
        camera: &str,
        ms: Time,
        obj_uids: &[i64],
        max_height: i32,
    ) -> Result<Vec<u8>, Error>;
}

/// Produces a standalone clip file from stored video, remuxing across file
/// boundaries as needed. Returns the actual `(first, last)` ms written,
/// which may be narrower than requested when video is missing at the
/// edges.
pub trait ClipExtractor: Send + Sync {
    fn save_clip(
        &self,
        camera: &str,
        start: Time,
        stop: Time,
        play_start: Time,
        resolution: (i32, i32),
        dst: &Path,
    ) -> Result<(Time, Time), Error>;
}

/// Test doubles for the collaborator traits.
pub mod testutil {
    use super::*;
    use base::Mutex;

    /// Reports a fixed flush state and records which cameras were flushed.
    #[derive(Default)]
    pub struct FakeFlusher {
        pub info: FlushInfo,
        pub flushed: Mutex<Vec<String>>,
    }

    impl FakeFlusher {
        pub fn new(last_processed: Time, last_tagged: Time) -> Self {
            FakeFlusher {
                info: FlushInfo {
                    last_processed,
                    last_tagged,
                },
                flushed: Mutex::new(Vec::new()),
            }
        }
    }

    impl Flusher for FakeFlusher {
        fn flush(&self, camera: &str) -> FlushInfo {
            self.flushed.lock().push(camera.to_owned());
            self.info
        }
    }

    /// Hands back a canned JPEG-ish payload.
    pub struct FakeFrameSource;

    impl FrameSource for FakeFrameSource {
        fn single_frame_jpeg(
            &self,
            _camera: &str,
            _ms: Time,
            _obj_uids: &[i64],
            _max_height: i32,
        ) -> Result<Vec<u8>, Error> {
            Ok(b"\xff\xd8fakejpeg\xff\xd9".to_vec())
        }
    }

    /// Writes a placeholder file and echoes the requested bounds.
    pub struct FakeClipExtractor;

    impl ClipExtractor for FakeClipExtractor {
        fn save_clip(
            &self,
            _camera: &str,
            start: Time,
            stop: Time,
            _play_start: Time,
            _resolution: (i32, i32),
            dst: &Path,
        ) -> Result<(Time, Time), Error> {
            std::fs::write(dst, b"fake clip")?;
            Ok((start, stop))
        }
    }
}
