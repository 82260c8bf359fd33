// This file is part of Argus NVR, a security camera network video recorder.
// Copyright (C) 2024 The Argus NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Utilities for automated testing involving Argus NVR's persistence
//! library. Used for tests of both the `argus_db` crate itself and the
//! `argus_nvr` crate.

use base::clock::SimulatedClocks;
use base::time::{Duration, Time};
use base::Error;
use std::path::Path;

static INIT: std::sync::Once = std::sync::Once::new();

/// Performs global initialization for tests:
///
/// * set up logging. (Note the output can be confusing unless
///   `RUST_TEST_THREADS=1` is set in the program's environment prior to
///   running.)
/// * set time zone `America/Los_Angeles` so that tests that care about
///   calendar time get the expected results regardless of machine setup.
pub fn init() {
    INIT.call_once(|| {
        base::tracing_setup::install_for_tests();
        base::time::testutil::init_zone();
    });
}

pub fn clip_index(boot: Time) -> crate::ClipIndex<SimulatedClocks> {
    init();
    let conn = rusqlite::Connection::open_in_memory().expect("in-memory db");
    crate::ClipIndex::with_conn(SimulatedClocks::new(boot), conn).expect("clip index opens")
}

pub fn object_index(boot: Time) -> crate::ObjectIndex<SimulatedClocks> {
    init();
    let conn = rusqlite::Connection::open_in_memory().expect("in-memory db");
    crate::ObjectIndex::with_conn(SimulatedClocks::new(boot), conn).expect("object index opens")
}

pub fn response_db(boot: Time) -> crate::ResponseDb<SimulatedClocks> {
    init();
    let conn = rusqlite::Connection::open_in_memory().expect("in-memory db");
    crate::ResponseDb::with_conn(SimulatedClocks::new(boot), conn).expect("response db opens")
}

/// A [`crate::Remuxer`] double: pretends the source file has frames at a
/// fixed interval, and "remuxes" by copying bytes (or creating an empty
/// output).
pub struct FakeRemuxer {
    frames: Vec<Duration>,
    fail_remux: bool,
}

impl FakeRemuxer {
    /// Frames at `0, interval, 2*interval, ..` up to and including `total`.
    pub fn with_frame_interval(total: Duration, interval: Duration) -> Self {
        assert!(interval.0 > 0);
        let mut frames = Vec::new();
        let mut t = 0;
        while t <= total.0 {
            frames.push(Duration(t));
            t += interval.0;
        }
        FakeRemuxer {
            frames,
            fail_remux: false,
        }
    }

    /// Knows the file's frames but fails every remux, for the
    /// preserve-original-on-error paths.
    pub fn failing() -> Self {
        let mut r = Self::with_frame_interval(Duration(60_000), Duration(1_000));
        r.fail_remux = true;
        r
    }
}

impl crate::Remuxer for FakeRemuxer {
    fn remux_sub_clip(
        &self,
        src: &Path,
        dst: &Path,
        start_offset: Duration,
        _end_offset: Duration,
    ) -> Result<Duration, Error> {
        if self.fail_remux {
            return Err(base::err!(Unavailable, msg("remux forced to fail")));
        }
        match std::fs::copy(src, dst) {
            Ok(_) => {}
            Err(_) => std::fs::write(dst, b"").map_err(Error::from)?,
        }
        // The first recoverable frame at or after the requested offset.
        Ok(self
            .frames
            .iter()
            .copied()
            .find(|&f| f >= start_offset)
            .unwrap_or(start_offset))
    }

    fn frame_times(&self, _src: &Path) -> Result<Vec<Duration>, Error> {
        Ok(self.frames.clone())
    }
}
