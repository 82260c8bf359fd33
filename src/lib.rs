// This file is part of Argus NVR, a security camera network video recorder.
// Copyright (C) 2024 The Argus NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The Argus NVR engine: rule search over the clip and object indexes,
//! streaming (real-time) search, and the response pipeline that turns
//! search hits into external actions.
//!
//! Persistence lives in the `argus_db` crate; capture pipelines, codecs,
//! and the UI are external collaborators reached through the traits in
//! [`video`] and the channels in [`msg`].

pub mod msg;
pub mod query;
pub mod responses;
pub mod runner;
pub mod search;
pub mod streaming;
pub mod video;
