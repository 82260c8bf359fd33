// This file is part of Argus NVR, a security camera network video recorder.
// Copyright (C) 2024 The Argus NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Per-thread execution contexts.
//!
//! The index handles aren't shared across threads; every threaded entity
//! (worker, sender) gets its own pair opened against the same files, which
//! also keeps camera-filter state thread-local.

use base::clock::Clocks;
use base::Error;
use db::clips::ClipIndex;
use db::objects::ObjectIndex;
use std::path::PathBuf;

pub struct ExecutionContext<C: Clocks + Clone> {
    pub clips: ClipIndex<C>,
    pub objects: ObjectIndex<C>,

    clocks: C,
    clip_db_path: PathBuf,
    object_db_path: PathBuf,
}

impl<C: Clocks + Clone> ExecutionContext<C> {
    pub fn open(clocks: C, clip_db_path: PathBuf, object_db_path: PathBuf) -> Result<Self, Error> {
        let clips = ClipIndex::open(clocks.clone(), &clip_db_path)?;
        let objects = ObjectIndex::open(clocks.clone(), &object_db_path)?;
        Ok(ExecutionContext {
            clips,
            objects,
            clocks,
            clip_db_path,
            object_db_path,
        })
    }

    /// Opens a fresh context against the same databases, for handing to a
    /// new thread.
    pub fn try_clone(&self) -> Result<Self, Error> {
        Self::open(
            self.clocks.clone(),
            self.clip_db_path.clone(),
            self.object_db_path.clone(),
        )
    }

    pub fn clocks(&self) -> &C {
        &self.clocks
    }
}
