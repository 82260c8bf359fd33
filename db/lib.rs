// This file is part of Argus NVR, a security camera network video recorder.
// Copyright (C) 2024 The Argus NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Argus NVR's persistence layer: the clip index, the object index, and the
//! response database, all on SQLite, plus the range arithmetic they share.
//!
//! Each database assumes a single writer per process; readers in other
//! threads open their own handles against the same file. Multi-statement
//! operations run in explicit transactions whose commit is retried once on
//! a busy database.

pub mod clips;
pub mod objects;
pub mod ranges;
pub mod respdb;
mod sqlutil;

// This is only for #[cfg(test)], but it's also used by the dependent crate,
// and #[cfg(test)] is not passed on to dependencies.
pub mod testutil;

pub use clips::{CacheStatus, ClipIndex, ClipTags, Remuxer};
pub use objects::ObjectIndex;
pub use ranges::{compress_ranges, find_place_in_range_list, Placement};
pub use respdb::{PendingClip, ResponseDb, SharedResponseDb};
