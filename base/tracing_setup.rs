// This file is part of Argus NVR, a security camera network video recorder.
// Copyright (C) 2024 The Argus NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Logging via the `tracing` ecosystem.

use tracing_subscriber::EnvFilter;

fn default_filter() -> EnvFilter {
    EnvFilter::try_from_env("ARGUS_LOG").unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Installs the process-wide subscriber for normal operation.
pub fn install() {
    tracing_subscriber::fmt()
        .with_env_filter(default_filter())
        .with_thread_names(true)
        .init();
}

/// Installs a subscriber suitable for tests.
///
/// Unlike [`install`], this may be called more than once; later calls are
/// no-ops. Output is captured per-test by the libtest harness.
pub fn install_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(default_filter())
        .with_test_writer()
        .try_init();
}
