// This file is part of Argus NVR, a security camera network video recorder.
// Copyright (C) 2024 The Argus NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Clock interface and implementations for testability.

use std::sync::Arc;
use std::thread;
use std::time::Duration as StdDuration;
use tracing::warn;

use crate::shutdown::ShutdownError;
use crate::time::Time;
use crate::Error;
use crate::Mutex;

/// Abstract interface to the system clocks. This is for testability.
pub trait Clocks: Send + Sync + 'static {
    /// Gets the current wall time in milliseconds since the Unix epoch.
    fn realtime(&self) -> Time;

    /// Gets the elapsed time from a monotonic clock with an arbitrary epoch.
    fn monotonic(&self) -> StdDuration;

    /// Causes the current thread to sleep for the specified time.
    fn sleep(&self, how_long: StdDuration);
}

/// Calls `f` until it succeeds, sleeping 1 s between attempts; aborts when
/// shutdown is signalled.
pub fn retry<C, T, E>(
    clocks: &C,
    shutdown_rx: &crate::shutdown::Receiver,
    f: &mut dyn FnMut() -> Result<T, E>,
) -> Result<T, ShutdownError>
where
    C: Clocks,
    E: Into<Error>,
{
    loop {
        let e = match f() {
            Ok(t) => return Ok(t),
            Err(e) => e.into(),
        };
        shutdown_rx.check()?;
        warn!(err = %e.chain(), "sleeping for 1 s after error");
        clocks.sleep(StdDuration::from_secs(1));
    }
}

#[derive(Copy, Clone, Default)]
pub struct RealClocks;

impl Clocks for RealClocks {
    fn realtime(&self) -> Time {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock is after 1970");
        Time(now.as_millis() as i64)
    }

    fn monotonic(&self) -> StdDuration {
        static EPOCH: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();
        let epoch = *EPOCH.get_or_init(std::time::Instant::now);
        std::time::Instant::now().duration_since(epoch)
    }

    fn sleep(&self, how_long: StdDuration) {
        thread::sleep(how_long)
    }
}

/// Logs a warning if the `TimerGuard` lives "too long", using the label
/// created by a supplied function.
pub struct TimerGuard<'a, C: Clocks + ?Sized, S: AsRef<str>, F: FnOnce() -> S + 'a> {
    clocks: &'a C,
    label_f: Option<F>,
    start: StdDuration,
}

impl<'a, C: Clocks + ?Sized, S: AsRef<str>, F: FnOnce() -> S + 'a> TimerGuard<'a, C, S, F> {
    pub fn new(clocks: &'a C, label_f: F) -> Self {
        TimerGuard {
            clocks,
            label_f: Some(label_f),
            start: clocks.monotonic(),
        }
    }
}

impl<'a, C, S, F> Drop for TimerGuard<'a, C, S, F>
where
    C: Clocks + ?Sized,
    S: AsRef<str>,
    F: FnOnce() -> S + 'a,
{
    fn drop(&mut self) {
        let elapsed = self.clocks.monotonic().saturating_sub(self.start);
        if elapsed.as_secs() >= 1 {
            let label_f = self.label_f.take().expect("label taken only on drop");
            warn!("{} took {:?}!", label_f().as_ref(), elapsed);
        }
    }
}

/// Simulated clock for testing.
#[derive(Clone)]
pub struct SimulatedClocks(Arc<SimulatedClocksInner>);

struct SimulatedClocksInner {
    boot: Time,
    uptime: Mutex<StdDuration>,
}

impl SimulatedClocks {
    pub fn new(boot: Time) -> Self {
        SimulatedClocks(Arc::new(SimulatedClocksInner {
            boot,
            uptime: Mutex::new(StdDuration::ZERO),
        }))
    }
}

impl Clocks for SimulatedClocks {
    fn realtime(&self) -> Time {
        let uptime = *self.0.uptime.lock();
        Time(self.0.boot.0 + uptime.as_millis() as i64)
    }

    fn monotonic(&self) -> StdDuration {
        *self.0.uptime.lock()
    }

    /// Advances the clock by the specified amount without actually sleeping.
    fn sleep(&self, how_long: StdDuration) {
        let mut l = self.0.uptime.lock();
        *l += how_long;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_advances() {
        let c = SimulatedClocks::new(Time(1_000));
        assert_eq!(c.realtime(), Time(1_000));
        c.sleep(StdDuration::from_millis(2_500));
        assert_eq!(c.realtime(), Time(3_500));
        assert_eq!(c.monotonic(), StdDuration::from_millis(2_500));
    }
}
