// This file is part of Argus NVR, a security camera network video recorder.
// Copyright (C) 2024 The Argus NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Time and durations for Argus NVR's internal format.
//!
//! Everything in the engine is integer milliseconds since the Unix epoch
//! (UTC). Calendar math (day bounds for searches) goes through a single
//! process-wide time zone so that a "day" honors DST transitions: a day can
//! be 23, 24, or 25 hours long.

use crate::{err, Error};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops;

pub const MS_PER_SEC: i64 = 1000;

/// The zone to use for all calendar handling.
///
/// In normal operation this is assigned from `jiff::tz::TimeZone::system()`
/// at startup, but tests set it to a known political time zone instead.
/// The zone is fixed for the entire run; day bounds computed at different
/// moments must agree with each other.
static GLOBAL_ZONE: std::sync::OnceLock<jiff::tz::TimeZone> = std::sync::OnceLock::new();

pub fn init_zone<F: FnOnce() -> jiff::tz::TimeZone>(f: F) {
    GLOBAL_ZONE.get_or_init(f);
}

pub fn global_zone() -> jiff::tz::TimeZone {
    GLOBAL_ZONE
        .get()
        .expect("global zone should be initialized")
        .clone()
}

/// A time specified as milliseconds since 1970-01-01 00:00:00 UTC,
/// excluding leap seconds.
#[derive(
    Clone, Copy, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(transparent)]
pub struct Time(pub i64);

impl Time {
    pub const MIN: Self = Time(i64::MIN);
    pub const MAX: Self = Time(i64::MAX);

    pub fn from_secs(secs: i64) -> Self {
        Time(secs * MS_PER_SEC)
    }

    /// Whole seconds since epoch, rounding toward negative infinity.
    pub fn unix_seconds(self) -> i64 {
        self.0.div_euclid(MS_PER_SEC)
    }
}

impl ops::Add<Duration> for Time {
    type Output = Time;
    fn add(self, rhs: Duration) -> Time {
        Time(self.0 + rhs.0)
    }
}

impl ops::AddAssign<Duration> for Time {
    fn add_assign(&mut self, rhs: Duration) {
        self.0 += rhs.0;
    }
}

impl ops::Sub<Duration> for Time {
    type Output = Time;
    fn sub(self, rhs: Duration) -> Time {
        Time(self.0 - rhs.0)
    }
}

impl ops::Sub<Time> for Time {
    type Output = Duration;
    fn sub(self, rhs: Time) -> Duration {
        Duration(self.0 - rhs.0)
    }
}

impl fmt::Debug for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(zone) = GLOBAL_ZONE.get() else {
            return write!(f, "{} /* uninitialized zone */", self.0);
        };
        match jiff::Timestamp::from_millisecond(self.0) {
            Ok(ts) => write!(f, "{}", ts.to_zoned(zone.clone()).strftime("%F %T%.3f %:z")),
            Err(_) => write!(f, "{} /* out of range */", self.0),
        }
    }
}

impl rusqlite::types::ToSql for Time {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        Ok(self.0.into())
    }
}

impl rusqlite::types::FromSql for Time {
    fn column_result(value: rusqlite::types::ValueRef) -> rusqlite::types::FromSqlResult<Self> {
        Ok(Time(value.as_i64()?))
    }
}

/// A signed duration in milliseconds.
#[derive(
    Clone, Copy, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(transparent)]
pub struct Duration(pub i64);

impl Duration {
    pub const ZERO: Self = Duration(0);

    pub fn from_secs(secs: i64) -> Self {
        Duration(secs * MS_PER_SEC)
    }

    pub fn from_mins(mins: i64) -> Self {
        Duration(mins * 60 * MS_PER_SEC)
    }
}

impl From<Duration> for std::time::Duration {
    fn from(d: Duration) -> Self {
        std::time::Duration::from_millis(d.0.max(0) as u64)
    }
}

impl ops::Add for Duration {
    type Output = Duration;
    fn add(self, rhs: Duration) -> Duration {
        Duration(self.0 + rhs.0)
    }
}

impl ops::AddAssign for Duration {
    fn add_assign(&mut self, rhs: Duration) {
        self.0 += rhs.0;
    }
}

impl ops::Sub for Duration {
    type Output = Duration;
    fn sub(self, rhs: Duration) -> Duration {
        Duration(self.0 - rhs.0)
    }
}

impl ops::Neg for Duration {
    type Output = Duration;
    fn neg(self) -> Duration {
        Duration(-self.0)
    }
}

impl fmt::Debug for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (neg, mut ms) = if self.0 < 0 {
            (true, -self.0)
        } else {
            (false, self.0)
        };
        if neg {
            f.write_str("-")?;
        }
        let secs = ms / MS_PER_SEC;
        ms %= MS_PER_SEC;
        if ms == 0 {
            write!(f, "{secs} s")
        } else {
            write!(f, "{secs}.{ms:03} s")
        }
    }
}

/// Returns `[midnight, next_midnight)` of `t`'s calendar day in the global
/// zone. `next_midnight - midnight` is typically 24 hours but may be 23 or
/// 25 across DST transitions.
pub fn day_bounds(t: Time) -> Result<(Time, Time), Error> {
    let zone = global_zone();
    let ts = jiff::Timestamp::from_millisecond(t.0)
        .map_err(|e| err!(OutOfRange, msg("time {} out of range", t.0), source(e)))?;
    let date = ts.to_zoned(zone.clone()).date();
    let start = date
        .to_zoned(zone.clone())
        .map_err(|e| err!(OutOfRange, source(e)))?;
    let next = date
        .tomorrow()
        .map_err(|e| err!(OutOfRange, source(e)))?
        .to_zoned(zone)
        .map_err(|e| err!(OutOfRange, source(e)))?;
    Ok((
        Time(start.timestamp().as_millisecond()),
        Time(next.timestamp().as_millisecond()),
    ))
}

pub mod testutil {
    /// Sets the global zone to a fixed political zone, so tests that care
    /// about calendar time get the expected results regardless of machine
    /// setup.
    pub fn init_zone() {
        super::init_zone(|| {
            jiff::tz::TimeZone::get("America/Los_Angeles").expect("tzdb has America/Los_Angeles")
        });
    }
}
