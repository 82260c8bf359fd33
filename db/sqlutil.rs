// This file is part of Argus NVR, a security camera network video recorder.
// Copyright (C) 2024 The Argus NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Shared transaction plumbing for the SQLite-backed indexes.

use base::clock::Clocks;
use base::Error;
use tracing::warn;

pub(crate) fn begin(conn: &rusqlite::Connection) -> Result<(), Error> {
    conn.execute_batch("begin").map_err(Into::into)
}

pub(crate) fn rollback(conn: &rusqlite::Connection) {
    if let Err(e) = conn.execute_batch("rollback") {
        warn!(err = %e, "rollback failed");
    }
}

fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if f.code == rusqlite::ErrorCode::DatabaseBusy
                || f.code == rusqlite::ErrorCode::DatabaseLocked
    )
}

/// Commits the open transaction. A busy database on commit is retried once
/// after a 200 ms pause; SQLite keeps the transaction alive across a busy
/// commit, so the retry is safe.
pub(crate) fn commit_with_retry<C: Clocks>(
    conn: &rusqlite::Connection,
    clocks: &C,
) -> Result<(), Error> {
    if let Err(e) = conn.execute_batch("commit") {
        if !is_busy(&e) {
            rollback(conn);
            return Err(e.into());
        }
        warn!(err = %e, "commit failed on busy database; retrying once");
        clocks.sleep(std::time::Duration::from_millis(200));
        if let Err(e) = conn.execute_batch("commit") {
            rollback(conn);
            return Err(e.into());
        }
    }
    Ok(())
}

pub(crate) fn in_transaction<C: Clocks, T>(
    conn: &rusqlite::Connection,
    clocks: &C,
    f: impl FnOnce() -> Result<T, Error>,
) -> Result<T, Error> {
    begin(conn)?;
    match f() {
        Ok(v) => {
            commit_with_retry(conn, clocks)?;
            Ok(v)
        }
        Err(e) => {
            rollback(conn);
            Err(e)
        }
    }
}
