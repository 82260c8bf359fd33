// This file is part of Argus NVR, a security camera network video recorder.
// Copyright (C) 2024 The Argus NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The response database: a durable FIFO of pending send-clip jobs
//! (partitioned by protocol) and the store of push-notification payloads a
//! mobile client can fetch later by uid when the inline payload exceeded
//! the gateway's size limit.

use base::clock::Clocks;
use base::time::{Duration, Time};
use base::{err, Error, Mutex};
use rusqlite::{named_params, params, OptionalExtension as _};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

const CREATE_TABLES_SQL: &str = r#"
    create table if not exists pendingClips (
      uid integer primary key,
      protocol text,
      camLoc text,
      ruleName text,
      startTime integer,
      stopTime integer,
      playStart integer,
      previewMs integer,
      objList text,
      startList text
    );
    create index if not exists IDX_PENDING_CLIPS_PROTOCOL on pendingClips (protocol, uid);
    create table if not exists notifications (
      uid integer primary key,
      content text,
      payload text,
      createdAt integer
    )
"#;

const INSERT_CLIP_SQL: &str = r#"
    insert into pendingClips (protocol,  camLoc,  ruleName,  startTime,  stopTime,
                              playStart,  previewMs,  objList,  startList)
                      values (:protocol, :camLoc, :ruleName, :startTime, :stopTime,
                              :playStart, :previewMs, :objList, :startList)
"#;

const NEXT_CLIP_SQL: &str = r#"
    select uid, protocol, camLoc, ruleName, startTime, stopTime,
           playStart, previewMs, objList, startList
    from pendingClips
    where protocol = :protocol
    order by uid
    limit 1
"#;

/// A queued send-clip job.
#[derive(Clone, Debug, PartialEq)]
pub struct PendingClip {
    pub uid: i64,
    pub protocol: String,
    pub camera: String,
    pub rule_name: String,
    pub start_time: Time,
    pub stop_time: Time,
    pub play_start: Time,
    pub preview_ms: Time,
    pub obj_list: Vec<i64>,
    pub start_list: Vec<Time>,
}

pub struct ResponseDb<C: Clocks> {
    conn: rusqlite::Connection,
    clocks: C,
}

impl<C: Clocks> ResponseDb<C> {
    pub fn open(clocks: C, path: &Path) -> Result<Self, Error> {
        let conn = rusqlite::Connection::open(path).map_err(|e| {
            err!(Unavailable, msg("can't open response db {}", path.display()), source(e))
        })?;
        Self::with_conn(clocks, conn)
    }

    pub fn with_conn(clocks: C, conn: rusqlite::Connection) -> Result<Self, Error> {
        conn.query_row("pragma journal_mode = persist", [], |_| Ok(()))?;
        if let Err(e) = conn.execute_batch(CREATE_TABLES_SQL) {
            info!(err = %e, "assuming concurrent schema creation");
        }
        Ok(ResponseDb { conn, clocks })
    }

    pub fn add_clip_to_send(&mut self, clip: &PendingClip) -> Result<i64, Error> {
        let mut stmt = self.conn.prepare_cached(INSERT_CLIP_SQL)?;
        stmt.execute(named_params! {
            ":protocol": clip.protocol,
            ":camLoc": clip.camera,
            ":ruleName": clip.rule_name,
            ":startTime": clip.start_time,
            ":stopTime": clip.stop_time,
            ":playStart": clip.play_start,
            ":previewMs": clip.preview_ms,
            ":objList": serde_json::to_string(&clip.obj_list).expect("obj list to JSON"),
            ":startList": serde_json::to_string(&clip.start_list).expect("start list to JSON"),
        })?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn are_responses_pending(&self, protocol: &str) -> Result<bool, Error> {
        let mut stmt = self
            .conn
            .prepare_cached("select uid from pendingClips where protocol = ?1 limit 1")?;
        Ok(stmt.exists(params![protocol])?)
    }

    /// The oldest pending job for `protocol`; jobs are sent in enqueue
    /// order.
    pub fn get_next_clip_to_send(&self, protocol: &str) -> Result<Option<PendingClip>, Error> {
        let mut stmt = self.conn.prepare_cached(NEXT_CLIP_SQL)?;
        stmt.query_row(named_params! {":protocol": protocol}, |row| {
            let obj_list: String = row.get(8)?;
            let start_list: String = row.get(9)?;
            Ok(PendingClip {
                uid: row.get(0)?,
                protocol: row.get(1)?,
                camera: row.get(2)?,
                rule_name: row.get(3)?,
                start_time: row.get(4)?,
                stop_time: row.get(5)?,
                play_start: row.get(6)?,
                preview_ms: row.get(7)?,
                obj_list: serde_json::from_str(&obj_list).unwrap_or_default(),
                start_list: serde_json::from_str(&start_list).unwrap_or_default(),
            })
        })
        .optional()
        .map_err(Into::into)
    }

    /// Retires a job after a send attempt concluded (successfully or by
    /// giving up). The delete is atomic; a crash before it leaves the job
    /// queued for redelivery.
    pub fn clip_done(&mut self, uid: i64, was_sent: bool) -> Result<(), Error> {
        if !was_sent {
            info!(uid, "dropping unsendable clip job");
        }
        self.conn
            .execute("delete from pendingClips where uid = ?1", params![uid])?;
        Ok(())
    }

    /// Stores a push notification's payload, returning the uid the mobile
    /// client can fetch it by.
    pub fn add_push_notification(&mut self, content: &str, payload: &str) -> Result<i64, Error> {
        let mut stmt = self.conn.prepare_cached(
            "insert into notifications (content, payload, createdAt) values (?1, ?2, ?3)",
        )?;
        stmt.execute(params![content, payload, self.clocks.realtime()])?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Deletes up to `max_rows` stored notifications older than `max_age`,
    /// returning how many went.
    pub fn purge_push_notifications(
        &mut self,
        max_age: Duration,
        max_rows: usize,
    ) -> Result<usize, Error> {
        let cutoff = self.clocks.realtime() - max_age;
        let n = self.conn.execute(
            "delete from notifications where uid in \
             (select uid from notifications where createdAt < ?1 order by uid limit ?2)",
            params![cutoff, max_rows as i64],
        )?;
        Ok(n)
    }
}

/// Thread-safe handle shared by the sender threads and the supervisor.
pub struct SharedResponseDb<C: Clocks>(Arc<Mutex<ResponseDb<C>>>);

impl<C: Clocks> Clone for SharedResponseDb<C> {
    fn clone(&self) -> Self {
        SharedResponseDb(self.0.clone())
    }
}

impl<C: Clocks> SharedResponseDb<C> {
    pub fn new(db: ResponseDb<C>) -> Self {
        SharedResponseDb(Arc::new(Mutex::new(db)))
    }

    pub fn are_responses_pending(&self, protocol: &str) -> Result<bool, Error> {
        self.0.lock().are_responses_pending(protocol)
    }

    pub fn get_next_clip_to_send(&self, protocol: &str) -> Result<Option<PendingClip>, Error> {
        self.0.lock().get_next_clip_to_send(protocol)
    }

    pub fn add_clip_to_send(&self, clip: &PendingClip) -> Result<i64, Error> {
        self.0.lock().add_clip_to_send(clip)
    }

    pub fn clip_done(&self, uid: i64, was_sent: bool) -> Result<(), Error> {
        self.0.lock().clip_done(uid, was_sent)
    }

    pub fn add_push_notification(&self, content: &str, payload: &str) -> Result<i64, Error> {
        self.0.lock().add_push_notification(content, payload)
    }

    pub fn purge_push_notifications(&self, max_age: Duration, max_rows: usize) -> Result<usize, Error> {
        self.0.lock().purge_push_notifications(max_age, max_rows)
    }

    /// Acquires the lock and never releases it. Shutdown-only: a lingering
    /// sender thread blocks here instead of writing to a database that is
    /// being closed out from under it.
    pub fn lock_forever(&self) {
        std::mem::forget(self.0.lock());
    }
}
