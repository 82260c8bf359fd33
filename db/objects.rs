// This file is part of Argus NVR, a security camera network video recorder.
// Copyright (C) 2024 The Argus NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The object index: per-camera tracked objects, their bounding-box time
//! series, and their labeled action intervals.
//!
//! Bounding boxes are stored in a normalized 320×240 reference frame;
//! callers rescale with the processing size active at the row's time when
//! drawing onto stored video.
//!
//! Filter state (camera set, target/action list, minimum size) is held on
//! the index instance, not persisted, and is not shared across threads:
//! each worker clones its own execution context and sets/clears filters
//! around each logical query.

use base::clock::Clocks;
use base::time::{Duration, Time};
use base::{err, Error, FastHashMap};
use rusqlite::types::Value;
use rusqlite::{named_params, params, params_from_iter, OptionalExtension as _};
use std::path::Path;
use tracing::{error, info, warn};

/// The normalized coordinate system all bounding boxes live in.
pub const COORD_WIDTH: i32 = 320;
pub const COORD_HEIGHT: i32 = 240;

/// Never remove an object whose motion stopped within this window; it
/// could still have pending data in flight.
const OBJECT_SAVE_BUFFER: Duration = Duration(10 * 60 * 1000);

/// `tidy_object_table` skips objects younger than this relative to the
/// newest object, so a race between `add_object` and the first `add_frame`
/// cannot orphan a legitimate object.
const TIDY_SKIP_WINDOW: Duration = Duration(15 * 60 * 1000);

const CREATE_TABLES_SQL: &str = r#"
    create table if not exists objects (
      uid integer primary key,
      camLoc text,
      timeStart integer,
      timeStop integer,
      type text,
      minWidth integer,
      maxWidth integer,
      minHeight integer,
      maxHeight integer
    );
    create table if not exists motion (
      objUid integer,
      frame integer,
      time integer,
      x1 integer,
      y1 integer,
      x2 integer,
      y2 integer,
      primary key (objUid, time)
    );
    create table if not exists actions (
      objUid integer,
      type text,
      action text,
      frameStart integer,
      timeStart integer,
      frameStop integer,
      timeStop integer
    )
"#;

// Our most common operation is searches between two times. Real-time
// searches have timeStop >= ~1 second ago, so the timeStop side of the
// index is tiny and quick; indexing timeStart instead measurably loses.
const CREATE_INDICES_SQL: &str = r#"
    create index if not exists IDX_OBJECTS_STOP on objects (timeStop)
"#;

const INSERT_OBJECT_SQL: &str = r#"
    insert into objects (camLoc,  timeStart,  timeStop,  type,
                         minWidth,  maxWidth,  minHeight,  maxHeight)
                 values (:camLoc, :timeStart, :timeStop, :type,
                         :minWidth, :maxWidth, :minHeight, :maxHeight)
"#;

const INSERT_MOTION_SQL: &str = r#"
    insert into motion (objUid, frame, time, x1, y1, x2, y2)
                values (:objUid, :frame, :time, :x1, :y1, :x2, :y2)
"#;

const UPDATE_OBJECT_SUMMARY_SQL: &str = r#"
    update objects
    set timeStop = max(timeStop, :time),
        minWidth = min(:width, minWidth),
        maxWidth = max(:width, maxWidth),
        minHeight = min(:height, minHeight),
        maxHeight = max(:height, maxHeight)
    where uid = :uid
"#;

const EXTEND_ACTION_SQL: &str = r#"
    update actions set frameStop = :frame, timeStop = :time
    where objUid = :objUid and frameStop = :prevFrame and action = :action
"#;

const INSERT_ACTION_SQL: &str = r#"
    insert into actions (objUid, type, action, frameStart, timeStart, frameStop, timeStop)
                 values (:objUid, :type, :action, :frame, :time, :frame, :time)
"#;

/// A bounding box in the normalized 320×240 coordinate system.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BBox {
    pub fn width(&self) -> i32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> i32 {
        self.y2 - self.y1
    }
}

/// One row of the motion table.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MotionRow {
    pub bbox: BBox,
    pub frame: i64,
    pub time: Time,
    pub obj_uid: i64,
}

/// One object's extent within a queried window: its minimum and maximum
/// times there and the frames they correspond to.
#[derive(Clone, Debug, PartialEq)]
pub struct ObjectRange {
    pub uid: i64,
    pub first: (Time, i64),
    pub last: (Time, i64),
    pub camera: String,
}

/// Lowercase `unknown` and `nonperson` are storage aliases for `object`.
fn normalize_type(obj_type: &str) -> &str {
    if obj_type.eq_ignore_ascii_case("unknown") || obj_type.eq_ignore_ascii_case("nonperson") {
        "object"
    } else {
        obj_type
    }
}

fn placeholders(n: usize) -> String {
    let mut s = String::with_capacity(n * 3);
    for i in 0..n {
        if i > 0 {
            s.push_str(", ");
        }
        s.push('?');
    }
    s
}

pub struct ObjectIndex<C: Clocks> {
    conn: rusqlite::Connection,
    clocks: C,

    camera_filter: Option<Vec<String>>,
    size_filter: Option<i32>,

    /// Whether a target filter is active at all; with one active, an empty
    /// `any_types` + `action_uids` matches nothing.
    target_filter_active: bool,

    /// Object types accepted regardless of action.
    any_types: Vec<String>,

    /// Objects accepted because they performed a requested `(type, action)`
    /// at some point; their matches are limited to `target_range_filter`.
    action_uids: Vec<i64>,

    /// Per object, the action intervals during which it actually matches.
    /// Objects absent from this map (but passing the filters) match at all
    /// times.
    target_range_filter: FastHashMap<i64, Vec<(Time, Time)>>,
}

impl<C: Clocks> ObjectIndex<C> {
    pub fn open(clocks: C, path: &Path) -> Result<Self, Error> {
        let conn = rusqlite::Connection::open(path).map_err(|e| {
            err!(Unavailable, msg("can't open object db {}", path.display()), source(e))
        })?;
        Self::with_conn(clocks, conn)
    }

    pub fn with_conn(clocks: C, conn: rusqlite::Connection) -> Result<Self, Error> {
        conn.query_row("pragma journal_mode = persist", [], |_| Ok(()))?;
        conn.execute_batch("pragma page_size = 4096")?;
        // Creation can race another process; "already exists" is harmless.
        if let Err(e) = conn.execute_batch(CREATE_TABLES_SQL) {
            info!(err = %e, "assuming concurrent schema creation");
        }
        conn.execute_batch(CREATE_INDICES_SQL)?;
        Ok(ObjectIndex {
            conn,
            clocks,
            camera_filter: None,
            size_filter: None,
            target_filter_active: false,
            any_types: Vec::new(),
            action_uids: Vec::new(),
            target_range_filter: FastHashMap::default(),
        })
    }

    pub fn clocks(&self) -> &C {
        &self.clocks
    }

    /// Inserts an object first seen at `time_start`, returning its uid.
    pub fn add_object(&mut self, time_start: Time, obj_type: &str, camera: &str) -> Result<i64, Error> {
        let mut stmt = self.conn.prepare_cached(INSERT_OBJECT_SQL)?;
        stmt.execute(named_params! {
            ":camLoc": camera,
            ":timeStart": time_start,
            ":timeStop": time_start,
            ":type": normalize_type(obj_type),
            ":minWidth": COORD_WIDTH,
            ":maxWidth": 0,
            ":minHeight": COORD_HEIGHT,
            ":maxHeight": 0,
        })?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Adds one frame of motion for `uid`, refreshing the object's summary
    /// and extending (or starting) its current action interval.
    ///
    /// A duplicate `(uid, time)` is dropped with a warning rather than
    /// failing the batch; it indicates a tracker bug upstream.
    pub fn add_frame(
        &mut self,
        uid: i64,
        frame: i64,
        time: Time,
        bbox: BBox,
        obj_type: &str,
        action: Option<&str>,
    ) -> Result<(), Error> {
        {
            let mut stmt = self.conn.prepare_cached(INSERT_MOTION_SQL)?;
            let r = stmt.execute(named_params! {
                ":objUid": uid,
                ":frame": frame,
                ":time": time,
                ":x1": bbox.x1,
                ":y1": bbox.y1,
                ":x2": bbox.x2,
                ":y2": bbox.y2,
            });
            if let Err(e) = r {
                if matches!(
                    &e,
                    rusqlite::Error::SqliteFailure(f, _)
                        if f.code == rusqlite::ErrorCode::ConstraintViolation
                ) {
                    warn!(uid, frame, time = time.0, "skipping duplicate motion row (tracker bug)");
                    return Ok(());
                }
                return Err(e.into());
            }
        }

        let mut stmt = self.conn.prepare_cached(UPDATE_OBJECT_SUMMARY_SQL)?;
        stmt.execute(named_params! {
            ":time": time,
            ":width": bbox.width(),
            ":height": bbox.height(),
            ":uid": uid,
        })?;

        if let Some(action) = action {
            // Try to extend an existing interval; insert only if that
            // touched no row. With frames arriving in order this keeps the
            // table at O(actions) rows rather than O(frames).
            let mut stmt = self.conn.prepare_cached(EXTEND_ACTION_SQL)?;
            let n = stmt.execute(named_params! {
                ":frame": frame,
                ":time": time,
                ":objUid": uid,
                ":prevFrame": frame - 1,
                ":action": action,
            })?;
            if n == 0 {
                let mut stmt = self.conn.prepare_cached(INSERT_ACTION_SQL)?;
                stmt.execute(named_params! {
                    ":objUid": uid,
                    ":type": normalize_type(obj_type),
                    ":action": action,
                    ":frame": frame,
                    ":time": time,
                })?;
            }
        }
        Ok(())
    }

    pub fn get_object_type(&self, uid: i64) -> Result<String, Error> {
        let t: Option<String> = self
            .conn
            .query_row("select type from objects where uid = ?1", params![uid], |row| {
                row.get(0)
            })
            .optional()?;
        // Robustness: rows can vanish under a concurrent cleaner.
        Ok(t.unwrap_or_else(|| "unknown".to_owned()))
    }

    // ------------------------------------------------------------------
    // Filter state.

    pub fn set_camera_filter(&mut self, cameras: Option<&[String]>) {
        self.camera_filter = match cameras {
            Some(c) if !c.is_empty() => Some(c.to_vec()),
            _ => None,
        };
    }

    /// Restricts future searches to objects at least `min_height` tall at
    /// some point (checked against `maxHeight`).
    pub fn set_min_size_filter(&mut self, min_height: Option<i32>) {
        self.size_filter = min_height;
    }

    /// Restricts future searches to objects of certain `(type, action)`
    /// pairs, `"any"` meaning any action. For action-specific targets the
    /// per-object match windows are recorded so their contributions can be
    /// limited to the action's duration.
    ///
    /// `time_start`/`time_stop` only narrow the `actions` lookup; callers
    /// must still filter results by time.
    pub fn set_target_filter(
        &mut self,
        targets: &[(String, String)],
        time_start: Option<Time>,
        time_stop: Option<Time>,
    ) -> Result<(), Error> {
        self.target_range_filter.clear();
        self.any_types.clear();
        self.action_uids.clear();
        self.target_filter_active = !targets.is_empty();
        if !self.target_filter_active {
            return Ok(());
        }

        let mut any_types: Vec<String> = targets
            .iter()
            .filter(|(_, action)| action.as_str() == "any")
            .map(|(t, _)| t.clone())
            .collect();
        any_types.sort_unstable();
        any_types.dedup();

        // Looking for (person, walking) OR (person, any) is just
        // (person, any).
        let action_targets: Vec<&(String, String)> = targets
            .iter()
            .filter(|(t, action)| action.as_str() != "any" && !any_types.contains(t))
            .collect();

        if !action_targets.is_empty() {
            let mut sql = String::from(
                "select objUid, timeStart, timeStop from actions where ",
            );
            let mut params_vec: Vec<Value> = Vec::new();
            if let Some(start) = time_start {
                sql.push_str("timeStop >= ? and ");
                params_vec.push(Value::Integer(start.0));
            }
            if let Some(stop) = time_stop {
                sql.push_str("timeStart <= ? and ");
                params_vec.push(Value::Integer(stop.0));
            }
            sql.push('(');
            for (i, (t, a)) in action_targets.iter().enumerate() {
                if i > 0 {
                    sql.push_str(" or ");
                }
                sql.push_str("(type = ? and action = ?)");
                params_vec.push(Value::Text(t.clone()));
                params_vec.push(Value::Text(a.clone()));
            }
            sql.push(')');

            let mut stmt = self.conn.prepare(&sql)?;
            let rows: Vec<(i64, Time, Time)> = stmt
                .query_map(params_from_iter(params_vec), |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })?
                .collect::<rusqlite::Result<_>>()?;
            for (uid, start, stop) in rows {
                self.action_uids.push(uid);
                self.target_range_filter
                    .entry(uid)
                    .or_default()
                    .push((start, stop));
            }
            self.action_uids.sort_unstable();
            self.action_uids.dedup();
        }

        self.any_types = any_types;
        Ok(())
    }

    pub fn clear_filters(&mut self) {
        self.camera_filter = None;
        self.size_filter = None;
        self.target_filter_active = false;
        self.any_types.clear();
        self.action_uids.clear();
        self.target_range_filter.clear();
    }

    /// Appends the active filters as ` and ...` clauses against the
    /// objects table (columns optionally prefixed by `alias`).
    fn push_filter_sql(&self, alias: &str, sql: &mut String, params_vec: &mut Vec<Value>) {
        if let Some(cameras) = &self.camera_filter {
            sql.push_str(&format!(
                " and {alias}camLoc in ({})",
                placeholders(cameras.len())
            ));
            params_vec.extend(cameras.iter().map(|c| Value::Text(c.clone())));
        }
        if self.target_filter_active {
            let mut parts: Vec<String> = Vec::new();
            if !self.any_types.is_empty() {
                parts.push(format!("{alias}type in ({})", placeholders(self.any_types.len())));
                params_vec.extend(self.any_types.iter().map(|t| Value::Text(t.clone())));
            }
            if !self.action_uids.is_empty() {
                parts.push(format!("{alias}uid in ({})", placeholders(self.action_uids.len())));
                params_vec.extend(self.action_uids.iter().map(|&u| Value::Integer(u)));
            }
            if parts.is_empty() {
                // A target filter that matched nothing excludes everything.
                sql.push_str(" and 1 = 0");
            } else {
                sql.push_str(&format!(" and ({})", parts.join(" or ")));
            }
        }
        if let Some(min_height) = self.size_filter {
            sql.push_str(&format!(" and {alias}maxHeight >= ?"));
            params_vec.push(Value::Integer(i64::from(min_height)));
        }
    }

    // ------------------------------------------------------------------
    // Queries.

    /// Uids of objects seen within the window, honoring the filters.
    pub fn get_objects_between_times(
        &self,
        start: Option<Time>,
        end: Option<Time>,
    ) -> Result<Vec<i64>, Error> {
        let mut sql = String::from("select uid from objects where 1 = 1");
        let mut params_vec: Vec<Value> = Vec::new();
        if let Some(start) = start {
            sql.push_str(" and timeStop >= ?");
            params_vec.push(Value::Integer(start.0));
        }
        if let Some(end) = end {
            sql.push_str(" and timeStart <= ?");
            params_vec.push(Value::Integer(end.0));
        }
        self.push_filter_sql("", &mut sql, &mut params_vec);
        let mut stmt = self.conn.prepare(&sql)?;
        let uids = stmt
            .query_map(params_from_iter(params_vec), |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        Ok(uids)
    }

    /// One row per filtered object giving its time/frame extent within
    /// `[start, end]`, ordered by uid.
    ///
    /// This is the streaming search's fast path; note it can elide brief
    /// disappearances within a single object since only the extremes are
    /// reported.
    pub fn get_object_ranges_between_times(
        &self,
        start: Option<Time>,
        end: Option<Time>,
    ) -> Result<Vec<ObjectRange>, Error> {
        let mut inner = String::from(
            "select o.camLoc as camLoc, o.uid as objUid, \
             min(m.time) as minTime, max(m.time) as maxTime \
             from objects o join motion m on m.objUid = o.uid where 1 = 1",
        );
        let mut params_vec: Vec<Value> = Vec::new();
        if let Some(start) = start {
            inner.push_str(" and o.timeStop >= ?");
            params_vec.push(Value::Integer(start.0));
        }
        if let Some(end) = end {
            inner.push_str(" and o.timeStart <= ?");
            params_vec.push(Value::Integer(end.0));
        }
        self.push_filter_sql("o.", &mut inner, &mut params_vec);
        if let Some(start) = start {
            inner.push_str(" and m.time >= ?");
            params_vec.push(Value::Integer(start.0));
        }
        if let Some(end) = end {
            inner.push_str(" and m.time <= ?");
            params_vec.push(Value::Integer(end.0));
        }
        inner.push_str(" group by o.uid");

        let sql = format!(
            "select x.camLoc, x.objUid, x.minTime, y.frame, x.maxTime, z.frame from ({inner}) x \
             join motion y on y.objUid = x.objUid and y.time = x.minTime \
             join motion z on z.objUid = x.objUid and z.time = x.maxTime \
             order by x.objUid"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(params_vec), |row| {
                Ok(ObjectRange {
                    camera: row.get(0)?,
                    uid: row.get(1)?,
                    first: (row.get(2)?, row.get(3)?),
                    last: (row.get(4)?, row.get(5)?),
                })
            })?
            .collect::<rusqlite::Result<_>>()?;
        Ok(rows)
    }

    /// Bounding boxes for the given objects within the window, ordered by
    /// `objUid, time`. Objects restricted by an action-specific target
    /// filter contribute only rows within their action intervals.
    pub fn get_object_bboxes_between_times(
        &self,
        obj_uids: &[i64],
        start: Option<Time>,
        end: Option<Time>,
    ) -> Result<Vec<MotionRow>, Error> {
        if obj_uids.is_empty() {
            return Ok(Vec::new());
        }
        let mut sql = format!(
            "select x1, y1, x2, y2, frame, time, objUid from motion \
             where objUid in ({})",
            placeholders(obj_uids.len())
        );
        let mut params_vec: Vec<Value> =
            obj_uids.iter().map(|&u| Value::Integer(u)).collect();
        if let Some(start) = start {
            sql.push_str(" and time >= ?");
            params_vec.push(Value::Integer(start.0));
        }
        if let Some(end) = end {
            sql.push_str(" and time <= ?");
            params_vec.push(Value::Integer(end.0));
        }
        sql.push_str(" order by objUid asc, time asc");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows: Vec<MotionRow> = stmt
            .query_map(params_from_iter(params_vec), |row| {
                Ok(MotionRow {
                    bbox: BBox {
                        x1: row.get(0)?,
                        y1: row.get(1)?,
                        x2: row.get(2)?,
                        y2: row.get(3)?,
                    },
                    frame: row.get(4)?,
                    time: row.get(5)?,
                    obj_uid: row.get(6)?,
                })
            })?
            .collect::<rusqlite::Result<_>>()?;

        if self.target_range_filter.is_empty() {
            return Ok(rows);
        }
        Ok(rows
            .into_iter()
            .filter(|r| match self.target_range_filter.get(&r.obj_uid) {
                None => true,
                Some(ranges) => ranges.iter().any(|&(s, e)| s <= r.time && r.time <= e),
            })
            .collect())
    }

    /// The frame closest to `time`, looking within ±10 ms, with its
    /// distance.
    pub fn get_frame_at_time(&self, uid: i64, time: Time) -> Result<Option<(i64, Duration)>, Error> {
        const VARIABILITY: Duration = Duration(10);
        let mut stmt = self.conn.prepare_cached(
            "select frame, time from motion where objUid = ?1 and time > ?2 and time < ?3",
        )?;
        let rows: Vec<(i64, Time)> = stmt
            .query_map(
                params![uid, time - VARIABILITY, time + VARIABILITY],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?
            .collect::<rusqlite::Result<_>>()?;
        Ok(rows
            .into_iter()
            .map(|(frame, t)| (frame, Duration((time - t).0.abs())))
            .min_by_key(|&(_, d)| d))
    }

    /// The first bbox of `uid` at or after `start` (or overall).
    pub fn get_first_object_bbox(
        &self,
        uid: i64,
        start: Option<Time>,
    ) -> Result<Option<(BBox, i64, Time)>, Error> {
        let mut sql = String::from(
            "select x1, y1, x2, y2, frame, time from motion where objUid = ?",
        );
        let mut params_vec: Vec<Value> = vec![Value::Integer(uid)];
        if let Some(start) = start {
            sql.push_str(" and time >= ?");
            params_vec.push(Value::Integer(start.0));
        }
        sql.push_str(" order by time limit 1");
        let mut stmt = self.conn.prepare(&sql)?;
        stmt.query_row(params_from_iter(params_vec), |row| {
            Ok((
                BBox {
                    x1: row.get(0)?,
                    y1: row.get(1)?,
                    x2: row.get(2)?,
                    y2: row.get(3)?,
                },
                row.get(4)?,
                row.get(5)?,
            ))
        })
        .optional()
        .map_err(Into::into)
    }

    /// The final `(frame, time)` an object was tracked.
    pub fn get_object_final_time(&self, uid: i64) -> Result<Option<(i64, Time)>, Error> {
        let stop: Option<Time> = self
            .conn
            .query_row(
                "select timeStop from objects where uid = ?1",
                params![uid],
                |row| row.get(0),
            )
            .optional()?;
        let Some(stop) = stop else {
            return Ok(None);
        };
        let frame = self.get_frame_at_time(uid, stop)?.map(|(f, _)| f).unwrap_or(-1);
        Ok(Some((frame, stop)))
    }

    /// The most recent ms any object was seen at `camera`.
    pub fn get_most_recent_object_time(&self, camera: &str) -> Result<Option<Time>, Error> {
        self.conn
            .query_row(
                "select max(timeStop) from objects where camLoc = ?1",
                params![camera],
                |row| row.get::<_, Option<Time>>(0),
            )
            .map_err(Into::into)
    }

    /// Camera locations for a set of objects.
    pub fn get_object_cameras(&self, obj_uids: &[i64]) -> Result<FastHashMap<i64, String>, Error> {
        let mut map = FastHashMap::default();
        if obj_uids.is_empty() {
            return Ok(map);
        }
        let sql = format!(
            "select uid, camLoc from objects where uid in ({})",
            placeholders(obj_uids.len())
        );
        let params_vec: Vec<Value> = obj_uids.iter().map(|&u| Value::Integer(u)).collect();
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(params_vec))?;
        while let Some(row) = rows.next()? {
            map.insert(row.get(0)?, row.get(1)?);
        }
        Ok(map)
    }

    /// Types of all objects in a uid range, for log summaries.
    pub fn get_objects_info_for_range(
        &self,
        min_uid: i64,
        max_uid: i64,
    ) -> Result<FastHashMap<i64, String>, Error> {
        let mut stmt = self
            .conn
            .prepare_cached("select uid, type from objects where uid >= ?1 and uid <= ?2")?;
        let mut map = FastHashMap::default();
        let mut rows = stmt.query(params![min_uid, max_uid])?;
        while let Some(row) = rows.next()? {
            map.insert(row.get(0)?, row.get(1)?);
        }
        Ok(map)
    }

    // ------------------------------------------------------------------
    // Mutation beyond inserts.

    /// Deletes motion in `[start, stop]` for `camera`, dropping objects
    /// left without motion and splitting objects that straddle the window.
    pub fn delete_camera_location_data_between(
        &mut self,
        camera: &str,
        start: Time,
        stop: Time,
    ) -> Result<(), Error> {
        if stop < start {
            return Err(err!(InvalidArgument, msg("stop {} < start {}", stop.0, start.0)));
        }
        let mut stmt = self.conn.prepare_cached(
            "select uid, timeStart, timeStop from objects \
             where camLoc = ?1 and timeStart <= ?2 and timeStop >= ?3",
        )?;
        let obj_info: Vec<(i64, Time, Time)> = stmt
            .query_map(params![camera, stop, start], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<rusqlite::Result<_>>()?;
        drop(stmt);
        if obj_info.is_empty() {
            return Ok(());
        }
        let uids: Vec<i64> = obj_info.iter().map(|&(u, _, _)| u).collect();

        let now = self.clocks.realtime();
        crate::sqlutil::in_transaction(&self.conn, &self.clocks, || {
            let sql = format!(
                "delete from motion where objUid in ({}) and time >= ? and time <= ?",
                placeholders(uids.len())
            );
            let mut params_vec: Vec<Value> = uids.iter().map(|&u| Value::Integer(u)).collect();
            params_vec.push(Value::Integer(start.0));
            params_vec.push(Value::Integer(stop.0));
            self.conn.prepare(&sql)?.execute(params_from_iter(params_vec))?;

            let mut orphaned = Vec::new();
            for &uid in &uids {
                if !self.has_motion(uid)? {
                    orphaned.push(uid);
                }
            }
            self.delete_objects_inner(&orphaned, now)?;

            for &(uid, obj_start, obj_stop) in &obj_info {
                if orphaned.contains(&uid) {
                    continue;
                }
                if obj_start < start {
                    if obj_stop > stop {
                        // The object straddles the window; a new object
                        // carries the "after" portion.
                        let (obj_type, min_w, max_w, min_h, max_h): (String, i32, i32, i32, i32) =
                            self.conn.query_row(
                                "select type, minWidth, maxWidth, minHeight, maxHeight \
                                 from objects where uid = ?1",
                                params![uid],
                                |row| {
                                    Ok((
                                        row.get(0)?,
                                        row.get(1)?,
                                        row.get(2)?,
                                        row.get(3)?,
                                        row.get(4)?,
                                    ))
                                },
                            )?;
                        let mut stmt = self.conn.prepare_cached(INSERT_OBJECT_SQL)?;
                        stmt.execute(named_params! {
                            ":camLoc": camera,
                            ":timeStart": obj_start,
                            ":timeStop": obj_stop,
                            ":type": obj_type,
                            ":minWidth": min_w,
                            ":maxWidth": max_w,
                            ":minHeight": min_h,
                            ":maxHeight": max_h,
                        })?;
                        let new_uid = self.conn.last_insert_rowid();
                        self.conn.execute(
                            "update motion set objUid = ?1 where objUid = ?2 and time > ?3",
                            params![new_uid, uid, stop],
                        )?;
                        self.conn.execute(
                            "update objects set timeStart = \
                             (select min(time) from motion where objUid = ?1) where uid = ?1",
                            params![new_uid],
                        )?;
                    }
                    self.conn.execute(
                        "update objects set timeStop = \
                         (select max(time) from motion where objUid = ?1) where uid = ?1",
                        params![uid],
                    )?;
                } else if obj_stop > stop {
                    self.conn.execute(
                        "update objects set timeStart = \
                         (select min(time) from motion where objUid = ?1) where uid = ?1",
                        params![uid],
                    )?;
                } else {
                    error!(uid, "object inside deletion window should have been orphaned");
                }
            }
            Ok(())
        })
    }

    fn has_motion(&self, uid: i64) -> Result<bool, Error> {
        let mut stmt = self
            .conn
            .prepare_cached("select objUid from motion where objUid = ?1 limit 1")?;
        Ok(stmt.exists(params![uid])?)
    }

    /// Removes object rows, keeping the highest uid (new-id assignment
    /// depends on it) and anything recent enough to have data in flight.
    fn delete_objects_inner(&self, uids: &[i64], now: Time) -> Result<(), Error> {
        if uids.is_empty() {
            return Ok(());
        }
        let max_uid: Option<i64> =
            self.conn
                .query_row("select max(uid) from objects", [], |row| row.get(0))?;
        let sql = format!(
            "select uid, timeStop from objects where uid in ({})",
            placeholders(uids.len())
        );
        let params_vec: Vec<Value> = uids.iter().map(|&u| Value::Integer(u)).collect();
        let stops: Vec<(i64, Time)> = self
            .conn
            .prepare(&sql)?
            .query_map(params_from_iter(params_vec), |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<rusqlite::Result<_>>()?;
        let cutoff = now - OBJECT_SAVE_BUFFER;
        let doomed: Vec<i64> = stops
            .into_iter()
            .filter(|&(uid, stop)| Some(uid) != max_uid && stop <= cutoff)
            .map(|(uid, _)| uid)
            .collect();
        if doomed.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "delete from objects where uid in ({})",
            placeholders(doomed.len())
        );
        let params_vec: Vec<Value> = doomed.iter().map(|&u| Value::Integer(u)).collect();
        self.conn.prepare(&sql)?.execute(params_from_iter(params_vec))?;
        Ok(())
    }

    /// Batched GC of objects with no motion rows.
    ///
    /// This could get slow with large numbers of objects; don't run it too
    /// often. Works in chunks of 1000 uids so no single database access
    /// runs long, and skips objects younger than 15 minutes relative to
    /// the newest so an insert race cannot orphan a legitimate object.
    pub fn tidy_object_table(&mut self) -> Result<(), Error> {
        let started = self.clocks.monotonic();
        let last_time: Option<Option<Time>> = self
            .conn
            .query_row(
                "select timeStart from objects order by uid desc limit 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        let Some(last_time) = last_time else {
            return Ok(());
        };
        let last_time = match last_time {
            Some(t) => t,
            None => {
                // Corruption of some sort; log and pick a safe time of 24
                // hours ago.
                error!("newest object has null timeStart");
                self.clocks.realtime() - Duration(24 * 3600 * 1000)
            }
        };
        let min_start = last_time - TIDY_SKIP_WINDOW;

        let mut orphaned: Vec<i64> = Vec::new();
        let mut prev_uid = 0i64;
        loop {
            let mut stmt = self.conn.prepare_cached(
                "select uid from objects where uid > ?1 and timeStart < ?2 \
                 order by uid limit 1000",
            )?;
            let chunk: Vec<i64> = stmt
                .query_map(params![prev_uid, min_start], |row| row.get(0))?
                .collect::<rusqlite::Result<_>>()?;
            drop(stmt);
            let Some(&last) = chunk.last() else {
                break;
            };
            for uid in chunk {
                if !self.has_motion(uid)? {
                    orphaned.push(uid);
                }
            }
            prev_uid = last;
        }

        if !orphaned.is_empty() {
            warn!(count = orphaned.len(), "detected orphaned objects");
            let now = self.clocks.realtime();
            crate::sqlutil::in_transaction(&self.conn, &self.clocks, || {
                self.delete_objects_inner(&orphaned, now)
            })?;
        }
        info!(elapsed = ?self.clocks.monotonic().saturating_sub(started), "tidy_object_table done");
        Ok(())
    }

    /// Renames a camera location as of `change`, splitting objects whose
    /// lifetime crosses the boundary.
    pub fn update_location_name(
        &mut self,
        old_name: &str,
        new_name: &str,
        change: Time,
    ) -> Result<(), Error> {
        let mut stmt = self.conn.prepare_cached(
            "select uid, camLoc, timeStop, type, minWidth, maxWidth, minHeight, maxHeight \
             from objects where camLoc = ?1 and timeStop >= ?2 and timeStart < ?2",
        )?;
        #[allow(clippy::type_complexity)]
        let crossing: Vec<(i64, String, Time, String, i32, i32, i32, i32)> = stmt
            .query_map(params![old_name, change], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                ))
            })?
            .collect::<rusqlite::Result<_>>()?;
        drop(stmt);

        crate::sqlutil::in_transaction(&self.conn, &self.clocks, || {
            for (uid, cam, stop, obj_type, min_w, max_w, min_h, max_h) in &crossing {
                let mut stmt = self.conn.prepare_cached(INSERT_OBJECT_SQL)?;
                stmt.execute(named_params! {
                    ":camLoc": cam,
                    ":timeStart": change,
                    ":timeStop": stop,
                    ":type": obj_type,
                    ":minWidth": min_w,
                    ":maxWidth": max_w,
                    ":minHeight": min_h,
                    ":maxHeight": max_h,
                })?;
                let new_uid = self.conn.last_insert_rowid();
                self.conn.execute(
                    "update motion set objUid = ?1 where objUid = ?2 and time >= ?3",
                    params![new_uid, uid, change],
                )?;
                self.conn.execute(
                    "update objects set timeStop = ?1 where uid = ?2",
                    params![Time(change.0 - 1), uid],
                )?;
            }
            self.conn.execute(
                "update objects set camLoc = ?1 where camLoc = ?2 and timeStart >= ?3",
                params![new_name, old_name, change],
            )?;
            Ok(())
        })
    }

    /// Removes all data associated with a camera location.
    pub fn remove_camera_location(&mut self, camera: &str) -> Result<(), Error> {
        let mut stmt = self
            .conn
            .prepare_cached("select uid from objects where camLoc = ?1")?;
        let uids: Vec<i64> = stmt
            .query_map(params![camera], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        drop(stmt);
        if uids.is_empty() {
            return Ok(());
        }
        crate::sqlutil::in_transaction(&self.conn, &self.clocks, || {
            for table in ["objects", "motion", "actions"] {
                let key = if table == "objects" { "uid" } else { "objUid" };
                let sql = format!(
                    "delete from {table} where {key} in ({})",
                    placeholders(uids.len())
                );
                let params_vec: Vec<Value> = uids.iter().map(|&u| Value::Integer(u)).collect();
                self.conn.prepare(&sql)?.execute(params_from_iter(params_vec))?;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use base::clock::SimulatedClocks;

    fn new_index(boot: Time) -> ObjectIndex<SimulatedClocks> {
        testutil::init();
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        ObjectIndex::with_conn(SimulatedClocks::new(boot), conn).unwrap()
    }

    fn bbox(x1: i32, y1: i32, x2: i32, y2: i32) -> BBox {
        BBox { x1, y1, x2, y2 }
    }

    fn walk(
        index: &mut ObjectIndex<SimulatedClocks>,
        uid: i64,
        frames: std::ops::RangeInclusive<i64>,
        t0: i64,
        step: i64,
    ) {
        for (i, frame) in frames.enumerate() {
            index
                .add_frame(
                    uid,
                    frame,
                    Time(t0 + i as i64 * step),
                    bbox(10, 10, 50, 90),
                    "person",
                    Some("walking"),
                )
                .unwrap();
        }
    }

    #[test]
    fn type_normalization() {
        let mut index = new_index(Time(0));
        let a = index.add_object(Time(1_000), "Unknown", "Door").unwrap();
        let b = index.add_object(Time(1_000), "nonperson", "Door").unwrap();
        let c = index.add_object(Time(1_000), "person", "Door").unwrap();
        assert_eq!(index.get_object_type(a).unwrap(), "object");
        assert_eq!(index.get_object_type(b).unwrap(), "object");
        assert_eq!(index.get_object_type(c).unwrap(), "person");
    }

    #[test]
    fn duplicate_motion_row_is_dropped() {
        let mut index = new_index(Time(0));
        let uid = index.add_object(Time(1_000), "person", "Door").unwrap();
        index
            .add_frame(uid, 1, Time(1_000), bbox(0, 0, 10, 10), "person", None)
            .unwrap();
        // Same (uid, time): dropped, not an error.
        index
            .add_frame(uid, 2, Time(1_000), bbox(0, 0, 10, 10), "person", None)
            .unwrap();
        let rows = index
            .get_object_bboxes_between_times(&[uid], None, None)
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].frame, 1);
    }

    #[test]
    fn summary_tracks_extrema_and_stop() {
        let mut index = new_index(Time(0));
        let uid = index.add_object(Time(1_000), "person", "Door").unwrap();
        index
            .add_frame(uid, 1, Time(1_000), bbox(0, 0, 10, 20), "person", None)
            .unwrap();
        index
            .add_frame(uid, 2, Time(2_000), bbox(0, 0, 40, 80), "person", None)
            .unwrap();
        let (min_w, max_w, min_h, max_h, stop): (i32, i32, i32, i32, Time) = index
            .conn
            .query_row(
                "select minWidth, maxWidth, minHeight, maxHeight, timeStop \
                 from objects where uid = ?1",
                params![uid],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                },
            )
            .unwrap();
        assert_eq!((min_w, max_w, min_h, max_h), (10, 40, 20, 80));
        assert_eq!(stop, Time(2_000));
    }

    #[test]
    fn adjacent_action_frames_extend_one_row() {
        let mut index = new_index(Time(0));
        let uid = index.add_object(Time(1_000), "person", "Door").unwrap();
        walk(&mut index, uid, 1..=5, 1_000, 100);
        // A gap in frames starts a new action row.
        walk(&mut index, uid, 10..=12, 3_000, 100);
        let n: i64 = index
            .conn
            .query_row("select count(*) from actions", [], |row| row.get(0))
            .unwrap();
        assert_eq!(n, 2);
        let (f_start, f_stop): (i64, i64) = index
            .conn
            .query_row(
                "select frameStart, frameStop from actions order by frameStart limit 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!((f_start, f_stop), (1, 5));
    }

    #[test]
    fn object_ranges_honor_filters() {
        let mut index = new_index(Time(0));
        let person = index.add_object(Time(1_000), "person", "Door").unwrap();
        walk(&mut index, person, 1..=5, 1_000, 500);
        let car = index.add_object(Time(1_000), "vehicle", "Street").unwrap();
        for (i, frame) in (1..=5).enumerate() {
            index
                .add_frame(
                    car,
                    frame,
                    Time(1_000 + i as i64 * 500),
                    bbox(0, 0, 100, 50),
                    "vehicle",
                    None,
                )
                .unwrap();
        }

        let all = index
            .get_object_ranges_between_times(Some(Time(0)), Some(Time(10_000)))
            .unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].uid, person);
        assert_eq!(all[0].first, (Time(1_000), 1));
        assert_eq!(all[0].last, (Time(3_000), 5));
        assert_eq!(all[0].camera, "Door");

        index.set_camera_filter(Some(&["Street".to_owned()]));
        let street = index
            .get_object_ranges_between_times(Some(Time(0)), Some(Time(10_000)))
            .unwrap();
        assert_eq!(street.len(), 1);
        assert_eq!(street[0].uid, car);
        index.clear_filters();

        index
            .set_target_filter(
                &[("person".to_owned(), "any".to_owned())],
                Some(Time(0)),
                Some(Time(10_000)),
            )
            .unwrap();
        let people = index
            .get_object_ranges_between_times(Some(Time(0)), Some(Time(10_000)))
            .unwrap();
        assert_eq!(people.len(), 1);
        assert_eq!(people[0].uid, person);
    }

    #[test]
    fn action_target_filter_restricts_ranges() {
        let mut index = new_index(Time(0));
        let uid = index.add_object(Time(1_000), "person", "Door").unwrap();
        // Walking frames 1..=5 (1000..3000), then plain motion with no
        // action afterwards.
        walk(&mut index, uid, 1..=5, 1_000, 500);
        for (i, frame) in (6..=8).enumerate() {
            index
                .add_frame(
                    uid,
                    frame,
                    Time(4_000 + i as i64 * 500),
                    bbox(10, 10, 50, 90),
                    "person",
                    None,
                )
                .unwrap();
        }

        index
            .set_target_filter(
                &[("person".to_owned(), "walking".to_owned())],
                Some(Time(0)),
                Some(Time(10_000)),
            )
            .unwrap();
        // The object passes the filter...
        let uids = index
            .get_objects_between_times(Some(Time(0)), Some(Time(10_000)))
            .unwrap();
        assert_eq!(uids, vec![uid]);
        // ...but its bbox contributions are limited to the action window.
        let rows = index
            .get_object_bboxes_between_times(&[uid], None, None)
            .unwrap();
        assert_eq!(rows.len(), 5);
        assert!(rows.iter().all(|r| r.time <= Time(3_000)));
    }

    #[test]
    fn delete_between_splits_straddling_object() {
        let mut index = new_index(Time(1_000_000));
        let uid = index.add_object(Time(1_000), "person", "Door").unwrap();
        // Motion 1000..=9000 every 1000 ms, frames 1..=9.
        walk(&mut index, uid, 1..=9, 1_000, 1_000);

        index
            .delete_camera_location_data_between("Door", Time(4_000), Time(6_000))
            .unwrap();

        let ranges = index.get_object_ranges_between_times(None, None).unwrap();
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].uid, uid);
        assert_eq!(ranges[0].first, (Time(1_000), 1));
        assert_eq!(ranges[0].last, (Time(3_000), 3));
        assert_eq!(ranges[1].first, (Time(7_000), 7));
        assert_eq!(ranges[1].last, (Time(9_000), 9));
    }

    #[test]
    fn delete_between_drops_fully_covered_object() {
        let mut index = new_index(Time(1_000_000));
        let uid = index.add_object(Time(1_000), "person", "Door").unwrap();
        walk(&mut index, uid, 1..=3, 1_000, 500);
        // Add a newer object so `uid` isn't the table max (which is never
        // deleted).
        let newer = index.add_object(Time(5_000), "person", "Door").unwrap();
        index
            .add_frame(newer, 1, Time(5_000), bbox(0, 0, 5, 5), "person", None)
            .unwrap();

        index
            .delete_camera_location_data_between("Door", Time(0), Time(4_000))
            .unwrap();
        let uids = index.get_objects_between_times(None, None).unwrap();
        assert_eq!(uids, vec![newer]);
    }

    #[test]
    fn tidy_removes_only_stale_motionless_objects() {
        let mut index = new_index(Time(10_000_000));
        // Stale orphan: no motion, old timeStart.
        let orphan = index.add_object(Time(1_000), "person", "Door").unwrap();
        // Live object with motion.
        let live = index.add_object(Time(1_500), "person", "Door").unwrap();
        index
            .add_frame(live, 1, Time(1_500), bbox(0, 0, 5, 5), "person", None)
            .unwrap();
        // Newest object; anchors the skip window and is never deleted.
        let _newest = index
            .add_object(Time(10_000_000), "person", "Door")
            .unwrap();

        index.tidy_object_table().unwrap();
        let uids = index.get_objects_between_times(None, None).unwrap();
        assert!(!uids.contains(&orphan));
        assert!(uids.contains(&live));
    }

    #[test]
    fn rename_splits_crossing_object() {
        let mut index = new_index(Time(1_000_000));
        let uid = index.add_object(Time(1_000), "person", "Old").unwrap();
        walk(&mut index, uid, 1..=9, 1_000, 1_000);

        index.update_location_name("Old", "New", Time(5_000)).unwrap();

        let ranges = index.get_object_ranges_between_times(None, None).unwrap();
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].camera, "Old");
        assert_eq!(ranges[0].last.0, Time(4_000));
        assert_eq!(ranges[1].camera, "New");
        assert_eq!(ranges[1].first.0, Time(5_000));
    }
}
