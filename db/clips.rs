// This file is part of Argus NVR, a security camera network video recorder.
// Copyright (C) 2024 The Argus NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The clip index: the authoritative per-camera catalog of recorded video
//! files.
//!
//! Each row describes one file: its time range, its continuity links to the
//! previous/next file of the same recording run, whether it is part of the
//! evictable cache, the resolution it was *processed* (not stored) at, and a
//! tag blob whose only engine-interpreted key is the list of user-saved
//! intervals within a cache file.
//!
//! The index assumes a single writer per process. Readers on other threads
//! open their own `ClipIndex` against the same path.

use base::clock::Clocks;
use base::time::{Duration, Time, MS_PER_SEC};
use base::{bail, err, Error, FastHashMap};
use rusqlite::{named_params, params, OptionalExtension as _};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::ranges::compress_ranges;

/// Offset subtracted from a split point before re-encoding the right-hand
/// piece of a file, so the encoder can pick up from the previous keyframe.
pub const REENCODE_PREROLL: Duration = Duration(10);

/// If forced tags may not have been completed, the first and maximum retry
/// delays handed back from [`ClipIndex::mark_times_as_saved`].
const RETRY_FIRST: Duration = Duration(10 * MS_PER_SEC);
const RETRY_MAX: Duration = Duration(5 * 60 * MS_PER_SEC);

/// How many trailing `r` markers to probe for when an `add_clip` references
/// a previous file that has since been renamed by deletion. It should be
/// impossible for a user to manage two deletes before the most recent video
/// flushes; five is extra caution.
const MAX_DELETE_MARKERS: usize = 5;

const CREATE_CLIPS_SQL: &str = r#"
    create table if not exists clips (
      uid integer primary key,
      filename text,
      camLoc text,
      firstMs integer,
      lastMs integer,
      prevFile text,
      nextFile text,
      tags blob,
      isCache integer,
      procWidth integer default 0,
      procHeight integer default 0
    )
"#;

const CREATE_PADDING_SQL: &str = r#"
    create table if not exists clipPadding (
      updateTime integer primary key,
      paddingSec integer
    )
"#;

const CREATE_PROC_SIZES_SQL: &str = r#"
    create table if not exists clipProcSizes (
      camLoc text,
      firstMs integer,
      procWidth integer default 0,
      procHeight integer default 0
    )
"#;

const CREATE_INDICES_SQL: &str = r#"
    create index if not exists IDX_CLIPS_FILENAME_CAMLOC on clips (filename, camLoc);
    create index if not exists IDX_CLIPS_PREVFILE on clips (prevFile);
    create index if not exists IDX_CLIPS_NEXTFILE on clips (nextFile);
    create index if not exists IDX_CLIPS_CAMLOC_FIRSTMS on clips (camLoc, firstMs);
    create index if not exists IDX_CLIPS_CAMLOC_LASTMS on clips (camLoc, lastMs);
    create index if not exists IDX_CLIPS_ISCACHE_FIRSTMS on clips (isCache, firstMs)
"#;

const INSERT_CLIP_SQL: &str = r#"
    insert into clips (filename,  camLoc,  firstMs,  lastMs,  prevFile,  nextFile,
                       tags,  isCache,  procWidth,  procHeight)
               values (:filename, :camLoc, :firstMs, :lastMs, :prevFile, :nextFile,
                       :tags, :isCache, :procWidth, :procHeight)
"#;

const FILE_CONTAINING_SQL: &str = r#"
    select filename, procWidth, procHeight
    from clips
    where camLoc = :camLoc and firstMs <= :ms and lastMs >= :ms
"#;

const FILE_AFTER_SQL: &str = r#"
    select filename, firstMs
    from clips
    where camLoc = :camLoc and firstMs = (
      select min(firstMs) from clips
      where camLoc = :camLoc and firstMs > :ms and firstMs < :limit
    )
"#;

const FILE_BEFORE_SQL: &str = r#"
    select filename, lastMs
    from clips
    where camLoc = :camLoc and lastMs = (
      select max(lastMs) from clips
      where camLoc = :camLoc and lastMs < :ms and lastMs > :limit
    )
"#;

const FILES_BETWEEN_SQL: &str = r#"
    select filename, firstMs, lastMs
    from clips
    where camLoc = :camLoc and
          ((firstMs >= :start and firstMs <= :end) or
           (firstMs <= :start and lastMs >= :start))
    order by firstMs
"#;

const TIMES_FROM_LOCATION_SQL: &str = r#"
    select filename, firstMs, lastMs, prevFile, nextFile, tags, isCache
    from clips
    where camLoc = :camLoc and lastMs >= :first and firstMs <= :last
    order by firstMs
"#;

const CLIPS_CROSSING_SQL: &str = r#"
    select uid, filename, camLoc, firstMs, lastMs, prevFile, nextFile,
           tags, isCache, procWidth, procHeight
    from clips
    where camLoc = :camLoc and lastMs >= :changeMs and firstMs < :changeMs
"#;

const CLIP_BY_NAME_SQL: &str = r#"
    select uid, filename, camLoc, firstMs, lastMs, prevFile, nextFile,
           tags, isCache, procWidth, procHeight
    from clips
    where filename = :filename
"#;

/// Whether a file is subject to cache eviction.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum CacheStatus {
    /// Evictable unless portions are tagged for saving.
    Cache,

    /// Kept until explicitly deleted.
    #[default]
    NonCache,

    /// Neither cache nor non-cache; ignored by the disk cleaner.
    Unmanaged,
}

impl CacheStatus {
    fn as_i64(self) -> i64 {
        match self {
            CacheStatus::NonCache => 0,
            CacheStatus::Cache => 1,
            CacheStatus::Unmanaged => -1,
        }
    }
}

impl rusqlite::types::ToSql for CacheStatus {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        Ok(self.as_i64().into())
    }
}

impl rusqlite::types::FromSql for CacheStatus {
    fn column_result(value: rusqlite::types::ValueRef) -> rusqlite::types::FromSqlResult<Self> {
        match value.as_i64_or_null()? {
            Some(1) => Ok(CacheStatus::Cache),
            Some(-1) => Ok(CacheStatus::Unmanaged),
            Some(0) | None => Ok(CacheStatus::NonCache),
            Some(o) => Err(rusqlite::types::FromSqlError::OutOfRange(o)),
        }
    }
}

/// The tag blob attached to a clip, stored as JSON. The engine interprets
/// only `saveTimes`; everything else rides along untouched.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ClipTags {
    #[serde(default, rename = "saveTimes", skip_serializing_if = "Vec::is_empty")]
    pub save_times: Vec<(Time, Time)>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ClipTags {
    fn parse(blob: rusqlite::types::ValueRef) -> ClipTags {
        // Tags written by older versions may not parse; treat them as empty
        // rather than failing the whole row.
        match blob {
            rusqlite::types::ValueRef::Blob(b) => serde_json::from_slice(b).unwrap_or_default(),
            rusqlite::types::ValueRef::Text(b) => serde_json::from_slice(b).unwrap_or_default(),
            _ => ClipTags::default(),
        }
    }

    fn serialize(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("tags serialize to JSON")
    }

    /// Drops and clips `save_times` entries so none extends beyond
    /// `[first, last]`. Returns true if anything changed.
    fn trim_to(&mut self, first: Time, last: Time) -> bool {
        let before = self.save_times.len();
        let mut changed = false;
        self.save_times.retain(|&(s, e)| s <= last && e >= first);
        changed |= self.save_times.len() != before;
        for st in &mut self.save_times {
            if st.0 < first {
                st.0 = first;
                changed = true;
            }
            if st.1 > last {
                st.1 = last;
                changed = true;
            }
        }
        changed
    }
}

/// A clip to pass to [`ClipIndex::add_clip`].
#[derive(Clone, Debug, Default)]
pub struct ClipToInsert {
    pub filename: String,
    pub camera: String,
    pub first: Time,
    pub last: Time,
    pub prev_file: Option<String>,
    pub next_file: Option<String>,
    pub cache_status: CacheStatus,
    pub proc_width: i32,
    pub proc_height: i32,
}

/// A full row of the `clips` table.
#[derive(Clone, Debug)]
pub struct Clip {
    pub uid: i64,
    pub filename: String,
    pub camera: String,
    pub first: Time,
    pub last: Time,
    pub prev_file: Option<String>,
    pub next_file: Option<String>,
    pub tags: ClipTags,
    pub cache_status: CacheStatus,
    pub proc_width: i32,
    pub proc_height: i32,
}

impl Clip {
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Clip {
            uid: row.get(0)?,
            filename: row.get(1)?,
            camera: row.get(2)?,
            first: row.get(3)?,
            last: row.get(4)?,
            prev_file: file_link(row.get(5)?),
            next_file: file_link(row.get(6)?),
            tags: ClipTags::parse(row.get_ref(7)?),
            cache_status: row.get(8)?,
            proc_width: row.get(9)?,
            proc_height: row.get(10)?,
        })
    }
}

/// One entry of a camera's processing-resolution history, covering
/// `[first, last]` inclusive.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ProcSizeRange {
    pub width: i32,
    pub height: i32,
    pub first: Time,
    pub last: Time,
}

/// Which way [`ClipIndex::get_file_at`] may look when no file contains the
/// requested time.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SeekDirection {
    Any,
    Before,
    After,
}

/// External video-splitting primitive used when a rename or deletion cuts
/// a file in two. Implemented outside this crate by the video toolkit.
pub trait Remuxer {
    /// Remuxes the portion of `src` between the given offsets (milliseconds
    /// relative to the start of the file) into `dst`, returning the actual
    /// offset of the first recovered frame.
    fn remux_sub_clip(
        &self,
        src: &Path,
        dst: &Path,
        start_offset: Duration,
        end_offset: Duration,
    ) -> Result<Duration, Error>;

    /// Millisecond offsets of every frame in `src`, sorted ascending.
    fn frame_times(&self, src: &Path) -> Result<Vec<Duration>, Error>;
}

fn file_link(s: Option<String>) -> Option<String> {
    s.filter(|s| !s.is_empty())
}

/// Converts a possibly-Windows-style stored path into the POSIX form used
/// as the canonical key.
fn posix_name(name: &str) -> String {
    name.replace('\\', "/")
}

/// `foo/bar.mp4` + `a` -> `foo/bara.mp4`; a missing extension appends.
fn split_name(filename: &str, marker: char) -> String {
    match filename.rsplit_once('.') {
        Some((stem, ext)) => format!("{stem}{marker}.{ext}"),
        None => format!("{filename}{marker}"),
    }
}

pub struct ClipIndex<C: Clocks> {
    conn: rusqlite::Connection,
    clocks: C,

    /// 1-entry cache avoiding a database hit for repeated
    /// [`ClipIndex::get_proc_size`] calls on the same file. No coherency
    /// concern: a file's processing size never changes.
    proc_size_cache: Option<(String, (i32, i32))>,

    /// Per camera, the `lastMs` of the newest cache file added this run.
    max_time_added: FastHashMap<String, Time>,

    /// Per camera, save ranges beyond the newest file, applied as future
    /// cache files arrive.
    pending_saves: FastHashMap<String, Vec<(Time, Time)>>,

    /// The active merge threshold in seconds; half of it pads each saved
    /// range so merged clips always have backing video.
    clip_merge_threshold: i64,

    /// The full `clipPadding` history, loaded lazily, dropped on write.
    merge_threshold_cache: Option<Vec<(Time, i64)>>,
}

impl<C: Clocks> ClipIndex<C> {
    /// Opens (creating/upgrading as necessary) the index at `path`.
    pub fn open(clocks: C, path: &Path) -> Result<Self, Error> {
        let conn = rusqlite::Connection::open(path)
            .map_err(|e| err!(Unavailable, msg("can't open clip db {}", path.display()), source(e)))?;
        Self::with_conn(clocks, conn)
    }

    /// Opens the index over an existing connection (in-memory in tests).
    pub fn with_conn(clocks: C, conn: rusqlite::Connection) -> Result<Self, Error> {
        // journal_mode returns the resulting mode as a row.
        conn.query_row("pragma journal_mode = persist", [], |_| Ok(()))?;
        conn.execute_batch("pragma page_size = 4096")?;
        let mut index = ClipIndex {
            conn,
            clocks,
            proc_size_cache: None,
            max_time_added: FastHashMap::default(),
            pending_saves: FastHashMap::default(),
            clip_merge_threshold: 0,
            merge_threshold_cache: None,
        };
        index.init_schema()?;
        Ok(index)
    }

    fn init_schema(&mut self) -> Result<(), Error> {
        let had_proc_sizes: bool = self
            .conn
            .query_row(
                "select count(*) from sqlite_master where type = 'table' and name = 'clipProcSizes'",
                [],
                |row| row.get::<_, i64>(0).map(|n| n > 0),
            )?;

        // Schema creation can race with another process opening the same
        // database; "already exists" failures are expected and harmless.
        for sql in [CREATE_CLIPS_SQL, CREATE_PADDING_SQL, CREATE_PROC_SIZES_SQL] {
            if let Err(e) = self.conn.execute_batch(sql) {
                info!(err = %e, "assuming concurrent schema creation");
            }
        }
        self.upgrade_old_tables()?;
        self.conn.execute_batch(CREATE_INDICES_SQL)?;
        if !had_proc_sizes {
            self.populate_proc_size_table()?;
        }
        Ok(())
    }

    /// Upgrades from older versions of the tables by adding missing
    /// columns. Expect that the first statement might fail if another
    /// process decided to upgrade at nearly the same time.
    fn upgrade_old_tables(&mut self) -> Result<(), Error> {
        let create_sql: String = self.conn.query_row(
            r#"select sql from sqlite_master where type = 'table' and name = 'clips'"#,
            [],
            |row| row.get(0),
        )?;
        if !create_sql.contains("isCache") {
            if let Err(e) = self
                .conn
                .execute("alter table clips add column isCache integer", [])
            {
                info!(err = %e, "assuming concurrent isCache upgrade");
                return Ok(());
            }
        }
        if !create_sql.contains("procWidth") {
            if let Err(e) = self
                .conn
                .execute("alter table clips add column procWidth integer default 0", [])
            {
                info!(err = %e, "assuming concurrent procWidth upgrade");
                return Ok(());
            }
            self.conn
                .execute("alter table clips add column procHeight integer default 0", [])?;
        }
        Ok(())
    }

    /// Seeds `clipProcSizes` from the sizes recorded on existing clips, for
    /// databases that predate the table.
    fn populate_proc_size_table(&mut self) -> Result<(), Error> {
        let cameras = self.get_camera_locations()?;
        for camera in cameras {
            let mut stmt = self.conn.prepare_cached(
                r#"
                select procWidth, procHeight, firstMs from clips
                where camLoc = :camLoc order by firstMs
                "#,
            )?;
            let rows: Vec<(i32, i32, Time)> = stmt
                .query_map(named_params! {":camLoc": camera}, |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })?
                .collect::<rusqlite::Result<_>>()?;
            let mut last: Option<(i32, i32)> = None;
            for (w, h, first) in rows {
                if last != Some((w, h)) {
                    self.add_proc_size(&camera, first, w, h)?;
                    last = Some((w, h));
                }
            }
        }
        Ok(())
    }

    pub fn clocks(&self) -> &C {
        &self.clocks
    }

    fn begin(&self) -> Result<(), Error> {
        crate::sqlutil::begin(&self.conn)
    }

    fn rollback(&self) {
        crate::sqlutil::rollback(&self.conn)
    }

    fn commit(&self) -> Result<(), Error> {
        crate::sqlutil::commit_with_retry(&self.conn, &self.clocks)
    }

    fn in_transaction<T>(&self, f: impl FnOnce(&Self) -> Result<T, Error>) -> Result<T, Error> {
        self.begin()?;
        match f(self) {
            Ok(v) => {
                self.commit()?;
                Ok(v)
            }
            Err(e) => {
                self.rollback();
                Err(e)
            }
        }
    }

    /// Inserts a clip, patching continuity links on its neighbors and
    /// promoting any pending saved times that fall within it.
    pub fn add_clip(&mut self, clip: ClipToInsert) -> Result<(), Error> {
        let filename = posix_name(&clip.filename);
        let camera = clip.camera.clone();
        let mut prev_file = clip.prev_file.as_deref().map(posix_name).unwrap_or_default();
        let next_file = clip.next_file.as_deref().map(posix_name).unwrap_or_default();

        self.begin()?;
        let r = (|| -> Result<(), Error> {
            if !prev_file.is_empty() && self.get_clip(&prev_file)?.is_none() {
                prev_file = self.find_renamed_prev(&prev_file)?.unwrap_or_default();
            }

            // Promote pending saves into this file's tags before insert.
            let mut tags = ClipTags::default();
            if clip.cache_status == CacheStatus::Cache {
                self.max_time_added.insert(camera.clone(), clip.last);
                let mut pending: Vec<(i64, i64)> = self
                    .pending_saves
                    .remove(&camera)
                    .unwrap_or_default()
                    .iter()
                    .map(|&(s, e)| (s.0, e.0))
                    .collect();
                pending.sort_unstable();
                let pending = compress_ranges(&pending);
                for &(s, e) in pending
                    .iter()
                    .filter(|&&(s, e)| s <= clip.last.0 && e >= clip.first.0)
                {
                    tags.save_times
                        .push((Time(s.max(clip.first.0)), Time(e.min(clip.last.0))));
                }
                let remaining: Vec<(Time, Time)> = pending
                    .iter()
                    .filter(|&&(_, e)| e > clip.last.0)
                    .map(|&(s, e)| (Time(s), Time(e)))
                    .collect();
                if !remaining.is_empty() {
                    self.pending_saves.insert(camera.clone(), remaining);
                }
            }

            let mut stmt = self.conn.prepare_cached(INSERT_CLIP_SQL)?;
            stmt.execute(named_params! {
                ":filename": &filename,
                ":camLoc": &camera,
                ":firstMs": clip.first,
                ":lastMs": clip.last,
                ":prevFile": &prev_file,
                ":nextFile": &next_file,
                ":tags": tags.serialize(),
                ":isCache": clip.cache_status,
                ":procWidth": clip.proc_width,
                ":procHeight": clip.proc_height,
            })?;

            if !prev_file.is_empty() {
                self.conn.execute(
                    "update clips set nextFile = ?1 where camLoc = ?2 and filename = ?3",
                    params![filename, camera, prev_file],
                )?;
            }
            if !next_file.is_empty() {
                self.conn.execute(
                    "update clips set prevFile = ?1 where camLoc = ?2 and filename = ?3",
                    params![filename, camera, next_file],
                )?;
            }

            let old = self.get_last_proc_size(&camera)?;
            if old != Some((clip.proc_width, clip.proc_height)) {
                info!(
                    camera = %camera,
                    ?old,
                    new = ?(clip.proc_width, clip.proc_height),
                    as_of = clip.first.0,
                    "processing size changed"
                );
                self.add_proc_size(&camera, clip.first, clip.proc_width, clip.proc_height)?;
            }
            Ok(())
        })();
        match r {
            Ok(()) => self.commit(),
            Err(e) => {
                self.rollback();
                Err(e)
            }
        }
    }

    /// Looks for deleted-marker renames of a missing previous file: the
    /// basename with 1..=5 trailing `r` markers. Returns the newest match.
    fn find_renamed_prev(&self, prev_file: &str) -> Result<Option<String>, Error> {
        let (stem, ext) = prev_file
            .rsplit_once('.')
            .map(|(s, e)| (s, Some(e)))
            .unwrap_or((prev_file, None));
        let mut candidates: Vec<String> = Vec::with_capacity(MAX_DELETE_MARKERS);
        for i in 1..=MAX_DELETE_MARKERS {
            let markers = "r".repeat(i);
            candidates.push(match ext {
                Some(ext) => format!("{stem}{markers}.{ext}"),
                None => format!("{stem}{markers}"),
            });
        }
        let mut stmt = self.conn.prepare_cached(
            r#"
            select filename from clips
            where filename in (?1, ?2, ?3, ?4, ?5)
            order by filename
            "#,
        )?;
        let names: Vec<String> = stmt
            .query_map(
                params![
                    candidates[0],
                    candidates[1],
                    candidates[2],
                    candidates[3],
                    candidates[4]
                ],
                |row| row.get(0),
            )?
            .collect::<rusqlite::Result<_>>()?;
        Ok(names.last().cloned())
    }

    /// Removes a clip row and nulls any links referencing it.
    pub fn remove_clip(&mut self, filename: &str) -> Result<(), Error> {
        let filename = posix_name(filename);
        self.in_transaction(|s| {
            s.conn
                .execute("delete from clips where filename = ?1", params![filename])?;
            s.conn.execute(
                r#"update clips set prevFile = "" where prevFile = ?1"#,
                params![filename],
            )?;
            s.conn.execute(
                r#"update clips set nextFile = "" where nextFile = ?1"#,
                params![filename],
            )?;
            Ok(())
        })
    }

    pub fn get_clip(&self, filename: &str) -> Result<Option<Clip>, Error> {
        let mut stmt = self.conn.prepare_cached(CLIP_BY_NAME_SQL)?;
        stmt.query_row(named_params! {":filename": posix_name(filename)}, Clip::from_row)
            .optional()
            .map_err(Into::into)
    }

    /// Returns the file containing `ms`, or failing that the nearest file
    /// in the requested direction within `tolerance` (`None` = unbounded).
    pub fn get_file_at(
        &mut self,
        camera: &str,
        ms: Time,
        tolerance: Option<Duration>,
        direction: SeekDirection,
    ) -> Result<Option<String>, Error> {
        let mut stmt = self.conn.prepare_cached(FILE_CONTAINING_SQL)?;
        let containing = stmt
            .query_row(named_params! {":camLoc": camera, ":ms": ms}, |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i32>(1)?,
                    row.get::<_, i32>(2)?,
                ))
            })
            .optional()?;
        if let Some((filename, w, h)) = containing {
            self.proc_size_cache = Some((filename.clone(), (w, h)));
            return Ok(Some(filename));
        }

        let mut after: Option<(String, Time)> = None;
        if direction != SeekDirection::Before {
            let limit = tolerance.map(|t| ms + t).unwrap_or(Time::MAX);
            let mut stmt = self.conn.prepare_cached(FILE_AFTER_SQL)?;
            after = stmt
                .query_row(
                    named_params! {":camLoc": camera, ":ms": ms, ":limit": limit},
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            if direction == SeekDirection::After {
                return Ok(after.map(|(f, _)| f));
            }
        }

        let limit = tolerance.map(|t| ms - t).unwrap_or(Time::MIN);
        let mut stmt = self.conn.prepare_cached(FILE_BEFORE_SQL)?;
        let before: Option<(String, Time)> = stmt
            .query_row(
                named_params! {":camLoc": camera, ":ms": ms, ":limit": limit},
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        Ok(match (before, after) {
            (Some((b, _)), None) => Some(b),
            (None, Some((a, _))) => Some(a),
            (Some((b, b_ms)), Some((a, a_ms))) => {
                if ms - b_ms < a_ms - ms {
                    Some(b)
                } else {
                    Some(a)
                }
            }
            (None, None) => None,
        })
    }

    /// Files whose `[firstMs, lastMs]` overlaps `[start, end]`, sorted by
    /// start time.
    pub fn get_files_between(
        &self,
        camera: &str,
        start: Time,
        end: Time,
    ) -> Result<Vec<(String, Time, Time)>, Error> {
        let mut stmt = self.conn.prepare_cached(FILES_BETWEEN_SQL)?;
        let rows = stmt
            .query_map(
                named_params! {":camLoc": camera, ":start": start, ":end": end},
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?
            .collect::<rusqlite::Result<_>>()?;
        Ok(rows)
    }

    /// Returns the compressed list of time ranges with available video for
    /// `camera`, clipped to `[first, last]`.
    ///
    /// Adjacent files (consistently linked via `prevFile`/`nextFile`) are
    /// joined into one range; others are not. With `saved_only`, non-cache
    /// files count as fully saved while cache files contribute only their
    /// `saveTimes` intervals (clipped to the file's own bounds).
    pub fn get_times_from_location(
        &self,
        camera: &str,
        first: Option<Time>,
        last: Option<Time>,
        saved_only: bool,
    ) -> Result<Vec<(Time, Time)>, Error> {
        let window_first = first.unwrap_or(Time::MIN);
        let window_last = last.unwrap_or(Time::MAX);

        struct Piece {
            filename: String,
            first: Time,
            last: Time,
            prev: Option<String>,
            next: Option<String>,
        }

        let mut stmt = self.conn.prepare_cached(TIMES_FROM_LOCATION_SQL)?;
        let mut rows = stmt.query(named_params! {
            ":camLoc": camera,
            ":first": window_first,
            ":last": window_last,
        })?;
        let mut pieces: Vec<Piece> = Vec::new();
        while let Some(row) = rows.next()? {
            let filename: String = row.get(0)?;
            let file_first: Time = row.get(1)?;
            let file_last: Time = row.get(2)?;
            let prev = file_link(row.get(3)?);
            let next = file_link(row.get(4)?);
            let cache_status: CacheStatus = row.get(6)?;
            if !saved_only || cache_status != CacheStatus::Cache {
                pieces.push(Piece {
                    filename,
                    first: file_first,
                    last: file_last,
                    prev,
                    next,
                });
            } else {
                let tags = ClipTags::parse(row.get_ref(5)?);
                for (s, e) in tags.save_times {
                    if s > e || s > file_last || e < file_first {
                        continue;
                    }
                    // A partial save breaks the chain on its open side.
                    let real_prev = if s > file_first { None } else { prev.clone() };
                    let real_next = if e < file_last { None } else { next.clone() };
                    pieces.push(Piece {
                        filename: filename.clone(),
                        first: s.max(file_first),
                        last: e.min(file_last),
                        prev: real_prev,
                        next: real_next,
                    });
                }
            }
        }

        // Combine adjacent pieces.
        let mut ranges: Vec<(Time, Time)> = Vec::new();
        let mut seq_first: Option<Time> = None;
        for i in 0..pieces.len() {
            let cur = &pieces[i];
            let start = *seq_first.get_or_insert(cur.first);
            let joined = pieces.get(i + 1).is_some_and(|next| {
                cur.next.as_deref() == Some(next.filename.as_str())
                    && next.prev.as_deref() == Some(cur.filename.as_str())
            });
            if !joined {
                ranges.push((start, cur.last));
                seq_first = None;
            }
        }

        // Trim so nothing is outside the requested window.
        if let Some(r) = ranges.first_mut() {
            if r.0 < window_first {
                r.0 = window_first;
            }
        }
        if let Some(r) = ranges.last_mut() {
            if r.1 > window_last {
                r.1 = window_last;
            }
        }
        Ok(ranges)
    }

    /// Marks portions of cache to be saved.
    ///
    /// Ranges are padded by half the merge threshold on each side (so
    /// merged clips always have backing video), compressed, and merged into
    /// the `saveTimes` of every overlapping file, clipped to each file's
    /// bounds. Portions beyond the newest known clip are buffered and
    /// applied when future files arrive, unless `existing_only`.
    ///
    /// With `existing_only`, returns the delay before the caller should
    /// retry (`Duration::ZERO` when done or given up): a short delay while
    /// the needed file may still flush shortly, a long one when the request
    /// is stale.
    pub fn mark_times_as_saved(
        &mut self,
        camera: &str,
        time_ranges: &[(Time, Time)],
        existing_only: bool,
    ) -> Result<Duration, Error> {
        if time_ranges.is_empty() {
            return Ok(Duration::ZERO);
        }

        let padding = Duration(self.clip_merge_threshold * MS_PER_SEC / 2);
        let mut padded: Vec<(i64, i64)> = time_ranges
            .iter()
            .map(|&(s, e)| ((s - padding).0, (e + padding).0))
            .collect();
        padded.sort_unstable();
        let ranges = compress_ranges(&padded);

        let now = self.clocks.realtime();
        let max_add_time = Time(ranges.last().expect("nonempty").1);
        let start_passed =
            Time(ranges[0].0) <= self.max_time_added.get(camera).copied().unwrap_or(now);

        if start_passed || existing_only {
            let mut max_end_time = Time(0);
            let stored = self.get_files_between(camera, Time(ranges[0].0), max_add_time)?;
            self.in_transaction(|s| {
                for (filename, file_first, file_last) in &stored {
                    max_end_time = max_end_time.max(*file_last);
                    let mut tags = s.get_file_tags(filename)?;
                    let mut save_times: Vec<(i64, i64)> = tags
                        .save_times
                        .iter()
                        .map(|&(a, b)| (a.0, b.0))
                        .collect();
                    save_times.extend(ranges.iter().filter_map(|&(x, y)| {
                        if x <= file_last.0 && y >= file_first.0 {
                            Some((x.max(file_first.0), y.min(file_last.0)))
                        } else {
                            None
                        }
                    }));
                    save_times.sort_unstable();
                    tags.save_times = compress_ranges(&save_times)
                        .into_iter()
                        .map(|(a, b)| (Time(a), Time(b)))
                        .collect();
                    s.set_file_tags_inner(filename, &tags)?;
                }
                Ok(())
            })?;

            if existing_only {
                if max_end_time < max_add_time {
                    // If there may still be flushes pending either do a
                    // quick retry (the file may make it into the index
                    // within seconds) or a long retry (the file probably
                    // never existed, but check once more in case things
                    // were just jammed up).
                    if now < max_add_time {
                        return Ok(RETRY_FIRST);
                    } else if now < max_add_time + RETRY_MAX {
                        return Ok(RETRY_MAX);
                    }
                }
                return Ok(Duration::ZERO);
            }
        }

        // Buffer anything past what is currently in the db to be applied as
        // future files arrive.
        let last_added = self.max_time_added.get(camera).copied().unwrap_or(Time(0));
        let pending = self.pending_saves.entry(camera.to_owned()).or_default();
        pending.extend(
            ranges
                .iter()
                .filter(|&&(_, y)| y >= last_added.0 + 1)
                .map(|&(x, y)| (Time(x), Time(y))),
        );
        Ok(Duration::ZERO)
    }

    /// Renames a camera location as of `change`, splitting any file that
    /// crosses the boundary into `a`/`b` pieces via the remuxer. If a remux
    /// fails, the original file and row are preserved.
    pub fn update_location_name(
        &mut self,
        old_name: &str,
        new_name: &str,
        change: Time,
        video_folder: &Path,
        remuxer: &dyn Remuxer,
    ) -> Result<(), Error> {
        let crossing: Vec<Clip> = {
            let mut stmt = self.conn.prepare_cached(CLIPS_CROSSING_SQL)?;
            let rows = stmt.query_map(
                named_params! {":camLoc": old_name, ":changeMs": change},
                Clip::from_row,
            )?
            .collect::<rusqlite::Result<_>>()?;
            rows
        };

        for clip in crossing {
            let orig_path = video_folder.join(&clip.filename);
            let name_a = split_name(&clip.filename, 'a');
            let name_b = split_name(&clip.filename, 'b');

            let left = remuxer.remux_sub_clip(
                &orig_path,
                &video_folder.join(&name_a),
                Duration::ZERO,
                change - clip.first + REENCODE_PREROLL,
            );
            let right = remuxer.remux_sub_clip(
                &orig_path,
                &video_folder.join(&name_b),
                Duration((change - clip.first - REENCODE_PREROLL).0.max(0)),
                clip.last - clip.first + REENCODE_PREROLL,
            );
            let (left_off, right_off) = match (left, right) {
                (Ok(l), Ok(r)) => (l, r),
                (l, r) => {
                    warn!(
                        file = %clip.filename,
                        left_err = l.err().map(|e| e.chain().to_string()),
                        right_err = r.err().map(|e| e.chain().to_string()),
                        "couldn't split clip at rename boundary; preserving original"
                    );
                    continue;
                }
            };

            let mut tags_a = clip.tags.clone();
            tags_a.trim_to(clip.first, change);
            let mut tags_b = clip.tags.clone();
            tags_b.trim_to(change, clip.last);

            self.in_transaction(|s| {
                s.conn
                    .execute("delete from clips where uid = ?1", params![clip.uid])?;
                let mut stmt = s.conn.prepare_cached(INSERT_CLIP_SQL)?;
                stmt.execute(named_params! {
                    ":filename": posix_name(&name_a),
                    ":camLoc": &clip.camera,
                    ":firstMs": clip.first + left_off,
                    ":lastMs": change,
                    ":prevFile": clip.prev_file.as_deref().unwrap_or(""),
                    ":nextFile": "",
                    ":tags": tags_a.serialize(),
                    ":isCache": clip.cache_status,
                    ":procWidth": clip.proc_width,
                    ":procHeight": clip.proc_height,
                })?;
                s.conn.execute(
                    "update clips set nextFile = ?1 where nextFile = ?2",
                    params![posix_name(&name_a), clip.filename],
                )?;
                stmt.execute(named_params! {
                    ":filename": posix_name(&name_b),
                    ":camLoc": new_name,
                    ":firstMs": clip.first + right_off,
                    ":lastMs": clip.last,
                    ":prevFile": "",
                    ":nextFile": clip.next_file.as_deref().unwrap_or(""),
                    ":tags": tags_b.serialize(),
                    ":isCache": clip.cache_status,
                    ":procWidth": clip.proc_width,
                    ":procHeight": clip.proc_height,
                })?;
                s.conn.execute(
                    "update clips set prevFile = ?1 where prevFile = ?2",
                    params![posix_name(&name_b), clip.filename],
                )?;
                Ok(())
            })?;

            if let Err(e) = std::fs::remove_file(&orig_path) {
                warn!(path = %orig_path.display(), err = %e, "couldn't remove split file");
            }
        }

        // Files entirely after the change simply move to the new name.
        self.in_transaction(|s| {
            s.conn.execute(
                "update clips set camLoc = ?1 where camLoc = ?2 and firstMs >= ?3",
                params![new_name, old_name, change],
            )?;
            Ok(())
        })
    }

    /// Deletes `[start, stop]` of a camera's video, splitting boundary
    /// files via the remuxer (preserving the retained portions as `l`/`r`
    /// pieces). Returns paths whose filesystem delete failed.
    pub fn delete_camera_location_data_between(
        &mut self,
        camera: &str,
        start: Time,
        stop: Time,
        video_folder: &Path,
        remuxer: &dyn Remuxer,
    ) -> Result<Vec<PathBuf>, Error> {
        let mut failed_deletes = Vec::new();
        let affected = self.get_files_between(camera, start, stop)?;

        for (filename, _, _) in affected {
            let Some(clip) = self.get_clip(&filename)? else {
                continue;
            };
            let orig_path = video_folder.join(&clip.filename);

            let mut frame_times: Vec<Duration> = Vec::new();
            let mut clip_start = clip.first;
            let mut clip_stop = clip.last;
            if clip.first < start || clip.last > stop {
                frame_times = remuxer.frame_times(&orig_path).unwrap_or_default();
                if frame_times.is_empty() {
                    // Without frame times there is no way to splice, so the
                    // whole file goes.
                    clip_start = start;
                    clip_stop = stop;
                }
            }

            // Pick split points that correspond to actual frames.
            let frame_at = |want: Duration, upper: bool| -> Time {
                let i = if upper {
                    frame_times.partition_point(|&t| t <= want)
                } else {
                    frame_times.partition_point(|&t| t < want)
                };
                let i = i.min(frame_times.len().saturating_sub(1));
                clip_start + frame_times[i]
            };

            let keep_left = clip_start < start;
            let keep_right = clip_stop > stop;

            let mut left_insert = None;
            if keep_left {
                let change = frame_at(start - clip_start, false);
                let name = split_name(&clip.filename, 'l');
                match remuxer.remux_sub_clip(
                    &orig_path,
                    &video_folder.join(&name),
                    Duration::ZERO,
                    change - clip_start + REENCODE_PREROLL,
                ) {
                    Ok(off) => {
                        if off != Duration::ZERO {
                            // Unusual: remux from the first frame should
                            // recover the first frame.
                            warn!(file = %name, offset = off.0, "left piece created with offset");
                        }
                        left_insert = Some((name, clip_start + off, change));
                    }
                    Err(e) => {
                        warn!(file = %clip.filename, err = %e.chain(),
                              "couldn't create left piece; preserving original");
                        continue;
                    }
                }
            }

            let mut right_insert = None;
            if keep_right {
                let change = frame_at(stop - clip_start, true);
                let name = split_name(&clip.filename, 'r');
                match remuxer.remux_sub_clip(
                    &orig_path,
                    &video_folder.join(&name),
                    Duration((change - clip_start - REENCODE_PREROLL).0.max(0)),
                    clip_stop - clip_start + REENCODE_PREROLL,
                ) {
                    Ok(off) => right_insert = Some((name, clip_start + off, clip_stop)),
                    Err(e) => {
                        warn!(file = %clip.filename, err = %e.chain(),
                              "couldn't create right piece; preserving original");
                        continue;
                    }
                }
            }

            self.in_transaction(|s| {
                match &left_insert {
                    Some((name, first, last)) => {
                        let mut tags = clip.tags.clone();
                        tags.trim_to(*first, *last);
                        let mut stmt = s.conn.prepare_cached(INSERT_CLIP_SQL)?;
                        stmt.execute(named_params! {
                            ":filename": posix_name(name),
                            ":camLoc": camera,
                            ":firstMs": *first,
                            ":lastMs": *last,
                            ":prevFile": clip.prev_file.as_deref().unwrap_or(""),
                            ":nextFile": "",
                            ":tags": tags.serialize(),
                            ":isCache": clip.cache_status,
                            ":procWidth": clip.proc_width,
                            ":procHeight": clip.proc_height,
                        })?;
                        s.conn.execute(
                            "update clips set nextFile = ?1 where nextFile = ?2",
                            params![posix_name(name), clip.filename],
                        )?;
                    }
                    None => {
                        s.conn.execute(
                            r#"update clips set nextFile = "" where nextFile = ?1"#,
                            params![clip.filename],
                        )?;
                    }
                }
                match &right_insert {
                    Some((name, first, last)) => {
                        let mut tags = clip.tags.clone();
                        tags.trim_to(*first, *last);
                        let mut stmt = s.conn.prepare_cached(INSERT_CLIP_SQL)?;
                        stmt.execute(named_params! {
                            ":filename": posix_name(name),
                            ":camLoc": camera,
                            ":firstMs": *first,
                            ":lastMs": *last,
                            ":prevFile": "",
                            ":nextFile": clip.next_file.as_deref().unwrap_or(""),
                            ":tags": tags.serialize(),
                            ":isCache": clip.cache_status,
                            ":procWidth": clip.proc_width,
                            ":procHeight": clip.proc_height,
                        })?;
                        s.conn.execute(
                            "update clips set prevFile = ?1 where prevFile = ?2",
                            params![posix_name(name), clip.filename],
                        )?;
                    }
                    None => {
                        s.conn.execute(
                            r#"update clips set prevFile = "" where prevFile = ?1"#,
                            params![clip.filename],
                        )?;
                    }
                }
                s.conn
                    .execute("delete from clips where uid = ?1", params![clip.uid])?;
                Ok(())
            })?;

            if let Err(e) = std::fs::remove_file(&orig_path) {
                info!(path = %orig_path.display(), err = %e, "couldn't remove file");
                failed_deletes.push(orig_path);
            }
        }

        Ok(failed_deletes)
    }

    /// Removes all rows for a location.
    pub fn delete_location(&mut self, camera: &str) -> Result<(), Error> {
        self.in_transaction(|s| {
            s.conn
                .execute("delete from clips where camLoc = ?1", params![camera])?;
            s.conn.execute(
                "delete from clipProcSizes where camLoc = ?1",
                params![camera],
            )?;
            Ok(())
        })
    }

    /// True if any clip overlaps `[first, last_plus_1)` (optionally limited
    /// to one camera).
    pub fn has_video_between(
        &self,
        camera: Option<&str>,
        first: Time,
        last_plus_1: Time,
    ) -> Result<bool, Error> {
        let n: Option<i64> = match camera {
            Some(camera) => self
                .conn
                .query_row(
                    "select uid from clips where camLoc = ?1 and lastMs >= ?2 and firstMs < ?3 limit 1",
                    params![camera, first, last_plus_1],
                    |row| row.get(0),
                )
                .optional()?,
            None => self
                .conn
                .query_row(
                    "select uid from clips where lastMs >= ?1 and firstMs < ?2 limit 1",
                    params![first, last_plus_1],
                    |row| row.get(0),
                )
                .optional()?,
        };
        Ok(n.is_some())
    }

    /// The most recent ms available for `camera`, if any.
    pub fn get_most_recent_time_at(&self, camera: &str) -> Result<Option<Time>, Error> {
        self.conn
            .query_row(
                "select max(lastMs) from clips where camLoc = ?1",
                params![camera],
                |row| row.get::<_, Option<Time>>(0),
            )
            .map_err(Into::into)
    }

    pub fn get_file_time_information(&self, filename: &str) -> Result<Option<(Time, Time)>, Error> {
        self.conn
            .query_row(
                "select firstMs, lastMs from clips where filename = ?1",
                params![posix_name(filename)],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn get_next_file(&self, filename: &str) -> Result<Option<String>, Error> {
        let link: Option<Option<String>> = self
            .conn
            .query_row(
                "select nextFile from clips where filename = ?1",
                params![posix_name(filename)],
                |row| row.get(0),
            )
            .optional()?;
        Ok(link.flatten().and_then(|s| file_link(Some(s))))
    }

    pub fn get_prev_file(&self, filename: &str) -> Result<Option<String>, Error> {
        let link: Option<Option<String>> = self
            .conn
            .query_row(
                "select prevFile from clips where filename = ?1",
                params![posix_name(filename)],
                |row| row.get(0),
            )
            .optional()?;
        Ok(link.flatten().and_then(|s| file_link(Some(s))))
    }

    pub fn get_camera_locations(&self) -> Result<Vec<String>, Error> {
        let mut stmt = self
            .conn
            .prepare_cached("select distinct camLoc from clips")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        Ok(names)
    }

    /// Files with the given cache status, ordered by start time, as
    /// `(filename, camera, first, last)`.
    pub fn get_files_by_status(
        &self,
        status: CacheStatus,
    ) -> Result<Vec<(String, String, Time, Time)>, Error> {
        let mut stmt = self.conn.prepare_cached(
            r#"
            select filename, camLoc, firstMs, lastMs from clips
            where isCache = :isCache order by firstMs
            "#,
        )?;
        let rows = stmt
            .query_map(named_params! {":isCache": status}, |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?
            .collect::<rusqlite::Result<_>>()?;
        Ok(rows)
    }

    pub fn get_file_tags(&self, filename: &str) -> Result<ClipTags, Error> {
        let mut stmt = self
            .conn
            .prepare_cached("select tags from clips where filename = ?1")?;
        let tags = stmt
            .query_row(params![posix_name(filename)], |row| {
                Ok(ClipTags::parse(row.get_ref(0)?))
            })
            .optional()?;
        Ok(tags.unwrap_or_default())
    }

    fn set_file_tags_inner(&self, filename: &str, tags: &ClipTags) -> Result<(), Error> {
        self.conn.execute(
            "update clips set tags = ?1 where filename = ?2",
            params![tags.serialize(), posix_name(filename)],
        )?;
        Ok(())
    }

    pub fn set_file_tags(&mut self, filename: &str, tags: &ClipTags) -> Result<(), Error> {
        self.in_transaction(|s| s.set_file_tags_inner(filename, tags))
    }

    pub fn get_save_time_list(&self, filename: &str) -> Result<Vec<(Time, Time)>, Error> {
        Ok(self.get_file_tags(filename)?.save_times)
    }

    /// The size the given file was processed at, or `(0, 0)` for databases
    /// predating size tracking.
    pub fn get_proc_size(&mut self, filename: &str) -> Result<(i32, i32), Error> {
        if let Some((cached, size)) = &self.proc_size_cache {
            if cached == filename {
                return Ok(*size);
            }
        }
        let size: Option<(i32, i32)> = self
            .conn
            .query_row(
                "select procWidth, procHeight from clips where filename = ?1",
                params![posix_name(filename)],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match size {
            Some(size) => {
                self.proc_size_cache = Some((filename.to_owned(), size));
                Ok(size)
            }
            // Another process may delete a file at just the right time; be
            // robust and report "unknown".
            None => Ok((0, 0)),
        }
    }

    fn add_proc_size(&self, camera: &str, first: Time, width: i32, height: i32) -> Result<(), Error> {
        let mut stmt = self.conn.prepare_cached(
            r#"
            insert into clipProcSizes (camLoc,  firstMs,  procWidth,  procHeight)
                               values (:camLoc, :firstMs, :procWidth, :procHeight)
            "#,
        )?;
        stmt.execute(named_params! {
            ":camLoc": camera,
            ":firstMs": first,
            ":procWidth": width,
            ":procHeight": height,
        })?;
        Ok(())
    }

    fn get_last_proc_size(&self, camera: &str) -> Result<Option<(i32, i32)>, Error> {
        self.conn
            .query_row(
                r#"
                select procWidth, procHeight from clipProcSizes
                where camLoc = ?1 order by firstMs desc limit 1
                "#,
                params![camera],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(Into::into)
    }

    /// Slices the camera's processing-size history to `[start, end]`. Each
    /// entry covers `[entry.first, entry.last]`; the final entry extends to
    /// "now".
    pub fn get_unique_proc_sizes_between_times(
        &self,
        camera: &str,
        start: Option<Time>,
        end: Option<Time>,
    ) -> Result<Vec<ProcSizeRange>, Error> {
        let start = start.unwrap_or(Time(0));
        let end = end.unwrap_or_else(|| self.clocks.realtime());
        let mut stmt = self.conn.prepare_cached(
            r#"
            select firstMs, procWidth, procHeight from clipProcSizes
            where camLoc = :camLoc order by firstMs
            "#,
        )?;
        let entries: Vec<(Time, i32, i32)> = stmt
            .query_map(named_params! {":camLoc": camera}, |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<rusqlite::Result<_>>()?;

        let mut result: Vec<ProcSizeRange> = Vec::new();
        let mut close_last = |result: &mut Vec<ProcSizeRange>, next_first: Time| {
            if let Some(prev) = result.last_mut() {
                prev.last = Time(next_first.0 - 1);
            }
        };
        for (first, w, h) in entries {
            let item = ProcSizeRange {
                width: w,
                height: h,
                first,
                last: Time(0),
            };
            if first <= start {
                result = vec![item];
            } else if first <= end {
                close_last(&mut result, first);
                result.push(item);
            } else {
                close_last(&mut result, first);
                break;
            }
        }
        if let Some(last) = result.last_mut() {
            if last.last == Time(0) {
                last.last = self.clocks.realtime();
            }
        }
        Ok(result)
    }

    /// Remembers a merge-threshold change, optionally persisting it.
    pub fn set_clip_merge_threshold(
        &mut self,
        time: Time,
        value_secs: i64,
        update_db: bool,
    ) -> Result<(), Error> {
        info!(value_secs, update_db, "updating clip merge threshold");
        self.clip_merge_threshold = value_secs;
        if update_db {
            self.in_transaction(|s| {
                s.conn.execute(
                    "insert into clipPadding (updateTime, paddingSec) values (?1, ?2)",
                    params![time, value_secs],
                )?;
                Ok(())
            })?;
        }
        if let Some(cache) = &mut self.merge_threshold_cache {
            cache.push((time, value_secs));
        }
        Ok(())
    }

    pub fn clip_merge_threshold(&self) -> i64 {
        self.clip_merge_threshold
    }

    /// The `(updateTime, paddingSec)` entries in effect during
    /// `[start, stop]`: the last entry at-or-before `start` plus every
    /// entry inside the window.
    pub fn get_clip_merge_thresholds(
        &mut self,
        start: Time,
        stop: Time,
    ) -> Result<Vec<(Time, i64)>, Error> {
        if self.merge_threshold_cache.is_none() {
            let mut stmt = self.conn.prepare_cached(
                "select updateTime, paddingSec from clipPadding order by updateTime asc",
            )?;
            let all = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<Vec<(Time, i64)>>>()?;
            self.merge_threshold_cache = Some(all);
        }
        let cache = self.merge_threshold_cache.as_ref().expect("just filled");
        let mut result: Vec<(Time, i64)> = Vec::new();
        for &(t, v) in cache {
            if t <= start {
                result = vec![(t, v)];
            } else if t <= stop {
                result.push((t, v));
            } else {
                break;
            }
        }
        Ok(result)
    }

    /// Consistency check used by tests and `argus check`-style tooling:
    /// verifies the per-camera disjointness and link invariants.
    pub fn check_invariants(&self) -> Result<(), Error> {
        let mut stmt = self.conn.prepare(
            "select filename, camLoc, firstMs, lastMs, prevFile, nextFile from clips \
             order by camLoc, firstMs",
        )?;
        struct Row {
            filename: String,
            camera: String,
            first: Time,
            last: Time,
            prev: Option<String>,
            next: Option<String>,
        }
        let rows: Vec<Row> = stmt
            .query_map([], |row| {
                Ok(Row {
                    filename: row.get(0)?,
                    camera: row.get(1)?,
                    first: row.get(2)?,
                    last: row.get(3)?,
                    prev: file_link(row.get(4)?),
                    next: file_link(row.get(5)?),
                })
            })?
            .collect::<rusqlite::Result<_>>()?;
        for w in rows.windows(2) {
            if w[0].camera == w[1].camera && w[1].first <= w[0].last {
                bail!(
                    FailedPrecondition,
                    msg(
                        "overlapping clips on {}: {} and {}",
                        w[0].camera,
                        w[0].filename,
                        w[1].filename
                    )
                );
            }
        }
        for r in &rows {
            if let Some(next) = &r.next {
                if let Some(n) = rows.iter().find(|c| &c.filename == next) {
                    if n.prev.as_deref() != Some(r.filename.as_str()) {
                        bail!(
                            FailedPrecondition,
                            msg("asymmetric link {} -> {}", r.filename, next)
                        );
                    }
                }
            }
            if r.first > r.last {
                bail!(FailedPrecondition, msg("inverted range on {}", r.filename));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use base::clock::SimulatedClocks;

    fn new_index(boot: Time) -> ClipIndex<SimulatedClocks> {
        testutil::init();
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        ClipIndex::with_conn(SimulatedClocks::new(boot), conn).unwrap()
    }

    fn cache_clip(name: &str, camera: &str, first: i64, last: i64, prev: Option<&str>) -> ClipToInsert {
        ClipToInsert {
            filename: name.to_owned(),
            camera: camera.to_owned(),
            first: Time(first),
            last: Time(last),
            prev_file: prev.map(str::to_owned),
            next_file: None,
            cache_status: CacheStatus::Cache,
            proc_width: 320,
            proc_height: 240,
        }
    }

    #[test]
    fn add_clip_patches_links() {
        let mut index = new_index(Time(100_000));
        index.add_clip(cache_clip("a.mp4", "Door", 0, 10_000, None)).unwrap();
        index
            .add_clip(cache_clip("b.mp4", "Door", 10_001, 20_000, Some("a.mp4")))
            .unwrap();
        assert_eq!(index.get_next_file("a.mp4").unwrap().as_deref(), Some("b.mp4"));
        assert_eq!(index.get_prev_file("b.mp4").unwrap().as_deref(), Some("a.mp4"));
        index.check_invariants().unwrap();

        index.remove_clip("a.mp4").unwrap();
        assert_eq!(index.get_prev_file("b.mp4").unwrap(), None);
    }

    #[test]
    fn add_clip_missing_prev_recovers_deleted_marker() {
        let mut index = new_index(Time(100_000));
        index.add_clip(cache_clip("ar.mp4", "Door", 0, 10_000, None)).unwrap();
        index
            .add_clip(cache_clip("b.mp4", "Door", 10_001, 20_000, Some("a.mp4")))
            .unwrap();
        assert_eq!(index.get_prev_file("b.mp4").unwrap().as_deref(), Some("ar.mp4"));
        assert_eq!(index.get_next_file("ar.mp4").unwrap().as_deref(), Some("b.mp4"));
    }

    #[test]
    fn add_clip_missing_prev_clears_link() {
        let mut index = new_index(Time(100_000));
        index
            .add_clip(cache_clip("b.mp4", "Door", 10_001, 20_000, Some("nope.mp4")))
            .unwrap();
        assert_eq!(index.get_prev_file("b.mp4").unwrap(), None);
    }

    #[test]
    fn get_file_at_directions() {
        let mut index = new_index(Time(100_000));
        index.add_clip(cache_clip("a.mp4", "Door", 0, 10_000, None)).unwrap();
        index
            .add_clip(cache_clip("b.mp4", "Door", 20_000, 30_000, Some("a.mp4")))
            .unwrap();

        // Containment.
        assert_eq!(
            index
                .get_file_at("Door", Time(5_000), None, SeekDirection::Any)
                .unwrap()
                .as_deref(),
            Some("a.mp4")
        );
        // Closest of the two candidates.
        assert_eq!(
            index
                .get_file_at("Door", Time(12_000), None, SeekDirection::Any)
                .unwrap()
                .as_deref(),
            Some("a.mp4")
        );
        assert_eq!(
            index
                .get_file_at("Door", Time(18_000), None, SeekDirection::Any)
                .unwrap()
                .as_deref(),
            Some("b.mp4")
        );
        // Direction restriction.
        assert_eq!(
            index
                .get_file_at("Door", Time(12_000), None, SeekDirection::After)
                .unwrap()
                .as_deref(),
            Some("b.mp4")
        );
        // Tolerance cuts off the search.
        assert_eq!(
            index
                .get_file_at(
                    "Door",
                    Time(15_000),
                    Some(Duration(1_000)),
                    SeekDirection::After
                )
                .unwrap(),
            None
        );
    }

    #[test]
    fn times_from_location_joins_linked_files_only() {
        let mut index = new_index(Time(100_000));
        index.add_clip(cache_clip("a.mp4", "Door", 1_000, 4_500, None)).unwrap();
        // b continues a; c starts a fresh run.
        index
            .add_clip(cache_clip("b.mp4", "Door", 4_501, 6_000, Some("a.mp4")))
            .unwrap();
        index.add_clip(cache_clip("c.mp4", "Door", 7_500, 11_000, None)).unwrap();

        assert_eq!(
            index.get_times_from_location("Door", None, None, false).unwrap(),
            vec![(Time(1_000), Time(6_000)), (Time(7_500), Time(11_000))]
        );
        // Windowed + clipped, as in the doc example.
        assert_eq!(
            index
                .get_times_from_location("Door", Some(Time(5_500)), Some(Time(9_000)), false)
                .unwrap(),
            vec![(Time(5_500), Time(6_000)), (Time(7_500), Time(9_000))]
        );
    }

    #[test]
    fn mark_times_as_saved_across_file_boundary() {
        // Scenario: two linked cache files; a save range crossing their
        // boundary is clipped per file and reads back as one joined range.
        let mut index = new_index(Time(100_000));
        index.add_clip(cache_clip("f1.mp4", "Door", 0, 10_000, None)).unwrap();
        index
            .add_clip(cache_clip("f2.mp4", "Door", 10_001, 20_000, Some("f1.mp4")))
            .unwrap();

        let retry = index
            .mark_times_as_saved("Door", &[(Time(8_000), Time(15_000))], false)
            .unwrap();
        assert_eq!(retry, Duration::ZERO);

        assert_eq!(
            index.get_save_time_list("f1.mp4").unwrap(),
            vec![(Time(8_000), Time(10_000))]
        );
        assert_eq!(
            index.get_save_time_list("f2.mp4").unwrap(),
            vec![(Time(10_001), Time(15_000))]
        );
        assert_eq!(
            index
                .get_times_from_location("Door", Some(Time(0)), Some(Time(25_000)), true)
                .unwrap(),
            vec![(Time(8_000), Time(15_000))]
        );
    }

    #[test]
    fn mark_times_future_ranges_pend_until_file_arrives() {
        let mut index = new_index(Time(100_000));
        index.add_clip(cache_clip("f1.mp4", "Door", 0, 10_000, None)).unwrap();

        // Range extends past the newest clip; the tail must wait.
        index
            .mark_times_as_saved("Door", &[(Time(9_000), Time(15_000))], false)
            .unwrap();
        assert_eq!(
            index.get_save_time_list("f1.mp4").unwrap(),
            vec![(Time(9_000), Time(10_000))]
        );

        index
            .add_clip(cache_clip("f2.mp4", "Door", 10_001, 20_000, Some("f1.mp4")))
            .unwrap();
        assert_eq!(
            index.get_save_time_list("f2.mp4").unwrap(),
            vec![(Time(10_001), Time(15_000))]
        );
    }

    #[test]
    fn mark_times_existing_only_retry_ladder() {
        let mut index = new_index(Time(5_000));
        index.add_clip(cache_clip("f1.mp4", "Door", 0, 10_000, None)).unwrap();

        // Requested end (20 s) is still in the near future of now (5 s):
        // short retry.
        let retry = index
            .mark_times_as_saved("Door", &[(Time(8_000), Time(20_000))], true)
            .unwrap();
        assert_eq!(retry, RETRY_FIRST);

        // Now well past the requested end but within the max window: long
        // retry.
        index.clocks.sleep(std::time::Duration::from_secs(60));
        let retry = index
            .mark_times_as_saved("Door", &[(Time(8_000), Time(20_000))], true)
            .unwrap();
        assert_eq!(retry, RETRY_MAX);

        // Ancient request: give up.
        index.clocks.sleep(std::time::Duration::from_secs(600));
        let retry = index
            .mark_times_as_saved("Door", &[(Time(8_000), Time(20_000))], true)
            .unwrap();
        assert_eq!(retry, Duration::ZERO);
    }

    #[test]
    fn merge_threshold_padding_applies_to_saves() {
        let mut index = new_index(Time(100_000));
        index.set_clip_merge_threshold(Time(0), 4, false).unwrap();
        index.add_clip(cache_clip("f1.mp4", "Door", 0, 60_000, None)).unwrap();
        index
            .mark_times_as_saved("Door", &[(Time(10_000), Time(12_000))], false)
            .unwrap();
        // Padded by threshold/2 = 2 s on each side.
        assert_eq!(
            index.get_save_time_list("f1.mp4").unwrap(),
            vec![(Time(8_000), Time(14_000))]
        );
    }

    #[test]
    fn merge_threshold_history_slicing() {
        let mut index = new_index(Time(100_000));
        index.set_clip_merge_threshold(Time(1_000), 5, true).unwrap();
        index.set_clip_merge_threshold(Time(5_000), 0, true).unwrap();
        index.set_clip_merge_threshold(Time(9_000), 10, true).unwrap();

        assert_eq!(
            index.get_clip_merge_thresholds(Time(2_000), Time(6_000)).unwrap(),
            vec![(Time(1_000), 5), (Time(5_000), 0)]
        );
        assert_eq!(
            index.get_clip_merge_thresholds(Time(6_000), Time(7_000)).unwrap(),
            vec![(Time(5_000), 0)]
        );
        assert_eq!(
            index.get_clip_merge_thresholds(Time(500), Time(20_000)).unwrap(),
            vec![(Time(1_000), 5), (Time(5_000), 0), (Time(9_000), 10)]
        );
    }

    #[test]
    fn proc_size_history() {
        let mut index = new_index(Time(100_000));
        index.add_clip(cache_clip("a.mp4", "Door", 0, 10_000, None)).unwrap();
        let mut hi = cache_clip("b.mp4", "Door", 10_001, 20_000, Some("a.mp4"));
        hi.proc_width = 640;
        hi.proc_height = 480;
        index.add_clip(hi).unwrap();

        let sizes = index
            .get_unique_proc_sizes_between_times("Door", Some(Time(0)), Some(Time(30_000)))
            .unwrap();
        assert_eq!(sizes.len(), 2);
        assert_eq!((sizes[0].width, sizes[0].height), (320, 240));
        assert_eq!(sizes[0].last, Time(10_000)); // next entry's first - 1
        assert_eq!((sizes[1].width, sizes[1].height), (640, 480));
        assert_eq!(sizes[1].last, index.clocks.realtime());

        assert_eq!(index.get_proc_size("a.mp4").unwrap(), (320, 240));
        assert_eq!(index.get_proc_size("b.mp4").unwrap(), (640, 480));
    }

    #[test]
    fn delete_between_splits_straddling_file() {
        let tmp = tempfile::tempdir().unwrap();
        let mut index = new_index(Time(100_000));
        std::fs::write(tmp.path().join("a.mp4"), b"x").unwrap();
        let mut clip = cache_clip("a.mp4", "Door", 0, 30_000, None);
        clip.cache_status = CacheStatus::NonCache;
        index.add_clip(clip).unwrap();

        let remuxer = testutil::FakeRemuxer::with_frame_interval(Duration(30_000), Duration(1_000));
        let failed = index
            .delete_camera_location_data_between(
                "Door",
                Time(10_000),
                Time(20_000),
                tmp.path(),
                &remuxer,
            )
            .unwrap();
        assert_eq!(failed, Vec::<PathBuf>::new());

        assert!(index.get_clip("a.mp4").unwrap().is_none());
        let left = index.get_clip("al.mp4").unwrap().unwrap();
        let right = index.get_clip("ar.mp4").unwrap().unwrap();
        assert_eq!(left.first, Time(0));
        assert_eq!(left.last, Time(10_000));
        // The right piece resumes at the first frame after the deleted
        // window (frames are 1 s apart here).
        assert_eq!(right.first, Time(21_000));
        assert_eq!(right.last, Time(30_000));
        index.check_invariants().unwrap();
    }

    #[test]
    fn delete_between_preserves_original_on_remux_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let mut index = new_index(Time(100_000));
        std::fs::write(tmp.path().join("a.mp4"), b"x").unwrap();
        index.add_clip(cache_clip("a.mp4", "Door", 0, 30_000, None)).unwrap();

        let remuxer = testutil::FakeRemuxer::failing();
        index
            .delete_camera_location_data_between(
                "Door",
                Time(10_000),
                Time(20_000),
                tmp.path(),
                &remuxer,
            )
            .unwrap();

        // The split couldn't be produced, so nothing was destroyed.
        assert!(index.get_clip("a.mp4").unwrap().is_some());
        assert!(tmp.path().join("a.mp4").exists());
    }

    #[test]
    fn rename_splits_and_moves_later_files() {
        let tmp = tempfile::tempdir().unwrap();
        let mut index = new_index(Time(100_000));
        std::fs::write(tmp.path().join("a.mp4"), b"x").unwrap();
        index.add_clip(cache_clip("a.mp4", "Old", 0, 30_000, None)).unwrap();
        index
            .add_clip(cache_clip("b.mp4", "Old", 30_001, 40_000, Some("a.mp4")))
            .unwrap();

        let remuxer = testutil::FakeRemuxer::with_frame_interval(Duration(30_000), Duration(1_000));
        index
            .update_location_name("Old", "New", Time(15_000), tmp.path(), &remuxer)
            .unwrap();

        let a = index.get_clip("aa.mp4").unwrap().unwrap();
        let b = index.get_clip("ab.mp4").unwrap().unwrap();
        assert_eq!(a.camera, "Old");
        assert_eq!(a.last, Time(15_000));
        assert_eq!(b.camera, "New");
        assert_eq!(b.last, Time(30_000));
        // The later file moved wholesale.
        assert_eq!(index.get_clip("b.mp4").unwrap().unwrap().camera, "New");
        // b's prevFile was patched to the right-hand split piece.
        assert_eq!(index.get_prev_file("b.mp4").unwrap().as_deref(), Some("ab.mp4"));
    }
}
