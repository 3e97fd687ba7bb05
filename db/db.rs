// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2016 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The recording metadata store (spec.md §4.9, component C9): schema
//! management, the column-existence cache, and the hot recording
//! operations (`add_recording`/`update_recording`/`get_by_id`/
//! `get_by_time_range`/`delete_by_id`/`delete_oldest_recordings`).
//!
//! All access is serialized through [`Database::lock`]'s mutex, matching
//! spec.md §5's lock-ordering rule: writer mutexes are never held while
//! taking this one, and this one is never held while statting files.

use base::clock::Clocks;
use base::{bail, err, Error};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::params;
use std::cell::RefCell;
use std::collections::HashMap;
use uuid::Uuid;

pub use crate::recording::{Duration, Time};

/// The schema version this binary knows how to run against. See
/// `db/upgrade` for the migrations that bring an older database here.
pub const EXPECTED_SCHEMA_VERSION: i32 = 1;

/// A 64-bit id combining a stream id (high 32 bits) and a per-stream
/// recording id (low 32 bits). Formatted as 16 lowercase hex digits on
/// disk (see `db::dir::CompositeIdPath`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CompositeId(pub i64);

impl CompositeId {
    pub fn new(stream_id: i32, recording_id: i32) -> Self {
        CompositeId((stream_id as i64) << 32 | recording_id as i64)
    }

    pub fn stream(self) -> i32 {
        (self.0 >> 32) as i32
    }

    pub fn recording(self) -> i32 {
        self.0 as i32
    }
}

impl std::fmt::Display for CompositeId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}/{}", self.stream(), self.recording())
    }
}

/// Wraps a 16-byte UUID for storage as a SQLite blob.
pub struct SqlUuid(pub Uuid);

impl rusqlite::types::FromSql for SqlUuid {
    fn column_result(value: rusqlite::types::ValueRef) -> rusqlite::types::FromSqlResult<Self> {
        let uuid = Uuid::from_slice(value.as_blob()?)
            .map_err(|e| rusqlite::types::FromSqlError::Other(Box::new(e)))?;
        Ok(SqlUuid(uuid))
    }
}

impl rusqlite::types::ToSql for SqlUuid {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput> {
        Ok(rusqlite::types::ToSqlOutput::from(self.0.as_bytes().to_vec()))
    }
}

/// A row to be inserted per spec.md §4.9's `add_recording`. Built up by a
/// `recording::SampleIndexEncoder` as samples arrive, then handed to the
/// metadata store once as a unit.
#[derive(Clone, Debug, Default)]
pub struct RecentRecording {
    pub stream_id: i32,
    pub start_90k: i64,
    pub video_sample_entry_id: i32,
    pub sample_file_bytes: u32,
    pub media_duration_90k: i32,
    pub video_samples: i32,
    pub video_sync_samples: i32,
    pub video_index: Vec<u8>,
    pub is_complete: bool,
}

/// A row as returned by `get_by_id`/`get_by_time_range`: spec.md §3's
/// "Recording metadata row".
#[derive(Clone, Debug, PartialEq)]
pub struct ListRecordingsRow {
    pub id: CompositeId,
    pub start_90k: i64,
    pub end_90k: i64,
    pub sample_file_bytes: u32,
    pub width: u16,
    pub height: u16,
    pub video_sample_entry_id: i32,
    pub video_samples: i32,
    pub video_sync_samples: i32,
    pub video_index: Vec<u8>,
    pub is_complete: bool,
}

/// Aggregate recording stats across every stream (spec.md §4.11's
/// Storage Manager "Stats" job).
#[derive(Clone, Copy, Debug, Default)]
pub struct RecordingStats {
    pub total_recordings: i64,
    pub total_bytes: i64,
    pub oldest_90k: Option<i64>,
    pub newest_90k: Option<i64>,
}

/// A distinct codec/resolution configuration, deduplicated by `sha1`.
#[derive(Clone, Debug)]
pub struct VideoSampleEntryToInsert {
    pub width: u16,
    pub height: u16,
    pub rfc6381_codec: String,
    pub data: Vec<u8>,
    pub pasp_h_spacing: u16,
    pub pasp_v_spacing: u16,
}

#[derive(Clone, Debug)]
pub struct VideoSampleEntry {
    pub id: i32,
    pub width: u16,
    pub height: u16,
    pub rfc6381_codec: String,
    pub data: Vec<u8>,
    pub pasp_h_spacing: u16,
    pub pasp_v_spacing: u16,
}

/// A configured stream, as loaded from the `stream` table.
#[derive(Clone, Debug)]
pub struct StreamRow {
    pub id: i32,
    pub name: String,
    pub source: String,
    pub transport: String,
    pub sample_file_dir_id: Option<i32>,
    pub enabled: bool,
    pub detection_enabled: bool,
    pub pre_buffer_seconds: u32,
    pub retention_sec: i64,
    pub quota_bytes: Option<i64>,
}

/// Key into the lazily-populated, never-invalidated column-existence
/// cache (spec.md §3 "Column existence cache", §4.9).
type ColumnKey = (&'static str, &'static str);

/// The locked half of [`Database`]: the SQLite connection plus the
/// process-wide column cache. Only reachable through [`Database::lock`].
pub struct LockedDatabase {
    conn: rusqlite::Connection,
    column_cache: RefCell<HashMap<ColumnKey, bool>>,
}

impl LockedDatabase {
    /// Returns whether `table` has `column`, consulting (and populating) the
    /// process-wide cache. Never invalidated at runtime: the schema is
    /// forward-only, so a column once observed missing/present stays that
    /// way for the process's lifetime.
    pub fn cached_column_exists(&self, table: &'static str, column: &'static str) -> Result<bool, Error> {
        if let Some(v) = self.column_cache.borrow().get(&(table, column)) {
            return Ok(*v);
        }
        let mut stmt = self
            .conn
            .prepare_cached(&format!("pragma table_info({table})"))?;
        let mut exists = false;
        let mut rows = stmt.query(params![])?;
        while let Some(row) = rows.next()? {
            let name: String = row.get(1)?;
            if name == column {
                exists = true;
                break;
            }
        }
        self.column_cache.borrow_mut().insert((table, column), exists);
        Ok(exists)
    }

    /// Inserts a new, possibly-incomplete recording row. Returns the new
    /// `CompositeId` packed as `i64`, or `0` on failure — `0` is never a
    /// valid id (`CompositeId::new` always yields a nonzero recording
    /// component once assigned).
    pub fn add_recording(&mut self, r: RecentRecording) -> i64 {
        match self.add_recording_inner(&r) {
            Ok(id) => id.0,
            Err(e) => {
                tracing::warn!(stream_id = r.stream_id, err = %e, "add_recording failed");
                0
            }
        }
    }

    fn add_recording_inner(&mut self, r: &RecentRecording) -> Result<CompositeId, Error> {
        let tx = self.conn.transaction()?;
        let recording_id: i32 = {
            let mut stmt = tx.prepare_cached(
                "update stream set next_recording_id = next_recording_id + 1 \
                 where id = ? returning next_recording_id - 1",
            )?;
            stmt.query_row(params![r.stream_id], |row| row.get(0))?
        };
        let id = CompositeId::new(r.stream_id, recording_id);
        {
            let mut stmt = tx.prepare_cached(
                "insert into recording (id, stream_id, start_time_90k, end_time_90k, \
                 sample_file_bytes, width, height, video_sample_entry_id, video_samples, \
                 video_sync_samples, video_index, is_complete) \
                 values (:id, :stream_id, :start_90k, :end_90k, :bytes, :width, :height, \
                 :vse_id, :samples, :sync_samples, :video_index, :is_complete)",
            )?;
            let (width, height) = {
                let mut w = tx.prepare_cached("select width, height from video_sample_entry where id = ?")?;
                w.query_row(params![r.video_sample_entry_id], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
                })?
            };
            stmt.execute(rusqlite::named_params! {
                ":id": id.0,
                ":stream_id": r.stream_id,
                ":start_90k": r.start_90k,
                ":end_90k": if r.is_complete { r.start_90k + r.media_duration_90k as i64 } else { 0 },
                ":bytes": r.sample_file_bytes,
                ":width": width,
                ":height": height,
                ":vse_id": r.video_sample_entry_id,
                ":samples": r.video_samples,
                ":sync_samples": r.video_sync_samples,
                ":video_index": &r.video_index,
                ":is_complete": r.is_complete,
            })?;
        }
        tx.commit()?;
        Ok(id)
    }

    /// Idempotently updates a recording's end time, size, and completion
    /// flag (spec.md §4.9's `update_recording`).
    pub fn update_recording(
        &mut self,
        id: CompositeId,
        end_90k: i64,
        sample_file_bytes: u32,
        is_complete: bool,
    ) -> Result<(), Error> {
        let rows = self.conn.execute(
            "update recording set end_time_90k = ?, sample_file_bytes = ?, is_complete = ? where id = ?",
            params![end_90k, sample_file_bytes, is_complete, id.0],
        )?;
        if rows == 0 {
            bail!(NotFound, msg("no such recording {id}"));
        }
        Ok(())
    }

    pub fn get_by_id(&self, id: CompositeId) -> Result<Option<ListRecordingsRow>, Error> {
        let mut stmt = self.conn.prepare_cached(
            "select id, start_time_90k, end_time_90k, sample_file_bytes, width, height, \
             video_sample_entry_id, video_samples, video_sync_samples, video_index, is_complete \
             from recording where id = ?",
        )?;
        let mut rows = stmt.query(params![id.0])?;
        match rows.next()? {
            None => Ok(None),
            Some(row) => Ok(Some(row_to_listing(row)?)),
        }
    }

    /// Returns recordings for `stream_id` overlapping `[start_90k, end_90k)`,
    /// ordered oldest first.
    pub fn get_by_time_range(
        &self,
        stream_id: i32,
        start_90k: i64,
        end_90k: i64,
    ) -> Result<Vec<ListRecordingsRow>, Error> {
        let mut stmt = self.conn.prepare_cached(
            "select id, start_time_90k, end_time_90k, sample_file_bytes, width, height, \
             video_sample_entry_id, video_samples, video_sync_samples, video_index, is_complete \
             from recording \
             where stream_id = ? and end_time_90k > ? and start_time_90k < ? \
             order by start_time_90k",
        )?;
        let mut rows = stmt.query(params![stream_id, start_90k, end_90k])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row_to_listing(row)?);
        }
        Ok(out)
    }

    /// Returns ids of recordings that look complete but have never had
    /// their on-disk size recorded (spec.md §4.10's sync worker query):
    /// `size_bytes = 0 AND is_complete = 1 AND start_time >= since_90k`,
    /// oldest first, capped at 1000 per poll.
    pub fn recordings_needing_sync(&self, since_90k: i64) -> Result<Vec<CompositeId>, Error> {
        let mut stmt = self.conn.prepare_cached(
            "select id from recording \
             where sample_file_bytes = 0 and is_complete = 1 and start_time_90k >= ? \
             order by start_time_90k limit 1000",
        )?;
        let mut rows = stmt.query(params![since_90k])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(CompositeId(row.get(0)?));
        }
        Ok(out)
    }

    pub fn delete_by_id(&mut self, id: CompositeId) -> Result<bool, Error> {
        let rows = self.conn.execute("delete from recording where id = ?", params![id.0])?;
        Ok(rows > 0)
    }

    /// Deletes the oldest recordings of `stream_id` until its total
    /// `sample_file_bytes` is `<= keep_under_bytes`, but never deletes the
    /// last remaining recording (spec.md §8's quota convergence property).
    /// Returns the ids deleted, oldest first.
    pub fn delete_oldest_recordings(
        &mut self,
        stream_id: i32,
        keep_under_bytes: i64,
    ) -> Result<Vec<CompositeId>, Error> {
        let tx = self.conn.transaction()?;
        let mut deleted = Vec::new();
        loop {
            let (count, total): (i64, i64) = tx.query_row(
                "select count(*), coalesce(sum(sample_file_bytes), 0) from recording where stream_id = ?",
                params![stream_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            if count <= 1 || total <= keep_under_bytes {
                break;
            }
            let (id, bytes): (i64, i64) = tx.query_row(
                "select id, sample_file_bytes from recording where stream_id = ? \
                 order by start_time_90k limit 1",
                params![stream_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            tx.execute("delete from recording where id = ?", params![id])?;
            let _ = bytes;
            deleted.push(CompositeId(id));
        }
        tx.commit()?;
        Ok(deleted)
    }

    /// Deletes completed recordings of `stream_id` that ended at or before
    /// `cutoff_90k` (spec.md §4.11's Retention job). Returns the ids
    /// deleted, oldest first. Never touches an in-progress (`is_complete =
    /// 0`) recording, matching the orphan job's same protection.
    pub fn delete_recordings_older_than(
        &mut self,
        stream_id: i32,
        cutoff_90k: i64,
    ) -> Result<Vec<CompositeId>, Error> {
        let tx = self.conn.transaction()?;
        let mut ids = Vec::new();
        {
            let mut stmt = tx.prepare_cached(
                "select id from recording where stream_id = ? and is_complete = 1 \
                 and end_time_90k <= ? order by start_time_90k",
            )?;
            let mut rows = stmt.query(params![stream_id, cutoff_90k])?;
            while let Some(row) = rows.next()? {
                ids.push(CompositeId(row.get(0)?));
            }
        }
        for id in &ids {
            tx.execute("delete from recording where id = ?", params![id.0])?;
        }
        tx.commit()?;
        Ok(ids)
    }

    /// Returns `(recording count, total sample_file_bytes)` for `stream_id`
    /// (spec.md §4.11's per-stream storage cache).
    pub fn stream_usage(&self, stream_id: i32) -> Result<(i64, i64), Error> {
        Ok(self.conn.query_row(
            "select count(*), coalesce(sum(sample_file_bytes), 0) from recording where stream_id = ?",
            params![stream_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?)
    }

    /// Aggregate stats across every stream's recordings (spec.md §4.11's
    /// Stats job; disk-space fields come from `statvfs` on the sample
    /// file dirs, outside this query).
    pub fn recording_stats(&self) -> Result<RecordingStats, Error> {
        Ok(self.conn.query_row(
            "select count(*), coalesce(sum(sample_file_bytes), 0), min(start_time_90k), max(end_time_90k) \
             from recording",
            params![],
            |row| {
                Ok(RecordingStats {
                    total_recordings: row.get(0)?,
                    total_bytes: row.get(1)?,
                    oldest_90k: row.get(2)?,
                    newest_90k: row.get(3)?,
                })
            },
        )?)
    }

    /// Returns every recording id for `stream_id` with its completion
    /// flag, oldest first (spec.md §4.11's Orphans scan).
    pub fn list_recording_ids(&self, stream_id: i32) -> Result<Vec<(CompositeId, bool)>, Error> {
        let mut stmt = self
            .conn
            .prepare_cached("select id, is_complete from recording where stream_id = ? order by start_time_90k")?;
        let mut rows = stmt.query(params![stream_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push((CompositeId(row.get(0)?), row.get(1)?));
        }
        Ok(out)
    }

    /// Inserts a video sample entry, returning its id. Idempotent: a
    /// second insert with the same `sha1` returns the existing row's id
    /// rather than erroring.
    pub fn insert_video_sample_entry(&mut self, e: VideoSampleEntryToInsert) -> Result<i32, Error> {
        use sha1::{Digest, Sha1};
        let sha1: [u8; 20] = Sha1::digest(&e.data).into();
        if let Some(id) = self.conn.query_row(
            "select id from video_sample_entry where sha1 = ?",
            params![&sha1[..]],
            |row| row.get(0),
        ).optional()? {
            return Ok(id);
        }
        self.conn.execute(
            "insert into video_sample_entry \
             (sha1, width, height, rfc6381_codec, data, pasp_h_spacing, pasp_v_spacing) \
             values (?, ?, ?, ?, ?, ?, ?)",
            params![
                &sha1[..],
                e.width,
                e.height,
                &e.rfc6381_codec,
                &e.data,
                e.pasp_h_spacing,
                e.pasp_v_spacing
            ],
        )?;
        Ok(self.conn.last_insert_rowid() as i32)
    }

    pub fn get_video_sample_entry(&self, id: i32) -> Result<VideoSampleEntry, Error> {
        self.conn
            .query_row(
                "select id, width, height, rfc6381_codec, data, pasp_h_spacing, pasp_v_spacing \
                 from video_sample_entry where id = ?",
                params![id],
                |row| {
                    Ok(VideoSampleEntry {
                        id: row.get(0)?,
                        width: row.get(1)?,
                        height: row.get(2)?,
                        rfc6381_codec: row.get(3)?,
                        data: row.get(4)?,
                        pasp_h_spacing: row.get(5)?,
                        pasp_v_spacing: row.get(6)?,
                    })
                },
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => err!(NotFound, msg("no such video_sample_entry {id}")),
                e => e.into(),
            })
    }

    pub fn add_stream(&mut self, s: &StreamRow) -> Result<i32, Error> {
        self.conn.execute(
            "insert into stream (name, source, transport, sample_file_dir_id, enabled, \
             detection_enabled, pre_buffer_seconds, retention_sec, quota_bytes) \
             values (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                &s.name,
                &s.source,
                &s.transport,
                s.sample_file_dir_id,
                s.enabled,
                s.detection_enabled,
                s.pre_buffer_seconds,
                s.retention_sec,
                s.quota_bytes,
            ],
        )?;
        Ok(self.conn.last_insert_rowid() as i32)
    }

    pub fn streams(&self) -> Result<Vec<StreamRow>, Error> {
        let mut stmt = self.conn.prepare_cached(
            "select id, name, source, transport, sample_file_dir_id, enabled, \
             detection_enabled, pre_buffer_seconds, retention_sec, quota_bytes from stream",
        )?;
        let mut rows = stmt.query(params![])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(StreamRow {
                id: row.get(0)?,
                name: row.get(1)?,
                source: row.get(2)?,
                transport: row.get(3)?,
                sample_file_dir_id: row.get(4)?,
                enabled: row.get(5)?,
                detection_enabled: row.get(6)?,
                pre_buffer_seconds: row.get(7)?,
                retention_sec: row.get(8)?,
                quota_bytes: row.get(9)?,
            });
        }
        Ok(out)
    }

    pub fn add_sample_file_dir(&mut self, path: &std::path::Path, dir_uuid: Uuid) -> Result<i32, Error> {
        self.conn.execute(
            "insert into sample_file_dir (path, uuid) values (?, ?)",
            params![path.to_str().ok_or_else(|| err!(InvalidArgument, msg("non-utf8 path")))?, dir_uuid.as_bytes().to_vec()],
        )?;
        Ok(self.conn.last_insert_rowid() as i32)
    }

    pub fn db_uuid(&self) -> Result<Uuid, Error> {
        let bytes: Vec<u8> = self.conn.query_row("select uuid from meta", params![], |row| row.get(0))?;
        Uuid::from_slice(&bytes).map_err(|e| err!(DataLoss, msg("bad meta uuid"), source(e)))
    }

    /// Looks up a previously-registered sample file dir's path and uuid,
    /// as needed to `db::dir::SampleFileDir::open` it at startup.
    pub fn sample_file_dir(&self, id: i32) -> Result<(std::path::PathBuf, Uuid), Error> {
        let (path, uuid_bytes): (String, Vec<u8>) = self.conn.query_row(
            "select path, uuid from sample_file_dir where id = ?",
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let uuid = Uuid::from_slice(&uuid_bytes).map_err(|e| err!(DataLoss, msg("bad sample_file_dir uuid"), source(e)))?;
        Ok((path.into(), uuid))
    }

    /// Finds a previously-registered sample file dir by path, if any.
    pub fn find_sample_file_dir(&self, path: &std::path::Path) -> Result<Option<i32>, Error> {
        let path = path.to_str().ok_or_else(|| err!(InvalidArgument, msg("non-utf8 path")))?;
        Ok(self
            .conn
            .query_row("select id from sample_file_dir where path = ?", params![path], |row| row.get(0))
            .optional()?)
    }

    /// The open-generation uuids last recorded for a sample file dir
    /// (`db::dir::DirMeta`'s cross-run consistency check fields).
    pub fn sample_file_dir_open_state(&self, id: i32) -> Result<(Option<Uuid>, Option<Uuid>), Error> {
        let (last, in_progress): (Option<Vec<u8>>, Option<Vec<u8>>) = self.conn.query_row(
            "select last_complete_open_uuid, in_progress_open_uuid from sample_file_dir where id = ?",
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let parse = |b: Option<Vec<u8>>| -> Result<Option<Uuid>, Error> {
            b.map(|b| Uuid::from_slice(&b).map_err(|e| err!(DataLoss, msg("bad open uuid"), source(e)))).transpose()
        };
        Ok((parse(last)?, parse(in_progress)?))
    }

    /// Records the open-generation uuids after a successful
    /// `db::dir::SampleFileDir::open`/`create` call, so the next process
    /// startup can check consistency against this run's generation.
    pub fn update_sample_file_dir_open_state(
        &mut self,
        id: i32,
        last_complete_open: Option<Uuid>,
        in_progress_open: Option<Uuid>,
    ) -> Result<(), Error> {
        self.conn.execute(
            "update sample_file_dir set last_complete_open_uuid = ?, in_progress_open_uuid = ? where id = ?",
            params![
                last_complete_open.map(|u| u.as_bytes().to_vec()),
                in_progress_open.map(|u| u.as_bytes().to_vec()),
                id,
            ],
        )?;
        Ok(())
    }
}

use rusqlite::OptionalExtension;

fn row_to_listing(row: &rusqlite::Row) -> Result<ListRecordingsRow, Error> {
    Ok(ListRecordingsRow {
        id: CompositeId(row.get(0)?),
        start_90k: row.get(1)?,
        end_90k: row.get(2)?,
        sample_file_bytes: row.get(3)?,
        width: row.get(4)?,
        height: row.get(5)?,
        video_sample_entry_id: row.get(6)?,
        video_samples: row.get(7)?,
        video_sync_samples: row.get(8)?,
        video_index: row.get(9)?,
        is_complete: row.get(10)?,
    })
}

/// Creates a brand-new database's schema and `meta` row. Idempotent only
/// in the sense that it fails loudly against an already-initialized
/// connection (via the schema's primary keys / `create table` without
/// `if not exists`).
pub fn init(conn: &mut rusqlite::Connection) -> Result<(), Error> {
    let tx = conn.transaction()?;
    tx.execute_batch(include_str!("schema.sql"))
        .map_err(|e| err!(Internal, msg("unable to create database schema"), source(e)))?;
    tx.execute(
        "insert into schema_version (version, notes, run_ts_sec) values (?, ?, ?)",
        params![EXPECTED_SCHEMA_VERSION, "initial create", 0],
    )?;
    let uuid = Uuid::new_v4();
    tx.execute("insert into meta (uuid) values (?)", params![uuid.as_bytes().to_vec()])?;
    tx.commit()?;
    Ok(())
}

/// Returns `Ok(Some(version))` for an initialized database, `Ok(None)` for
/// an empty one, `Err` for a partially-initialized one.
pub fn get_schema_version(conn: &rusqlite::Connection) -> Result<Option<i32>, Error> {
    let table_exists: i32 = conn.query_row(
        "select count(*) from sqlite_master where name = 'schema_version'",
        params![],
        |row| row.get(0),
    )?;
    if table_exists == 0 {
        return Ok(None);
    }
    Ok(Some(conn.query_row(
        "select max(version) from schema_version",
        params![],
        |row| row.get(0),
    )?))
}

/// The recording database: a SQLite connection behind a single mutex, per
/// spec.md §4.9's concurrency note ("a single process-wide mutex
/// serializes all DB access").
pub struct Database<C: Clocks + Clone = base::clock::RealClocks> {
    db: Mutex<LockedDatabase>,
    clocks: C,
}

impl<C: Clocks + Clone> Database<C> {
    /// Wraps an already-initialized connection. Callers should have run
    /// [`init`] (or an `upgrade`) on `conn` first.
    pub fn new(clocks: C, conn: rusqlite::Connection) -> Result<Self, Error> {
        match get_schema_version(&conn)? {
            Some(v) if v == EXPECTED_SCHEMA_VERSION => {}
            Some(v) => bail!(
                FailedPrecondition,
                msg("database schema version {v} != expected {EXPECTED_SCHEMA_VERSION}; run upgrade"),
            ),
            None => bail!(FailedPrecondition, msg("database is not initialized; run init first")),
        }
        Ok(Database {
            db: Mutex::new(LockedDatabase {
                conn,
                column_cache: RefCell::new(HashMap::new()),
            }),
            clocks,
        })
    }

    pub fn clocks(&self) -> C {
        self.clocks.clone()
    }

    pub fn lock(&self) -> MutexGuard<LockedDatabase> {
        self.db.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base::clock::{SimulatedClocks, SystemTime};
    use nix::sys::time::TimeSpec;

    fn new_db() -> Database<SimulatedClocks> {
        let mut conn = rusqlite::Connection::open_in_memory().unwrap();
        init(&mut conn).unwrap();
        let clocks = SimulatedClocks::new(SystemTime(TimeSpec::new(1_700_000_000, 0)));
        Database::new(clocks, conn).unwrap()
    }

    #[test]
    fn composite_id_roundtrip() {
        let id = CompositeId::new(7, 42);
        assert_eq!(id.stream(), 7);
        assert_eq!(id.recording(), 42);
    }

    #[test]
    fn schema_version_matches_expected() {
        let db = new_db();
        let conn_version = {
            let l = db.lock();
            get_schema_version(&l.conn).unwrap()
        };
        assert_eq!(conn_version, Some(EXPECTED_SCHEMA_VERSION));
    }

    #[test]
    fn add_get_update_delete_recording() {
        let db = new_db();
        let mut l = db.lock();
        let vse_id = l
            .insert_video_sample_entry(VideoSampleEntryToInsert {
                width: 1920,
                height: 1080,
                rfc6381_codec: "avc1.4d002a".to_owned(),
                data: vec![0u8; 16],
                pasp_h_spacing: 1,
                pasp_v_spacing: 1,
            })
            .unwrap();
        let stream_id = l
            .add_stream(&StreamRow {
                id: 0,
                name: "front".to_owned(),
                source: "rtsp://example/front".to_owned(),
                transport: "tcp".to_owned(),
                sample_file_dir_id: None,
                enabled: true,
                detection_enabled: false,
                pre_buffer_seconds: 5,
                retention_sec: 86400,
                quota_bytes: None,
            })
            .unwrap();
        let id = l.add_recording(RecentRecording {
            stream_id,
            start_90k: 1_000_000,
            video_sample_entry_id: vse_id,
            sample_file_bytes: 0,
            media_duration_90k: 0,
            video_samples: 0,
            video_sync_samples: 0,
            video_index: Vec::new(),
            is_complete: false,
        });
        assert_ne!(id, 0);
        let id = CompositeId(id);
        let row = l.get_by_id(id).unwrap().unwrap();
        assert!(!row.is_complete);
        assert_eq!(row.start_90k, 1_000_000);

        l.update_recording(id, 1_090_000, 12345, true).unwrap();
        let row = l.get_by_id(id).unwrap().unwrap();
        assert!(row.is_complete);
        assert_eq!(row.sample_file_bytes, 12345);

        let rows = l.get_by_time_range(stream_id, 0, 2_000_000).unwrap();
        assert_eq!(rows.len(), 1);

        assert!(l.delete_by_id(id).unwrap());
        assert!(l.get_by_id(id).unwrap().is_none());
    }

    #[test]
    fn quota_eviction_keeps_last_recording() {
        let db = new_db();
        let mut l = db.lock();
        let vse_id = l
            .insert_video_sample_entry(VideoSampleEntryToInsert {
                width: 640,
                height: 480,
                rfc6381_codec: "avc1.4d0016".to_owned(),
                data: vec![1u8; 8],
                pasp_h_spacing: 1,
                pasp_v_spacing: 1,
            })
            .unwrap();
        let stream_id = l
            .add_stream(&StreamRow {
                id: 0,
                name: "quota-test".to_owned(),
                source: "rtsp://example/q".to_owned(),
                transport: "tcp".to_owned(),
                sample_file_dir_id: None,
                enabled: true,
                detection_enabled: false,
                pre_buffer_seconds: 5,
                retention_sec: 86400,
                quota_bytes: Some(500_000_000),
            })
            .unwrap();
        for i in 0..10 {
            let id = l.add_recording(RecentRecording {
                stream_id,
                start_90k: 1_000_000 + i * 10_000,
                video_sample_entry_id: vse_id,
                sample_file_bytes: 100_000_000,
                media_duration_90k: 9_000,
                video_samples: 10,
                video_sync_samples: 1,
                video_index: Vec::new(),
                is_complete: true,
            });
            assert_ne!(id, 0);
        }
        let deleted = l.delete_oldest_recordings(stream_id, 500_000_000).unwrap();
        assert_eq!(deleted.len(), 5);
        let remaining = l.get_by_time_range(stream_id, 0, i64::MAX).unwrap();
        assert_eq!(remaining.len(), 5);
    }
}
