// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2024 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Storage Manager (spec.md §4.11, component C11): reconciles the
//! metadata store with what's actually on disk.
//!
//! Four jobs, all grounded on the teacher's `db::writer::{lower_retention,
//! delete_recordings}` pattern of "compute what's over budget, then evict
//! oldest-first":
//! - **Retention**: delete files + rows older than a stream's configured
//!   retention.
//! - **Quota**: delete oldest-first until a stream is back under its
//!   byte quota (delegates to `db::LockedDatabase::delete_oldest_recordings`,
//!   which already encodes the "never delete the last recording" rule).
//! - **Orphans**: rows whose backing file has vanished.
//! - **Stats**: DB aggregates plus `statvfs`-derived disk space, the
//!   latter always taken outside the DB mutex.
//!
//! A per-stream usage cache (spec.md's "Per-stream storage cache") avoids
//! re-querying the DB on every API read; it's a plain TTL, refreshed
//! lazily or on demand.

use base::clock::Clocks;
use base::{err, Error};
use db::{CompositeId, Database, StreamRow};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Default per-stream usage cache TTL (spec.md §4.11).
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(1800);

/// Floor below which a configured cache TTL is clamped.
pub const MIN_CACHE_TTL: Duration = Duration::from_secs(10);

/// A stream's disk usage as of the last refresh.
#[derive(Clone, Copy, Debug)]
pub struct StreamUsage {
    pub stream_id: i32,
    pub recordings: i64,
    pub bytes: i64,
}

/// Disk-wide recording stats (spec.md §4.11's Stats job).
#[derive(Clone, Copy, Debug, Default)]
pub struct StorageStats {
    pub total_recordings: i64,
    pub total_bytes: i64,
    pub oldest_90k: Option<i64>,
    pub newest_90k: Option<i64>,
    pub disk_total_bytes: u64,
    pub disk_avail_bytes: u64,
}

struct CachedUsage {
    usage: StreamUsage,
    fetched_at: Instant,
}

pub struct StorageManager<C: Clocks + Clone> {
    db: Arc<Database<C>>,
    dirs: HashMap<i32, Arc<db::dir::SampleFileDir>>,
    cache_ttl: Duration,
    cache: Mutex<HashMap<i32, CachedUsage>>,
}

impl<C: Clocks + Clone> StorageManager<C> {
    pub fn new(db: Arc<Database<C>>, dirs: HashMap<i32, Arc<db::dir::SampleFileDir>>, cache_ttl: Duration) -> Self {
        StorageManager {
            db,
            dirs,
            cache_ttl: cache_ttl.max(MIN_CACHE_TTL),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Runs the Retention and Quota jobs for every configured stream.
    /// Intended to be called periodically by a cleanup worker thread
    /// (spec.md §5's "one storage cleanup worker").
    pub fn reconcile_all(&self) -> Result<(), Error> {
        let streams = self.db.lock().streams()?;
        for stream in &streams {
            if let Err(e) = self.apply_retention(stream) {
                warn!(stream = %stream.name, err = %e, "retention pass failed");
            }
            if let Err(e) = self.apply_quota(stream) {
                warn!(stream = %stream.name, err = %e, "quota pass failed");
            }
            self.invalidate(stream.id);
        }
        Ok(())
    }

    fn apply_retention(&self, stream: &StreamRow) -> Result<(), Error> {
        if stream.retention_sec <= 0 {
            return Ok(());
        }
        let now: base::time::Time = self.db.clocks().realtime().into();
        let cutoff_90k = now.0 - stream.retention_sec * base::time::TIME_UNITS_PER_SEC;
        let ids = self.db.lock().delete_recordings_older_than(stream.id, cutoff_90k)?;
        if !ids.is_empty() {
            info!(stream = %stream.name, count = ids.len(), "retention: deleted expired recordings");
            self.delete_files(stream, &ids);
        }
        Ok(())
    }

    fn apply_quota(&self, stream: &StreamRow) -> Result<(), Error> {
        let Some(quota) = stream.quota_bytes else {
            return Ok(());
        };
        let ids = self.db.lock().delete_oldest_recordings(stream.id, quota)?;
        if !ids.is_empty() {
            info!(stream = %stream.name, count = ids.len(), "quota: evicted oldest recordings");
            self.delete_files(stream, &ids);
        }
        Ok(())
    }

    /// Scans `stream`'s current rows for ones whose backing file is gone.
    /// Never reports (or, via [`Self::delete_orphans`], deletes) a row
    /// that's still `is_complete = 0`: that recording is mid-write, not
    /// orphaned.
    pub fn find_orphans(&self, stream: &StreamRow) -> Result<Vec<CompositeId>, Error> {
        let Some(dir_id) = stream.sample_file_dir_id else {
            return Ok(Vec::new());
        };
        let Some(dir) = self.dirs.get(&dir_id) else {
            return Ok(Vec::new());
        };
        let rows = self.db.lock().list_recording_ids(stream.id)?;
        let mut orphans = Vec::new();
        for (id, is_complete) in rows {
            if !is_complete {
                continue;
            }
            match dir.open_file(id) {
                Ok(_) => {}
                Err(nix::Error::ENOENT) => orphans.push(id),
                Err(e) => warn!(%id, err = %e, "unable to check recording file while scanning for orphans"),
            }
        }
        Ok(orphans)
    }

    /// Deletes the given (presumably orphaned) rows. Callers are expected
    /// to have produced `ids` from [`Self::find_orphans`] so the
    /// `is_complete` guard has already been applied.
    pub fn delete_orphans(&self, ids: &[CompositeId]) -> Result<usize, Error> {
        let mut db = self.db.lock();
        let mut n = 0;
        for &id in ids {
            if db.delete_by_id(id)? {
                n += 1;
            }
        }
        Ok(n)
    }

    fn delete_files(&self, stream: &StreamRow, ids: &[CompositeId]) {
        let Some(dir_id) = stream.sample_file_dir_id else {
            return;
        };
        let Some(dir) = self.dirs.get(&dir_id) else {
            warn!(stream = %stream.name, dir_id, "sample file dir not open; rows deleted but files left behind");
            return;
        };
        for &id in ids {
            if let Err(e) = dir.unlink_file(id) {
                if e != nix::Error::ENOENT {
                    warn!(%id, err = %e, "unable to unlink recording file");
                }
            }
        }
    }

    /// Disk-wide stats (spec.md §4.11's Stats job). `statvfs` is called
    /// once per distinct sample file dir, outside the DB mutex.
    pub fn stats(&self) -> Result<StorageStats, Error> {
        let agg = self.db.lock().recording_stats()?;
        let mut disk_total_bytes = 0u64;
        let mut disk_avail_bytes = 0u64;
        for dir in self.dirs.values() {
            let vfs = dir.statfs().map_err(|e| err!(Unknown, msg("statvfs failed"), source(e)))?;
            disk_total_bytes += vfs.blocks() * vfs.fragment_size();
            disk_avail_bytes += vfs.blocks_available() * vfs.fragment_size();
        }
        Ok(StorageStats {
            total_recordings: agg.total_recordings,
            total_bytes: agg.total_bytes,
            oldest_90k: agg.oldest_90k,
            newest_90k: agg.newest_90k,
            disk_total_bytes,
            disk_avail_bytes,
        })
    }

    /// Returns `stream_id`'s cached usage, refreshing it if it's past
    /// `cache_ttl` or `force_refresh` is set.
    pub fn stream_usage(&self, stream_id: i32, force_refresh: bool) -> Result<StreamUsage, Error> {
        if !force_refresh {
            if let Some(c) = self.cache.lock().get(&stream_id) {
                if c.fetched_at.elapsed() < self.cache_ttl {
                    return Ok(c.usage);
                }
            }
        }
        let (recordings, bytes) = self.db.lock().stream_usage(stream_id)?;
        let usage = StreamUsage { stream_id, recordings, bytes };
        self.cache.lock().insert(stream_id, CachedUsage { usage, fetched_at: Instant::now() });
        Ok(usage)
    }

    fn invalidate(&self, stream_id: i32) {
        self.cache.lock().remove(&stream_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base::clock::RealClocks;
    use db::{RecentRecording, VideoSampleEntryToInsert};

    fn open_test_db() -> Arc<Database<RealClocks>> {
        let mut conn = rusqlite::Connection::open_in_memory().unwrap();
        db::init(&mut conn).unwrap();
        Arc::new(Database::new(RealClocks {}, conn).unwrap())
    }

    fn add_stream(db: &Database<RealClocks>, quota_bytes: Option<i64>, retention_sec: i64) -> (i32, i32) {
        let mut locked = db.lock();
        let stream_id = locked
            .add_stream(&StreamRow {
                id: 0,
                name: "cam1".to_owned(),
                source: "rtsp://x".to_owned(),
                transport: "tcp".to_owned(),
                sample_file_dir_id: None,
                enabled: true,
                detection_enabled: false,
                pre_buffer_seconds: 0,
                retention_sec,
                quota_bytes,
            })
            .unwrap();
        let vse_id = locked
            .insert_video_sample_entry(VideoSampleEntryToInsert {
                width: 1,
                height: 1,
                rfc6381_codec: "avc1.4d401e".to_owned(),
                data: vec![9],
                pasp_h_spacing: 1,
                pasp_v_spacing: 1,
            })
            .unwrap();
        (stream_id, vse_id)
    }

    #[test]
    fn quota_evicts_oldest_first_but_keeps_last_recording() {
        let db = open_test_db();
        let (stream_id, vse_id) = add_stream(&db, Some(100), 0);
        for start in [0i64, 1, 2] {
            db.lock().add_recording(RecentRecording {
                stream_id,
                start_90k: start,
                video_sample_entry_id: vse_id,
                sample_file_bytes: 60,
                media_duration_90k: 1,
                video_samples: 1,
                video_sync_samples: 1,
                video_index: Vec::new(),
                is_complete: true,
            });
        }
        let mgr = StorageManager::new(db.clone(), HashMap::new(), DEFAULT_CACHE_TTL);
        mgr.reconcile_all().unwrap();
        let usage = mgr.stream_usage(stream_id, true).unwrap();
        assert_eq!(usage.recordings, 1, "should stop evicting once only one recording remains");
    }

    #[test]
    fn retention_deletes_only_expired_complete_recordings() {
        let db = open_test_db();
        let (stream_id, vse_id) = add_stream(&db, None, 1);
        let now_90k: base::time::Time = db.clocks().realtime().into();
        db.lock().add_recording(RecentRecording {
            stream_id,
            start_90k: 0,
            video_sample_entry_id: vse_id,
            sample_file_bytes: 10,
            media_duration_90k: 1,
            video_samples: 1,
            video_sync_samples: 1,
            video_index: Vec::new(),
            is_complete: true,
        });
        db.lock().add_recording(RecentRecording {
            stream_id,
            start_90k: now_90k.0,
            video_sample_entry_id: vse_id,
            sample_file_bytes: 10,
            media_duration_90k: 90_000,
            video_samples: 1,
            video_sync_samples: 1,
            video_index: Vec::new(),
            is_complete: true,
        });
        let mgr = StorageManager::new(db.clone(), HashMap::new(), DEFAULT_CACHE_TTL);
        mgr.reconcile_all().unwrap();
        let usage = mgr.stream_usage(stream_id, true).unwrap();
        assert_eq!(usage.recordings, 1, "only the ancient recording should have expired");
    }

    #[test]
    fn usage_cache_is_reused_until_forced() {
        let db = open_test_db();
        let (stream_id, vse_id) = add_stream(&db, None, 0);
        db.lock().add_recording(RecentRecording {
            stream_id,
            start_90k: 0,
            video_sample_entry_id: vse_id,
            sample_file_bytes: 42,
            media_duration_90k: 1,
            video_samples: 1,
            video_sync_samples: 1,
            video_index: Vec::new(),
            is_complete: true,
        });
        let mgr = StorageManager::new(db.clone(), HashMap::new(), Duration::from_secs(3600));
        let first = mgr.stream_usage(stream_id, false).unwrap();
        assert_eq!(first.bytes, 42);

        db.lock().add_recording(RecentRecording {
            stream_id,
            start_90k: 1,
            video_sample_entry_id: vse_id,
            sample_file_bytes: 100,
            media_duration_90k: 1,
            video_samples: 1,
            video_sync_samples: 1,
            video_index: Vec::new(),
            is_complete: true,
        });
        let cached = mgr.stream_usage(stream_id, false).unwrap();
        assert_eq!(cached.bytes, 42, "stale cache should still be served without a force refresh");
        let fresh = mgr.stream_usage(stream_id, true).unwrap();
        assert_eq!(fresh.bytes, 142);
    }
}
