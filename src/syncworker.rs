// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2024 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Recording Sync Worker (spec.md §4.10, component C10): a daemon thread
//! that reconciles on-disk recording sizes into the metadata store.
//!
//! `Processor`/`HlsWriter`/`Mp4Writer` all write a recording's bytes
//! without holding the DB mutex, then later call `update_recording` once
//! the file is complete. If the process dies in between, a recording can
//! be left `is_complete = 1` with `sample_file_bytes = 0`. This worker
//! finds such rows and fills in their real size by statting the file —
//! always outside the DB mutex, per spec.md §5's lock-ordering rule.

use base::clock::Clocks;
use base::shutdown;
use base::Error;
use db::{CompositeId, Database};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default poll period (spec.md §4.10).
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Floor below which a configured poll period is clamped (spec.md §4.10's
/// "min 10").
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Reconciles `recording` rows with `size_bytes = 0 AND is_complete = 1`
/// against the files that back them.
pub struct SyncWorker<C: Clocks + Clone> {
    db: Arc<Database<C>>,
    dirs: HashMap<i32, Arc<db::dir::SampleFileDir>>,
    poll_interval: Duration,
    since_90k: i64,
}

impl<C: Clocks + Clone> SyncWorker<C> {
    /// `since_90k` is normally the process's own start time (spec.md
    /// §4.10's `start_time >= process_startup_time`): only recordings
    /// begun by *this* process instance are reconciled, since recordings
    /// begun by prior instances were already reconciled on their own
    /// shutdown or by their own sync worker runs.
    pub fn new(
        db: Arc<Database<C>>,
        dirs: HashMap<i32, Arc<db::dir::SampleFileDir>>,
        poll_interval: Duration,
        since_90k: i64,
    ) -> Self {
        SyncWorker {
            db,
            dirs,
            poll_interval: poll_interval.max(MIN_POLL_INTERVAL),
            since_90k,
        }
    }

    /// Runs until `shutdown_rx` fires, polling at `poll_interval`. Exits
    /// within one poll cycle of shutdown being requested (spec.md §4.10).
    pub fn run(&self, shutdown_rx: shutdown::Receiver) {
        info!("sync worker starting");
        loop {
            if shutdown_rx.check().is_err() {
                break;
            }
            if let Err(e) = self.poll_once() {
                warn!(err = %e, "sync worker poll failed");
            }
            if shutdown_rx.wait_for(self.poll_interval).is_err() {
                break;
            }
        }
        info!("sync worker stopped");
    }

    fn poll_once(&self) -> Result<(), Error> {
        let (ids, dir_by_stream) = {
            let db = self.db.lock();
            let ids = db.recordings_needing_sync(self.since_90k)?;
            let dir_by_stream: HashMap<i32, Option<i32>> =
                db.streams()?.into_iter().map(|s| (s.id, s.sample_file_dir_id)).collect();
            (ids, dir_by_stream)
        };
        if ids.is_empty() {
            return Ok(());
        }
        debug!(count = ids.len(), "sync worker reconciling recording sizes");
        for id in ids {
            self.sync_one(id, &dir_by_stream);
        }
        Ok(())
    }

    fn sync_one(&self, id: CompositeId, dir_by_stream: &HashMap<i32, Option<i32>>) {
        let stream_id = id.stream();
        let dir_id = match dir_by_stream.get(&stream_id).copied().flatten() {
            Some(d) => d,
            None => {
                warn!(%id, "no sample file dir configured for stream; skipping sync");
                return;
            }
        };
        let dir = match self.dirs.get(&dir_id) {
            Some(d) => d,
            None => {
                warn!(%id, dir_id, "sample file dir not open; skipping sync");
                return;
            }
        };

        // Statting happens here, entirely outside the DB mutex.
        let bytes = match dir.open_file(id) {
            Ok(f) => match f.metadata() {
                Ok(m) => m.len(),
                Err(e) => {
                    warn!(%id, err = %e, "unable to stat recording file during sync");
                    return;
                }
            },
            Err(nix::Error::ENOENT) => {
                warn!(%id, "recording file missing during sync");
                return;
            }
            Err(e) => {
                warn!(%id, err = %e, "unable to open recording file during sync");
                return;
            }
        };
        let bytes = u32::try_from(bytes).unwrap_or(u32::MAX);

        let mut db = self.db.lock();
        let end_90k = match db.get_by_id(id) {
            Ok(Some(row)) => row.end_90k,
            Ok(None) => {
                warn!(%id, "recording row vanished before sync update");
                return;
            }
            Err(e) => {
                warn!(%id, err = %e, "unable to refetch recording before sync update");
                return;
            }
        };
        if let Err(e) = db.update_recording(id, end_90k, bytes, true) {
            warn!(%id, err = %e, "sync worker update_recording failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base::clock::RealClocks;
    use db::{RecentRecording, StreamRow, VideoSampleEntryToInsert};
    use std::io::Write;

    fn open_test_db() -> Arc<Database<RealClocks>> {
        let mut conn = rusqlite::Connection::open_in_memory().unwrap();
        db::init(&mut conn).unwrap();
        Arc::new(Database::new(RealClocks {}, conn).unwrap())
    }

    #[test]
    fn reconciles_a_zero_byte_complete_recording() {
        let db = open_test_db();
        let tmp = tempfile::tempdir().unwrap();
        let dir_uuid = uuid::Uuid::new_v4();
        let dir_meta = db::dir::DirMeta {
            db_uuid: *db.lock().db_uuid().unwrap().as_bytes(),
            dir_uuid: *dir_uuid.as_bytes(),
            last_complete_open: None,
            in_progress_open: Some(*uuid::Uuid::new_v4().as_bytes()),
        };
        let dir = db::dir::SampleFileDir::create(tmp.path(), &dir_meta).unwrap();

        let (stream_id, vse_id, id) = {
            let mut locked = db.lock();
            let dir_id = locked.add_sample_file_dir(tmp.path(), dir_uuid).unwrap();
            let stream_id = locked
                .add_stream(&StreamRow {
                    id: 0,
                    name: "cam1".to_owned(),
                    source: "rtsp://x".to_owned(),
                    transport: "tcp".to_owned(),
                    sample_file_dir_id: Some(dir_id),
                    enabled: true,
                    detection_enabled: false,
                    pre_buffer_seconds: 0,
                    retention_sec: 0,
                    quota_bytes: None,
                })
                .unwrap();
            let vse_id = locked
                .insert_video_sample_entry(VideoSampleEntryToInsert {
                    width: 1,
                    height: 1,
                    rfc6381_codec: "avc1.4d401e".to_owned(),
                    data: vec![1, 2, 3],
                    pasp_h_spacing: 1,
                    pasp_v_spacing: 1,
                })
                .unwrap();
            let id = locked.add_recording(RecentRecording {
                stream_id,
                start_90k: 0,
                video_sample_entry_id: vse_id,
                sample_file_bytes: 0,
                media_duration_90k: 90_000,
                video_samples: 1,
                video_sync_samples: 1,
                video_index: Vec::new(),
                is_complete: true,
            });
            (stream_id, vse_id, CompositeId(id))
        };
        let _ = (stream_id, vse_id);

        let mut f = dir.create_file(id).unwrap();
        f.write_all(&[0u8; 1234]).unwrap();
        drop(f);

        let mut dirs = HashMap::new();
        dirs.insert(
            db.lock().streams().unwrap().into_iter().find(|s| s.id == stream_id).unwrap().sample_file_dir_id.unwrap(),
            dir,
        );

        let worker = SyncWorker::new(db.clone(), dirs, DEFAULT_POLL_INTERVAL, 0);
        worker.poll_once().unwrap();

        let row = db.lock().get_by_id(id).unwrap().unwrap();
        assert_eq!(row.sample_file_bytes, 1234);
        assert!(row.is_complete);
    }

    #[test]
    fn skips_recordings_before_since_90k() {
        let db = open_test_db();
        let (stream_id, vse_id) = {
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
                    retention_sec: 0,
                    quota_bytes: None,
                })
                .unwrap();
            let vse_id = locked
                .insert_video_sample_entry(VideoSampleEntryToInsert {
                    width: 1,
                    height: 1,
                    rfc6381_codec: "avc1.4d401e".to_owned(),
                    data: vec![1],
                    pasp_h_spacing: 1,
                    pasp_v_spacing: 1,
                })
                .unwrap();
            (stream_id, vse_id)
        };
        db.lock().add_recording(RecentRecording {
            stream_id,
            start_90k: 100,
            video_sample_entry_id: vse_id,
            sample_file_bytes: 0,
            media_duration_90k: 1,
            video_samples: 1,
            video_sync_samples: 1,
            video_index: Vec::new(),
            is_complete: true,
        });
        let worker = SyncWorker::new(db.clone(), HashMap::new(), DEFAULT_POLL_INTERVAL, 1_000_000);
        // No dirs configured, but the recording predates `since_90k` so it's
        // never looked up in `dirs` in the first place.
        worker.poll_once().unwrap();
    }
}
