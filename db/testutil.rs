// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2020 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Utilities for automated testing involving the persistence layer. Used
//! by this crate's own tests and by `nvr-core`'s.

use crate::db;
use crate::dir;
use base::clock::{Clocks, SimulatedClocks, SystemTime};
use nix::sys::time::TimeSpec;
use std::sync::Arc;
use tempfile::TempDir;
use uuid::Uuid;

static INIT: std::sync::Once = std::sync::Once::new();

pub const TEST_STREAM_NAME: &str = "test-stream";

pub const TEST_VIDEO_SAMPLE_ENTRY_DATA: &[u8] =
    b"\x00\x00\x00\x7D\x61\x76\x63\x31\x00\x00\x00\x00\x00\x00\x00\x01\x00\x00\x00\x00\x00\x00\x00\
    \x00\x00\x00\x00\x00\x00\x00\x00\x00\x07\x80\x04\x38\x00\x48\x00\x00\x00\x48\x00\x00\x00\x00\
    \x00\x00\x00\x01\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\
    \x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x18\xFF\xFF\x00\x00\x00\x27\x61\x76\
    \x63\x43\x01\x4D\x00\x2A\xFF\xE1\x00\x10\x67\x4D\x00\x2A\x95\xA8\x1E\x00\x89\xF9\x66\xE0\x20\
    \x20\x20\x40\x01\x00\x04\x68\xEE\x3C\x80";

/// Performs global initialization for tests: logging, and a time zone
/// (`America/Los_Angeles`) so calendar-time tests are deterministic
/// regardless of the machine running them.
pub fn init() {
    INIT.call_once(|| {
        base::tracing_setup::install_for_tests();
        base::time::testutil::init_zone();
    });
}

/// A database plus a sample file directory, with one stream and one video
/// sample entry already inserted.
pub struct TestDb {
    pub db: Arc<db::Database<SimulatedClocks>>,
    pub dir: Arc<dir::SampleFileDir>,
    pub tmpdir: TempDir,
    pub stream_id: i32,
    pub video_sample_entry_id: i32,
}

impl TestDb {
    /// Creates a fresh in-memory database and an empty sample file
    /// directory backed by a temporary directory.
    pub fn new() -> Self {
        init();
        let clocks = SimulatedClocks::new(SystemTime(TimeSpec::new(1_700_000_000, 0)));
        let mut conn = rusqlite::Connection::open_in_memory().unwrap();
        db::init(&mut conn).unwrap();
        let db = Arc::new(db::Database::new(clocks, conn).unwrap());

        let tmpdir = tempfile::Builder::new().prefix("nvr-test").tempdir().unwrap();
        let db_uuid = {
            let l = db.lock();
            l.db_uuid().unwrap()
        };
        let dir_uuid = Uuid::new_v4();
        let dir_meta = dir::DirMeta {
            db_uuid: *db_uuid.as_bytes(),
            dir_uuid: *dir_uuid.as_bytes(),
            last_complete_open: None,
            in_progress_open: Some(*dir_uuid.as_bytes()),
        };
        let dir = dir::SampleFileDir::create(tmpdir.path(), &dir_meta).unwrap();

        let (stream_id, video_sample_entry_id) = {
            let mut l = db.lock();
            let sample_file_dir_id = l.add_sample_file_dir(tmpdir.path(), dir_uuid).unwrap();
            let stream_id = l
                .add_stream(&db::StreamRow {
                    id: 0,
                    name: TEST_STREAM_NAME.to_owned(),
                    source: "rtsp://test-camera/main".to_owned(),
                    transport: "tcp".to_owned(),
                    sample_file_dir_id: Some(sample_file_dir_id),
                    enabled: true,
                    detection_enabled: false,
                    pre_buffer_seconds: 5,
                    retention_sec: 30 * 86400,
                    quota_bytes: Some(1 << 20),
                })
                .unwrap();
            let video_sample_entry_id = l
                .insert_video_sample_entry(db::VideoSampleEntryToInsert {
                    width: 1920,
                    height: 1080,
                    rfc6381_codec: "avc1.4d0029".to_owned(),
                    data: TEST_VIDEO_SAMPLE_ENTRY_DATA.to_vec(),
                    pasp_h_spacing: 1,
                    pasp_v_spacing: 1,
                })
                .unwrap();
            (stream_id, video_sample_entry_id)
        };

        TestDb {
            db,
            dir,
            tmpdir,
            stream_id,
            video_sample_entry_id,
        }
    }

    /// Inserts a recording built from a `SampleIndexEncoder`-populated
    /// `RecentRecording`, filling in this `TestDb`'s stream and video
    /// sample entry ids. There's no backing sample file, so it's not
    /// possible to produce a full `.mp4` from the result.
    pub fn insert_recording(&self, mut r: db::RecentRecording) -> db::ListRecordingsRow {
        r.stream_id = self.stream_id;
        r.video_sample_entry_id = self.video_sample_entry_id;
        let mut l = self.db.lock();
        let id = l.add_recording(r);
        assert_ne!(id, 0, "add_recording failed");
        l.get_by_id(db::CompositeId(id)).unwrap().unwrap()
    }
}

impl Default for TestDb {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::{SampleIndexEncoder, TIME_UNITS_PER_SEC};

    #[test]
    fn insert_recording_from_encoder() {
        let db = TestDb::new();
        let mut r = db::RecentRecording {
            start_90k: 1_430_006_400 * TIME_UNITS_PER_SEC,
            is_complete: true,
            ..Default::default()
        };
        let mut e = SampleIndexEncoder::default();
        e.add_sample(3000, 1000, true, &mut r);
        e.add_sample(3000, 500, false, &mut r);
        let row = db.insert_recording(r);
        assert_eq!(row.video_samples, 2);
        assert_eq!(row.video_sync_samples, 1);
    }
}
