// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2024 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The `run` subcommand: loads the configuration, opens the database and
//! the sample file directory, and wires up one reader/processor/output
//! chain per enabled stream plus the sync and storage background workers.
//! This is the glue layer spec.md §5 describes in prose; every piece it
//! assembles is implemented elsewhere (`crate::streamer`, `crate::processor`,
//! `crate::hls`, `crate::prebuffer`, `crate::detect`, `crate::syncworker`,
//! `crate::storage`, `crate::shutdown`).

use crate::config::{Config, StreamConfig};
use crate::detect::{Dispatcher, DetectionModel};
use crate::hls::HlsWriter;
use crate::pool::{BackingMode, PacketBufferPool, StreamDims};
use crate::prebuffer::{CodecParams, Packet, PreBuffer, StrategyConfig};
use crate::processor::{Processor, StreamInfo};
use crate::shutdown::{ComponentKind, Coordinator};
use crate::storage::StorageManager;
use crate::stream::OPENER;
use crate::streamer::Reader;
use crate::syncworker::SyncWorker;
use crate::timestamp::{StreamProfile, TimestampTracker};
use base::clock::{Clocks, RealClocks};
use base::{err, shutdown, Error};
use bpaf::Bpaf;
use db::dir::{DirMeta, SampleFileDir};
use db::{Database, StreamRow};
use parking_lot::Mutex as PlMutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Storage reconciliation cadence (retention + quota); not spec-mandated
/// the way the sync worker's poll interval is, just a sane default.
const DEFAULT_STORAGE_INTERVAL: Duration = Duration::from_secs(3600);

/// How long to wait for a stream's codec params to change before
/// re-checking (keeps `Processor`/`HlsWriter` codec state current without
/// threading it through the reader directly).
const CODEC_SYNC_INTERVAL: Duration = Duration::from_secs(2);

/// Runs the recording pipeline until interrupted.
#[derive(Bpaf, Debug)]
pub struct Args {
    /// Path to the TOML configuration file.
    #[bpaf(long, argument("PATH"))]
    config: PathBuf,
}

/// The detection model runtime itself is out of scope (spec.md
/// Non-goals); this is the seam `Dispatcher` calls into when a stream has
/// detection enabled and no real model has been wired up yet.
struct NoopDetectionModel;

impl DetectionModel for NoopDetectionModel {
    fn infer(&self, stream_name: &str, _pkt: &Packet, _codec: Option<&CodecParams>) {
        tracing::trace!(stream = stream_name, "detection model stub: discarding inference request");
    }
}

pub fn run(args: Args) -> Result<i32, Error> {
    let config = Config::load(&args.config)?;
    let (_dir_fd, conn) = super::open_conn(&config.db_dir, super::OpenMode::ReadWrite)?;
    let clocks = RealClocks {};
    let since_90k = to_90k(clocks.realtime());
    let db = Arc::new(Database::new(clocks, conn)?);

    let dir_id = bootstrap_sample_file_dir(&db, &config.storage_root)?;
    let dir = open_sample_file_dir(&db, dir_id)?;
    let mut dirs = HashMap::new();
    dirs.insert(dir_id, dir);

    reconcile_streams(&db, &config, dir_id)?;

    let dims: Vec<StreamDims> = config
        .streams
        .iter()
        .filter(|s| s.enabled)
        .map(|s| StreamDims {
            width: s.width as u32,
            height: s.height as u32,
            fps: s.fps as u32,
            detection_enabled: s.detection_enabled,
        })
        .collect();
    let pool_limit = config.packet_pool_limit_bytes.unwrap_or_else(|| crate::pool::recompute_limit(&dims, config.default_pre_buffer_seconds));
    let pool = PacketBufferPool::init(pool_limit);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| err!(Unknown, msg("failed to build tokio runtime"), source(e)))?;

    let mut coordinator = Coordinator::new();
    let tracker = Arc::new(TimestampTracker::new());
    let mut dispatcher: Option<Arc<Dispatcher>> = None;
    if dims.iter().any(|d| d.detection_enabled) {
        let num_threads = config.detection_threads.unwrap_or(2).max(1);
        dispatcher = Some(Dispatcher::new(num_threads, Arc::new(NoopDetectionModel)));
    }

    for sc in config.streams.iter().filter(|s| s.enabled) {
        spawn_stream(sc, &config, &tracker, &pool, dispatcher.as_ref(), rt.handle().clone(), clocks, &mut coordinator)?;
    }

    spawn_sync_worker(db.clone(), dirs.clone(), since_90k, &mut coordinator);
    spawn_storage_worker(db.clone(), dirs.clone(), &mut coordinator);

    wait_for_shutdown_signal(&rt);
    spawn_force_exit_watcher(rt.handle().clone());

    let residual = coordinator.shutdown();
    mark_dir_open_complete(&db, dir_id)?;

    if residual.is_empty() {
        Ok(0)
    } else {
        Ok(1)
    }
}

fn to_90k(t: base::clock::SystemTime) -> i64 {
    let ts = t.0;
    ts.tv_sec() * 90_000 + (ts.tv_nsec() * 9) / 100_000
}

/// Finds or creates the single on-disk sample file directory row backing
/// `storage_root`, returning its database id.
fn bootstrap_sample_file_dir(db: &Arc<Database<RealClocks>>, storage_root: &std::path::Path) -> Result<i32, Error> {
    if let Some(id) = db.lock().find_sample_file_dir(storage_root)? {
        return Ok(id);
    }
    let dir_uuid = Uuid::new_v4();
    let id = db.lock().add_sample_file_dir(storage_root, dir_uuid)?;
    let db_uuid = db.lock().db_uuid()?;
    let open_uuid = Uuid::new_v4();
    let meta = DirMeta {
        db_uuid: *db_uuid.as_bytes(),
        dir_uuid: *dir_uuid.as_bytes(),
        last_complete_open: None,
        in_progress_open: Some(*open_uuid.as_bytes()),
    };
    SampleFileDir::create(storage_root, &meta)?;
    db.lock().update_sample_file_dir_open_state(id, None, Some(open_uuid))?;
    Ok(id)
}

/// Opens a previously-bootstrapped sample file dir, claiming a new
/// in-progress open generation (spec.md's open-generation consistency
/// protocol, grounded on `db::dir::SampleFileDir::open`'s
/// `expected_meta` contract).
fn open_sample_file_dir(db: &Arc<Database<RealClocks>>, dir_id: i32) -> Result<Arc<SampleFileDir>, Error> {
    let (path, dir_uuid) = db.lock().sample_file_dir(dir_id)?;
    let db_uuid = db.lock().db_uuid()?;
    let (last_complete, in_progress) = db.lock().sample_file_dir_open_state(dir_id)?;
    // If the process died mid-open last time, the in-progress uuid is the
    // one still recorded on disk; otherwise the last completed one is.
    let expected_last_complete = last_complete.or(in_progress);
    let new_open = Uuid::new_v4();
    let meta = DirMeta {
        db_uuid: *db_uuid.as_bytes(),
        dir_uuid: *dir_uuid.as_bytes(),
        last_complete_open: expected_last_complete.map(|u| *u.as_bytes()),
        in_progress_open: Some(*new_open.as_bytes()),
    };
    let dir = SampleFileDir::open(&path, &meta)?;
    db.lock().update_sample_file_dir_open_state(dir_id, expected_last_complete, Some(new_open))?;
    Ok(dir)
}

/// On a clean shutdown, promotes this run's in-progress open to
/// last-complete so the next startup doesn't have to guess.
fn mark_dir_open_complete(db: &Arc<Database<RealClocks>>, dir_id: i32) -> Result<(), Error> {
    let (_, in_progress) = db.lock().sample_file_dir_open_state(dir_id)?;
    db.lock().update_sample_file_dir_open_state(dir_id, in_progress, None)?;
    Ok(())
}

/// Adds any stream present in the config but missing from the database.
/// Existing rows are left as-is; the stream descriptor is otherwise
/// immutable for the duration of a run (spec.md §3).
fn reconcile_streams(db: &Arc<Database<RealClocks>>, config: &Config, dir_id: i32) -> Result<(), Error> {
    let existing: std::collections::HashSet<String> = db.lock().streams()?.into_iter().map(|s| s.name).collect();
    for sc in &config.streams {
        if existing.contains(&sc.name) {
            continue;
        }
        let row = StreamRow {
            id: 0,
            name: sc.name.clone(),
            source: sc.source.clone(),
            transport: sc.transport.clone(),
            sample_file_dir_id: Some(dir_id),
            enabled: sc.enabled,
            detection_enabled: sc.detection_enabled,
            pre_buffer_seconds: sc.pre_buffer_seconds(config),
            retention_sec: sc.retention_days as i64 * 86_400,
            quota_bytes: sc.quota_bytes.map(|q| q as i64),
        };
        db.lock().add_stream(&row)?;
        info!(stream = %sc.name, "registered new stream in database");
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn spawn_stream(
    sc: &StreamConfig,
    config: &Config,
    tracker: &Arc<TimestampTracker>,
    pool: &PacketBufferPool,
    dispatcher: Option<&Arc<Dispatcher>>,
    runtime: tokio::runtime::Handle,
    clocks: RealClocks,
    coordinator: &mut Coordinator,
) -> Result<(), Error> {
    let is_udp = sc.transport == "udp";
    tracker.register(&sc.name, is_udp)?;

    let info = StreamInfo {
        name: sc.name.clone(),
        profile: StreamProfile { avg_frame_rate: None, time_base: (1, 90_000), is_udp },
    };
    let processor = Arc::new(Processor::new(info, tracker.clone(), sc.detection_interval));

    let hls_writer = Arc::new(HlsWriter::new(
        config.hls_storage_root.join(&sc.name),
        sc.name.clone(),
        sc.hls_segment_target_s,
    )?);
    processor.add_hls_output(hls_writer.clone())?;

    if sc.detection_enabled {
        let strategy_cfg = StrategyConfig {
            stream_name: sc.name.clone(),
            seconds_target: sc.pre_buffer_seconds(config),
            pool: pool.clone(),
            mmap_path: config.storage_root.join("prebuffer").join(format!("{}.mmap", sc.name)),
            hls_dir: config.hls_storage_root.clone(),
            go2rtc_base_url: config.go2rtc_url.clone().unwrap_or_default(),
        };
        let prebuffer = PreBuffer::new(BackingMode::MemoryPacket, strategy_cfg)?;
        processor.set_prebuffer(Some(Arc::new(PlMutex::new(prebuffer))));

        if let Some(dispatcher) = dispatcher {
            processor.add_detection_output(dispatcher.clone())?;
        }
    }

    let source_url = sc.source.parse::<url::Url>().map_err(|e| err!(InvalidArgument, msg("bad source url for stream {:?}", sc.name), source(e)))?;
    let reader = Reader::new(
        sc.name.clone(),
        source_url,
        &OPENER,
        Box::new(|| crate::stream::Options { session: Default::default(), setup: Default::default() }),
        processor.clone(),
        clocks,
        runtime.clone(),
    );

    let (reader_tx, reader_rx) = shutdown::channel();
    let reader_handle = reader.clone().spawn(reader_rx);
    coordinator.register(format!("reader-{}", sc.name), ComponentKind::Reader, 10, reader_tx, reader_handle, Duration::from_secs(5));

    let (codec_tx, codec_rx) = shutdown::channel();
    let codec_handle = spawn_codec_sync(sc.name.clone(), reader, processor, hls_writer, codec_rx);
    coordinator.register(format!("codec-sync-{}", sc.name), ComponentKind::Other, 15, codec_tx, codec_handle, Duration::from_secs(5));

    Ok(())
}

/// Copies a reader's observed codec private data into its processor and
/// HLS writer. `Reader::run_once` only tracks the codec on itself
/// (spec.md §4.4's `codec_params()`); this is the glue that fans it out
/// to the outputs that need it (spec.md §4.5/§4.6).
fn spawn_codec_sync<C: Clocks>(
    stream_name: String,
    reader: Arc<Reader<C>>,
    processor: Arc<Processor>,
    hls_writer: Arc<HlsWriter>,
    shutdown_rx: shutdown::Receiver,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name(format!("codec-sync-{stream_name}"))
        .spawn(move || loop {
            if shutdown_rx.check().is_err() {
                break;
            }
            if let Some(codec) = reader.codec_params() {
                processor.set_codec(codec.clone());
                hls_writer.set_codec(codec);
            }
            if shutdown_rx.wait_for(CODEC_SYNC_INTERVAL).is_err() {
                break;
            }
        })
        .expect("failed to spawn codec-sync thread")
}

fn spawn_sync_worker(db: Arc<Database<RealClocks>>, dirs: HashMap<i32, Arc<SampleFileDir>>, since_90k: i64, coordinator: &mut Coordinator) {
    let (tx, rx) = shutdown::channel();
    let worker = SyncWorker::new(db, dirs, crate::syncworker::DEFAULT_POLL_INTERVAL, since_90k);
    let handle = std::thread::Builder::new()
        .name("sync-worker".to_owned())
        .spawn(move || worker.run(rx))
        .expect("failed to spawn sync worker thread");
    coordinator.register("sync-worker", ComponentKind::SyncWorker, 30, tx, handle, Duration::from_secs(10));
}

fn spawn_storage_worker(db: Arc<Database<RealClocks>>, dirs: HashMap<i32, Arc<SampleFileDir>>, coordinator: &mut Coordinator) {
    let (tx, rx) = shutdown::channel();
    let mgr = StorageManager::new(db, dirs, crate::storage::DEFAULT_CACHE_TTL);
    let handle = std::thread::Builder::new()
        .name("storage-worker".to_owned())
        .spawn(move || {
            info!("storage worker starting");
            loop {
                if rx.check().is_err() {
                    break;
                }
                if let Err(e) = mgr.reconcile_all() {
                    warn!(err = %e, "storage reconcile pass failed");
                }
                if rx.wait_for(DEFAULT_STORAGE_INTERVAL).is_err() {
                    break;
                }
            }
            info!("storage worker stopped");
        })
        .expect("failed to spawn storage worker thread");
    coordinator.register("storage-worker", ComponentKind::StorageWorker, 40, tx, handle, Duration::from_secs(30));
}

/// Blocks until SIGINT or SIGTERM (spec.md §4.12's shutdown trigger).
fn wait_for_shutdown_signal(rt: &tokio::runtime::Runtime) {
    rt.block_on(async {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!(err = %e, "failed to install SIGTERM handler; waiting on SIGINT only");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    });
    info!("shutdown signal received; stopping components");
}

/// A second shutdown signal during an already-in-progress graceful
/// shutdown exits immediately rather than waiting on component deadlines
/// (spec.md §4.12's two-stage shutdown).
fn spawn_force_exit_watcher(rt_handle: tokio::runtime::Handle) {
    std::thread::spawn(move || {
        rt_handle.block_on(async {
            let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
            match sigterm.as_mut() {
                Some(sigterm) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = sigterm.recv() => {}
                    }
                }
                None => {
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        });
        warn!("second shutdown signal received; exiting immediately");
        std::process::exit(1);
    });
}
