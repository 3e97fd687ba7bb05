// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2024 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Stream Processor (spec.md §4.5, component C5): fans one ingested
//! packet stream to up to [`MAX_OUTPUTS`] outputs of kinds HLS, MP4 and
//! DETECTION. spec.md §2's data flow diagram additionally shows the
//! pre-detection buffer as a fourth fan-out target; since §4.3 pre-buffers
//! are not addable/removable at runtime the way HLS/MP4/Detection outputs
//! are (they're provisioned once per stream at setup), forwarding to the
//! pre-buffer is modeled here as an always-present internal step rather
//! than a fifth member of the dynamic output list.
//!
//! Each `Writer` is expected to carry its own internal mutex (spec.md
//! §4.6 "writer owns an internal mutex"), so the processor only ever
//! holds its own mutex long enough to snapshot the output list.

use crate::prebuffer::{CodecParams, Packet, PreBuffer};
use crate::timestamp::{StreamProfile, Timestamps, TimestampTracker};
use base::ratelimit::RateLimiter;
use base::{err, Error};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::warn;

/// spec.md §4.5 "up to 8 outputs".
pub const MAX_OUTPUTS: usize = 8;

/// Everything a writer needs to know about a packet's stream, passed
/// alongside each packet (spec.md §4.5 "(pkt, stream_info)").
#[derive(Clone, Debug)]
pub struct StreamInfo {
    pub name: String,
    pub profile: StreamProfile,
}

/// An HLS or MP4 output the processor fans packets to.
pub trait Writer: Send + Sync {
    fn write_packet(&self, pkt: &Packet, info: &StreamInfo) -> Result<(), Error>;
    fn close(&self) -> Result<(), Error>;
}

/// Detection dispatcher submission surface (spec.md §4.8). Kept as a
/// trait so this module does not need to depend on the dispatcher's
/// worker-pool internals. `codec` mirrors spec.md §4.8's task shape,
/// `(stream_name, owned_packet_clone, owned_codec_params_clone)`.
pub trait DetectionSink: Send + Sync {
    fn submit(&self, stream_name: &str, pkt: Packet, codec: Option<CodecParams>);
}

#[derive(Clone)]
enum Output {
    Hls(Arc<dyn Writer>),
    Mp4(Arc<dyn Writer>),
    Detection(Arc<dyn DetectionSink>),
}

struct Inner {
    outputs: Vec<Output>,
    frame_counter: u32,
    stopping: bool,
}

/// Fans one stream's packets to its declared outputs (spec.md §4.5).
/// One instance per ingested stream.
pub struct Processor {
    info: StreamInfo,
    timestamps: Arc<TimestampTracker>,
    interval: u32,
    inner: Mutex<Inner>,
    prebuffer: Mutex<Option<Arc<Mutex<PreBuffer>>>>,
    codec: Mutex<Option<CodecParams>>,
    write_err_limiter: RateLimiter,
    prebuffer_err_limiter: RateLimiter,
}

impl Processor {
    pub fn new(info: StreamInfo, timestamps: Arc<TimestampTracker>, detection_interval: u32) -> Self {
        Processor {
            info,
            timestamps,
            interval: detection_interval.max(1),
            inner: Mutex::new(Inner { outputs: Vec::new(), frame_counter: 0, stopping: false }),
            prebuffer: Mutex::new(None),
            codec: Mutex::new(None),
            write_err_limiter: RateLimiter::default_rate(),
            prebuffer_err_limiter: RateLimiter::default_rate(),
        }
    }

    pub fn stream_name(&self) -> &str {
        &self.info.name
    }

    /// Attaches the stream's pre-detection buffer, so every packet that
    /// passes through also lands there (spec.md §2's Reader → Processor
    /// → Pre-Buffer path). `None` leaves packets unbuffered, e.g. for a
    /// stream with detection disabled.
    pub fn set_prebuffer(&self, buf: Option<Arc<Mutex<PreBuffer>>>) {
        *self.prebuffer.lock() = buf;
    }

    /// Supplies the codec private data attached to each detection task
    /// (spec.md §4.8's `owned_codec_params_clone`). Called by whoever
    /// owns the upstream reader once its `new_video_sample_entry` fires.
    pub fn set_codec(&self, codec: CodecParams) {
        *self.codec.lock() = Some(codec);
    }

    pub fn add_hls_output(&self, w: Arc<dyn Writer>) -> Result<(), Error> {
        self.push_output(Output::Hls(w))
    }

    pub fn add_mp4_output(&self, w: Arc<dyn Writer>) -> Result<(), Error> {
        self.push_output(Output::Mp4(w))
    }

    pub fn add_detection_output(&self, sink: Arc<dyn DetectionSink>) -> Result<(), Error> {
        self.push_output(Output::Detection(sink))
    }

    fn push_output(&self, out: Output) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        if inner.outputs.len() >= MAX_OUTPUTS {
            return Err(err!(Capacity, msg("stream {} already has {MAX_OUTPUTS} outputs", self.info.name)));
        }
        inner.outputs.push(out);
        Ok(())
    }

    /// Removes every HLS/MP4 output, closing each *after* releasing the
    /// processor's mutex (spec.md §4.5 "to eliminate deadlocks").
    /// Detection outputs have no close step.
    pub fn remove_all_outputs(&self) {
        let removed = std::mem::take(&mut self.inner.lock().outputs);
        for out in removed {
            let result = match &out {
                Output::Hls(w) | Output::Mp4(w) => w.close(),
                Output::Detection(_) => continue,
            };
            if let Err(e) = result {
                warn!(stream = %self.info.name, err = %e, "error closing output writer");
            }
        }
    }

    /// Subsequent `process_packet` calls drop packets silently (spec.md
    /// §4.5 step 4). Callers must clear the reader's callback *before*
    /// calling this, and call `remove_all_outputs` separately (spec.md
    /// "Stop always clears the reader callback before touching
    /// outputs").
    pub fn stop(&self) {
        self.inner.lock().stopping = true;
    }

    /// Per-packet processing (spec.md §4.5 steps 1-4): repairs
    /// timestamps, snapshots the output list under the mutex, releases
    /// it, then fans the packet out.
    pub fn process_packet(&self, mut pkt: Packet) -> Result<(), Error> {
        let ts = self.timestamps.repair(
            &self.info.name,
            &self.info.profile,
            Timestamps { pts: Some(pkt.pts), dts: Some(pkt.dts) },
        )?;
        pkt.pts = ts.pts.expect("repair always fills pts");
        pkt.dts = ts.dts.expect("repair always fills dts");

        if let Some(buf) = self.prebuffer.lock().as_ref() {
            if let Err(e) = buf.lock().add_packet(pkt.clone()) {
                if self.prebuffer_err_limiter.should_log() {
                    warn!(stream = %self.info.name, err = %e, "pre-buffer add_packet failed");
                }
            }
        }

        let (snapshot, fire_detection) = {
            let mut inner = self.inner.lock();
            if inner.stopping {
                return Ok(());
            }
            inner.frame_counter += 1;
            let fire = inner.frame_counter >= self.interval;
            if fire {
                inner.frame_counter = 0;
            }
            (inner.outputs.clone(), fire)
        };

        for out in &snapshot {
            match out {
                Output::Hls(w) => {
                    if let Err(e) = w.write_packet(&pkt, &self.info) {
                        if self.write_err_limiter.should_log() {
                            warn!(stream = %self.info.name, err = %e, "hls write_packet failed");
                        }
                    }
                }
                Output::Mp4(w) => {
                    if let Err(e) = w.write_packet(&pkt, &self.info) {
                        if self.write_err_limiter.should_log() {
                            warn!(stream = %self.info.name, err = %e, "mp4 write_packet failed");
                        }
                    }
                }
                Output::Detection(sink) if fire_detection => {
                    sink.submit(&self.info.name, pkt.clone(), self.codec.lock().clone());
                }
                Output::Detection(_) => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base::clock::SystemTime;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn pkt(pts: i64) -> Packet {
        Packet {
            payload: Arc::from(vec![0u8; 4].into_boxed_slice()),
            pts,
            dts: pts,
            stream_index: 0,
            keyframe: true,
            arrival: SystemTime(nix::sys::time::TimeSpec::new(0, 0)),
        }
    }

    fn processor() -> (Processor, Arc<TimestampTracker>) {
        let tracker = Arc::new(TimestampTracker::new());
        tracker.register("cam1", false).unwrap();
        let info = StreamInfo { name: "cam1".to_owned(), profile: StreamProfile::default() };
        (Processor::new(info, tracker.clone(), 3), tracker)
    }

    struct CountingWriter {
        writes: AtomicU32,
        fail: bool,
    }

    impl Writer for CountingWriter {
        fn write_packet(&self, _pkt: &Packet, _info: &StreamInfo) -> Result<(), Error> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(err!(Internal, msg("synthetic failure")));
            }
            Ok(())
        }
        fn close(&self) -> Result<(), Error> {
            Ok(())
        }
    }

    struct CountingSink {
        submits: AtomicU32,
    }

    impl DetectionSink for CountingSink {
        fn submit(&self, _stream_name: &str, _pkt: Packet, _codec: Option<CodecParams>) {
            self.submits.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn detection_fires_every_nth_frame() {
        let (proc, _tracker) = processor();
        let sink = Arc::new(CountingSink { submits: AtomicU32::new(0) });
        proc.add_detection_output(sink.clone()).unwrap();
        for i in 0..7 {
            proc.process_packet(pkt(i * 3000)).unwrap();
        }
        // interval=3: fires on packets 3 and 6 (0-indexed), i.e. twice in 7.
        assert_eq!(sink.submits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn writer_error_is_not_fatal_and_does_not_stop_other_outputs() {
        let (proc, _tracker) = processor();
        let bad = Arc::new(CountingWriter { writes: AtomicU32::new(0), fail: true });
        let good = Arc::new(CountingWriter { writes: AtomicU32::new(0), fail: false });
        proc.add_hls_output(bad.clone()).unwrap();
        proc.add_mp4_output(good.clone()).unwrap();
        proc.process_packet(pkt(0)).unwrap();
        assert_eq!(bad.writes.load(Ordering::SeqCst), 1);
        assert_eq!(good.writes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stopped_processor_drops_packets_silently() {
        let (proc, _tracker) = processor();
        let w = Arc::new(CountingWriter { writes: AtomicU32::new(0), fail: false });
        proc.add_hls_output(w.clone()).unwrap();
        proc.stop();
        proc.process_packet(pkt(0)).unwrap();
        assert_eq!(w.writes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn packets_reach_an_attached_prebuffer() {
        use crate::pool::{BackingMode, PacketBufferPool};
        use crate::prebuffer::{PreBuffer, StrategyConfig};

        let (proc, _tracker) = processor();
        let pool = PacketBufferPool::init(16 * 1024 * 1024);
        let cfg = StrategyConfig {
            stream_name: "cam1".to_owned(),
            seconds_target: 5,
            pool,
            mmap_path: std::path::PathBuf::new(),
            hls_dir: std::path::PathBuf::new(),
            go2rtc_base_url: String::new(),
        };
        let buf = Arc::new(Mutex::new(PreBuffer::new(BackingMode::MemoryPacket, cfg).unwrap()));
        proc.set_prebuffer(Some(buf.clone()));

        proc.process_packet(pkt(0)).unwrap();
        proc.process_packet(pkt(3000)).unwrap();
        assert_eq!(buf.lock().strategy.stats().count, 2);
    }

    #[test]
    fn output_capacity_is_enforced() {
        let (proc, _tracker) = processor();
        for _ in 0..MAX_OUTPUTS {
            let w = Arc::new(CountingWriter { writes: AtomicU32::new(0), fail: false });
            proc.add_hls_output(w).unwrap();
        }
        let w = Arc::new(CountingWriter { writes: AtomicU32::new(0), fail: false });
        let err = proc.add_hls_output(w).unwrap_err();
        assert_eq!(err.kind(), base::ErrorKind::Capacity);
    }
}
