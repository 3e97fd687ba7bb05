// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2020 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Stream Reader (spec.md §4.4, component C4): opens an input URL with a
//! protocol hint and runs a dedicated OS thread that feeds packets into
//! a [`Processor`]. Retry-with-sleep-on-error loop shape carried over
//! from this crate's earlier, ffmpeg-based reader of the same name; the
//! actual open/read calls now go through `crate::stream`'s retina-backed
//! [`Opener`]/[`Stream`] traits instead.

use crate::prebuffer::{CodecParams, Packet};
use crate::processor::Processor;
use crate::stream::{Opener, Options, Stream};
use base::clock::Clocks;
use base::{shutdown, Error};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;

/// Delay between a closed/failed stream and the next reopen attempt
/// (spec.md §4.4 step 2).
const REOPEN_DELAY: std::time::Duration = std::time::Duration::from_secs(1);

/// One dedicated reader thread per enabled stream (spec.md §5).
pub struct Reader<C: Clocks> {
    label: String,
    url: Url,
    opener: &'static dyn Opener,
    options_factory: Box<dyn Fn() -> Options + Send + Sync>,
    processor: Arc<Processor>,
    codec: Mutex<Option<CodecParams>>,
    running: AtomicBool,
    clocks: C,
    runtime: tokio::runtime::Handle,
}

impl<C: Clocks> Reader<C> {
    /// `runtime` is entered for the lifetime of the spawned reader
    /// thread (mirroring this crate's earlier ffmpeg-era wiring of
    /// `let _enter = handle.enter();` around a streamer thread): the
    /// retina-backed `Opener` blocks on `tokio::runtime::Handle::current()`
    /// internally, which panics without one entered on the calling thread.
    pub fn new(
        label: String,
        url: Url,
        opener: &'static dyn Opener,
        options_factory: Box<dyn Fn() -> Options + Send + Sync>,
        processor: Arc<Processor>,
        clocks: C,
        runtime: tokio::runtime::Handle,
    ) -> Arc<Self> {
        Arc::new(Reader {
            label,
            url,
            opener,
            options_factory,
            processor,
            codec: Mutex::new(None),
            running: AtomicBool::new(true),
            clocks,
            runtime,
        })
    }

    /// The most recently observed codec private data, if any frame with
    /// `new_video_sample_entry` has arrived yet. Needed by whatever
    /// triggers a pre-buffer flush (spec.md §4.3/§4.7).
    pub fn codec_params(&self) -> Option<CodecParams> {
        self.codec.lock().clone()
    }

    /// Clears the `running` flag; the reader thread exits at its next
    /// loop check (spec.md §4.4 "Cancellation").
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Spawns the dedicated reader thread. The caller is expected to
    /// join it through `base::joinutil::join_with_timeout` (spec.md
    /// §4.4's bounded 5 s join).
    pub fn spawn(self: Arc<Self>, shutdown_rx: shutdown::Receiver) -> std::thread::JoinHandle<()>
    where
        C: 'static,
    {
        let name = format!("reader-{}", self.label);
        let runtime = self.runtime.clone();
        std::thread::Builder::new()
            .name(name)
            .spawn(move || {
                let _enter = runtime.enter();
                self.run(&shutdown_rx)
            })
            .expect("failed to spawn reader thread")
    }

    fn running_and_not_shutdown(&self, shutdown_rx: &shutdown::Receiver) -> bool {
        self.running.load(Ordering::SeqCst) && shutdown_rx.check().is_ok()
    }

    fn run(&self, shutdown_rx: &shutdown::Receiver) {
        info!(stream = %self.label, "reader starting");
        while self.running_and_not_shutdown(shutdown_rx) {
            if let Err(e) = self.run_once(shutdown_rx) {
                warn!(stream = %self.label, err = %e, "stream error; reopening in 1s");
            }
            if !self.running_and_not_shutdown(shutdown_rx) {
                break;
            }
            self.clocks.sleep(REOPEN_DELAY);
        }
        info!(stream = %self.label, "reader stopped");
    }

    /// Opens the stream and reads frames until EOF, error, or shutdown
    /// (spec.md §4.4 steps 1-4). Returning `Ok(())` here always means a
    /// clean stop was requested; any stream-level failure is an `Err`
    /// that `run` retries after a delay.
    fn run_once(&self, shutdown_rx: &shutdown::Receiver) -> Result<(), Error> {
        let mut stream = self.opener.open(self.label.clone(), self.url.clone(), (self.options_factory)())?;

        loop {
            if !self.running_and_not_shutdown(shutdown_rx) {
                return Ok(());
            }
            let frame = stream.next()?;
            if !self.running_and_not_shutdown(shutdown_rx) {
                return Ok(());
            }

            // spec.md §4.4 step 3: validate non-null/non-zero-size payload.
            if frame.data.is_empty() {
                continue;
            }

            if frame.new_video_sample_entry {
                let entry = stream.video_sample_entry();
                *self.codec.lock() =
                    Some(CodecParams { extradata: stream.extra_data().to_vec(), width: entry.width, height: entry.height });
            }

            let pkt = Packet {
                payload: Arc::from(frame.data.as_ref()),
                pts: frame.pts,
                dts: frame.pts,
                stream_index: 0,
                keyframe: frame.is_key,
                arrival: self.clocks.realtime(),
            };
            if let Err(e) = self.processor.process_packet(pkt) {
                warn!(stream = %self.label, err = %e, "process_packet failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::StreamInfo;
    use crate::timestamp::TimestampTracker;
    use base::clock::{SimulatedClocks, SystemTime};
    use bytes::Bytes;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    struct FixedFrames {
        frames: StdMutex<Vec<bytes::Bytes>>,
        entry: db::VideoSampleEntryToInsert,
    }

    impl Stream for FixedFrames {
        fn tool(&self) -> Option<&retina::client::Tool> {
            None
        }
        fn video_sample_entry(&self) -> &db::VideoSampleEntryToInsert {
            &self.entry
        }
        fn extra_data(&self) -> &[u8] {
            &[]
        }
        fn next(&mut self) -> Result<crate::stream::VideoFrame, Error> {
            let mut frames = self.frames.lock().unwrap();
            if frames.is_empty() {
                return Err(base::err!(Unavailable, msg("end of fixture")));
            }
            let data = frames.remove(0);
            Ok(crate::stream::VideoFrame {
                pts: 0,
                #[cfg(test)]
                duration: 0,
                is_key: true,
                data,
                new_video_sample_entry: false,
            })
        }
    }

    struct CountingOpener {
        opens: AtomicUsize,
    }

    impl Opener for CountingOpener {
        fn open(&self, _label: String, _url: Url, _options: Options) -> Result<Box<dyn Stream>, Error> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FixedFrames {
                frames: StdMutex::new(vec![Bytes::from_static(b"x")]),
                entry: db::VideoSampleEntryToInsert {
                    data: Vec::new(),
                    rfc6381_codec: "avc1.4d401e".to_owned(),
                    width: 1,
                    height: 1,
                    pasp_h_spacing: 1,
                    pasp_v_spacing: 1,
                },
            }))
        }
    }

    #[test]
    fn reopens_after_stream_ends() {
        let opener: &'static CountingOpener = Box::leak(Box::new(CountingOpener { opens: AtomicUsize::new(0) }));
        let tracker = Arc::new(TimestampTracker::new());
        tracker.register("cam1", false).unwrap();
        let info = StreamInfo { name: "cam1".to_owned(), profile: Default::default() };
        let processor = Arc::new(Processor::new(info, tracker, 1000));
        let clocks = SimulatedClocks::new(SystemTime(nix::sys::time::TimeSpec::new(0, 0)));
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let reader = Reader::new(
            "cam1".to_owned(),
            "rtsp://example.invalid/".parse().unwrap(),
            opener,
            Box::new(|| Options { session: retina::client::SessionOptions::default(), setup: retina::client::SetupOptions::default() }),
            processor,
            clocks,
            rt.handle().clone(),
        );
        // Run a couple of iterations manually rather than spawning a
        // real thread, so the test is deterministic.
        let (_tx, rx) = shutdown::channel();
        reader.run_once(&rx).unwrap();
        reader.run_once(&rx).unwrap();
        assert_eq!(opener.opens.load(Ordering::SeqCst), 2);
    }
}
