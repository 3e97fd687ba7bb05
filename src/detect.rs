// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2024 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Detection Dispatcher (spec.md §4.8, component C8): a fixed-size pool
//! of worker threads fed through a single mutex and condition variable.
//! `submit` is non-blocking: if every slot is already occupied, the task
//! is dropped and logged rather than queued, trading coverage for
//! bounded latency (spec.md "bounded latency is preferred over queue
//! bloat").
//!
//! The inference pipeline itself (model loading, tensor pre/post
//! processing) is out of scope; [`DetectionModel`] is the seam a real
//! model runtime implements.

use crate::prebuffer::{CodecParams, Packet};
use crate::processor::DetectionSink;
use base::ratelimit::RateLimiter;
use base::shutdown;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// How long a worker waits on the condvar before re-checking the
/// cooperative shutdown flag (spec.md §4.12's "poll at every bounded
/// sleep tick").
const WAIT_TICK: Duration = Duration::from_millis(500);

/// Runs inference on one dispatched packet. Implemented by whatever
/// owns the actual model runtime; this crate only owns the dispatch
/// plumbing around it.
pub trait DetectionModel: Send + Sync {
    fn infer(&self, stream_name: &str, pkt: &Packet, codec: Option<&CodecParams>);
}

struct Task {
    stream_name: String,
    pkt: Packet,
    codec: Option<CodecParams>,
}

struct Inner {
    slots: Vec<Option<Task>>,
    shutting_down: bool,
}

/// A fixed-size (`num_threads`, spec.md's `MAX_DETECTION_THREADS`) pool
/// of detection workers (spec.md §4.8).
pub struct Dispatcher {
    inner: Mutex<Inner>,
    condvar: Condvar,
    model: Arc<dyn DetectionModel>,
    drop_limiter: RateLimiter,
}

impl Dispatcher {
    pub fn new(num_threads: usize, model: Arc<dyn DetectionModel>) -> Arc<Self> {
        Arc::new(Dispatcher {
            inner: Mutex::new(Inner { slots: (0..num_threads).map(|_| None).collect(), shutting_down: false }),
            condvar: Condvar::new(),
            model,
            drop_limiter: RateLimiter::default_rate(),
        })
    }

    pub fn num_threads(&self) -> usize {
        self.inner.lock().slots.len()
    }

    /// Spawns one OS thread per slot. The caller is expected to join
    /// each handle through `base::joinutil::join_with_timeout` after
    /// calling [`Dispatcher::shutdown`] (spec.md §4.8 "broadcast, join
    /// all workers").
    pub fn spawn_workers(self: &Arc<Self>, shutdown_rx: shutdown::Receiver) -> Vec<std::thread::JoinHandle<()>> {
        let n = self.num_threads();
        (0..n)
            .map(|i| {
                let this = self.clone();
                let rx = shutdown_rx.clone();
                std::thread::Builder::new()
                    .name(format!("detect-{i}"))
                    .spawn(move || this.worker_loop(i, &rx))
                    .expect("failed to spawn detection worker")
            })
            .collect()
    }

    /// Finds a free slot and hands it `pkt`/`codec`; drops and logs
    /// (rate-limited) if none is free.
    pub fn submit(&self, stream_name: &str, pkt: Packet, codec: Option<CodecParams>) {
        let mut inner = self.inner.lock();
        if inner.shutting_down {
            return;
        }
        if let Some(slot) = inner.slots.iter_mut().find(|s| s.is_none()) {
            *slot = Some(Task { stream_name: stream_name.to_owned(), pkt, codec });
            drop(inner);
            self.condvar.notify_one();
        } else {
            drop(inner);
            if self.drop_limiter.should_log() {
                warn!(stream = %stream_name, "detection dispatcher: no free worker slot, dropping task");
            }
        }
    }

    /// Marks the dispatcher as shutting down and wakes every worker. Any
    /// slot still holding a task when its worker observes this is simply
    /// dropped along with `Inner` (spec.md "any still-marked slot has
    /// its clones freed").
    pub fn shutdown(&self) {
        self.inner.lock().shutting_down = true;
        self.condvar.notify_all();
    }

    fn worker_loop(&self, slot: usize, shutdown_rx: &shutdown::Receiver) {
        info!(slot, "detection worker starting");
        loop {
            let task = {
                let mut inner = self.inner.lock();
                loop {
                    if inner.shutting_down {
                        return;
                    }
                    if let Some(t) = inner.slots[slot].take() {
                        break Some(t);
                    }
                    let timed_out = self.condvar.wait_for(&mut inner, WAIT_TICK).timed_out();
                    if timed_out && shutdown_rx.check().is_err() {
                        inner.shutting_down = true;
                        return;
                    }
                }
            };
            if let Some(task) = task {
                self.model.infer(&task.stream_name, &task.pkt, task.codec.as_ref());
            }
        }
    }
}

impl DetectionSink for Dispatcher {
    fn submit(&self, stream_name: &str, pkt: Packet, codec: Option<CodecParams>) {
        Dispatcher::submit(self, stream_name, pkt, codec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;

    fn pkt() -> Packet {
        Packet {
            payload: Arc::from(vec![0u8; 4].into_boxed_slice()),
            pts: 0,
            dts: 0,
            stream_index: 0,
            keyframe: true,
            arrival: base::clock::SystemTime(nix::sys::time::TimeSpec::new(0, 0)),
        }
    }

    struct CountingModel {
        infers: AtomicUsize,
    }

    impl DetectionModel for CountingModel {
        fn infer(&self, _stream_name: &str, _pkt: &Packet, _codec: Option<&CodecParams>) {
            self.infers.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn submitted_task_is_processed_by_a_worker() {
        let model = Arc::new(CountingModel { infers: AtomicUsize::new(0) });
        let dispatcher = Dispatcher::new(2, model.clone());
        let (_tx, rx) = shutdown::channel();
        let handles = dispatcher.spawn_workers(rx);

        dispatcher.submit("cam1", pkt(), None);

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while model.infers.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(model.infers.load(Ordering::SeqCst), 1);

        dispatcher.shutdown();
        for h in handles {
            h.join().unwrap();
        }
    }

    struct BlockingModel {
        barrier: Arc<Barrier>,
        infers: AtomicUsize,
    }

    impl DetectionModel for BlockingModel {
        fn infer(&self, _stream_name: &str, _pkt: &Packet, _codec: Option<&CodecParams>) {
            self.infers.fetch_add(1, Ordering::SeqCst);
            self.barrier.wait();
        }
    }

    #[test]
    fn submit_drops_task_when_every_slot_is_busy() {
        // 1 worker thread, held busy on the barrier by the first
        // submission; a 2nd submission finds no free slot and is
        // dropped rather than queued.
        let barrier = Arc::new(Barrier::new(2));
        let model = Arc::new(BlockingModel { barrier: barrier.clone(), infers: AtomicUsize::new(0) });
        let dispatcher = Dispatcher::new(1, model.clone());
        let (_tx, rx) = shutdown::channel();
        let handles = dispatcher.spawn_workers(rx);

        dispatcher.submit("cam1", pkt(), None);
        // Give the worker a chance to pick up the task and block on the barrier.
        std::thread::sleep(Duration::from_millis(50));
        dispatcher.submit("cam1", pkt(), None);

        barrier.wait(); // release the worker's single in-flight infer() call
        dispatcher.shutdown();
        for h in handles {
            h.join().unwrap();
        }
        // Only the first submission was ever run; the second found no free slot.
        assert_eq!(model.infers.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn shutdown_makes_all_workers_exit() {
        let model = Arc::new(CountingModel { infers: AtomicUsize::new(0) });
        let dispatcher = Dispatcher::new(3, model);
        let (_tx, rx) = shutdown::channel();
        let handles = dispatcher.spawn_workers(rx);
        dispatcher.shutdown();
        for h in handles {
            h.join().unwrap();
        }
    }
}
