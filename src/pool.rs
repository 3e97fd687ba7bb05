// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2024 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Shared, memory-budgeted allocator for pre-detection ring buffers
//! (spec.md §4.2, component C2). The pool itself holds no packets; it
//! only enforces a process-wide byte ceiling that the pre-detection
//! buffer strategies (`crate::prebuffer`) charge against as they add and
//! evict packets.
//!
//! In the teacher's C ancestor, per-buffer mutexes were initialized
//! lazily at first acquire to avoid a window where another thread could
//! observe a zeroed-but-unlocked mutex. Rust's ownership model makes
//! that race impossible to express in the first place: `Buffer`'s mutex
//! is constructed before the `Buffer` is ever observable, so there is no
//! lazy-init step to get wrong.

use base::{bail, Error};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const MB: u64 = 1024 * 1024;
const MIN_LIMIT: u64 = 16 * MB;
const MAX_LIMIT: u64 = 512 * MB;
const MIN_STREAM_BYTES: u64 = 2 * MB;
const HEADROOM: f64 = 1.2;

/// Storage backing selected at `acquire` time; see `crate::prebuffer` for
/// the strategies themselves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackingMode {
    MemoryPacket,
    MmapHybrid,
    HlsSegment,
    Go2rtcNative,
}

/// The subset of stream configuration `recompute_limit` needs.
#[derive(Clone, Copy, Debug)]
pub struct StreamDims {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub detection_enabled: bool,
}

/// `estimate_stream_bytes(w, h, fps, seconds)` from spec.md §4.2: a rough
/// bitrate model (0.1 bits/pixel/frame, plus 8000 bps fixed overhead),
/// padded 25% and floored at 2 MB so tiny/low-fps streams still get a
/// usable buffer.
pub fn estimate_stream_bytes(width: u32, height: u32, fps: u32, seconds: u32) -> u64 {
    let bits_per_sec = (width as f64) * (height as f64) * (fps as f64) * 0.1 / 8.0 + 8000.0;
    let bytes = (bits_per_sec * seconds as f64 * 1.25).round() as u64;
    bytes.max(MIN_STREAM_BYTES)
}

/// Computes the pool's byte ceiling from live stream configuration:
/// sums `estimate_stream_bytes` over detection-enabled streams, adds 20%
/// headroom, and clamps to `[16 MB, 512 MB]`. Reserves a flat 16 MB when
/// no stream has detection enabled.
pub fn recompute_limit(streams: &[StreamDims], pre_buffer_seconds: u32) -> u64 {
    let total: u64 = streams
        .iter()
        .filter(|s| s.detection_enabled)
        .map(|s| estimate_stream_bytes(s.width, s.height, s.fps, pre_buffer_seconds))
        .sum();
    if total == 0 {
        return MIN_LIMIT;
    }
    let with_headroom = (total as f64 * HEADROOM).round() as u64;
    with_headroom.clamp(MIN_LIMIT, MAX_LIMIT)
}

struct Shared {
    limit_bytes: AtomicU64,
    used_bytes: AtomicU64,
}

/// The process-singleton packet buffer pool. Cheaply `Clone`able; all
/// clones share the same underlying ceiling and usage counters.
#[derive(Clone)]
pub struct PacketBufferPool(Arc<Shared>);

impl PacketBufferPool {
    /// `init(limit_bytes)`: called once per process at startup.
    pub fn init(limit_bytes: u64) -> Self {
        PacketBufferPool(Arc::new(Shared {
            limit_bytes: AtomicU64::new(limit_bytes),
            used_bytes: AtomicU64::new(0),
        }))
    }

    /// Recomputes and installs a new ceiling from live configuration.
    /// Never shrinks below bytes already in use; growth takes effect
    /// immediately, shrinkage takes effect as buffers release memory.
    pub fn recompute_limit(&self, streams: &[StreamDims], pre_buffer_seconds: u32) {
        let new_limit = recompute_limit(streams, pre_buffer_seconds);
        self.0.limit_bytes.store(new_limit, Ordering::SeqCst);
    }

    pub fn limit_bytes(&self) -> u64 {
        self.0.limit_bytes.load(Ordering::SeqCst)
    }

    pub fn used_bytes(&self) -> u64 {
        self.0.used_bytes.load(Ordering::SeqCst)
    }

    /// Allocates an accounting handle for a pre-detection buffer. The
    /// handle carries no packets itself; strategies charge bytes against
    /// it via `try_reserve`/`release_bytes` as they add/evict.
    pub fn acquire(&self, stream_name: &str, seconds: u32, mode: BackingMode) -> Buffer {
        let max_packets = (1.2 * 15.0 * seconds as f64).round() as usize;
        Buffer {
            pool: self.0.clone(),
            stream_name: stream_name.to_owned(),
            max_packets,
            mode,
            charged: AtomicU64::new(0),
        }
    }

    /// Returns a buffer's accounted bytes to the pool. Idempotent with
    /// respect to `Buffer::release_bytes`/`try_reserve` already called on
    /// `buf` — whatever is still charged is deducted exactly once.
    pub fn release(&self, buf: Buffer) {
        let remaining = buf.charged.swap(0, Ordering::SeqCst);
        if remaining > 0 {
            self.0.used_bytes.fetch_sub(remaining, Ordering::SeqCst);
        }
    }
}

/// A pre-detection buffer's accounting handle against the shared pool.
/// `max_packets` and `mode` are fixed at `acquire` time; `try_reserve`/
/// `release_bytes` track the buffer's live contribution to
/// `PacketBufferPool::used_bytes`.
pub struct Buffer {
    pool: Arc<Shared>,
    pub stream_name: String,
    pub max_packets: usize,
    pub mode: BackingMode,
    charged: AtomicU64,
}

impl Buffer {
    /// Attempts to charge `bytes` more against the pool's ceiling.
    /// Returns `Capacity` if doing so would exceed the limit; the caller
    /// (a pre-detection strategy) is expected to evict first, per the
    /// FIFO-by-arrival eviction contract of spec.md §4.3.
    pub fn try_reserve(&self, bytes: u64) -> Result<(), Error> {
        loop {
            let cur = self.pool.used_bytes.load(Ordering::SeqCst);
            let limit = self.pool.limit_bytes.load(Ordering::SeqCst);
            let new = cur + bytes;
            if new > limit {
                bail!(Capacity, msg("packet pool limit exceeded: {new} > {limit}"));
            }
            if self
                .pool
                .used_bytes
                .compare_exchange_weak(cur, new, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                self.charged.fetch_add(bytes, Ordering::SeqCst);
                return Ok(());
            }
        }
    }

    /// Returns `bytes` of this buffer's charge to the pool, e.g. when an
    /// evicted slot's payload is dropped.
    pub fn release_bytes(&self, bytes: u64) {
        self.charged.fetch_sub(bytes, Ordering::SeqCst);
        self.pool.used_bytes.fetch_sub(bytes, Ordering::SeqCst);
    }

    pub fn charged_bytes(&self) -> u64 {
        self.charged.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_clamps_and_reserves_minimum() {
        assert_eq!(recompute_limit(&[], 5), MIN_LIMIT);
        let big = StreamDims { width: 4096, height: 2160, fps: 30, detection_enabled: true };
        assert_eq!(recompute_limit(&[big], 3600), MAX_LIMIT);
        let small = StreamDims { width: 320, height: 240, fps: 5, detection_enabled: true };
        let limit = recompute_limit(&[small], 5);
        assert!(limit >= MIN_LIMIT);
    }

    #[test]
    fn non_detection_streams_do_not_count() {
        let s = StreamDims { width: 1920, height: 1080, fps: 30, detection_enabled: false };
        assert_eq!(recompute_limit(&[s], 5), MIN_LIMIT);
    }

    #[test]
    fn pool_bound_never_exceeded() {
        let pool = PacketBufferPool::init(10_000);
        let buf = pool.acquire("cam1", 5, BackingMode::MemoryPacket);
        buf.try_reserve(6_000).unwrap();
        buf.try_reserve(5_000).unwrap_err();
        assert!(pool.used_bytes() <= pool.limit_bytes());
        buf.release_bytes(6_000);
        assert_eq!(pool.used_bytes(), 0);
        pool.release(buf);
    }

    #[test]
    fn release_returns_any_remaining_charge() {
        let pool = PacketBufferPool::init(10_000);
        let buf = pool.acquire("cam1", 5, BackingMode::MemoryPacket);
        buf.try_reserve(4_000).unwrap();
        pool.release(buf);
        assert_eq!(pool.used_bytes(), 0);
    }

    #[test]
    fn acquire_computes_max_packets_from_seconds() {
        let pool = PacketBufferPool::init(MIN_LIMIT);
        let buf = pool.acquire("cam1", 15, BackingMode::MemoryPacket);
        assert_eq!(buf.max_packets, 270); // 1.2 * 15 * 15
    }
}
