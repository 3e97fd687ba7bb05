// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2024 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Pre-Detection Buffer (spec.md §4.3, component C3) — the hardest
//! subsystem: retains a rolling window of recent packets or segments so
//! that a detection event can promote pre-event content into a durable
//! recording.
//!
//! The source this was distilled from expressed the four strategies as
//! a vtable of function pointers with unused entries left null, probed
//! by the caller before use (spec.md §9's first re-architecture note).
//! Here the capability contract is instead a closed enum of variants;
//! an operation a variant doesn't support returns `Unimplemented`
//! rather than requiring callers to probe a null pointer.

mod go2rtc_native;
mod hls_segment;
mod memory_packet;
mod mmap_hybrid;

pub use go2rtc_native::Go2rtcNativeStrategy;
pub use hls_segment::{HlsSegmentStrategy, SegmentDescriptor};
pub use memory_packet::MemoryPacketStrategy;
pub use mmap_hybrid::MmapHybridStrategy;

use crate::pool::{BackingMode, PacketBufferPool};
use base::clock::SystemTime;
use base::{err, Error};
use std::path::PathBuf;
use std::sync::Arc;

/// An opaque compressed media unit (spec.md §3 "Packet"). Payload is
/// reference-counted so a clone is cheap and each holder may drop its
/// clone independently — the Rust expression of spec.md §9's
/// "reference-counted packet clones" re-architecture note: ownership is
/// inherent to `Arc`, so there is no pointer-validity bookkeeping to get
/// wrong.
#[derive(Clone, Debug)]
pub struct Packet {
    pub payload: Arc<[u8]>,
    pub pts: i64,
    pub dts: i64,
    pub stream_index: u32,
    pub keyframe: bool,
    pub arrival: SystemTime,
}

impl Packet {
    pub fn data_size(&self) -> usize {
        self.payload.len()
    }
}

/// Running counters exposed by every strategy (spec.md §3 "Pre-Buffer
/// handle" stats, §8 testable invariants).
#[derive(Clone, Copy, Debug, Default)]
pub struct Stats {
    pub count: usize,
    pub packets_dropped: u64,
    pub current_memory_usage: u64,
    pub oldest_ts: Option<SystemTime>,
    pub newest_ts: Option<SystemTime>,
}

/// The state machine shared by all four strategies (spec.md §4.3).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Created,
    Initialized,
    Ready,
    Full,
    Destroyed,
}

/// What a successful `flush_to_file`/`flush_to_callback` does to the
/// strategy's own state (spec.md §4.3 "Common contract").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PostFlush {
    Cleared,
    Reinitialized,
}

/// The stream's codec private data, needed by strategies that remux raw
/// packets into a standalone `.mp4` (`MemoryPacket`, `MmapHybrid`).
/// Strategies that only concatenate already-muxed segments ignore it.
#[derive(Clone, Debug)]
pub struct CodecParams {
    pub extradata: Vec<u8>,
    pub width: u16,
    pub height: u16,
}

/// One interchangeable pre-detection buffer implementation (spec.md
/// §4.3's four strategies). Operations a given variant doesn't support
/// return `Unimplemented` rather than being silently absent.
pub enum Strategy {
    MemoryPacket(MemoryPacketStrategy),
    MmapHybrid(MmapHybridStrategy),
    HlsSegment(HlsSegmentStrategy),
    Go2rtcNative(Go2rtcNativeStrategy),
}

/// Configuration needed to construct any of the four strategies; unused
/// fields for a given strategy are simply ignored.
pub struct StrategyConfig {
    pub stream_name: String,
    pub seconds_target: u32,
    pub pool: PacketBufferPool,
    pub mmap_path: PathBuf,
    pub hls_dir: PathBuf,
    pub go2rtc_base_url: String,
}

impl Strategy {
    pub fn new(mode: BackingMode, cfg: &StrategyConfig) -> Result<Strategy, Error> {
        Ok(match mode {
            BackingMode::MemoryPacket => {
                let buf = cfg.pool.acquire(&cfg.stream_name, cfg.seconds_target, mode);
                Strategy::MemoryPacket(MemoryPacketStrategy::new(buf))
            }
            BackingMode::MmapHybrid => {
                let buf = cfg.pool.acquire(&cfg.stream_name, cfg.seconds_target, mode);
                Strategy::MmapHybrid(MmapHybridStrategy::create(&cfg.mmap_path, &cfg.stream_name, cfg.seconds_target, buf)?)
            }
            BackingMode::HlsSegment => Strategy::HlsSegment(HlsSegmentStrategy::new(cfg.hls_dir.join(&cfg.stream_name))),
            BackingMode::Go2rtcNative => {
                Strategy::Go2rtcNative(Go2rtcNativeStrategy::new(cfg.go2rtc_base_url.clone(), cfg.stream_name.clone()))
            }
        })
    }

    pub fn is_ready(&self) -> bool {
        match self {
            Strategy::MemoryPacket(s) => s.is_ready(),
            Strategy::MmapHybrid(s) => s.is_ready(),
            Strategy::HlsSegment(s) => s.is_ready(),
            Strategy::Go2rtcNative(s) => s.is_ready(),
        }
    }

    pub fn stats(&self) -> Stats {
        match self {
            Strategy::MemoryPacket(s) => s.stats(),
            Strategy::MmapHybrid(s) => s.stats(),
            Strategy::HlsSegment(s) => s.stats(),
            Strategy::Go2rtcNative(s) => s.stats(),
        }
    }

    pub fn clear(&mut self) {
        match self {
            Strategy::MemoryPacket(s) => s.clear(),
            Strategy::MmapHybrid(s) => s.clear(),
            Strategy::HlsSegment(s) => s.clear(),
            Strategy::Go2rtcNative(s) => s.clear(),
        }
    }

    pub fn add_packet(&mut self, pkt: Packet) -> Result<(), Error> {
        match self {
            Strategy::MemoryPacket(s) => Ok(s.add_packet(pkt)),
            Strategy::MmapHybrid(s) => s.add_packet(pkt),
            Strategy::HlsSegment(_) | Strategy::Go2rtcNative(_) => {
                Err(err!(Unimplemented, msg("strategy does not support add_packet")))
            }
        }
    }

    pub fn add_segment(&mut self, path: PathBuf, duration_s: f64) -> Result<(), Error> {
        match self {
            Strategy::HlsSegment(s) => s.add_segment(path, duration_s),
            _ => Err(err!(Unimplemented, msg("strategy does not support add_segment"))),
        }
    }

    pub fn protect_segment(&mut self, path: &std::path::Path) -> Result<(), Error> {
        match self {
            Strategy::HlsSegment(s) => {
                s.set_protected(path, true);
                Ok(())
            }
            _ => Err(err!(Unimplemented, msg("strategy does not support protect_segment"))),
        }
    }

    pub fn unprotect_segment(&mut self, path: &std::path::Path) -> Result<(), Error> {
        match self {
            Strategy::HlsSegment(s) => {
                s.set_protected(path, false);
                Ok(())
            }
            _ => Err(err!(Unimplemented, msg("strategy does not support unprotect_segment"))),
        }
    }

    pub fn get_segments(&self) -> Result<&[SegmentDescriptor], Error> {
        match self {
            Strategy::HlsSegment(s) => Ok(s.segments()),
            _ => Err(err!(Unimplemented, msg("strategy does not support get_segments"))),
        }
    }

    /// Flushes to a standalone MP4 file at `path`. On success the
    /// strategy transitions per `PostFlush`; on any failure, partial
    /// output at `path` is removed.
    pub fn flush_to_file(&mut self, path: &std::path::Path, codec: &CodecParams) -> Result<PostFlush, Error> {
        let result = match self {
            Strategy::MemoryPacket(s) => s.flush_to_file(path, codec),
            Strategy::MmapHybrid(s) => s.flush_to_file(path, codec),
            Strategy::HlsSegment(s) => s.flush_to_file(path),
            Strategy::Go2rtcNative(s) => s.flush_to_file(path),
        };
        if result.is_err() {
            let _ = std::fs::remove_file(path);
        }
        match &result {
            Ok(_) => match std::fs::metadata(path) {
                Ok(m) if m.len() > 0 => {}
                _ => {
                    let _ = std::fs::remove_file(path);
                    return Err(err!(Internal, msg("flush produced zero bytes")));
                }
            },
            Err(_) => {}
        }
        result
    }

    pub fn flush_to_callback(&mut self, cb: &mut dyn FnMut(Packet) -> Result<(), Error>) -> Result<PostFlush, Error> {
        match self {
            Strategy::MemoryPacket(s) => s.flush_to_callback(cb),
            Strategy::MmapHybrid(s) => s.flush_to_callback(cb),
            _ => Err(err!(Unimplemented, msg("strategy does not support flush_to_callback"))),
        }
    }

    pub fn destroy(&mut self) {
        match self {
            Strategy::MemoryPacket(s) => s.destroy(),
            Strategy::MmapHybrid(s) => s.destroy(),
            Strategy::HlsSegment(s) => s.destroy(),
            Strategy::Go2rtcNative(s) => s.destroy(),
        }
    }
}

/// Per-stream pre-detection buffer (spec.md §3 "Pre-Buffer handle").
/// One per stream; created when the stream is enabled for detection,
/// cleared after flush, destroyed at stream teardown.
pub struct PreBuffer {
    pub stream_name: String,
    pub seconds_target: u32,
    pub strategy: Strategy,
    state: State,
}

impl PreBuffer {
    pub fn new(mode: BackingMode, cfg: StrategyConfig) -> Result<Self, Error> {
        let stream_name = cfg.stream_name.clone();
        let seconds_target = cfg.seconds_target;
        let strategy = Strategy::new(mode, &cfg)?;
        Ok(PreBuffer {
            stream_name,
            seconds_target,
            strategy,
            state: State::Initialized,
        })
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn add_packet(&mut self, pkt: Packet) -> Result<(), Error> {
        self.strategy.add_packet(pkt)?;
        self.state = if self.strategy.is_ready() { State::Ready } else { State::Initialized };
        Ok(())
    }

    pub fn flush_to_file(&mut self, path: &std::path::Path, codec: &CodecParams) -> Result<(), Error> {
        match self.strategy.flush_to_file(path, codec)? {
            PostFlush::Cleared => {
                self.strategy.clear();
                self.state = State::Initialized;
            }
            PostFlush::Reinitialized => {
                self.state = State::Initialized;
            }
        }
        Ok(())
    }

    pub fn destroy(mut self) {
        self.strategy.destroy();
        self.state = State::Destroyed;
    }
}
