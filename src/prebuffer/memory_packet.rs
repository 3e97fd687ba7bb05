// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2024 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! `memory_packet` pre-detection strategy: an in-process ring of
//! packets backed by the shared `PacketBufferPool` (spec.md §4.3).

use super::{CodecParams, Packet, Stats};
use crate::pool::Buffer;
use base::{err, Error};
use std::collections::VecDeque;
use std::path::Path;

pub struct MemoryPacketStrategy {
    buf: Buffer,
    ring: VecDeque<Packet>,
    stats: Stats,
}

impl MemoryPacketStrategy {
    pub fn new(buf: Buffer) -> Self {
        MemoryPacketStrategy { buf, ring: VecDeque::new(), stats: Stats::default() }
    }

    pub fn is_ready(&self) -> bool {
        match (self.stats.oldest_ts, self.stats.newest_ts) {
            (Some(o), Some(n)) => n.0.tv_sec() - o.0.tv_sec() >= 1,
            _ => false,
        }
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    pub fn clear(&mut self) {
        for pkt in self.ring.drain(..) {
            self.buf.release_bytes(pkt.data_size() as u64);
        }
        self.stats = Stats::default();
    }

    pub fn destroy(&mut self) {
        self.clear();
    }

    /// Clones the packet in (the ring owns its own `Arc` clone),
    /// evicting the oldest entries on overflow. Never blocks.
    pub fn add_packet(&mut self, pkt: Packet) {
        let size = pkt.data_size() as u64;
        while self.buf.try_reserve(size).is_err() {
            match self.ring.pop_front() {
                Some(evicted) => {
                    self.buf.release_bytes(evicted.data_size() as u64);
                    self.stats.count -= 1;
                    self.stats.current_memory_usage -= evicted.data_size() as u64;
                }
                None => {
                    // Pool has no room even for an empty ring: drop this packet.
                    self.stats.packets_dropped += 1;
                    return;
                }
            }
        }
        if self.ring.len() + 1 > self.buf.max_packets {
            if let Some(evicted) = self.ring.pop_front() {
                self.buf.release_bytes(evicted.data_size() as u64);
                self.stats.count -= 1;
                self.stats.current_memory_usage -= evicted.data_size() as u64;
            }
        }
        if pkt.keyframe {
            // Nothing extra to track beyond membership; GOP alignment on
            // flush is handled by scanning for the first keyframe.
        }
        self.stats.newest_ts = Some(pkt.arrival);
        if self.stats.oldest_ts.is_none() {
            self.stats.oldest_ts = Some(pkt.arrival);
        }
        self.stats.count += 1;
        self.stats.current_memory_usage += size;
        self.ring.push_back(pkt);
        self.stats.oldest_ts = self.ring.front().map(|p| p.arrival);
    }

    fn ordered_from_keyframe(&self) -> impl Iterator<Item = &Packet> {
        let start = self.ring.iter().position(|p| p.keyframe).unwrap_or(0);
        self.ring.iter().skip(start)
    }

    pub fn flush_to_file(&mut self, path: &Path, codec: &CodecParams) -> Result<super::PostFlush, Error> {
        let mut out = Vec::new();
        self.flush_to_callback(&mut |pkt| {
            out.push(pkt);
            Ok(())
        })?;
        crate::mp4writer::remux_packets_to_file(path, &out, &codec.extradata, codec.width, codec.height)?;
        Ok(super::PostFlush::Cleared)
    }

    /// Remuxes the buffered window to `cb`, one packet at a time,
    /// starting from the nearest prior keyframe so the output is
    /// GOP-aligned. The ring's FIFO order guarantees non-decreasing
    /// timestamps (spec.md §8 "Ring FIFO").
    pub fn flush_to_callback(&mut self, cb: &mut dyn FnMut(Packet) -> Result<(), Error>) -> Result<super::PostFlush, Error> {
        if self.ring.is_empty() {
            return Err(err!(FailedPrecondition, msg("memory_packet buffer is empty")));
        }
        for pkt in self.ordered_from_keyframe() {
            cb(pkt.clone())?;
        }
        Ok(super::PostFlush::Cleared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{BackingMode, PacketBufferPool};
    use base::clock::SystemTime;
    use nix::sys::time::TimeSpec;
    use std::sync::Arc;

    fn pkt(pts: i64, keyframe: bool, secs_offset: i64, size: usize) -> Packet {
        Packet {
            payload: Arc::from(vec![0u8; size].into_boxed_slice()),
            pts,
            dts: pts,
            stream_index: 0,
            keyframe,
            arrival: SystemTime(TimeSpec::new(1_700_000_000 + secs_offset, 0)),
        }
    }

    #[test]
    fn fifo_order_on_flush() {
        let pool = PacketBufferPool::init(1 << 20);
        let buf = pool.acquire("cam1", 5, BackingMode::MemoryPacket);
        let mut s = MemoryPacketStrategy::new(buf);
        s.add_packet(pkt(0, true, 0, 100));
        s.add_packet(pkt(3000, false, 1, 100));
        s.add_packet(pkt(6000, false, 2, 100));
        let mut seen = Vec::new();
        s.flush_to_callback(&mut |p| {
            seen.push(p.pts);
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![0, 3000, 6000]);
    }

    #[test]
    fn overflow_evicts_oldest_and_counts_drop_only_when_ring_empty() {
        let pool = PacketBufferPool::init(250);
        let buf = pool.acquire("cam1", 5, BackingMode::MemoryPacket);
        let mut s = MemoryPacketStrategy::new(buf);
        s.add_packet(pkt(0, true, 0, 100));
        s.add_packet(pkt(1000, false, 1, 100));
        // This addition requires evicting the first packet to fit.
        s.add_packet(pkt(2000, false, 2, 100));
        assert!(s.stats().count <= 2);
        assert!(s.stats().current_memory_usage <= 250);
    }
}
