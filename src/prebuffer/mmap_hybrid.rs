// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2024 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! `mmap_hybrid` pre-detection strategy: a crash-survivable ring of
//! packets backed by a file-mapped region at
//! `<storage>/buffer/<stream>.mmap` (spec.md §4.3, §6 on-disk format).
//!
//! The file header and each entry header are written as raw
//! little-endian bytes rather than a `#[repr(C)]` struct, the same way
//! `crate::h264` builds ISO BMFF boxes byte-by-byte: the layout is a
//! wire contract, not a Rust memory layout, so it shouldn't be left to
//! the compiler.

use super::{CodecParams, Packet, Stats};
use crate::pool::Buffer;
use base::clock::SystemTime;
use base::{bail, err, Error, ErrorKind};
use memmap2::MmapMut;
use nix::sys::mman::{madvise, MmapAdvise};
use nix::sys::time::TimeSpec;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::Arc;

const FILE_MAGIC: u32 = 0x4E56_4D4D;
const ENTRY_MAGIC: u32 = 0x4D4D_5056;
const FILE_VERSION: u32 = 1;
const STREAM_NAME_LEN: usize = 256;
const FILE_HEADER_LEN: usize = 4 + 4 + 4 + 4 + 4 + 8 + 8 + STREAM_NAME_LEN; // 292
const ENTRY_HEADER_LEN: usize = 4 + 4 + 8 + 8 + 4 + 4 + 8; // 40
pub const MAX_PAYLOAD: usize = 262_144;
const SLOT_ALIGN: u64 = 4096;

fn align_up(n: u64, align: u64) -> u64 {
    (n + align - 1) / align * align
}

fn slot_size() -> u64 {
    align_up((ENTRY_HEADER_LEN + MAX_PAYLOAD) as u64, SLOT_ALIGN)
}

fn data_offset() -> u64 {
    align_up(FILE_HEADER_LEN as u64, SLOT_ALIGN)
}

pub struct MmapHybridStrategy {
    buf: Buffer,
    mmap: MmapMut,
    path: PathBuf,
    capacity: u32,
    stats: Stats,
}

impl MmapHybridStrategy {
    /// Creates (or truncates and re-creates) the backing file sized for
    /// `estimated_fps × seconds × 2` slots, clamped so the file never
    /// exceeds the pool's per-stream accounting (spec.md §4.4's "disk
    /// limit" clamp, applied here as a floor of 8 slots / ceiling of
    /// 4096 slots so a misconfigured fps can't produce a degenerate or
    /// unbounded file).
    pub fn create(dir: &Path, stream_name: &str, seconds: u32, buf: Buffer) -> Result<Self, Error> {
        if stream_name.len() >= STREAM_NAME_LEN {
            bail!(InvalidArgument, msg("stream name {stream_name} too long for mmap header"));
        }
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{stream_name}.mmap"));

        let estimated_fps: u32 = 15;
        let capacity = (estimated_fps * seconds * 2).clamp(8, 4096);
        let total_size = data_offset() + capacity as u64 * slot_size();

        let file = OpenOptions::new().read(true).write(true).create(true).truncate(true).open(&path)?;
        file.set_len(total_size)?;
        let mut mmap = unsafe { MmapMut::map_mut(&file) }.err_kind_internal()?;

        // The ring is read back front-to-back on flush (`live_packets`) and
        // written back-to-back by `add_packet`; tell the kernel to read
        // ahead aggressively rather than cache pages as randomly accessed.
        unsafe { madvise(NonNull::from(mmap.as_mut()).cast(), mmap.len(), MmapAdvise::MADV_SEQUENTIAL) }
            .map_err(|e| err!(Internal, msg("madvise(MADV_SEQUENTIAL) failed: {e}")))?;

        write_file_header(&mut mmap, stream_name, 0, 0, total_size);

        Ok(MmapHybridStrategy { buf, mmap, path, capacity, stats: Stats::default() })
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
        write_ring_fields(&mut self.mmap, 0, 0, 0);
        self.buf.release_bytes(self.buf.charged_bytes());
        self.stats = Stats::default();
    }

    pub fn destroy(&mut self) {
        self.clear();
        let _ = std::fs::remove_file(&self.path);
    }

    /// Writes `pkt` into the slot at `tail`, advancing `tail` and, once
    /// the ring is full, `head` too (overwriting the oldest entry).
    /// Never blocks: a payload over `MAX_PAYLOAD` is rejected outright
    /// rather than causing partial writes.
    pub fn add_packet(&mut self, pkt: Packet) -> Result<(), Error> {
        if pkt.data_size() > MAX_PAYLOAD {
            bail!(InvalidArgument, msg("mmap entry payload {} exceeds max {MAX_PAYLOAD}", pkt.data_size()));
        }
        let header = read_header_fields(&self.mmap);
        let slot_size = slot_size();
        let data_offset = data_offset();

        let slot_off = (data_offset + header.tail as u64 * slot_size) as usize;
        write_entry(&mut self.mmap[slot_off..slot_off + slot_size as usize], &pkt);

        let was_full = header.entry_count >= self.capacity;
        let new_tail = (header.tail + 1) % self.capacity;
        let new_head = if was_full { (header.head + 1) % self.capacity } else { header.head };
        let new_count = if was_full { self.capacity } else { header.entry_count + 1 };

        write_ring_fields(&mut self.mmap, new_count, new_head, new_tail);

        if was_full {
            self.stats.packets_dropped += 1;
            self.stats.count = self.capacity as usize;
        } else {
            self.stats.count += 1;
        }
        self.stats.newest_ts = Some(pkt.arrival);
        if self.stats.oldest_ts.is_none() || was_full {
            // Recompute oldest from the slot now at `head`.
            self.stats.oldest_ts = self.read_slot(new_head).map(|p| p.arrival).or(self.stats.oldest_ts);
        }
        self.stats.current_memory_usage = self.stats.count as u64 * slot_size;
        Ok(())
    }

    fn read_slot(&self, idx: u32) -> Option<Packet> {
        let off = (data_offset() + idx as u64 * slot_size()) as usize;
        read_entry(&self.mmap[off..off + slot_size() as usize])
    }

    /// Iterates live entries from `head` to `tail`, skipping (and
    /// logging) any slot whose magic doesn't match, per spec.md §7's
    /// "mmap entry magic mismatch during read: skip slot; log; continue".
    pub fn live_packets(&self) -> Vec<Packet> {
        let header = read_header_fields(&self.mmap);
        let mut out = Vec::with_capacity(header.entry_count as usize);
        let mut idx = header.head;
        for _ in 0..header.entry_count {
            match self.read_slot(idx) {
                Some(pkt) => out.push(pkt),
                None => tracing::warn!(stream = %self.path.display(), slot = idx, "mmap entry magic mismatch; skipping"),
            }
            idx = (idx + 1) % self.capacity;
        }
        out
    }

    pub fn flush_to_file(&mut self, path: &Path, codec: &CodecParams) -> Result<super::PostFlush, Error> {
        let packets = self.live_packets();
        if packets.is_empty() {
            return Err(err!(FailedPrecondition, msg("mmap_hybrid buffer is empty")));
        }
        let start = packets.iter().position(|p| p.keyframe).unwrap_or(0);
        crate::mp4writer::remux_packets_to_file(path, &packets[start..], &codec.extradata, codec.width, codec.height)?;
        Ok(super::PostFlush::Cleared)
    }

    pub fn flush_to_callback(&mut self, cb: &mut dyn FnMut(Packet) -> Result<(), Error>) -> Result<super::PostFlush, Error> {
        let packets = self.live_packets();
        if packets.is_empty() {
            return Err(err!(FailedPrecondition, msg("mmap_hybrid buffer is empty")));
        }
        let start = packets.iter().position(|p| p.keyframe).unwrap_or(0);
        for pkt in &packets[start..] {
            cb(pkt.clone())?;
        }
        Ok(super::PostFlush::Cleared)
    }
}

trait MapErr<T> {
    fn err_kind_internal(self) -> Result<T, Error>;
}

impl<T> MapErr<T> for std::io::Result<T> {
    fn err_kind_internal(self) -> Result<T, Error> {
        self.map_err(|e| err!(Internal, msg("mmap failure: {e}")))
    }
}

struct HeaderFields {
    entry_count: u32,
    head: u32,
    tail: u32,
}

fn read_header_fields(mmap: &MmapMut) -> HeaderFields {
    HeaderFields {
        entry_count: u32::from_le_bytes(mmap[8..12].try_into().unwrap()),
        head: u32::from_le_bytes(mmap[12..16].try_into().unwrap()),
        tail: u32::from_le_bytes(mmap[16..20].try_into().unwrap()),
    }
}

fn write_ring_fields(mmap: &mut MmapMut, entry_count: u32, head: u32, tail: u32) {
    mmap[8..12].copy_from_slice(&entry_count.to_le_bytes());
    mmap[12..16].copy_from_slice(&head.to_le_bytes());
    mmap[16..20].copy_from_slice(&tail.to_le_bytes());
    let _ = mmap.flush_async();
}

/// Writes the fixed part of the file header: magic, version, ring
/// position (`entry_count`/`head`/`tail`, all zero for a fresh/cleared
/// ring), `total_size`, `data_offset` and `stream_name`. Slot capacity
/// is not itself stored — it's derivable from `(total_size -
/// data_offset) / slot_size`, matching spec.md §6's field list exactly.
fn write_file_header(mmap: &mut MmapMut, stream_name: &str, head: u32, tail: u32, total_size: u64) {
    mmap[0..4].copy_from_slice(&FILE_MAGIC.to_le_bytes());
    mmap[4..8].copy_from_slice(&FILE_VERSION.to_le_bytes());
    mmap[8..12].copy_from_slice(&0u32.to_le_bytes());
    mmap[12..16].copy_from_slice(&head.to_le_bytes());
    mmap[16..20].copy_from_slice(&tail.to_le_bytes());
    mmap[20..28].copy_from_slice(&total_size.to_le_bytes());
    mmap[28..36].copy_from_slice(&data_offset().to_le_bytes());
    let name_region = &mut mmap[36..36 + STREAM_NAME_LEN];
    name_region.fill(0);
    name_region[..stream_name.len()].copy_from_slice(stream_name.as_bytes());
    let _ = mmap.flush_async();
}

fn write_entry(slot: &mut [u8], pkt: &Packet) {
    slot[0..4].copy_from_slice(&ENTRY_MAGIC.to_le_bytes());
    slot[4..8].copy_from_slice(&(pkt.data_size() as u32).to_le_bytes());
    slot[8..16].copy_from_slice(&pkt.pts.to_le_bytes());
    slot[16..24].copy_from_slice(&pkt.dts.to_le_bytes());
    slot[24..28].copy_from_slice(&(pkt.stream_index as i32).to_le_bytes());
    let flags: u32 = if pkt.keyframe { 1 } else { 0 };
    slot[28..32].copy_from_slice(&flags.to_le_bytes());
    slot[32..40].copy_from_slice(&pkt.arrival.0.tv_sec().to_le_bytes());
    slot[ENTRY_HEADER_LEN..ENTRY_HEADER_LEN + pkt.data_size()].copy_from_slice(&pkt.payload);
}

fn read_entry(slot: &[u8]) -> Option<Packet> {
    let magic = u32::from_le_bytes(slot[0..4].try_into().unwrap());
    if magic != ENTRY_MAGIC {
        return None;
    }
    let data_size = u32::from_le_bytes(slot[4..8].try_into().unwrap()) as usize;
    if data_size > MAX_PAYLOAD || ENTRY_HEADER_LEN + data_size > slot.len() {
        return None;
    }
    let pts = i64::from_le_bytes(slot[8..16].try_into().unwrap());
    let dts = i64::from_le_bytes(slot[16..24].try_into().unwrap());
    let stream_index = i32::from_le_bytes(slot[24..28].try_into().unwrap()) as u32;
    let flags = u32::from_le_bytes(slot[28..32].try_into().unwrap());
    let timestamp = i64::from_le_bytes(slot[32..40].try_into().unwrap());
    let payload = Arc::from(&slot[ENTRY_HEADER_LEN..ENTRY_HEADER_LEN + data_size]);
    Some(Packet {
        payload,
        pts,
        dts,
        stream_index,
        keyframe: flags & 1 != 0,
        arrival: SystemTime(TimeSpec::new(timestamp, 0)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{BackingMode, PacketBufferPool};

    fn pkt(pts: i64, keyframe: bool, size: usize) -> Packet {
        Packet {
            payload: Arc::from(vec![7u8; size].into_boxed_slice()),
            pts,
            dts: pts,
            stream_index: 0,
            keyframe,
            arrival: SystemTime(TimeSpec::new(1_700_000_000 + pts, 0)),
        }
    }

    #[test]
    fn ring_overflow_keeps_three_newest() {
        // spec.md §8 scenario 2: a file sized for exactly 3 slots, fed 5
        // packets of 1000 bytes, must report count = 3 and the three
        // newest payloads readable with the entry magic.
        let dir = tempfile::tempdir().unwrap();
        let pool = PacketBufferPool::init(64 * 1024 * 1024);
        let buf = pool.acquire("cam1", 1, BackingMode::MmapHybrid);
        let mut s = MmapHybridStrategy::create(dir.path(), "cam1", 0, buf).unwrap();
        // estimated_fps(15) * seconds(0) * 2 clamps to the floor of 8, so
        // force a 3-slot file directly for this test's exact scenario.
        s.capacity = 3;
        let total_size = data_offset() + 3 * slot_size();
        write_file_header(&mut s.mmap, "cam1", 0, 0, total_size);

        for i in 0..5 {
            s.add_packet(pkt(i, i == 0, 1000)).unwrap();
        }

        assert_eq!(s.stats().count, 3);
        let live = s.live_packets();
        assert_eq!(live.len(), 3);
        assert_eq!(live.iter().map(|p| p.pts).collect::<Vec<_>>(), vec![2, 3, 4]);
    }

    #[test]
    fn rejects_oversized_payload() {
        let dir = tempfile::tempdir().unwrap();
        let pool = PacketBufferPool::init(64 * 1024 * 1024);
        let buf = pool.acquire("cam1", 5, BackingMode::MmapHybrid);
        let mut s = MmapHybridStrategy::create(dir.path(), "cam1", 5, buf).unwrap();
        let err = s.add_packet(pkt(0, true, MAX_PAYLOAD + 1)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }
}
