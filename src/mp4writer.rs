// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2024 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Standalone `.mp4` writer for flushed pre-detection windows and
//! completed recordings (spec.md §4.4's sibling, component C7).
//!
//! Unlike a from-scratch ISO BMFF box builder (the shape of virtual-file
//! HTTP range serving, out of scope here per spec.md §6), this writer
//! targets a plain file on disk and leans on the `mp4` crate's
//! `Mp4Writer` rather than hand-rolling box layout.

use crate::prebuffer::Packet;
use base::{bail, err, Error, ErrorKind, ResultExt};
use mp4::{AvcConfig, MediaConfig, Mp4Config, Mp4Sample, Mp4Writer, TrackConfig};
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

/// Remuxes `packets` (already PTS/DTS-repaired and GOP-aligned by the
/// caller) into a standalone `.mp4` file at `path`. `packets` must start
/// with a keyframe. `extradata` is the stream's AVCDecoderConfiguration
/// or Annex-B SPS/PPS, as captured by the stream opener (`crate::stream`)
/// and threaded down from `crate::prebuffer`.
pub fn remux_packets_to_file(
    path: &Path,
    packets: &[Packet],
    extradata: &[u8],
    width: u16,
    height: u16,
) -> Result<(), Error> {
    let first = packets
        .first()
        .ok_or_else(|| err!(InvalidArgument, msg("no packets to remux")))?;
    if !first.keyframe {
        return Err(err!(InvalidArgument, msg("first packet of a flush window must be a keyframe")));
    }
    let extra = crate::h264::ExtraData::parse(extradata, width, height).err_kind(ErrorKind::InvalidArgument)?;
    let (seq_param_set, pic_param_set) =
        crate::h264::avcc_params(&extra.entry.data).err_kind(ErrorKind::InvalidArgument)?;

    let config = Mp4Config {
        major_brand: str::parse("isom").expect("valid brand"),
        minor_version: 512,
        compatible_brands: vec![
            str::parse("isom").expect("valid brand"),
            str::parse("iso2").expect("valid brand"),
            str::parse("avc1").expect("valid brand"),
            str::parse("mp41").expect("valid brand"),
        ],
        timescale: 90_000,
    };

    let file = File::create(path)?;
    let mut writer = Mp4Writer::write_start(BufWriter::new(file), &config).err_kind(ErrorKind::Internal)?;

    let track_config = TrackConfig {
        track_type: mp4::TrackType::Video,
        timescale: 90_000,
        language: String::from("und"),
        media_conf: MediaConfig::AvcConfig(AvcConfig {
            width: extra.entry.width,
            height: extra.entry.height,
            seq_param_set,
            pic_param_set,
        }),
    };
    writer.add_track(&track_config).err_kind(ErrorKind::Internal)?;

    let base_pts = first.pts;
    for pkt in packets {
        let data = if extra.need_transform {
            let mut avc_sample = Vec::new();
            crate::h264::transform_sample_data(&pkt.payload, &mut avc_sample).err_kind(ErrorKind::Internal)?;
            avc_sample
        } else {
            pkt.payload.to_vec()
        };
        let sample = Mp4Sample {
            start_time: (pkt.dts - base_pts).max(0) as u64,
            duration: 0,
            rendering_offset: (pkt.pts - pkt.dts) as i32,
            is_sync: pkt.keyframe,
            bytes: data.into(),
        };
        writer.write_sample(1, &sample).err_kind(ErrorKind::Internal)?;
    }

    writer.write_end().err_kind(ErrorKind::Internal)?;
    drop(writer);

    // `Mp4Writer` emits `mdat` before `moov` (it doesn't know the mdat's
    // final size until every sample has been written); relocate `moov`
    // ahead of `mdat` so players and HTTP-range tools don't need to seek
    // to the end of the file to start playback (spec.md §4.7 "+faststart").
    rewrite_faststart(path)?;
    Ok(())
}

/// Box types that contain child boxes, among those nested inside `moov`.
const CONTAINER_BOXES: &[[u8; 4]] = &[*b"moov", *b"trak", *b"mdia", *b"minf", *b"stbl", *b"dinf", *b"edts"];

fn read_box_header(data: &[u8], pos: usize) -> Option<(u64, [u8; 4], usize)> {
    if data.len() < pos + 8 {
        return None;
    }
    let size32 = u32::from_be_bytes(data[pos..pos + 4].try_into().unwrap()) as u64;
    let typ: [u8; 4] = data[pos + 4..pos + 8].try_into().unwrap();
    if size32 == 1 {
        if data.len() < pos + 16 {
            return None;
        }
        let size64 = u64::from_be_bytes(data[pos + 8..pos + 16].try_into().unwrap());
        Some((size64, typ, 16))
    } else {
        Some((size32, typ, 8))
    }
}

/// Adds `delta` to every chunk offset in `stco`/`co64` boxes nested anywhere
/// inside `data`, recursing through the known container boxes along the way
/// (`moov/trak/mdia/minf/stbl`). `delta` is the number of bytes `mdat` moved
/// forward by when `moov` was relocated ahead of it.
fn patch_chunk_offsets(data: &mut [u8], delta: i64) -> Result<(), Error> {
    let mut pos = 0usize;
    while pos < data.len() {
        let (size, typ, hdr_len) = read_box_header(data, pos)
            .ok_or_else(|| err!(Internal, msg("truncated box while patching chunk offsets for faststart")))?;
        let size = size as usize;
        if size < hdr_len || pos + size > data.len() {
            bail!(Internal, msg("invalid nested box size while patching chunk offsets for faststart"));
        }
        let box_end = pos + size;
        if CONTAINER_BOXES.contains(&typ) {
            patch_chunk_offsets(&mut data[pos + hdr_len..box_end], delta)?;
        } else if &typ == b"stco" {
            patch_stco(&mut data[pos + hdr_len..box_end], delta)?;
        } else if &typ == b"co64" {
            patch_co64(&mut data[pos + hdr_len..box_end], delta)?;
        }
        pos = box_end;
    }
    Ok(())
}

fn patch_stco(body: &mut [u8], delta: i64) -> Result<(), Error> {
    if body.len() < 8 {
        bail!(Internal, msg("stco box too short"));
    }
    let entry_count = u32::from_be_bytes(body[4..8].try_into().unwrap()) as usize;
    if body.len() < 8 + entry_count * 4 {
        bail!(Internal, msg("stco box truncated"));
    }
    for i in 0..entry_count {
        let off = 8 + i * 4;
        let cur = u32::from_be_bytes(body[off..off + 4].try_into().unwrap());
        let new = (cur as i64 + delta) as u32;
        body[off..off + 4].copy_from_slice(&new.to_be_bytes());
    }
    Ok(())
}

fn patch_co64(body: &mut [u8], delta: i64) -> Result<(), Error> {
    if body.len() < 8 {
        bail!(Internal, msg("co64 box too short"));
    }
    let entry_count = u32::from_be_bytes(body[4..8].try_into().unwrap()) as usize;
    if body.len() < 8 + entry_count * 8 {
        bail!(Internal, msg("co64 box truncated"));
    }
    for i in 0..entry_count {
        let off = 8 + i * 8;
        let cur = u64::from_be_bytes(body[off..off + 8].try_into().unwrap());
        let new = (cur as i64 + delta) as u64;
        body[off..off + 8].copy_from_slice(&new.to_be_bytes());
    }
    Ok(())
}

/// Rewrites the top-level box order of the freshly-written file at `path`
/// from `ftyp, mdat, moov` (as `Mp4Writer` emits it) to `ftyp, moov, mdat`,
/// patching every `stco`/`co64` chunk offset inside `moov` to account for
/// `mdat` moving later in the file by `moov`'s size.
fn rewrite_faststart(path: &Path) -> Result<(), Error> {
    let data = std::fs::read(path)?;

    let mut boxes = Vec::new();
    let mut pos = 0usize;
    while pos < data.len() {
        let (size, typ, _hdr_len) = read_box_header(&data, pos)
            .ok_or_else(|| err!(Internal, msg("truncated mp4 box header while rewriting for faststart")))?;
        let size = size as usize;
        if size < 8 || pos + size > data.len() {
            bail!(Internal, msg("invalid mp4 box size while rewriting for faststart"));
        }
        boxes.push((typ, pos, size));
        pos += size;
    }

    let (_, mdat_start, mdat_size) = *boxes
        .iter()
        .find(|(t, _, _)| t == b"mdat")
        .ok_or_else(|| err!(Internal, msg("no mdat box found while rewriting for faststart")))?;
    let (_, moov_start, moov_size) = *boxes
        .iter()
        .find(|(t, _, _)| t == b"moov")
        .ok_or_else(|| err!(Internal, msg("no moov box found while rewriting for faststart")))?;

    if moov_start < mdat_start {
        // Already faststart; nothing to do.
        return Ok(());
    }
    if mdat_start + mdat_size != moov_start || moov_start + moov_size != data.len() {
        bail!(Internal, msg("unexpected mp4 box layout while rewriting for faststart"));
    }

    let mut moov_bytes = data[moov_start..moov_start + moov_size].to_vec();
    patch_chunk_offsets(&mut moov_bytes, moov_size as i64)?;

    let mut out = Vec::with_capacity(data.len());
    out.extend_from_slice(&data[..mdat_start]);
    out.extend_from_slice(&moov_bytes);
    out.extend_from_slice(&data[mdat_start..mdat_start + mdat_size]);
    std::fs::write(path, out)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_window() {
        let err = remux_packets_to_file(Path::new("/nonexistent/x.mp4"), &[], &[], 0, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }
}
