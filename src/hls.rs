// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2024 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! HLS Writer (spec.md §4.6, component C6): produces a rolling playlist
//! plus `.ts` segment files in `<storage>/hls/<stream>/`. Implements
//! [`crate::processor::Writer`] so it plugs into a stream's
//! [`crate::processor::Processor`] like any other output; the "writer
//! thread" spec.md's §4.6 companion describes for always-on HLS with no
//! shared reader falls out of that composition for free: such a stream
//! just uses a `crate::streamer::Reader` whose processor has only this
//! writer attached, reusing C4's retry semantics rather than duplicating
//! them here.
//!
//! Segment rollover lives entirely inside `write_packet`: spec.md §4.6
//! forbids a second, external "force flush on keyframe" path layered on
//! top of the muxer, since that empirically causes crashes during
//! rollovers. The only keyframe-triggered side effect here is a short
//! pacing pause, never a manual trailer/close.

use crate::prebuffer::{CodecParams, Packet};
use crate::processor::{StreamInfo, Writer};
use crate::mpegts::TsMuxer;
use base::{err, Error, ErrorKind};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// spec.md §4.6 "A short (<=5ms) pause after a keyframe is permitted as
/// a pacing hint."
const KEYFRAME_PACING_PAUSE: Duration = Duration::from_millis(5);

/// Number of segments kept visible in the live playlist window. Older
/// segments' `.ts` files are left on disk for the storage manager (C11)
/// to reconcile; this writer never deletes them itself.
const PLAYLIST_WINDOW: usize = 6;

struct PlaylistSegment {
    index: u64,
    duration_s: f64,
    discontinuity: bool,
}

struct State {
    mux: TsMuxer,
    codec: Option<CodecParams>,
    segment_buf: Vec<u8>,
    segment_index: u64,
    segment_start_pts: Option<i64>,
    segments: VecDeque<PlaylistSegment>,
    media_sequence: u64,
    target_duration_s: f64,
    closed: bool,
}

/// One stream's rolling HLS playlist + segment writer. Owns an internal
/// mutex (spec.md §4.6); every `write_packet` is serialized through it.
pub struct HlsWriter {
    dir: PathBuf,
    stream_name: String,
    segment_target_s: f64,
    state: Mutex<State>,
}

impl HlsWriter {
    pub fn new(dir: PathBuf, stream_name: String, segment_target_s: f64) -> Result<Self, Error> {
        std::fs::create_dir_all(&dir)?;
        Ok(HlsWriter {
            dir,
            stream_name,
            segment_target_s,
            state: Mutex::new(State {
                mux: TsMuxer::new(),
                codec: None,
                segment_buf: Vec::new(),
                segment_index: 0,
                segment_start_pts: None,
                segments: VecDeque::new(),
                media_sequence: 0,
                target_duration_s: segment_target_s,
                closed: false,
            }),
        })
    }

    /// Supplies the codec private data needed to prefix keyframe access
    /// units with SPS/PPS (spec.md §4.6 doesn't mandate this, but it
    /// makes segments independently decodable by a player joining
    /// mid-stream). Called by whoever owns the upstream reader once its
    /// `new_video_sample_entry` fires.
    pub fn set_codec(&self, codec: CodecParams) {
        self.state.lock().codec = Some(codec);
    }

    fn segment_path(&self, index: u64) -> PathBuf {
        self.dir.join(format!("seg-{index}.ts"))
    }

    fn playlist_path(&self) -> PathBuf {
        self.dir.join("live.m3u8")
    }

    fn roll_segment(&self, state: &mut State, new_start_pts: i64) -> Result<(), Error> {
        if let Some(prev_start) = state.segment_start_pts {
            let path = self.segment_path(state.segment_index);
            if let Err(e) = std::fs::write(&path, &state.segment_buf) {
                warn!(stream = %self.stream_name, err = %e, path = %path.display(), "failed writing hls segment");
                return Err(e.into());
            }
            let duration_s = (new_start_pts - prev_start).max(0) as f64 / 90_000.0;
            state.target_duration_s = state.target_duration_s.max(duration_s.ceil());
            state.segments.push_back(PlaylistSegment {
                index: state.segment_index,
                duration_s,
                discontinuity: false,
            });
            while state.segments.len() > PLAYLIST_WINDOW {
                state.segments.pop_front();
                state.media_sequence += 1;
            }
            state.segment_index += 1;
        }
        state.segment_start_pts = Some(new_start_pts);
        state.segment_buf.clear();
        state.mux = TsMuxer::new();
        state.mux.write_headers(&mut state.segment_buf);
        self.write_playlist(state)
    }

    fn write_playlist(&self, state: &State) -> Result<(), Error> {
        let mut out = String::new();
        out.push_str("#EXTM3U\n");
        out.push_str("#EXT-X-VERSION:3\n");
        out.push_str(&format!("#EXT-X-TARGETDURATION:{}\n", state.target_duration_s.ceil() as u64));
        out.push_str(&format!("#EXT-X-MEDIA-SEQUENCE:{}\n", state.media_sequence));
        for seg in &state.segments {
            if seg.discontinuity {
                out.push_str("#EXT-X-DISCONTINUITY\n");
            }
            out.push_str(&format!("#EXTINF:{:.3},\n", seg.duration_s));
            out.push_str(&format!("seg-{}.ts\n", seg.index));
        }
        let tmp = self.playlist_path().with_extension("m3u8.tmp");
        let final_path = self.playlist_path();
        let mut f = std::fs::File::create(&tmp)?;
        f.write_all(out.as_bytes())?;
        f.flush()?;
        drop(f);
        std::fs::rename(&tmp, &final_path)?;
        Ok(())
    }
}

/// Extracts an Annex B-encoded SPS/PPS prefix from `extradata`, if it is
/// itself Annex B (the common case for samples from `crate::stream`; see
/// `crate::h264`'s module doc). An AVCDecoderConfigurationRecord-style
/// extradata is left unprefixed: the upstream's own in-band parameter
/// sets (if any) still make the segment decodable.
fn keyframe_prefix(extradata: &[u8]) -> &[u8] {
    if extradata.starts_with(b"\x00\x00\x00\x01") || extradata.starts_with(b"\x00\x00\x01") {
        extradata
    } else {
        &[]
    }
}

impl Writer for HlsWriter {
    fn write_packet(&self, pkt: &Packet, _info: &StreamInfo) -> Result<(), Error> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(err!(FailedPrecondition, msg("hls writer for {} is closed", self.stream_name)));
        }

        let should_roll = match state.segment_start_pts {
            None => true,
            Some(start) => {
                pkt.keyframe && (pkt.pts - start) as f64 / 90_000.0 >= self.segment_target_s
            }
        };
        if should_roll {
            self.roll_segment(&mut state, pkt.pts)?;
        }

        let mut payload = Vec::with_capacity(pkt.payload.len() + 32);
        if pkt.keyframe {
            if let Some(codec) = &state.codec {
                payload.extend_from_slice(keyframe_prefix(&codec.extradata));
            }
        }
        payload.extend_from_slice(&pkt.payload);
        state.mux.write_frame(&mut state.segment_buf, &payload, pkt.pts, pkt.dts, pkt.keyframe);

        let pace = pkt.keyframe;
        drop(state);
        if pace {
            std::thread::sleep(KEYFRAME_PACING_PAUSE);
        }
        Ok(())
    }

    /// Flushes the in-progress segment, writes the trailer-equivalent
    /// (an `#EXT-X-ENDLIST` playlist), and marks the writer closed
    /// (spec.md §4.6 "write trailer, close IO, clear thread context").
    fn close(&self) -> Result<(), Error> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        if let Some(prev_start) = state.segment_start_pts {
            let path = self.segment_path(state.segment_index);
            std::fs::write(&path, &state.segment_buf)?;
            state.segments.push_back(PlaylistSegment {
                index: state.segment_index,
                duration_s: state.target_duration_s,
                discontinuity: false,
            });
            let _ = prev_start;
        }
        let mut out = String::new();
        out.push_str("#EXTM3U\n#EXT-X-VERSION:3\n");
        out.push_str(&format!("#EXT-X-TARGETDURATION:{}\n", state.target_duration_s.ceil() as u64));
        out.push_str(&format!("#EXT-X-MEDIA-SEQUENCE:{}\n", state.media_sequence));
        for seg in &state.segments {
            out.push_str(&format!("#EXTINF:{:.3},\n", seg.duration_s));
            out.push_str(&format!("seg-{}.ts\n", seg.index));
        }
        out.push_str("#EXT-X-ENDLIST\n");
        let tmp = self.playlist_path().with_extension("m3u8.tmp");
        std::fs::write(&tmp, out.as_bytes())?;
        std::fs::rename(&tmp, self.playlist_path())?;
        state.closed = true;
        debug!(stream = %self.stream_name, "hls writer closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn pkt(pts: i64, keyframe: bool) -> Packet {
        Packet {
            payload: Arc::from(vec![0u8; 16].into_boxed_slice()),
            pts,
            dts: pts,
            stream_index: 0,
            keyframe,
            arrival: base::clock::SystemTime(nix::sys::time::TimeSpec::new(0, 0)),
        }
    }

    fn info() -> StreamInfo {
        StreamInfo { name: "cam1".to_owned(), profile: Default::default() }
    }

    #[test]
    fn first_packet_starts_a_segment_and_writes_playlist() {
        let dir = tempfile::tempdir().unwrap();
        let w = HlsWriter::new(dir.path().to_path_buf(), "cam1".to_owned(), 4.0).unwrap();
        w.write_packet(&pkt(0, true), &info()).unwrap();
        assert!(dir.path().join("live.m3u8").exists());
    }

    #[test]
    fn rolls_over_on_keyframe_past_target_duration() {
        let dir = tempfile::tempdir().unwrap();
        let w = HlsWriter::new(dir.path().to_path_buf(), "cam1".to_owned(), 1.0).unwrap();
        w.write_packet(&pkt(0, true), &info()).unwrap();
        w.write_packet(&pkt(45_000, false), &info()).unwrap();
        // 2 seconds later, on a keyframe: should roll to segment 1.
        w.write_packet(&pkt(180_000, true), &info()).unwrap();
        assert!(dir.path().join("seg-0.ts").exists());
        let playlist = std::fs::read_to_string(dir.path().join("live.m3u8")).unwrap();
        assert!(playlist.contains("seg-0.ts"));
    }

    #[test]
    fn non_keyframe_never_triggers_rollover() {
        let dir = tempfile::tempdir().unwrap();
        let w = HlsWriter::new(dir.path().to_path_buf(), "cam1".to_owned(), 0.0).unwrap();
        w.write_packet(&pkt(0, true), &info()).unwrap();
        w.write_packet(&pkt(90_000, false), &info()).unwrap();
        assert!(!dir.path().join("seg-0.ts").exists());
    }

    #[test]
    fn close_is_idempotent_and_writes_endlist() {
        let dir = tempfile::tempdir().unwrap();
        let w = HlsWriter::new(dir.path().to_path_buf(), "cam1".to_owned(), 4.0).unwrap();
        w.write_packet(&pkt(0, true), &info()).unwrap();
        w.close().unwrap();
        w.close().unwrap();
        let playlist = std::fs::read_to_string(dir.path().join("live.m3u8")).unwrap();
        assert!(playlist.contains("EXT-X-ENDLIST"));
        let err = w.write_packet(&pkt(1, true), &info()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FailedPrecondition);
    }

    #[test]
    fn keyframe_with_annex_b_extradata_is_prefixed() {
        let dir = tempfile::tempdir().unwrap();
        let w = HlsWriter::new(dir.path().to_path_buf(), "cam1".to_owned(), 4.0).unwrap();
        w.set_codec(CodecParams { extradata: vec![0, 0, 0, 1, 0x67, 1, 2, 3], width: 1, height: 1 });
        w.write_packet(&pkt(0, true), &info()).unwrap();
        w.close().unwrap();
        let data = std::fs::read(dir.path().join("seg-0.ts")).unwrap();
        assert!(!data.is_empty());
    }
}
