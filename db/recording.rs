// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2020 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Building and reading recordings via their sample index: a compact,
//! delta-encoded table of per-sample duration/size/keyframe used by both
//! the metadata store (`db::RecentRecording::video_index`) and the MP4
//! writer's sample tables.

use crate::coding::{append_varint32, decode_varint32, unzigzag32, zigzag32};
use crate::db;
use base::{bail, Error};
use std::convert::TryFrom;

pub use base::time::TIME_UNITS_PER_SEC;

pub const DESIRED_RECORDING_WALL_DURATION: i64 = 60 * TIME_UNITS_PER_SEC;
pub const MAX_RECORDING_WALL_DURATION: i64 = 5 * 60 * TIME_UNITS_PER_SEC;

pub use base::time::Duration;
pub use base::time::Time;

/// Converts from a wall time offset within a recording to a media time offset or vice versa.
pub fn rescale(from_off_90k: i32, from_duration_90k: i32, to_duration_90k: i32) -> i32 {
    debug_assert!(
        from_off_90k <= from_duration_90k,
        "from_off_90k={from_off_90k} from_duration_90k={from_duration_90k} to_duration_90k={to_duration_90k}"
    );
    if from_duration_90k == 0 {
        return 0; // avoid a divide by zero.
    }

    // The intermediate values here may overflow i32, so use an i64 instead. The max wall
    // time is [`MAX_RECORDING_WALL_DURATION`]; the max media duration should be
    // roughly the same (design limit of 500 ppm correction). The final result should fit
    // within i32.
    i32::try_from(
        i64::from(from_off_90k) * i64::from(to_duration_90k) / i64::from(from_duration_90k),
    )
    .map_err(|_| {
        format!(
            "rescale overflow: {from_off_90k} * {to_duration_90k} / {from_duration_90k} > i32::max_value()"
        )
    })
    .unwrap()
}

/// An iterator through a sample index. Initially invalid; call `next()` before each read.
#[derive(Clone, Copy, Debug, Default)]
pub struct SampleIndexIterator {
    /// The index byte position of the next sample to read (low 31 bits) and if the current
    /// sample is a key frame (high bit).
    i_and_is_key: u32,

    /// The starting data byte position of this sample within the recording.
    pub pos: u32,

    /// The starting time of this sample within the recording (in 90 kHz units).
    pub start_90k: i32,

    /// The duration of this sample (in 90 kHz units).
    pub duration_90k: i32,

    /// The byte length of this frame.
    pub bytes: u32,

    /// The byte length of the last frame of the "other" type: if this one is key, the last
    /// non-key; if this one is non-key, the last key.
    bytes_other: u32,
}

impl SampleIndexIterator {
    pub fn next(&mut self, data: &[u8]) -> Result<bool, Error> {
        self.pos += self.bytes;
        self.start_90k += self.duration_90k;
        let i = (self.i_and_is_key & 0x7FFF_FFFF) as usize;
        if i == data.len() {
            return Ok(false);
        }
        let (raw1, i1) = match decode_varint32(data, i) {
            Ok(tuple) => tuple,
            Err(()) => bail!(DataLoss, msg("bad varint 1 at offset {i}")),
        };
        let (raw2, i2) = match decode_varint32(data, i1) {
            Ok(tuple) => tuple,
            Err(()) => bail!(DataLoss, msg("bad varint 2 at offset {i1}")),
        };
        let duration_90k_delta = unzigzag32(raw1 >> 1);
        self.duration_90k += duration_90k_delta;
        if self.duration_90k < 0 {
            bail!(
                DataLoss,
                msg(
                    "negative duration {} after applying delta {}",
                    self.duration_90k,
                    duration_90k_delta,
                ),
            );
        }
        if self.duration_90k == 0 && data.len() > i2 {
            bail!(
                DataLoss,
                msg(
                    "zero duration only allowed at end; have {} bytes left",
                    data.len() - i2
                ),
            );
        }
        let (prev_bytes_key, prev_bytes_nonkey) = match self.is_key() {
            true => (self.bytes, self.bytes_other),
            false => (self.bytes_other, self.bytes),
        };
        self.i_and_is_key = (i2 as u32) | ((raw1 & 1) << 31);
        let bytes_delta = unzigzag32(raw2);
        let prev = if self.is_key() {
            self.bytes_other = prev_bytes_nonkey;
            prev_bytes_key
        } else {
            self.bytes_other = prev_bytes_key;
            prev_bytes_nonkey
        };
        self.bytes = prev.checked_add_signed(bytes_delta).unwrap_or(0);
        if self.bytes == 0 {
            bail!(
                DataLoss,
                msg(
                    "non-positive bytes after applying delta {} to key={} frame bytes={} at ts {}",
                    bytes_delta,
                    self.is_key(),
                    prev,
                    self.start_90k,
                ),
            );
        }
        Ok(true)
    }

    #[inline]
    pub fn is_key(&self) -> bool {
        (self.i_and_is_key & 0x8000_0000) != 0
    }
}

/// An encoder for a sample index.
#[derive(Debug, Default)]
pub struct SampleIndexEncoder {
    prev_duration_90k: i32,
    prev_bytes_key: i32,
    prev_bytes_nonkey: i32,
}

impl SampleIndexEncoder {
    pub fn add_sample(
        &mut self,
        duration_90k: i32,
        bytes: u32,
        is_key: bool,
        r: &mut db::RecentRecording,
    ) {
        let duration_delta = duration_90k - self.prev_duration_90k;
        self.prev_duration_90k = duration_90k;
        r.media_duration_90k += duration_90k;
        r.sample_file_bytes += bytes;
        r.video_samples += 1;
        let bytes = bytes as i32;
        let bytes_delta = bytes
            - if is_key {
                let prev = self.prev_bytes_key;
                r.video_sync_samples += 1;
                self.prev_bytes_key = bytes;
                prev
            } else {
                let prev = self.prev_bytes_nonkey;
                self.prev_bytes_nonkey = bytes;
                prev
            };
        append_varint32(
            (zigzag32(duration_delta) << 1) | (is_key as u32),
            &mut r.video_index,
        );
        append_varint32(zigzag32(bytes_delta), &mut r.video_index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_example() {
        let mut r = db::RecentRecording::default();
        let mut e = SampleIndexEncoder::default();
        e.add_sample(10, 1000, true, &mut r);
        e.add_sample(9, 10, false, &mut r);
        e.add_sample(11, 15, false, &mut r);
        e.add_sample(10, 12, false, &mut r);
        e.add_sample(10, 1050, true, &mut r);
        assert_eq!(r.video_index, b"\x29\xd0\x0f\x02\x14\x08\x0a\x02\x05\x01\x64");
        assert_eq!(10 + 9 + 11 + 10 + 10, r.media_duration_90k);
        assert_eq!(5, r.video_samples);
        assert_eq!(2, r.video_sync_samples);
    }

    #[test]
    fn test_round_trip() {
        #[derive(Debug, PartialEq, Eq)]
        struct Sample {
            duration_90k: i32,
            bytes: u32,
            is_key: bool,
        }
        #[rustfmt::skip]
        let samples = [
            Sample { duration_90k: 10, bytes: 30000, is_key: true,  },
            Sample { duration_90k:  9, bytes:  1000, is_key: false, },
            Sample { duration_90k: 11, bytes:  1100, is_key: false, },
            Sample { duration_90k: 18, bytes: 31000, is_key: true,  },
            Sample { duration_90k:  0, bytes:  1000, is_key: false, },
        ];
        let mut r = db::RecentRecording::default();
        let mut e = SampleIndexEncoder::default();
        for sample in &samples {
            e.add_sample(sample.duration_90k, sample.bytes, sample.is_key, &mut r);
        }
        let mut it = SampleIndexIterator::default();
        for sample in &samples {
            assert!(it.next(&r.video_index).unwrap());
            assert_eq!(
                sample,
                &Sample {
                    duration_90k: it.duration_90k,
                    bytes: it.bytes,
                    is_key: it.is_key()
                }
            );
        }
        assert!(!it.next(&r.video_index).unwrap());
    }

    #[test]
    fn test_iterator_errors() {
        struct Test {
            encoded: &'static [u8],
            err: &'static str,
        }
        let tests = [
            Test { encoded: b"\x80", err: "bad varint 1 at offset 0" },
            Test { encoded: b"\x00\x80", err: "bad varint 2 at offset 1" },
            Test {
                encoded: b"\x00\x02\x00\x00",
                err: "zero duration only allowed at end; have 2 bytes left",
            },
            Test { encoded: b"\x02\x02", err: "negative duration -1 after applying delta -1" },
        ];
        for test in &tests {
            let mut it = SampleIndexIterator::default();
            let e = it.next(test.encoded).unwrap_err();
            assert_eq!(e.to_string(), test.err);
        }
    }

    #[test]
    fn rescale_is_identity_at_equal_rates() {
        assert_eq!(rescale(45, 90, 90), 45);
    }
}
