// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2024 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Per-stream PTS/DTS repair for lossy sources (spec.md §4.1, component
//! C1). Lossy or UDP-transported RTSP sources sometimes drop timestamps
//! entirely or deliver ones far from the expected cadence; this module
//! fills in the gaps and corrects gross discontinuities before packets
//! reach the HLS/MP4 writers.

use base::ratelimit::RateLimiter;
use base::{err, Error};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Fixed tracker table size (spec.md §4.1, §6 "one timestamp tracker
/// table (32 slots)").
pub const MAX_TRACKERS: usize = 32;

/// Used when neither `avg_frame_rate` nor `time_base` give a usable
/// estimate.
const FALLBACK_FRAME_DURATION: i64 = 3000;

/// Per-stream hints needed to estimate a frame's duration in
/// `time_base` ticks.
#[derive(Clone, Copy, Debug, Default)]
pub struct StreamProfile {
    /// `(numerator, denominator)` frames per second, if known.
    pub avg_frame_rate: Option<(i64, i64)>,

    /// `(numerator, denominator)` of the stream's time base.
    pub time_base: (i64, i64),

    pub is_udp: bool,
}

/// The timestamp fields this module reads and rewrites. Callers embed
/// this in their own packet type; repair mutates a copy and hands it
/// back.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Timestamps {
    pub pts: Option<i64>,
    pub dts: Option<i64>,
}

struct Tracker {
    last_pts: i64,
    last_dts: i64,
    expected_next_pts: i64,
    discontinuity_count: u64,
    is_udp: bool,
    has_history: bool,
    drift_limiter: RateLimiter,
}

impl Tracker {
    fn new(is_udp: bool) -> Self {
        Tracker {
            last_pts: 0,
            last_dts: 0,
            expected_next_pts: 0,
            discontinuity_count: 0,
            is_udp,
            has_history: false,
            drift_limiter: RateLimiter::new(10),
        }
    }

    fn reset(&mut self) {
        self.last_pts = 0;
        self.last_dts = 0;
        self.expected_next_pts = 0;
        self.has_history = false;
        self.drift_limiter.reset();
        // is_udp and discontinuity_count survive a reset.
    }
}

struct Inner {
    slots: Vec<Option<Tracker>>,
    by_name: HashMap<String, usize>,
}

/// Process-wide table of per-stream timestamp trackers.
///
/// One owned instance is threaded through the components that need it
/// (spec.md §9's "process-wide state S with init-once and teardown-once"
/// realized as an owned container, not an ambient global).
pub struct TimestampTracker {
    inner: Mutex<Inner>,
}

impl TimestampTracker {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(MAX_TRACKERS);
        slots.resize_with(MAX_TRACKERS, || None);
        TimestampTracker {
            inner: Mutex::new(Inner {
                slots,
                by_name: HashMap::new(),
            }),
        }
    }

    /// Allocates a tracker slot for `name`. Idempotent: a second
    /// registration of an already-registered name is a no-op.
    pub fn register(&self, name: &str, is_udp: bool) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        if inner.by_name.contains_key(name) {
            return Ok(());
        }
        let idx = inner
            .slots
            .iter()
            .position(|s| s.is_none())
            .ok_or_else(|| err!(Capacity, msg("timestamp tracker table full ({MAX_TRACKERS} slots)")))?;
        inner.slots[idx] = Some(Tracker::new(is_udp));
        inner.by_name.insert(name.to_owned(), idx);
        Ok(())
    }

    /// Applies the repair rules of spec.md §4.1 to `ts`, returning the
    /// repaired timestamps. `name` must already be `register`ed.
    pub fn repair(&self, name: &str, profile: &StreamProfile, mut ts: Timestamps) -> Result<Timestamps, Error> {
        let mut inner = self.inner.lock();
        let idx = *inner
            .by_name
            .get(name)
            .ok_or_else(|| err!(NotFound, msg("timestamp tracker {name} not registered")))?;
        let t = inner.slots[idx].as_mut().expect("registered index always populated");

        let frame_duration = frame_duration_ticks(profile);

        match (ts.pts, ts.dts) {
            (Some(p), None) => ts.dts = Some(p),
            (None, Some(d)) => ts.pts = Some(d),
            (None, None) => {
                if t.has_history {
                    let v = t.last_pts + frame_duration;
                    ts.pts = Some(v);
                    ts.dts = Some(v);
                } else {
                    // Never 0: downstream muxers reject a zero timestamp.
                    ts.pts = Some(1);
                    ts.dts = Some(1);
                }
            }
            (Some(_), Some(_)) => {}
        }

        if t.has_history {
            let expected = t.last_pts + frame_duration;
            let pts = ts.pts.expect("set above");
            let diff = (pts - expected).abs();
            if diff > 100 * frame_duration {
                ts.pts = Some(expected);
                ts.dts = Some(expected);
                t.discontinuity_count += 1;
                tracing::warn!(stream = name, pts, expected, count = t.discontinuity_count, "timestamp discontinuity");
            } else if diff > 10 * frame_duration && t.drift_limiter.should_log() {
                tracing::warn!(stream = name, pts, expected, "timestamp drift");
            }
        }

        let final_pts = ts.pts.expect("pts always set by now");
        let final_dts = ts.dts.unwrap_or(final_pts);
        t.last_pts = final_pts;
        t.last_dts = final_dts;
        t.expected_next_pts = final_pts + frame_duration;
        t.has_history = true;

        Ok(ts)
    }

    /// Zeroes a tracker's timestamp history, keeping its `is_udp` flag.
    pub fn reset(&self, name: &str) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        let idx = *inner
            .by_name
            .get(name)
            .ok_or_else(|| err!(NotFound, msg("timestamp tracker {name} not registered")))?;
        inner.slots[idx].as_mut().expect("registered index always populated").reset();
        Ok(())
    }

    /// Frees `name`'s slot so it may be reused by a later `register`.
    pub fn remove(&self, name: &str) {
        let mut inner = self.inner.lock();
        if let Some(idx) = inner.by_name.remove(name) {
            inner.slots[idx] = None;
        }
    }
}

impl Default for TimestampTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Estimates one frame's duration in `time_base` ticks.
fn frame_duration_ticks(profile: &StreamProfile) -> i64 {
    if let Some((num, den)) = profile.avg_frame_rate {
        if num > 0 && den > 0 && profile.time_base.0 > 0 {
            let fps = num as f64 / den as f64;
            let d = (profile.time_base.1 as f64 / (fps * profile.time_base.0 as f64)).round() as i64;
            if d > 0 {
                return d;
            }
        }
    }
    if profile.time_base.0 > 0 {
        let d = profile.time_base.1 / (30 * profile.time_base.0);
        if d > 0 {
            return d;
        }
    }
    FALLBACK_FRAME_DURATION
}

#[cfg(test)]
mod tests {
    use super::*;

    fn udp_profile() -> StreamProfile {
        StreamProfile {
            avg_frame_rate: None,
            time_base: (1, 90_000),
            is_udp: true,
        }
    }

    #[test]
    fn register_is_idempotent() {
        let t = TimestampTracker::new();
        t.register("cam1", false).unwrap();
        t.register("cam1", false).unwrap();
    }

    #[test]
    fn fills_table_then_errors() {
        let t = TimestampTracker::new();
        for i in 0..MAX_TRACKERS {
            t.register(&format!("cam{i}"), false).unwrap();
        }
        let e = t.register("one-too-many", false).unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::Capacity);
    }

    #[test]
    fn both_missing_with_no_history_is_never_zero() {
        let t = TimestampTracker::new();
        t.register("cam1", true).unwrap();
        let out = t.repair("cam1", &udp_profile(), Timestamps { pts: None, dts: None }).unwrap();
        assert_eq!(out, Timestamps { pts: Some(1), dts: Some(1) });
    }

    #[test]
    fn missing_after_history_uses_frame_duration() {
        // Scenario from spec.md §8: frame_duration = 3000, last_pts = 90000,
        // next packet has no timestamps at all -> pts = dts = 93000.
        let t = TimestampTracker::new();
        t.register("cam1", true).unwrap();
        let profile = udp_profile(); // time_base (1, 90_000), no avg_frame_rate -> fallback 3000.
        t.repair("cam1", &profile, Timestamps { pts: Some(90_000), dts: Some(90_000) }).unwrap();
        let out = t.repair("cam1", &profile, Timestamps { pts: None, dts: None }).unwrap();
        assert_eq!(out, Timestamps { pts: Some(93_000), dts: Some(93_000) });
    }

    #[test]
    fn one_missing_copies_from_other() {
        let t = TimestampTracker::new();
        t.register("cam1", false).unwrap();
        let out = t.repair("cam1", &udp_profile(), Timestamps { pts: Some(42), dts: None }).unwrap();
        assert_eq!(out, Timestamps { pts: Some(42), dts: Some(42) });
    }

    #[test]
    fn small_drift_is_unchanged() {
        let t = TimestampTracker::new();
        t.register("cam1", true).unwrap();
        let profile = udp_profile();
        t.repair("cam1", &profile, Timestamps { pts: Some(90_000), dts: Some(90_000) }).unwrap();
        // Within 10x frame_duration (3000) of the expected 93000.
        let input = Timestamps { pts: Some(95_000), dts: Some(95_000) };
        let out = t.repair("cam1", &profile, input).unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn gross_discontinuity_is_overwritten() {
        let t = TimestampTracker::new();
        t.register("cam1", true).unwrap();
        let profile = udp_profile();
        t.repair("cam1", &profile, Timestamps { pts: Some(90_000), dts: Some(90_000) }).unwrap();
        // Wildly far from the expected 93000: more than 100x frame_duration away.
        let out = t.repair("cam1", &profile, Timestamps { pts: Some(1), dts: Some(1) }).unwrap();
        assert_eq!(out, Timestamps { pts: Some(93_000), dts: Some(93_000) });
    }

    #[test]
    fn reset_keeps_is_udp_but_clears_history() {
        let t = TimestampTracker::new();
        t.register("cam1", true).unwrap();
        t.repair("cam1", &udp_profile(), Timestamps { pts: Some(90_000), dts: Some(90_000) }).unwrap();
        t.reset("cam1").unwrap();
        let out = t.repair("cam1", &udp_profile(), Timestamps { pts: None, dts: None }).unwrap();
        // History was cleared, so this is treated as the first packet again.
        assert_eq!(out, Timestamps { pts: Some(1), dts: Some(1) });
    }

    #[test]
    fn remove_frees_the_slot() {
        let t = TimestampTracker::new();
        t.register("cam1", false).unwrap();
        t.remove("cam1");
        let e = t.repair("cam1", &udp_profile(), Timestamps { pts: Some(1), dts: Some(1) }).unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::NotFound);
    }
}
