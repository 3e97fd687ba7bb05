// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2024 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Occurrence-counting rate limiter for hot error/warning paths.
//!
//! spec.md §7 requires "rate-limiting ... mandatory for hot error paths
//! (default: log every 200th occurrence or every keyframe)". This is a
//! small, allocation-free counter rather than a time-windowed limiter:
//! the spec's own examples (discontinuity logging in §4.1, sample-drop
//! logging in §4.4/§4.5) are all phrased in terms of occurrence counts,
//! not wall-clock windows.

use std::sync::atomic::{AtomicU64, Ordering};

pub const DEFAULT_EVERY: u64 = 200;

/// Counts occurrences and reports whether the current one should be
/// logged. `Send + Sync`, cheap to embed per-stream or per-component.
#[derive(Debug)]
pub struct RateLimiter {
    every: u64,
    count: AtomicU64,
}

impl RateLimiter {
    pub const fn new(every: u64) -> Self {
        RateLimiter {
            every: if every == 0 { 1 } else { every },
            count: AtomicU64::new(0),
        }
    }

    pub const fn default_rate() -> Self {
        Self::new(DEFAULT_EVERY)
    }

    /// Returns `true` on the 1st, (every+1)th, (2*every+1)th, ... call.
    pub fn should_log(&self) -> bool {
        let prev = self.count.fetch_add(1, Ordering::Relaxed);
        prev % self.every == 0
    }

    pub fn reset(&self) {
        self.count.store(0, Ordering::Relaxed);
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::default_rate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logs_first_and_every_nth() {
        let r = RateLimiter::new(3);
        let decisions: Vec<bool> = (0..7).map(|_| r.should_log()).collect();
        assert_eq!(decisions, vec![true, false, false, true, false, false, true]);
    }
}
