// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2018 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Clock interface and implementations for testability.

use nix::sys::time::TimeSpec;
use parking_lot::Mutex;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration as StdDuration;
use tracing::warn;

use crate::error::Error;
use crate::shutdown::ShutdownError;

/// A point in time as returned by `clock_gettime`. Wraps [`TimeSpec`] so that
/// [`crate::time::Time`] can convert from it without depending on `nix` directly.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SystemTime(pub TimeSpec);

impl SystemTime {
    fn duration_since(self, earlier: SystemTime) -> StdDuration {
        let diff = self.0 - earlier.0;
        if diff.tv_sec() < 0 {
            return StdDuration::ZERO;
        }
        StdDuration::new(diff.tv_sec() as u64, diff.tv_nsec().max(0) as u32)
    }

    fn add_std(self, d: StdDuration) -> SystemTime {
        let add = TimeSpec::new(d.as_secs() as i64, i64::from(d.subsec_nanos()));
        SystemTime(self.0 + add)
    }
}

/// Abstract interface to the system clocks. This is for testability.
pub trait Clocks: Send + Sync + 'static {
    /// Gets the current time from `CLOCK_REALTIME`.
    fn realtime(&self) -> SystemTime;

    /// Gets the current time from a monotonic clock.
    ///
    /// On Linux, this uses `CLOCK_BOOTTIME`, which includes suspended time.
    /// On other systems, it uses `CLOCK_MONOTONIC`.
    fn monotonic(&self) -> SystemTime;

    /// Causes the current thread to sleep for the specified time.
    fn sleep(&self, how_long: StdDuration);

    /// Calls `rcv.recv_timeout` or substitutes a test implementation.
    fn recv_timeout<T>(
        &self,
        rcv: &mpsc::Receiver<T>,
        timeout: StdDuration,
    ) -> Result<T, mpsc::RecvTimeoutError>;
}

/// Repeatedly invokes `f` until it succeeds, sleeping 1 s between attempts and
/// bailing out early if shutdown is requested.
pub fn retry<C, T, E>(
    clocks: &C,
    shutdown_rx: &crate::shutdown::Receiver,
    f: &mut dyn FnMut() -> Result<T, E>,
) -> Result<T, ShutdownError>
where
    C: Clocks,
    E: Into<Error>,
{
    loop {
        let e = match f() {
            Ok(t) => return Ok(t),
            Err(e) => e.into(),
        };
        shutdown_rx.check()?;
        warn!(%e, "sleeping for 1 s after error");
        clocks.sleep(StdDuration::from_secs(1));
    }
}

#[derive(Copy, Clone, Default)]
pub struct RealClocks {}

impl RealClocks {
    fn get(&self, clock: libc::clockid_t) -> SystemTime {
        unsafe {
            let mut ts = std::mem::MaybeUninit::uninit();
            assert_eq!(0, libc::clock_gettime(clock, ts.as_mut_ptr()));
            let ts = ts.assume_init();
            SystemTime(TimeSpec::new(
                #[allow(clippy::useless_conversion)]
                ts.tv_sec.into(),
                ts.tv_nsec as i64,
            ))
        }
    }
}

impl Clocks for RealClocks {
    fn realtime(&self) -> SystemTime {
        self.get(libc::CLOCK_REALTIME)
    }

    #[cfg(target_os = "linux")]
    fn monotonic(&self) -> SystemTime {
        self.get(libc::CLOCK_BOOTTIME)
    }

    #[cfg(not(target_os = "linux"))]
    fn monotonic(&self) -> SystemTime {
        self.get(libc::CLOCK_MONOTONIC)
    }

    fn sleep(&self, how_long: StdDuration) {
        thread::sleep(how_long);
    }

    fn recv_timeout<T>(
        &self,
        rcv: &mpsc::Receiver<T>,
        timeout: StdDuration,
    ) -> Result<T, mpsc::RecvTimeoutError> {
        rcv.recv_timeout(timeout)
    }
}

/// Logs a warning if the TimerGuard lives "too long", using the label created by a supplied
/// function.
pub struct TimerGuard<'a, C: Clocks + ?Sized, S: AsRef<str>, F: FnOnce() -> S + 'a> {
    clocks: &'a C,
    label_f: Option<F>,
    start: SystemTime,
}

impl<'a, C: Clocks + ?Sized, S: AsRef<str>, F: FnOnce() -> S + 'a> TimerGuard<'a, C, S, F> {
    pub fn new(clocks: &'a C, label_f: F) -> Self {
        TimerGuard {
            clocks,
            label_f: Some(label_f),
            start: clocks.monotonic(),
        }
    }
}

impl<'a, C, S, F> Drop for TimerGuard<'a, C, S, F>
where
    C: Clocks + ?Sized,
    S: AsRef<str>,
    F: FnOnce() -> S + 'a,
{
    fn drop(&mut self) {
        let elapsed = self.clocks.monotonic().duration_since(self.start);
        if elapsed.as_secs() >= 1 {
            let label_f = self.label_f.take().unwrap();
            warn!("{} took {:?}!", label_f().as_ref(), elapsed);
        }
    }
}

/// Simulated clock for testing.
#[derive(Clone)]
pub struct SimulatedClocks(Arc<SimulatedClocksInner>);

struct SimulatedClocksInner {
    boot: SystemTime,
    uptime: Mutex<StdDuration>,
}

impl SimulatedClocks {
    pub fn new(boot: SystemTime) -> Self {
        SimulatedClocks(Arc::new(SimulatedClocksInner {
            boot,
            uptime: Mutex::new(StdDuration::ZERO),
        }))
    }
}

impl Clocks for SimulatedClocks {
    fn realtime(&self) -> SystemTime {
        self.0.boot.add_std(*self.0.uptime.lock())
    }

    fn monotonic(&self) -> SystemTime {
        SystemTime(TimeSpec::new(0, 0)).add_std(*self.0.uptime.lock())
    }

    /// Advances the clock by the specified amount without actually sleeping.
    fn sleep(&self, how_long: StdDuration) {
        let mut l = self.0.uptime.lock();
        *l += how_long;
    }

    /// Advances the clock by the specified amount if data is not immediately available.
    fn recv_timeout<T>(
        &self,
        rcv: &mpsc::Receiver<T>,
        timeout: StdDuration,
    ) -> Result<T, mpsc::RecvTimeoutError> {
        let r = rcv.recv_timeout(StdDuration::new(0, 0));
        if r.is_err() {
            self.sleep(timeout);
        }
        r
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_clock_advances_on_sleep() {
        let c = SimulatedClocks::new(SystemTime(TimeSpec::new(1_000, 0)));
        assert_eq!(c.monotonic().0.tv_sec(), 0);
        c.sleep(StdDuration::from_secs(5));
        assert_eq!(c.monotonic().0.tv_sec(), 5);
        assert_eq!(c.realtime().0.tv_sec(), 1_005);
    }
}
