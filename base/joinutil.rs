// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2024 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Bounded thread join with detach-on-timeout.
//!
//! spec.md §4.13/§9 calls out two competing native implementations of
//! "pthread_join_with_timeout" in the original source and asks for one
//! abstraction. This is it: every component that owns a worker thread
//! (reader, HLS writer thread, detection workers, sync worker, storage
//! cleanup worker) shuts it down through [`join_with_timeout`].

use std::thread::JoinHandle;
use std::time::Duration;
use tracing::warn;

/// Outcome of a bounded join attempt.
#[derive(Debug)]
pub enum JoinOutcome {
    /// The thread exited within the deadline.
    Joined,

    /// The thread didn't exit within the deadline; it has been detached
    /// (its `JoinHandle` dropped) rather than cancelled, per spec.md's
    /// "forced termination only as a last resort" policy.
    Detached,
}

/// Waits up to `deadline` for `handle` to finish. On timeout, detaches it:
/// the thread keeps running until it notices its own shutdown flag, but
/// this call does not block waiting for that.
///
/// Implemented with a small helper thread that performs the real
/// (unbounded) `join()` and reports back over a channel; the
/// `recv_timeout` on the channel is what's actually bounded. This makes
/// the bound itself immune to any non-cooperative blocking inside the
/// joined thread.
pub fn join_with_timeout(name: &str, handle: JoinHandle<()>, deadline: Duration) -> JoinOutcome {
    let (tx, rx) = std::sync::mpsc::channel();
    let proxy_name = format!("join-{name}");
    // This helper thread is the one potentially-leaked resource on timeout;
    // it is bounded in number (one per call) and exits as soon as the
    // underlying join completes, so the leak is bounded in time by however
    // long the stuck thread takes to actually finish.
    let proxy = std::thread::Builder::new()
        .name(proxy_name)
        .spawn(move || {
            let _ = handle.join();
            let _ = tx.send(());
        });
    let proxy = match proxy {
        Ok(p) => p,
        Err(e) => {
            warn!(thread = name, %e, "failed to spawn join helper thread");
            return JoinOutcome::Detached;
        }
    };
    match rx.recv_timeout(deadline) {
        Ok(()) => {
            let _ = proxy.join();
            JoinOutcome::Joined
        }
        Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
            warn!(thread = name, ?deadline, "thread did not stop in time; detaching");
            JoinOutcome::Detached
        }
        Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
            warn!(thread = name, "join helper thread died without reporting");
            JoinOutcome::Detached
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_promptly_finishing_thread() {
        let h = std::thread::spawn(|| {});
        let outcome = join_with_timeout("t", h, Duration::from_secs(5));
        assert!(matches!(outcome, JoinOutcome::Joined));
    }

    #[test]
    fn detaches_slow_thread() {
        let h = std::thread::spawn(|| std::thread::sleep(Duration::from_secs(30)));
        let outcome = join_with_timeout("t", h, Duration::from_millis(50));
        assert!(matches!(outcome, JoinOutcome::Detached));
    }
}
