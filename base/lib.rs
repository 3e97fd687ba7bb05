// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2018 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

pub mod clock;
mod error;
pub mod joinutil;
pub mod ratelimit;
pub mod shutdown;
pub mod strutil;
pub mod time;
pub mod tracing_setup;

pub use crate::error::{Error, ErrorKind, ResultExt};

/// Mutex/Condvar used by [`shutdown`]: `parking_lot`'s variants return
/// guards directly rather than `LockResult`, which keeps the cooperative
/// cancellation code free of poisoning-recovery boilerplate.
pub(crate) use parking_lot::{Condvar, Mutex};
