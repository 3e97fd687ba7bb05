// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2024 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! `go2rtc_native` pre-detection strategy: delegates buffering entirely
//! to an upstream go2rtc instance over its HTTP API (spec.md §4.3, §6).
//! This strategy holds no bytes itself; `flush_to_file` simply fetches
//! whatever go2rtc currently has buffered.

use super::Stats;
use base::clock::SystemTime;
use base::{err, Error};
use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;

pub struct Go2rtcNativeStrategy {
    base_url: String,
    stream_name: String,
    agent: ureq::Agent,
    session_id: Option<String>,
    stats: Stats,
}

impl Go2rtcNativeStrategy {
    pub fn new(base_url: String, stream_name: String) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(5))
            .timeout_read(Duration::from_secs(10))
            .build();
        Go2rtcNativeStrategy { base_url, stream_name, agent, session_id: None, stats: Stats::default() }
    }

    pub fn is_ready(&self) -> bool {
        self.session_id.is_some()
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    pub fn clear(&mut self) {
        self.stats = Stats::default();
    }

    pub fn destroy(&mut self) {
        self.session_id = None;
        self.clear();
    }

    /// Bootstraps a streaming session via `GET /api/stream.m3u8?src=<stream>`.
    /// The response body contains `id=<session>` (spec.md §6).
    fn bootstrap_session(&mut self) -> Result<(), Error> {
        let url = format!("{}/api/stream.m3u8?src={}", self.base_url, self.stream_name);
        let resp = self.agent.get(&url).call().map_err(|e| err!(Unavailable, msg("go2rtc bootstrap failed: {e}")))?;
        let mut body = String::new();
        resp.into_reader()
            .take(4096)
            .read_to_string(&mut body)
            .map_err(|e| err!(Unavailable, msg("go2rtc bootstrap body read failed: {e}")))?;
        let id = body
            .split("id=")
            .nth(1)
            .map(|rest| rest.trim().split(['&', '\n', '\r']).next().unwrap_or("").to_owned())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| err!(Unavailable, msg("go2rtc bootstrap response missing session id")))?;
        self.session_id = Some(id);
        self.stats.newest_ts = Some(now());
        if self.stats.oldest_ts.is_none() {
            self.stats.oldest_ts = self.stats.newest_ts;
        }
        Ok(())
    }

    /// `HEAD /api/hls/playlist.m3u8?id=<id>` keepalive. Re-creates the
    /// session on any failure (expired sessions 404, per spec.md §6).
    fn ensure_session(&mut self) -> Result<(), Error> {
        if self.session_id.is_none() {
            return self.bootstrap_session();
        }
        let id = self.session_id.clone().unwrap();
        let url = format!("{}/api/hls/playlist.m3u8?id={id}", self.base_url);
        match self.agent.head(&url).call() {
            Ok(_) => Ok(()),
            Err(_) => self.bootstrap_session(),
        }
    }

    /// `GET /api/hls/segment.ts?id=<id>`: fetches whatever bytes go2rtc
    /// currently has buffered and writes them raw to `path`. The caller
    /// decides the container; this strategy never remuxes.
    pub fn flush_to_file(&mut self, path: &Path) -> Result<super::PostFlush, Error> {
        self.ensure_session()?;
        let id = self.session_id.clone().expect("ensure_session populates it");
        let url = format!("{}/api/hls/segment.ts?id={id}", self.base_url);
        let resp = self.agent.get(&url).call().map_err(|e| err!(Unavailable, msg("go2rtc segment fetch failed: {e}")))?;
        let mut out = std::fs::File::create(path)?;
        std::io::copy(&mut resp.into_reader(), &mut out)?;
        out.flush()?;
        Ok(super::PostFlush::Reinitialized)
    }
}

fn now() -> SystemTime {
    let d = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
    SystemTime(nix::sys::time::TimeSpec::new(d.as_secs() as i64, i64::from(d.subsec_nanos())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_without_a_session() {
        let s = Go2rtcNativeStrategy::new("http://127.0.0.1:1984".to_owned(), "cam1".to_owned());
        assert!(!s.is_ready());
    }

    #[test]
    fn destroy_drops_session_state() {
        let mut s = Go2rtcNativeStrategy::new("http://127.0.0.1:1984".to_owned(), "cam1".to_owned());
        s.session_id = Some("abc".to_owned());
        s.destroy();
        assert!(!s.is_ready());
    }
}
