// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2024 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Runtime configuration file, loaded once at startup (spec.md §6
//! "Environment/config") and threaded through constructors rather than
//! read from globals anywhere past `main`.

use base::{err, Error};
use serde::Deserialize;
use std::path::{Path, PathBuf};

fn default_pre_buffer_seconds() -> u32 {
    30
}

fn default_detection_interval() -> u32 {
    1
}

fn default_hls_segment_target_s() -> f64 {
    4.0
}

fn default_transport() -> String {
    "tcp".to_owned()
}

/// Top-level configuration file object (spec.md §6's full
/// "Environment/config" list plus §3's per-stream descriptor fields).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Directory holding the SQLite3 index database.
    pub db_dir: PathBuf,

    /// Root directory under which recording sample files are written.
    pub storage_root: PathBuf,

    /// Root directory under which HLS segments are written. May differ
    /// from `storage_root` (spec.md §6).
    pub hls_storage_root: PathBuf,

    /// Base URL of a go2rtc instance, used by the `go2rtc_native`
    /// pre-buffer strategy.
    #[serde(default)]
    pub go2rtc_url: Option<String>,

    /// Port go2rtc's own HTTP API listens on, for strategies that query
    /// it directly rather than through `go2rtc_url`.
    #[serde(default)]
    pub go2rtc_api_port: Option<u16>,

    /// Directory containing the detection model the dispatcher loads
    /// (Open Question 2's single-path resolution: no fallback search).
    /// Required if any stream has `detection_enabled = true`.
    #[serde(default)]
    pub detection_model_dir: Option<PathBuf>,

    /// Default number of seconds of pre-event content a stream's
    /// pre-buffer retains unless overridden per-stream.
    #[serde(default = "default_pre_buffer_seconds")]
    pub default_pre_buffer_seconds: u32,

    /// Number of detection worker threads (spec.md §4.8's
    /// `MAX_DETECTION_THREADS`).
    #[serde(default)]
    pub detection_threads: Option<usize>,

    /// Byte ceiling for the packet buffer pool (spec.md §4.2). Left
    /// unset to let the pool compute its own limit from stream geometry
    /// (spec.md §4.2's `recompute_limit`).
    #[serde(default)]
    pub packet_pool_limit_bytes: Option<u64>,

    pub streams: Vec<StreamConfig>,
}

/// Per-stream descriptor (spec.md §3 "Stream descriptor").
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamConfig {
    /// Unique within the process.
    pub name: String,

    /// RTSP (or other) source URL.
    pub source: String,

    /// `udp`, `tcp`, or `auto`.
    #[serde(default = "default_transport")]
    pub transport: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub detection_enabled: bool,

    /// Overrides `default_pre_buffer_seconds` for this stream, if set.
    #[serde(default)]
    pub pre_buffer_seconds: Option<u32>,

    /// How many frames elapse between detection submissions for this
    /// stream (spec.md §4.5.3's "every Nth frame").
    #[serde(default = "default_detection_interval")]
    pub detection_interval: u32,

    #[serde(default = "default_hls_segment_target_s")]
    pub hls_segment_target_s: f64,

    /// How long completed recordings for this stream are kept, in days.
    /// `0` disables age-based retention (spec.md §4.11).
    #[serde(default)]
    pub retention_days: u32,

    /// Byte ceiling across this stream's recordings. `None` disables
    /// quota-based eviction.
    #[serde(default)]
    pub quota_bytes: Option<u64>,

    /// Expected geometry, used by `estimate_stream_bytes` (spec.md
    /// §4.2) when no explicit `packet_pool_limit_bytes` is configured.
    #[serde(default)]
    pub width: u16,
    #[serde(default)]
    pub height: u16,
    #[serde(default)]
    pub fps: u16,
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Reads and validates the configuration file at `path`.
    ///
    /// Returns an `InvalidArgument` error (spec.md §7's
    /// `ConfigurationError`) if the file can't be parsed, a quota is
    /// impossible, or a required directory is missing.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| err!(InvalidArgument, msg("unable to read config file {}", path.display()), source(e)))?;
        let config: Config = toml::from_str(&text)
            .map_err(|e| err!(InvalidArgument, msg("unable to parse config file {}", path.display()), source(e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Error> {
        if !self.storage_root.is_dir() {
            return Err(err!(
                InvalidArgument,
                msg("storageRoot {} does not exist or is not a directory", self.storage_root.display())
            ));
        }
        if !self.hls_storage_root.is_dir() {
            return Err(err!(
                InvalidArgument,
                msg("hlsStorageRoot {} does not exist or is not a directory", self.hls_storage_root.display())
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for s in &self.streams {
            if !seen.insert(s.name.as_str()) {
                return Err(err!(InvalidArgument, msg("duplicate stream name {:?}", s.name)));
            }
            if matches!(s.quota_bytes, Some(0)) {
                return Err(err!(InvalidArgument, msg("stream {:?} has an impossible quota of 0 bytes", s.name)));
            }
            if s.detection_enabled && self.detection_model_dir.is_none() {
                return Err(err!(
                    InvalidArgument,
                    msg("stream {:?} has detection enabled but no detectionModelDir is configured", s.name)
                ));
            }
        }
        Ok(())
    }

    pub fn stream(&self, name: &str) -> Option<&StreamConfig> {
        self.streams.iter().find(|s| s.name == name)
    }
}

impl StreamConfig {
    pub fn pre_buffer_seconds(&self, config: &Config) -> u32 {
        self.pre_buffer_seconds.unwrap_or(config.default_pre_buffer_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn loads_a_minimal_config() {
        let tmp = tempfile::tempdir().unwrap();
        let toml = format!(
            r#"
            dbDir = "{dir}"
            storageRoot = "{dir}"
            hlsStorageRoot = "{dir}"

            [[streams]]
            name = "cam1"
            source = "rtsp://example/cam1"
            "#,
            dir = tmp.path().display()
        );
        let path = write(tmp.path(), "nvr.toml", &toml);
        let config = Config::load(&path).unwrap();
        assert_eq!(config.streams.len(), 1);
        assert_eq!(config.streams[0].transport, "tcp");
        assert_eq!(config.default_pre_buffer_seconds, 30);
    }

    #[test]
    fn rejects_a_zero_byte_quota() {
        let tmp = tempfile::tempdir().unwrap();
        let toml = format!(
            r#"
            dbDir = "{dir}"
            storageRoot = "{dir}"
            hlsStorageRoot = "{dir}"

            [[streams]]
            name = "cam1"
            source = "rtsp://example/cam1"
            quotaBytes = 0
            "#,
            dir = tmp.path().display()
        );
        let path = write(tmp.path(), "nvr.toml", &toml);
        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("impossible quota"));
    }

    #[test]
    fn rejects_detection_enabled_without_model_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let toml = format!(
            r#"
            dbDir = "{dir}"
            storageRoot = "{dir}"
            hlsStorageRoot = "{dir}"

            [[streams]]
            name = "cam1"
            source = "rtsp://example/cam1"
            detectionEnabled = true
            "#,
            dir = tmp.path().display()
        );
        let path = write(tmp.path(), "nvr.toml", &toml);
        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("detectionModelDir"));
    }
}
