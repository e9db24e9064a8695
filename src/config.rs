// This file is part of Nightjar, an edge camera video event agent.
// Copyright (C) 2026 The Nightjar Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Agent configuration: TOML file, class catalog, override file, and the
//! `EDGE_AGENT_*` environment variables.
//!
//! Configuration errors fail fast at startup; once running, a bad override
//! request is rejected while the agent keeps serving.

use base::{bail, err, Error, FastHashSet};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Classes the fleet's models can emit. An override may only narrow this.
pub const CLASS_CATALOG: [&str; 12] = [
    "person",
    "bicycle",
    "car",
    "motorcycle",
    "bus",
    "truck",
    "cat",
    "dog",
    "backpack",
    "handbag",
    "suitcase",
    "cell phone",
];

pub const ENV_CLASSES_FILTER: &str = "EDGE_AGENT_CLASSES_FILTER";
pub const ENV_AUTOSTART: &str = "EDGE_AGENT_AUTOSTART";
pub const ENV_STATUS_PORT: &str = "EDGE_AGENT_STATUS_PORT";
pub const ENV_CHILD_STATUS_PORT: &str = "EDGE_AGENT_CHILD_STATUS_PORT";

fn default_dwell_ms() -> u64 {
    500
}
fn default_silence_ms() -> u64 {
    2000
}
fn default_postroll_ms() -> u64 {
    1000
}
fn default_batch_max() -> usize {
    50
}
fn default_flush_interval_ms() -> u64 {
    250
}
fn default_max_entries() -> usize {
    64
}
fn default_max_bytes() -> usize {
    64 << 20
}
fn default_status_port() -> u16 {
    9700
}
fn default_ready_timeout_ms() -> u64 {
    15_000
}
fn default_stop_grace_ms() -> u64 {
    1500
}
fn default_idle_fps() -> u32 {
    2
}
fn default_active_fps() -> u32 {
    8
}
fn default_max_inflight() -> u32 {
    1
}
fn default_conf_threshold() -> f32 {
    0.5
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub device_id: String,

    /// JSON file holding the class override, `{"classes": [...]}`.
    pub classes_override_path: PathBuf,

    pub camera: CameraConfig,
    pub ai: AiConfig,
    pub store: StoreConfig,
    pub publish: PublishConfig,
    #[serde(default)]
    pub fsm: FsmConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub control: ControlConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CameraConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,

    /// Capture pipeline command. `{path}` expands to the transport path.
    pub pipeline: String,

    /// Filesystem endpoint of the shared-memory transport.
    pub transport_path: PathBuf,

    /// Size of the shared buffer backing the transport, if configured on
    /// the pipeline. Checked against the recommended 50 frames.
    pub shm_bytes: Option<u64>,

    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AiConfig {
    /// `host:port` of the inference worker.
    pub addr: String,

    pub model_path: String,

    #[serde(default = "default_conf_threshold")]
    pub conf_threshold: f32,

    /// Downscaler pipeline command. `{input}`, `{width}`, `{height}`,
    /// `{fps}`, `{format}` expand per the negotiated model input.
    pub scaler_pipeline: String,

    #[serde(default = "default_idle_fps")]
    pub idle_fps: u32,
    #[serde(default = "default_active_fps")]
    pub active_fps: u32,
    #[serde(default = "default_max_inflight")]
    pub max_inflight: u32,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// Base URL of the session store, e.g. `http://store:8300`.
    pub base_url: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PublishConfig {
    /// Republish pipeline command. `{path}` and `{rtsp_url}` expand.
    pub pipeline: String,

    /// RTSP endpoint the recording republish is pushed to.
    pub rtsp_url: String,

    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FsmConfig {
    pub dwell_ms: u64,
    pub silence_ms: u64,
    pub postroll_ms: u64,
}

impl Default for FsmConfig {
    fn default() -> Self {
        FsmConfig {
            dwell_ms: default_dwell_ms(),
            silence_ms: default_silence_ms(),
            postroll_ms: default_postroll_ms(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub max_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            max_entries: default_max_entries(),
            max_bytes: default_max_bytes(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct IngestConfig {
    pub batch_max: usize,
    pub flush_interval_ms: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        IngestConfig {
            batch_max: default_batch_max(),
            flush_interval_ms: default_flush_interval_ms(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ControlConfig {
    pub status_port: u16,

    /// The child's internal snapshot endpoint; defaults to
    /// `status_port + 1`.
    pub child_status_port: Option<u16>,

    /// Spawn the runtime immediately on `supervise` startup.
    pub autostart: bool,
}

impl Default for ControlConfig {
    fn default() -> Self {
        ControlConfig {
            status_port: default_status_port(),
            child_status_port: None,
            autostart: false,
        }
    }
}

impl ControlConfig {
    pub fn child_status_port(&self) -> u16 {
        self.child_status_port.unwrap_or(self.status_port + 1)
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| err!(e, msg("unable to read config {}", path.display())))?;
        let mut config: Config = toml::from_str(&raw)
            .map_err(|e| err!(InvalidArgument, msg("bad config {}", path.display()), source(e)))?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// `EDGE_AGENT_*` environment variables override the file.
    fn apply_env(&mut self) -> Result<(), Error> {
        if let Ok(v) = std::env::var(ENV_AUTOSTART) {
            self.control.autostart = parse_bool(ENV_AUTOSTART, &v)?;
        }
        if let Ok(v) = std::env::var(ENV_STATUS_PORT) {
            self.control.status_port = v
                .parse()
                .map_err(|_| err!(InvalidArgument, msg("bad {ENV_STATUS_PORT}={v:?}")))?;
        }
        if let Ok(v) = std::env::var(ENV_CHILD_STATUS_PORT) {
            self.control.child_status_port = Some(
                v.parse()
                    .map_err(|_| err!(InvalidArgument, msg("bad {ENV_CHILD_STATUS_PORT}={v:?}")))?,
            );
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), Error> {
        let c = &self.camera;
        if c.width == 0 || c.height == 0 || c.width % 2 != 0 || c.height % 2 != 0 {
            bail!(
                InvalidArgument,
                msg("camera dimensions {}x{} must be even and non-zero", c.width, c.height)
            );
        }
        if c.fps < 1 {
            bail!(InvalidArgument, msg("camera fps must be >= 1"));
        }
        if !(0. ..=1.).contains(&self.ai.conf_threshold) {
            bail!(
                InvalidArgument,
                msg("conf_threshold {} outside [0, 1]", self.ai.conf_threshold)
            );
        }
        if self.ai.idle_fps < 1 || self.ai.active_fps < self.ai.idle_fps {
            bail!(
                InvalidArgument,
                msg(
                    "ai fps modes must satisfy 1 <= idle ({}) <= active ({})",
                    self.ai.idle_fps,
                    self.ai.active_fps
                )
            );
        }
        if let Some(shm) = c.shm_bytes {
            let frame = crate::frame::nv12_frame_bytes(c.width, c.height) as u64;
            let recommended = 50 * frame;
            if shm < recommended {
                warn!(
                    shm_bytes = shm,
                    recommended, "shared buffer smaller than the recommended 50 frames"
                );
            }
        }
        Ok(())
    }

    /// The class filter in effect at runtime start: the env var wins for
    /// standalone runs, then the override file, then the full catalog.
    pub fn effective_classes(&self) -> Result<FastHashSet<String>, Error> {
        if let Ok(v) = std::env::var(ENV_CLASSES_FILTER) {
            let classes: Vec<String> = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect();
            validate_classes(&classes)?;
            return Ok(classes.into_iter().collect());
        }
        match read_override(&self.classes_override_path)? {
            Some(classes) => Ok(classes.into_iter().collect()),
            None => Ok(CLASS_CATALOG.iter().map(|s| s.to_string()).collect()),
        }
    }
}

fn parse_bool(name: &str, v: &str) -> Result<bool, Error> {
    match v {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        _ => Err(err!(InvalidArgument, msg("bad boolean {name}={v:?}"))),
    }
}

#[derive(Serialize, Deserialize)]
struct OverrideFile {
    classes: Vec<String>,
}

/// Reads the override file. Absent file means no override; an unreadable or
/// invalid file is a configuration error.
pub fn read_override(path: &Path) -> Result<Option<Vec<String>>, Error> {
    let raw = match std::fs::read(path) {
        Ok(r) => r,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(err!(e, msg("unable to read override {}", path.display()))),
    };
    let parsed: OverrideFile = serde_json::from_slice(&raw)
        .map_err(|e| err!(InvalidArgument, msg("bad override {}", path.display()), source(e)))?;
    validate_classes(&parsed.classes)?;
    Ok(Some(parsed.classes))
}

/// Writes the override file atomically (temp file + rename). Readers pick
/// it up on the next runtime start.
pub fn write_override(path: &Path, classes: &[String]) -> Result<(), Error> {
    validate_classes(classes)?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let tmp = dir.join(format!(
        ".{}.tmp",
        path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("classes-override")
    ));
    let body = serde_json::to_vec_pretty(&OverrideFile {
        classes: classes.to_vec(),
    })
    .expect("override file serializes");
    std::fs::write(&tmp, body).map_err(|e| err!(e, msg("unable to write {}", tmp.display())))?;
    std::fs::rename(&tmp, path)
        .map_err(|e| err!(e, msg("unable to move override into place at {}", path.display())))?;
    Ok(())
}

pub fn validate_classes(classes: &[String]) -> Result<(), Error> {
    for c in classes {
        if !CLASS_CATALOG.contains(&c.as_str()) {
            bail!(InvalidArgument, msg("class {c:?} is not in the catalog"));
        }
    }
    Ok(())
}

/// Expands `{name}` placeholders in a pipeline template.
pub fn expand_template(template: &str, vars: &[(&str, String)]) -> String {
    let mut out = template.to_owned();
    for (name, value) in vars {
        out = out.replace(&format!("{{{name}}}"), value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> String {
        r#"
device_id = "edge-01"
classes_override_path = "/tmp/nightjar-classes.json"

[camera]
width = 1280
height = 720
fps = 15
pipeline = "capture --out {path}"
transport_path = "/tmp/nightjar-shm.sock"

[ai]
addr = "127.0.0.1:8851"
model_path = "/models/detector.onnx"
scaler_pipeline = "scale --in {input} --size {width}x{height} --rate {fps} --format {format}"

[store]
base_url = "http://127.0.0.1:8300"

[publish]
pipeline = "publish --in {path} --to {rtsp_url}"
rtsp_url = "rtsp://127.0.0.1:8554/edge-01"
"#
        .to_owned()
    }

    fn parse(toml_str: &str) -> Result<Config, Error> {
        let config: Config = toml::from_str(toml_str)
            .map_err(|e| err!(InvalidArgument, source(e)))?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn minimal_parses_with_defaults() {
        let c = parse(&minimal_toml()).unwrap();
        assert_eq!(c.fsm.dwell_ms, 500);
        assert_eq!(c.fsm.silence_ms, 2000);
        assert_eq!(c.fsm.postroll_ms, 1000);
        assert_eq!(c.ingest.batch_max, 50);
        assert_eq!(c.cache.max_entries, 64);
        assert_eq!(c.control.child_status_port(), c.control.status_port + 1);
        assert!(!c.control.autostart);
    }

    #[test]
    fn odd_dimensions_rejected() {
        let bad = minimal_toml().replace("width = 1280", "width = 1281");
        let e = parse(&bad).unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::InvalidArgument);
    }

    #[test]
    fn zero_fps_rejected() {
        let bad = minimal_toml().replace("fps = 15", "fps = 0");
        parse(&bad).unwrap_err();
    }

    #[test]
    fn unknown_field_rejected() {
        let bad = format!("{}\nnot_a_field = 3\n", minimal_toml());
        parse(&bad).unwrap_err();
    }

    #[test]
    fn override_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("classes.json");
        assert_eq!(read_override(&path).unwrap(), None);
        write_override(&path, &["person".to_owned(), "dog".to_owned()]).unwrap();
        assert_eq!(
            read_override(&path).unwrap(),
            Some(vec!["person".to_owned(), "dog".to_owned()])
        );
    }

    #[test]
    fn override_rejects_unknown_class() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("classes.json");
        write_override(&path, &["dragon".to_owned()]).unwrap_err();
        assert_eq!(read_override(&path).unwrap(), None);
    }

    #[test]
    fn template_expansion() {
        let out = expand_template(
            "scale --in {input} --rate {fps}",
            &[("input", "/tmp/x.sock".to_owned()), ("fps", "8".to_owned())],
        );
        assert_eq!(out, "scale --in /tmp/x.sock --rate 8");
    }
}
