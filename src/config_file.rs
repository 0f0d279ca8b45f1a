//! TOML config-file loading, merged over built-in defaults (spec §6
//! "config-file path is optional... else defaults").
//!
//! Every field is optional; a value absent from the file keeps the
//! corresponding [`Default`] from `otvision_core::config`. CLI flags are
//! applied on top of this after loading (each `cmds::*::run` does the
//! merge inline), so the precedence is CLI > config file > built-in
//! default.

use std::fs;
use std::path::{Path, PathBuf};

use base::{err, Error, ResultExt};
use otvision_core::config::Device;
use serde::Deserialize;

const FALLBACK_NAME: &str = "user_config.otvision.yaml";

/// No `stream` section: the CLI surface is `detect`/`track`/
/// `generate_video` (spec §6), none of which take RTSP input, so
/// `StreamConfig` has no config-file representation here. A caller
/// embedding `otvision_core::pipeline::run_stream` directly builds its own.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub detect: DetectSection,
    pub track: TrackSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DetectSection {
    pub weights: Option<PathBuf>,
    pub conf: Option<f32>,
    pub iou: Option<f32>,
    pub image_size: Option<u32>,
    pub half_precision: Option<bool>,
    pub device: Option<DeviceValue>,
    pub normalized: Option<bool>,
    pub chunksize: Option<usize>,
    pub overwrite: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct TrackSection {
    pub sigma_l: Option<f32>,
    pub sigma_h: Option<f32>,
    pub sigma_iou: Option<f32>,
    pub t_min: Option<u32>,
    pub t_miss_max: Option<u32>,
    pub merge_threshold_secs: Option<i64>,
    pub keep_discarded: Option<bool>,
    pub overwrite: Option<bool>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceValue {
    Auto,
    Cpu,
    Gpu,
}

impl From<DeviceValue> for Device {
    fn from(v: DeviceValue) -> Self {
        match v {
            DeviceValue::Auto => Device::Auto,
            DeviceValue::Cpu => Device::Cpu,
            DeviceValue::Gpu => Device::Gpu,
        }
    }
}

/// Loads the config file at `path`, or `user_config.otvision.yaml` in the
/// cwd if `path` is `None` and that file exists, or built-in defaults if
/// neither is present. An explicit `path` that doesn't exist is an error;
/// the cwd fallback is silent (spec §6: "if absent, look for
/// `user_config.otvision.yaml` in cwd; else defaults").
pub fn load(path: Option<&Path>) -> Result<FileConfig, Error> {
    let resolved = match path {
        Some(p) => Some(p.to_path_buf()),
        None => {
            let candidate = PathBuf::from(FALLBACK_NAME);
            candidate.exists().then_some(candidate)
        }
    };
    let Some(resolved) = resolved else {
        return Ok(FileConfig::default());
    };
    let text = fs::read_to_string(&resolved).context(format!("reading config file {:?}", resolved))?;
    toml::from_str(&text).map_err(|e| err!(ConfigInvalid, msg("parsing config file {:?}: {e}", resolved)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_path_and_no_fallback_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let prev = std::env::current_dir().unwrap();
        std::env::set_current_dir(dir.path()).unwrap();
        let cfg = load(None).unwrap();
        std::env::set_current_dir(prev).unwrap();
        assert!(cfg.detect.weights.is_none());
    }

    #[test]
    fn explicit_missing_path_is_an_error() {
        let err = load(Some(Path::new("/does/not/exist.toml"))).unwrap_err();
        assert_eq!(err.kind(), base::ErrorKind::IoFailure);
    }

    #[test]
    fn parses_partial_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.toml");
        fs::write(&path, "[detect]\nconf = 0.5\n\n[track]\nt_min = 3\n").unwrap();
        let cfg = load(Some(&path)).unwrap();
        assert_eq!(cfg.detect.conf, Some(0.5));
        assert_eq!(cfg.track.t_min, Some(3));
        assert!(cfg.detect.weights.is_none());
    }
}
