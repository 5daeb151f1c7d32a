use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{GiffyError, GiffyResult};

pub const MAX_FILE_BYTES: u64 = 100 * 1024 * 1024;
pub const MIN_CLIP_SECS: f64 = 0.1;
pub const DESKTOP_MAX_CLIP_SECS: f64 = 60.0;
pub const MOBILE_MAX_CLIP_SECS: f64 = 30.0;
pub const DEFAULT_JOB_TIMEOUT_SECS: u64 = 5 * 60;

/// Product-level bounds on what the editor accepts and the runner converts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClipLimits {
    pub max_clip_secs: f64,
    pub min_clip_secs: f64,
    pub max_file_bytes: u64,
    pub accepted_mime: Vec<String>,
}

impl Default for ClipLimits {
    fn default() -> Self {
        Self {
            max_clip_secs: DESKTOP_MAX_CLIP_SECS,
            min_clip_secs: MIN_CLIP_SECS,
            max_file_bytes: MAX_FILE_BYTES,
            accepted_mime: vec![
                "video/mp4".to_string(),
                "video/quicktime".to_string(),
                "video/webm".to_string(),
            ],
        }
    }
}

impl ClipLimits {
    pub fn mobile() -> Self {
        Self {
            max_clip_secs: MOBILE_MAX_CLIP_SECS,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> GiffyResult<()> {
        if !(self.min_clip_secs > 0.0) {
            return Err(GiffyError::Config("min_clip_secs must be positive".into()));
        }
        if !(self.max_clip_secs > self.min_clip_secs) {
            return Err(GiffyError::Config(
                "max_clip_secs must exceed min_clip_secs".into(),
            ));
        }
        if self.max_file_bytes == 0 {
            return Err(GiffyError::Config("max_file_bytes must be non-zero".into()));
        }
        Ok(())
    }
}

/// Where the native engine finds its binaries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessEngineConfig {
    /// Explicit ffmpeg binary; lookup falls back to `ffmpeg/` next to the
    /// executable, then `PATH`.
    pub ffmpeg_path: Option<PathBuf>,
    pub ffprobe_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GiffyConfig {
    pub limits: ClipLimits,
    pub job_timeout_secs: u64,
    pub engine: ProcessEngineConfig,
}

impl Default for GiffyConfig {
    fn default() -> Self {
        Self::desktop()
    }
}

impl GiffyConfig {
    pub fn desktop() -> Self {
        Self {
            limits: ClipLimits::default(),
            job_timeout_secs: DEFAULT_JOB_TIMEOUT_SECS,
            engine: ProcessEngineConfig::default(),
        }
    }

    pub fn mobile() -> Self {
        Self {
            limits: ClipLimits::mobile(),
            ..Self::desktop()
        }
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn from_json_str(json: &str) -> GiffyResult<Self> {
        let config: GiffyConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> GiffyResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            GiffyError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> GiffyResult<()> {
        self.limits.validate()?;
        if self.job_timeout_secs == 0 {
            return Err(GiffyError::Config("job_timeout_secs must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_differ_only_in_clip_length() {
        let desktop = GiffyConfig::desktop();
        let mobile = GiffyConfig::mobile();
        assert_eq!(desktop.limits.max_clip_secs, 60.0);
        assert_eq!(mobile.limits.max_clip_secs, 30.0);
        assert_eq!(desktop.limits.min_clip_secs, mobile.limits.min_clip_secs);
        assert_eq!(desktop.job_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn missing_fields_take_defaults() {
        let config = GiffyConfig::from_json_str(r#"{"limits":{"max_clip_secs":15}}"#).unwrap();
        assert_eq!(config.limits.max_clip_secs, 15.0);
        assert_eq!(config.limits.max_file_bytes, MAX_FILE_BYTES);
        assert_eq!(config.job_timeout_secs, DEFAULT_JOB_TIMEOUT_SECS);
        assert!(config.engine.ffmpeg_path.is_none());
    }

    #[test]
    fn rejects_inverted_clip_bounds() {
        let err = GiffyConfig::from_json_str(
            r#"{"limits":{"max_clip_secs":0.05,"min_clip_secs":0.1}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, GiffyError::Config(_)));
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        let err = GiffyConfig::from_json_str("{").unwrap_err();
        assert!(matches!(err, GiffyError::Config(_)));
    }

    #[test]
    fn load_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("giffy.json");
        std::fs::write(&path, r#"{"job_timeout_secs":10}"#).unwrap();
        let config = GiffyConfig::load(&path).unwrap();
        assert_eq!(config.job_timeout(), Duration::from_secs(10));
    }
}
