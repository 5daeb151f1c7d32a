use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::ClipLimits;
use crate::error::{GiffyError, GiffyResult};
use crate::format::TargetFormat;

pub const MIN_SPEED: f64 = 0.25;
pub const MAX_SPEED: f64 = 4.0;
pub const MAX_FPS: u32 = 60;
pub const MAX_WIDTH: u32 = 3840;

/// Crop box as fractions of the source frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CropRect {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

impl CropRect {
    pub fn full() -> Self {
        Self { x: 0.0, y: 0.0, w: 1.0, h: 1.0 }
    }

    pub fn is_full(&self) -> bool {
        self.x == 0.0 && self.y == 0.0 && self.w == 1.0 && self.h == 1.0
    }

    pub fn validate(&self) -> GiffyResult<()> {
        let finite = [self.x, self.y, self.w, self.h].iter().all(|v| v.is_finite());
        if !finite || self.x < 0.0 || self.y < 0.0 || self.w <= 0.0 || self.h <= 0.0 {
            return Err(GiffyError::validation("Crop box must lie inside the frame"));
        }
        // A hair of slack for slider rounding.
        if self.x + self.w > 1.0 + 1e-9 || self.y + self.h > 1.0 + 1e-9 {
            return Err(GiffyError::validation("Crop box must lie inside the frame"));
        }
        Ok(())
    }
}

fn default_speed() -> f64 {
    1.0
}

/// One committed set of trim and tool settings for a source clip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionRequest {
    #[serde(rename = "videoBlob", with = "crate::wire::shared_bytes")]
    pub source: Arc<[u8]>,
    pub source_mime: String,
    pub trim_start: f64,
    pub trim_end: f64,
    pub format: TargetFormat,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub fps: Option<u32>,
    #[serde(default = "default_speed")]
    pub speed: f64,
    #[serde(default)]
    pub crop: Option<CropRect>,
}

impl ConversionRequest {
    pub fn new(
        source: impl Into<Arc<[u8]>>,
        source_mime: impl Into<String>,
        trim_start: f64,
        trim_end: f64,
        format: TargetFormat,
    ) -> Self {
        Self {
            source: source.into(),
            source_mime: source_mime.into(),
            trim_start,
            trim_end,
            format,
            width: None,
            fps: None,
            speed: 1.0,
            crop: None,
        }
    }

    pub fn with_width(mut self, width: u32) -> Self {
        self.width = Some(width);
        self
    }

    pub fn with_fps(mut self, fps: u32) -> Self {
        self.fps = Some(fps);
        self
    }

    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = speed;
        self
    }

    pub fn with_crop(mut self, crop: CropRect) -> Self {
        self.crop = Some(crop);
        self
    }

    /// Length of the selected range in source time.
    pub fn clip_duration(&self) -> f64 {
        self.trim_end - self.trim_start
    }

    /// Playable length of the output after the speed factor.
    pub fn output_duration(&self) -> f64 {
        self.clip_duration() / self.speed
    }

    /// Crop that actually changes the frame, if any.
    pub fn effective_crop(&self) -> Option<CropRect> {
        self.crop.filter(|c| !c.is_full())
    }

    pub fn validate(&self, limits: &ClipLimits) -> GiffyResult<()> {
        if self.source.is_empty() {
            return Err(GiffyError::validation("Source file is empty"));
        }
        if self.source.len() as u64 > limits.max_file_bytes {
            return Err(GiffyError::validation(format!(
                "Too big! Max {} MB",
                limits.max_file_bytes / (1024 * 1024)
            )));
        }
        if !self.trim_start.is_finite() || !self.trim_end.is_finite() || self.trim_start < 0.0 {
            return Err(GiffyError::validation("Trim range must start at or after 0s"));
        }
        if self.trim_end <= self.trim_start {
            return Err(GiffyError::validation("Trim end must be after trim start"));
        }
        let clip = self.clip_duration();
        if clip < limits.min_clip_secs {
            return Err(GiffyError::validation(format!(
                "Too short! Min {}s",
                limits.min_clip_secs
            )));
        }
        if clip > limits.max_clip_secs {
            return Err(GiffyError::validation(format!(
                "Too long! Max {}s",
                limits.max_clip_secs
            )));
        }
        if !(MIN_SPEED..=MAX_SPEED).contains(&self.speed) {
            return Err(GiffyError::validation(format!(
                "Speed must be between {MIN_SPEED}x and {MAX_SPEED}x"
            )));
        }
        if let Some(fps) = self.fps {
            if fps == 0 || fps > MAX_FPS {
                return Err(GiffyError::validation(format!(
                    "Frame rate must be between 1 and {MAX_FPS}"
                )));
            }
        }
        if let Some(width) = self.width {
            if width < 2 || width > MAX_WIDTH {
                return Err(GiffyError::validation(format!(
                    "Width must be between 2 and {MAX_WIDTH} pixels"
                )));
            }
        }
        if let Some(crop) = &self.crop {
            crop.validate()?;
        }
        Ok(())
    }
}

/// Default size and frame rate for animated-image output, by clip length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionPreset {
    pub max_width: u32,
    pub fps: u32,
}

impl CompressionPreset {
    pub fn for_duration(duration: f64) -> Self {
        if duration <= 10.0 {
            Self { max_width: 720, fps: 15 }
        } else if duration <= 30.0 {
            Self { max_width: 480, fps: 12 }
        } else {
            Self { max_width: 360, fps: 10 }
        }
    }

    /// Very rough output size, e.g. `~750 KB` or `~4.4 MB`.
    pub fn estimated_size(duration: f64) -> String {
        let preset = Self::for_duration(duration);
        let kb_per_sec = (preset.max_width as f64 / 720.0) * (preset.fps as f64 / 15.0) * 150.0;
        let estimated_kb = (duration * kb_per_sec).round();
        if estimated_kb > 1024.0 {
            format!("~{:.1} MB", estimated_kb / 1024.0)
        } else {
            format!("~{estimated_kb} KB")
        }
    }
}
