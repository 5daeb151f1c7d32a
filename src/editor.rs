use std::sync::Arc;

use crate::artifact::DownloadArtifact;
use crate::config::ClipLimits;
use crate::converter::ConversionOutput;
use crate::error::{GiffyError, GiffyResult};
use crate::format::TargetFormat;
use crate::request::{ConversionRequest, CropRect};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditorState {
    Loading,
    Empty,
    Editing,
    Converting,
    Complete,
}

impl EditorState {
    pub fn as_str(self) -> &'static str {
        match self {
            EditorState::Loading => "loading",
            EditorState::Empty => "empty",
            EditorState::Editing => "editing",
            EditorState::Converting => "converting",
            EditorState::Complete => "complete",
        }
    }
}

/// A picked file and what the player reported about it.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceClip {
    pub bytes: Arc<[u8]>,
    pub mime: String,
    pub duration: f64,
}

impl SourceClip {
    pub fn new(bytes: impl Into<Arc<[u8]>>, mime: impl Into<String>, duration: f64) -> Self {
        Self {
            bytes: bytes.into(),
            mime: mime.into(),
            duration,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolSettings {
    pub format: TargetFormat,
    pub width: Option<u32>,
    pub fps: Option<u32>,
    pub speed: f64,
    pub crop: Option<CropRect>,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            format: TargetFormat::Gif,
            width: None,
            fps: None,
            speed: 1.0,
            crop: None,
        }
    }
}

/// UI-facing flow: loading → empty → editing → converting → complete.
///
/// The editor never calls the engine itself. `begin_conversion` hands out a
/// request and refuses to hand out another until `finish` or `cancel`.
#[derive(Debug)]
pub struct Editor {
    state: EditorState,
    limits: ClipLimits,
    source: Option<SourceClip>,
    trim_start: f64,
    trim_end: f64,
    tools: ToolSettings,
    load_percent: u8,
    progress: u8,
    artifact: Option<DownloadArtifact>,
    error: Option<String>,
}

impl Editor {
    pub fn new(limits: ClipLimits) -> Self {
        Self {
            state: EditorState::Loading,
            limits,
            source: None,
            trim_start: 0.0,
            trim_end: 0.0,
            tools: ToolSettings::default(),
            load_percent: 0,
            progress: 0,
            artifact: None,
            error: None,
        }
    }

    pub fn state(&self) -> EditorState {
        self.state
    }

    pub fn limits(&self) -> &ClipLimits {
        &self.limits
    }

    pub fn source(&self) -> Option<&SourceClip> {
        self.source.as_ref()
    }

    pub fn trim(&self) -> (f64, f64) {
        (self.trim_start, self.trim_end)
    }

    pub fn tools(&self) -> &ToolSettings {
        &self.tools
    }

    pub fn load_percent(&self) -> u8 {
        self.load_percent
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    pub fn artifact(&self) -> Option<&DownloadArtifact> {
        self.artifact.as_ref()
    }

    pub fn artifact_mut(&mut self) -> Option<&mut DownloadArtifact> {
        self.artifact.as_mut()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn clip_duration(&self) -> f64 {
        self.trim_end - self.trim_start
    }

    fn require(&self, expected: &[EditorState], action: &'static str) -> GiffyResult<()> {
        if expected.contains(&self.state) {
            Ok(())
        } else {
            Err(GiffyError::InvalidTransition {
                state: self.state.as_str(),
                action,
            })
        }
    }

    fn transition(&mut self, next: EditorState) {
        tracing::debug!(from = self.state.as_str(), to = next.as_str(), "editor transition");
        self.state = next;
    }

    pub fn engine_progress(&mut self, percent: u8) {
        if self.state == EditorState::Loading {
            self.load_percent = self.load_percent.max(percent.min(100));
        }
    }

    pub fn engine_ready(&mut self) -> GiffyResult<()> {
        self.require(&[EditorState::Loading], "finish loading")?;
        self.load_percent = 100;
        self.error = None;
        self.transition(EditorState::Empty);
        Ok(())
    }

    /// Stays in `Loading` so the caller can retry.
    pub fn engine_failed(&mut self, err: &GiffyError) {
        if self.state == EditorState::Loading {
            self.load_percent = 0;
            self.error = Some(err.user_message());
        }
    }

    /// Accept a new source and reset the trim range to its start.
    pub fn select_file(&mut self, source: SourceClip) -> GiffyResult<()> {
        self.require(&[EditorState::Empty, EditorState::Editing], "select a file")?;

        if source.bytes.is_empty() {
            return Err(GiffyError::validation("Could not read file!"));
        }
        if source.bytes.len() as u64 > self.limits.max_file_bytes {
            return Err(GiffyError::validation(format!(
                "Too big! Max {} MB",
                self.limits.max_file_bytes / (1024 * 1024)
            )));
        }
        if !self.limits.accepted_mime.iter().any(|m| *m == source.mime) {
            return Err(GiffyError::validation("Wrong format! Use MP4, MOV, or WEBM"));
        }
        if !source.duration.is_finite() || source.duration <= 0.0 {
            return Err(GiffyError::validation("Could not read the video duration"));
        }

        self.trim_start = 0.0;
        self.trim_end = source.duration.min(self.limits.max_clip_secs);
        self.source = Some(source);
        self.progress = 0;
        self.error = None;
        self.transition(EditorState::Editing);
        Ok(())
    }

    fn source_duration(&self) -> f64 {
        self.source.as_ref().map(|s| s.duration).unwrap_or(0.0)
    }

    /// Move the start handle. The value is clamped to the source and must
    /// stay before the end handle; otherwise the edit is ignored.
    pub fn set_trim_start(&mut self, seconds: f64) -> GiffyResult<f64> {
        self.require(&[EditorState::Editing], "trim")?;
        if seconds.is_finite() {
            let clamped = seconds.clamp(0.0, self.source_duration());
            if clamped < self.trim_end {
                self.trim_start = clamped;
            }
        }
        Ok(self.trim_start)
    }

    pub fn set_trim_end(&mut self, seconds: f64) -> GiffyResult<f64> {
        self.require(&[EditorState::Editing], "trim")?;
        if seconds.is_finite() {
            let clamped = seconds.clamp(0.0, self.source_duration());
            if clamped > self.trim_start {
                self.trim_end = clamped;
            }
        }
        Ok(self.trim_end)
    }

    pub fn set_tools(&mut self, tools: ToolSettings) -> GiffyResult<()> {
        self.require(&[EditorState::Editing], "change tool settings")?;
        self.tools = tools;
        Ok(())
    }

    /// Whether the current clip length is inside the configured bounds.
    pub fn check_clip(&self) -> GiffyResult<()> {
        let clip = self.clip_duration();
        if clip > self.limits.max_clip_secs {
            return Err(GiffyError::validation(format!(
                "Too long! Max {}s",
                self.limits.max_clip_secs
            )));
        }
        if clip < self.limits.min_clip_secs {
            return Err(GiffyError::validation(format!(
                "Too short! Min {}s",
                self.limits.min_clip_secs
            )));
        }
        Ok(())
    }

    pub fn can_convert(&self) -> bool {
        self.state == EditorState::Editing && self.check_clip().is_ok()
    }

    /// Commit the current settings and enter `Converting`.
    pub fn begin_conversion(&mut self) -> GiffyResult<ConversionRequest> {
        self.require(&[EditorState::Editing], "start a conversion")?;
        self.check_clip()?;
        let source = self
            .source
            .as_ref()
            .ok_or_else(|| GiffyError::validation("No file selected"))?;

        let request = ConversionRequest {
            source: source.bytes.clone(),
            source_mime: source.mime.clone(),
            trim_start: self.trim_start,
            trim_end: self.trim_end,
            format: self.tools.format,
            width: self.tools.width,
            fps: self.tools.fps,
            speed: self.tools.speed,
            crop: self.tools.crop,
        };
        request.validate(&self.limits)?;

        self.progress = 0;
        self.error = None;
        self.transition(EditorState::Converting);
        Ok(request)
    }

    pub fn report_progress(&mut self, percent: u8) {
        if self.state == EditorState::Converting {
            self.progress = self.progress.max(percent.min(100));
        }
    }

    /// Apply a job outcome. Failures return to `Editing` with trim and tool
    /// settings untouched.
    pub fn finish(&mut self, result: GiffyResult<ConversionOutput>) -> GiffyResult<()> {
        self.require(&[EditorState::Converting], "finish a conversion")?;
        match result {
            Ok(output) => {
                self.artifact = Some(DownloadArtifact::new(output));
                self.progress = 100;
                self.transition(EditorState::Complete);
            }
            Err(err) => {
                tracing::warn!(error = %err, "conversion did not complete");
                self.error = Some(err.user_message());
                self.progress = 0;
                self.transition(EditorState::Editing);
            }
        }
        Ok(())
    }

    /// Give up on the running job; the caller discards its worker.
    pub fn cancel(&mut self) -> GiffyResult<()> {
        self.require(&[EditorState::Converting], "cancel")?;
        self.progress = 0;
        self.transition(EditorState::Editing);
        Ok(())
    }

    /// Leave the trim screen without converting.
    pub fn back(&mut self) -> GiffyResult<()> {
        self.require(&[EditorState::Editing], "go back")?;
        self.clear_project();
        self.transition(EditorState::Empty);
        Ok(())
    }

    /// Start over, releasing the previous output.
    pub fn new_project(&mut self) -> GiffyResult<()> {
        self.require(&[EditorState::Complete, EditorState::Editing], "start a new project")?;
        self.clear_project();
        self.transition(EditorState::Empty);
        Ok(())
    }

    fn clear_project(&mut self) {
        if let Some(mut artifact) = self.artifact.take() {
            artifact.release();
        }
        self.source = None;
        self.trim_start = 0.0;
        self.trim_end = 0.0;
        self.tools = ToolSettings::default();
        self.progress = 0;
        self.error = None;
    }

    /// Rough seconds left while converting: the whole job is assumed to take
    /// twice the clip length, and never less than five seconds.
    pub fn estimated_remaining_secs(&self) -> u64 {
        let total = (self.clip_duration() * 2.0).ceil().max(5.0) as u64;
        let elapsed = ((self.progress as f64 / 100.0) * total as f64).ceil() as u64;
        total.saturating_sub(elapsed)
    }
}
