//! Clip trimming and conversion orchestration over an ffmpeg-style codec
//! engine: engine preloading, argument construction, single-session job
//! execution with progress and cleanup, a background worker boundary and the
//! editor flow that drives them.

pub mod args;
pub mod artifact;
pub mod config;
pub mod converter;
pub mod editor;
pub mod engine;
pub mod error;
pub mod ffmpeg;
pub mod format;
pub mod preload;
pub mod request;
mod wire;
pub mod worker;

pub use artifact::DownloadArtifact;
pub use config::{ClipLimits, GiffyConfig, ProcessEngineConfig};
pub use converter::{ConversionOutput, JobRunner};
pub use editor::{Editor, EditorState, SourceClip, ToolSettings};
pub use engine::{CodecEngine, DirEntry, EngineError, EngineEvent, LoadStage};
pub use error::{GiffyError, GiffyResult};
pub use ffmpeg::ProcessEngine;
pub use format::TargetFormat;
pub use preload::{EngineSession, LoadState, Preloader};
pub use request::{CompressionPreset, ConversionRequest, CropRect};
pub use worker::{ConversionWorker, ErrorKind, WorkerMessage};
