//! The codec engine seam. The runner only ever talks to an engine through
//! this trait: load it once, then write inputs, run argument vectors, read
//! outputs and delete files in its private filesystem.

use std::future::Future;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("failed to load engine: {0}")]
    Load(String),

    #[error("engine is not loaded")]
    NotLoaded,

    #[error("engine exec failed: {0}")]
    Exec(String),

    #[error("no such file: {0}")]
    NotFound(String),

    #[error("filesystem error: {0}")]
    Fs(String),
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Fs(err.to_string())
    }
}

/// Coarse load milestones. These are synthetic markers, not byte counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LoadStage {
    Started,
    /// The engine's core program is available.
    CoreReady,
    /// The runtime it executes in is available.
    RuntimeReady,
    Initialized,
}

impl LoadStage {
    pub fn percent(self) -> u8 {
        match self {
            LoadStage::Started => 10,
            LoadStage::CoreReady => 40,
            LoadStage::RuntimeReady => 70,
            LoadStage::Initialized => 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Fraction of the current exec, `0.0..=1.0`.
    Progress(f64),
    Log(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
}

pub trait CodecEngine: Send + 'static {
    fn load(
        &mut self,
        on_stage: &mut (dyn FnMut(LoadStage) + Send),
    ) -> impl Future<Output = Result<(), EngineError>> + Send;

    fn exec(
        &mut self,
        argv: &[String],
        on_event: &mut (dyn FnMut(EngineEvent) + Send),
    ) -> impl Future<Output = Result<(), EngineError>> + Send;

    fn write_file(
        &mut self,
        name: &str,
        bytes: &[u8],
    ) -> impl Future<Output = Result<(), EngineError>> + Send;

    fn read_file(&mut self, name: &str) -> impl Future<Output = Result<Vec<u8>, EngineError>> + Send;

    fn delete_file(&mut self, name: &str) -> impl Future<Output = Result<(), EngineError>> + Send;

    /// Entries under `path`, which may include `.` and `..`.
    fn list_dir(&mut self, path: &str)
        -> impl Future<Output = Result<Vec<DirEntry>, EngineError>> + Send;
}
