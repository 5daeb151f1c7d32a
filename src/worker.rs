//! Background conversion context. A worker owns its own preloader, session
//! and runner; callers talk to it only through messages. Terminating the
//! worker is the only way to stop a job midway.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::GiffyConfig;
use crate::converter::{ConversionOutput, JobRunner};
use crate::engine::CodecEngine;
use crate::error::{GiffyError, GiffyResult};
use crate::format::TargetFormat;
use crate::preload::Preloader;
use crate::request::ConversionRequest;

/// Outbound protocol: any number of `progress`, then exactly one `complete`
/// or `error` per job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WorkerMessage {
    Progress {
        progress: u8,
    },
    Complete {
        #[serde(rename = "outputBlob", with = "crate::wire::owned_bytes")]
        output: Vec<u8>,
        mime: String,
        format: TargetFormat,
    },
    Error {
        error: String,
        #[serde(default)]
        kind: ErrorKind,
    },
}

/// Which side of the job an `error` message came from, so the caller can
/// rebuild the matching `GiffyError`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Initialization,
    Validation,
    #[default]
    Conversion,
}

impl ErrorKind {
    fn of(err: &GiffyError) -> Self {
        match err {
            GiffyError::InitializationFailed(_) => ErrorKind::Initialization,
            GiffyError::ValidationFailed(_) => ErrorKind::Validation,
            _ => ErrorKind::Conversion,
        }
    }

    fn into_error(self, detail: String) -> GiffyError {
        match self {
            ErrorKind::Initialization => GiffyError::InitializationFailed(detail),
            ErrorKind::Validation => GiffyError::ValidationFailed(detail),
            ErrorKind::Conversion => GiffyError::ConversionFailed(detail),
        }
    }
}

impl WorkerMessage {
    fn complete(output: ConversionOutput) -> Self {
        WorkerMessage::Complete {
            mime: output.mime().to_string(),
            format: output.format,
            output: output.bytes,
        }
    }

    fn failure(err: &GiffyError) -> Self {
        WorkerMessage::Error {
            error: err.detail(),
            kind: ErrorKind::of(err),
        }
    }

    fn crashed(error: &str) -> Self {
        WorkerMessage::Error {
            error: error.to_string(),
            kind: ErrorKind::Conversion,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkerMessage::Progress { .. })
    }
}

struct WorkerJob {
    request: ConversionRequest,
    reply: mpsc::UnboundedSender<WorkerMessage>,
}

/// Aborts the wrapped task when dropped, so terminating the worker loop
/// also stops the job it is waiting on.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

type SharedFactory<E> = Arc<dyn Fn() -> E + Send + Sync>;

pub struct ConversionWorker<E: CodecEngine> {
    factory: SharedFactory<E>,
    config: GiffyConfig,
    jobs: mpsc::UnboundedSender<WorkerJob>,
    task: JoinHandle<()>,
    generation: u64,
}

impl<E: CodecEngine> ConversionWorker<E> {
    /// Start a worker on the current tokio runtime.
    pub fn spawn(factory: impl Fn() -> E + Send + Sync + 'static, config: GiffyConfig) -> Self {
        let factory: SharedFactory<E> = Arc::new(factory);
        let (jobs, task) = start(factory.clone(), &config, 1);
        Self {
            factory,
            config,
            jobs,
            task,
            generation: 1,
        }
    }

    /// Incremented every time the execution context is replaced.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Queue a job. Invalid requests are rejected here and never reach the worker.
    pub fn submit(
        &self,
        request: ConversionRequest,
    ) -> GiffyResult<mpsc::UnboundedReceiver<WorkerMessage>> {
        request.validate(&self.config.limits)?;
        let (reply, messages) = mpsc::unbounded_channel();
        self.jobs
            .send(WorkerJob { request, reply })
            .map_err(|_| GiffyError::conversion("the conversion worker has stopped"))?;
        Ok(messages)
    }

    /// Submit a job and wait for its outcome, relaying progress. If the
    /// configured timeout passes first, the worker is discarded and replaced.
    pub async fn convert(
        &mut self,
        request: ConversionRequest,
        on_progress: impl FnMut(u8),
    ) -> GiffyResult<ConversionOutput> {
        let timeout = self.config.job_timeout();
        self.convert_with_timeout(request, timeout, on_progress).await
    }

    pub async fn convert_with_timeout(
        &mut self,
        request: ConversionRequest,
        timeout: Duration,
        mut on_progress: impl FnMut(u8),
    ) -> GiffyResult<ConversionOutput> {
        let mut messages = self.submit(request)?;

        let wait = async {
            while let Some(message) = messages.recv().await {
                match message {
                    WorkerMessage::Progress { progress } => on_progress(progress),
                    WorkerMessage::Complete { output, format, .. } => {
                        return Ok(ConversionOutput { bytes: output, format })
                    }
                    WorkerMessage::Error { error, kind } => return Err(kind.into_error(error)),
                }
            }
            Err(GiffyError::conversion(
                "the conversion worker stopped without a result",
            ))
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    generation = self.generation,
                    "conversion timed out, terminating worker"
                );
                self.restart();
                Err(GiffyError::timeout(timeout))
            }
        }
    }

    /// Discard the execution context. Any running job is dropped mid-flight
    /// and its callers see the channel close.
    pub fn terminate(&mut self) {
        self.task.abort();
    }

    /// Terminate and start a fresh context with its own engine session.
    pub fn restart(&mut self) {
        self.terminate();
        self.generation += 1;
        let (jobs, task) = start(self.factory.clone(), &self.config, self.generation);
        self.jobs = jobs;
        self.task = task;
    }
}

impl<E: CodecEngine> Drop for ConversionWorker<E> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn start<E: CodecEngine>(
    factory: SharedFactory<E>,
    config: &GiffyConfig,
    generation: u64,
) -> (mpsc::UnboundedSender<WorkerJob>, JoinHandle<()>) {
    let preloader = Arc::new(Preloader::new(move || factory()));
    let runner = Arc::new(JobRunner::new(preloader, config));
    let (jobs, inbox) = mpsc::unbounded_channel();
    let task = tokio::spawn(worker_loop(runner, inbox, generation));
    (jobs, task)
}

async fn worker_loop<E: CodecEngine>(
    runner: Arc<JobRunner<E>>,
    mut inbox: mpsc::UnboundedReceiver<WorkerJob>,
    generation: u64,
) {
    tracing::debug!(generation, "conversion worker started");

    while let Some(WorkerJob { request, reply }) = inbox.recv().await {
        let progress_tx = reply.clone();
        let job_runner = runner.clone();
        let mut job = AbortOnDrop(tokio::spawn(async move {
            job_runner
                .run_job(request, move |progress| {
                    let _ = progress_tx.send(WorkerMessage::Progress { progress });
                })
                .await
        }));

        let message = match (&mut job.0).await {
            Ok(Ok(output)) => WorkerMessage::complete(output),
            Ok(Err(err)) => WorkerMessage::failure(&err),
            Err(join) if join.is_panic() => {
                tracing::error!(generation, "conversion task panicked");
                WorkerMessage::crashed("the conversion crashed unexpectedly")
            }
            Err(_) => WorkerMessage::crashed("the conversion was cancelled"),
        };
        let _ = reply.send(message);
    }

    tracing::debug!(generation, "conversion worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_are_tagged_by_type() {
        let progress = serde_json::to_value(WorkerMessage::Progress { progress: 42 }).unwrap();
        assert_eq!(progress, serde_json::json!({"type": "progress", "progress": 42}));

        let error = serde_json::to_value(WorkerMessage::crashed("boom")).unwrap();
        assert_eq!(
            error,
            serde_json::json!({"type": "error", "error": "boom", "kind": "conversion"})
        );
    }

    #[test]
    fn error_kind_survives_the_boundary() {
        let message = WorkerMessage::failure(&GiffyError::initialization("core fetch failed"));
        let json = serde_json::to_string(&message).unwrap();
        let back: WorkerMessage = serde_json::from_str(&json).unwrap();
        match back {
            WorkerMessage::Error { error, kind } => {
                assert_eq!(kind, ErrorKind::Initialization);
                assert_eq!(
                    kind.into_error(error),
                    GiffyError::InitializationFailed("core fetch failed".into())
                );
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn untagged_errors_read_as_conversion_failures() {
        let back: WorkerMessage =
            serde_json::from_str(r#"{"type":"error","error":"Out of memory"}"#).unwrap();
        assert_eq!(
            back,
            WorkerMessage::Error {
                error: "Out of memory".into(),
                kind: ErrorKind::Conversion
            }
        );
    }

    #[test]
    fn complete_carries_base64_output_and_mime() {
        let message = WorkerMessage::complete(ConversionOutput {
            bytes: b"GIF89a".to_vec(),
            format: TargetFormat::Gif,
        });
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "complete");
        assert_eq!(json["outputBlob"], "R0lGODlh");
        assert!(json.get("output").is_none());
        assert_eq!(json["mime"], "image/gif");
        assert_eq!(json["format"], "gif");

        let back: WorkerMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, message);
        assert!(back.is_terminal());
    }

    #[test]
    fn progress_is_not_terminal() {
        assert!(!WorkerMessage::Progress { progress: 100 }.is_terminal());
    }
}
