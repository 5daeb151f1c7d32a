use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

use crate::args::{build_plan, JobPlan, PassKind};
use crate::config::{ClipLimits, GiffyConfig};
use crate::engine::{CodecEngine, EngineError, EngineEvent};
use crate::error::{GiffyError, GiffyResult};
use crate::format::TargetFormat;
use crate::preload::Preloader;
use crate::request::ConversionRequest;

/// Bytes produced by a successful job.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversionOutput {
    pub bytes: Vec<u8>,
    pub format: TargetFormat,
}

impl ConversionOutput {
    pub fn mime(&self) -> &'static str {
        self.format.mime()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Idle,
    WritingInput,
    ExecutingPalette,
    Executing,
    ReadingOutput,
    Failed,
    Cleanup,
    Done,
}

impl JobPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            JobPhase::Idle => "idle",
            JobPhase::WritingInput => "writing-input",
            JobPhase::ExecutingPalette => "executing-pass-1",
            JobPhase::Executing => "executing",
            JobPhase::ReadingOutput => "reading-output",
            JobPhase::Failed => "failed",
            JobPhase::Cleanup => "cleanup",
            JobPhase::Done => "done",
        }
    }
}

fn enter(phase: JobPhase) {
    tracing::debug!(phase = phase.as_str(), "job phase");
}

/// Forwards engine progress as whole percentages.
///
/// A single-pass job relays the engine's numbers as they are. Multi-pass
/// jobs give each pass an equal slice of the range, and anything lower than
/// what was already sent is dropped. Engine numbers stop at 99; only
/// `finish` reports 100, once the output has been read back.
struct ProgressRelay<'a> {
    sink: &'a mut (dyn FnMut(u8) + Send),
    last: Option<u8>,
    base: f64,
    span: f64,
}

impl<'a> ProgressRelay<'a> {
    fn new(sink: &'a mut (dyn FnMut(u8) + Send)) -> Self {
        Self {
            sink,
            last: None,
            base: 0.0,
            span: 100.0,
        }
    }

    fn enter_pass(&mut self, index: usize, count: usize) {
        let count = count.max(1) as f64;
        self.span = 100.0 / count;
        self.base = index as f64 * self.span;
    }

    fn engine_fraction(&mut self, fraction: f64) {
        if !fraction.is_finite() {
            return;
        }
        let percent = (self.base + fraction.clamp(0.0, 1.0) * self.span).round() as u8;
        self.emit(percent.min(99));
    }

    fn emit(&mut self, percent: u8) {
        if self.last.is_some_and(|last| percent <= last) {
            return;
        }
        self.last = Some(percent);
        (self.sink)(percent);
    }

    fn finish(&mut self) {
        self.emit(100);
    }
}

/// Runs conversion jobs against the session owned by its preloader.
pub struct JobRunner<E> {
    preloader: Arc<Preloader<E>>,
    limits: ClipLimits,
    timeout: Duration,
    next_job: AtomicU64,
}

impl<E: CodecEngine> JobRunner<E> {
    pub fn new(preloader: Arc<Preloader<E>>, config: &GiffyConfig) -> Self {
        Self {
            preloader,
            limits: config.limits.clone(),
            timeout: config.job_timeout(),
            next_job: AtomicU64::new(1),
        }
    }

    pub fn preloader(&self) -> &Arc<Preloader<E>> {
        &self.preloader
    }

    pub fn limits(&self) -> &ClipLimits {
        &self.limits
    }

    /// Run one job, waiting for any job already on the session to finish.
    pub async fn run_job(
        &self,
        request: ConversionRequest,
        mut on_progress: impl FnMut(u8) + Send,
    ) -> GiffyResult<ConversionOutput> {
        request.validate(&self.limits)?;
        let session = self.preloader.ensure_loaded().await?;
        let mut engine = session.acquire().await;
        self.run_locked(session.id(), &mut *engine, &request, &mut on_progress)
            .await
    }

    /// Run one job, or fail with `Busy` if the session is already converting.
    pub async fn try_run_job(
        &self,
        request: ConversionRequest,
        mut on_progress: impl FnMut(u8) + Send,
    ) -> GiffyResult<ConversionOutput> {
        request.validate(&self.limits)?;
        let session = self.preloader.ensure_loaded().await?;
        let mut engine = session.try_acquire()?;
        self.run_locked(session.id(), &mut *engine, &request, &mut on_progress)
            .await
    }

    /// `run_job` bounded by the configured timeout. On expiry the session is
    /// discarded rather than interrupted; the next job loads a fresh engine.
    pub async fn run_job_with_timeout(
        &self,
        request: ConversionRequest,
        on_progress: impl FnMut(u8) + Send,
    ) -> GiffyResult<ConversionOutput> {
        match tokio::time::timeout(self.timeout, self.run_job(request, on_progress)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.timeout.as_millis() as u64,
                    "conversion timed out, discarding engine session"
                );
                self.preloader.discard().await;
                Err(GiffyError::timeout(self.timeout))
            }
        }
    }

    async fn run_locked(
        &self,
        session: u64,
        engine: &mut E,
        request: &ConversionRequest,
        on_progress: &mut (dyn FnMut(u8) + Send),
    ) -> GiffyResult<ConversionOutput> {
        let job = self.next_job.fetch_add(1, Ordering::Relaxed);
        let plan = build_plan(request);
        let span = tracing::info_span!("job", job, session, format = %plan.format);

        async move {
            enter(JobPhase::Idle);
            tracing::info!(
                trim_start = request.trim_start,
                trim_end = request.trim_end,
                passes = plan.passes.len(),
                "starting conversion"
            );

            let mut relay = ProgressRelay::new(on_progress);
            let outcome = execute(engine, &plan, request, &mut relay).await;
            if let Err(err) = &outcome {
                enter(JobPhase::Failed);
                tracing::warn!(error = %err, "conversion failed");
            }

            enter(JobPhase::Cleanup);
            let removed = cleanup(engine, &plan).await;
            enter(JobPhase::Done);

            if let Ok(output) = &outcome {
                tracing::info!(bytes = output.len(), removed, "conversion complete");
            }
            outcome
        }
        .instrument(span)
        .await
    }
}

async fn execute<E: CodecEngine>(
    engine: &mut E,
    plan: &JobPlan,
    request: &ConversionRequest,
    relay: &mut ProgressRelay<'_>,
) -> GiffyResult<ConversionOutput> {
    enter(JobPhase::WritingInput);
    engine
        .write_file(&plan.input, &request.source)
        .await
        .map_err(|e| engine_failure("writing input", e))?;

    let count = plan.passes.len();
    for (index, pass) in plan.passes.iter().enumerate() {
        enter(match pass.kind {
            PassKind::Palette => JobPhase::ExecutingPalette,
            PassKind::Encode => JobPhase::Executing,
        });
        relay.enter_pass(index, count);
        tracing::debug!(pass = pass.kind.as_str(), argv = ?pass.argv, "running engine");

        let mut on_event = |event: EngineEvent| match event {
            EngineEvent::Progress(fraction) => relay.engine_fraction(fraction),
            EngineEvent::Log(line) => tracing::debug!(target: "giffy::engine", "{line}"),
        };
        engine
            .exec(&pass.argv, &mut on_event)
            .await
            .map_err(|e| engine_failure(pass.kind.as_str(), e))?;
    }

    enter(JobPhase::ReadingOutput);
    let bytes = match engine.read_file(&plan.output).await {
        Ok(bytes) => bytes,
        Err(EngineError::NotFound(_)) => {
            return Err(GiffyError::conversion("the engine produced no output file"))
        }
        Err(e) => return Err(engine_failure("reading output", e)),
    };
    if bytes.is_empty() {
        return Err(GiffyError::conversion("the engine produced an empty output file"));
    }

    relay.finish();
    Ok(ConversionOutput {
        bytes,
        format: plan.format,
    })
}

fn engine_failure(step: &str, err: EngineError) -> GiffyError {
    match err {
        EngineError::Load(msg) => GiffyError::initialization(msg),
        EngineError::NotLoaded => GiffyError::initialization("engine is not loaded"),
        other => GiffyError::conversion(format!("{step}: {other}")),
    }
}

/// Delete the job's files and anything else left in the session root.
/// Never fails; problems are logged and the remaining files still go.
async fn cleanup<E: CodecEngine>(engine: &mut E, plan: &JobPlan) -> usize {
    let mut removed = 0;

    for name in plan.files() {
        match engine.delete_file(name).await {
            Ok(()) => removed += 1,
            Err(EngineError::NotFound(_)) => {}
            Err(e) => tracing::warn!(file = name, error = %e, "failed to delete virtual file"),
        }
    }

    match engine.list_dir("/").await {
        Ok(entries) => {
            for entry in entries {
                if entry.is_dir || entry.name == "." || entry.name == ".." {
                    continue;
                }
                match engine.delete_file(&entry.name).await {
                    Ok(()) => removed += 1,
                    Err(e) => {
                        tracing::warn!(file = %entry.name, error = %e, "failed to delete leftover file")
                    }
                }
            }
        }
        Err(e) => tracing::warn!(error = %e, "failed to list virtual filesystem"),
    }

    removed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relay_run(passes: usize, fractions: &[(usize, f64)]) -> Vec<u8> {
        let mut seen = Vec::new();
        let mut sink = |p: u8| seen.push(p);
        {
            let mut relay = ProgressRelay::new(&mut sink);
            for &(pass, fraction) in fractions {
                relay.enter_pass(pass, passes);
                relay.engine_fraction(fraction);
            }
            relay.finish();
        }
        seen
    }

    #[test]
    fn single_pass_relays_engine_values() {
        let seen = relay_run(1, &[(0, 0.0), (0, 0.134), (0, 0.5), (0, 0.9)]);
        assert_eq!(seen, vec![0, 13, 50, 90, 100]);
    }

    #[test]
    fn two_passes_split_the_range() {
        let seen = relay_run(2, &[(0, 0.5), (0, 1.0), (1, 0.0), (1, 0.5), (1, 1.0)]);
        assert_eq!(seen, vec![25, 50, 75, 99, 100]);
    }

    #[test]
    fn regressions_and_garbage_are_dropped() {
        let seen = relay_run(1, &[(0, 0.6), (0, 0.3), (0, f64::NAN), (0, 7.0)]);
        assert_eq!(seen, vec![60, 99, 100]);
    }

    #[test]
    fn engine_completion_stops_short_of_100() {
        let mut seen = Vec::new();
        let mut sink = |p: u8| seen.push(p);
        let mut relay = ProgressRelay::new(&mut sink);
        relay.enter_pass(0, 1);
        relay.engine_fraction(1.0);
        drop(relay);
        assert_eq!(seen, vec![99]);
    }

    #[test]
    fn load_errors_map_to_initialization_failures() {
        let err = engine_failure("palette", EngineError::Load("bad wasm".into()));
        assert_eq!(err, GiffyError::InitializationFailed("bad wasm".into()));
        let err = engine_failure("encode", EngineError::Exec("Out of memory".into()));
        assert!(matches!(err, GiffyError::ConversionFailed(msg) if msg.contains("Out of memory")));
    }

    #[test]
    fn phases_have_stable_names() {
        assert_eq!(JobPhase::ExecutingPalette.as_str(), "executing-pass-1");
        assert_eq!(JobPhase::Cleanup.as_str(), "cleanup");
    }
}
