use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, MutexGuard};

use crate::engine::{CodecEngine, LoadStage};
use crate::error::{GiffyError, GiffyResult};

/// One loaded engine. At most one job may hold the engine at a time; the
/// lock is the only way to reach it.
pub struct EngineSession<E> {
    id: u64,
    engine: Mutex<E>,
}

impl<E: CodecEngine> EngineSession<E> {
    fn new(id: u64, engine: E) -> Self {
        Self {
            id,
            engine: Mutex::new(engine),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Waits until any running job has finished and cleaned up.
    pub async fn acquire(&self) -> MutexGuard<'_, E> {
        self.engine.lock().await
    }

    pub fn try_acquire(&self) -> GiffyResult<MutexGuard<'_, E>> {
        self.engine.try_lock().map_err(|_| GiffyError::Busy)
    }

    pub fn is_busy(&self) -> bool {
        self.engine.try_lock().is_err()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    NotLoaded,
    Loading { attempt: u64, percent: u8 },
    Loaded,
}

impl LoadState {
    pub fn percent(self) -> u8 {
        match self {
            LoadState::NotLoaded => 0,
            LoadState::Loading { percent, .. } => percent,
            LoadState::Loaded => 100,
        }
    }
}

struct Slot<E> {
    session: Option<Arc<EngineSession<E>>>,
    attempt: u64,
    last_error: Option<GiffyError>,
}

type EngineFactory<E> = Box<dyn Fn() -> E + Send + Sync>;

/// Resets the published state to `NotLoaded` if the load future is dropped
/// before it settles.
struct AbandonedLoad<'a> {
    state: &'a watch::Sender<LoadState>,
    attempt: u64,
    armed: bool,
}

impl AbandonedLoad<'_> {
    fn settle(mut self) {
        self.armed = false;
    }
}

impl Drop for AbandonedLoad<'_> {
    fn drop(&mut self) {
        if self.armed {
            tracing::warn!(attempt = self.attempt, "codec engine load abandoned");
            self.state.send_replace(LoadState::NotLoaded);
        }
    }
}

/// Loads the engine at most once per owner and hands out the shared session.
///
/// Concurrent callers queue behind the in-flight load and receive its result;
/// a failed load leaves nothing reachable, so the next call starts over.
pub struct Preloader<E> {
    factory: EngineFactory<E>,
    slot: Mutex<Slot<E>>,
    state: watch::Sender<LoadState>,
    next_session: AtomicU64,
}

impl<E: CodecEngine> Preloader<E> {
    pub fn new(factory: impl Fn() -> E + Send + Sync + 'static) -> Self {
        let (state, _) = watch::channel(LoadState::NotLoaded);
        Self {
            factory: Box::new(factory),
            slot: Mutex::new(Slot {
                session: None,
                attempt: 0,
                last_error: None,
            }),
            state,
            next_session: AtomicU64::new(1),
        }
    }

    pub fn state(&self) -> LoadState {
        *self.state.borrow()
    }

    pub fn is_loaded(&self) -> bool {
        self.state() == LoadState::Loaded
    }

    pub fn is_loading(&self) -> bool {
        matches!(self.state(), LoadState::Loading { .. })
    }

    pub fn load_percent(&self) -> u8 {
        self.state().percent()
    }

    pub fn subscribe(&self) -> watch::Receiver<LoadState> {
        self.state.subscribe()
    }

    pub async fn ensure_loaded(&self) -> GiffyResult<Arc<EngineSession<E>>> {
        let joined = match self.state() {
            LoadState::Loading { attempt, .. } => Some(attempt),
            _ => None,
        };

        let mut slot = self.slot.lock().await;
        if let Some(session) = &slot.session {
            return Ok(session.clone());
        }
        if let (Some(attempt), Some(err)) = (joined, &slot.last_error) {
            if attempt == slot.attempt {
                return Err(err.clone());
            }
        }

        slot.attempt += 1;
        let attempt = slot.attempt;
        slot.last_error = None;
        self.state.send_replace(LoadState::Loading { attempt, percent: 0 });
        tracing::info!(attempt, "loading codec engine");

        let pending = AbandonedLoad {
            state: &self.state,
            attempt,
            armed: true,
        };
        let mut engine = (self.factory)();
        let state = &self.state;
        let mut on_stage = |stage: LoadStage| {
            state.send_modify(|s| {
                if let LoadState::Loading { percent, .. } = s {
                    *percent = (*percent).max(stage.percent());
                }
            });
            tracing::debug!(?stage, percent = stage.percent(), "engine load milestone");
        };

        let loaded = engine.load(&mut on_stage).await;
        pending.settle();

        match loaded {
            Ok(()) => {
                let id = self.next_session.fetch_add(1, Ordering::Relaxed);
                let session = Arc::new(EngineSession::new(id, engine));
                slot.session = Some(session.clone());
                self.state.send_replace(LoadState::Loaded);
                tracing::info!(session = id, "codec engine loaded");
                Ok(session)
            }
            Err(e) => {
                let err = GiffyError::initialization(e.to_string());
                slot.last_error = Some(err.clone());
                self.state.send_replace(LoadState::NotLoaded);
                tracing::error!(attempt, error = %e, "codec engine failed to load");
                Err(err)
            }
        }
    }

    /// Like `ensure_loaded`, forwarding load milestones to `on_progress`.
    /// Values never decrease, and 100 is reported only on success.
    pub async fn ensure_loaded_with_progress(
        &self,
        mut on_progress: impl FnMut(u8),
    ) -> GiffyResult<Arc<EngineSession<E>>> {
        let mut rx = self.state.subscribe();
        let mut last = 0u8;

        let load = self.ensure_loaded();
        tokio::pin!(load);

        loop {
            tokio::select! {
                biased;
                result = &mut load => {
                    if result.is_ok() && last < 100 {
                        on_progress(100);
                    }
                    return result;
                }
                Ok(()) = rx.changed() => {
                    let percent = rx.borrow_and_update().percent();
                    if percent > last && percent < 100 {
                        last = percent;
                        on_progress(percent);
                    }
                }
            }
        }
    }

    /// Session if one is loaded and no load is holding the slot.
    pub fn current(&self) -> Option<Arc<EngineSession<E>>> {
        self.slot.try_lock().ok().and_then(|slot| slot.session.clone())
    }

    /// Drop the current session. Jobs still holding it keep their reference
    /// until they end; new callers get a freshly loaded engine.
    pub async fn discard(&self) {
        let mut slot = self.slot.lock().await;
        if let Some(session) = slot.session.take() {
            tracing::warn!(session = session.id(), "discarding codec engine session");
        }
        slot.last_error = None;
        self.state.send_replace(LoadState::NotLoaded);
    }
}
