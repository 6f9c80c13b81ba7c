use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use folio_contracts::{ProcessingState, Scene, Stage};

use crate::error::{PipelineError, PipelineResult};
use crate::pacing::CancelToken;

pub type BoardListener = Arc<dyn Fn(&ProcessingState, &[Scene]) + Send + Sync>;

/// Proof that a run was admitted. Writes carrying an outdated ticket are
/// dropped.
#[derive(Debug, Clone)]
pub struct RunTicket {
    generation: u64,
    cancel: CancelToken,
}

impl RunTicket {
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }
}

#[derive(Default)]
struct BoardInner {
    generation: u64,
    state: ProcessingState,
    scenes: Vec<Scene>,
    cancel: CancelToken,
}

/// Observable scene list plus processing state, shared between the
/// controller and any reader. Clones share the same board.
#[derive(Clone, Default)]
pub struct SceneBoard {
    inner: Arc<Mutex<BoardInner>>,
    listeners: Arc<Mutex<Vec<BoardListener>>>,
}

impl SceneBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ProcessingState {
        self.lock().state.clone()
    }

    pub fn scenes(&self) -> Vec<Scene> {
        self.lock().scenes.clone()
    }

    pub fn snapshot(&self) -> (ProcessingState, Vec<Scene>) {
        let inner = self.lock();
        (inner.state.clone(), inner.scenes.clone())
    }

    /// Registers a callback fired after every accepted change.
    pub fn subscribe(&self, listener: impl Fn(&ProcessingState, &[Scene]) + Send + Sync + 'static) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(listener));
    }

    /// Admits a new run and moves to `stage`, or refuses with `Busy` while
    /// another run is analyzing or generating.
    pub fn begin_run(&self, stage: Stage) -> PipelineResult<RunTicket> {
        let (ticket, state, scenes) = {
            let mut inner = self.lock();
            if !inner.state.stage.accepts_new_run() {
                return Err(PipelineError::Busy);
            }
            inner.generation += 1;
            inner.cancel = CancelToken::new();
            inner.state.stage = stage;
            (
                RunTicket {
                    generation: inner.generation,
                    cancel: inner.cancel.clone(),
                },
                inner.state.clone(),
                inner.scenes.clone(),
            )
        };
        self.notify(&state, &scenes);
        Ok(ticket)
    }

    pub fn is_current(&self, ticket: &RunTicket) -> bool {
        let inner = self.lock();
        inner.generation == ticket.generation && !ticket.cancel.is_cancelled()
    }

    /// Replaces state and scenes. Returns `false` and changes nothing when
    /// the ticket is stale.
    pub fn publish(&self, ticket: &RunTicket, state: ProcessingState, scenes: Vec<Scene>) -> bool {
        {
            let mut inner = self.lock();
            if inner.generation != ticket.generation || ticket.cancel.is_cancelled() {
                return false;
            }
            inner.state = state.clone();
            inner.scenes = scenes.clone();
        }
        self.notify(&state, &scenes);
        true
    }

    pub fn publish_state(&self, ticket: &RunTicket, state: ProcessingState) -> bool {
        let scenes = {
            let mut inner = self.lock();
            if inner.generation != ticket.generation || ticket.cancel.is_cancelled() {
                return false;
            }
            inner.state = state.clone();
            inner.scenes.clone()
        };
        self.notify(&state, &scenes);
        true
    }

    /// Loads scenes from outside a run, e.g. a saved `scenes.json`.
    pub fn load(&self, scenes: Vec<Scene>, state: ProcessingState) -> PipelineResult<()> {
        {
            let mut inner = self.lock();
            if !inner.state.stage.accepts_new_run() {
                return Err(PipelineError::Busy);
            }
            inner.generation += 1;
            inner.state = state.clone();
            inner.scenes = scenes.clone();
        }
        self.notify(&state, &scenes);
        Ok(())
    }

    /// Abandons whatever run is in flight and returns to an empty idle board.
    pub fn reset(&self) {
        let state = {
            let mut inner = self.lock();
            inner.cancel.cancel();
            inner.generation += 1;
            inner.state = ProcessingState::idle();
            inner.scenes.clear();
            inner.state.clone()
        };
        self.notify(&state, &[]);
    }

    fn lock(&self) -> MutexGuard<'_, BoardInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, state: &ProcessingState, scenes: &[Scene]) {
        let listeners: Vec<BoardListener> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            listener(state, scenes);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use folio_contracts::{ProcessingState, Scene, Stage};

    use super::SceneBoard;
    use crate::error::PipelineError;

    fn generating() -> ProcessingState {
        ProcessingState {
            stage: Stage::Generating,
            ..ProcessingState::idle()
        }
    }

    #[test]
    fn second_run_is_refused_while_busy() -> anyhow::Result<()> {
        let board = SceneBoard::new();
        let ticket = board.begin_run(Stage::Analyzing)?;
        assert!(matches!(board.begin_run(Stage::Analyzing), Err(PipelineError::Busy)));
        let done = ProcessingState {
            stage: Stage::Complete,
            ..ProcessingState::idle()
        };
        assert!(board.publish(&ticket, done, Vec::new()));
        assert!(board.begin_run(Stage::Generating).is_ok());
        Ok(())
    }

    #[test]
    fn reset_invalidates_outstanding_tickets() -> anyhow::Result<()> {
        let board = SceneBoard::new();
        let ticket = board.begin_run(Stage::Generating)?;
        board.reset();
        assert!(ticket.cancel_token().is_cancelled());
        assert!(!board.is_current(&ticket));
        assert!(!board.publish(&ticket, generating(), vec![Scene::new(1, "", "p")]));
        assert!(board.scenes().is_empty());
        assert_eq!(board.state().stage, Stage::Idle);
        Ok(())
    }

    #[test]
    fn listeners_see_every_accepted_change_and_may_reset() -> anyhow::Result<()> {
        let board = SceneBoard::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let handle = board.clone();
        board.subscribe(move |state, scenes| {
            counter.fetch_add(1, Ordering::SeqCst);
            if state.stage == Stage::Generating && scenes.len() == 2 {
                handle.reset();
            }
        });
        let ticket = board.begin_run(Stage::Generating)?;
        assert!(board.publish(&ticket, generating(), vec![Scene::new(1, "", "p")]));
        assert!(board.publish(
            &ticket,
            generating(),
            vec![Scene::new(1, "", "p"), Scene::new(2, "q", "p")]
        ));
        assert!(!board.publish(&ticket, generating(), Vec::new()));
        // begin_run, two publishes, and the reset fired from inside the listener
        assert_eq!(seen.load(Ordering::SeqCst), 4);
        Ok(())
    }
}
