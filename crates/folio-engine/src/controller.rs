use std::sync::Arc;
use std::time::Duration;

use folio_contracts::events::{EventKind, EventWriter};
use folio_contracts::{ProcessingState, RenderedResult, Scene, SceneStatus, Stage};
use serde_json::{json, Value};

use crate::assembler::DocumentAssembler;
use crate::backends::{normalize_scenes, Backends, ImageBackend, SceneAnalyzer};
use crate::board::{RunTicket, SceneBoard};
use crate::config::{Credential, QuotaPolicy, SessionConfig};
use crate::error::{PipelineError, PipelineResult};
use crate::generator::{Attempt, GenerationEvent, ImageGenerator};
use crate::markdown::MarkdownRenderer;
use crate::pacing::{Pacer, ThreadPacer};

/// Where a parked run picks up after `replace_credential`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumePoint {
    Batch { index: usize },
    Regenerate { scene_id: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    Completed,
    /// Quota ran out; `resume_index` is the first scene still to do.
    Paused { resume_index: usize },
    /// The run was reset or superseded; its results were discarded.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeOutcome {
    Batch(BatchOutcome),
    Regenerated(SceneStatus),
    NothingPending,
}

enum Step<T> {
    Continue(T),
    Stop(BatchOutcome),
}

/// Drives analysis and per-scene generation for one document and publishes
/// every change to its [`SceneBoard`].
pub struct SceneGenerationController {
    config: SessionConfig,
    analyzer: Box<dyn SceneAnalyzer>,
    images: Box<dyn ImageBackend>,
    generator: ImageGenerator,
    assembler: DocumentAssembler,
    pacer: Arc<dyn Pacer>,
    board: SceneBoard,
    events: Option<EventWriter>,
    document: String,
    batch_resume: Option<usize>,
    regenerate_resume: Option<u32>,
}

impl SceneGenerationController {
    pub fn new(config: SessionConfig, backends: Backends) -> Self {
        Self {
            generator: ImageGenerator::from_config(&config),
            config,
            analyzer: backends.analyzer,
            images: backends.images,
            assembler: DocumentAssembler::default(),
            pacer: Arc::new(ThreadPacer::default()),
            board: SceneBoard::new(),
            events: None,
            document: String::new(),
            batch_resume: None,
            regenerate_resume: None,
        }
    }

    pub fn with_pacer(mut self, pacer: Arc<dyn Pacer>) -> Self {
        self.pacer = pacer;
        self
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn MarkdownRenderer>) -> Self {
        self.assembler = DocumentAssembler::new(renderer);
        self
    }

    /// Shared handle to the observable state. Calling `reset` on it from
    /// another thread abandons the running batch.
    pub fn board(&self) -> SceneBoard {
        self.board.clone()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn document(&self) -> &str {
        &self.document
    }

    /// The next thing `resume` will pick up. A parked regeneration goes
    /// before a parked batch.
    pub fn pending_resume(&self) -> Option<ResumePoint> {
        self.regenerate_resume
            .map(|scene_id| ResumePoint::Regenerate { scene_id })
            .or(self.batch_resume.map(|index| ResumePoint::Batch { index }))
    }

    /// Starts a fresh session on `text`, dropping any previous scenes.
    pub fn set_document(&mut self, text: impl Into<String>) -> PipelineResult<()> {
        self.board.load(Vec::new(), ProcessingState::idle())?;
        self.document = text.into();
        self.batch_resume = None;
        self.regenerate_resume = None;
        Ok(())
    }

    /// Installs previously saved scenes without running analysis.
    pub fn load_scenes(&mut self, scenes: Vec<Scene>) -> PipelineResult<()> {
        let state = ProcessingState {
            total_scenes: scenes.len(),
            ..ProcessingState::idle()
        };
        self.board.load(scenes, state)
    }

    /// Runs the batch from `resume_index`. Index 0 analyzes the document
    /// first; any other index reuses the scenes already on the board.
    pub fn start_batch(&mut self, resume_index: usize) -> PipelineResult<BatchOutcome> {
        if self.document.trim().is_empty() {
            return Err(PipelineError::Config("no document loaded".to_string()));
        }
        if resume_index > 0 && self.board.scenes().is_empty() {
            return Err(PipelineError::Config(format!(
                "cannot resume at scene index {resume_index}: no scenes on the board"
            )));
        }
        let stage = if resume_index == 0 {
            Stage::Analyzing
        } else {
            Stage::Generating
        };
        let ticket = self.board.begin_run(stage)?;
        self.batch_resume = None;
        if resume_index == 0 {
            self.regenerate_resume = None;
        }
        let result = self.drive_batch(&ticket, resume_index);
        if let Err(err) = &result {
            self.settle_failed_run(&ticket, err);
        }
        result
    }

    /// Generates one scene again outside the batch loop.
    ///
    /// A scene in `error` starts from the sanitized prompt. Quota exhaustion
    /// restores the scene's previous status, parks the session and returns
    /// the quota error; `resume` then retries exactly this scene.
    pub fn regenerate_one(&mut self, scene_id: u32) -> PipelineResult<SceneStatus> {
        if !self.board.scenes().iter().any(|scene| scene.id == scene_id) {
            return Err(PipelineError::Config(format!("no scene with id {scene_id}")));
        }
        let ticket = self.board.begin_run(Stage::Generating)?;
        self.regenerate_resume = None;
        let result = self.drive_regenerate(&ticket, scene_id);
        if let Err(err) = &result {
            if !err.is_quota() {
                self.settle_failed_run(&ticket, err);
            }
        }
        result
    }

    pub fn replace_credential(&mut self, credential: Credential) -> PipelineResult<()> {
        self.config.credential = credential;
        self.emit(
            EventKind::CredentialReplaced,
            json!({
                "pending": self.pending_resume().map(resume_point_json),
                "batch_index": self.batch_resume,
            }),
        )
    }

    /// Continues a parked session: the scene whose regeneration ran out of
    /// quota first, then the batch at its stored index on the next call.
    pub fn resume(&mut self) -> PipelineResult<ResumeOutcome> {
        match self.pending_resume() {
            None => Ok(ResumeOutcome::NothingPending),
            Some(ResumePoint::Batch { index }) => self.start_batch(index).map(ResumeOutcome::Batch),
            Some(ResumePoint::Regenerate { scene_id }) => self
                .regenerate_one(scene_id)
                .map(ResumeOutcome::Regenerated),
        }
    }

    pub fn assemble_document(&self) -> RenderedResult {
        self.assembler.assemble(&self.document, &self.board.scenes())
    }

    /// Cancels in-flight waits, invalidates the current run and clears the board.
    pub fn reset(&mut self) -> PipelineResult<()> {
        self.board.reset();
        self.batch_resume = None;
        self.regenerate_resume = None;
        self.emit(EventKind::RunReset, json!({}))
    }

    fn drive_batch(&mut self, ticket: &RunTicket, resume_index: usize) -> PipelineResult<BatchOutcome> {
        self.emit(
            EventKind::RunStarted,
            json!({
                "resume_index": resume_index,
                "analyzer": self.analyzer.name(),
                "image_backend": self.images.name(),
            }),
        )?;
        let scenes = if resume_index == 0 {
            match self.analyze(ticket)? {
                Step::Continue(scenes) => scenes,
                Step::Stop(outcome) => return Ok(outcome),
            }
        } else {
            self.board.scenes()
        };
        self.run_batch(ticket, scenes, resume_index)
    }

    fn analyze(&mut self, ticket: &RunTicket) -> PipelineResult<Step<Vec<Scene>>> {
        let state = ProcessingState {
            stage: Stage::Analyzing,
            progress_message: "Reading the story and choosing scenes".to_string(),
            ..ProcessingState::idle()
        };
        if !self.board.publish(ticket, state.clone(), Vec::new()) {
            return Ok(Step::Stop(BatchOutcome::Cancelled));
        }
        self.emit(
            EventKind::AnalysisStarted,
            json!({ "chars": self.document.chars().count() }),
        )?;

        let result = self
            .analyzer
            .analyze(&self.document, &self.config.credential)
            .and_then(normalize_scenes);
        if !self.board.is_current(ticket) {
            return Ok(Step::Stop(BatchOutcome::Cancelled));
        }

        match result {
            Ok(scenes) => {
                self.emit(
                    EventKind::ScenesAnalyzed,
                    json!({
                        "count": scenes.len(),
                        "scene_ids": scenes.iter().map(|scene| scene.id).collect::<Vec<u32>>(),
                    }),
                )?;
                Ok(Step::Continue(scenes))
            }
            Err(err) if err.is_quota() => {
                self.emit(
                    EventKind::QuotaExhausted,
                    json!({ "phase": "analysis", "code": err.code(), "error": err.to_string() }),
                )?;
                let point = ResumePoint::Batch { index: 0 };
                if self.park(ticket, state, Vec::new(), point, &err)? {
                    Ok(Step::Stop(BatchOutcome::Paused { resume_index: 0 }))
                } else {
                    Ok(Step::Stop(BatchOutcome::Cancelled))
                }
            }
            Err(err) => {
                let message = match err {
                    PipelineError::AnalysisFailed(message) => message,
                    other => other.to_string(),
                };
                let failed = ProcessingState {
                    stage: Stage::Error,
                    progress_message: format!("Scene analysis failed: {message}"),
                    ..ProcessingState::idle()
                };
                self.board.publish(ticket, failed, Vec::new());
                self.emit(EventKind::AnalysisFailed, json!({ "error": message }))?;
                Err(PipelineError::AnalysisFailed(message))
            }
        }
    }

    fn run_batch(
        &mut self,
        ticket: &RunTicket,
        mut scenes: Vec<Scene>,
        resume_index: usize,
    ) -> PipelineResult<BatchOutcome> {
        let total = scenes.len();
        let mut state = ProcessingState {
            stage: Stage::Generating,
            progress_message: format!("Illustrating {total} scenes"),
            total_scenes: total,
            completed_scenes: resume_index.min(total),
        };
        if !self.board.publish(ticket, state.clone(), scenes.clone()) {
            return Ok(BatchOutcome::Cancelled);
        }
        let cancel = ticket.cancel_token().clone();
        let spacing = self.config.pacing.request_spacing();
        let mut requests_sent = 0usize;
        let mut skip_spacing = false;
        let mut cooldowns = 0usize;
        let mut index = resume_index;

        while index < scenes.len() {
            if scenes[index].status == SceneStatus::Completed {
                index += 1;
                continue;
            }
            if requests_sent > 0 && !skip_spacing {
                if !self.pacer.wait(spacing, &cancel) || !self.board.is_current(ticket) {
                    return Ok(BatchOutcome::Cancelled);
                }
                scenes = self.board.scenes();
                if index >= scenes.len() {
                    break;
                }
                if scenes[index].status == SceneStatus::Completed {
                    index += 1;
                    continue;
                }
            }
            skip_spacing = false;
            requests_sent += 1;

            let attempt = if scenes[index].status == SceneStatus::Error {
                Attempt::RetryAfterFailure
            } else {
                Attempt::Fresh
            };
            scenes[index].status = SceneStatus::Generating;
            state.completed_scenes = index;
            state.progress_message = progress_line(&scenes[index], index, total);
            if !self.board.publish(ticket, state.clone(), scenes.clone()) {
                return Ok(BatchOutcome::Cancelled);
            }
            let scene = scenes[index].clone();
            self.emit(
                EventKind::SceneStarted,
                json!({ "scene_id": scene.id, "index": index, "retry": attempt == Attempt::RetryAfterFailure }),
            )?;

            let mut trail = Vec::new();
            let result = self.generator.generate(
                self.images.as_ref(),
                &self.config.credential,
                &scene,
                attempt,
                self.pacer.as_ref(),
                &cancel,
                &mut |event| trail.push(event),
            );
            self.emit_trail(scene.id, trail)?;
            if !self.board.is_current(ticket) {
                return Ok(BatchOutcome::Cancelled);
            }
            scenes = self.board.scenes();
            if index >= scenes.len() || scenes[index].id != scene.id {
                return Ok(BatchOutcome::Cancelled);
            }

            match result {
                Ok(image) => {
                    self.emit(
                        EventKind::SceneCompleted,
                        json!({
                            "scene_id": scene.id,
                            "tier": image.tier.as_str(),
                            "quality": image.quality,
                            "bytes": image.url.len(),
                        }),
                    )?;
                    scenes[index].mark_completed(image.url);
                }
                Err(PipelineError::Cancelled) => return Ok(BatchOutcome::Cancelled),
                Err(err) if err.is_quota() => {
                    scenes[index].status = SceneStatus::Pending;
                    self.emit(
                        EventKind::QuotaExhausted,
                        json!({
                            "phase": "generation",
                            "scene_id": scene.id,
                            "index": index,
                            "code": err.code(),
                            "error": err.to_string(),
                        }),
                    )?;
                    match self.config.pacing.quota {
                        QuotaPolicy::Cooldown {
                            seconds,
                            max_cooldowns,
                        } if cooldowns < max_cooldowns => {
                            cooldowns += 1;
                            if !self.board.publish(ticket, state.clone(), scenes.clone())
                                || !self.cool_down(ticket, &mut state, seconds, scene.id)?
                            {
                                return Ok(BatchOutcome::Cancelled);
                            }
                            scenes = self.board.scenes();
                            skip_spacing = true;
                            continue;
                        }
                        _ => {
                            let point = ResumePoint::Batch { index };
                            if self.park(ticket, state, scenes, point, &err)? {
                                return Ok(BatchOutcome::Paused {
                                    resume_index: index,
                                });
                            }
                            return Ok(BatchOutcome::Cancelled);
                        }
                    }
                }
                Err(err) => {
                    self.emit(
                        EventKind::SceneFailed,
                        json!({
                            "scene_id": scene.id,
                            "code": err.code(),
                            "error": err.to_string(),
                        }),
                    )?;
                    scenes[index].status = SceneStatus::Error;
                    scenes[index].image_url = None;
                }
            }
            if !self.board.publish(ticket, state.clone(), scenes.clone()) {
                return Ok(BatchOutcome::Cancelled);
            }
            index += 1;
        }

        let completed = count_status(&scenes, SceneStatus::Completed);
        let failed = count_status(&scenes, SceneStatus::Error);
        state.stage = Stage::Complete;
        state.completed_scenes = total;
        state.progress_message = if failed == 0 {
            "All illustrations are ready".to_string()
        } else {
            format!("Finished with {failed} failed illustration(s)")
        };
        if !self.board.publish(ticket, state, scenes) {
            return Ok(BatchOutcome::Cancelled);
        }
        self.emit(
            EventKind::BatchCompleted,
            json!({ "total": total, "completed": completed, "failed": failed }),
        )?;
        Ok(BatchOutcome::Completed)
    }

    fn drive_regenerate(&mut self, ticket: &RunTicket, scene_id: u32) -> PipelineResult<SceneStatus> {
        let mut scenes = self.board.scenes();
        let Some(index) = scenes.iter().position(|scene| scene.id == scene_id) else {
            return Err(PipelineError::Cancelled);
        };
        let previous = scenes[index].status;
        let attempt = if previous == SceneStatus::Error {
            Attempt::RetryAfterFailure
        } else {
            Attempt::Fresh
        };
        let mut state = self.board.state();
        state.stage = Stage::Generating;
        state.progress_message = progress_line(&scenes[index], index, scenes.len());
        scenes[index].status = SceneStatus::Generating;
        if !self.board.publish(ticket, state.clone(), scenes.clone()) {
            return Err(PipelineError::Cancelled);
        }
        let scene = scenes[index].clone();
        self.emit(
            EventKind::SceneStarted,
            json!({ "scene_id": scene_id, "regenerate": true, "retry": attempt == Attempt::RetryAfterFailure }),
        )?;

        let mut trail = Vec::new();
        let result = self.generator.generate(
            self.images.as_ref(),
            &self.config.credential,
            &scene,
            attempt,
            self.pacer.as_ref(),
            ticket.cancel_token(),
            &mut |event| trail.push(event),
        );
        self.emit_trail(scene_id, trail)?;
        if !self.board.is_current(ticket) {
            return Err(PipelineError::Cancelled);
        }
        scenes = self.board.scenes();
        let Some(index) = scenes.iter().position(|scene| scene.id == scene_id) else {
            return Err(PipelineError::Cancelled);
        };
        state.stage = if self.batch_resume.is_some() {
            Stage::AwaitingCredential
        } else {
            Stage::Complete
        };

        let status = match result {
            Ok(image) => {
                self.emit(
                    EventKind::SceneCompleted,
                    json!({
                        "scene_id": scene_id,
                        "tier": image.tier.as_str(),
                        "quality": image.quality,
                        "bytes": image.url.len(),
                    }),
                )?;
                scenes[index].mark_completed(image.url);
                state.progress_message = format!("Illustration {scene_id} regenerated");
                SceneStatus::Completed
            }
            Err(err) if err.is_quota() => {
                scenes[index].status = previous;
                self.emit(
                    EventKind::QuotaExhausted,
                    json!({
                        "phase": "regenerate",
                        "scene_id": scene_id,
                        "code": err.code(),
                        "error": err.to_string(),
                    }),
                )?;
                let point = ResumePoint::Regenerate { scene_id };
                if !self.park(ticket, state, scenes, point, &err)? {
                    return Err(PipelineError::Cancelled);
                }
                return Err(err);
            }
            Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
            Err(err) => {
                self.emit(
                    EventKind::SceneFailed,
                    json!({ "scene_id": scene_id, "code": err.code(), "error": err.to_string() }),
                )?;
                scenes[index].status = SceneStatus::Error;
                scenes[index].image_url = None;
                state.progress_message = format!("Illustration {scene_id} failed: {err}");
                SceneStatus::Error
            }
        };
        if !self.board.publish(ticket, state, scenes) {
            return Err(PipelineError::Cancelled);
        }
        Ok(status)
    }

    /// Parks the run until a new credential arrives. Returns `false` if the
    /// run was superseded in the meantime.
    fn park(
        &mut self,
        ticket: &RunTicket,
        mut state: ProcessingState,
        scenes: Vec<Scene>,
        point: ResumePoint,
        err: &PipelineError,
    ) -> PipelineResult<bool> {
        state.stage = Stage::AwaitingCredential;
        state.progress_message =
            "API quota exhausted. Provide a new API key to continue.".to_string();
        if !self.board.publish(ticket, state, scenes) {
            return Ok(false);
        }
        match point {
            ResumePoint::Batch { index } => self.batch_resume = Some(index),
            ResumePoint::Regenerate { scene_id } => self.regenerate_resume = Some(scene_id),
        }
        self.emit(
            EventKind::BatchPaused,
            json!({ "resume": resume_point_json(point), "code": err.code() }),
        )?;
        Ok(true)
    }

    fn cool_down(
        &self,
        ticket: &RunTicket,
        state: &mut ProcessingState,
        seconds: u64,
        scene_id: u32,
    ) -> PipelineResult<bool> {
        for remaining in (1..=seconds).rev() {
            state.progress_message =
                format!("Rate limit reached. Retrying illustration {scene_id} in {remaining}s");
            if !self.board.publish_state(ticket, state.clone()) {
                return Ok(false);
            }
            self.emit(
                EventKind::CooldownTick,
                json!({ "scene_id": scene_id, "remaining_s": remaining }),
            )?;
            if !self.pacer.wait(Duration::from_secs(1), ticket.cancel_token()) {
                return Ok(false);
            }
        }
        Ok(self.board.is_current(ticket))
    }

    /// Leaves the board in `error` when a run dies on an unexpected error.
    fn settle_failed_run(&self, ticket: &RunTicket, err: &PipelineError) {
        let mut state = self.board.state();
        if !self.board.is_current(ticket) || state.stage.accepts_new_run() {
            return;
        }
        state.stage = Stage::Error;
        state.progress_message = err.to_string();
        self.board.publish_state(ticket, state);
    }

    fn emit_trail(&self, scene_id: u32, trail: Vec<GenerationEvent>) -> PipelineResult<()> {
        for event in trail {
            match event {
                GenerationEvent::Escalated { from, to, reason } => self.emit(
                    EventKind::PromptEscalated,
                    json!({
                        "scene_id": scene_id,
                        "from": from.as_str(),
                        "to": to.as_str(),
                        "reason": reason,
                    }),
                )?,
                GenerationEvent::RateLimited {
                    retry,
                    wait,
                    message,
                } => self.emit(
                    EventKind::RateLimited,
                    json!({
                        "scene_id": scene_id,
                        "retry": retry,
                        "wait_s": wait.as_secs_f64(),
                        "error": message,
                    }),
                )?,
            }
        }
        Ok(())
    }

    fn emit(&self, kind: EventKind, payload: Value) -> PipelineResult<()> {
        let Some(events) = &self.events else {
            return Ok(());
        };
        events
            .record(kind, payload)
            .map(|_| ())
            .map_err(|err| PipelineError::Journal(format!("{err:#}")))
    }
}

fn progress_line(scene: &Scene, index: usize, total: usize) -> String {
    let reasoning = scene.reasoning.trim();
    let detail = if reasoning.is_empty() {
        scene.visual_prompt.chars().take(80).collect::<String>()
    } else {
        reasoning.to_string()
    };
    format!(
        "Illustrating scene {} ({}/{}): {detail}",
        scene.id,
        index + 1,
        total
    )
}

fn count_status(scenes: &[Scene], status: SceneStatus) -> usize {
    scenes.iter().filter(|scene| scene.status == status).count()
}

fn resume_point_json(point: ResumePoint) -> Value {
    match point {
        ResumePoint::Batch { index } => json!({ "kind": "batch", "index": index }),
        ResumePoint::Regenerate { scene_id } => json!({ "kind": "regenerate", "scene_id": scene_id }),
    }
}
