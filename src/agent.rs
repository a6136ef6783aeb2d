use async_trait::async_trait;
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::env_or;
use crate::reduce::PageReducer;
use crate::retry::RetryPolicy;

/// Step ceiling used when `MAX_STEPS` is not configured.
pub const MAX_STEPS: usize = 6;
/// Character budget for the reduced page state handed to the model.
pub const MAX_CHARS_PER_CHUNK: usize = 15_000;
/// Upper bound on actions the model may propose in one step.
pub const MAX_ACTIONS_PER_STEP: usize = 4;
pub const AMAZON_HOME: &str = "https://www.amazon.com";

// ========================= Core Types =========================

/// One browser operation proposed by the model.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    Navigate {
        url: String,
    },
    Click {
        selector: String,
    },
    Type {
        selector: String,
        text: String,
    },
    Press {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        selector: Option<String>,
        key: String,
    },
    Select {
        selector: String,
        value: String,
    },
    Scroll {
        #[serde(default)]
        dx: i64,
        #[serde(default = "default_scroll_dy")]
        dy: i64,
    },
    WaitFor {
        selector: String,
        #[serde(default = "default_wait_ms")]
        timeout_ms: u64,
    },
}

fn default_scroll_dy() -> i64 {
    600
}

fn default_wait_ms() -> u64 {
    5_000
}

impl Action {
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Navigate { .. } => "navigate",
            Action::Click { .. } => "click",
            Action::Type { .. } => "type",
            Action::Press { .. } => "press",
            Action::Select { .. } => "select",
            Action::Scroll { .. } => "scroll",
            Action::WaitFor { .. } => "wait_for",
        }
    }

    /// The locator the action operates on: a CSS selector, or the URL for navigation.
    pub fn target(&self) -> Option<&str> {
        match self {
            Action::Navigate { url } => Some(url),
            Action::Click { selector }
            | Action::Type { selector, .. }
            | Action::Select { selector, .. }
            | Action::WaitFor { selector, .. } => Some(selector),
            Action::Press { selector, .. } => selector.as_deref(),
            Action::Scroll { .. } => None,
        }
    }

    pub fn value(&self) -> Option<&str> {
        match self {
            Action::Type { text, .. } => Some(text),
            Action::Press { key, .. } => Some(key),
            Action::Select { value, .. } => Some(value),
            _ => None,
        }
    }

    /// Whether executing this action can load a new document.
    pub fn may_navigate(&self) -> bool {
        matches!(
            self,
            Action::Navigate { .. } | Action::Click { .. } | Action::Press { .. } | Action::Select { .. }
        )
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(line) => f.write_str(&line),
            Err(_) => f.write_str(self.kind()),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Goal {
    pub task: String,
}

impl Goal {
    pub fn new(task: impl Into<String>) -> Self {
        Self { task: task.into() }
    }
}

/// Raw page capture as returned by a [`BrowserSession`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PageState {
    pub id: String,
    pub url: Option<String>,
    pub title: Option<String>,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_base64: Option<String>,
    pub captured_at_ms: u128,
}

impl PageState {
    pub fn new(url: Option<String>, title: Option<String>, content: String) -> Self {
        Self {
            id: nanoid!(),
            url,
            title,
            content,
            image_base64: None,
            captured_at_ms: now_ms(),
        }
    }
}

/// Page state after reduction; `content` never exceeds the reducer budget.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReducedPage {
    pub url: Option<String>,
    pub title: Option<String>,
    pub content: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Proposal {
    Done { reason: String },
    Actions(Vec<Action>),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ActionOutcome {
    Succeeded,
    Failed { error: String },
    Skipped { reason: String },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActionRecord {
    pub action: Action,
    pub outcome: ActionOutcome,
}

/// One observe, plan, filter, execute iteration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepRecord {
    /// 1-based step index.
    pub step: usize,
    pub url: Option<String>,
    pub page_state: String,
    pub proposed: Vec<Action>,
    /// Actions that passed the filter, as normalized by it.
    pub accepted: Vec<Action>,
    /// One entry per proposed action, in proposal order.
    pub outcomes: Vec<ActionRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done: Option<String>,
    pub timestamp_ms: u128,
}

impl StepRecord {
    fn new(step: usize, page: &ReducedPage) -> Self {
        Self {
            step,
            url: page.url.clone(),
            page_state: page.content.clone(),
            proposed: Vec::new(),
            accepted: Vec::new(),
            outcomes: Vec::new(),
            done: None,
            timestamp_ms: now_ms(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Termination {
    Success { reason: String },
    StepLimitExhausted,
    FatalError { step: usize, error: String },
    Cancelled,
}

/// The full record of one execution of the loop.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: String,
    pub goal: Goal,
    pub max_steps: usize,
    pub steps: Vec<StepRecord>,
    pub termination: Option<Termination>,
    pub started_at_ms: u128,
    pub elapsed_ms: u128,
}

impl RunState {
    pub fn new(goal: Goal, max_steps: usize) -> Self {
        Self {
            run_id: nanoid!(),
            goal,
            max_steps,
            steps: Vec::new(),
            termination: None,
            started_at_ms: now_ms(),
            elapsed_ms: 0,
        }
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    pub fn is_terminal(&self) -> bool {
        self.termination.is_some()
    }

    fn record(&mut self, step: StepRecord) {
        debug_assert!(!self.is_terminal() && self.steps.len() < self.max_steps);
        self.steps.push(step);
    }

    /// First termination wins.
    fn terminate(&mut self, termination: Termination) {
        if self.termination.is_none() {
            self.termination = Some(termination);
        }
    }

    /// Actions that actually ran successfully, one JSON line each.
    pub fn executed_actions(&self) -> Vec<String> {
        self.steps
            .iter()
            .flat_map(|s| s.outcomes.iter())
            .filter(|r| r.outcome == ActionOutcome::Succeeded)
            .map(|r| r.action.to_string())
            .collect()
    }

    pub fn status_text(&self) -> String {
        match &self.termination {
            Some(Termination::Success { reason }) => format!("DONE {reason}"),
            Some(Termination::StepLimitExhausted) => "Finished steps or reached max steps.".into(),
            Some(Termination::FatalError { step: 0, error }) => {
                format!("Browser session failed: {error}")
            }
            Some(Termination::FatalError { step, error }) => {
                format!("Error at step {step}: {error}")
            }
            Some(Termination::Cancelled) => "Run cancelled.".into(),
            None => "Run in progress.".into(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    Started { run_id: String, goal: String },
    Step(StepRecord),
    Finished(RunState),
    /// The run never started (e.g. the browser failed to launch).
    Aborted { message: String },
}

impl RunEvent {
    pub fn name(&self) -> &'static str {
        match self {
            RunEvent::Started { .. } => "started",
            RunEvent::Step(_) => "step",
            RunEvent::Finished(_) => "finished",
            RunEvent::Aborted { .. } => "aborted",
        }
    }
}

#[derive(Debug, Error, Clone)]
pub enum AgentError {
    #[error("model rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },
    #[error("model still rate limited after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
    #[error("model error: {0}")]
    Model(String),
    #[error("action failed: {0}")]
    Execution(String),
    #[error("browser session failure: {0}")]
    Session(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("other error: {0}")]
    Other(String),
}

impl AgentError {
    /// Execution errors are absorbed into the step record; everything else ends the run.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, AgentError::Execution(_))
    }
}

// ========================= Pluggable Subsystems =========================

#[async_trait]
pub trait BrowserSession: Send + Sync {
    async fn open(&self, url: &str) -> Result<(), AgentError>;
    async fn capture_page_state(&self) -> Result<PageState, AgentError>;
    /// `AgentError::Execution` for recoverable failures (selector not found, timeout),
    /// `AgentError::Session` when the browser itself is gone.
    async fn execute(&self, action: &Action, timeout: Duration) -> Result<(), AgentError>;
    async fn close(&self) -> Result<(), AgentError>;
}

#[async_trait]
impl<T: BrowserSession + ?Sized> BrowserSession for Box<T> {
    async fn open(&self, url: &str) -> Result<(), AgentError> {
        (**self).open(url).await
    }

    async fn capture_page_state(&self) -> Result<PageState, AgentError> {
        (**self).capture_page_state().await
    }

    async fn execute(&self, action: &Action, timeout: Duration) -> Result<(), AgentError> {
        (**self).execute(action, timeout).await
    }

    async fn close(&self) -> Result<(), AgentError> {
        (**self).close().await
    }
}

/// Hands out a fresh, independent browser session per run.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open_session(&self) -> Result<Box<dyn BrowserSession>, AgentError>;
}

/// The model client: turns the goal, history and current page into the next move.
#[async_trait]
pub trait Reasoner: Send + Sync {
    /// Must return `AgentError::RateLimited` for throttling so the retry policy can tell it apart.
    async fn propose_next_actions(
        &self,
        goal: &Goal,
        history: &[StepRecord],
        page: &ReducedPage,
    ) -> Result<Proposal, AgentError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    Accept(Action),
    Reject { reason: String },
}

pub trait PolicyEngine: Send + Sync {
    fn review(&self, action: &Action) -> Verdict;
}

#[async_trait]
pub trait RunStore: Send + Sync {
    async fn write_run_start(&self, run: &RunState) -> Result<(), AgentError>;
    async fn write_step(&self, run_id: &str, step: &StepRecord) -> Result<(), AgentError>;
    async fn write_run_end(&self, run: &RunState) -> Result<(), AgentError>;
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save(&self, run_id: &str, step: usize, page: &PageState) -> Result<(), AgentError>;
}

// ========================= Agent Core =========================

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub max_steps: usize,
    pub max_chars_per_chunk: usize,
    /// Opened before the first step when set.
    pub start_url: Option<String>,
    pub action_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: env_or("MAX_STEPS", MAX_STEPS),
            max_chars_per_chunk: env_or("MAX_CHARS_PER_CHUNK", MAX_CHARS_PER_CHUNK),
            start_url: Some(env_or("CART_PILOT_START_URL", AMAZON_HOME.to_string())),
            action_timeout: Duration::from_millis(env_or("CART_PILOT_ACTION_TIMEOUT_MS", 10_000)),
            retry: RetryPolicy::default(),
        }
    }
}

/// Per-run cancellation and event sink.
#[derive(Clone)]
pub struct RunControl {
    cancel: CancellationToken,
    events: Option<mpsc::UnboundedSender<RunEvent>>,
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new(CancellationToken::new())
    }
}

impl RunControl {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel, events: None }
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<RunEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn emit(&self, event: RunEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

pub struct Agent<R, P>
where
    R: Reasoner,
    P: PolicyEngine,
{
    reasoner: R,
    policy: P,
    reducer: PageReducer,
    cfg: AgentConfig,
    store: Arc<dyn RunStore>,
    snapshot_store: Option<Arc<dyn SnapshotStore>>,
}

impl<R, P> Agent<R, P>
where
    R: Reasoner,
    P: PolicyEngine,
{
    pub fn new(reasoner: R, policy: P, cfg: AgentConfig) -> Self {
        Self {
            reasoner,
            policy,
            reducer: PageReducer::new(cfg.max_chars_per_chunk),
            cfg,
            store: Arc::new(NullRunStore),
            snapshot_store: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn RunStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_snapshot_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.snapshot_store = Some(store);
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.cfg
    }

    pub async fn run<S: BrowserSession>(&self, goal: &str, session: S) -> RunState {
        self.run_with(goal, session, RunControl::default()).await
    }

    /// Drives `session` toward `goal` and always closes it, whatever the exit path.
    pub async fn run_with<S: BrowserSession>(
        &self,
        goal: &str,
        session: S,
        control: RunControl,
    ) -> RunState {
        let start = Instant::now();
        let mut run = RunState::new(Goal::new(goal), self.cfg.max_steps);
        info!(run_id = %run.run_id, goal = %run.goal.task, max_steps = run.max_steps, "run started");
        if let Err(err) = self.store.write_run_start(&run).await {
            warn!(run_id = %run.run_id, "run store: {}", err);
        }
        control.emit(RunEvent::Started {
            run_id: run.run_id.clone(),
            goal: run.goal.task.clone(),
        });

        let cancel = control.cancel_token().clone();
        let cancelled = tokio::select! {
            biased;
            _ = cancel.cancelled() => true,
            _ = self.drive(&mut run, &session, &control) => false,
        };
        if cancelled {
            info!(run_id = %run.run_id, steps = run.step_count(), "run cancelled");
            run.terminate(Termination::Cancelled);
        }

        if let Err(err) = session.close().await {
            warn!(run_id = %run.run_id, "closing browser session: {}", err);
        }

        run.elapsed_ms = start.elapsed().as_millis();
        if let Err(err) = self.store.write_run_end(&run).await {
            warn!(run_id = %run.run_id, "run store: {}", err);
        }
        info!(
            run_id = %run.run_id,
            steps = run.step_count(),
            outcome = ?run.termination,
            elapsed_ms = run.elapsed_ms as u64,
            "run finished"
        );
        control.emit(RunEvent::Finished(run.clone()));
        run
    }

    async fn drive<S: BrowserSession>(&self, run: &mut RunState, session: &S, control: &RunControl) {
        if let Some(url) = &self.cfg.start_url {
            if let Err(err) = session.open(url).await {
                warn!(run_id = %run.run_id, url = %url, "failed to open start page: {}", err);
                run.terminate(Termination::FatalError { step: 0, error: err.to_string() });
                return;
            }
        }

        while !run.is_terminal() && run.step_count() < self.cfg.max_steps {
            let step = run.step_count() + 1;
            match self.step(run, session, step).await {
                Ok((record, termination)) => {
                    if let Err(err) = self.store.write_step(&run.run_id, &record).await {
                        warn!(run_id = %run.run_id, step, "run store: {}", err);
                    }
                    control.emit(RunEvent::Step(record.clone()));
                    run.record(record);
                    if let Some(t) = termination {
                        run.terminate(t);
                    }
                }
                Err(err) => {
                    warn!(run_id = %run.run_id, step, "step failed: {}", err);
                    run.terminate(Termination::FatalError { step, error: err.to_string() });
                }
            }
        }

        if !run.is_terminal() {
            info!(run_id = %run.run_id, "step budget exhausted");
            run.terminate(Termination::StepLimitExhausted);
        }
    }

    /// Errors returned here are fatal and leave no step record behind.
    async fn step<S: BrowserSession>(
        &self,
        run: &RunState,
        session: &S,
        step: usize,
    ) -> Result<(StepRecord, Option<Termination>), AgentError> {
        let page = session.capture_page_state().await?;
        if let Some(store) = &self.snapshot_store {
            if let Err(err) = store.save(&run.run_id, step, &page).await {
                warn!(step, "snapshot store: {}", err);
            }
        }
        let reduced = self.reducer.reduce_page(&page);
        debug!(step, raw = page.content.len(), reduced = reduced.content.len(), "page reduced");

        let proposal = self
            .cfg
            .retry
            .run(|| {
                self.reasoner
                    .propose_next_actions(&run.goal, &run.steps, &reduced)
            })
            .await?;

        let mut record = StepRecord::new(step, &reduced);
        let mut actions = match proposal {
            Proposal::Done { reason } => {
                info!(step, reason = %reason, "model reports goal reached");
                record.done = Some(reason.clone());
                return Ok((record, Some(Termination::Success { reason })));
            }
            Proposal::Actions(actions) => actions,
        };
        if actions.is_empty() {
            return Err(AgentError::Model("model proposed no actions".into()));
        }
        if actions.len() > MAX_ACTIONS_PER_STEP {
            warn!(step, proposed = actions.len(), "dropping actions beyond the per-step limit");
            actions.truncate(MAX_ACTIONS_PER_STEP);
        }
        record.proposed = actions.clone();

        let mut termination = None;
        let mut halted: Option<&str> = None;
        for action in actions {
            if let Some(reason) = halted {
                record.outcomes.push(ActionRecord {
                    action,
                    outcome: ActionOutcome::Skipped { reason: reason.to_string() },
                });
                continue;
            }
            let normalized = match self.policy.review(&action) {
                Verdict::Accept(normalized) => normalized,
                Verdict::Reject { reason } => {
                    info!(step, action = %action, reason = %reason, "action rejected by filter");
                    record.outcomes.push(ActionRecord {
                        action,
                        outcome: ActionOutcome::Skipped {
                            reason: format!("rejected by filter: {reason}"),
                        },
                    });
                    continue;
                }
            };
            record.accepted.push(normalized.clone());
            let outcome = match session.execute(&normalized, self.cfg.action_timeout).await {
                Ok(()) => {
                    info!(step, action = %normalized, "action executed");
                    ActionOutcome::Succeeded
                }
                Err(err) if err.is_fatal() => {
                    warn!(step, action = %normalized, "browser session lost: {}", err);
                    termination = Some(Termination::FatalError { step, error: err.to_string() });
                    halted = Some("browser session failed");
                    ActionOutcome::Failed { error: err.to_string() }
                }
                Err(err) => {
                    warn!(step, action = %normalized, "action failed: {}", err);
                    halted = Some("previous action failed");
                    ActionOutcome::Failed { error: err.to_string() }
                }
            };
            record.outcomes.push(ActionRecord { action: normalized, outcome });
        }
        Ok((record, termination))
    }
}

// ========================= Defaults & Helpers =========================

pub struct NullRunStore;

#[async_trait]
impl RunStore for NullRunStore {
    async fn write_run_start(&self, _run: &RunState) -> Result<(), AgentError> {
        Ok(())
    }

    async fn write_step(&self, _run_id: &str, _step: &StepRecord) -> Result<(), AgentError> {
        Ok(())
    }

    async fn write_run_end(&self, _run: &RunState) -> Result<(), AgentError> {
        Ok(())
    }
}

#[derive(Clone, Copy)]
pub struct AllowAllPolicy;

impl PolicyEngine for AllowAllPolicy {
    fn review(&self, action: &Action) -> Verdict {
        Verdict::Accept(action.clone())
    }
}

pub(crate) fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}
