//! The worker orchestrator.
//!
//! One [`WorkerOrchestrator`] owns every live worker handle, keyed by task id.
//! Each spawn gets a fresh `spawn_id`; output and exit notifications carry
//! the id they were started with and are dropped when it no longer matches
//! the live handle, so a slow-dying previous worker can never touch the task
//! after it has been restarted.
//!
//! With persistence attached, every live worker also has a claim file on
//! disk naming this orchestrator and its process, which lets other processes
//! over the same project tell a running task from a stuck one.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use fleet_core::config::OrchestratorConfig;
use fleet_core::profiles::ProfileManager;
use fleet_core::records::WorkerClaim;
use fleet_core::task_state::TransitionError;
use fleet_core::task_store::{TaskPersistence, TaskStoreError};
use fleet_core::types::{ReviewReason, Task, TaskStatus};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::event_bus::EventBus;
use crate::events::OrchestratorEvent;
use crate::output_parser;
use crate::process::{SpawnError, SpawnRequest, WorkerControl, WorkerSpawner};
use crate::progress::ProgressTracker;
use crate::rate_limit::RateLimitDetector;

/// How long to keep reading output after the exit code arrives.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error("task {0} is not tracked by the orchestrator")]
    UnknownTask(Uuid),
    #[error("task {spec_id} cannot reach {to} from {from}")]
    Unreachable {
        spec_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error(transparent)]
    Persist(#[from] TaskStoreError),
    #[error("invalid rate-limit pattern: {0}")]
    Pattern(#[from] regex::Error),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

// ---------------------------------------------------------------------------
// Settings and spawn parameters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub worker_command: String,
    pub worker_args: Vec<String>,
    pub base_env: BTreeMap<String, String>,
    pub kill_grace: Duration,
    pub auto_swap_on_rate_limit: bool,
    pub output_tail_bytes: usize,
    pub rate_limit_fallback: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from(&OrchestratorConfig::default())
    }
}

impl From<&OrchestratorConfig> for OrchestratorSettings {
    fn from(cfg: &OrchestratorConfig) -> Self {
        Self {
            worker_command: cfg.worker_command.clone(),
            worker_args: cfg.worker_args.clone(),
            base_env: cfg.base_env.clone(),
            kill_grace: cfg.kill_grace(),
            auto_swap_on_rate_limit: cfg.auto_swap_on_rate_limit,
            output_tail_bytes: cfg.output_tail_bytes,
            rate_limit_fallback: cfg.rate_limit_fallback(),
        }
    }
}

/// What status a spawn moves the task into once the worker is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartMode {
    /// Leave the status alone.
    #[default]
    Keep,
    /// Walk legal transitions to `in_progress`.
    Walk,
    /// Set `in_progress` without consulting the table (stuck-task recovery).
    Force,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnSpec {
    pub work_dir: PathBuf,
    /// Appended to the configured worker arguments.
    pub args: Vec<String>,
    /// Layered over the base environment; profile credentials go on top.
    pub env: BTreeMap<String, String>,
    pub start: StartMode,
}

impl SpawnSpec {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            start: StartMode::Keep,
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_start(mut self, start: StartMode) -> Self {
        self.start = start;
        self
    }
}

/// Snapshot of a live worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    pub task_id: Uuid,
    pub spawn_id: u64,
    pub pid: Option<u32>,
    pub profile_id: Option<Uuid>,
    pub started_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

/// Bounded tail of a worker's output, kept for rate-limit detection.
#[derive(Debug, Default)]
struct OutputTail {
    buf: String,
    cap: usize,
}

impl OutputTail {
    fn new(cap: usize) -> Self {
        Self {
            buf: String::new(),
            cap,
        }
    }

    fn push_line(&mut self, line: &str) {
        self.buf.push_str(line);
        self.buf.push('\n');
        if self.buf.len() > self.cap {
            let mut cut = self.buf.len() - self.cap;
            while !self.buf.is_char_boundary(cut) {
                cut += 1;
            }
            self.buf.drain(..cut);
        }
    }
}

struct WorkerHandle {
    info: WorkerInfo,
    control: Arc<dyn WorkerControl>,
    spec: SpawnSpec,
    tracker: ProgressTracker,
    tail: OutputTail,
}

#[derive(Default)]
struct State {
    handles: HashMap<Uuid, WorkerHandle>,
    killed: HashSet<u64>,
    tasks: HashMap<Uuid, Task>,
}

struct Inner {
    id: Uuid,
    settings: OrchestratorSettings,
    spawner: Arc<dyn WorkerSpawner>,
    profiles: Arc<StdMutex<ProfileManager>>,
    persistence: Option<Arc<dyn TaskPersistence>>,
    detector: RateLimitDetector,
    events: EventBus,
    state: Mutex<State>,
    next_spawn_id: AtomicU64,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct OrchestratorBuilder {
    settings: OrchestratorSettings,
    spawner: Arc<dyn WorkerSpawner>,
    profiles: Option<Arc<StdMutex<ProfileManager>>>,
    persistence: Option<Arc<dyn TaskPersistence>>,
    events: Option<EventBus>,
}

impl OrchestratorBuilder {
    pub fn profiles(mut self, profiles: Arc<StdMutex<ProfileManager>>) -> Self {
        self.profiles = Some(profiles);
        self
    }

    pub fn persistence(mut self, persistence: Arc<dyn TaskPersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn event_bus(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> Result<WorkerOrchestrator> {
        let detector = RateLimitDetector::new(self.settings.rate_limit_fallback)?;
        Ok(WorkerOrchestrator {
            inner: Arc::new(Inner {
                id: Uuid::new_v4(),
                settings: self.settings,
                spawner: self.spawner,
                profiles: self
                    .profiles
                    .unwrap_or_else(|| Arc::new(StdMutex::new(ProfileManager::new()))),
                persistence: self.persistence,
                detector,
                events: self.events.unwrap_or_default(),
                state: Mutex::new(State::default()),
                next_spawn_id: AtomicU64::new(1),
            }),
        })
    }
}

// ---------------------------------------------------------------------------
// WorkerOrchestrator
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct WorkerOrchestrator {
    inner: Arc<Inner>,
}

impl WorkerOrchestrator {
    pub fn builder(settings: OrchestratorSettings, spawner: Arc<dyn WorkerSpawner>) -> OrchestratorBuilder {
        OrchestratorBuilder {
            settings,
            spawner,
            profiles: None,
            persistence: None,
            events: None,
        }
    }

    /// Identifies this orchestrator in worker claims.
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.inner.settings
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn subscribe(&self) -> flume::Receiver<OrchestratorEvent> {
        self.inner.events.subscribe()
    }

    pub fn profiles(&self) -> Arc<StdMutex<ProfileManager>> {
        self.inner.profiles.clone()
    }

    // -- task registry ------------------------------------------------------

    /// Start tracking `task`, or return the copy already tracked.
    ///
    /// The tracked copy is authoritative while the orchestrator runs; it is
    /// only replaced when no worker is live for it.
    pub async fn track(&self, task: Task) -> Task {
        let mut state = self.inner.state.lock().await;
        let live = state.handles.contains_key(&task.task_id);
        match state.tasks.get_mut(&task.task_id) {
            Some(existing) if live => existing.clone(),
            Some(existing) => {
                *existing = task.clone();
                task
            }
            None => {
                state.tasks.insert(task.task_id, task.clone());
                task
            }
        }
    }

    pub async fn task(&self, task_id: Uuid) -> Option<Task> {
        self.inner.state.lock().await.tasks.get(&task_id).cloned()
    }

    /// Apply a legal transition to a tracked task, persist it and announce it.
    pub async fn transition(
        &self,
        task_id: Uuid,
        to: TaskStatus,
        reason: Option<ReviewReason>,
    ) -> Result<Task> {
        let mut state = self.inner.state.lock().await;
        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or(OrchestratorError::UnknownTask(task_id))?;
        task.transition(to, reason)?;
        let task = task.clone();
        drop(state);
        self.announce_status(&task);
        self.persist(&task);
        Ok(task)
    }

    // -- worker lifecycle ---------------------------------------------------

    pub async fn has_live_worker(&self, task_id: Uuid) -> bool {
        self.inner.state.lock().await.handles.contains_key(&task_id)
    }

    pub async fn worker(&self, task_id: Uuid) -> Option<WorkerInfo> {
        let state = self.inner.state.lock().await;
        state.handles.get(&task_id).map(|h| h.info.clone())
    }

    pub async fn live_task_ids(&self) -> HashSet<Uuid> {
        self.inner.state.lock().await.handles.keys().copied().collect()
    }

    /// Start a worker for a tracked task, replacing any live one.
    ///
    /// Returns the new `spawn_id`. A spawn failure leaves the task's status
    /// untouched.
    pub async fn spawn(&self, task_id: Uuid, spec: SpawnSpec) -> Result<u64> {
        self.spawn_boxed(task_id, spec).await
    }

    // Boxed so the exit handler can respawn without a recursive future type.
    fn spawn_boxed(&self, task_id: Uuid, spec: SpawnSpec) -> BoxFuture<Result<u64>> {
        let this = self.clone();
        Box::pin(async move {
            let (span, trace_id) = fleet_telemetry::tracing_setup::create_task_span("worker_spawn", &task_id);
            this.spawn_inner(task_id, spec, trace_id).instrument(span).await
        })
    }

    async fn spawn_inner(&self, task_id: Uuid, spec: SpawnSpec, trace_id: String) -> Result<u64> {
        self.kill(task_id).await;

        let (spec_id, status) = {
            let state = self.inner.state.lock().await;
            let task = state.tasks.get(&task_id).ok_or(OrchestratorError::UnknownTask(task_id))?;
            (task.spec_id.clone(), task.status)
        };
        let steps = match spec.start {
            StartMode::Walk => status.path_to(TaskStatus::InProgress).ok_or_else(|| {
                OrchestratorError::Unreachable {
                    spec_id: spec_id.clone(),
                    from: status,
                    to: TaskStatus::InProgress,
                }
            })?,
            StartMode::Keep | StartMode::Force => Vec::new(),
        };

        let (profile_id, profile_env) = self.active_profile_env();
        let request = self.build_request(&spec, profile_env);
        let spawn_id = self.inner.next_spawn_id.fetch_add(1, Ordering::SeqCst);

        let worker = match self.inner.spawner.spawn(&request).await {
            Ok(worker) => worker,
            Err(e) => {
                error!(%task_id, %spec_id, program = %request.program, error = %e, "worker spawn failed");
                return Err(e.into());
            }
        };

        let mut state = self.inner.state.lock().await;
        // A concurrent spawn may have slipped in while we were starting.
        if let Some(prev) = state.handles.remove(&task_id) {
            state.killed.insert(prev.info.spawn_id);
            self.signal_kill(prev);
        }
        let info = WorkerInfo {
            task_id,
            spawn_id,
            pid: worker.pid,
            profile_id,
            started_at: Utc::now(),
        };
        state.handles.insert(
            task_id,
            WorkerHandle {
                info: info.clone(),
                control: worker.control,
                spec: spec.clone(),
                tracker: ProgressTracker::new(),
                tail: OutputTail::new(self.inner.settings.output_tail_bytes),
            },
        );

        let mut changed = Vec::new();
        if let Some(task) = state.tasks.get_mut(&task_id) {
            for step in steps {
                if let Err(e) = task.transition(step, None) {
                    // Status moved underneath us; the worker is already running.
                    warn!(%task_id, error = %e, "could not walk task to in_progress");
                    break;
                }
                changed.push(task.clone());
            }
            if spec.start == StartMode::Force {
                task.force_status(TaskStatus::InProgress, None);
                changed.push(task.clone());
            }
        }
        drop(state);

        self.claim(&spec_id, &info);
        for task in &changed {
            self.announce_status(task);
        }
        if let Some(task) = changed.last() {
            self.persist(task);
        }

        info!(%task_id, %spec_id, spawn_id, pid = ?worker.pid, profile_id = ?profile_id, %trace_id, "worker spawned");
        tokio::spawn(
            self.clone()
                .pump(task_id, spawn_id, worker.output, worker.exit)
                .in_current_span(),
        );
        Ok(spawn_id)
    }

    /// Stop the live worker for `task_id`, if any.
    ///
    /// The spawn is marked killed before it is signalled so its exit is
    /// recognised as deliberate. Returns whether a worker was live.
    pub async fn kill(&self, task_id: Uuid) -> bool {
        let (handle, spec_id) = {
            let mut state = self.inner.state.lock().await;
            let Some(handle) = state.handles.remove(&task_id) else {
                return false;
            };
            state.killed.insert(handle.info.spawn_id);
            let spec_id = state.tasks.get(&task_id).map(|t| t.spec_id.clone());
            (handle, spec_id)
        };
        info!(%task_id, spawn_id = handle.info.spawn_id, "killing worker");
        if let Some(spec_id) = spec_id {
            self.release(&spec_id, handle.info.spawn_id);
        }
        self.signal_kill(handle);
        true
    }

    pub async fn kill_all(&self) -> usize {
        let ids: Vec<Uuid> = self.inner.state.lock().await.handles.keys().copied().collect();
        let mut killed = 0;
        for task_id in ids {
            if self.kill(task_id).await {
                killed += 1;
            }
        }
        killed
    }

    fn signal_kill(&self, handle: WorkerHandle) {
        handle.control.terminate();
        let control = handle.control;
        let grace = self.inner.settings.kill_grace;
        let spawn_id = handle.info.spawn_id;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if !control.has_exited() {
                warn!(spawn_id, grace_secs = grace.as_secs_f64(), "worker ignored terminate, forcing kill");
                control.force_kill();
            }
        });
    }

    // -- output and exit ----------------------------------------------------

    async fn pump(
        self,
        task_id: Uuid,
        spawn_id: u64,
        output: flume::Receiver<String>,
        exit: flume::Receiver<i32>,
    ) {
        let code = loop {
            tokio::select! {
                biased;
                line = output.recv_async() => match line {
                    Ok(line) => self.on_output(task_id, spawn_id, line).await,
                    Err(_) => break exit.recv_async().await.unwrap_or(-1),
                },
                code = exit.recv_async() => {
                    let code = code.unwrap_or(-1);
                    let drain = async {
                        while let Ok(line) = output.recv_async().await {
                            self.on_output(task_id, spawn_id, line).await;
                        }
                    };
                    if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, drain).await.is_err() {
                        debug!(%task_id, spawn_id, "worker output still open after exit");
                    }
                    break code;
                }
            }
        };
        self.on_exit(task_id, spawn_id, code).await;
    }

    async fn on_output(&self, task_id: Uuid, spawn_id: u64, line: String) {
        let snapshot = {
            let mut state = self.inner.state.lock().await;
            let state = &mut *state;
            let Some(handle) = state.handles.get_mut(&task_id).filter(|h| h.info.spawn_id == spawn_id) else {
                return;
            };
            handle.tail.push_line(&line);
            let update = output_parser::parse_line(&line);
            self.inner.events.publish(OrchestratorEvent::Log {
                task_id,
                text: line,
            });
            let Some(update) = update else {
                return;
            };

            let previous_phase = handle.tracker.progress().phase;
            let progress = handle.tracker.apply(&update).clone();
            self.inner.events.publish(OrchestratorEvent::Progress {
                task_id,
                phase: progress.phase,
                percent: progress.overall_percent,
                message: progress.message.clone(),
            });
            let phase_changed = progress.phase != previous_phase;
            let Some(task) = state.tasks.get_mut(&task_id) else {
                return;
            };
            task.execution_progress = progress;
            task.updated_at = Utc::now();
            // In-phase ticks stay in memory; the next phase or exit writes them.
            if !phase_changed {
                return;
            }
            task.clone()
        };
        self.persist_progress(snapshot).await;
    }

    async fn on_exit(&self, task_id: Uuid, spawn_id: u64, code: i32) {
        let mut state = self.inner.state.lock().await;
        if state.killed.remove(&spawn_id) {
            debug!(%task_id, spawn_id, code, "exit of killed worker ignored");
            return;
        }
        let current = state.handles.get(&task_id).map(|h| h.info.spawn_id);
        if current != Some(spawn_id) {
            debug!(%task_id, spawn_id, current = ?current, "stale worker exit discarded");
            return;
        }
        let Some(mut handle) = state.handles.remove(&task_id) else {
            return;
        };
        info!(%task_id, spawn_id, code, "worker exited");
        if let Some(spec_id) = state.tasks.get(&task_id).map(|t| t.spec_id.clone()) {
            self.release(&spec_id, spawn_id);
        }

        let progress = handle.tracker.finish(code).clone();
        self.inner.events.publish(OrchestratorEvent::Progress {
            task_id,
            phase: progress.phase,
            percent: progress.overall_percent,
            message: progress.message.clone(),
        });
        if let Some(task) = state.tasks.get_mut(&task_id) {
            task.execution_progress = progress;
        }

        if code == 0 {
            self.finish_task(&mut state, task_id, TaskStatus::HumanReview, ReviewReason::Completed);
            drop(state);
            self.inner.events.publish(OrchestratorEvent::Exit { task_id, code });
            return;
        }

        let now = Local::now();
        let Some(signal) = self.inner.detector.detect(&handle.tail.buf, &now) else {
            self.finish_task(&mut state, task_id, TaskStatus::Error, ReviewReason::Errors);
            drop(state);
            self.inner.events.publish(OrchestratorEvent::Exit { task_id, code });
            return;
        };

        let profile_id = handle.info.profile_id;
        let suggested = self.record_rate_limit(profile_id, signal.reset_at);
        warn!(
            %task_id,
            spawn_id,
            profile_id = ?profile_id,
            suggested_profile_id = ?suggested,
            reset_at = %signal.reset_at,
            matched = %signal.matched,
            "worker hit a rate limit"
        );
        self.inner.events.publish(OrchestratorEvent::RateLimited {
            task_id,
            profile_id,
            reset_at: signal.reset_at,
            suggested_profile_id: suggested,
        });

        if let (true, Some(next)) = (self.inner.settings.auto_swap_on_rate_limit, suggested) {
            if self.activate_profile(next) {
                drop(state);
                let spec = std::mem::replace(&mut handle.spec, SpawnSpec::new(PathBuf::new()))
                    .with_start(StartMode::Keep);
                match self.spawn_boxed(task_id, spec).await {
                    Ok(new_spawn) => {
                        info!(%task_id, new_spawn, profile_id = %next, "respawned on another profile");
                        return;
                    }
                    Err(e) => {
                        error!(%task_id, error = %e, "respawn after profile swap failed");
                        let mut state = self.inner.state.lock().await;
                        self.finish_task(&mut state, task_id, TaskStatus::HumanReview, ReviewReason::RateLimited);
                        drop(state);
                        self.inner.events.publish(OrchestratorEvent::Exit { task_id, code });
                        return;
                    }
                }
            }
        }

        self.finish_task(&mut state, task_id, TaskStatus::HumanReview, ReviewReason::RateLimited);
        drop(state);
        self.inner.events.publish(OrchestratorEvent::Exit { task_id, code });
    }

    fn finish_task(&self, state: &mut State, task_id: Uuid, to: TaskStatus, reason: ReviewReason) {
        let Some(task) = state.tasks.get_mut(&task_id) else {
            return;
        };
        match task.transition(to, Some(reason)) {
            Ok(_) => self.announce_status(task),
            Err(e) => warn!(%task_id, error = %e, "worker exit left status unchanged"),
        }
        self.persist(task);
    }

    // -- profiles -----------------------------------------------------------

    fn lock_profiles(&self) -> MutexGuard<'_, ProfileManager> {
        self.inner.profiles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn active_profile_env(&self) -> (Option<Uuid>, Vec<(String, String)>) {
        let mut profiles = self.lock_profiles();
        let Some((id, env)) = profiles.active().map(|p| (p.id, p.credential.worker_env())) else {
            return (None, Vec::new());
        };
        if let Err(e) = profiles.mark_used(id).and_then(|_| profiles.save()) {
            warn!(profile_id = %id, error = %e, "failed to record profile use");
        }
        (Some(id), env)
    }

    /// Mark `profile_id` limited and pick a replacement.
    fn record_rate_limit(&self, profile_id: Option<Uuid>, reset_at: DateTime<Utc>) -> Option<Uuid> {
        let mut profiles = self.lock_profiles();
        if let Some(id) = profile_id {
            if let Err(e) = profiles.record_rate_limit_event(id, reset_at) {
                warn!(profile_id = %id, error = %e, "failed to record rate limit");
            }
        }
        profiles.refresh_limits(Utc::now());
        if let Err(e) = profiles.save() {
            warn!(error = %e, "failed to save profiles");
        }
        profiles.get_best_available_profile(profile_id).map(|p| p.id)
    }

    fn activate_profile(&self, id: Uuid) -> bool {
        let mut profiles = self.lock_profiles();
        match profiles.set_active_profile(id).and_then(|_| profiles.save()) {
            Ok(()) => true,
            Err(e) => {
                warn!(profile_id = %id, error = %e, "failed to switch profile");
                false
            }
        }
    }

    // -- helpers ------------------------------------------------------------

    fn build_request(&self, spec: &SpawnSpec, profile_env: Vec<(String, String)>) -> SpawnRequest {
        let settings = &self.inner.settings;
        let mut env = settings.base_env.clone();
        env.extend(spec.env.clone());
        env.extend(profile_env);
        let args = settings
            .worker_args
            .iter()
            .chain(spec.args.iter())
            .map(|arg| expand_placeholders(arg, spec))
            .collect();
        SpawnRequest {
            program: settings.worker_command.clone(),
            args,
            work_dir: spec.work_dir.clone(),
            env,
        }
    }

    fn announce_status(&self, task: &Task) {
        self.inner.events.publish(OrchestratorEvent::StatusChange {
            task_id: task.task_id,
            status: task.status,
            reason: task.review_reason,
        });
    }

    fn persist(&self, task: &Task) {
        if let Some(persistence) = &self.inner.persistence {
            if let Err(e) = persistence.persist(task) {
                warn!(task_id = %task.task_id, spec_id = %task.spec_id, error = %e, "failed to persist task state");
            }
        }
    }

    async fn persist_progress(&self, task: Task) {
        let Some(persistence) = self.inner.persistence.clone() else {
            return;
        };
        let (task_id, spec_id) = (task.task_id, task.spec_id.clone());
        match tokio::task::spawn_blocking(move || persistence.persist_progress(&task)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(%task_id, %spec_id, error = %e, "failed to persist task progress"),
            Err(e) => warn!(%task_id, %spec_id, error = %e, "progress write did not complete"),
        }
    }

    fn claim(&self, spec_id: &str, info: &WorkerInfo) {
        let Some(persistence) = &self.inner.persistence else {
            return;
        };
        let claim = WorkerClaim {
            orchestrator_id: self.inner.id,
            owner_pid: std::process::id(),
            spawn_id: info.spawn_id,
            worker_pid: info.pid,
            started_at: info.started_at,
        };
        if let Err(e) = persistence.claim_worker(spec_id, &claim) {
            warn!(task_id = %info.task_id, %spec_id, error = %e, "failed to record worker claim");
        }
    }

    fn release(&self, spec_id: &str, spawn_id: u64) {
        if let Some(persistence) = &self.inner.persistence {
            if let Err(e) = persistence.release_worker(spec_id, self.inner.id, spawn_id) {
                warn!(%spec_id, spawn_id, error = %e, "failed to release worker claim");
            }
        }
    }
}

/// Environment keys the task runner sets for every worker.
pub const ENV_TASK_ID: &str = "FLEET_TASK_ID";
pub const ENV_SPEC_ID: &str = "FLEET_SPEC_ID";
pub const ENV_SPEC_DIR: &str = "FLEET_SPEC_DIR";
pub const ENV_PROJECT_ROOT: &str = "FLEET_PROJECT_ROOT";

/// Expand `{work_dir}`, `{task_id}`, `{spec_id}`, `{spec_dir}` and
/// `{project_root}` in a worker argument.
pub fn expand_placeholders(arg: &str, spec: &SpawnSpec) -> String {
    if !arg.contains('{') {
        return arg.to_string();
    }
    let lookup = |key: &str| spec.env.get(key).map(String::as_str).unwrap_or_default();
    arg.replace("{work_dir}", &spec.work_dir.to_string_lossy())
        .replace("{task_id}", lookup(ENV_TASK_ID))
        .replace("{spec_id}", lookup(ENV_SPEC_ID))
        .replace("{spec_dir}", lookup(ENV_SPEC_DIR))
        .replace("{project_root}", lookup(ENV_PROJECT_ROOT))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_expand_from_spawn_env() {
        let spec = SpawnSpec::new("/tmp/wt/001-a")
            .with_env(ENV_SPEC_ID, "001-a")
            .with_env(ENV_SPEC_DIR, "/tmp/wt/001-a/.fleet/specs/001-a");
        assert_eq!(expand_placeholders("--spec={spec_id}", &spec), "--spec=001-a");
        assert_eq!(
            expand_placeholders("{spec_dir}/plan.md", &spec),
            "/tmp/wt/001-a/.fleet/specs/001-a/plan.md"
        );
        assert_eq!(expand_placeholders("{work_dir}", &spec), "/tmp/wt/001-a");
        assert_eq!(expand_placeholders("{task_id}", &spec), "");
        assert_eq!(expand_placeholders("-p", &spec), "-p");
    }

    #[test]
    fn output_tail_keeps_the_end() {
        let mut tail = OutputTail::new(16);
        tail.push_line("0123456789");
        tail.push_line("abcdefghij");
        assert_eq!(tail.buf.len(), 16);
        assert!(tail.buf.ends_with("abcdefghij\n"));
    }

    #[test]
    fn output_tail_cuts_on_char_boundary() {
        let mut tail = OutputTail::new(5);
        tail.push_line("ééé");
        assert!(tail.buf.len() <= 6);
        assert!(tail.buf.ends_with("é\n"));
    }

    #[test]
    fn settings_follow_config() {
        let cfg = OrchestratorConfig {
            kill_grace_secs: 2,
            auto_swap_on_rate_limit: false,
            ..OrchestratorConfig::default()
        };
        let settings = OrchestratorSettings::from(&cfg);
        assert_eq!(settings.kill_grace, Duration::from_secs(2));
        assert!(!settings.auto_swap_on_rate_limit);
        assert_eq!(settings.worker_command, "claude");
    }
}
