//! Scripted worker spawner shared by the orchestrator and runner tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fleet_agents::events::OrchestratorEvent;
use fleet_agents::orchestrator::OrchestratorSettings;
use fleet_agents::process::{SpawnError, SpawnRequest, SpawnedWorker, WorkerControl, WorkerSpawner};

const WAIT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Mock worker
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MockControl {
    pub terminated: AtomicBool,
    pub force_killed: AtomicBool,
    exited: AtomicBool,
}

impl WorkerControl for MockControl {
    fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
    }

    fn force_kill(&self) {
        self.force_killed.store(true, Ordering::SeqCst);
    }

    fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }
}

/// The test's end of a spawned worker.
pub struct MockWorker {
    pub request: SpawnRequest,
    pub control: Arc<MockControl>,
    output: Option<flume::Sender<String>>,
    exit: flume::Sender<i32>,
}

impl MockWorker {
    pub fn line(&self, text: &str) {
        if let Some(tx) = &self.output {
            tx.send(text.to_string()).unwrap();
        }
    }

    /// Close the output stream and report `code`.
    pub fn exit(mut self, code: i32) {
        self.output.take();
        self.control.exited.store(true, Ordering::SeqCst);
        self.exit.send(code).unwrap();
    }

    pub fn env(&self, key: &str) -> Option<&str> {
        self.request.env.get(key).map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// Mock spawner
// ---------------------------------------------------------------------------

pub struct MockSpawner {
    spawned: flume::Sender<MockWorker>,
    fail_next: Mutex<Option<SpawnError>>,
    count: AtomicUsize,
}

impl MockSpawner {
    pub fn new() -> (Arc<Self>, flume::Receiver<MockWorker>) {
        let (tx, rx) = flume::unbounded();
        let spawner = Arc::new(Self {
            spawned: tx,
            fail_next: Mutex::new(None),
            count: AtomicUsize::new(0),
        });
        (spawner, rx)
    }

    pub fn fail_next(&self, err: SpawnError) {
        *self.fail_next.lock().unwrap() = Some(err);
    }

    pub fn spawn_count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl WorkerSpawner for MockSpawner {
    async fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedWorker, SpawnError> {
        if let Some(err) = self.fail_next.lock().unwrap().take() {
            return Err(err);
        }
        self.count.fetch_add(1, Ordering::SeqCst);
        let (out_tx, out_rx) = flume::unbounded();
        let (exit_tx, exit_rx) = flume::bounded(1);
        let control = Arc::new(MockControl::default());
        self.spawned
            .send(MockWorker {
                request: request.clone(),
                control: control.clone(),
                output: Some(out_tx),
                exit: exit_tx,
            })
            .unwrap();
        Ok(SpawnedWorker {
            // The test process itself, so liveness checks on the pid pass.
            pid: Some(std::process::id()),
            output: out_rx,
            exit: exit_rx,
            control,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub fn settings() -> OrchestratorSettings {
    OrchestratorSettings {
        worker_command: "worker".into(),
        worker_args: vec!["--spec".into(), "{spec_id}".into()],
        kill_grace: Duration::from_millis(50),
        ..OrchestratorSettings::default()
    }
}

pub async fn next_worker(rx: &flume::Receiver<MockWorker>) -> MockWorker {
    tokio::time::timeout(WAIT, rx.recv_async())
        .await
        .expect("timed out waiting for a spawn")
        .unwrap()
}

/// Receive events until one matches `pred`; earlier ones are returned too.
pub async fn wait_for(
    rx: &flume::Receiver<OrchestratorEvent>,
    pred: impl Fn(&OrchestratorEvent) -> bool,
) -> Vec<OrchestratorEvent> {
    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(WAIT, rx.recv_async())
            .await
            .unwrap_or_else(|_| panic!("timed out; saw {seen:?}"))
            .unwrap();
        let done = pred(&event);
        seen.push(event);
        if done {
            return seen;
        }
    }
}

/// Everything published within `window`.
pub async fn quiet_period(rx: &flume::Receiver<OrchestratorEvent>, window: Duration) -> Vec<OrchestratorEvent> {
    let mut seen = Vec::new();
    let deadline = tokio::time::Instant::now() + window;
    while let Ok(Ok(event)) = tokio::time::timeout_at(deadline, rx.recv_async()).await {
        seen.push(event);
    }
    seen
}

pub fn is_exit(event: &OrchestratorEvent) -> bool {
    matches!(event, OrchestratorEvent::Exit { .. })
}

pub fn is_status_or_exit(event: &OrchestratorEvent) -> bool {
    matches!(
        event,
        OrchestratorEvent::Exit { .. } | OrchestratorEvent::StatusChange { .. }
    )
}
