pub mod create;
pub mod next_spec;
pub mod orphans;
pub mod profiles;
pub mod recover;
pub mod review;
pub mod run;
pub mod status;
pub mod task;
pub mod workspace;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use fleet_agents::orchestrator::{OrchestratorSettings, WorkerOrchestrator};
use fleet_agents::process::ProcessSpawner;
use fleet_agents::runner::TaskRunner;
use fleet_core::config::Config;
use fleet_core::profiles::ProfileManager;
use fleet_core::task_store::TaskStore;
use fleet_core::worktree_manager::WorkspaceEngine;

/// Everything a subcommand needs about the project it runs against.
pub struct CliContext {
    pub config: Config,
    pub root: PathBuf,
    pub store: TaskStore,
    pub json: bool,
}

impl CliContext {
    pub fn load(project: &Path, config_path: Option<&Path>, json: bool) -> anyhow::Result<Self> {
        let config = match config_path {
            Some(path) => Config::load_from(path)
                .with_context(|| format!("failed to load config from {}", path.display()))?,
            None => Config::load().context("failed to load config")?,
        };
        let root = project
            .canonicalize()
            .with_context(|| format!("project root {} is not accessible", project.display()))?;
        let store = TaskStore::from_config(&root, &config);
        Ok(Self {
            config,
            root,
            store,
            json,
        })
    }

    pub fn workspaces(&self) -> WorkspaceEngine {
        WorkspaceEngine::new(self.store.layout().clone(), self.config.workspaces.clone())
    }

    pub fn profiles_path(&self) -> PathBuf {
        self.config.profiles.resolved_store_path()
    }

    pub fn load_profiles(&self) -> anyhow::Result<ProfileManager> {
        let path = self.profiles_path();
        ProfileManager::load(&path)
            .with_context(|| format!("failed to load profiles from {}", path.display()))
    }

    /// A runner wired to real worker processes and the profile store.
    pub fn runner(&self) -> anyhow::Result<TaskRunner> {
        let profiles = Arc::new(Mutex::new(self.load_profiles()?));
        let orchestrator = WorkerOrchestrator::builder(
            OrchestratorSettings::from(&self.config.orchestrator),
            Arc::new(ProcessSpawner),
        )
        .profiles(profiles)
        .persistence(Arc::new(self.store.clone()))
        .build()
        .context("failed to build orchestrator")?;
        Ok(TaskRunner::new(
            self.store.clone(),
            Arc::new(self.workspaces()),
            orchestrator,
        ))
    }
}

pub fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
