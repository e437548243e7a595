mod commands;

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use commands::create::CreateOptions;
use commands::profiles::ProfileAction;
use commands::review::ReviewAction;
use commands::workspace::WorkspaceAction;
use commands::CliContext;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// fleet -- run coding-agent tasks in isolated workspaces.
#[derive(Debug, Parser)]
#[command(name = "fleet", version, about)]
struct Cli {
    /// Project root.
    #[arg(short, long, global = true, default_value = ".")]
    project: PathBuf,

    /// Config file (defaults to ~/.fleet/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print machine-readable JSON.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Show tasks (default when no subcommand is given).
    Status {
        /// Include archived tasks.
        #[arg(long)]
        all: bool,
    },

    /// Create a task and allocate its spec number.
    Create {
        title: String,
        #[arg(short, long)]
        description: Option<String>,
        /// Origin marker; a second task from the same source is refused.
        #[arg(long)]
        source_ref: Option<String>,
        #[arg(long)]
        base_branch: Option<String>,
        #[arg(long = "tag")]
        tags: Vec<String>,
    },

    /// Show the next spec number without claiming it.
    NextSpec {
        /// Show the full spec id this title would get.
        title: Option<String>,
    },

    /// Start a task's worker and follow it. Ctrl-c stops it.
    Run {
        /// Spec id, spec number or task id.
        task: String,
    },

    /// List stuck tasks, or respawn one.
    Recover { task: Option<String> },

    /// Approve, reject or record a pull request for a reviewed task.
    Review {
        #[command(subcommand)]
        command: ReviewCommand,
    },

    /// Archive a task (reversible).
    Archive { task: String },

    /// Restore an archived task.
    Unarchive { task: String },

    /// Inspect, merge or discard a task's workspace.
    Workspace {
        #[command(subcommand)]
        command: WorkspaceCommand,
    },

    /// List workspaces whose task no longer exists.
    Orphans {
        /// Remove them.
        #[arg(long)]
        clean: bool,
    },

    /// Manage credential profiles.
    Profiles {
        #[command(subcommand)]
        command: Option<ProfilesCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum ReviewCommand {
    /// Mark the task done.
    Approve { task: String },
    /// Send the task back to the backlog.
    Reject {
        task: String,
        /// Start a fresh worker on it right away instead.
        #[arg(long)]
        rework: bool,
    },
    /// Record the pull request opened for the task.
    Pr { task: String, url: String },
}

#[derive(Debug, Subcommand)]
enum WorkspaceCommand {
    /// Show a workspace, or list all of them.
    Status { task: Option<String> },
    /// Changed files against the base branch.
    Diff { task: String },
    /// Dry-run a merge: blockers, conflicts and commits behind.
    Preview { task: String },
    /// Merge the workspace into the base branch.
    Merge {
        task: String,
        /// Stage the changes in the project root without committing.
        #[arg(long)]
        stage_only: bool,
    },
    /// Remove the workspace and its branch.
    Discard { task: String },
}

#[derive(Debug, Subcommand)]
enum ProfilesCommand {
    /// List profiles (default).
    List,
    /// Add a profile.
    Add {
        name: String,
        /// Worker config directory holding a logged-in session.
        #[arg(long, conflicts_with = "token_env")]
        config_dir: Option<PathBuf>,
        /// Environment variable holding an OAuth token.
        #[arg(long)]
        token_env: Option<String>,
        /// Make this the default profile.
        #[arg(long)]
        default: bool,
    },
    /// Make a profile active.
    Use { profile: String },
    /// Mark a profile rate limited.
    Limit {
        profile: String,
        /// Reset time (RFC 3339).
        #[arg(long, conflicts_with = "minutes")]
        until: Option<DateTime<Utc>>,
        /// Reset after this many minutes.
        #[arg(long)]
        minutes: Option<i64>,
    },
    /// Clear a profile's rate limit.
    Clear { profile: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let ctx = CliContext::load(&cli.project, cli.config.as_deref(), cli.json)?;
    fleet_telemetry::logging::init(
        "fleet",
        &ctx.config.general.log_level,
        fleet_telemetry::logging::LogFormat::from_config(&ctx.config.general.log_format),
    );

    match cli.command {
        None => commands::status::run(&ctx, false)?,
        Some(Commands::Status { all }) => commands::status::run(&ctx, all)?,
        Some(Commands::Create {
            title,
            description,
            source_ref,
            base_branch,
            tags,
        }) => commands::create::run(
            &ctx,
            CreateOptions {
                title,
                description,
                source_ref,
                base_branch,
                tags,
            },
        )?,
        Some(Commands::NextSpec { title }) => commands::next_spec::run(&ctx, title.as_deref())?,
        Some(Commands::Run { task }) => commands::run::run(&ctx, &task).await?,
        Some(Commands::Recover { task }) => commands::recover::run(&ctx, task.as_deref()).await?,
        Some(Commands::Review { command }) => {
            let (task, action) = match command {
                ReviewCommand::Approve { task } => (task, ReviewAction::Approve),
                ReviewCommand::Reject { task, rework } => (task, ReviewAction::Reject { rework }),
                ReviewCommand::Pr { task, url } => (task, ReviewAction::PullRequest { url }),
            };
            commands::review::run(&ctx, &task, action).await?
        }
        Some(Commands::Archive { task }) => commands::task::set_archived(&ctx, &task, true)?,
        Some(Commands::Unarchive { task }) => commands::task::set_archived(&ctx, &task, false)?,
        Some(Commands::Workspace { command }) => {
            let (action, task) = match command {
                WorkspaceCommand::Status { task } => (WorkspaceAction::Status, task),
                WorkspaceCommand::Diff { task } => (WorkspaceAction::Diff, Some(task)),
                WorkspaceCommand::Preview { task } => (WorkspaceAction::Preview, Some(task)),
                WorkspaceCommand::Merge { task, stage_only } => {
                    (WorkspaceAction::Merge { stage_only }, Some(task))
                }
                WorkspaceCommand::Discard { task } => (WorkspaceAction::Discard, Some(task)),
            };
            commands::workspace::run(&ctx, action, task.as_deref())?
        }
        Some(Commands::Orphans { clean }) => commands::orphans::run(&ctx, clean)?,
        Some(Commands::Profiles { command }) => {
            let action = match command.unwrap_or(ProfilesCommand::List) {
                ProfilesCommand::List => ProfileAction::List,
                ProfilesCommand::Add {
                    name,
                    config_dir,
                    token_env,
                    default,
                } => ProfileAction::Add {
                    name,
                    config_dir,
                    token_env,
                    default,
                },
                ProfilesCommand::Use { profile } => ProfileAction::Use { profile },
                ProfilesCommand::Limit {
                    profile,
                    until,
                    minutes,
                } => ProfileAction::Limit {
                    profile,
                    until,
                    minutes,
                },
                ProfilesCommand::Clear { profile } => ProfileAction::Clear { profile },
            };
            commands::profiles::run(&ctx, action)?
        }
    }

    Ok(())
}
