use fleet_core::worktree::{DiffStats, MergeOptions, MergeOutcome};

use super::{print_json, CliContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkspaceAction {
    Status,
    Diff,
    Preview,
    Merge { stage_only: bool },
    Discard,
}

/// Run a `workspace` subcommand. `status` without a task lists every workspace.
pub fn run(ctx: &CliContext, action: WorkspaceAction, key: Option<&str>) -> anyhow::Result<()> {
    let engine = ctx.workspaces();

    let Some(key) = key else {
        if action != WorkspaceAction::Status {
            anyhow::bail!("a task is required for this workspace command");
        }
        let states = engine.list()?;
        if ctx.json {
            return print_json(&states);
        }
        if states.is_empty() {
            println!("No workspaces.");
        }
        for state in &states {
            println!("{:<32} {:<40} {}", state.spec_id, state.branch, state.path.display());
        }
        return Ok(());
    };

    let spec_id = ctx.store.resolve(key)?.spec_id;
    match action {
        WorkspaceAction::Status => {
            let status = engine.status(&spec_id)?;
            if ctx.json {
                return print_json(&status);
            }
            println!("{} on {} (from {})", spec_id, status.state.branch, status.state.base_branch);
            if !status.state.exists {
                println!("  workspace does not exist");
            }
            println!("  {}", stats_line(&status.stats));
        }
        WorkspaceAction::Diff => {
            let diff = engine.diff(&spec_id)?;
            if ctx.json {
                return print_json(&diff);
            }
            println!("{}", stats_line(&diff.stats));
            for file in &diff.files {
                let path = match &file.old_path {
                    Some(old) => format!("{old} -> {}", file.path),
                    None => file.path.clone(),
                };
                println!("  {:<9} +{:<5} -{:<5} {path}", format!("{:?}", file.kind).to_lowercase(), file.additions, file.deletions);
            }
        }
        WorkspaceAction::Preview => {
            let preview = engine.merge_preview(&spec_id)?;
            if ctx.json {
                return print_json(&preview);
            }
            println!("{}", stats_line(&preview.stats));
            println!("  {} commit(s) behind {}", preview.commits_behind, preview.state.base_branch);
            if preview.is_blocked() {
                println!("  blocked by uncommitted changes in the project root:");
                for path in &preview.uncommitted_changes {
                    println!("    {path}");
                }
            }
            if preview.has_conflicts() {
                println!("  conflicting files:");
                for path in &preview.conflicts {
                    println!("    {path}");
                }
            }
            println!("  can merge: {}", if preview.can_merge() { "yes" } else { "no" });
        }
        WorkspaceAction::Merge { stage_only } => {
            let (span, trace_id) = fleet_telemetry::tracing_setup::create_task_span("workspace_merge", &spec_id);
            let outcome = span.in_scope(|| {
                tracing::info!(%spec_id, stage_only, %trace_id, "merging workspace");
                engine.merge(&spec_id, MergeOptions { stage_only })
            })?;
            let finished = match &outcome {
                MergeOutcome::Merged { .. } => ctx.store.complete_merged(&spec_id)?,
                _ => None,
            };
            if ctx.json {
                return print_json(&outcome);
            }
            match outcome {
                MergeOutcome::Merged { commit } => {
                    println!("Merged {spec_id}{}", commit.map(|c| format!(" at {c}")).unwrap_or_default());
                    if let Some(task) = finished {
                        println!("  task is now {}", task.status);
                    }
                }
                MergeOutcome::Staged { files } => println!("Staged {} file(s) from {spec_id}", files.len()),
                MergeOutcome::NothingToMerge => println!("Nothing to merge for {spec_id}"),
                MergeOutcome::Conflict { files } => {
                    println!("Merge of {spec_id} conflicts:");
                    for file in files {
                        println!("  {file}");
                    }
                }
                MergeOutcome::Blocked { uncommitted } => {
                    println!("Merge blocked by uncommitted changes in the project root:");
                    for path in uncommitted {
                        println!("  {path}");
                    }
                }
            }
        }
        WorkspaceAction::Discard => {
            let outcome = engine.discard(&spec_id)?;
            if ctx.json {
                return print_json(&outcome);
            }
            println!("Discarded workspace for {spec_id}: {outcome:?}");
        }
    }
    Ok(())
}

fn stats_line(stats: &DiffStats) -> String {
    format!(
        "{} file(s) changed, +{} -{}, {} commit(s)",
        stats.files_changed, stats.additions, stats.deletions, stats.commit_count
    )
}
