use fleet_core::task_store::NewTask;

use super::{print_json, CliContext};

#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub title: String,
    pub description: Option<String>,
    pub source_ref: Option<String>,
    pub base_branch: Option<String>,
    pub tags: Vec<String>,
}

/// Run the `create` subcommand: allocate a spec number and write the task records.
pub fn run(ctx: &CliContext, opts: CreateOptions) -> anyhow::Result<()> {
    if opts.title.trim().is_empty() {
        anyhow::bail!("task title must not be empty");
    }
    let task = ctx.store.create_task(NewTask {
        description: opts.description,
        source_ref: opts.source_ref,
        base_branch: opts.base_branch,
        tags: opts.tags,
        ..NewTask::titled(opts.title)
    })?;

    if ctx.json {
        return print_json(&task);
    }
    println!("Created {} ({})", task.spec_id, task.task_id);
    println!("  {}", ctx.store.layout().spec_dir(&task.spec_id).display());
    Ok(())
}
