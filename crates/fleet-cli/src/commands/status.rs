use fleet_core::types::{Task, TaskStatus};

use super::{print_json, CliContext};

/// Run the `status` subcommand: one line per task, grouped counts at the end.
pub fn run(ctx: &CliContext, all: bool) -> anyhow::Result<()> {
    let tasks = if all {
        ctx.store.list_tasks()?
    } else {
        ctx.store.list_active()?
    };

    if ctx.json {
        return print_json(&tasks);
    }

    println!("{}  ({})", ctx.config.general.project_name, ctx.root.display());
    println!("{}", "-".repeat(60));
    if tasks.is_empty() {
        println!("No tasks.");
        return Ok(());
    }
    for task in &tasks {
        println!("{}", task_line(task));
    }
    println!("{}", "-".repeat(60));
    for status in TaskStatus::ALL {
        let count = tasks.iter().filter(|t| t.status == status).count();
        if count > 0 {
            println!("  {:<14}{count}", format!("{status}:"));
        }
    }
    Ok(())
}

pub fn task_line(task: &Task) -> String {
    let mut line = format!(
        "{:<32} {:<13} {:>3}%  {}",
        task.spec_id, task.status, task.execution_progress.overall_percent, task.title
    );
    if let Some(reason) = task.review_reason {
        line.push_str(&format!("  [{reason}]"));
    }
    if task.is_archived() {
        line.push_str("  (archived)");
    }
    line
}
