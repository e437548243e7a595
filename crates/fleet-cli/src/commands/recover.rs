use anyhow::Context;

use super::{print_json, run::follow, CliContext};

/// Run the `recover` subcommand.
///
/// Without a task, list tasks that are `in_progress` with no worker behind
/// them. With one, respawn its worker and follow it like `run`.
pub async fn run(ctx: &CliContext, key: Option<&str>) -> anyhow::Result<()> {
    let runner = ctx.runner()?;
    let Some(key) = key else {
        let report = runner.reconcile().await?;
        if ctx.json {
            return print_json(&report);
        }
        if report.is_clean() {
            println!("No stuck tasks ({} checked).", report.checked);
        } else {
            for stuck in &report.stuck {
                println!("{:<32} stuck since {}", stuck.spec_id, stuck.since);
            }
        }
        return Ok(());
    };

    let events = runner.orchestrator().subscribe();
    let started = runner
        .recover_stuck(key)
        .await
        .with_context(|| format!("failed to recover task {key}"))?;
    follow(ctx, &runner, &started, events).await
}
