use anyhow::Context;

use super::{print_json, run::follow, status::task_line, CliContext};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewAction {
    Approve,
    Reject { rework: bool },
    PullRequest { url: String },
}

/// Run a `review` subcommand. `reject --rework` follows the new worker like `run`.
pub async fn run(ctx: &CliContext, key: &str, action: ReviewAction) -> anyhow::Result<()> {
    let runner = ctx.runner()?;
    let task = match action {
        ReviewAction::Approve => runner.approve(key).await,
        ReviewAction::Reject { rework: false } => runner.reject(key).await,
        ReviewAction::Reject { rework: true } => {
            let events = runner.orchestrator().subscribe();
            let started = runner
                .rework(key)
                .await
                .with_context(|| format!("failed to rework task {key}"))?;
            return follow(ctx, &runner, &started, events).await;
        }
        ReviewAction::PullRequest { url } => runner.record_pull_request(key, &url).await,
    }
    .with_context(|| format!("failed to review task {key}"))?;

    if ctx.json {
        return print_json(&task);
    }
    println!("{}", task_line(&task));
    if let Some(url) = &task.metadata.pr_url {
        println!("  {url}");
    }
    Ok(())
}
