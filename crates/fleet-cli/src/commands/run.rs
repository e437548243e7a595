use anyhow::Context;
use fleet_agents::events::OrchestratorEvent;
use fleet_agents::runner::{StartedWorker, TaskRunner};
use tracing::{info, warn};

use super::CliContext;

/// Run the `run` subcommand: start the task's worker and follow it until it
/// exits. Ctrl-c stops the worker and hands the task to a human.
pub async fn run(ctx: &CliContext, key: &str) -> anyhow::Result<()> {
    let runner = ctx.runner()?;
    let events = runner.orchestrator().subscribe();
    let started = runner
        .start_task(key)
        .await
        .with_context(|| format!("failed to start task {key}"))?;
    follow(ctx, &runner, &started, events).await
}

/// Stream a started worker's events until its final exit or ctrl-c.
pub async fn follow(
    ctx: &CliContext,
    runner: &TaskRunner,
    started: &StartedWorker,
    events: flume::Receiver<OrchestratorEvent>,
) -> anyhow::Result<()> {
    info!(spec_id = %started.spec_id, spawn_id = started.spawn_id, "following worker");
    if !ctx.json {
        println!(
            "Started {} in {}",
            started.spec_id,
            started.work_dir.display()
        );
    }

    loop {
        tokio::select! {
            event = events.recv_async() => {
                let Ok(event) = event else {
                    warn!("event stream closed");
                    return Ok(());
                };
                if event.task_id() != started.task_id {
                    continue;
                }
                print_event(ctx, &event)?;
                if let OrchestratorEvent::Exit { code, .. } = event {
                    let task = runner.store().load_task(&started.spec_id)?;
                    if !ctx.json {
                        println!("Worker exited with {code}; task is {}", task.status);
                    }
                    return Ok(());
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for ctrl-c")?;
                info!("ctrl-c received, stopping worker");
                let outcome = runner.stop_task(&started.spec_id).await?;
                if !ctx.json {
                    println!("Stopped {}; task is {}", outcome.task.spec_id, outcome.task.status);
                }
                return Ok(());
            }
        }
    }
}

fn print_event(ctx: &CliContext, event: &OrchestratorEvent) -> anyhow::Result<()> {
    if ctx.json {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }
    match event {
        OrchestratorEvent::Log { text, .. } => println!("  | {text}"),
        OrchestratorEvent::Progress {
            phase,
            percent,
            message,
            ..
        } => match message {
            Some(message) => println!("[{percent:>3}%] {phase}: {message}"),
            None => println!("[{percent:>3}%] {phase}"),
        },
        OrchestratorEvent::StatusChange { status, reason, .. } => match reason {
            Some(reason) => println!("-> {status} ({reason})"),
            None => println!("-> {status}"),
        },
        OrchestratorEvent::RateLimited {
            reset_at,
            suggested_profile_id,
            ..
        } => match suggested_profile_id {
            Some(profile) => println!("Rate limited until {reset_at}; switching to profile {profile}"),
            None => println!("Rate limited until {reset_at}; no other profile available"),
        },
        OrchestratorEvent::Exit { .. } => {}
    }
    Ok(())
}
