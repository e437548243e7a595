use serde_json::json;

use super::{print_json, CliContext};

/// Run the `orphans` subcommand: workspaces whose task no longer exists.
pub fn run(ctx: &CliContext, clean: bool) -> anyhow::Result<()> {
    let engine = ctx.workspaces();
    let known = ctx.store.known_spec_ids()?;

    if !clean {
        let orphans = engine.find_orphans(&known)?;
        if ctx.json {
            return print_json(&json!({ "orphans": orphans }));
        }
        if orphans.is_empty() {
            println!("No orphaned workspaces.");
        }
        for name in &orphans {
            println!("{name}");
        }
        return Ok(());
    }

    let report = engine.cleanup_orphans(&known)?;
    if ctx.json {
        return print_json(&report);
    }
    println!("Removed {} orphaned workspace(s).", report.removed.len());
    for name in &report.removed {
        println!("  {name}");
    }
    for warning in &report.warnings {
        eprintln!("warning: {warning}");
    }
    Ok(())
}
