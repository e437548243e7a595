use super::{print_json, CliContext};

/// Run `archive` / `unarchive`. Archival is soft and reversible.
pub fn set_archived(ctx: &CliContext, key: &str, archived: bool) -> anyhow::Result<()> {
    let spec_id = ctx.store.resolve(key)?.spec_id;
    let task = if archived {
        ctx.store.archive(&spec_id)?
    } else {
        ctx.store.unarchive(&spec_id)?
    };

    if ctx.json {
        return print_json(&task);
    }
    let verb = if archived { "Archived" } else { "Unarchived" };
    println!("{verb} {}", task.spec_id);
    Ok(())
}
