use fleet_core::layout::{format_spec_id, slugify};
use serde_json::json;

use super::{print_json, CliContext};

/// Run the `next-spec` subcommand: report the number the next task would get.
///
/// Nothing is claimed; the number is read under the spec lock so a
/// concurrent create is not observed half-done.
pub fn run(ctx: &CliContext, title: Option<&str>) -> anyhow::Result<()> {
    let number = ctx
        .store
        .numbering()
        .with_lock(|numbering| numbering.next_spec_number())?;
    let spec_id = title.map(|t| format_spec_id(number, &slugify(t)));

    if ctx.json {
        return print_json(&json!({ "number": number, "spec_id": spec_id }));
    }
    match spec_id {
        Some(spec_id) => println!("{spec_id}"),
        None => println!("{number:03}"),
    }
    Ok(())
}
