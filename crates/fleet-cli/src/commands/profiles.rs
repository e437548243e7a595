use std::path::PathBuf;

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use fleet_core::profiles::{CredentialRef, Profile, ProfileManager};

use super::{print_json, CliContext};

#[derive(Debug, Clone)]
pub enum ProfileAction {
    List,
    Add {
        name: String,
        config_dir: Option<PathBuf>,
        token_env: Option<String>,
        default: bool,
    },
    Use {
        profile: String,
    },
    Limit {
        profile: String,
        until: Option<DateTime<Utc>>,
        minutes: Option<i64>,
    },
    Clear {
        profile: String,
    },
}

/// Run a `profiles` subcommand against the profile store.
pub fn run(ctx: &CliContext, action: ProfileAction) -> anyhow::Result<()> {
    let mut manager = ctx.load_profiles()?;
    let now = Utc::now();
    manager.refresh_limits(now);

    match action {
        ProfileAction::List => {
            if ctx.json {
                return print_json(&manager.list());
            }
            if manager.list().is_empty() {
                println!("No profiles. Add one with `fleet profiles add`.");
                return Ok(());
            }
            let active = manager.active().map(|p| p.id);
            for profile in manager.list() {
                println!("{}", profile_line(profile, active == Some(profile.id), now));
            }
            return Ok(());
        }
        ProfileAction::Add {
            name,
            config_dir,
            token_env,
            default,
        } => {
            let credential = match (config_dir, token_env) {
                (Some(path), None) => CredentialRef::ConfigDir { path },
                (None, Some(var)) => CredentialRef::TokenEnv { var },
                _ => anyhow::bail!("pass exactly one of --config-dir or --token-env"),
            };
            let mut profile = Profile::new(name, credential);
            profile.is_default = default;
            let id = manager.add_profile(profile)?;
            println!("Added profile {id}");
        }
        ProfileAction::Use { profile } => {
            let id = resolve(&manager, &profile)?;
            manager.set_active_profile(id)?;
            println!("Active profile is now {profile}");
        }
        ProfileAction::Limit {
            profile,
            until,
            minutes,
        } => {
            let id = resolve(&manager, &profile)?;
            let reset_at = match (until, minutes) {
                (Some(at), _) => at,
                (None, Some(minutes)) => now + Duration::minutes(minutes),
                (None, None) => {
                    now + Duration::seconds(
                        ctx.config.orchestrator.rate_limit_fallback_secs as i64,
                    )
                }
            };
            manager.record_rate_limit_event(id, reset_at)?;
            println!("Profile {profile} limited until {reset_at}");
        }
        ProfileAction::Clear { profile } => {
            let id = resolve(&manager, &profile)?;
            manager.clear_rate_limit(id)?;
            println!("Cleared rate limit on {profile}");
        }
    }

    manager
        .save()
        .with_context(|| format!("failed to save profiles to {}", ctx.profiles_path().display()))?;
    Ok(())
}

fn resolve(manager: &ProfileManager, key: &str) -> anyhow::Result<uuid::Uuid> {
    manager
        .resolve(key)
        .map(|p| p.id)
        .with_context(|| format!("no profile named or with id {key}"))
}

fn profile_line(profile: &Profile, active: bool, now: DateTime<Utc>) -> String {
    let marker = if active { "*" } else { " " };
    let limit = if profile.rate_limit.is_limited_at(now) {
        match profile.rate_limit.reset_at {
            Some(reset) => format!("limited until {reset}"),
            None => "limited".to_string(),
        }
    } else {
        "available".to_string()
    };
    let source = match &profile.credential {
        CredentialRef::ConfigDir { path } => format!("dir {}", path.display()),
        CredentialRef::TokenEnv { var } => format!("env {var}"),
    };
    format!(
        "{marker} {:<20} {:<14} {:<40} {}{}",
        profile.name,
        limit,
        source,
        profile.id,
        if profile.is_default { "  (default)" } else { "" }
    )
}
