//! Credential profiles and their rate-limit windows.
//!
//! A profile names a credential the worker can run under. When a worker's
//! output shows an upstream rate limit, the profile is marked limited until
//! its reset time and another profile may be swapped in.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::CredentialProvider;
use crate::records::{self, RecordError};

/// Env var the worker reads its CLI config directory from.
pub const CONFIG_DIR_ENV: &str = "CLAUDE_CONFIG_DIR";
/// Env var the worker reads an OAuth token from.
pub const OAUTH_TOKEN_ENV: &str = "CLAUDE_CODE_OAUTH_TOKEN";

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("profile not found: {0}")]
    NotFound(String),
    #[error("profile name already in use: {0}")]
    DuplicateName(String),
    #[error(transparent)]
    Store(#[from] RecordError),
}

pub type Result<T> = std::result::Result<T, ProfileError>;

// ---------------------------------------------------------------------------
// Profile
// ---------------------------------------------------------------------------

/// Where a profile's credential comes from. Never the secret itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CredentialRef {
    /// The worker's own config directory holding a logged-in session.
    ConfigDir { path: PathBuf },
    /// Host env var holding an OAuth token.
    TokenEnv { var: String },
}

impl CredentialRef {
    /// Environment entries to hand the worker.
    pub fn worker_env(&self) -> Vec<(String, String)> {
        match self {
            CredentialRef::ConfigDir { path } => {
                vec![(CONFIG_DIR_ENV.to_string(), path.display().to_string())]
            }
            CredentialRef::TokenEnv { var } => match CredentialProvider::from_env(var) {
                Some(token) => vec![(OAUTH_TOKEN_ENV.to_string(), token)],
                None => {
                    tracing::warn!(var = %var, "profile token env var is not set");
                    Vec::new()
                }
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateLimitState {
    pub is_limited: bool,
    pub reset_at: Option<DateTime<Utc>>,
    /// Number of rate-limit events seen for this profile.
    #[serde(default)]
    pub events: u32,
    #[serde(default)]
    pub last_event_at: Option<DateTime<Utc>>,
}

impl RateLimitState {
    /// Limited at `now`; a passed `reset_at` counts as cleared.
    pub fn is_limited_at(&self, now: DateTime<Utc>) -> bool {
        self.is_limited && self.reset_at.map(|reset| reset > now).unwrap_or(true)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: Uuid,
    pub name: String,
    /// The default profile is used last when swapping on rate limits.
    #[serde(default)]
    pub is_default: bool,
    pub credential: CredentialRef,
    #[serde(default)]
    pub rate_limit: RateLimitState,
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
}

impl Profile {
    pub fn new(name: impl Into<String>, credential: CredentialRef) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            is_default: false,
            credential,
            rate_limit: RateLimitState::default(),
            last_used_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// ProfileManager
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
struct ProfileStoreFile {
    #[serde(default)]
    active_id: Option<Uuid>,
    #[serde(default)]
    profiles: Vec<Profile>,
}

/// Owns the profile set and which one is active.
#[derive(Debug, Default)]
pub struct ProfileManager {
    profiles: Vec<Profile>,
    active_id: Option<Uuid>,
    store_path: Option<PathBuf>,
}

impl ProfileManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a JSON store. A missing file yields an empty manager bound to `path`.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file: ProfileStoreFile = records::read_json(&path)?.unwrap_or_default();
        let mut manager = Self {
            profiles: file.profiles,
            active_id: file.active_id,
            store_path: Some(path),
        };
        if manager.active_id.and_then(|id| manager.get(id)).is_none() {
            manager.active_id = manager.default_profile().map(|p| p.id);
        }
        Ok(manager)
    }

    /// Persist to the store path, if bound.
    pub fn save(&self) -> Result<()> {
        if let Some(path) = &self.store_path {
            self.save_to(path)?;
        }
        Ok(())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let file = ProfileStoreFile {
            active_id: self.active_id,
            profiles: self.profiles.clone(),
        };
        records::write_json_atomic(path, &file)?;
        Ok(())
    }

    /// Add a profile. The first profile becomes default and active.
    pub fn add_profile(&mut self, mut profile: Profile) -> Result<Uuid> {
        if self.find_by_name(&profile.name).is_some() {
            return Err(ProfileError::DuplicateName(profile.name));
        }
        if self.profiles.is_empty() {
            profile.is_default = true;
        } else if profile.is_default {
            for p in &mut self.profiles {
                p.is_default = false;
            }
        }
        let id = profile.id;
        self.profiles.push(profile);
        if self.active_id.is_none() {
            self.active_id = Some(id);
        }
        Ok(id)
    }

    pub fn get(&self, id: Uuid) -> Option<&Profile> {
        self.profiles.iter().find(|p| p.id == id)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&Profile> {
        self.profiles.iter().find(|p| p.name == name)
    }

    /// Resolve an id string or a profile name.
    pub fn resolve(&self, key: &str) -> Option<&Profile> {
        key.parse::<Uuid>()
            .ok()
            .and_then(|id| self.get(id))
            .or_else(|| self.find_by_name(key))
    }

    pub fn list(&self) -> &[Profile] {
        &self.profiles
    }

    pub fn default_profile(&self) -> Option<&Profile> {
        self.profiles
            .iter()
            .find(|p| p.is_default)
            .or_else(|| self.profiles.first())
    }

    pub fn active(&self) -> Option<&Profile> {
        self.active_id.and_then(|id| self.get(id))
    }

    pub fn set_active_profile(&mut self, id: Uuid) -> Result<()> {
        if self.get(id).is_none() {
            return Err(ProfileError::NotFound(id.to_string()));
        }
        tracing::info!(profile_id = %id, "active profile changed");
        self.active_id = Some(id);
        Ok(())
    }

    pub fn mark_used(&mut self, id: Uuid) -> Result<()> {
        self.mark_used_at(id, Utc::now())
    }

    pub fn mark_used_at(&mut self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let profile = self.get_mut(id)?;
        profile.last_used_at = Some(at);
        Ok(())
    }

    /// Mark a profile limited until `reset_at`.
    pub fn record_rate_limit_event(&mut self, id: Uuid, reset_at: DateTime<Utc>) -> Result<()> {
        let profile = self.get_mut(id)?;
        profile.rate_limit.is_limited = true;
        profile.rate_limit.reset_at = Some(reset_at);
        profile.rate_limit.events += 1;
        profile.rate_limit.last_event_at = Some(Utc::now());
        tracing::warn!(
            profile_id = %id,
            profile = %profile.name,
            reset_at = %reset_at,
            "profile rate limited"
        );
        Ok(())
    }

    pub fn clear_rate_limit(&mut self, id: Uuid) -> Result<()> {
        let profile = self.get_mut(id)?;
        profile.rate_limit.is_limited = false;
        profile.rate_limit.reset_at = None;
        Ok(())
    }

    /// Clear limits whose reset time has passed. Returns the cleared ids.
    pub fn refresh_limits(&mut self, now: DateTime<Utc>) -> Vec<Uuid> {
        let mut cleared = Vec::new();
        for profile in &mut self.profiles {
            if profile.rate_limit.is_limited && !profile.rate_limit.is_limited_at(now) {
                profile.rate_limit.is_limited = false;
                profile.rate_limit.reset_at = None;
                cleared.push(profile.id);
            }
        }
        if !cleared.is_empty() {
            tracing::info!(count = cleared.len(), "rate limits expired");
        }
        cleared
    }

    pub fn get_best_available_profile(&self, excluding: Option<Uuid>) -> Option<&Profile> {
        self.best_available_at(excluding, Utc::now())
    }

    /// Unlimited, non-excluded profile; non-default first, then least recently used.
    pub fn best_available_at(&self, excluding: Option<Uuid>, now: DateTime<Utc>) -> Option<&Profile> {
        self.profiles
            .iter()
            .filter(|p| Some(p.id) != excluding)
            .filter(|p| !p.rate_limit.is_limited_at(now))
            .min_by(|a, b| {
                a.is_default
                    .cmp(&b.is_default)
                    .then_with(|| a.last_used_at.cmp(&b.last_used_at))
                    .then_with(|| a.name.cmp(&b.name))
            })
    }

    fn get_mut(&mut self, id: Uuid) -> Result<&mut Profile> {
        self.profiles
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| ProfileError::NotFound(id.to_string()))
    }
}
