//! Scenario and user lookup.
//!
//! Content authoring and user management live elsewhere; the pipeline only
//! needs to resolve an id to the fields below.

use std::collections::HashMap;

use async_trait::async_trait;

use talkback_core::config::Config;
use talkback_core::error::{Result, TalkError};
use talkback_core::types::{ScenarioContext, UserProfile};

const FALLBACK_VOICE: &str = "Rachel";

#[async_trait]
pub trait ScenarioDirectory: Send + Sync {
    /// Fails with `ScenarioNotFound` for unknown ids.
    async fn scenario(&self, scenario_id: &str) -> Result<ScenarioContext>;
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Fails with `UserNotFound` for unknown ids.
    async fn user(&self, user_id: &str) -> Result<UserProfile>;
}

/// Directory backed by the `scenarios` and `users` config sections.
///
/// With no `users` configured every user id resolves, without a proficiency level.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    scenarios: HashMap<String, ScenarioContext>,
    users: HashMap<String, UserProfile>,
    open_users: bool,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &Config) -> Self {
        let default_voice = config
            .providers
            .tts
            .default_voice
            .as_deref()
            .unwrap_or(FALLBACK_VOICE);
        Self {
            scenarios: config
                .scenarios
                .iter()
                .map(|s| (s.id.clone(), s.to_context(default_voice)))
                .collect(),
            users: config
                .users
                .iter()
                .map(|u| (u.id.clone(), UserProfile::from(u)))
                .collect(),
            open_users: config.users.is_empty(),
        }
    }

    pub fn with_scenario(mut self, scenario: ScenarioContext) -> Self {
        self.scenarios.insert(scenario.scenario_id.clone(), scenario);
        self
    }

    pub fn with_user(mut self, user: UserProfile) -> Self {
        self.users.insert(user.user_id.clone(), user);
        self
    }

    /// Resolve unknown user ids instead of rejecting them.
    pub fn open_users(mut self) -> Self {
        self.open_users = true;
        self
    }

    pub fn scenario_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.scenarios.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

#[async_trait]
impl ScenarioDirectory for StaticDirectory {
    async fn scenario(&self, scenario_id: &str) -> Result<ScenarioContext> {
        self.scenarios
            .get(scenario_id)
            .cloned()
            .ok_or_else(|| TalkError::ScenarioNotFound(scenario_id.to_string()))
    }
}

#[async_trait]
impl UserDirectory for StaticDirectory {
    async fn user(&self, user_id: &str) -> Result<UserProfile> {
        if let Some(user) = self.users.get(user_id) {
            return Ok(user.clone());
        }
        if self.open_users {
            return Ok(UserProfile {
                user_id: user_id.to_string(),
                proficiency_level: None,
            });
        }
        Err(TalkError::UserNotFound(user_id.to_string()))
    }
}

/// The level the prompt is pitched at: the user's own, else the scenario's.
pub fn effective_proficiency<'a>(user: &'a UserProfile, scenario: &'a ScenarioContext) -> &'a str {
    user.proficiency_level
        .as_deref()
        .filter(|l| !l.trim().is_empty())
        .unwrap_or(&scenario.player_proficiency_level)
}
