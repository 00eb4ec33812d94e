//! Configuration loading and validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{ScenarioContext, UserProfile};

pub const DEFAULT_CONVERSATION_END_MARKER: &str = "[CONVERSATION_END]";
pub const DEFAULT_TURN_END_MARKER: &str = "[TURN_END]";

/// Top-level Talkback configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayConfig>,

    #[serde(default)]
    pub providers: ProvidersConfig,

    #[serde(default)]
    pub talk: TalkConfig,

    #[serde(default)]
    pub scenarios: Vec<ScenarioConfig>,

    #[serde(default)]
    pub users: Vec<UserConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,
}

fn default_port() -> u16 {
    18790
}

// --- Providers ---

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub stt: SttConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub tts: TtsConfig,
}

/// Speech-to-text configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SttConfig {
    /// Provider: "groq" or "openai" (default: "groq").
    #[serde(default = "default_stt_provider")]
    pub provider: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    /// Model name (e.g. "whisper-large-v3-turbo").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            provider: default_stt_provider(),
            api_key: None,
            api_key_env: Some("GROQ_API_KEY".into()),
            model: None,
            base_url: None,
        }
    }
}

fn default_stt_provider() -> String {
    "groq".into()
}

impl SttConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

/// Language-model configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Provider: "google" (default).
    #[serde(default = "default_llm_provider")]
    pub provider: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            api_key: None,
            api_key_env: Some("GOOGLE_AI_API_KEY".into()),
            model: None,
            base_url: None,
            max_tokens: None,
            temperature: None,
        }
    }
}

fn default_llm_provider() -> String {
    "google".into()
}

impl LlmConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }

    pub fn model(&self) -> &str {
        self.model.as_deref().unwrap_or("gemini-2.0-flash")
    }

    pub fn max_tokens(&self) -> u32 {
        self.max_tokens.unwrap_or(1024)
    }
}

/// Text-to-speech configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    /// TTS provider: "elevenlabs" (default) or "openai".
    #[serde(default = "default_tts_provider")]
    pub provider: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    /// Voice used when a scenario does not name one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_voice: Option<String>,

    /// Default model ID (e.g. "eleven_turbo_v2").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,

    /// Output format (default: "pcm_16000").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_format: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            provider: default_tts_provider(),
            api_key: None,
            api_key_env: Some("ELEVENLABS_API_KEY".into()),
            default_voice: None,
            default_model: None,
            output_format: None,
            base_url: None,
        }
    }
}

fn default_tts_provider() -> String {
    "elevenlabs".into()
}

impl TtsConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

// --- Talk pipeline ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TalkConfig {
    /// Sliding expiry for stored conversations (default: 1200).
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,

    #[serde(default = "default_speaking_rate")]
    pub default_speaking_rate: f32,

    #[serde(default = "default_conversation_end_marker")]
    pub conversation_end_marker: String,

    #[serde(default = "default_turn_end_marker")]
    pub turn_end_marker: String,

    /// Replaces the built-in opening prompt template.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_template: Option<String>,
}

impl Default for TalkConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: default_session_ttl(),
            default_speaking_rate: default_speaking_rate(),
            conversation_end_marker: default_conversation_end_marker(),
            turn_end_marker: default_turn_end_marker(),
            prompt_template: None,
        }
    }
}

fn default_session_ttl() -> u64 {
    1200
}

fn default_speaking_rate() -> f32 {
    1.0
}

fn default_conversation_end_marker() -> String {
    DEFAULT_CONVERSATION_END_MARKER.into()
}

fn default_turn_end_marker() -> String {
    DEFAULT_TURN_END_MARKER.into()
}

impl TalkConfig {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }
}

// --- Scenario and user directory entries ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioConfig {
    pub id: String,
    pub npc_name: String,
    #[serde(default)]
    pub npc_backstory: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub npc_voice_id: Option<String>,
    pub objective_text: String,
    #[serde(default = "default_proficiency")]
    pub player_proficiency_level: String,
    #[serde(default)]
    pub target_phrases: Vec<String>,
}

fn default_proficiency() -> String {
    "NOVICE".into()
}

impl ScenarioConfig {
    /// Resolve into the runtime context, falling back to `default_voice`.
    pub fn to_context(&self, default_voice: &str) -> ScenarioContext {
        ScenarioContext {
            scenario_id: self.id.clone(),
            npc_name: self.npc_name.clone(),
            npc_backstory: self.npc_backstory.clone(),
            npc_voice_id: self
                .npc_voice_id
                .clone()
                .unwrap_or_else(|| default_voice.to_string()),
            objective_text: self.objective_text.clone(),
            player_proficiency_level: self.player_proficiency_level.clone(),
            target_phrases: self.target_phrases.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proficiency_level: Option<String>,
}

impl From<&UserConfig> for UserProfile {
    fn from(u: &UserConfig) -> Self {
        UserProfile {
            user_id: u.id.clone(),
            proficiency_level: u.proficiency_level.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "talkback_voice=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    let re = regex::Regex::new(r"\$\{([^}]+)\}").expect("static regex");
    re.replace_all(input, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_default()
    })
    .into_owned()
}

const STT_PROVIDERS: &[&str] = &["groq", "openai"];
const LLM_PROVIDERS: &[&str] = &["google"];
const TTS_PROVIDERS: &[&str] = &["elevenlabs", "openai"];

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        let substituted = substitute_env_vars(&raw);

        json5::from_str(&substituted).map_err(|e| crate::error::TalkError::Config(e.to_string()))
    }

    /// Default config file path.
    pub fn default_path() -> PathBuf {
        data_dir().join("config.json")
    }

    pub fn gateway_port(&self) -> u16 {
        self.gateway.as_ref().map(|g| g.port).unwrap_or(18790)
    }

    pub fn gateway_bind(&self) -> String {
        self.gateway
            .as_ref()
            .and_then(|g| g.bind.clone())
            .unwrap_or_else(|| "0.0.0.0".to_string())
    }

    pub fn scenario(&self, id: &str) -> Option<&ScenarioConfig> {
        self.scenarios.iter().find(|s| s.id == id)
    }

    /// Get a config value by dotted path (e.g. "gateway.port", "talk.session_ttl_secs").
    pub fn get_path(&self, path: &str) -> Option<serde_json::Value> {
        let json = serde_json::to_value(self).ok()?;
        let mut current = &json;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        Some(current.clone())
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();
        let p = &self.providers;

        if !STT_PROVIDERS.contains(&p.stt.provider.as_str()) {
            errors.push(format!("Unknown STT provider '{}'", p.stt.provider));
        } else if p.stt.resolve_api_key().is_none() {
            warnings.push(format!("STT provider '{}' has no API key configured", p.stt.provider));
        }

        if !LLM_PROVIDERS.contains(&p.llm.provider.as_str()) {
            errors.push(format!("Unknown LLM provider '{}'", p.llm.provider));
        } else if p.llm.resolve_api_key().is_none() {
            warnings.push(format!("LLM provider '{}' has no API key configured", p.llm.provider));
        }

        if !TTS_PROVIDERS.contains(&p.tts.provider.as_str()) {
            errors.push(format!("Unknown TTS provider '{}'", p.tts.provider));
        } else if p.tts.resolve_api_key().is_none() {
            warnings.push(format!("TTS provider '{}' has no API key configured", p.tts.provider));
        }

        if let Some(gw) = &self.gateway {
            if gw.port == 0 {
                errors.push("Gateway port cannot be 0".to_string());
            }
        }

        let talk = &self.talk;
        if talk.conversation_end_marker.is_empty() || talk.turn_end_marker.is_empty() {
            errors.push("Sentinel markers cannot be empty".to_string());
        } else if talk.conversation_end_marker == talk.turn_end_marker {
            errors.push("Conversation-end and turn-end markers must differ".to_string());
        }
        if talk.session_ttl_secs == 0 {
            errors.push("talk.session_ttl_secs cannot be 0".to_string());
        }

        let mut seen = std::collections::HashSet::new();
        for s in &self.scenarios {
            if !seen.insert(s.id.as_str()) {
                errors.push(format!("Duplicate scenario id '{}'", s.id));
            }
        }
        if self.scenarios.is_empty() {
            warnings.push("No scenarios configured".to_string());
        }

        (warnings, errors)
    }
}

/// Base directory for Talkback data: `~/.talkback/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".talkback")
}
