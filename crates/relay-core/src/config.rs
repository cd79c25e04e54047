use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{errors::Error, Result};

/// Process-level configuration: secrets and paths from the environment, plus
/// the bot profiles loaded from a JSON file.
#[derive(Clone, Debug)]
pub struct Config {
    // Platforms
    pub telegram_bot_token: Option<String>,
    /// Sender ids treated as admins by the adapters.
    pub admins: Vec<String>,

    // LLM collaborator
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub openai_model: String,
    pub llm_timeout: Duration,

    // Profiles
    pub profiles_file: PathBuf,
    pub profiles: BotProfiles,

    // Runtime
    pub shutdown_grace: Duration,
    /// How long a session's queue may sit empty before its worker exits.
    pub session_idle: Duration,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let telegram_bot_token = env_str("TELEGRAM_BOT_TOKEN").and_then(non_empty);
        let admins = parse_csv(env_str("RELAY_ADMINS"));

        let openai_api_key = env_str("OPENAI_API_KEY").and_then(non_empty);
        let openai_base_url = env_str("OPENAI_BASE_URL")
            .and_then(non_empty)
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
        let openai_model = env_str("OPENAI_MODEL")
            .and_then(non_empty)
            .unwrap_or_else(|| "gpt-4o-mini".to_string());
        let llm_timeout = Duration::from_millis(env_u64("LLM_TIMEOUT_MS").unwrap_or(120_000));

        let profiles_file = env_path("RELAY_PROFILES").unwrap_or_else(|| PathBuf::from("relay.json"));
        let profiles = BotProfiles::load(&profiles_file)?;

        let shutdown_grace =
            Duration::from_millis(env_u64("RELAY_SHUTDOWN_GRACE_MS").unwrap_or(5_000));
        let session_idle = Duration::from_secs(env_u64("RELAY_SESSION_IDLE_SECS").unwrap_or(600));

        Ok(Self {
            telegram_bot_token,
            admins,
            openai_api_key,
            openai_base_url,
            openai_model,
            llm_timeout,
            profiles_file,
            profiles,
            shutdown_grace,
            session_idle,
        })
    }
}

// ============== Profiles ==============

pub const DEFAULT_PROFILE: &str = "default";

/// All bot personas plus the platform → profile routing table.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BotProfiles {
    pub default_profile: String,
    /// platform name → profile name
    pub routes: HashMap<String, String>,
    pub profiles: HashMap<String, ProfileConfig>,
}

impl Default for BotProfiles {
    fn default() -> Self {
        let mut profiles = HashMap::new();
        profiles.insert(DEFAULT_PROFILE.to_string(), ProfileConfig::default());
        Self {
            default_profile: DEFAULT_PROFILE.to_string(),
            routes: HashMap::new(),
            profiles,
        }
    }
}

impl BotProfiles {
    /// Load profiles from a JSON file, interpolating `${ENV_VAR}` placeholders.
    ///
    /// A missing file yields a single default profile.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(raw)?;
        let mut profiles: BotProfiles = serde_json::from_value(interpolate_env(value))?;
        if profiles.profiles.is_empty() {
            profiles
                .profiles
                .insert(profiles.default_profile.clone(), ProfileConfig::default());
        }
        profiles.validate()?;
        Ok(profiles)
    }

    fn validate(&self) -> Result<()> {
        if !self.profiles.contains_key(&self.default_profile) {
            return Err(Error::Config(format!(
                "default profile {} is not defined",
                self.default_profile
            )));
        }
        for (platform, profile) in &self.routes {
            if !self.profiles.contains_key(profile) {
                return Err(Error::Config(format!(
                    "route {platform} points at unknown profile {profile}"
                )));
            }
        }
        for (name, profile) in &self.profiles {
            if profile.rate_limit.enabled && profile.rate_limit.count == 0 {
                return Err(Error::Config(format!(
                    "profile {name}: rate_limit.count must be at least 1"
                )));
            }
        }
        Ok(())
    }

    pub fn profile_for_platform(&self, platform: &str) -> &str {
        self.routes
            .get(platform)
            .map(String::as_str)
            .unwrap_or(&self.default_profile)
    }
}

/// Stage configuration for one persona. Read when its scheduler is built.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileConfig {
    pub whitelist: WhitelistConfig,
    pub safety: SafetyConfig,
    pub rate_limit: RateLimitConfig,
    pub session: SessionConfig,
    pub waking: WakingConfig,
    pub process: ProcessConfig,
    pub decorate: DecorateConfig,
    pub respond: RespondConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WhitelistConfig {
    pub enabled: bool,
    /// Origins (`platform:type:chat`) or session ids allowed through.
    pub entries: Vec<String>,
    pub ignore_admin_in_group: bool,
    pub ignore_admin_in_direct: bool,
    /// Let messages that address the bot skip the whitelist.
    pub bypass_when_addressed: bool,
    /// Log denied messages at info level.
    pub log: bool,
}

impl Default for WhitelistConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            entries: Vec::new(),
            ignore_admin_in_group: true,
            ignore_admin_in_direct: true,
            bypass_when_addressed: false,
            log: true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    pub enabled: bool,
    /// Regular expressions matched against the raw text.
    pub keywords: Vec<String>,
    /// Also ask the external classifier, if one is wired in.
    pub use_classifier: bool,
    pub blocked_reply: String,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            keywords: Vec::new(),
            use_classifier: false,
            blocked_reply: "Your message contains content that cannot be processed.".to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitStrategy {
    Stall,
    Discard,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub count: u32,
    pub window_secs: u64,
    pub strategy: RateLimitStrategy,
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            count: 30,
            window_secs: 60,
            strategy: RateLimitStrategy::Stall,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub enabled: bool,
    /// Whether sessions the bot has never seen start enabled.
    pub default_enabled: bool,
    /// Session ids that start enabled. When non-empty every other session
    /// starts disabled, whatever `default_enabled` says.
    pub enabled_sessions: Vec<String>,
    /// Admins get through disabled sessions (so they can turn them back on).
    pub ignore_admin: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_enabled: true,
            enabled_sessions: Vec::new(),
            ignore_admin: true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WakingConfig {
    pub enabled: bool,
    pub prefixes: Vec<String>,
    pub direct_needs_prefix: bool,
}

impl Default for WakingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            prefixes: vec!["/".to_string()],
            direct_needs_prefix: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyMode {
    /// Every eligible message may reach the LLM.
    Active,
    /// Only messages addressed to the bot.
    Addressed,
    /// Never call the LLM; commands only.
    Passive,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    pub enabled: bool,
    pub command_prefix: String,
    pub llm_enabled: bool,
    pub reply_mode: ReplyMode,
    pub streaming: bool,
    /// Persona prompt handed to the LLM.
    pub system_prompt: Option<String>,
    pub max_context_turns: usize,
    pub max_tool_rounds: usize,
    /// Plugins whose `ToolCall` handlers the LLM may invoke (`*` = all).
    pub tool_plugins: Vec<String>,
    pub failure_reply: String,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            command_prefix: "/".to_string(),
            llm_enabled: true,
            reply_mode: ReplyMode::Active,
            streaming: false,
            system_prompt: None,
            max_context_turns: 20,
            max_tool_rounds: 3,
            tool_plugins: vec!["*".to_string()],
            failure_reply: "Sorry, something went wrong while handling your message.".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DecorateConfig {
    pub enabled: bool,
    pub prefix: String,
    pub suffix: String,
    pub mention_sender: bool,
    /// Hard cap on reply length; falls back to the platform limit.
    pub max_chars: Option<usize>,
}

impl Default for DecorateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            prefix: String::new(),
            suffix: String::new(),
            mention_sender: false,
            max_chars: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RespondConfig {
    pub enabled: bool,
}

impl Default for RespondConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

// ============== Env helpers ==============

/// Recursively interpolate `${VAR}` placeholders in all JSON strings.
fn interpolate_env(v: serde_json::Value) -> serde_json::Value {
    match v {
        serde_json::Value::String(s) => serde_json::Value::String(interpolate_env_str(&s)),
        serde_json::Value::Array(xs) => {
            serde_json::Value::Array(xs.into_iter().map(interpolate_env).collect())
        }
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, interpolate_env(v)))
                .collect(),
        ),
        other => other,
    }
}

fn interpolate_env_str(s: &str) -> String {
    // `${VAR}` only, no defaults. Unset vars become empty.
    let mut out = String::new();
    let mut rest = s;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        out.push_str(&env::var(&after[..end]).unwrap_or_default());
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // real env wins
        }

        let mut val = v.trim().to_string();
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var_os(key).map(PathBuf::from)
}

fn parse_csv(v: Option<String>) -> Vec<String> {
    v.unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
