use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{domain::SenderId, errors::Error, Result};

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(60 * 60);

/// Typed configuration for the bot, loaded from the process environment.
///
/// Sub-configs are handed to the component that consumes them; every component
/// treats its config as read-only.
#[derive(Clone, Debug)]
pub struct Config {
    pub owner_id: SenderId,
    pub data_dir: PathBuf,
    pub database_url: Option<String>,
    pub reply_in_groups: bool,
    /// Delete stored session credentials before the first connect.
    pub reset_credentials: bool,

    pub bridge: BridgeConfig,
    pub session: SessionConfig,
    pub guard: GuardConfig,
    pub state: StateConfig,
    pub ai: AiConfig,
}

/// How to launch the transport sidecar.
#[derive(Clone, Debug)]
pub struct BridgeConfig {
    pub command: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    pub max_retries: u32,
    pub max_challenge_attempts: u32,
    /// When set and the stored credentials are not registered, request a pairing
    /// code for this number instead of waiting for a QR scan.
    pub pairing_phone: Option<String>,
}

impl SessionConfig {
    /// `base × 2^(attempt−1)`, capped at `reconnect_max`. `attempt` is 1-based.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exp;
        self.reconnect_base
            .checked_mul(factor)
            .unwrap_or(self.reconnect_max)
            .min(self.reconnect_max)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reconnect_base: Duration::from_secs(5),
            reconnect_max: Duration::from_secs(60),
            max_retries: 10,
            max_challenge_attempts: 5,
            pairing_phone: None,
        }
    }
}

/// Thresholds for the admission guard.
#[derive(Clone, Debug)]
pub struct GuardConfig {
    pub rate_limit_enabled: bool,
    pub per_minute: u32,
    pub per_hour: u32,
    pub minute_warnings_before_block: u32,
    pub minute_block: Duration,
    pub hour_block: Duration,

    pub history_len: usize,
    pub duplicate_window: Duration,
    pub duplicate_threshold: usize,
    pub duplicate_streak_limit: u32,
    pub duplicate_block: Duration,
    pub burst_gap: Duration,
    pub burst_decay_gap: Duration,
    pub burst_threshold: u32,
    pub burst_block: Duration,

    pub max_message_chars: usize,
    pub violation_window: Duration,
    pub violation_threshold: usize,
    pub violation_block: Duration,

    pub inactivity_ttl: Duration,
    pub sweep_interval: Duration,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            rate_limit_enabled: true,
            per_minute: 10,
            per_hour: 100,
            minute_warnings_before_block: 3,
            minute_block: 10 * MINUTE,
            hour_block: HOUR,

            history_len: 10,
            duplicate_window: 5 * MINUTE,
            duplicate_threshold: 3,
            duplicate_streak_limit: 3,
            duplicate_block: 30 * MINUTE,
            burst_gap: Duration::from_secs(2),
            burst_decay_gap: Duration::from_secs(10),
            burst_threshold: 5,
            burst_block: 15 * MINUTE,

            max_message_chars: 2000,
            violation_window: 24 * HOUR,
            violation_threshold: 5,
            violation_block: 24 * HOUR,

            inactivity_ttl: 24 * HOUR,
            sweep_interval: HOUR,
        }
    }
}

#[derive(Clone, Debug)]
pub struct StateConfig {
    pub debounce: Duration,
    pub flush_interval: Duration,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(2),
            flush_interval: 5 * MINUTE,
        }
    }
}

#[derive(Clone, Debug)]
pub struct AiConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub system_prompt: String,
    pub timeout: Duration,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let owner_id = required_env("BOT_OWNER_ID")?;
        let api_key = required_env("AI_API_KEY")?;

        let data_dir = env_path("DATA_DIR").unwrap_or_else(|| PathBuf::from("./data"));
        fs::create_dir_all(&data_dir)?;
        let database_url = env_str("DATABASE_URL").and_then(non_empty);
        let reply_in_groups = env_bool("REPLY_IN_GROUPS").unwrap_or(false);
        let reset_credentials = env_bool("RESET_CREDENTIALS").unwrap_or(false);

        let bridge = BridgeConfig {
            command: env_path("BRIDGE_COMMAND")
                .unwrap_or_else(|| PathBuf::from("pmb-bridge-sidecar")),
            args: parse_args(env_str("BRIDGE_ARGS")),
            working_dir: env_path("BRIDGE_WORKING_DIR").unwrap_or_else(|| data_dir.clone()),
        };

        let session_defaults = SessionConfig::default();
        let session = SessionConfig {
            reconnect_base: env_millis("RECONNECT_BASE_MS")
                .unwrap_or(session_defaults.reconnect_base),
            reconnect_max: env_millis("RECONNECT_MAX_MS").unwrap_or(session_defaults.reconnect_max),
            max_retries: env_u32("RECONNECT_MAX_RETRIES").unwrap_or(session_defaults.max_retries),
            max_challenge_attempts: env_u32("MAX_QR_ATTEMPTS")
                .unwrap_or(session_defaults.max_challenge_attempts),
            pairing_phone: env_str("PAIRING_PHONE_NUMBER")
                .and_then(non_empty)
                .map(|p| p.chars().filter(|c| c.is_ascii_digit()).collect()),
        };
        if session.reconnect_base.is_zero() || session.reconnect_max < session.reconnect_base {
            return Err(Error::Config(
                "RECONNECT_MAX_MS must be >= RECONNECT_BASE_MS > 0".to_string(),
            ));
        }

        let guard_defaults = GuardConfig::default();
        let guard = GuardConfig {
            rate_limit_enabled: env_bool("RATE_LIMIT_ENABLED")
                .unwrap_or(guard_defaults.rate_limit_enabled),
            per_minute: env_u32("RATE_LIMIT_PER_MINUTE").unwrap_or(guard_defaults.per_minute),
            per_hour: env_u32("RATE_LIMIT_PER_HOUR").unwrap_or(guard_defaults.per_hour),
            sweep_interval: env_millis("GUARD_SWEEP_INTERVAL_MS")
                .unwrap_or(guard_defaults.sweep_interval),
            ..guard_defaults
        };

        let state_defaults = StateConfig::default();
        let state = StateConfig {
            debounce: env_millis("STATE_DEBOUNCE_MS").unwrap_or(state_defaults.debounce),
            flush_interval: env_millis("STATE_FLUSH_INTERVAL_MS")
                .unwrap_or(state_defaults.flush_interval),
        };

        let ai = AiConfig {
            api_key,
            base_url: env_str("AI_BASE_URL")
                .and_then(non_empty)
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            model: env_str("AI_MODEL")
                .and_then(non_empty)
                .unwrap_or_else(|| "gpt-4o-mini".to_string()),
            system_prompt: env_str("AI_SYSTEM_PROMPT")
                .and_then(non_empty)
                .unwrap_or_else(default_system_prompt),
            timeout: env_millis("AI_TIMEOUT_MS").unwrap_or(Duration::from_secs(60)),
        };

        Ok(Self {
            owner_id: SenderId::new(owner_id.trim()),
            data_dir,
            database_url,
            reply_in_groups,
            reset_credentials,
            bridge,
            session,
            guard,
            state,
            ai,
        })
    }
}

fn default_system_prompt() -> String {
    "You are a helpful personal assistant replying to chat messages on behalf of the owner. \
Keep answers short and conversational, and reply in the language of the message."
        .to_string()
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn required_env(key: &str) -> Result<String> {
    env_str(key)
        .and_then(non_empty)
        .ok_or_else(|| Error::Config(format!("{key} environment variable is required")))
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
            continue; // do not override existing env
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

fn env_bool(key: &str) -> Option<bool> {
    env_str(key).map(|s| {
        matches!(
            s.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    env_str(key).and_then(|s| s.trim().parse::<u32>().ok())
}

fn env_millis(key: &str) -> Option<Duration> {
    env_u64(key).map(Duration::from_millis)
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var_os(key).map(PathBuf::from)
}

fn parse_args(v: Option<String>) -> Vec<String> {
    v.unwrap_or_default()
        .split_whitespace()
        .map(|s| s.to_string())
        .collect()
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
