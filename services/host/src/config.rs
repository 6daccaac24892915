use mojitalk_core::{
    llm_client::{DASHSCOPE_CHAT_ENDPOINT, DEFAULT_CHAT_MODEL, DEFAULT_HISTORY_WINDOW, DEFAULT_MAX_TOKENS},
    localization::Language,
    speech::{DASHSCOPE_ASR_ENDPOINT, DASHSCOPE_TTS_ENDPOINT, DEFAULT_ASR_MODEL, DEFAULT_TTS_MODEL},
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub api_key: String,
    pub chat_endpoint: String,
    pub chat_model: String,
    pub max_tokens: u32,
    pub history_window: usize,
    pub tts_endpoint: String,
    pub tts_model: String,
    pub tts_voice: Option<String>,
    pub asr_endpoint: String,
    pub asr_model: String,
    pub data_dir: PathBuf,
    pub prompts_path: PathBuf,
    pub language: Language,
    pub auto_play: bool,
    pub log_level: Level,
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T>(name: &str, default: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = var_or(name, default);
    raw.trim()
        .parse::<T>()
        .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("'{raw}': {e}")))
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address = parse_var::<SocketAddr>("BIND_ADDRESS", "127.0.0.1:3000")?;

        let api_key = std::env::var("DASHSCOPE_API_KEY")
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingVar("DASHSCOPE_API_KEY".to_string()))?;

        let max_tokens = parse_var::<u32>("MAX_TOKENS", &DEFAULT_MAX_TOKENS.to_string())?;
        let history_window = parse_var::<usize>("HISTORY_WINDOW", &DEFAULT_HISTORY_WINDOW.to_string())?;
        if history_window == 0 {
            return Err(ConfigError::InvalidValue(
                "HISTORY_WINDOW".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        let auto_play = parse_var::<bool>("AUTO_PLAY", "false")?;

        let log_level_str = var_or("RUST_LOG", "INFO");
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            bind_address,
            api_key,
            chat_endpoint: var_or("CHAT_ENDPOINT", DASHSCOPE_CHAT_ENDPOINT),
            chat_model: var_or("CHAT_MODEL", DEFAULT_CHAT_MODEL),
            max_tokens,
            history_window,
            tts_endpoint: var_or("TTS_ENDPOINT", DASHSCOPE_TTS_ENDPOINT),
            tts_model: var_or("TTS_MODEL", DEFAULT_TTS_MODEL),
            tts_voice: std::env::var("TTS_VOICE").ok().filter(|v| !v.trim().is_empty()),
            asr_endpoint: var_or("ASR_ENDPOINT", DASHSCOPE_ASR_ENDPOINT),
            asr_model: var_or("ASR_MODEL", DEFAULT_ASR_MODEL),
            data_dir: PathBuf::from(var_or("DATA_DIR", "./data")),
            prompts_path: PathBuf::from(var_or("PROMPTS_PATH", "./prompts")),
            language: Language::from_code(&var_or("APP_LANGUAGE", "system")),
            auto_play,
            log_level,
        })
    }

    /// Where chat histories are written.
    pub fn history_dir(&self) -> PathBuf {
        self.data_dir.join("history")
    }

    /// Where synthesized speech is cached.
    pub fn audio_cache_dir(&self) -> PathBuf {
        self.data_dir.join("audio")
    }
}
