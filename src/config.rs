use std::path::{Path, PathBuf};

use crate::error::ConfigError;

const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
const DEFAULT_MAX_TOKENS: u32 = 4096;
const DEFAULT_CONTEXT_WINDOW: u32 = 200_000;

/// Runtime configuration. Environment variables are the only config
/// surface.
#[derive(Debug, Clone)]
pub struct Config {
    pub api_key: String,
    /// Conversation state lives under here.
    pub data_dir: PathBuf,
    /// Identity files live here.
    pub home_dir: PathBuf,
    pub model: String,
    pub max_tokens: u32,
    pub context_window: u32,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            api_key: std::env::var("ANTHROPIC_API_KEY")
                .ok()
                .filter(|k| !k.is_empty())
                .ok_or(ConfigError::MissingApiKey)?,
            data_dir: std::env::var_os("KOMATACHI_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| default_root().join("data")),
            home_dir: std::env::var_os("KOMATACHI_HOME_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(default_root),
            model: std::env::var("KOMATACHI_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.into()),
            max_tokens: parse_u32(
                "KOMATACHI_MAX_TOKENS",
                std::env::var("KOMATACHI_MAX_TOKENS").ok(),
                DEFAULT_MAX_TOKENS,
            )?,
            context_window: parse_u32(
                "KOMATACHI_CONTEXT_WINDOW",
                std::env::var("KOMATACHI_CONTEXT_WINDOW").ok(),
                DEFAULT_CONTEXT_WINDOW,
            )?,
        })
    }
}

/// `/data` in a container, `~/.komatachi` on a host.
fn default_root() -> PathBuf {
    let container = Path::new("/data");
    if container.is_dir() {
        return container.into();
    }
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".komatachi")
}

fn parse_u32(var: &'static str, raw: Option<String>, default: u32) -> Result<u32, ConfigError> {
    match raw {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidInt { var, value }),
    }
}
