#![forbid(unsafe_code)]

//! Runtime configuration: explicit overrides win over process environment,
//! which wins over the `.env` file, which wins over defaults.

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 3001;
pub const DEFAULT_TEMP_ROOT: &str = "./temp";
pub const DEFAULT_YTDLP_BIN: &str = "yt-dlp";
pub const DEFAULT_PROCESS_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub temp_root: PathBuf,
    pub ytdlp_bin: PathBuf,
    pub process_timeout: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub temp_root: Option<PathBuf>,
    pub ytdlp_bin: Option<PathBuf>,
    pub process_timeout_secs: Option<u64>,
    pub env_path: Option<PathBuf>,
}

pub fn load_config() -> Result<ServerConfig> {
    resolve_config(ConfigOverrides::default())
}

pub fn resolve_config(overrides: ConfigOverrides) -> Result<ServerConfig> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_config(&file_vars, env_var_string, overrides)
}

fn build_config(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: ConfigOverrides,
) -> Result<ServerConfig> {
    let host = overrides
        .host
        .filter(|value| !value.trim().is_empty())
        .or_else(|| lookup_value("HOST", file_vars, &env_lookup))
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = overrides
        .port
        .or_else(|| {
            lookup_value("PORT", file_vars, &env_lookup).and_then(|value| value.parse::<u16>().ok())
        })
        .unwrap_or(DEFAULT_PORT);
    let temp_root = overrides
        .temp_root
        .or_else(|| lookup_value("TEMP_ROOT", file_vars, &env_lookup).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_TEMP_ROOT));
    let ytdlp_bin = overrides
        .ytdlp_bin
        .or_else(|| lookup_value("YTDLP_BIN", file_vars, &env_lookup).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_YTDLP_BIN));
    let timeout_secs = overrides
        .process_timeout_secs
        .or_else(|| {
            lookup_value("PROCESS_TIMEOUT_SECS", file_vars, &env_lookup)
                .and_then(|value| value.parse::<u64>().ok())
        })
        .unwrap_or(DEFAULT_PROCESS_TIMEOUT_SECS);

    Ok(ServerConfig {
        host,
        port,
        temp_root,
        ytdlp_bin,
        process_timeout: Duration::from_secs(timeout_secs),
    })
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| file_vars.get(key).cloned())
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}
