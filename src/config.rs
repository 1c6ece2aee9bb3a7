use anyhow::{anyhow, Result};
use std::{
    env, fs, io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::ui::{print_command_status, CommandStatus};

/// Client configuration stored under the user's config directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub auth: AuthConfig,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AuthConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

pub fn global_config_dir() -> Result<PathBuf> {
    if let Some(xdg) = env::var_os("XDG_CONFIG_HOME") {
        return Ok(PathBuf::from(xdg).join("coinfer"));
    }
    dirs::home_dir()
        .map(|path| path.join(".config").join("coinfer"))
        .ok_or_else(|| anyhow!("$HOME not configured."))
}

pub fn global_path() -> Result<PathBuf> {
    Ok(global_config_dir()?.join("config.json"))
}

/// Used by serverless runs where the home directory is read-only.
pub fn fallback_path() -> PathBuf {
    env::temp_dir().join("coinfer").join("config.json")
}

pub fn load_file(path: &Path) -> Config {
    let file_contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Config::default(),
        Err(e) => {
            print_command_status(
                CommandStatus::Warning,
                &format!("could not read {}: {e}", path.display()),
            );
            return Config::default();
        }
    };

    match serde_json::from_str(&file_contents) {
        Ok(c) => c,
        Err(e) => {
            print_command_status(
                CommandStatus::Warning,
                &format!("could not parse {}: {e}", path.display()),
            );
            Config::default()
        }
    }
}

pub fn save_file(path: &Path, config: &Config) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(config)?;
    fs::write(path, json)?;

    Ok(())
}

/// First token found in `paths`, in order.
pub fn token_from(paths: &[PathBuf]) -> Option<String> {
    paths
        .iter()
        .filter(|path| path.is_file())
        .find_map(|path| load_file(path).auth.token)
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
}

/// Token precedence: explicit flag or env, then the global config, then the
/// fallback config.
pub fn resolve_token(explicit: Option<&str>) -> Option<String> {
    if let Some(token) = explicit.map(str::trim).filter(|t| !t.is_empty()) {
        return Some(token.to_string());
    }
    let mut paths = Vec::new();
    if let Ok(path) = global_path() {
        paths.push(path);
    }
    paths.push(fallback_path());
    token_from(&paths)
}

/// Store `token` in the config at `path`, keeping any other settings.
pub fn save_token(path: &Path, token: &str) -> Result<()> {
    let mut config = load_file(path);
    config.auth.token = Some(token.trim().to_string());
    save_file(path, &config)
}
