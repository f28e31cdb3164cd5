//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.courier/config.json`) and environment.
//! Every field has a default, so an empty `{}` file is a valid config.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::llm::DEFAULT_MODEL;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// The agent's identity on the channel (used for mention detection).
    #[serde(default)]
    pub bot: BotConfig,

    /// Model and workspace settings.
    #[serde(default)]
    pub agents: AgentsConfig,

    /// Command prefixes, history depth, and upstream bounds.
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Web search settings.
    #[serde(default)]
    pub search: SearchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotConfig {
    /// User id the agent is mentioned by (`<@id>`).
    #[serde(default = "default_bot_id")]
    pub id: String,
    /// Display name used when the agent posts.
    #[serde(default = "default_bot_name")]
    pub name: String,
}

fn default_bot_id() -> String {
    "courier".to_string()
}

fn default_bot_name() -> String {
    "courier".to_string()
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            id: default_bot_id(),
            name: default_bot_name(),
        }
    }
}

/// Agent defaults (model, backend URL, workspace, static system prompt).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentsConfig {
    /// Ollama model name exactly as `ollama list` shows it (e.g. "llama3.2:latest").
    pub default_model: Option<String>,
    /// Ollama base URL. Overridden by COURIER_OLLAMA_URL env.
    pub ollama_base_url: Option<String>,
    /// Workspace root (default ~/.courier/workspace). `SYSTEM.md` here is re-read for every reply.
    pub workspace: Option<PathBuf>,
    /// Static system prompt; `SYSTEM.md` takes precedence when present.
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchConfig {
    /// Messages of channel history given to the model (default 10).
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Characters of page text kept for URL summaries (default 5000).
    #[serde(default = "default_fetch_max_chars")]
    pub fetch_max_chars: usize,
    /// Let URL summaries fetch loopback and private-network hosts (default false).
    #[serde(default)]
    pub fetch_allow_private_hosts: bool,
    /// Bound on each model, search, or fetch call, in seconds (default 60).
    #[serde(default = "default_upstream_timeout_secs")]
    pub upstream_timeout_secs: u64,
    #[serde(default = "default_schedule_prefix")]
    pub schedule_prefix: String,
    #[serde(default = "default_time_prefix")]
    pub time_prefix: String,
    /// Extra system message appended after the augmented prompt on URL/search replies.
    #[serde(default)]
    pub augmented_directive: Option<String>,
}

fn default_history_limit() -> usize {
    10
}

fn default_fetch_max_chars() -> usize {
    crate::fetch::DEFAULT_MAX_CHARS
}

fn default_upstream_timeout_secs() -> u64 {
    60
}

fn default_schedule_prefix() -> String {
    "!schedule".to_string()
}

fn default_time_prefix() -> String {
    "!time".to_string()
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
            fetch_max_chars: default_fetch_max_chars(),
            fetch_allow_private_hosts: false,
            upstream_timeout_secs: default_upstream_timeout_secs(),
            schedule_prefix: default_schedule_prefix(),
            time_prefix: default_time_prefix(),
            augmented_directive: None,
        }
    }
}

impl DispatchConfig {
    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchConfig {
    /// When false, search-augmented replies fall back to an inline "search unavailable" note.
    #[serde(default = "default_search_enabled")]
    pub enabled: bool,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
}

fn default_search_enabled() -> bool {
    true
}

fn default_max_results() -> usize {
    5
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            enabled: default_search_enabled(),
            max_results: default_max_results(),
        }
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

/// Resolve the Ollama base URL: env COURIER_OLLAMA_URL overrides config.
pub fn resolve_ollama_base_url(config: &Config) -> Option<String> {
    non_empty_env("COURIER_OLLAMA_URL").or_else(|| {
        config
            .agents
            .ollama_base_url
            .as_ref()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    })
}

/// Resolve the model: explicit override, then config, then the built-in fallback.
pub fn resolve_model(config: &Config, override_model: Option<&str>) -> String {
    override_model
        .or(config.agents.default_model.as_deref())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| DEFAULT_MODEL.to_string())
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("COURIER_CONFIG_PATH").map(PathBuf::from).unwrap_or_else(|_| {
        dirs::home_dir()
            .map(|h| h.join(".courier").join("config.json"))
            .unwrap_or_else(|| PathBuf::from("config.json"))
    })
}

/// Resolve workspace directory: config override, else `workspace` next to the config file.
pub fn resolve_workspace_dir(config: &Config, config_path: &Path) -> PathBuf {
    let config_parent = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    match &config.agents.workspace {
        Some(d) if !d.as_os_str().is_empty() => {
            if d.is_absolute() {
                d.clone()
            } else {
                config_parent.join(d)
            }
        }
        _ => config_parent.join("workspace"),
    }
}

/// Load config from the given path (or the default). Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_gives_defaults() {
        let c: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(c.bot.id, "courier");
        assert_eq!(c.dispatch.history_limit, 10);
        assert_eq!(c.dispatch.fetch_max_chars, 5000);
        assert!(!c.dispatch.fetch_allow_private_hosts);
        assert_eq!(c.dispatch.schedule_prefix, "!schedule");
        assert_eq!(c.dispatch.time_prefix, "!time");
        assert_eq!(c.dispatch.upstream_timeout(), Duration::from_secs(60));
        assert!(c.search.enabled);
        assert_eq!(c.search.max_results, 5);
    }

    #[test]
    fn camel_case_keys_parse() {
        let json = r#"{
            "bot": { "id": "1234" },
            "agents": { "defaultModel": "qwen3:8b", "systemPrompt": "be brief" },
            "dispatch": {
                "historyLimit": 4,
                "upstreamTimeoutSecs": 0,
                "augmentedDirective": "short",
                "fetchAllowPrivateHosts": true
            },
            "search": { "enabled": false }
        }"#;
        let c: Config = serde_json::from_str(json).unwrap();
        assert_eq!(c.bot.id, "1234");
        assert_eq!(c.bot.name, "courier");
        assert_eq!(c.agents.system_prompt.as_deref(), Some("be brief"));
        assert_eq!(c.dispatch.history_limit, 4);
        assert_eq!(c.dispatch.upstream_timeout(), Duration::from_secs(1));
        assert_eq!(c.dispatch.augmented_directive.as_deref(), Some("short"));
        assert!(c.dispatch.fetch_allow_private_hosts);
        assert!(!c.search.enabled);
        assert_eq!(resolve_model(&c, None), "qwen3:8b");
        assert_eq!(resolve_model(&c, Some("llama3.2:1b")), "llama3.2:1b");
    }

    #[test]
    fn model_falls_back_when_unset() {
        let c = Config::default();
        assert_eq!(resolve_model(&c, Some("  ")), DEFAULT_MODEL);
        assert_eq!(resolve_model(&c, None), DEFAULT_MODEL);
    }

    #[test]
    fn workspace_defaults_next_to_config() {
        let c = Config::default();
        let path = Path::new("/home/user/.courier/config.json");
        assert_eq!(
            resolve_workspace_dir(&c, path),
            PathBuf::from("/home/user/.courier/workspace")
        );
    }

    #[test]
    fn workspace_override_relative_and_absolute() {
        let mut c = Config::default();
        let path = Path::new("/home/user/.courier/config.json");
        c.agents.workspace = Some(PathBuf::from("ws"));
        assert_eq!(
            resolve_workspace_dir(&c, path),
            PathBuf::from("/home/user/.courier/ws")
        );
        c.agents.workspace = Some(PathBuf::from("/srv/ws"));
        assert_eq!(resolve_workspace_dir(&c, path), PathBuf::from("/srv/ws"));
    }

    #[test]
    fn missing_file_loads_defaults() {
        let path = std::env::temp_dir().join(format!("courier-missing-{}.json", uuid::Uuid::new_v4()));
        let (c, used) = load_config(Some(path.clone())).unwrap();
        assert_eq!(used, path);
        assert_eq!(c.dispatch.history_limit, 10);
    }

    #[test]
    fn invalid_json_is_an_error() {
        let path = std::env::temp_dir().join(format!("courier-bad-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, "{ not json").unwrap();
        assert!(load_config(Some(path.clone())).is_err());
        let _ = std::fs::remove_file(&path);
    }
}
