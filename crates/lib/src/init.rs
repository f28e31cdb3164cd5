//! Initialize the configuration directory: create ~/.courier, a default config, and the workspace.
//!
//! `config/workspace/SYSTEM.md` in this crate is the seed for `~/.courier/workspace/SYSTEM.md`.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::config;
use crate::context::system_prompt_path;

static DEFAULT_SYSTEM_PROMPT: &str = include_str!("../config/workspace/SYSTEM.md");

/// Create the config directory and default files if they do not exist.
/// - Creates the config directory (parent of config file path).
/// - Writes `config.json` with `{}` if missing.
/// - Creates the workspace directory and seeds `SYSTEM.md` if missing.
///
/// Existing files are never overwritten. Returns the config directory.
pub fn init_config_dir(config_path: &Path) -> Result<PathBuf> {
    let config_dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(config_dir)
        .with_context(|| format!("creating config directory {}", config_dir.display()))?;

    if !config_path.exists() {
        std::fs::write(config_path, b"{}")
            .with_context(|| format!("writing default config to {}", config_path.display()))?;
        log::info!("created default config at {}", config_path.display());
    }

    let (cfg, _) = config::load_config(Some(config_path.to_path_buf()))?;
    let workspace = config::resolve_workspace_dir(&cfg, config_path);
    if !workspace.exists() {
        std::fs::create_dir_all(&workspace)
            .with_context(|| format!("creating workspace directory {}", workspace.display()))?;
        log::info!("created workspace directory at {}", workspace.display());
    }
    let system_md = system_prompt_path(&workspace);
    if !system_md.exists() {
        std::fs::write(&system_md, DEFAULT_SYSTEM_PROMPT)
            .with_context(|| format!("writing default SYSTEM.md to {}", system_md.display()))?;
        log::info!("wrote default SYSTEM.md to {}", system_md.display());
    } else {
        log::debug!("SYSTEM.md already exists at {}, skipping", system_md.display());
    }

    Ok(config_dir.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_creates_config_and_workspace_once() {
        let dir = std::env::temp_dir().join(format!("courier-init-{}", uuid::Uuid::new_v4()));
        let config_path = dir.join("config.json");
        let out = init_config_dir(&config_path).unwrap();
        assert_eq!(out, dir);
        assert_eq!(std::fs::read_to_string(&config_path).unwrap(), "{}");
        let system_md = dir.join("workspace").join("SYSTEM.md");
        assert_eq!(
            std::fs::read_to_string(&system_md).unwrap(),
            DEFAULT_SYSTEM_PROMPT
        );

        std::fs::write(&system_md, "custom").unwrap();
        init_config_dir(&config_path).unwrap();
        assert_eq!(std::fs::read_to_string(&system_md).unwrap(), "custom");

        let _ = std::fs::remove_dir_all(&dir);
    }
}
