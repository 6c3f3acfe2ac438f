use std::path::Path;

use anyhow::{Context, Result};

use crate::config::StraumurConfig;

/// Load configuration with standard priority:
/// ./straumur.toml > ~/.config/straumur/config.toml > defaults
///
/// The `PORT` environment variable overrides the server port afterwards.
pub fn load_config() -> Result<StraumurConfig> {
    let config = find_config()?;
    apply_env(config, std::env::var("PORT").ok().as_deref())
}

fn find_config() -> Result<StraumurConfig> {
    // Try local first
    if let Some(config) = try_load_from_path("./straumur.toml")? {
        return Ok(config);
    }

    // Try user config
    if let Some(config_dir) = dirs::config_dir() {
        let user_config = config_dir.join("straumur").join("config.toml");
        if let Some(config) = try_load_from_path(&user_config)? {
            return Ok(config);
        }
    }

    Ok(StraumurConfig::default())
}

/// Load from specific path.
pub fn load_config_from_path(path: &Path) -> Result<StraumurConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let config: StraumurConfig =
        toml::from_str(&contents).with_context(|| format!("failed to parse {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

fn try_load_from_path(path: impl AsRef<Path>) -> Result<Option<StraumurConfig>> {
    let path = path.as_ref();
    if path.exists() {
        log::debug!("Loading config from {}", path.display());
        Ok(Some(load_config_from_path(path)?))
    } else {
        Ok(None)
    }
}

fn apply_env(mut config: StraumurConfig, port: Option<&str>) -> Result<StraumurConfig> {
    if let Some(port) = port {
        config.server.port = port
            .trim()
            .parse()
            .with_context(|| format!("PORT is not a valid port number: {port:?}"))?;
    }
    Ok(config)
}
