use anyhow::Context;
use opsctl_core::config::Config;
use opsctl_core::paths;
use std::path::{Path, PathBuf};

/// Resolve the config file to read.
///
/// Priority:
/// 1. `--config` flag / `OPSCTL_CONFIG` env var (passed in as `explicit`)
/// 2. Walk upward from `cwd` looking for `.opsctl.yaml`
/// 3. `~/.opsctl/config.yaml`
pub fn resolve(explicit: Option<&Path>) -> anyhow::Result<PathBuf> {
    if let Some(p) = explicit {
        return Ok(p.to_path_buf());
    }

    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    if let Some(found) = paths::find_local_config(&cwd) {
        return Ok(found);
    }

    Ok(paths::user_config_path()?)
}

/// Resolve and load, naming the file in any error.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<(PathBuf, Config)> {
    let path = resolve(explicit)?;
    let config = Config::load(&path)
        .with_context(|| format!("failed to load config from {}", path.display()))?;
    tracing::debug!(path = %path.display(), "loaded config");
    Ok((path, config))
}
