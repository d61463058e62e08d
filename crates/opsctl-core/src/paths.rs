use crate::error::{OpsError, Result};
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// File constants
// ---------------------------------------------------------------------------

/// Project-local config, discovered by walking upward from the cwd.
pub const LOCAL_CONFIG_FILE: &str = ".opsctl.yaml";

pub const USER_CONFIG_DIR: &str = ".opsctl";
pub const USER_CONFIG_FILE: &str = "config.yaml";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn user_config_path() -> Result<PathBuf> {
    let home = home::home_dir().ok_or(OpsError::HomeNotFound)?;
    Ok(home.join(USER_CONFIG_DIR).join(USER_CONFIG_FILE))
}

/// Find the nearest `.opsctl.yaml` at or above `start`.
pub fn find_local_config(start: &Path) -> Option<PathBuf> {
    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(LOCAL_CONFIG_FILE);
        if candidate.is_file() {
            return Some(candidate);
        }
        match dir.parent() {
            Some(p) => dir = p.to_path_buf(),
            None => return None,
        }
    }
}
