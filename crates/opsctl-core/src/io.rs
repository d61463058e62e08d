use crate::error::{OpsError, Result};
use std::io::{ErrorKind, Write};
use std::path::Path;
use tempfile::NamedTempFile;

/// Create `path` with `contents`, creating parent directories as needed.
///
/// Returns `Ok(false)` and leaves the file alone when it already exists. The
/// contents are staged in a sibling tempfile and linked into place only if the
/// name is still free, so a concurrent `config init` never clobbers a config
/// and a reader never sees a half-written one.
pub fn create_new(path: &Path, contents: &[u8]) -> Result<bool> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut staged = NamedTempFile::new_in(dir)?;
    staged.write_all(contents)?;
    match staged.persist_noclobber(path) {
        Ok(_) => Ok(true),
        Err(e) if e.error.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(OpsError::Io(e.error)),
    }
}
