use std::io;
use std::path::{Path, PathBuf};

/// Environment override for the application directory (used by tests and
/// portable installs).
pub const HOME_ENV: &str = "MCPSYNC_HOME";

/// Get the mcpsync application directory.
/// Checks MCPSYNC_HOME first, then defaults to `<data_dir>/mcpsync`.
pub fn app_dir() -> io::Result<PathBuf> {
    if let Ok(custom_dir) = std::env::var(HOME_ENV) {
        if !custom_dir.trim().is_empty() {
            return Ok(PathBuf::from(custom_dir));
        }
    }

    let base = dirs::data_dir()
        .or_else(dirs::home_dir)
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "Home directory not found"))?;
    Ok(base.join("mcpsync"))
}

/// Get the directory holding diagnostics logs
pub fn app_log_dir() -> io::Result<PathBuf> {
    Ok(app_dir()?.join("logs"))
}

/// Expand a leading `~` in a user-supplied path (cross-platform)
pub fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    if let Some(rest) = path.strip_prefix("~/").or_else(|| path.strip_prefix("~\\")) {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Walk up from `path` to the closest ancestor that exists on disk.
pub fn nearest_existing_ancestor(path: &Path) -> Option<PathBuf> {
    let mut current = path.parent();
    while let Some(dir) = current {
        if dir.as_os_str().is_empty() {
            return None;
        }
        if dir.exists() {
            return Some(dir.to_path_buf());
        }
        current = dir.parent();
    }
    None
}
