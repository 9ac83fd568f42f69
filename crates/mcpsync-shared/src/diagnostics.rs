use std::fs::{create_dir_all, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    OnceLock,
};

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::paths;

const DIAG_ENV: &str = "MCPSYNC_DIAG";

static DIAG_ENABLED: AtomicBool = AtomicBool::new(false);
static DIAG_ENABLED_INIT: OnceLock<()> = OnceLock::new();

/// Explicitly set diagnostics enabled state. Called at startup from the
/// debug-logging setting and again whenever that setting changes.
/// If never called, falls back to checking the MCPSYNC_DIAG env var.
pub fn set_enabled(enabled: bool) {
    DIAG_ENABLED.store(enabled, Ordering::Relaxed);
    let _ = DIAG_ENABLED_INIT.set(());
}

pub fn is_enabled() -> bool {
    if DIAG_ENABLED_INIT.get().is_some() {
        return DIAG_ENABLED.load(Ordering::Relaxed);
    }

    let env_enabled = std::env::var(DIAG_ENV)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false);
    if env_enabled {
        DIAG_ENABLED.store(true, Ordering::Relaxed);
    }
    let _ = DIAG_ENABLED_INIT.set(());
    env_enabled
}

fn diagnostics_path() -> Option<PathBuf> {
    static PATH: OnceLock<Option<PathBuf>> = OnceLock::new();
    PATH.get_or_init(|| {
        paths::app_log_dir()
            .ok()
            .map(|dir| dir.join("diagnostics.log"))
    })
    .clone()
}

/// Append a `key=value` trace line to the diagnostics log.
///
/// Every line is also forwarded to the `log` facade at debug level, so a
/// binary running with `RUST_LOG=debug` sees the same trace on stderr.
pub fn log(message: impl AsRef<str>) {
    let message = message.as_ref();
    log::debug!(target: "mcpsync::diag", "{}", message);

    if !is_enabled() {
        return;
    }

    let timestamp = OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "unknown-time".to_string());
    let line = format!("[{}] {}\n", timestamp, message);

    if let Some(path) = diagnostics_path() {
        if let Some(parent) = path.parent() {
            let _ = create_dir_all(parent);
        }
        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(&path) {
            let _ = file.write_all(line.as_bytes());
        }
    }
}
