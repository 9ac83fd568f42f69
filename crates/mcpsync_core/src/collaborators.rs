//! Services the engine calls out to but does not implement.

use mcpsync_registry::SyncTarget;

/// Lifecycle control of the consuming applications.
pub trait ProcessControl: Send + Sync {
    fn is_running(&self, app: SyncTarget) -> bool;
    fn is_installed(&self, app: SyncTarget) -> bool;
    fn version(&self, app: SyncTarget) -> Option<String>;
    fn restart(&self, app: SyncTarget) -> Result<(), String>;
}

/// User-facing notifications. Calls are fire-and-forget.
pub trait Notifier: Send + Sync {
    fn notify_failure(&self, server_name: &str, message: &str);
    fn notify_auth_expired(&self, server_name: &str);
    fn notify_recovered(&self, server_name: &str);
    fn notify_sync_completed(&self, server_count: usize);
    fn notify_sync_failed(&self, reason: &str);
}

/// Reports nothing running, so remediation never restarts anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProcessControl;

impl ProcessControl for NoopProcessControl {
    fn is_running(&self, _app: SyncTarget) -> bool {
        false
    }

    fn is_installed(&self, _app: SyncTarget) -> bool {
        false
    }

    fn version(&self, _app: SyncTarget) -> Option<String> {
        None
    }

    fn restart(&self, app: SyncTarget) -> Result<(), String> {
        Err(format!("process control unavailable for {}", app))
    }
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify_failure(&self, server_name: &str, message: &str) {
        log::warn!("MCP server '{}' is failing: {}", server_name, message);
    }

    fn notify_auth_expired(&self, server_name: &str) {
        log::warn!("MCP server '{}' needs to be re-authorized", server_name);
    }

    fn notify_recovered(&self, server_name: &str) {
        log::info!("MCP server '{}' recovered", server_name);
    }

    fn notify_sync_completed(&self, server_count: usize) {
        log::info!("synced {} MCP server(s)", server_count);
    }

    fn notify_sync_failed(&self, reason: &str) {
        log::error!("sync failed: {}", reason);
    }
}
