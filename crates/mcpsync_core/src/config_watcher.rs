use crate::error::McpSyncResult;
use crate::ledger::fingerprint;
use crate::targets::TargetStore;
use crate::watcher::FileWatcher;
use mcpsync_registry::SyncTarget;
use mcpsync_shared::diagnostics;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Turns raw file notifications on target configs into external-change
/// signals, dropping the ones caused by our own writes.
pub struct ConfigFileWatcher {
    watcher: Arc<FileWatcher>,
    store: Arc<TargetStore>,
    watched: Mutex<Vec<PathBuf>>,
}

impl ConfigFileWatcher {
    pub fn new(watcher: Arc<FileWatcher>, store: Arc<TargetStore>) -> Self {
        Self {
            watcher,
            store,
            watched: Mutex::new(Vec::new()),
        }
    }

    /// Watch the config of every target in `targets`, replacing earlier watches.
    pub fn start<F>(&self, targets: &[SyncTarget], on_external: F) -> McpSyncResult<()>
    where
        F: Fn(SyncTarget) + Send + Sync + 'static,
    {
        self.stop();
        let on_external: Arc<dyn Fn(SyncTarget) + Send + Sync> = Arc::new(on_external);
        let mut watched = Vec::new();

        for &target in targets {
            let path = self.store.path(target);
            if path.as_os_str().is_empty() {
                continue;
            }
            let store = self.store.clone();
            let on_external = on_external.clone();
            self.watcher.watch(path.clone(), move |changed: &Path| {
                if is_known_content(&store, target) {
                    diagnostics::log(format!(
                        "config_change_ignored target={} path={}",
                        target.key(),
                        changed.display()
                    ));
                    return;
                }
                diagnostics::log(format!(
                    "config_change_external target={} path={}",
                    target.key(),
                    changed.display()
                ));
                on_external(target);
            })?;
            watched.push(path);
        }

        *self.watched.lock() = watched;
        Ok(())
    }

    pub fn stop(&self) {
        let watched = std::mem::take(&mut *self.watched.lock());
        for path in watched {
            self.watcher.stop_watching(&path);
        }
    }

    pub fn watched_paths(&self) -> Vec<PathBuf> {
        self.watched.lock().clone()
    }
}

/// Unreadable or malformed content is never "known" and always surfaces.
fn is_known_content(store: &TargetStore, target: SyncTarget) -> bool {
    match store.read_section_blocking(target) {
        Ok(section) => store.ledger().is_known(target, fingerprint(&section)),
        Err(e) => {
            log::warn!("{} config changed and cannot be read: {}", target, e);
            false
        }
    }
}
