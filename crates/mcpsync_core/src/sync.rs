//! Pushing the registry out to the target files.

use crate::error::{McpSyncError, McpSyncResult};
use crate::events::{CoreEvent, EventBus};
use crate::collaborators::Notifier;
use crate::manager::ConfigurationManager;
use crate::settings::SharedSettings;
use crate::targets::TargetStore;
use futures::future::{BoxFuture, FutureExt, Shared, join_all};
use mcpsync_registry::{RegistryEvent, ServerRegistry, SyncTarget};
use mcpsync_shared::diagnostics;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SkipReason {
    /// Turned off in settings
    Disabled,
    /// The consuming app does not look installed
    NotInstalled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "camelCase")]
pub enum TargetOutcome {
    Written { servers: usize, changed: bool },
    Skipped(SkipReason),
    Failed(String),
    /// The file changed underneath us, or holds edits nobody has reviewed yet
    Conflict(String),
}

impl TargetOutcome {
    pub fn is_attempted(&self) -> bool {
        !matches!(self, TargetOutcome::Skipped(_))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TargetOutcome::Written { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub started_at: String,
    pub finished_at: String,
    pub outcomes: BTreeMap<SyncTarget, TargetOutcome>,
    /// Distinct servers present in at least one written target
    pub servers_synced: usize,
}

impl SyncReport {
    /// True when something was attempted and nothing succeeded.
    pub fn all_failed(&self) -> bool {
        let mut attempted = self.outcomes.values().filter(|o| o.is_attempted()).peekable();
        attempted.peek().is_some() && attempted.all(|outcome| !outcome.is_success())
    }

    pub fn any_changed(&self) -> bool {
        self.outcomes
            .values()
            .any(|outcome| matches!(outcome, TargetOutcome::Written { changed: true, .. }))
    }

    pub fn failure_summary(&self) -> String {
        self.outcomes
            .iter()
            .filter_map(|(target, outcome)| match outcome {
                TargetOutcome::Failed(reason) | TargetOutcome::Conflict(reason) => {
                    Some(format!("{}: {}", target, reason))
                }
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

type SharedSync = Shared<BoxFuture<'static, McpSyncResult<SyncReport>>>;

struct SyncInner {
    registry: Arc<ServerRegistry>,
    targets: Arc<TargetStore>,
    manager: ConfigurationManager,
    settings: SharedSettings,
    notifier: Arc<dyn Notifier>,
    events: EventBus,
    in_flight: Mutex<Option<SharedSync>>,
    syncing: AtomicBool,
    auto_sync: AtomicBool,
    last_sync_at: Mutex<Option<String>>,
    last_report: Mutex<Option<SyncReport>>,
    auto_task: Mutex<Option<JoinHandle<()>>>,
}

/// Clears the in-flight slot when the sync task ends, panics included.
struct InFlightGuard(Arc<SyncInner>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.in_flight.lock().take();
        self.0.syncing.store(false, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct SyncService {
    inner: Arc<SyncInner>,
}

impl SyncService {
    pub fn new(
        registry: Arc<ServerRegistry>,
        targets: Arc<TargetStore>,
        manager: ConfigurationManager,
        settings: SharedSettings,
        notifier: Arc<dyn Notifier>,
        events: EventBus,
    ) -> Self {
        let auto_sync = settings.read().auto_sync;
        Self {
            inner: Arc::new(SyncInner {
                registry,
                targets,
                manager,
                settings,
                notifier,
                events,
                in_flight: Mutex::new(None),
                syncing: AtomicBool::new(false),
                auto_sync: AtomicBool::new(auto_sync),
                last_sync_at: Mutex::new(None),
                last_report: Mutex::new(None),
                auto_task: Mutex::new(None),
            }),
        }
    }

    /// Write the registry to every enabled, installed target.
    ///
    /// A call made while another sync runs waits for that sync and gets its
    /// result instead of starting a second one.
    pub async fn sync(&self) -> McpSyncResult<SyncReport> {
        let shared = {
            let mut in_flight = self.inner.in_flight.lock();
            match in_flight.as_ref() {
                Some(shared) => shared.clone(),
                None => {
                    self.inner.syncing.store(true, Ordering::SeqCst);
                    let inner = self.inner.clone();
                    let handle = tokio::spawn(async move {
                        let guard = InFlightGuard(inner);
                        guard.0.run().await
                    });
                    let shared = async move {
                        handle
                            .await
                            .unwrap_or_else(|e| Err(McpSyncError::SyncAborted(e.to_string())))
                    }
                    .boxed()
                    .shared();
                    *in_flight = Some(shared.clone());
                    shared
                }
            }
        };
        shared.await
    }

    pub fn is_syncing(&self) -> bool {
        self.inner.syncing.load(Ordering::SeqCst)
    }

    pub fn last_sync_at(&self) -> Option<String> {
        self.inner.last_sync_at.lock().clone()
    }

    pub fn last_report(&self) -> Option<SyncReport> {
        self.inner.last_report.lock().clone()
    }

    pub fn set_auto_sync(&self, enabled: bool) {
        self.inner.auto_sync.store(enabled, Ordering::SeqCst);
        self.inner.settings.write().auto_sync = enabled;
        diagnostics::log(format!("auto_sync enabled={}", enabled));
    }

    pub fn auto_sync_enabled(&self) -> bool {
        self.inner.auto_sync.load(Ordering::SeqCst)
    }

    /// Sync after every registry content change while auto-sync is on.
    pub fn start_auto_sync(&self) {
        let mut task = self.inner.auto_task.lock();
        if task.is_some() {
            return;
        }
        let mut events = self.inner.registry.subscribe();
        let service = self.clone();
        *task = Some(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(RegistryEvent::ServersChanged) | Err(RecvError::Lagged(_)) => {}
                    Ok(_) => continue,
                    Err(RecvError::Closed) => break,
                }
                // One sync covers a burst of changes.
                loop {
                    match events.try_recv() {
                        Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
                        Err(_) => break,
                    }
                }
                if !service.auto_sync_enabled() {
                    continue;
                }
                if let Err(e) = service.sync().await {
                    log::warn!("auto-sync failed: {}", e);
                }
            }
        }));
    }

    pub fn stop_auto_sync(&self) {
        if let Some(task) = self.inner.auto_task.lock().take() {
            task.abort();
        }
    }
}

impl SyncInner {
    async fn run(&self) -> McpSyncResult<SyncReport> {
        let started_at = crate::now_rfc3339();
        self.events.publish(CoreEvent::SyncStarted);

        let servers = self.registry.servers();
        let pending = self.manager.external_change_targets();
        let settings = self.settings.read().clone();

        let mut outcomes = BTreeMap::new();
        let mut attempts = Vec::new();
        for target in SyncTarget::ALL {
            if !settings.target_enabled(target) {
                outcomes.insert(target, TargetOutcome::Skipped(SkipReason::Disabled));
            } else if !self.targets.is_available(target) {
                outcomes.insert(target, TargetOutcome::Skipped(SkipReason::NotInstalled));
            } else if pending.contains(&target) {
                outcomes.insert(
                    target,
                    TargetOutcome::Conflict(
                        "config has external changes that were not imported yet".to_string(),
                    ),
                );
            } else {
                attempts.push(target);
            }
        }

        let servers_ref = &servers;
        let results = join_all(attempts.into_iter().map(|target| async move {
            (target, self.targets.write(target, servers_ref).await)
        }))
        .await;

        let mut synced: BTreeSet<String> = BTreeSet::new();
        for (target, result) in results {
            let outcome = match result {
                Ok(receipt) => {
                    if let Err(e) = self.registry.record_synced(target, &receipt.written) {
                        log::warn!("failed to record sync time for {}: {}", target, e);
                    }
                    let count = receipt.written.len();
                    synced.extend(receipt.written);
                    TargetOutcome::Written {
                        servers: count,
                        changed: receipt.changed,
                    }
                }
                Err(McpSyncError::Conflict(reason)) => TargetOutcome::Conflict(reason),
                Err(e) => TargetOutcome::Failed(e.to_string()),
            };
            diagnostics::log(format!("sync_target target={} outcome={:?}", target.key(), outcome));
            outcomes.insert(target, outcome);
        }

        let report = SyncReport {
            started_at,
            finished_at: crate::now_rfc3339(),
            outcomes,
            servers_synced: synced.len(),
        };
        if report.outcomes.values().any(TargetOutcome::is_success) {
            *self.last_sync_at.lock() = Some(report.finished_at.clone());
        }
        *self.last_report.lock() = Some(report.clone());

        self.manager.compute_sync_statuses().await;
        self.events.publish(CoreEvent::SyncFinished(report.clone()));

        if report.all_failed() {
            let reason = report.failure_summary();
            self.notifier.notify_sync_failed(&reason);
            return Err(McpSyncError::AllTargetsFailed(reason));
        }
        if report.any_changed() {
            self.notifier.notify_sync_completed(report.servers_synced);
        }
        Ok(report)
    }
}
