use crate::collaborators::{LogNotifier, NoopProcessControl, Notifier, ProcessControl};
use crate::config_watcher::ConfigFileWatcher;
use crate::error::McpSyncResult;
use crate::events::EventBus;
use crate::health::{DefaultProber, HealthMonitor, Prober};
use crate::ledger::WriteLedger;
use crate::manager::{ConfigurationManager, ImportSummary, SyncStatus};
use crate::settings::{Settings, SharedSettings};
use crate::sync::SyncService;
use crate::targets::{TargetPaths, TargetStore};
use crate::watcher::FileWatcher;
use mcpsync_registry::{ServerRegistry, SyncTarget};
use mcpsync_shared::diagnostics;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Host-provided services.
#[derive(Clone)]
pub struct Collaborators {
    pub notifier: Arc<dyn Notifier>,
    pub process: Arc<dyn ProcessControl>,
    /// `None` uses [`DefaultProber`].
    pub prober: Option<Arc<dyn Prober>>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            notifier: Arc::new(LogNotifier),
            process: Arc::new(NoopProcessControl),
            prober: None,
        }
    }
}

/// What [`SyncCore::load`] found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadSummary {
    pub servers: usize,
    pub enterprise: usize,
    pub imported: ImportSummary,
    pub statuses: BTreeMap<SyncTarget, SyncStatus>,
}

/// Owns every service of the engine.
///
/// `start` and `shutdown` must be called from within a tokio runtime.
pub struct SyncCore {
    settings: SharedSettings,
    registry: Arc<ServerRegistry>,
    targets: Arc<TargetStore>,
    manager: ConfigurationManager,
    sync: SyncService,
    health: HealthMonitor,
    events: EventBus,
    config_watcher: ConfigFileWatcher,
    started: AtomicBool,
}

impl SyncCore {
    /// Build the services. `registry_root` defaults to the application directory.
    pub fn new(
        settings: Settings,
        registry_root: Option<PathBuf>,
        collaborators: Collaborators,
    ) -> McpSyncResult<Self> {
        let registry = Arc::new(match registry_root {
            Some(root) => ServerRegistry::open(root)?,
            None => ServerRegistry::open_default()?,
        });
        let targets = Arc::new(TargetStore::new(
            TargetPaths::from_settings(&settings),
            WriteLedger::new(),
        ));
        // MCPSYNC_DIAG can still turn tracing on when the setting is off.
        diagnostics::set_enabled(settings.debug_logging || diagnostics::is_enabled());
        let settings = settings.shared();
        let events = EventBus::new();

        let manager = ConfigurationManager::new(
            registry.clone(),
            targets.clone(),
            settings.clone(),
            events.clone(),
        );
        let sync = SyncService::new(
            registry.clone(),
            targets.clone(),
            manager.clone(),
            settings.clone(),
            collaborators.notifier.clone(),
            events.clone(),
        );
        let prober = collaborators
            .prober
            .unwrap_or_else(|| Arc::new(DefaultProber::new()));
        let health = HealthMonitor::new(
            registry.clone(),
            settings.clone(),
            collaborators.notifier,
            collaborators.process,
            prober,
            events.clone(),
        );
        let config_watcher = ConfigFileWatcher::new(Arc::new(FileWatcher::new()?), targets.clone());

        Ok(Self {
            settings,
            registry,
            targets,
            manager,
            sync,
            health,
            events,
            config_watcher,
            started: AtomicBool::new(false),
        })
    }

    /// Read local state, then reconcile it with every available target.
    ///
    /// A broken target or managed file is logged and left for the sync
    /// statuses to report; only registry failures abort the load.
    pub async fn load(&self) -> McpSyncResult<LoadSummary> {
        self.registry.load()?;

        let enterprise = match self.manager.refresh_enterprise().await {
            Ok(count) => count,
            Err(e) => {
                log::warn!("failed to read managed MCP servers: {}", e);
                0
            }
        };
        let plan = self.manager.discover_existing_servers().await;
        let imported = self.manager.import_discovered_servers(plan)?;
        let statuses = self.manager.compute_sync_statuses().await;

        let summary = LoadSummary {
            servers: self.registry.servers().len(),
            enterprise,
            imported,
            statuses,
        };
        log::info!(
            "loaded {} MCP server(s), {} managed",
            summary.servers,
            summary.enterprise
        );
        Ok(summary)
    }

    /// Start the watchers, auto-sync and the health timer.
    pub fn start(&self) -> McpSyncResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(e) = self.manager.start_watching(&self.config_watcher) {
            self.started.store(false, Ordering::SeqCst);
            return Err(e);
        }
        self.sync.start_auto_sync();
        self.health.start();
        diagnostics::log(format!(
            "core_started watched={}",
            self.config_watcher.watched_paths().len()
        ));
        Ok(())
    }

    /// Stop background work and flush pending registry writes.
    pub fn shutdown(&self) {
        self.config_watcher.stop();
        self.health.stop();
        self.sync.stop_auto_sync();
        self.started.store(false, Ordering::SeqCst);
        if let Err(e) = self.registry.flush() {
            log::error!("failed to flush registry on shutdown: {}", e);
        }
        log::info!("sync core stopped");
    }

    /// Apply new settings to the running services.
    pub fn update_settings(&self, settings: Settings) -> McpSyncResult<()> {
        diagnostics::set_enabled(settings.debug_logging);
        self.targets.set_paths(TargetPaths::from_settings(&settings));
        let auto_sync = settings.auto_sync;
        *self.settings.write() = settings;
        self.sync.set_auto_sync(auto_sync);
        if self.started.load(Ordering::SeqCst) {
            self.manager.start_watching(&self.config_watcher)?;
        }
        Ok(())
    }

    pub fn settings(&self) -> Settings {
        self.settings.read().clone()
    }

    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    pub fn manager(&self) -> &ConfigurationManager {
        &self.manager
    }

    pub fn sync(&self) -> &SyncService {
        &self.sync
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn watched_paths(&self) -> Vec<PathBuf> {
        self.config_watcher.watched_paths()
    }
}

impl Drop for SyncCore {
    fn drop(&mut self) {
        self.config_watcher.stop();
        self.health.stop();
        self.sync.stop_auto_sync();
    }
}
