//! Reconciliation between the registry and the target files.

use crate::config_watcher::ConfigFileWatcher;
use crate::error::{McpSyncError, McpSyncResult};
use crate::events::{CoreEvent, EventBus};
use crate::ledger::ServerSection;
use crate::settings::{MergePolicy, SharedSettings};
use crate::targets::{self, TargetStore};
use mcpsync_registry::{RegistryChange, Server, ServerRegistry, SyncTarget, TransportConfig};
use mcpsync_shared::diagnostics;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// Whether a target file matches what the registry would write there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "camelCase")]
pub enum SyncStatus {
    InSync,
    OutOfSync,
    Error(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum MergeItem {
    /// Found only in a target file
    Add(Server),
    /// Registry server updated with what a target file contributed
    Merge(Server),
}

/// Outcome of [`ConfigurationManager::discover_existing_servers`].
#[derive(Debug, Clone, Default)]
pub struct MergePlan {
    pub items: Vec<MergeItem>,
    /// Server sections that were read, per target
    pub observed: BTreeMap<SyncTarget, ServerSection>,
}

impl MergePlan {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn additions(&self) -> usize {
        self.items
            .iter()
            .filter(|item| matches!(item, MergeItem::Add(_)))
            .count()
    }

    pub fn merges(&self) -> usize {
        self.items.len() - self.additions()
    }

    fn into_changes(self) -> (Vec<RegistryChange>, BTreeMap<SyncTarget, ServerSection>) {
        let changes = self
            .items
            .into_iter()
            .map(|item| match item {
                MergeItem::Add(server) => RegistryChange::Add(server),
                MergeItem::Merge(server) => RegistryChange::Update(server),
            })
            .collect();
        (changes, self.observed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImportSummary {
    pub added: usize,
    pub merged: usize,
}

/// Accumulates plan items against a working copy of the registry so later
/// targets see what earlier targets contributed.
struct PlanBuilder {
    working: Vec<Server>,
    plan: MergePlan,
    planned: HashMap<String, usize>,
}

impl PlanBuilder {
    fn new(working: Vec<Server>) -> Self {
        Self {
            working,
            plan: MergePlan::default(),
            planned: HashMap::new(),
        }
    }

    fn local(&self, name: &str) -> impl Iterator<Item = (usize, &Server)> {
        self.working
            .iter()
            .enumerate()
            .filter(move |(_, server)| !server.is_enterprise() && server.name == name)
    }

    /// Same-named local server that already targets `target`.
    fn scoped(&self, name: &str, target: SyncTarget) -> Option<usize> {
        self.local(name)
            .find(|(_, server)| server.targets(target))
            .map(|(index, _)| index)
    }

    fn is_enterprise_name(&self, name: &str) -> bool {
        self.working
            .iter()
            .any(|server| server.is_enterprise() && server.name == name)
    }

    fn add(&mut self, server: Server) {
        self.planned.insert(server.id.clone(), self.plan.items.len());
        self.plan.items.push(MergeItem::Add(server.clone()));
        self.working.push(server);
    }

    fn record(&mut self, index: usize) {
        let server = self.working[index].clone();
        match self.planned.get(&server.id) {
            Some(&slot) => match &mut self.plan.items[slot] {
                MergeItem::Add(planned) | MergeItem::Merge(planned) => *planned = server,
            },
            None => {
                self.planned.insert(server.id.clone(), self.plan.items.len());
                self.plan.items.push(MergeItem::Merge(server));
            }
        }
    }

    /// Fold one external entry in. `adopt_transport` decides whether the
    /// file's connection settings replace the registry's.
    ///
    /// A server is only rewritten with a file's payload when it already
    /// targets that file. A same-named server scoped to other targets gains
    /// `target` when the payloads agree (or the registry's payload wins);
    /// otherwise the entry becomes a separate server scoped to `target`.
    fn absorb(&mut self, target: SyncTarget, name: &str, transport: &TransportConfig, adopt_transport: bool) {
        if let Some(index) = self.scoped(name, target) {
            let server = &mut self.working[index];
            if adopt_transport && server.transport != *transport {
                server.transport = transport.clone();
                self.record(index);
            }
            return;
        }

        let joinable = self
            .local(name)
            .find(|(_, server)| !adopt_transport || server.transport == *transport)
            .map(|(index, _)| index);
        match joinable {
            Some(index) => {
                self.working[index].sync_targets.insert(target);
                self.record(index);
            }
            None if self.is_enterprise_name(name) => {
                diagnostics::log(format!(
                    "import_skipped name={} target={} reason=enterprise",
                    name,
                    target.key()
                ));
            }
            None => self.add(Server::imported(name, transport.clone(), target)),
        }
    }

    /// Drop `target` from local servers that should be in its file but are not.
    fn release_missing(&mut self, target: SyncTarget, section: &ServerSection) {
        let missing: Vec<usize> = self
            .working
            .iter()
            .enumerate()
            .filter(|(_, server)| {
                targets::is_writable(target, server) && !section.contains_key(&server.name)
            })
            .map(|(index, _)| index)
            .collect();
        for index in missing {
            self.working[index].sync_targets.remove(&target);
            self.record(index);
        }
    }
}

#[derive(Clone)]
pub struct ConfigurationManager {
    registry: Arc<ServerRegistry>,
    targets: Arc<TargetStore>,
    settings: SharedSettings,
    events: EventBus,
    external: Arc<Mutex<BTreeSet<SyncTarget>>>,
    statuses: Arc<Mutex<BTreeMap<SyncTarget, SyncStatus>>>,
}

impl ConfigurationManager {
    pub fn new(
        registry: Arc<ServerRegistry>,
        targets: Arc<TargetStore>,
        settings: SharedSettings,
        events: EventBus,
    ) -> Self {
        Self {
            registry,
            targets,
            settings,
            events,
            external: Arc::new(Mutex::new(BTreeSet::new())),
            statuses: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// Enabled targets whose app looks installed.
    pub fn active_targets(&self) -> Vec<SyncTarget> {
        let enabled = self.settings.read().enabled_targets();
        enabled
            .into_iter()
            .filter(|target| self.targets.is_available(*target))
            .collect()
    }

    /// Compare every active target file with the registry.
    ///
    /// Unreadable targets are skipped here; they surface through
    /// [`compute_sync_statuses`](Self::compute_sync_statuses).
    pub async fn discover_existing_servers(&self) -> MergePlan {
        let adopt_transport = self.settings.read().merge_policy == MergePolicy::PreferExternal;
        let mut builder = PlanBuilder::new(self.registry.servers());

        for target in self.active_targets() {
            let section = match self.targets.read_section(target).await {
                Ok(section) => section,
                Err(e) => {
                    log::warn!("skipping discovery in {}: {}", target, e);
                    continue;
                }
            };
            for (name, transport) in &section {
                builder.absorb(target, name, transport, adopt_transport);
            }
            builder.plan.observed.insert(target, section);
        }

        let plan = builder.plan;
        diagnostics::log(format!(
            "discovery_complete add={} merge={}",
            plan.additions(),
            plan.merges()
        ));
        plan
    }

    /// Apply a plan in one registry transaction.
    pub fn import_discovered_servers(&self, plan: MergePlan) -> McpSyncResult<ImportSummary> {
        let summary = ImportSummary {
            added: plan.additions(),
            merged: plan.merges(),
        };
        let (changes, observed) = plan.into_changes();
        self.registry.apply_batch(changes)?;
        for (target, section) in &observed {
            self.targets.acknowledge(*target, section);
        }
        if summary.added + summary.merged > 0 {
            log::info!(
                "imported {} new and merged {} existing MCP server(s)",
                summary.added,
                summary.merged
            );
        }
        Ok(summary)
    }

    /// Re-read the administrator-managed file into the registry.
    pub async fn refresh_enterprise(&self) -> McpSyncResult<usize> {
        let servers = self.targets.read_enterprise().await?;
        let count = servers.len();
        self.registry.replace_enterprise(servers)?;
        Ok(count)
    }

    pub async fn compute_sync_statuses(&self) -> BTreeMap<SyncTarget, SyncStatus> {
        let servers = self.registry.servers();
        let mut statuses = BTreeMap::new();
        for target in self.active_targets() {
            let expected = targets::expected_section(target, &servers);
            let status = match self.targets.read_section(target).await {
                Ok(actual) if targets::managed_part(target, &actual) == expected => {
                    SyncStatus::InSync
                }
                Ok(_) => SyncStatus::OutOfSync,
                Err(e) => SyncStatus::Error(e.to_string()),
            };
            statuses.insert(target, status);
        }

        let changed = {
            let mut current = self.statuses.lock();
            let changed = *current != statuses;
            *current = statuses.clone();
            changed
        };
        if changed {
            self.events
                .publish(CoreEvent::SyncStatusesChanged(statuses.clone()));
        }
        statuses
    }

    /// Statuses from the last computation.
    pub fn sync_statuses(&self) -> BTreeMap<SyncTarget, SyncStatus> {
        self.statuses.lock().clone()
    }

    /// Record that `target` was edited outside the application. Nothing is
    /// imported until [`refresh_from_external_changes`](Self::refresh_from_external_changes).
    pub fn note_external_change(&self, target: SyncTarget) {
        let targets: Vec<SyncTarget> = {
            let mut external = self.external.lock();
            if !external.insert(target) {
                return;
            }
            external.iter().copied().collect()
        };
        log::info!("{} config was changed outside mcpsync", target);
        self.events
            .publish(CoreEvent::ExternalChangesDetected { targets });
    }

    pub fn has_external_changes(&self) -> bool {
        !self.external.lock().is_empty()
    }

    pub fn external_change_targets(&self) -> Vec<SyncTarget> {
        self.external.lock().iter().copied().collect()
    }

    /// Keep the registry's version; the next sync overwrites the edits.
    pub fn discard_external_changes(&self) {
        let had_changes = {
            let mut external = self.external.lock();
            let had = !external.is_empty();
            external.clear();
            had
        };
        if had_changes {
            self.events.publish(CoreEvent::ExternalChangesResolved);
        }
    }

    /// Import pending external edits. Each affected target's file becomes the
    /// registry's view of that target: changed entries update their server,
    /// new entries are added and servers missing from the file lose the target.
    ///
    /// Returns the number of registry changes applied.
    pub async fn refresh_from_external_changes(&self) -> McpSyncResult<usize> {
        let pending = self.external_change_targets();
        if pending.is_empty() {
            return Ok(0);
        }

        let mut builder = PlanBuilder::new(self.registry.servers());
        let mut first_error: Option<McpSyncError> = None;
        for target in pending {
            let section = match self.targets.read_section(target).await {
                Ok(section) => section,
                Err(e) => {
                    log::warn!("cannot refresh from {}: {}", target, e);
                    first_error.get_or_insert(e);
                    continue;
                }
            };
            for (name, transport) in &section {
                builder.absorb(target, name, transport, true);
            }
            builder.release_missing(target, &section);
            builder.plan.observed.insert(target, section);
        }

        if builder.plan.observed.is_empty() {
            return Err(first_error
                .unwrap_or_else(|| McpSyncError::InvalidInput("nothing to refresh".to_string())));
        }

        let (changes, observed) = builder.plan.into_changes();
        let applied = self.registry.apply_batch(changes)?;

        for (target, section) in &observed {
            self.targets.acknowledge(*target, section);
            // A newer edit that landed while we were importing stays pending.
            let current = self.targets.read_section(*target).await.ok();
            if current.as_ref() == Some(section) {
                self.external.lock().remove(target);
            }
        }
        if !self.has_external_changes() {
            self.events.publish(CoreEvent::ExternalChangesResolved);
        }
        diagnostics::log(format!(
            "external_refresh_complete targets={} changes={}",
            observed.len(),
            applied
        ));

        self.compute_sync_statuses().await;
        Ok(applied)
    }

    /// Route external-change notifications for every enabled target here.
    pub fn start_watching(&self, watcher: &ConfigFileWatcher) -> McpSyncResult<()> {
        let targets = self.settings.read().enabled_targets();
        let manager = self.clone();
        watcher.start(&targets, move |target| manager.note_external_change(target))
    }
}
