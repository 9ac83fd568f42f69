//! Canonical registry of MCP server definitions.
//!
//! The registry is the single source of truth for the UI and for sync. All
//! mutation goes through [`ServerRegistry`], which serializes writers behind
//! one mutex, persists every user mutation before returning and publishes a
//! [`RegistryEvent`] so other services (auto-sync, UI) can react.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let registry = ServerRegistry::open_default()?;
//! let server = registry.add(Server::new(NewServerInput { .. }))?;
//! let mut events = registry.subscribe();
//! ```

pub mod error;
pub mod model;
pub mod storage;

pub use error::{RegistryError, RegistryResult};
pub use model::{
    HealthStatus, NewServerInput, Server, ServerMetadata, ServerSource, SyncTarget,
    TransportConfig, TransportKind,
};

use std::path::PathBuf;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use storage::{DebouncedStorage, RegistrySnapshot, Storage, default_storage_root};

const EVENT_CAPACITY: usize = 64;
const HEALTH_SAVE_DEBOUNCE_MS: u64 = 500;

/// Change notifications published by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// User-visible server definitions changed (add/update/remove/import).
    ServersChanged,
    /// The enterprise-managed set was replaced.
    EnterpriseRefreshed,
    /// Only health metadata of one server changed.
    HealthUpdated { id: String },
    /// Only sync bookkeeping changed.
    SyncRecorded,
}

/// One step of a transactional batch, see [`ServerRegistry::apply_batch`].
#[derive(Debug, Clone)]
pub enum RegistryChange {
    Add(Server),
    Update(Server),
    Remove(String),
}

pub struct ServerRegistry {
    storage: DebouncedStorage,
    snapshot: Mutex<RegistrySnapshot>,
    events: broadcast::Sender<RegistryEvent>,
}

impl ServerRegistry {
    pub fn open_default() -> RegistryResult<Self> {
        Self::open(default_storage_root())
    }

    /// Open the registry stored under `root`, reading any persisted state.
    pub fn open(root: PathBuf) -> RegistryResult<Self> {
        let storage = Storage::new(root);
        let snapshot = storage.load()?;
        let debounced = DebouncedStorage::new(storage, HEALTH_SAVE_DEBOUNCE_MS);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            storage: debounced,
            snapshot: Mutex::new(snapshot),
            events,
        })
    }

    /// Re-read persisted local state, replacing the in-memory view.
    pub fn load(&self) -> RegistryResult<()> {
        let mut snapshot = self.snapshot.lock();
        self.storage.flush()?;
        *snapshot = self.storage.load()?;
        drop(snapshot);
        self.emit(RegistryEvent::ServersChanged);
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    pub fn storage_path(&self) -> PathBuf {
        self.storage.file_path()
    }

    /// All servers in insertion order.
    pub fn servers(&self) -> Vec<Server> {
        self.snapshot.lock().servers.clone()
    }

    pub fn get(&self, id: &str) -> Option<Server> {
        self.snapshot
            .lock()
            .servers
            .iter()
            .find(|server| server.id == id)
            .cloned()
    }

    pub fn find_by_name(&self, name: &str) -> Vec<Server> {
        self.snapshot
            .lock()
            .servers
            .iter()
            .filter(|server| server.name == name)
            .cloned()
            .collect()
    }

    /// Servers that should be written to `target`.
    pub fn servers_for_target(&self, target: SyncTarget) -> Vec<Server> {
        self.snapshot
            .lock()
            .servers
            .iter()
            .filter(|server| server.enabled && !server.is_enterprise() && server.targets(target))
            .cloned()
            .collect()
    }

    /// Worst health among enabled local servers, `Unknown` when there are
    /// none. Managed servers are never probed, so they do not count.
    pub fn overall_health_status(&self) -> HealthStatus {
        let snapshot = self.snapshot.lock();
        HealthStatus::aggregate(
            snapshot
                .servers
                .iter()
                .filter(|server| server.enabled && !server.is_enterprise())
                .map(|server| server.metadata.health_status),
        )
    }

    pub fn add(&self, server: Server) -> RegistryResult<Server> {
        let mut snapshot = self.snapshot.lock();
        let mut next = snapshot.clone();
        let added = apply_add(&mut next.servers, server)?;
        self.commit(&mut snapshot, next)?;
        drop(snapshot);
        log::info!("added MCP server '{}'", added.name);
        self.emit(RegistryEvent::ServersChanged);
        Ok(added)
    }

    /// Replace the user-editable fields of an existing server.
    pub fn update(&self, server: Server) -> RegistryResult<Server> {
        let mut snapshot = self.snapshot.lock();
        let mut next = snapshot.clone();
        let updated = apply_update(&mut next.servers, server)?;
        self.commit(&mut snapshot, next)?;
        drop(snapshot);
        self.emit(RegistryEvent::ServersChanged);
        Ok(updated)
    }

    pub fn remove(&self, id: &str) -> RegistryResult<Server> {
        let mut snapshot = self.snapshot.lock();
        let mut next = snapshot.clone();
        let removed = apply_remove(&mut next.servers, id)?;
        self.commit(&mut snapshot, next)?;
        drop(snapshot);
        log::info!("removed MCP server '{}'", removed.name);
        self.emit(RegistryEvent::ServersChanged);
        Ok(removed)
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> RegistryResult<Server> {
        let mut server = self
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        server.enabled = enabled;
        self.update(server)
    }

    /// Apply every change or none of them.
    ///
    /// The batch runs against a copy of the snapshot; the copy only replaces
    /// the live state after it has been persisted.
    pub fn apply_batch(&self, changes: Vec<RegistryChange>) -> RegistryResult<usize> {
        if changes.is_empty() {
            return Ok(0);
        }
        let mut snapshot = self.snapshot.lock();
        let mut next = snapshot.clone();
        let count = changes.len();
        for change in changes {
            match change {
                RegistryChange::Add(server) => {
                    apply_add(&mut next.servers, server)?;
                }
                RegistryChange::Update(server) => {
                    apply_update(&mut next.servers, server)?;
                }
                RegistryChange::Remove(id) => {
                    apply_remove(&mut next.servers, &id)?;
                }
            }
        }
        self.commit(&mut snapshot, next)?;
        drop(snapshot);
        self.emit(RegistryEvent::ServersChanged);
        Ok(count)
    }

    /// Swap in the current contents of the managed file.
    ///
    /// Records that keep their name keep their id and health metadata.
    pub fn replace_enterprise(&self, servers: Vec<Server>) -> RegistryResult<()> {
        let mut snapshot = self.snapshot.lock();
        let mut next = snapshot.clone();

        let previous: Vec<Server> = next
            .servers
            .iter()
            .filter(|server| server.is_enterprise())
            .cloned()
            .collect();
        next.servers.retain(|server| !server.is_enterprise());

        for mut server in servers {
            server.source = ServerSource::Enterprise;
            server.sync_targets.clear();
            if let Some(existing) = previous.iter().find(|p| p.name == server.name) {
                if existing.transport == server.transport && existing.enabled == server.enabled {
                    next.servers.push(existing.clone());
                    continue;
                }
                server.id = existing.id.clone();
                server.metadata = existing.metadata.clone();
                server.metadata.updated_at = now_rfc3339();
            }
            next.servers.push(server);
        }

        let unchanged = next.servers == snapshot.servers;
        if unchanged {
            return Ok(());
        }
        self.commit(&mut snapshot, next)?;
        drop(snapshot);
        self.emit(RegistryEvent::EnterpriseRefreshed);
        Ok(())
    }

    /// Store a health-check result. Returns the previous status.
    pub fn record_health(
        &self,
        id: &str,
        status: HealthStatus,
        message: Option<String>,
    ) -> RegistryResult<HealthStatus> {
        let mut snapshot = self.snapshot.lock();
        let server = snapshot
            .servers
            .iter_mut()
            .find(|server| server.id == id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        let previous = server.metadata.health_status;
        server.metadata.health_status = status;
        server.metadata.health_message = message;
        server.metadata.last_health_check_at = Some(now_rfc3339());
        snapshot.revision += 1;
        self.storage.save(&snapshot)?;
        drop(snapshot);
        self.emit(RegistryEvent::HealthUpdated { id: id.to_string() });
        Ok(previous)
    }

    /// Stamp `last_synced_at` for the servers written to `target`.
    pub fn record_synced(&self, target: SyncTarget, ids: &[String]) -> RegistryResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let now = now_rfc3339();
        let mut snapshot = self.snapshot.lock();
        for server in snapshot
            .servers
            .iter_mut()
            .filter(|server| ids.contains(&server.id))
        {
            server.metadata.last_synced_at.insert(target, now.clone());
        }
        snapshot.revision += 1;
        self.storage.save(&snapshot)?;
        drop(snapshot);
        self.emit(RegistryEvent::SyncRecorded);
        Ok(())
    }

    /// Write any debounced state to disk now.
    pub fn flush(&self) -> RegistryResult<()> {
        let snapshot = self.snapshot.lock();
        self.storage.save_immediate(&snapshot)
    }

    fn commit(&self, live: &mut RegistrySnapshot, mut next: RegistrySnapshot) -> RegistryResult<()> {
        next.revision = live.revision + 1;
        self.storage.save_immediate(&next)?;
        *live = next;
        Ok(())
    }

    fn emit(&self, event: RegistryEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

fn validate(server: &Server) -> RegistryResult<()> {
    if server.name.trim().is_empty() {
        return Err(RegistryError::InvalidInput(
            "server name cannot be empty".to_string(),
        ));
    }
    match &server.transport {
        TransportConfig::Http { url, .. } | TransportConfig::Sse { url, .. } => {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(RegistryError::InvalidInput(format!(
                    "'{}' needs an http:// or https:// url",
                    server.name
                )));
            }
        }
        TransportConfig::Stdio { command, .. } => {
            if command.trim().is_empty() {
                return Err(RegistryError::InvalidInput(format!(
                    "'{}' needs a command",
                    server.name
                )));
            }
        }
    }
    Ok(())
}

fn check_name_scope(servers: &[Server], candidate: &Server) -> RegistryResult<()> {
    if servers.iter().any(|other| candidate.conflicts_with(other)) {
        return Err(RegistryError::DuplicateName(candidate.name.clone()));
    }
    Ok(())
}

fn apply_add(servers: &mut Vec<Server>, mut server: Server) -> RegistryResult<Server> {
    if server.is_enterprise() {
        return Err(RegistryError::ReadOnly(server.name));
    }
    validate(&server)?;
    if servers.iter().any(|existing| existing.id == server.id) {
        return Err(RegistryError::InvalidInput(format!(
            "duplicate server id {}",
            server.id
        )));
    }
    check_name_scope(servers, &server)?;

    let now = now_rfc3339();
    if server.metadata.created_at.is_empty() {
        server.metadata.created_at = now.clone();
    }
    server.metadata.updated_at = now;
    if !server.enabled {
        server.metadata.health_status = HealthStatus::Disabled;
    }
    servers.push(server.clone());
    Ok(server)
}

fn apply_update(servers: &mut [Server], server: Server) -> RegistryResult<Server> {
    let index = servers
        .iter()
        .position(|existing| existing.id == server.id)
        .ok_or_else(|| RegistryError::NotFound(server.id.clone()))?;
    if servers[index].is_enterprise() || server.is_enterprise() {
        return Err(RegistryError::ReadOnly(servers[index].name.clone()));
    }
    validate(&server)?;
    check_name_scope(servers, &server)?;

    let existing = &mut servers[index];
    let was_enabled = existing.enabled;
    existing.name = server.name;
    existing.transport = server.transport;
    existing.enabled = server.enabled;
    existing.sync_targets = server.sync_targets;
    existing.description = server.description;
    existing.metadata.requires_auth = server.metadata.requires_auth;
    existing.metadata.auth_expires_at = server.metadata.auth_expires_at;
    existing.metadata.updated_at = now_rfc3339();

    if !existing.enabled {
        existing.metadata.health_status = HealthStatus::Disabled;
        existing.metadata.health_message = None;
    } else if !was_enabled {
        existing.metadata.health_status = HealthStatus::Unknown;
    }
    Ok(existing.clone())
}

fn apply_remove(servers: &mut Vec<Server>, id: &str) -> RegistryResult<Server> {
    let index = servers
        .iter()
        .position(|existing| existing.id == id)
        .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
    if servers[index].is_enterprise() {
        return Err(RegistryError::ReadOnly(servers[index].name.clone()));
    }
    Ok(servers.remove(index))
}

pub(crate) fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}
