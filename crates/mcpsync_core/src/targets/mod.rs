//! Readers and writers for the external config files.
//!
//! Each target owns one JSON file with an `mcpServers` object. Reads turn
//! entries into [`Server`] records tagged with the target; writes replace
//! the `mcpServers` object with what the registry says belongs there and
//! leave the rest of the document alone.

pub mod claude_code;
pub mod claude_desktop;
pub(crate) mod document;
pub mod enterprise;

use crate::error::{McpSyncError, McpSyncResult};
use crate::ledger::{ServerSection, WriteLedger, fingerprint};
use crate::settings::Settings;
use mcpsync_registry::{Server, SyncTarget, TransportConfig, TransportKind};
use mcpsync_shared::paths::expand_tilde;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Translation between [`TransportConfig`] and one target's entry format.
pub trait TargetSchema: Send + Sync {
    fn supports(&self, kind: TransportKind) -> bool;
    /// `None` for entries this target format cannot express.
    fn decode(&self, entry: &Value) -> Option<TransportConfig>;
    fn encode(&self, transport: &TransportConfig) -> Option<Value>;
}

pub fn schema(target: SyncTarget) -> &'static dyn TargetSchema {
    match target {
        SyncTarget::ClaudeDesktop => &claude_desktop::ClaudeDesktopSchema,
        SyncTarget::ClaudeCode => &claude_code::ClaudeCodeSchema,
    }
}

/// Non-string env/header values are kept as their JSON text.
pub(crate) fn string_map(raw: BTreeMap<String, Value>) -> BTreeMap<String, String> {
    raw.into_iter()
        .filter_map(|(key, value)| match value {
            Value::String(s) => Some((key, s)),
            Value::Null => None,
            other => Some((key, other.to_string())),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetLocation {
    pub path: PathBuf,
    /// Well-known location; availability also looks for the installed app.
    /// Overridden locations count as available once their directory exists.
    pub detect_install: bool,
}

impl TargetLocation {
    pub fn custom(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            detect_install: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetPaths {
    pub claude_desktop: TargetLocation,
    pub claude_code: TargetLocation,
    pub enterprise: Option<PathBuf>,
}

impl TargetPaths {
    pub fn from_settings(settings: &Settings) -> Self {
        let locate = |target: SyncTarget, default: Option<PathBuf>| match &settings.target(target).path {
            Some(path) if !path.trim().is_empty() => TargetLocation::custom(expand_tilde(path)),
            _ => match default {
                Some(path) => TargetLocation {
                    path,
                    detect_install: true,
                },
                // No home directory; nothing will ever exist here.
                None => TargetLocation::custom(PathBuf::new()),
            },
        };
        Self {
            claude_desktop: locate(SyncTarget::ClaudeDesktop, claude_desktop::default_path()),
            claude_code: locate(SyncTarget::ClaudeCode, claude_code::default_path()),
            enterprise: Some(match &settings.enterprise_path {
                Some(path) if !path.trim().is_empty() => expand_tilde(path),
                _ => enterprise::default_path(),
            }),
        }
    }

    /// All files under `dir`, with install detection off.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            claude_desktop: TargetLocation::custom(
                dir.join("Claude").join(claude_desktop::CONFIG_FILE),
            ),
            claude_code: TargetLocation::custom(dir.join(claude_code::CONFIG_FILE)),
            enterprise: Some(dir.join(enterprise::CONFIG_FILE)),
        }
    }

    pub fn location(&self, target: SyncTarget) -> &TargetLocation {
        match target {
            SyncTarget::ClaudeDesktop => &self.claude_desktop,
            SyncTarget::ClaudeCode => &self.claude_code,
        }
    }
}

fn section_from_bytes(
    path: &Path,
    bytes: Option<Vec<u8>>,
    schema: &dyn TargetSchema,
) -> McpSyncResult<ServerSection> {
    let Some(bytes) = bytes else {
        return Ok(ServerSection::new());
    };
    let root = document::parse_document(path, &bytes)?;
    document::decode_section(path, &root, schema)
}

/// Result of a successful target write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReceipt {
    /// Ids of the servers now present in the file
    pub written: Vec<String>,
    /// False when the file already had exactly this content
    pub changed: bool,
}

/// Whether `server` belongs in `target`'s file.
pub fn is_writable(target: SyncTarget, server: &Server) -> bool {
    server.enabled
        && !server.is_enterprise()
        && server.targets(target)
        && schema(target).supports(server.transport.kind())
}

/// Section the registry would write for `target`.
pub fn expected_section(target: SyncTarget, servers: &[Server]) -> ServerSection {
    servers
        .iter()
        .filter(|server| is_writable(target, server))
        .map(|server| (server.name.clone(), server.transport.clone()))
        .collect()
}

/// The part of a decoded section that `target`'s writer manages. Entries of
/// transports the target cannot write are read but never rewritten.
pub fn managed_part(target: SyncTarget, section: &ServerSection) -> ServerSection {
    let schema = schema(target);
    section
        .iter()
        .filter(|(_, transport)| schema.supports(transport.kind()))
        .map(|(name, transport)| (name.clone(), transport.clone()))
        .collect()
}

pub struct TargetStore {
    paths: RwLock<TargetPaths>,
    ledger: WriteLedger,
    write_locks: HashMap<SyncTarget, Mutex<()>>,
}

impl TargetStore {
    pub fn new(paths: TargetPaths, ledger: WriteLedger) -> Self {
        Self {
            paths: RwLock::new(paths),
            ledger,
            write_locks: SyncTarget::ALL
                .into_iter()
                .map(|target| (target, Mutex::new(())))
                .collect(),
        }
    }

    pub fn ledger(&self) -> &WriteLedger {
        &self.ledger
    }

    pub fn paths(&self) -> TargetPaths {
        self.paths.read().clone()
    }

    pub fn set_paths(&self, paths: TargetPaths) {
        *self.paths.write() = paths;
    }

    pub fn path(&self, target: SyncTarget) -> PathBuf {
        self.paths.read().location(target).path.clone()
    }

    pub fn exists(&self, target: SyncTarget) -> bool {
        self.path(target).is_file()
    }

    /// Whether the consuming app looks installed, so writing its file makes sense.
    pub fn is_available(&self, target: SyncTarget) -> bool {
        let location = self.paths.read().location(target).clone();
        if location.path.as_os_str().is_empty() {
            return false;
        }
        if !location.detect_install {
            return location.path.parent().is_some_and(Path::is_dir);
        }
        match target {
            SyncTarget::ClaudeDesktop => claude_desktop::is_installed(&location.path),
            SyncTarget::ClaudeCode => claude_code::is_installed(&location.path),
        }
    }

    /// Servers in `target`'s file. Missing, unreadable and malformed files all
    /// read as empty.
    pub async fn read(&self, target: SyncTarget) -> Vec<Server> {
        match self.read_strict(target).await {
            Ok(servers) => servers,
            Err(e) => {
                log::warn!("ignoring {} config: {}", target, e);
                Vec::new()
            }
        }
    }

    /// Like [`read`](Self::read) but reports unreadable and malformed files.
    pub async fn read_strict(&self, target: SyncTarget) -> McpSyncResult<Vec<Server>> {
        let section = self.read_section(target).await?;
        Ok(section
            .into_iter()
            .map(|(name, transport)| Server::imported(name, transport, target))
            .collect())
    }

    pub async fn read_section(&self, target: SyncTarget) -> McpSyncResult<ServerSection> {
        let path = self.path(target);
        let bytes = document::read_bytes(&path).await?;
        section_from_bytes(&path, bytes, schema(target))
    }

    /// Blocking variant for the watcher's delivery thread.
    pub fn read_section_blocking(&self, target: SyncTarget) -> McpSyncResult<ServerSection> {
        let path = self.path(target);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(McpSyncError::TargetReadError(format!(
                    "{}: {}",
                    path.display(),
                    e
                )));
            }
        };
        section_from_bytes(&path, bytes, schema(target))
    }

    pub async fn read_enterprise(&self) -> McpSyncResult<Vec<Server>> {
        let path = self.paths.read().enterprise.clone();
        match path {
            Some(path) => enterprise::read_servers(&path).await,
            None => Ok(Vec::new()),
        }
    }

    /// Replace `target`'s server section with the writable subset of `servers`.
    /// Entries the target cannot write stay in the file.
    ///
    /// Writes to the same target are serialized. The file is read back after
    /// the rename; if it no longer holds what was written, someone else wrote
    /// in between and the result is [`McpSyncError::Conflict`].
    pub async fn write(&self, target: SyncTarget, servers: &[Server]) -> McpSyncResult<WriteReceipt> {
        let _guard = match self.write_locks.get(&target) {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };
        let path = self.path(target);
        let schema = schema(target);

        let selected: Vec<&Server> = servers
            .iter()
            .filter(|server| is_writable(target, server))
            .collect();
        let mut rendered = Map::new();
        for server in &selected {
            if let Some(entry) = schema.encode(&server.transport) {
                rendered.insert(server.name.clone(), entry);
            }
        }

        let existing = document::read_bytes(&path).await?;
        let root = match &existing {
            Some(bytes) => Some(document::parse_document(&path, bytes)?),
            None => None,
        };
        let bytes = document::render_document(root, rendered, schema)?;

        // Fingerprint the whole section as it will read back, kept entries included.
        let expected = fingerprint(&section_from_bytes(&path, Some(bytes.clone()), schema)?);
        let previous = self.ledger.last(target);
        self.ledger.record(target, expected);

        let changed = existing.as_deref() != Some(bytes.as_slice());
        if changed {
            if let Err(e) = document::write_atomic(&path, &bytes).await {
                match previous {
                    Some(hash) => self.ledger.record(target, hash),
                    None => self.ledger.forget(target),
                }
                return Err(e);
            }
            mcpsync_shared::diagnostics::log(format!(
                "target_written target={} servers={} path={}",
                target.key(),
                selected.len(),
                path.display()
            ));
        }

        let read_back = self.read_section(target).await?;
        if fingerprint(&read_back) != expected {
            return Err(McpSyncError::Conflict(format!(
                "{} changed while it was being written",
                path.display()
            )));
        }

        Ok(WriteReceipt {
            written: selected.iter().map(|server| server.id.clone()).collect(),
            changed,
        })
    }

    /// Accept the current section of `target` as known content.
    pub fn acknowledge(&self, target: SyncTarget, section: &ServerSection) {
        self.ledger.record(target, fingerprint(section));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcpsync_registry::{NewServerInput, ServerSource};
    use serde_json::json;
    use std::collections::BTreeSet;
    use tempfile::tempdir;

    fn server(name: &str, transport: TransportConfig, targets: &[SyncTarget]) -> Server {
        Server::new(NewServerInput {
            name: name.to_string(),
            transport,
            enabled: true,
            sync_targets: targets.iter().copied().collect::<BTreeSet<_>>(),
            source: ServerSource::App,
            description: None,
            requires_auth: false,
        })
    }

    fn store(dir: &Path) -> TargetStore {
        std::fs::create_dir_all(dir.join("Claude")).unwrap();
        TargetStore::new(TargetPaths::in_dir(dir), WriteLedger::new())
    }

    #[tokio::test]
    async fn test_absent_file_reads_empty() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        assert!(!store.exists(SyncTarget::ClaudeCode));
        assert!(store.read(SyncTarget::ClaudeCode).await.is_empty());
        assert!(store.read_strict(SyncTarget::ClaudeDesktop).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_file_is_tolerant_or_strict() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        std::fs::write(store.path(SyncTarget::ClaudeCode), "{ \"mcpServers\": ").unwrap();

        assert!(store.read(SyncTarget::ClaudeCode).await.is_empty());
        assert!(matches!(
            store.read_strict(SyncTarget::ClaudeCode).await,
            Err(McpSyncError::TargetMalformed(_))
        ));
    }

    #[tokio::test]
    async fn test_read_tags_source_and_target() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        std::fs::write(
            store.path(SyncTarget::ClaudeDesktop),
            r#"{ "mcpServers": { "fs": { "command": "npx", "args": ["-y", "server-fs"] } } }"#,
        )
        .unwrap();

        let servers = store.read(SyncTarget::ClaudeDesktop).await;
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].source, ServerSource::ClaudeDesktop);
        assert_eq!(
            servers[0].sync_targets,
            BTreeSet::from([SyncTarget::ClaudeDesktop])
        );
    }

    #[tokio::test]
    async fn test_write_preserves_unrelated_keys() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let path = store.path(SyncTarget::ClaudeCode);
        std::fs::write(
            &path,
            r#"{ "numStartups": 12, "projects": { "/src/app": { "allowedTools": [] } } }"#,
        )
        .unwrap();

        let servers = vec![server(
            "github",
            TransportConfig::http("https://api.githubcopilot.com/mcp/"),
            &[SyncTarget::ClaudeCode],
        )];
        let receipt = store.write(SyncTarget::ClaudeCode, &servers).await.unwrap();
        assert!(receipt.changed);
        assert_eq!(receipt.written, vec![servers[0].id.clone()]);

        let value: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(value["numStartups"], 12);
        assert!(value["projects"]["/src/app"].is_object());
        assert_eq!(
            value["mcpServers"]["github"],
            json!({ "type": "http", "url": "https://api.githubcopilot.com/mcp/" })
        );
    }

    #[tokio::test]
    async fn test_write_is_byte_stable() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let servers = vec![
            server("zeta", TransportConfig::stdio("zeta-mcp", vec![]), &[SyncTarget::ClaudeDesktop]),
            server("alpha", TransportConfig::stdio("alpha-mcp", vec![]), &[SyncTarget::ClaudeDesktop]),
        ];

        store.write(SyncTarget::ClaudeDesktop, &servers).await.unwrap();
        let first = std::fs::read(store.path(SyncTarget::ClaudeDesktop)).unwrap();
        let receipt = store.write(SyncTarget::ClaudeDesktop, &servers).await.unwrap();
        let second = std::fs::read(store.path(SyncTarget::ClaudeDesktop)).unwrap();

        assert!(!receipt.changed);
        assert_eq!(first, second);
        let text = String::from_utf8(first).unwrap();
        assert!(text.find("alpha").unwrap() < text.find("zeta").unwrap());
    }

    #[tokio::test]
    async fn test_write_filters_unwritable_servers() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let mut disabled = server(
            "disabled",
            TransportConfig::stdio("off", vec![]),
            &[SyncTarget::ClaudeDesktop],
        );
        disabled.enabled = false;
        let mut managed = server(
            "managed",
            TransportConfig::stdio("corp", vec![]),
            &[SyncTarget::ClaudeDesktop],
        );
        managed.source = ServerSource::Enterprise;
        let servers = vec![
            server("local", TransportConfig::stdio("local-mcp", vec![]), &[SyncTarget::ClaudeDesktop]),
            server("remote", TransportConfig::http("https://x.example/mcp"), &[SyncTarget::ClaudeDesktop]),
            server("elsewhere", TransportConfig::stdio("cli-only", vec![]), &[SyncTarget::ClaudeCode]),
            disabled,
            managed,
        ];

        let receipt = store.write(SyncTarget::ClaudeDesktop, &servers).await.unwrap();
        assert_eq!(receipt.written, vec![servers[0].id.clone()]);

        let names: Vec<String> = store
            .read(SyncTarget::ClaudeDesktop)
            .await
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["local".to_string()]);
    }

    #[tokio::test]
    async fn test_round_trip_keeps_supported_fields() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let stdio = TransportConfig::Stdio {
            command: "npx".to_string(),
            args: vec!["-y".to_string(), "@modelcontextprotocol/server-github".to_string()],
            env: BTreeMap::from([("GITHUB_TOKEN".to_string(), "ghp_x".to_string())]),
        };
        let sse = TransportConfig::Sse {
            url: "https://mcp.example.com/sse".to_string(),
            headers: BTreeMap::from([("X-Api-Key".to_string(), "k".to_string())]),
        };
        let both = [SyncTarget::ClaudeDesktop, SyncTarget::ClaudeCode];
        let servers = vec![server("gh", stdio.clone(), &both), server("events", sse.clone(), &both)];

        for target in SyncTarget::ALL {
            store.write(target, &servers).await.unwrap();
            assert_eq!(
                store.read_section(target).await.unwrap(),
                expected_section(target, &servers)
            );
        }

        let desktop = store.read_section(SyncTarget::ClaudeDesktop).await.unwrap();
        assert_eq!(desktop.get("gh"), Some(&stdio));
        assert!(!desktop.contains_key("events"));
        let code = store.read_section(SyncTarget::ClaudeCode).await.unwrap();
        assert_eq!(code.get("events"), Some(&sse));
    }

    #[tokio::test]
    async fn test_write_keeps_remote_entries_in_stdio_only_file() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let path = store.path(SyncTarget::ClaudeDesktop);
        std::fs::write(
            &path,
            r#"{ "mcpServers": {
                "github": { "type": "http", "url": "https://api.githubcopilot.com/mcp/" },
                "stale": { "command": "old-server" }
            } }"#,
        )
        .unwrap();
        let servers = vec![server(
            "fs",
            TransportConfig::stdio("npx", vec![]),
            &[SyncTarget::ClaudeDesktop],
        )];

        store.write(SyncTarget::ClaudeDesktop, &servers).await.unwrap();

        let on_disk = store.read_section(SyncTarget::ClaudeDesktop).await.unwrap();
        assert_eq!(
            on_disk.keys().cloned().collect::<Vec<_>>(),
            vec!["fs".to_string(), "github".to_string()]
        );
        assert!(store.ledger().is_known(SyncTarget::ClaudeDesktop, fingerprint(&on_disk)));
        assert_eq!(
            managed_part(SyncTarget::ClaudeDesktop, &on_disk),
            expected_section(SyncTarget::ClaudeDesktop, &servers)
        );
    }

    #[tokio::test]
    async fn test_write_refuses_malformed_file() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let path = store.path(SyncTarget::ClaudeCode);
        std::fs::write(&path, "not json").unwrap();

        let result = store.write(SyncTarget::ClaudeCode, &[]).await;
        assert!(matches!(result, Err(McpSyncError::TargetMalformed(_))));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "not json");
    }

    #[tokio::test]
    async fn test_write_records_ledger() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let servers = vec![server(
            "fs",
            TransportConfig::stdio("npx", vec![]),
            &[SyncTarget::ClaudeCode],
        )];
        store.write(SyncTarget::ClaudeCode, &servers).await.unwrap();

        let on_disk = store.read_section(SyncTarget::ClaudeCode).await.unwrap();
        assert!(store.ledger().is_known(SyncTarget::ClaudeCode, fingerprint(&on_disk)));
    }

    #[test]
    fn test_availability_follows_directory() {
        let dir = tempdir().unwrap();
        let store = TargetStore::new(
            TargetPaths {
                claude_desktop: TargetLocation::custom(
                    dir.path().join("missing").join("claude_desktop_config.json"),
                ),
                claude_code: TargetLocation::custom(dir.path().join(".claude.json")),
                enterprise: None,
            },
            WriteLedger::new(),
        );
        assert!(!store.is_available(SyncTarget::ClaudeDesktop));
        assert!(store.is_available(SyncTarget::ClaudeCode));
    }
}
