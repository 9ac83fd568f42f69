use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// One of the fixed external applications whose MCP configuration file can
/// be read and written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncTarget {
    /// Claude Desktop (`claude_desktop_config.json`)
    ClaudeDesktop,
    /// Claude Code, user scope (`~/.claude.json`)
    ClaudeCode,
}

impl SyncTarget {
    pub const ALL: [SyncTarget; 2] = [SyncTarget::ClaudeDesktop, SyncTarget::ClaudeCode];

    /// Human-readable label for menus and notifications
    pub fn label(self) -> &'static str {
        match self {
            SyncTarget::ClaudeDesktop => "Claude Desktop",
            SyncTarget::ClaudeCode => "Claude Code",
        }
    }

    /// Stable identifier used in settings and log lines
    pub fn key(self) -> &'static str {
        match self {
            SyncTarget::ClaudeDesktop => "claude_desktop",
            SyncTarget::ClaudeCode => "claude_code",
        }
    }
}

impl fmt::Display for SyncTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Where a server definition came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ServerSource {
    /// Created inside the application
    App,
    /// Imported from the Claude Desktop config
    ClaudeDesktop,
    /// Imported from the Claude Code user config
    ClaudeCode,
    /// Administrator-managed file; read-only from the application's side
    Enterprise,
}

impl ServerSource {
    pub fn is_enterprise(self) -> bool {
        matches!(self, ServerSource::Enterprise)
    }
}

impl From<SyncTarget> for ServerSource {
    fn from(target: SyncTarget) -> Self {
        match target {
            SyncTarget::ClaudeDesktop => ServerSource::ClaudeDesktop,
            SyncTarget::ClaudeCode => ServerSource::ClaudeCode,
        }
    }
}

/// Transport-specific connection settings.
///
/// Exactly one payload shape exists per transport kind, so a stdio server
/// can never carry a URL and an HTTP server can never carry a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    Http {
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
    Sse {
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
    },
}

impl TransportConfig {
    pub fn kind(&self) -> TransportKind {
        match self {
            TransportConfig::Http { .. } => TransportKind::Http,
            TransportConfig::Sse { .. } => TransportKind::Sse,
            TransportConfig::Stdio { .. } => TransportKind::Stdio,
        }
    }

    pub fn stdio(command: impl Into<String>, args: Vec<String>) -> Self {
        TransportConfig::Stdio {
            command: command.into(),
            args,
            env: BTreeMap::new(),
        }
    }

    pub fn http(url: impl Into<String>) -> Self {
        TransportConfig::Http {
            url: url.into(),
            headers: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Http,
    Sse,
    Stdio,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Http => "http",
            TransportKind::Sse => "sse",
            TransportKind::Stdio => "stdio",
        }
    }
}

/// Live reachability state of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    NeedsAuth,
    #[default]
    Unknown,
    Disabled,
}

impl HealthStatus {
    /// Severity rank, 0 = most severe.
    pub fn priority(self) -> u8 {
        match self {
            HealthStatus::Unhealthy => 0,
            HealthStatus::NeedsAuth => 1,
            HealthStatus::Degraded => 2,
            HealthStatus::Unknown => 3,
            HealthStatus::Disabled => 4,
            HealthStatus::Healthy => 5,
        }
    }

    /// Whether this status should be reported to the user as a failure.
    pub fn is_failing(self) -> bool {
        matches!(self, HealthStatus::Unhealthy | HealthStatus::NeedsAuth)
    }

    /// Worst status among the given ones, or `Unknown` for an empty input.
    pub fn aggregate<I>(statuses: I) -> HealthStatus
    where
        I: IntoIterator<Item = HealthStatus>,
    {
        statuses
            .into_iter()
            .min_by_key(|status| status.priority())
            .unwrap_or(HealthStatus::Unknown)
    }
}

/// Bookkeeping attached to every server record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerMetadata {
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
    /// Last successful write of this server to each target
    #[serde(default)]
    pub last_synced_at: BTreeMap<SyncTarget, String>,
    #[serde(default)]
    pub last_health_check_at: Option<String>,
    #[serde(default)]
    pub health_status: HealthStatus,
    #[serde(default)]
    pub health_message: Option<String>,
    #[serde(default)]
    pub requires_auth: bool,
    #[serde(default)]
    pub auth_expires_at: Option<String>,
}

/// A single MCP server definition.
///
/// Example:
/// ```rust,ignore
/// let server = Server {
///     id: "0d8c...".to_string(),
///     name: "github".to_string(),
///     transport: TransportConfig::http("https://api.githubcopilot.com/mcp/"),
///     enabled: true,
///     sync_targets: [SyncTarget::ClaudeCode].into_iter().collect(),
///     source: ServerSource::App,
///     description: None,
///     metadata: ServerMetadata::default(),
/// };
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Server {
    pub id: String,
    pub name: String,
    pub transport: TransportConfig,
    pub enabled: bool,
    #[serde(default)]
    pub sync_targets: BTreeSet<SyncTarget>,
    pub source: ServerSource,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub metadata: ServerMetadata,
}

impl Server {
    /// Build a fresh record with a new id and creation timestamps.
    pub fn new(input: NewServerInput) -> Self {
        let now = crate::now_rfc3339();
        let health_status = if input.enabled {
            HealthStatus::Unknown
        } else {
            HealthStatus::Disabled
        };
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: input.name,
            transport: input.transport,
            enabled: input.enabled,
            sync_targets: input.sync_targets,
            source: input.source,
            description: input.description,
            metadata: ServerMetadata {
                created_at: now.clone(),
                updated_at: now,
                requires_auth: input.requires_auth,
                health_status,
                ..ServerMetadata::default()
            },
        }
    }

    /// A server found in an external target's config file.
    pub fn imported(name: impl Into<String>, transport: TransportConfig, target: SyncTarget) -> Self {
        Self::new(NewServerInput {
            name: name.into(),
            transport,
            enabled: true,
            sync_targets: BTreeSet::from([target]),
            source: ServerSource::from(target),
            description: None,
            requires_auth: false,
        })
    }

    /// A server found in the administrator-managed file.
    pub fn enterprise(name: impl Into<String>, transport: TransportConfig) -> Self {
        Self::new(NewServerInput {
            name: name.into(),
            transport,
            enabled: true,
            sync_targets: BTreeSet::new(),
            source: ServerSource::Enterprise,
            description: None,
            requires_auth: false,
        })
    }

    pub fn is_enterprise(&self) -> bool {
        self.source.is_enterprise()
    }

    pub fn targets(&self, target: SyncTarget) -> bool {
        self.sync_targets.contains(&target)
    }

    /// Two servers clash when they share a name inside the same target scope.
    /// Servers without any target share the implicit local scope.
    pub fn conflicts_with(&self, other: &Server) -> bool {
        if self.id == other.id || self.name != other.name {
            return false;
        }
        if self.sync_targets.is_empty() && other.sync_targets.is_empty() {
            return true;
        }
        !self.sync_targets.is_disjoint(&other.sync_targets)
    }
}

/// Input payload for creating a new server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewServerInput {
    pub name: String,
    pub transport: TransportConfig,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub sync_targets: BTreeSet<SyncTarget>,
    #[serde(default = "default_source")]
    pub source: ServerSource,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub requires_auth: bool,
}

fn default_enabled() -> bool {
    true
}

fn default_source() -> ServerSource {
    ServerSource::App
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_is_worst_status() {
        let statuses = [
            HealthStatus::Healthy,
            HealthStatus::Degraded,
            HealthStatus::Unhealthy,
        ];
        assert_eq!(HealthStatus::aggregate(statuses), HealthStatus::Unhealthy);
        assert_eq!(
            HealthStatus::aggregate([HealthStatus::Healthy, HealthStatus::Degraded]),
            HealthStatus::Degraded
        );
        assert_eq!(
            HealthStatus::aggregate(Vec::<HealthStatus>::new()),
            HealthStatus::Unknown
        );
    }

    #[test]
    fn test_priority_order() {
        let ordered = [
            HealthStatus::Unhealthy,
            HealthStatus::NeedsAuth,
            HealthStatus::Degraded,
            HealthStatus::Unknown,
            HealthStatus::Disabled,
            HealthStatus::Healthy,
        ];
        for (index, status) in ordered.iter().enumerate() {
            assert_eq!(status.priority() as usize, index);
        }
    }

    #[test]
    fn test_transport_serializes_tagged() {
        let transport = TransportConfig::stdio("npx", vec!["-y".into(), "server".into()]);
        let value = serde_json::to_value(&transport).unwrap();
        assert_eq!(value["type"], "stdio");
        assert_eq!(value["command"], "npx");

        let http: TransportConfig =
            serde_json::from_str(r#"{"type":"http","url":"https://example.com/mcp"}"#).unwrap();
        assert_eq!(http.kind(), TransportKind::Http);
    }

    #[test]
    fn test_conflicts_within_target_scope() {
        let mut a = Server::imported(
            "github",
            TransportConfig::http("https://a.example"),
            SyncTarget::ClaudeCode,
        );
        let mut b = Server::imported(
            "github",
            TransportConfig::http("https://b.example"),
            SyncTarget::ClaudeDesktop,
        );
        assert!(!a.conflicts_with(&b));

        b.sync_targets.insert(SyncTarget::ClaudeCode);
        assert!(a.conflicts_with(&b));

        a.sync_targets.clear();
        b.sync_targets.clear();
        assert!(a.conflicts_with(&b));

        b.name = "GitHub".to_string();
        assert!(!a.conflicts_with(&b));
    }

    #[test]
    fn test_new_disabled_server_is_pinned() {
        let server = Server::new(NewServerInput {
            name: "off".to_string(),
            transport: TransportConfig::stdio("true", Vec::new()),
            enabled: false,
            sync_targets: BTreeSet::new(),
            source: ServerSource::App,
            description: None,
            requires_auth: false,
        });
        assert_eq!(server.metadata.health_status, HealthStatus::Disabled);
    }
}
