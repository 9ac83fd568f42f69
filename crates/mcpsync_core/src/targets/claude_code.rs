//! Claude Code user scope: `~/.claude.json`.
//!
//! The file also carries the CLI's own state (projects, onboarding flags,
//! caches), so only `mcpServers` is ever replaced.

use super::{TargetSchema, string_map};
use mcpsync_registry::{TransportConfig, TransportKind};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = ".claude.json";
const CONFIG_DIR_ENV: &str = "CLAUDE_CONFIG_DIR";

/// Entry shape shared by `~/.claude.json`, `.mcp.json` and `managed-mcp.json`.
#[derive(Debug, Deserialize)]
struct ClaudeCodeEntry {
    #[serde(rename = "type", default)]
    server_type: Option<String>,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, Value>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    headers: BTreeMap<String, Value>,
}

pub struct ClaudeCodeSchema;

impl TargetSchema for ClaudeCodeSchema {
    fn supports(&self, _kind: TransportKind) -> bool {
        true
    }

    fn decode(&self, entry: &Value) -> Option<TransportConfig> {
        let entry: ClaudeCodeEntry = serde_json::from_value(entry.clone()).ok()?;
        let command = entry.command.filter(|c| !c.trim().is_empty());
        let url = entry.url.filter(|u| !u.trim().is_empty());

        let kind = match entry.server_type.as_deref() {
            Some("stdio") => TransportKind::Stdio,
            Some("http") | Some("streamable-http") => TransportKind::Http,
            Some("sse") => TransportKind::Sse,
            Some(_) => return None,
            None if command.is_some() => TransportKind::Stdio,
            None if url.is_some() => TransportKind::Http,
            None => return None,
        };

        match kind {
            TransportKind::Stdio => Some(TransportConfig::Stdio {
                command: command?,
                args: entry.args,
                env: string_map(entry.env),
            }),
            TransportKind::Http => Some(TransportConfig::Http {
                url: url?,
                headers: string_map(entry.headers),
            }),
            TransportKind::Sse => Some(TransportConfig::Sse {
                url: url?,
                headers: string_map(entry.headers),
            }),
        }
    }

    fn encode(&self, transport: &TransportConfig) -> Option<Value> {
        let mut entry = Map::new();
        entry.insert("type".to_string(), json!(transport.kind().as_str()));
        match transport {
            TransportConfig::Stdio { command, args, env } => {
                entry.insert("command".to_string(), json!(command));
                entry.insert("args".to_string(), json!(args));
                entry.insert("env".to_string(), json!(env));
            }
            TransportConfig::Http { url, headers } | TransportConfig::Sse { url, headers } => {
                entry.insert("url".to_string(), json!(url));
                if !headers.is_empty() {
                    entry.insert("headers".to_string(), json!(headers));
                }
            }
        }
        Some(Value::Object(entry))
    }
}

/// `$CLAUDE_CONFIG_DIR/.claude.json`, else `~/.claude.json`.
pub fn default_path() -> Option<PathBuf> {
    if let Some(dir) = std::env::var_os(CONFIG_DIR_ENV).filter(|v| !v.is_empty()) {
        return Some(PathBuf::from(dir).join(CONFIG_FILE));
    }
    dirs::home_dir().map(|home| home.join(CONFIG_FILE))
}

pub fn is_installed(path: &Path) -> bool {
    if path.exists() {
        return true;
    }
    if dirs::home_dir().is_some_and(|home| home.join(".claude").is_dir()) {
        return true;
    }
    which::which("claude").is_ok()
}
