//! Claude Desktop: `claude_desktop_config.json`.
//!
//! ```json
//! { "mcpServers": { "fs": { "command": "npx", "args": ["-y", "server-fs"], "env": {} } } }
//! ```
//!
//! Entries are read in the same shape as `~/.claude.json`, so `url` entries
//! (with `type` of `http`, `streamable-http` or `sse`, or no `type` at all for
//! http) are imported. Writes are stdio only: remote servers from the registry
//! are never added to this file, and remote entries already in it are kept
//! as they are.

use super::TargetSchema;
use super::claude_code::ClaudeCodeSchema;
use mcpsync_registry::{TransportConfig, TransportKind};
use serde_json::{Map, Value, json};
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "claude_desktop_config.json";

pub struct ClaudeDesktopSchema;

impl TargetSchema for ClaudeDesktopSchema {
    fn supports(&self, kind: TransportKind) -> bool {
        kind == TransportKind::Stdio
    }

    fn decode(&self, entry: &Value) -> Option<TransportConfig> {
        ClaudeCodeSchema.decode(entry)
    }

    fn encode(&self, transport: &TransportConfig) -> Option<Value> {
        let TransportConfig::Stdio { command, args, env } = transport else {
            return None;
        };
        let mut entry = Map::new();
        entry.insert("command".to_string(), json!(command));
        entry.insert("args".to_string(), json!(args));
        if !env.is_empty() {
            entry.insert("env".to_string(), json!(env));
        }
        Some(Value::Object(entry))
    }
}

/// `<config dir>/Claude/claude_desktop_config.json`
pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("Claude").join(CONFIG_FILE))
}

/// The app keeps its config directory even before any MCP server is added.
pub fn is_installed(path: &Path) -> bool {
    if path.parent().is_some_and(Path::exists) {
        return true;
    }
    cfg!(target_os = "macos") && Path::new("/Applications/Claude.app").exists()
}
