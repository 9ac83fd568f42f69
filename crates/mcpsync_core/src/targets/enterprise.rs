//! Administrator-managed `managed-mcp.json`. Read-only.

use super::claude_code::ClaudeCodeSchema;
use super::document;
use crate::error::McpSyncResult;
use mcpsync_registry::Server;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "managed-mcp.json";

pub fn default_path() -> PathBuf {
    if cfg!(target_os = "macos") {
        PathBuf::from("/Library/Application Support/ClaudeCode").join(CONFIG_FILE)
    } else if cfg!(target_os = "windows") {
        PathBuf::from(r"C:\ProgramData\ClaudeCode").join(CONFIG_FILE)
    } else {
        PathBuf::from("/etc/claude-code").join(CONFIG_FILE)
    }
}

/// Every decodable entry as an enterprise server. A missing file is empty.
pub async fn read_servers(path: &Path) -> McpSyncResult<Vec<Server>> {
    let Some(bytes) = document::read_bytes(path).await? else {
        return Ok(Vec::new());
    };
    let root = document::parse_document(path, &bytes)?;
    let section = document::decode_section(path, &root, &ClaudeCodeSchema)?;
    Ok(section
        .into_iter()
        .map(|(name, transport)| Server::enterprise(name, transport))
        .collect())
}
