use crate::error::{McpSyncError, McpSyncResult};
use crate::ledger::ServerSection;
use crate::targets::TargetSchema;
use serde_json::{Map, Value};
use std::path::Path;
use tokio::fs;
use tokio::io::AsyncWriteExt;

pub(crate) const SERVERS_KEY: &str = "mcpServers";

/// Raw file bytes, `None` when the file does not exist.
pub(crate) async fn read_bytes(path: &Path) -> McpSyncResult<Option<Vec<u8>>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(McpSyncError::TargetReadError(format!(
            "{}: {}",
            path.display(),
            e
        ))),
    }
}

/// Parse a config document. The root must be a JSON object.
pub(crate) fn parse_document(path: &Path, bytes: &[u8]) -> McpSyncResult<Value> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Object(Map::new()));
    }
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|e| McpSyncError::TargetMalformed(format!("{}: {}", path.display(), e)))?;
    if !value.is_object() {
        return Err(McpSyncError::TargetMalformed(format!(
            "{}: root is not an object",
            path.display()
        )));
    }
    Ok(value)
}

/// Entries of the `mcpServers` object, empty when the key is absent.
pub(crate) fn server_entries<'a>(
    path: &Path,
    root: &'a Value,
) -> McpSyncResult<Option<&'a Map<String, Value>>> {
    match root.get(SERVERS_KEY) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map)),
        Some(_) => Err(McpSyncError::TargetMalformed(format!(
            "{}: {} is not an object",
            path.display(),
            SERVERS_KEY
        ))),
    }
}

/// Decode every entry the schema understands. Entries it cannot decode are
/// skipped with a warning.
pub(crate) fn decode_section(
    path: &Path,
    root: &Value,
    schema: &dyn TargetSchema,
) -> McpSyncResult<ServerSection> {
    let mut section = ServerSection::new();
    let Some(entries) = server_entries(path, root)? else {
        return Ok(section);
    };
    for (name, entry) in entries {
        match schema.decode(entry) {
            Some(transport) => {
                section.insert(name.clone(), transport);
            }
            None => {
                log::warn!(
                    "skipping unsupported MCP server entry '{}' in {}",
                    name,
                    path.display()
                );
            }
        }
    }
    Ok(section)
}

/// Replace `mcpServers` in `existing`, keeping every other top-level key.
///
/// Entries this target never writes (undecodable ones and transports the
/// schema does not support) are carried over unless a rendered entry takes
/// their name.
pub(crate) fn render_document(
    existing: Option<Value>,
    rendered: Map<String, Value>,
    schema: &dyn TargetSchema,
) -> McpSyncResult<Vec<u8>> {
    let mut root = match existing {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };

    let mut servers = Map::new();
    if let Some(Value::Object(previous)) = root.get(SERVERS_KEY) {
        for (name, entry) in previous {
            let foreign = match schema.decode(entry) {
                Some(transport) => !schema.supports(transport.kind()),
                None => true,
            };
            if foreign && !rendered.contains_key(name) {
                servers.insert(name.clone(), entry.clone());
            }
        }
    }
    servers.extend(rendered);
    root.insert(SERVERS_KEY.to_string(), Value::Object(servers));

    let mut bytes = serde_json::to_vec_pretty(&Value::Object(root))
        .map_err(|e| McpSyncError::TargetWriteError(format!("serialization: {}", e)))?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Write to a sibling temp file, then rename over `path`.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> McpSyncResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| McpSyncError::TargetWriteError(format!("create_dir_all: {}", e)))?;
    }

    let temp_path = path.with_extension("json.tmp");
    {
        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| McpSyncError::TargetWriteError(format!("create tmp: {}", e)))?;
        file.write_all(bytes)
            .await
            .map_err(|e| McpSyncError::TargetWriteError(format!("write tmp: {}", e)))?;
        file.sync_all()
            .await
            .map_err(|e| McpSyncError::TargetWriteError(format!("sync tmp: {}", e)))?;
    }

    // Keep restrictive modes such as 0600 on ~/.claude.json.
    if let Ok(metadata) = fs::metadata(path).await {
        let _ = fs::set_permissions(&temp_path, metadata.permissions()).await;
    }

    fs::rename(&temp_path, path)
        .await
        .map_err(|e| McpSyncError::TargetWriteError(format!("rename: {}", e)))?;
    Ok(())
}
