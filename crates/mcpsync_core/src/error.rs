use mcpsync_registry::RegistryError;
use serde::Serialize;
use std::fmt;

/// Error types for sync engine operations
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "message")]
pub enum McpSyncError {
    /// Failed to read settings file
    ConfigReadError(String),
    /// Failed to write settings file
    ConfigWriteError(String),
    /// Failed to parse settings file
    ConfigParseError(String),
    /// Failed to read an external target config
    TargetReadError(String),
    /// External target config exists but is not valid JSON of the expected shape
    TargetMalformed(String),
    /// Failed to write an external target config
    TargetWriteError(String),
    /// Written content did not survive the read-back
    Conflict(String),
    /// Every attempted target failed during a sync
    AllTargetsFailed(String),
    /// A sync task died before producing a result
    SyncAborted(String),
    /// Could not install a file system watch
    WatchError(String),
    /// Registry rejected or failed an operation
    Registry(RegistryError),
    /// IO error
    IoError(String),
    /// Invalid input parameter
    InvalidInput(String),
}

impl fmt::Display for McpSyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            McpSyncError::ConfigReadError(msg) => write!(f, "failed to read settings: {}", msg),
            McpSyncError::ConfigWriteError(msg) => write!(f, "failed to write settings: {}", msg),
            McpSyncError::ConfigParseError(msg) => write!(f, "failed to parse settings: {}", msg),
            McpSyncError::TargetReadError(msg) => write!(f, "failed to read config: {}", msg),
            McpSyncError::TargetMalformed(msg) => write!(f, "malformed config: {}", msg),
            McpSyncError::TargetWriteError(msg) => write!(f, "failed to write config: {}", msg),
            McpSyncError::Conflict(msg) => write!(f, "conflicting change: {}", msg),
            McpSyncError::AllTargetsFailed(msg) => write!(f, "sync failed for every target: {}", msg),
            McpSyncError::SyncAborted(msg) => write!(f, "sync aborted: {}", msg),
            McpSyncError::WatchError(msg) => write!(f, "failed to watch config: {}", msg),
            McpSyncError::Registry(err) => write!(f, "{}", err),
            McpSyncError::IoError(msg) => write!(f, "IO error: {}", msg),
            McpSyncError::InvalidInput(msg) => write!(f, "invalid input: {}", msg),
        }
    }
}

impl std::error::Error for McpSyncError {}

impl From<std::io::Error> for McpSyncError {
    fn from(e: std::io::Error) -> Self {
        McpSyncError::IoError(e.to_string())
    }
}

impl From<toml::de::Error> for McpSyncError {
    fn from(e: toml::de::Error) -> Self {
        McpSyncError::ConfigParseError(e.to_string())
    }
}

impl From<toml::ser::Error> for McpSyncError {
    fn from(e: toml::ser::Error) -> Self {
        McpSyncError::ConfigWriteError(e.to_string())
    }
}

impl From<RegistryError> for McpSyncError {
    fn from(e: RegistryError) -> Self {
        McpSyncError::Registry(e)
    }
}

impl From<notify::Error> for McpSyncError {
    fn from(e: notify::Error) -> Self {
        McpSyncError::WatchError(e.to_string())
    }
}

/// Result type for sync engine operations
pub type McpSyncResult<T> = Result<T, McpSyncError>;

impl From<McpSyncError> for String {
    fn from(e: McpSyncError) -> Self {
        e.to_string()
    }
}
