use serde::Serialize;

/// Error types for registry operations.
#[derive(Debug, Clone, Serialize, thiserror::Error)]
#[serde(tag = "type", content = "message")]
pub enum RegistryError {
    #[error("failed to read registry: {0}")]
    ReadError(String),
    #[error("failed to write registry: {0}")]
    WriteError(String),
    #[error("failed to parse registry: {0}")]
    ParseError(String),
    #[error("failed to serialize registry: {0}")]
    SerializeError(String),
    #[error("server not found: {0}")]
    NotFound(String),
    /// Attempted mutation of an enterprise-managed server
    #[error("server is managed by your organization and cannot be changed: {0}")]
    ReadOnly(String),
    #[error("a server named '{0}' already exists for the same sync target")]
    DuplicateName(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl From<std::io::Error> for RegistryError {
    fn from(e: std::io::Error) -> Self {
        RegistryError::ReadError(e.to_string())
    }
}

impl From<serde_json::Error> for RegistryError {
    fn from(e: serde_json::Error) -> Self {
        RegistryError::ParseError(e.to_string())
    }
}

impl From<RegistryError> for String {
    fn from(e: RegistryError) -> Self {
        e.to_string()
    }
}

pub type RegistryResult<T> = Result<T, RegistryError>;
