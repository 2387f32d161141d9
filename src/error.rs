//! Error types shared by the inbound and outbound paths.

use thiserror::Error;

/// Result alias used across the bridge.
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Every failure the bridge can surface.
///
/// The variants follow the failure taxonomy of the routing engine: each one
/// carries its own handling policy (see the router and poller for how they
/// are applied).
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Malformed payload or unsupported payload format
    #[error("Decode error: {0}")]
    Decode(String),

    /// Malformed filter predicate
    #[error("Filter error: {0}")]
    Filter(String),

    /// No resolvable columns, or an invalid mapping definition
    #[error("Mapping error: {0}")]
    Mapping(String),

    /// Storage rejected a write
    #[error("Write error: {0}")]
    Write(String),

    /// Broker unreachable or publish timed out
    #[error("Publish error: {0}")]
    Publish(String),

    /// Invalid configuration or configuration store unreachable
    #[error("Configuration error: {0}")]
    Config(String),

    /// Storage query or connection failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Broker subscription or connection failure
    #[error("Broker error: {0}")]
    Broker(String),
}

impl BridgeError {
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    pub fn filter(msg: impl Into<String>) -> Self {
        Self::Filter(msg.into())
    }

    pub fn mapping(msg: impl Into<String>) -> Self {
        Self::Mapping(msg.into())
    }

    pub fn write(msg: impl Into<String>) -> Self {
        Self::Write(msg.into())
    }

    pub fn publish(msg: impl Into<String>) -> Self {
        Self::Publish(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn broker(msg: impl Into<String>) -> Self {
        Self::Broker(msg.into())
    }

    /// Short machine-friendly name of the error kind, used in audit records
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Decode(_) => "decode",
            Self::Filter(_) => "filter",
            Self::Mapping(_) => "mapping",
            Self::Write(_) => "write",
            Self::Publish(_) => "publish",
            Self::Config(_) => "config",
            Self::Storage(_) => "storage",
            Self::Broker(_) => "broker",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_and_kind() {
        let err = BridgeError::mapping("No columns to insert");
        assert_eq!(err.to_string(), "Mapping error: No columns to insert");
        assert_eq!(err.kind(), "mapping");

        assert_eq!(BridgeError::config("x").kind(), "config");
        assert_eq!(BridgeError::publish("x").kind(), "publish");
    }
}
