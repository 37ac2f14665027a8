//! Error types for the bridge.

use rmcp::model::ErrorData;
use thiserror::Error;

/// Primary error type for all bridge operations.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Upstream \"{server}\" is not connected")]
    NotConnected { server: String },

    #[error("Unknown upstream \"{0}\"")]
    UnknownUpstream(String),

    #[error("Unknown tool \"{0}\"")]
    UnknownTool(String),

    #[error("Tool name \"{0}\" is not namespaced (expected <server>__<tool>)")]
    InvalidToolName(String),

    #[error("Transport error for \"{server}\": {message}")]
    Transport { server: String, message: String },

    #[error("Upstream server \"{server}\" error: {message}")]
    Upstream { server: String, message: String },

    #[error("Tool \"{tool}\" is disabled by policy")]
    PolicyDenied { tool: String },

    #[error("Tool call \"{tool}\" declined by user")]
    PolicyDeclined { tool: String },

    #[error("Tool \"{tool}\" requires confirmation but the client does not support elicitation")]
    ElicitationUnsupported { tool: String },

    #[error("Timeout after {0}ms")]
    Timeout(u64),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Credential error: {0}")]
    Credential(String),
}

impl BridgeError {
    /// Map onto the MCP error code surfaced to the downstream client.
    pub fn to_error_data(&self) -> ErrorData {
        match self {
            Self::InvalidToolName(_) | Self::UnknownTool(_) | Self::InvalidArgument(_) => {
                ErrorData::invalid_params(self.to_string(), None)
            }
            Self::PolicyDenied { .. }
            | Self::PolicyDeclined { .. }
            | Self::ElicitationUnsupported { .. } => {
                ErrorData::invalid_request(self.to_string(), None)
            }
            _ => ErrorData::internal_error(self.to_string(), None),
        }
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;
    use rmcp::model::ErrorCode;

    #[test]
    fn namespace_errors_map_to_invalid_params() {
        let data = BridgeError::InvalidToolName("create_issue".into()).to_error_data();
        assert_eq!(data.code, ErrorCode::INVALID_PARAMS);
        assert!(data.message.contains("create_issue"));
    }

    #[test]
    fn policy_errors_map_to_invalid_request() {
        let data = BridgeError::PolicyDenied {
            tool: "linear__delete_issue".into(),
        }
        .to_error_data();
        assert_eq!(data.code, ErrorCode::INVALID_REQUEST);
    }

    #[test]
    fn upstream_errors_keep_source_name_and_message() {
        let err = BridgeError::Upstream {
            server: "linear".into(),
            message: "boom".into(),
        };
        let data = err.to_error_data();
        assert_eq!(data.code, ErrorCode::INTERNAL_ERROR);
        assert!(data.message.contains("Upstream server \"linear\" error: boom"));
    }
}
