//! Error types for Quill

use thiserror::Error;

use crate::agent::llm::Vendor;

/// Result type alias for Quill operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in Quill
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    /// Connection refused, non-2xx status, vendor error frame or an
    /// unparsable top-level envelope. Always escalated.
    #[error("{vendor} transport error: {message}")]
    Transport { vendor: Vendor, message: String },

    #[error("Tool error: {0}")]
    Tool(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Build a transport error for `vendor`.
    pub fn transport(vendor: Vendor, message: impl Into<String>) -> Self {
        Error::Transport {
            vendor,
            message: message.into(),
        }
    }

    /// The bare failure text, without the variant prefix.
    ///
    /// Tool failures are reported back to the model with this text, so a
    /// handler failing with `Error::Tool("disk full")` surfaces as `disk full`.
    pub fn message(&self) -> String {
        match self {
            Error::Config(msg) | Error::Tool(msg) | Error::Other(msg) => msg.clone(),
            Error::Transport { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// True for failures that should propagate out of an exchange.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport { .. })
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_message_is_bare() {
        let err = Error::Tool("disk full".to_string());
        assert_eq!(err.message(), "disk full");
        assert_eq!(err.to_string(), "Tool error: disk full");
    }

    #[test]
    fn test_transport_carries_vendor() {
        let err = Error::transport(Vendor::Anthropic, "HTTP 529: overloaded");
        assert!(err.is_transport());
        assert_eq!(err.to_string(), "anthropic transport error: HTTP 529: overloaded");
    }

    #[test]
    fn test_from_anyhow() {
        let err: Error = anyhow::anyhow!("boom").into();
        assert_eq!(err.message(), "boom");
    }
}
