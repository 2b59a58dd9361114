//! Error types and the structured error payload.
//!
//! Per-request failures and fatal worker failures share one `Error` type.
//! Either way they leave the process as an [`ErrorPayload`]: a JSON object
//! with exactly the keys `name`, `message` and `stack`. Clients receive it
//! as a single netstring frame, the parent receives it as one line on the
//! heartbeat channel.

use crate::app::AppError;
use crate::config::ConfigError;
use crate::netstring::NetstringError;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Netstring(#[from] NetstringError),
    #[error("invalid request headers: {0}")]
    InvalidHeaders(#[source] serde_json::Error),
    #[error("request headers must be a JSON object")]
    HeadersNotObject,
    #[error("request contained no header frame")]
    MissingHeaders,
    #[error(transparent)]
    Application(#[from] AppError),
    #[error("application panicked: {0}")]
    Panic(String),
    #[error("request exceeds {limit} buffered bytes")]
    RequestTooLarge { limit: usize },
    #[error("response body exceeds {limit} bytes")]
    ResponseTooLarge { limit: usize },
    #[error("failed to encode response headers: {0}")]
    EncodeHeaders(#[source] serde_json::Error),
    #[error("no heartbeat connected within {0:?}")]
    HeartbeatTimeout(std::time::Duration),
    #[error("failed to bind {}: {source}", .path.display())]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Stable error name reported in payloads.
    pub fn name(&self) -> &str {
        match self {
            Error::Netstring(_) => "NetstringError",
            Error::InvalidHeaders(_) | Error::HeadersNotObject | Error::MissingHeaders => {
                "InvalidHeaders"
            }
            Error::Application(e) => e.name(),
            Error::Panic(_) => "Panic",
            Error::RequestTooLarge { .. } => "RequestTooLarge",
            Error::ResponseTooLarge { .. } => "ResponseTooLarge",
            Error::EncodeHeaders(_) => "EncodeError",
            Error::HeartbeatTimeout(_) => "HeartbeatTimeout",
            Error::Bind { .. } => "BindError",
            Error::Config(_) => "ConfigError",
            Error::Io(_) => "IoError",
        }
    }

    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload::from_error(self.name(), self)
    }
}

/// Wire form of a failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub name: String,
    pub message: String,
    /// Newline-joined chain of underlying causes, outermost first.
    pub stack: String,
}

impl ErrorPayload {
    pub fn from_error(name: &str, err: &(dyn std::error::Error + 'static)) -> Self {
        let mut stack = Vec::new();
        let mut cause = err.source();
        while let Some(e) = cause {
            stack.push(e.to_string());
            cause = e.source();
        }

        Self {
            name: name.to_string(),
            message: err.to_string(),
            stack: stack.join("\n"),
        }
    }

    pub fn to_json(&self) -> String {
        // Three string fields always serialize.
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                "{{\"name\":{:?},\"message\":{:?},\"stack\":\"\"}}",
                self.name, self.message
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_has_exact_keys() {
        let err = Error::RequestTooLarge { limit: 10 };
        let json: serde_json::Value = serde_json::from_str(&err.to_payload().to_json()).unwrap();
        let obj = json.as_object().unwrap();
        let mut keys: Vec<&str> = obj.keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(keys, ["message", "name", "stack"]);
        assert_eq!(obj["name"], "RequestTooLarge");
        assert_eq!(obj["message"], "request exceeds 10 buffered bytes");
    }

    #[test]
    fn test_payload_stack_follows_sources() {
        let err = Error::Bind {
            path: PathBuf::from("/tmp/x.sock"),
            source: io::Error::new(io::ErrorKind::AddrInUse, "address in use"),
        };
        let payload = err.to_payload();
        assert_eq!(payload.name, "BindError");
        assert!(payload.message.contains("/tmp/x.sock"));
        assert_eq!(payload.stack, "address in use");
    }

    #[test]
    fn test_application_error_keeps_its_name() {
        let err = Error::from(AppError::new("RoutingError", "no route"));
        let payload = err.to_payload();
        assert_eq!(payload.name, "RoutingError");
        assert_eq!(payload.message, "no route");
    }
}
