use serde_json::{json, Value};
use thiserror::Error;

/// Error id for a request whose command has no registered handler.
pub const UNRECOGNIZED_REQUEST: u32 = 1014;
/// Error id for a handler that failed while servicing a request.
pub const HANDLER_FAILED: u32 = 1104;

/// Structured failure attached to an error response body.
#[derive(Clone, Debug, Error)]
#[error("{format}")]
pub struct DapError {
    pub id: u32,
    pub format: String,
    pub show_user: bool,
}

impl DapError {
    pub fn new(id: u32, format: impl Into<String>) -> Self {
        Self {
            id,
            format: format.into(),
            show_user: false,
        }
    }

    /// Handler failure surfaced to the requesting client.
    pub fn handler(format: impl Into<String>) -> Self {
        Self::new(HANDLER_FAILED, format)
    }

    pub fn unrecognized(command: &str) -> Self {
        Self::new(UNRECOGNIZED_REQUEST, format!("unrecognized request: {command}"))
    }

    pub fn show_user(mut self) -> Self {
        self.show_user = true;
        self
    }

    /// The `body.error` shape carried on failed responses.
    pub fn to_body(&self) -> Value {
        json!({
            "error": {
                "id": self.id,
                "format": self.format,
                "showUser": self.show_user,
            }
        })
    }
}
