use thiserror::Error;

/// Failure surface of CDP requests. Cloneable so a single disconnect can be
/// fanned out to every pending waiter.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum CdpError {
    #[error("connection closed")]
    ConnectionClosed,
    #[error("cdp error {code}: {message}")]
    Protocol { code: i64, message: String },
    #[error("request timed out")]
    Timeout,
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("serialization failure: {0}")]
    Serde(String),
}

impl CdpError {
    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }
}
