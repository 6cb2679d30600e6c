use thiserror::Error;

use jsdbg_cdp::CdpError;
use jsdbg_dap::DapError;

/// Failures raised by the adapter model layer.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("no thread with id {0}")]
    UnknownThread(u32),
    #[error("no frame with id {0}")]
    UnknownFrame(u64),
    #[error("no source with reference {0}")]
    UnknownSource(u64),
    #[error("invalid launch configuration: {0}")]
    Config(String),
    #[error("runtime launch failed: {0}")]
    Launch(String),
    #[error("invalid path override: {0}")]
    Override(String),
    #[error("source map unavailable: {0}")]
    SourceMap(String),
    #[error(transparent)]
    Cdp(#[from] CdpError),
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization failure: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<AdapterError> for DapError {
    fn from(err: AdapterError) -> Self {
        match &err {
            AdapterError::Config(_) | AdapterError::Launch(_) => {
                DapError::handler(err.to_string()).show_user()
            }
            _ => DapError::handler(err.to_string()),
        }
    }
}
