//! Launch/attach configuration carried on the DAP `launch`/`attach`
//! request. Unknown fields are rejected at load time rather than silently
//! preserved.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use serde::Deserialize;
use serde_json::Value;

use crate::error::AdapterError;

/// Milliseconds to wait for the runtime's CDP endpoint to come up.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 30_000;

#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    Chrome,
    Node,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LaunchConfig {
    #[serde(rename = "type")]
    pub kind: RuntimeKind,
    /// "launch" or "attach"; the request command already carries this, so it
    /// is accepted but not interpreted.
    pub request: Option<String>,
    /// Configuration display name assigned by the client; not interpreted.
    pub name: Option<String>,
    /// Page to open when launching a browser.
    pub url: Option<String>,
    /// Script to run when launching a Node-like runtime.
    pub program: Option<PathBuf>,
    pub cwd: Option<PathBuf>,
    pub env: Option<HashMap<String, String>>,
    pub args: Option<Vec<String>>,
    /// Explicit runtime executable; otherwise resolved from PATH.
    pub runtime_executable: Option<PathBuf>,
    /// Bootloader injected through NODE_OPTIONS for Node discovery.
    pub bootloader: Option<PathBuf>,
    /// Attach directly to this DevTools WebSocket URL.
    pub ws_url: Option<String>,
    /// Attach by probing `http://<host>:<port>/json/version`.
    pub port: Option<u16>,
    pub host: Option<String>,
    pub headless: Option<bool>,
    /// Left-hand patterns rewritten to right-hand ones when projecting
    /// authored sources onto filesystem paths.
    pub source_map_path_overrides: Option<BTreeMap<String, String>>,
    /// Connection timeout in milliseconds; defaults to 30 000.
    pub timeout: Option<u64>,
}

impl LaunchConfig {
    /// Parse and validate the `launch`/`attach` arguments.
    pub fn parse(arguments: &Value, attach: bool) -> Result<Self, AdapterError> {
        let config: LaunchConfig = serde_json::from_value(arguments.clone())
            .map_err(|err| AdapterError::Config(err.to_string()))?;
        config.validate(attach)?;
        Ok(config)
    }

    fn validate(&self, attach: bool) -> Result<(), AdapterError> {
        match self.kind {
            RuntimeKind::Chrome => {
                if !attach && self.url.is_none() {
                    return Err(AdapterError::Config(
                        "launching a browser requires \"url\"".into(),
                    ));
                }
            }
            RuntimeKind::Node => {
                if !attach && self.program.is_none() {
                    return Err(AdapterError::Config(
                        "launching a node runtime requires \"program\"".into(),
                    ));
                }
            }
        }
        if attach && self.ws_url.is_none() && self.port.is_none() {
            return Err(AdapterError::Config(
                "attaching requires \"wsUrl\" or \"port\"".into(),
            ));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS))
    }

    pub fn host(&self) -> &str {
        self.host.as_deref().unwrap_or("127.0.0.1")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_a_minimal_browser_launch() {
        let config = LaunchConfig::parse(
            &json!({"type": "chrome", "url": "http://localhost:8080"}),
            false,
        )
        .unwrap();
        assert_eq!(config.kind, RuntimeKind::Chrome);
        assert_eq!(config.connect_timeout().as_secs(), 30);
    }

    #[test]
    fn rejects_unknown_fields() {
        let err = LaunchConfig::parse(
            &json!({"type": "chrome", "url": "http://x", "smartStep": true}),
            false,
        )
        .unwrap_err();
        assert!(matches!(err, AdapterError::Config(_)));
    }

    #[test]
    fn node_launch_requires_a_program() {
        let err = LaunchConfig::parse(&json!({"type": "node"}), false).unwrap_err();
        assert!(err.to_string().contains("program"));
    }

    #[test]
    fn attach_requires_an_endpoint() {
        let err = LaunchConfig::parse(&json!({"type": "chrome"}), true).unwrap_err();
        assert!(err.to_string().contains("wsUrl"));
        LaunchConfig::parse(&json!({"type": "chrome", "port": 9222}), true).unwrap();
    }
}
