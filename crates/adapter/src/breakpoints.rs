//! Plain line breakpoints, fanned out to every debuggable session through
//! `Debugger.setBreakpointByUrl`. Re-setting breakpoints for a source clears
//! the previous ones first.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::debug;

use jsdbg_cdp::CdpSession;
use jsdbg_dap::types::{Breakpoint, SetBreakpointsArguments, Source as DapSource};

pub struct BreakpointManager {
    next_id: AtomicU64,
    /// Source key → CDP breakpoint ids currently installed for it.
    installed: Mutex<HashMap<String, Vec<String>>>,
}

impl BreakpointManager {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            installed: Mutex::new(HashMap::new()),
        }
    }

    pub async fn set_breakpoints(
        &self,
        sessions: &[Arc<CdpSession>],
        arguments: &SetBreakpointsArguments,
    ) -> Vec<Breakpoint> {
        let key = source_key(&arguments.source);
        let url = breakpoint_url(&arguments.source);

        let previous = self.installed.lock().remove(&key).unwrap_or_default();
        for breakpoint_id in previous {
            for session in sessions {
                session.fire(
                    "Debugger.removeBreakpoint",
                    json!({ "breakpointId": breakpoint_id }),
                );
            }
        }

        let mut installed = Vec::new();
        let mut results = Vec::new();
        for requested in &arguments.breakpoints {
            let mut verified = false;
            for session in sessions {
                let response = session
                    .send(
                        "Debugger.setBreakpointByUrl",
                        json!({
                            "url": url,
                            "lineNumber": requested.line.saturating_sub(1),
                            "columnNumber": requested.column.map(|c| c.saturating_sub(1)).unwrap_or(0),
                        }),
                    )
                    .await;
                match response {
                    Ok(result) => {
                        if let Some(id) = result.get("breakpointId").and_then(Value::as_str) {
                            installed.push(id.to_string());
                        }
                        let resolved = result
                            .get("locations")
                            .and_then(Value::as_array)
                            .map(|locations| !locations.is_empty())
                            .unwrap_or(false);
                        verified = verified || resolved;
                    }
                    Err(err) => {
                        debug!(target: "adapter", %err, "setBreakpointByUrl failed");
                    }
                }
            }
            results.push(Breakpoint {
                id: Some(self.next_id.fetch_add(1, Ordering::SeqCst) + 1),
                verified,
                line: Some(requested.line),
                source: Some(arguments.source.clone()),
            });
        }

        self.installed.lock().insert(key, installed);
        results
    }
}

fn source_key(source: &DapSource) -> String {
    source
        .path
        .clone()
        .or_else(|| source.name.clone())
        .unwrap_or_default()
}

/// CDP wants a script URL; filesystem paths become file:// URLs.
fn breakpoint_url(source: &DapSource) -> String {
    let Some(path) = &source.path else {
        return source.name.clone().unwrap_or_default();
    };
    if path.contains("://") {
        path.clone()
    } else if path.starts_with('/') {
        format!("file://{path}")
    } else {
        format!("file:///{}", path.replace('\\', "/"))
    }
}
