//! Per-target execution state: paused details, script registry, and the
//! projection of CDP pause data onto DAP stack frames.

use std::collections::HashMap;

use parking_lot::{Mutex, RwLock};

use jsdbg_dap::types::{Source as DapSource, StackFrame};

use crate::ids;
use crate::protocol::{AsyncStackTrace, DebuggerCallFrame, PausedParams, RuntimeCallFrame};
use crate::sources::{ResolvedLocation, SourceContainer, SourceLocation};

pub struct PausedDetails {
    pub reason: String,
    pub call_frames: Vec<DebuggerCallFrame>,
    pub async_stack_trace: Option<AsyncStackTrace>,
    pub hit_breakpoints: Vec<String>,
    /// DAP frame id per real call frame, allocated when the pause arrives.
    pub frame_ids: Vec<u64>,
}

/// One debuggable target. At most one `PausedDetails` at a time; the thread
/// only transitions between running and paused.
pub struct Thread {
    pub id: u32,
    name: RwLock<String>,
    paused: Mutex<Option<PausedDetails>>,
    /// scriptId → (url, compiled source ref).
    scripts: Mutex<HashMap<String, (String, u64)>>,
}

impl Thread {
    pub fn new(name: String) -> Self {
        Self {
            id: ids::next_thread_id(),
            name: RwLock::new(name),
            paused: Mutex::new(None),
            scripts: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub fn set_name(&self, name: String) {
        *self.name.write() = name;
    }

    pub fn is_paused(&self) -> bool {
        self.paused.lock().is_some()
    }

    pub fn register_script(&self, script_id: &str, url: &str, source_ref: u64) {
        self.scripts
            .lock()
            .insert(script_id.to_string(), (url.to_string(), source_ref));
    }

    pub fn script_url(&self, script_id: &str) -> Option<String> {
        self.scripts
            .lock()
            .get(script_id)
            .map(|(url, _)| url.clone())
    }

    /// Compiled source refs owned by this thread, for container cleanup.
    pub fn take_script_refs(&self) -> Vec<u64> {
        self.scripts
            .lock()
            .drain()
            .map(|(_, (_, source_ref))| source_ref)
            .collect()
    }

    /// Record the pause and hand back the DAP stop reason.
    pub fn on_paused(&self, mut params: PausedParams) -> String {
        let frame_ids = params.call_frames.iter().map(|_| ids::next_frame_id()).collect();
        let reason = stop_reason(&params.reason, &params.hit_breakpoints);
        let details = PausedDetails {
            reason: reason.clone(),
            call_frames: std::mem::take(&mut params.call_frames),
            async_stack_trace: params.async_stack_trace.take(),
            hit_breakpoints: std::mem::take(&mut params.hit_breakpoints),
            frame_ids,
        };
        *self.paused.lock() = Some(details);
        reason
    }

    /// Clear the pause; returns whether the thread was paused at all.
    pub fn on_resumed(&self) -> bool {
        self.paused.lock().take().is_some()
    }

    /// The CDP call-frame id for a DAP frame id, if this thread is paused on
    /// that frame.
    pub fn call_frame_for(&self, frame_id: u64) -> Option<String> {
        let paused = self.paused.lock();
        let details = paused.as_ref()?;
        let index = details.frame_ids.iter().position(|&id| id == frame_id)?;
        details
            .call_frames
            .get(index)
            .map(|frame| frame.call_frame_id.clone())
    }

    /// Project the paused state onto DAP stack frames: real frames first,
    /// then each async parent chain behind a label frame. Running threads
    /// project to an empty stack.
    pub fn stack_trace(&self, sources: &SourceContainer) -> Vec<StackFrame> {
        let paused = self.paused.lock();
        let Some(details) = paused.as_ref() else {
            return Vec::new();
        };

        let mut frames = Vec::new();
        for (frame, &frame_id) in details.call_frames.iter().zip(&details.frame_ids) {
            let url = self
                .script_url(&frame.location.script_id)
                .unwrap_or_else(|| frame.url.clone());
            let resolved = sources.resolve(&SourceLocation {
                url,
                line: frame.location.line_number as u32,
                column: frame.location.column_number.unwrap_or(0) as u32,
            });
            frames.push(StackFrame {
                id: frame_id,
                name: frame_name(&frame.function_name),
                line: resolved.line as u64 + 1,
                column: resolved.column as u64 + 1,
                source: projected_source(sources, &resolved),
                presentation_hint: None,
            });
        }

        let mut parent = details.async_stack_trace.as_ref();
        while let Some(chain) = parent {
            let mut chain_frames: &[RuntimeCallFrame] = &chain.call_frames;
            // The first frame of an "async function" chain repeats the frame
            // already shown above it.
            if chain.description.as_deref() == Some("async function") {
                chain_frames = chain_frames.get(1..).unwrap_or_default();
            }
            if !chain_frames.is_empty() {
                frames.push(StackFrame {
                    id: ids::next_frame_id(),
                    name: chain
                        .description
                        .clone()
                        .filter(|description| !description.is_empty())
                        .unwrap_or_else(|| "async".to_string()),
                    line: 1,
                    column: 1,
                    source: None,
                    presentation_hint: Some("label".to_string()),
                });
                for frame in chain_frames {
                    let url = self
                        .script_url(&frame.script_id)
                        .unwrap_or_else(|| frame.url.clone());
                    let resolved = sources.resolve(&SourceLocation {
                        url,
                        line: frame.line_number as u32,
                        column: frame.column_number as u32,
                    });
                    frames.push(StackFrame {
                        id: ids::next_frame_id(),
                        name: frame_name(&frame.function_name),
                        line: resolved.line as u64 + 1,
                        column: resolved.column as u64 + 1,
                        source: projected_source(sources, &resolved),
                        presentation_hint: None,
                    });
                }
            }
            parent = chain.parent.as_deref();
        }
        frames
    }

    /// The top authored location, for console output attribution.
    pub fn top_location(
        &self,
        sources: &SourceContainer,
        stack: &AsyncStackTrace,
    ) -> Option<ResolvedLocation> {
        let frame = stack.call_frames.first()?;
        let url = self
            .script_url(&frame.script_id)
            .unwrap_or_else(|| frame.url.clone());
        let resolved = sources.resolve(&SourceLocation {
            url,
            line: frame.line_number as u32,
            column: frame.column_number as u32,
        });
        resolved.authored.then_some(resolved)
    }
}

fn frame_name(function_name: &str) -> String {
    if function_name.is_empty() {
        "<anonymous>".to_string()
    } else {
        function_name.to_string()
    }
}

fn projected_source(sources: &SourceContainer, resolved: &ResolvedLocation) -> Option<DapSource> {
    match resolved.source_ref {
        Some(source_ref) => sources.dap_source_for_ref(source_ref),
        None => {
            if resolved.url.is_empty() {
                None
            } else {
                Some(DapSource {
                    name: Some(
                        resolved
                            .url
                            .rsplit('/')
                            .next()
                            .unwrap_or(&resolved.url)
                            .to_string(),
                    ),
                    path: None,
                    source_reference: None,
                })
            }
        }
    }
}

/// Map a CDP pause reason onto the DAP `stopped` reason vocabulary.
fn stop_reason(cdp_reason: &str, hit_breakpoints: &[String]) -> String {
    if !hit_breakpoints.is_empty() {
        return "breakpoint".to_string();
    }
    match cdp_reason {
        "exception" | "promiseRejection" => "exception".to_string(),
        "debugCommand" => "pause".to_string(),
        "breakpoint" => "breakpoint".to_string(),
        "step" => "step".to_string(),
        _ => "pause".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::SourceContainer;
    use serde_json::json;

    fn paused_with_one_frame() -> PausedParams {
        serde_json::from_value(json!({
            "reason": "other",
            "callFrames": [{
                "callFrameId": "frame-0",
                "functionName": "f",
                "location": {"scriptId": "10", "lineNumber": 3, "columnNumber": 0},
                "url": "http://app/main.js"
            }]
        }))
        .unwrap()
    }

    #[test]
    fn running_thread_projects_an_empty_stack() {
        let thread = Thread::new("main".into());
        let sources = SourceContainer::new();
        assert!(thread.stack_trace(&sources).is_empty());
    }

    #[test]
    fn paused_thread_projects_one_based_lines_and_columns() {
        let thread = Thread::new("main".into());
        let sources = SourceContainer::new();
        thread.on_paused(paused_with_one_frame());

        let frames = thread.stack_trace(&sources);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].name, "f");
        assert_eq!(frames[0].line, 4);
        assert_eq!(frames[0].column, 1);

        assert!(thread.on_resumed());
        assert!(thread.stack_trace(&sources).is_empty());
    }

    #[test]
    fn anonymous_frames_get_a_placeholder_name() {
        let thread = Thread::new("main".into());
        let sources = SourceContainer::new();
        let mut params = paused_with_one_frame();
        params.call_frames[0].function_name = String::new();
        thread.on_paused(params);
        assert_eq!(thread.stack_trace(&sources)[0].name, "<anonymous>");
    }

    #[test]
    fn async_chains_are_labelled_and_empty_ones_skipped() {
        let thread = Thread::new("main".into());
        let sources = SourceContainer::new();
        let params: PausedParams = serde_json::from_value(json!({
            "reason": "other",
            "callFrames": [{
                "callFrameId": "frame-0",
                "functionName": "f",
                "location": {"scriptId": "10", "lineNumber": 0, "columnNumber": 0}
            }],
            "asyncStackTrace": {
                "description": "setTimeout",
                "callFrames": [{
                    "functionName": "tick",
                    "scriptId": "10",
                    "url": "http://app/main.js",
                    "lineNumber": 9,
                    "columnNumber": 2
                }],
                "parent": {
                    "description": "await",
                    "callFrames": []
                }
            }
        }))
        .unwrap();
        thread.on_paused(params);

        let frames = thread.stack_trace(&sources);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[1].name, "setTimeout");
        assert_eq!(frames[1].presentation_hint.as_deref(), Some("label"));
        assert_eq!(frames[1].line, 1);
        assert_eq!(frames[2].name, "tick");
        assert_eq!(frames[2].line, 10);
    }

    #[test]
    fn async_function_chains_drop_their_duplicated_top_frame() {
        let thread = Thread::new("main".into());
        let sources = SourceContainer::new();
        let params: PausedParams = serde_json::from_value(json!({
            "reason": "other",
            "callFrames": [{
                "callFrameId": "frame-0",
                "functionName": "f",
                "location": {"scriptId": "10", "lineNumber": 0}
            }],
            "asyncStackTrace": {
                "description": "async function",
                "callFrames": [
                    {"functionName": "f", "scriptId": "10", "url": "", "lineNumber": 0, "columnNumber": 0},
                    {"functionName": "caller", "scriptId": "10", "url": "", "lineNumber": 5, "columnNumber": 0}
                ]
            }
        }))
        .unwrap();
        thread.on_paused(params);

        let frames = thread.stack_trace(&sources);
        let names: Vec<&str> = frames.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["f", "async function", "caller"]);
    }

    #[test]
    fn hit_breakpoints_win_over_the_cdp_reason() {
        assert_eq!(stop_reason("other", &["bp-1".to_string()]), "breakpoint");
        assert_eq!(stop_reason("exception", &[]), "exception");
        assert_eq!(stop_reason("other", &[]), "pause");
    }
}
