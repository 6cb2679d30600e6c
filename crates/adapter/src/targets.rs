//! Target discovery, auto-attach, and the parent/child tree.
//!
//! Targets are stored by id; children reference their parent id rather than
//! holding it, and all traversal goes through the manager's maps. Teardown
//! runs children first, parent last.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use jsdbg_cdp::{CdpConnection, CdpEvent, CdpSession};
use jsdbg_dap::types::ThreadInfo;
use jsdbg_dap::DapConnection;

use crate::error::AdapterError;
use crate::protocol::{
    AttachedToTargetParams, ConsoleApiCalledParams, DetachedFromTargetParams, ExceptionThrownParams,
    PausedParams, ScriptParsedParams, TargetCreatedParams, TargetDestroyedParams, TargetInfo,
    TargetInfoChangedParams,
};
use crate::sources::{ContentGetter, SourceContainer};
use crate::thread::Thread;
use crate::variables::{render_console_arg, VariableStore};

#[derive(Clone)]
struct TargetEntry {
    info: TargetInfo,
    session_id: String,
    parent_id: Option<String>,
}

pub struct TargetManager {
    connection: Arc<CdpConnection>,
    dap: Arc<DapConnection>,
    sources: Arc<SourceContainer>,
    variables: Arc<VariableStore>,
    /// Attached targets by target id.
    targets: DashMap<String, TargetEntry>,
    /// Children per parent target id, in attach order.
    children: DashMap<String, Vec<String>>,
    /// Every target id ever announced, for duplicate detection.
    discovered: DashMap<String, ()>,
    threads: DashMap<u32, Arc<Thread>>,
    thread_by_target: DashMap<String, u32>,
    thread_sessions: DashMap<u32, String>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    announced_process: AtomicBool,
}

impl TargetManager {
    pub fn new(
        connection: Arc<CdpConnection>,
        dap: Arc<DapConnection>,
        sources: Arc<SourceContainer>,
        variables: Arc<VariableStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            connection,
            dap,
            sources,
            variables,
            targets: DashMap::new(),
            children: DashMap::new(),
            discovered: DashMap::new(),
            threads: DashMap::new(),
            thread_by_target: DashMap::new(),
            thread_sessions: DashMap::new(),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            announced_process: AtomicBool::new(false),
        })
    }

    /// Begin discovery on the root session.
    pub async fn start(self: &Arc<Self>) -> Result<(), AdapterError> {
        let root = self.connection.root_session();
        self.spawn_pump(Arc::clone(&root), None, None).await;
        root.send("Target.setDiscoverTargets", json!({ "discover": true }))
            .await?;
        info!(target: "adapter", "target discovery started");
        Ok(())
    }

    /// Adopt an endpoint that is itself a debuggable target (a Node child
    /// process connecting over the IPC pipe).
    pub async fn adopt_root_target(self: &Arc<Self>, name: &str) -> Result<(), AdapterError> {
        let info = TargetInfo {
            target_id: format!("root-{name}"),
            target_type: "node".to_string(),
            title: name.to_string(),
            url: name.to_string(),
            attached: true,
            opener_id: None,
        };
        let root = self.connection.root_session();
        self.adopt_session(root, info, None, true).await;
        Ok(())
    }

    fn spawn_pump(
        self: &Arc<Self>,
        session: Arc<CdpSession>,
        target_id: Option<String>,
        thread: Option<Arc<Thread>>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'static>> {
        let this = Arc::clone(self);
        Box::pin(async move {
            let manager = Arc::clone(&this);
            let mut events = session.events();
            let task = tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = manager.shutdown.cancelled() => break,
                        event = events.recv() => match event {
                            Some(event) => {
                                manager
                                    .handle_session_event(&session, target_id.as_deref(), thread.as_ref(), event)
                                    .await;
                            }
                            None => break,
                        }
                    }
                }
            });
            this.tasks.lock().await.push(task);
        })
    }

    async fn handle_session_event(
        self: &Arc<Self>,
        session: &Arc<CdpSession>,
        target_id: Option<&str>,
        thread: Option<&Arc<Thread>>,
        event: CdpEvent,
    ) {
        match event.method.as_str() {
            "Target.targetCreated" => self.on_target_created(event.params).await,
            "Target.attachedToTarget" => {
                self.on_attached(target_id.map(str::to_string), event.params).await;
            }
            "Target.detachedFromTarget" => self.on_detached(event.params),
            "Target.targetDestroyed" => self.on_target_destroyed(event.params),
            "Target.targetInfoChanged" => self.on_target_info_changed(event.params),
            "Debugger.paused" => {
                if let Some(thread) = thread {
                    self.on_paused(thread, event.params);
                }
            }
            "Debugger.resumed" => {
                if let Some(thread) = thread {
                    self.on_resumed(thread);
                }
            }
            "Debugger.scriptParsed" => {
                if let Some(thread) = thread {
                    self.on_script_parsed(session, thread, event.params);
                }
            }
            "Runtime.consoleAPICalled" => {
                if let Some(thread) = thread {
                    self.on_console(thread, event.params);
                }
            }
            "Runtime.exceptionThrown" => self.on_exception(thread, event.params),
            other => {
                debug!(target: "adapter", method = %other, "unhandled cdp event");
            }
        }
    }

    async fn on_target_created(self: &Arc<Self>, params: Value) {
        let payload: TargetCreatedParams = match serde_json::from_value(params) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(target: "adapter", %err, "bad targetCreated payload");
                return;
            }
        };
        let info = payload.target_info;
        if self.discovered.insert(info.target_id.clone(), ()).is_some() {
            warn!(target: "adapter", target = %info.target_id, "duplicate targetCreated ignored");
            return;
        }
        // Claim the first unattached page; everything beneath it arrives via
        // auto-attach.
        if info.target_type == "page" && !info.attached && self.targets.is_empty() {
            let root = self.connection.root_session();
            let target_id = info.target_id.clone();
            match root
                .send(
                    "Target.attachToTarget",
                    json!({ "targetId": target_id, "flatten": true }),
                )
                .await
            {
                Ok(_) => debug!(target: "adapter", target = %target_id, "attach requested"),
                Err(err) => warn!(target: "adapter", %err, "attachToTarget failed"),
            }
        }
    }

    async fn on_attached(self: &Arc<Self>, parent_target: Option<String>, params: Value) {
        let payload: AttachedToTargetParams = match serde_json::from_value(params) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(target: "adapter", %err, "bad attachedToTarget payload");
                return;
            }
        };
        let session = self.connection.create_session(&payload.session_id);
        let parent_id = payload.target_info.opener_id.clone().or(parent_target);
        let mut info = payload.target_info;
        info.attached = true;
        self.discovered.entry(info.target_id.clone()).or_insert(());

        if let Some(parent) = &parent_id {
            self.children
                .entry(parent.clone())
                .or_default()
                .push(info.target_id.clone());
        }
        self.targets.insert(
            info.target_id.clone(),
            TargetEntry {
                info: info.clone(),
                session_id: payload.session_id.clone(),
                parent_id,
            },
        );
        self.adopt_session(session, info, Some(payload.session_id), payload.waiting_for_debugger)
            .await;
    }

    /// Wire a session up: thread bookkeeping, the event pump, domain enabling
    /// and auto-attach for nested targets.
    async fn adopt_session(
        self: &Arc<Self>,
        session: Arc<CdpSession>,
        info: TargetInfo,
        session_id: Option<String>,
        waiting_for_debugger: bool,
    ) {
        let thread = if info.is_debuggable() {
            let thread = Arc::new(Thread::new(derive_thread_name(&info)));
            self.threads.insert(thread.id, Arc::clone(&thread));
            self.thread_by_target.insert(info.target_id.clone(), thread.id);
            if let Some(session_id) = &session_id {
                self.thread_sessions.insert(thread.id, session_id.clone());
            }
            Some(thread)
        } else {
            debug!(target: "adapter", target = %info.target_id, kind = %info.target_type, "tracked without a thread");
            None
        };
        if session_id.is_none() {
            if let Some(thread) = &thread {
                self.thread_sessions.insert(thread.id, String::new());
            }
        }

        self.spawn_pump(Arc::clone(&session), Some(info.target_id.clone()), thread.clone())
            .await;

        if let Some(thread) = &thread {
            if !self.announced_process.swap(true, Ordering::SeqCst) {
                self.dap.send_event(
                    "process",
                    Some(json!({ "name": info.url, "startMethod": "launch" })),
                );
            }
            self.dap.send_event(
                "thread",
                Some(json!({ "reason": "started", "threadId": thread.id })),
            );

            if let Err(err) = self.initialize_thread_domains(&session, &info).await {
                warn!(target: "adapter", %err, target = %info.target_id, "thread domain init failed");
            }
            if waiting_for_debugger {
                session.fire("Runtime.runIfWaitingForDebugger", json!({}));
            }
        }
    }

    async fn initialize_thread_domains(
        &self,
        session: &Arc<CdpSession>,
        info: &TargetInfo,
    ) -> Result<(), AdapterError> {
        session.send("Runtime.enable", json!({})).await?;
        session.send("Debugger.enable", json!({})).await?;
        if matches!(info.target_type.as_str(), "page" | "iframe") {
            session.send("Page.enable", json!({})).await?;
        }
        session
            .send(
                "Target.setAutoAttach",
                json!({
                    "autoAttach": true,
                    "waitForDebuggerOnStart": true,
                    "flatten": true,
                }),
            )
            .await?;
        Ok(())
    }

    fn on_detached(self: &Arc<Self>, params: Value) {
        let payload: DetachedFromTargetParams = match serde_json::from_value(params) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(target: "adapter", %err, "bad detachedFromTarget payload");
                return;
            }
        };
        let target_id = payload.target_id.or_else(|| {
            self.targets.iter().find_map(|entry| {
                (entry.value().session_id == payload.session_id)
                    .then(|| entry.key().clone())
            })
        });
        if let Some(target_id) = target_id {
            self.dispose_target(&target_id);
        }
    }

    fn on_target_destroyed(self: &Arc<Self>, params: Value) {
        let payload: TargetDestroyedParams = match serde_json::from_value(params) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(target: "adapter", %err, "bad targetDestroyed payload");
                return;
            }
        };
        self.discovered.remove(&payload.target_id);
        if self.targets.contains_key(&payload.target_id) {
            self.dispose_target(&payload.target_id);
        }
    }

    fn on_target_info_changed(&self, params: Value) {
        let payload: TargetInfoChangedParams = match serde_json::from_value(params) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(target: "adapter", %err, "bad targetInfoChanged payload");
                return;
            }
        };
        let info = payload.target_info;
        if let Some(mut entry) = self.targets.get_mut(&info.target_id) {
            entry.info = info.clone();
        }
        let thread_id = self.thread_by_target.get(&info.target_id).map(|id| *id);
        if let Some(thread_id) = thread_id {
            if let Some(thread) = self.threads.get(&thread_id) {
                thread.set_name(derive_thread_name(&info));
            }
        }
    }

    /// Dispose a target subtree, children first (in attach order), parent
    /// last.
    pub fn dispose_target(&self, target_id: &str) {
        let children = self
            .children
            .remove(target_id)
            .map(|(_, children)| children)
            .unwrap_or_default();
        for child in children {
            self.dispose_target(&child);
        }

        if let Some((_, thread_id)) = self.thread_by_target.remove(target_id) {
            if let Some((_, thread)) = self.threads.remove(&thread_id) {
                thread.on_resumed();
                let script_refs = thread.take_script_refs();
                self.sources.remove_compiled(&script_refs);
                self.variables.invalidate_thread(thread_id);
                self.dap.send_event(
                    "thread",
                    Some(json!({ "reason": "exited", "threadId": thread_id })),
                );
            }
            self.thread_sessions.remove(&thread_id);
        }

        if let Some((_, entry)) = self.targets.remove(target_id) {
            if let Some(parent) = &entry.parent_id {
                if let Some(mut siblings) = self.children.get_mut(parent) {
                    siblings.retain(|sibling| sibling != target_id);
                }
            }
            self.connection.remove_session(&entry.session_id);
            debug!(target: "adapter", target = %target_id, "target disposed");
        }
    }

    /// Tear down every attached target, roots last.
    pub fn dispose_all(&self) {
        let roots: Vec<String> = self
            .targets
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .parent_id
                    .as_ref()
                    .map(|parent| !self.targets.contains_key(parent))
                    .unwrap_or(true)
            })
            .map(|entry| entry.key().clone())
            .collect();
        for root in roots {
            self.dispose_target(&root);
        }
        self.shutdown.cancel();
    }

    fn on_paused(&self, thread: &Arc<Thread>, params: Value) {
        let payload: PausedParams = match serde_json::from_value(params) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(target: "adapter", %err, "bad Debugger.paused payload");
                return;
            }
        };
        let reason = thread.on_paused(payload);
        self.dap.send_event(
            "stopped",
            Some(json!({
                "reason": reason,
                "threadId": thread.id,
                "allThreadsStopped": false,
            })),
        );
    }

    fn on_resumed(&self, thread: &Arc<Thread>) {
        if thread.on_resumed() {
            self.variables.invalidate_thread(thread.id);
            self.dap.send_event(
                "continued",
                Some(json!({
                    "threadId": thread.id,
                    "allThreadsContinued": false,
                })),
            );
        }
    }

    fn on_script_parsed(self: &Arc<Self>, session: &Arc<CdpSession>, thread: &Arc<Thread>, params: Value) {
        let payload: ScriptParsedParams = match serde_json::from_value(params) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(target: "adapter", %err, "bad scriptParsed payload");
                return;
            }
        };
        if payload.url.is_empty() {
            return;
        }
        let getter = script_source_getter(Arc::clone(session), payload.script_id.clone());
        let source = self.sources.add_compiled(&payload.url, getter);
        thread.register_script(&payload.script_id, &payload.url, source.source_ref);

        if let Some(map_url) = payload.source_map_url.filter(|url| !url.is_empty()) {
            let sources = Arc::clone(&self.sources);
            let source_ref = source.source_ref;
            tokio::spawn(async move {
                sources.attach_source_map(source_ref, &map_url).await;
            });
        }
    }

    fn on_console(&self, thread: &Arc<Thread>, params: Value) {
        let payload: ConsoleApiCalledParams = match serde_json::from_value(params) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(target: "adapter", %err, "bad consoleAPICalled payload");
                return;
            }
        };
        let category = match payload.call_type.as_str() {
            "error" | "assert" => "stderr",
            "warning" => "console",
            _ => "stdout",
        };
        let text: Vec<String> = payload
            .args
            .iter()
            .map(|arg| render_console_arg(arg, 3))
            .collect();
        let mut body = json!({
            "category": category,
            "output": format!("{}\n", text.join(" ")),
        });
        if let Some(stack) = &payload.stack_trace {
            if let Some(location) = thread.top_location(&self.sources, stack) {
                body["line"] = json!(location.line + 1);
                body["column"] = json!(location.column + 1);
                if let Some(source_ref) = location.source_ref {
                    if let Some(source) = self.sources.dap_source_for_ref(source_ref) {
                        body["source"] = serde_json::to_value(source).unwrap_or(Value::Null);
                    }
                }
            }
        }
        self.dap.send_event("output", Some(body));
    }

    fn on_exception(&self, _thread: Option<&Arc<Thread>>, params: Value) {
        let payload: ExceptionThrownParams = match serde_json::from_value(params) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(target: "adapter", %err, "bad exceptionThrown payload");
                return;
            }
        };
        let details = payload.exception_details;
        let text = details
            .exception
            .as_ref()
            .and_then(|exception| exception.description.clone())
            .unwrap_or(details.text);
        self.dap.send_event(
            "output",
            Some(json!({
                "category": "stderr",
                "output": format!("{text}\n"),
            })),
        );
    }

    // ---- queries used by the DAP handler surface ----

    pub fn threads(&self) -> Vec<ThreadInfo> {
        let mut threads: Vec<ThreadInfo> = self
            .threads
            .iter()
            .map(|entry| ThreadInfo {
                id: entry.value().id,
                name: entry.value().name(),
            })
            .collect();
        threads.sort_by_key(|thread| thread.id);
        threads
    }

    pub fn thread(&self, thread_id: u32) -> Option<Arc<Thread>> {
        self.threads.get(&thread_id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn thread_session(&self, thread_id: u32) -> Option<Arc<CdpSession>> {
        let session_id = self.thread_sessions.get(&thread_id)?.clone();
        self.connection.session(&session_id)
    }

    /// The oldest live thread; evaluation without a frame runs here.
    pub fn main_thread(&self) -> Option<Arc<Thread>> {
        self.threads
            .iter()
            .min_by_key(|entry| entry.value().id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// The thread currently paused on the given DAP frame id.
    pub fn thread_for_frame(&self, frame_id: u64) -> Option<(Arc<Thread>, String)> {
        self.threads.iter().find_map(|entry| {
            entry
                .value()
                .call_frame_for(frame_id)
                .map(|call_frame_id| (Arc::clone(entry.value()), call_frame_id))
        })
    }

    /// Sessions of every live thread, for operations that fan out (such as
    /// setting breakpoints).
    pub fn debuggable_sessions(&self) -> Vec<Arc<CdpSession>> {
        self.thread_sessions
            .iter()
            .filter_map(|entry| self.connection.session(entry.value()))
            .collect()
    }

    pub async fn shutdown(&self) {
        self.dispose_all();
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

fn script_source_getter(session: Arc<CdpSession>, script_id: String) -> ContentGetter {
    Arc::new(move || {
        let session = Arc::clone(&session);
        let script_id = script_id.clone();
        Box::pin(async move {
            let result = session
                .send("Debugger.getScriptSource", json!({ "scriptId": script_id }))
                .await?;
            Ok(result
                .get("scriptSource")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string())
        })
    })
}

fn derive_thread_name(info: &TargetInfo) -> String {
    let label = if !info.title.is_empty() {
        info.title.clone()
    } else if !info.url.is_empty() {
        info.url.clone()
    } else {
        info.target_id.clone()
    };
    match info.target_type.as_str() {
        "page" => label,
        "node" => format!("Node: {label}"),
        kind => format!("{kind}: {label}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(kind: &str, title: &str, url: &str) -> TargetInfo {
        TargetInfo {
            target_id: "t1".into(),
            target_type: kind.into(),
            title: title.into(),
            url: url.into(),
            attached: false,
            opener_id: None,
        }
    }

    #[test]
    fn thread_names_derive_from_target_info() {
        assert_eq!(derive_thread_name(&info("page", "Shop", "http://x")), "Shop");
        assert_eq!(
            derive_thread_name(&info("worker", "", "http://x/w.js")),
            "worker: http://x/w.js"
        );
        assert_eq!(
            derive_thread_name(&info("node", "", "app.js")),
            "Node: app.js"
        );
    }

    #[test]
    fn service_workers_are_not_debuggable() {
        assert!(!info("service_worker", "", "").is_debuggable());
        assert!(info("page", "", "").is_debuggable());
        assert!(info("iframe", "", "").is_debuggable());
        assert!(info("worker", "", "").is_debuggable());
    }
}
