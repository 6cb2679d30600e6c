//! The adapter session: the DAP handler surface wired onto the model layer,
//! and the lifecycle state machine
//! `Created → Initialized → Configured → Launched → Terminated`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::io::AsyncBufReadExt;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use jsdbg_cdp::CdpConnection;
use jsdbg_dap::types::{
    Capabilities, CompletionItem, CompletionsArguments, ContinueArguments, DisconnectArguments,
    EvaluateArguments, PauseArguments, Request, ScopesArguments, SetBreakpointsArguments,
    SourceArguments, StackTraceArguments, VariablesArguments,
};
use jsdbg_dap::{DapConnection, DapError};

use crate::breakpoints::BreakpointManager;
use crate::config::{LaunchConfig, RuntimeKind};
use crate::error::AdapterError;
use crate::launcher::{self, LaunchedRuntime, NodeIpcServer};
use crate::overrides::PathOverrides;
use crate::protocol::EvaluateResult;
use crate::sources::{SourceContainer, SourceEvent};
use crate::targets::TargetManager;
use crate::thread::Thread;
use crate::variables::VariableStore;

#[derive(Clone, Copy, Debug, PartialEq)]
enum SessionState {
    Created,
    Initialized,
    Configured,
    Launched,
    Terminated,
}

pub struct DebugSession {
    dap: Arc<DapConnection>,
    sources: Arc<SourceContainer>,
    variables: Arc<VariableStore>,
    breakpoints: BreakpointManager,
    state: Mutex<SessionState>,
    managers: Mutex<Vec<Arc<TargetManager>>>,
    runtime: AsyncMutex<Option<LaunchedRuntime>>,
    config: Mutex<Option<(LaunchConfig, bool)>>,
    tasks: AsyncMutex<Vec<JoinHandle<()>>>,
    terminated: AtomicBool,
}

macro_rules! route {
    ($session:ident, $command:literal, $method:ident) => {{
        let session = Arc::clone($session);
        $session.dap.on_request($command, move |request| {
            let session = Arc::clone(&session);
            async move { session.$method(request).await }.boxed()
        });
    }};
}

impl DebugSession {
    pub fn new(dap: Arc<DapConnection>) -> Arc<Self> {
        let session = Arc::new(Self {
            dap,
            sources: SourceContainer::new(),
            variables: VariableStore::new(),
            breakpoints: BreakpointManager::new(),
            state: Mutex::new(SessionState::Created),
            managers: Mutex::new(Vec::new()),
            runtime: AsyncMutex::new(None),
            config: Mutex::new(None),
            tasks: AsyncMutex::new(Vec::new()),
            terminated: AtomicBool::new(false),
        });
        session.register();
        session.spawn_source_event_forwarder();
        session
    }

    fn register(self: &Arc<Self>) {
        let this = self;
        route!(this, "initialize", initialize);
        route!(this, "launch", launch);
        route!(this, "attach", attach);
        route!(this, "configurationDone", configuration_done);
        route!(this, "setBreakpoints", set_breakpoints);
        route!(this, "threads", threads);
        route!(this, "stackTrace", stack_trace);
        route!(this, "scopes", scopes);
        route!(this, "variables", variables);
        route!(this, "continue", continue_request);
        route!(this, "pause", pause);
        route!(this, "evaluate", evaluate);
        route!(this, "completions", completions);
        route!(this, "loadedSources", loaded_sources);
        route!(this, "source", source);
        route!(this, "restart", restart);
        route!(this, "terminate", terminate);
        route!(this, "disconnect", disconnect);
    }

    fn spawn_source_event_forwarder(self: &Arc<Self>) {
        let dap = Arc::clone(&self.dap);
        let mut events = self.sources.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(SourceEvent::Added(source)) => {
                        dap.send_event(
                            "loadedSource",
                            Some(json!({ "reason": "new", "source": source })),
                        );
                    }
                    Ok(SourceEvent::Removed(sources)) => {
                        for source in sources {
                            dap.send_event(
                                "loadedSource",
                                Some(json!({ "reason": "removed", "source": source })),
                            );
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(target: "adapter", skipped, "source events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    fn ensure_initialized(&self) -> Result<(), DapError> {
        if *self.state.lock() == SessionState::Created {
            return Err(DapError::handler("initialize must be the first request"));
        }
        Ok(())
    }

    fn find_thread(&self, thread_id: u32) -> Option<(Arc<TargetManager>, Arc<Thread>)> {
        self.managers.lock().iter().find_map(|manager| {
            manager
                .thread(thread_id)
                .map(|thread| (Arc::clone(manager), thread))
        })
    }

    fn main_thread(&self) -> Option<(Arc<TargetManager>, Arc<Thread>)> {
        self.managers
            .lock()
            .iter()
            .filter_map(|manager| {
                manager
                    .main_thread()
                    .map(|thread| (Arc::clone(manager), thread))
            })
            .min_by_key(|(_, thread)| thread.id)
    }

    // ---- lifecycle requests ----

    async fn initialize(self: &Arc<Self>, _request: Request) -> Result<Value, DapError> {
        {
            let mut state = self.state.lock();
            if *state != SessionState::Created {
                return Err(DapError::handler("already initialized"));
            }
            *state = SessionState::Initialized;
        }
        self.dap.send_event("initialized", None);
        let capabilities = Capabilities {
            supports_configuration_done_request: true,
            supports_restart_request: true,
            supports_loaded_sources_request: true,
            supports_completions_request: true,
            supports_terminate_request: true,
            supports_evaluate_for_hovers: true,
        };
        Ok(serde_json::to_value(capabilities).map_err(|err| DapError::handler(err.to_string()))?)
    }

    async fn launch(self: &Arc<Self>, request: Request) -> Result<Value, DapError> {
        self.ensure_initialized()?;
        let config = LaunchConfig::parse(&request.arguments, false).map_err(|err| {
            // A bad configuration is one modal error and a failed launch.
            self.dap.send_event(
                "output",
                Some(json!({ "category": "stderr", "output": format!("{err}\n") })),
            );
            DapError::from(err)
        })?;
        self.start_runtime(config, false).await?;
        Ok(json!({}))
    }

    async fn attach(self: &Arc<Self>, request: Request) -> Result<Value, DapError> {
        self.ensure_initialized()?;
        let config = LaunchConfig::parse(&request.arguments, true).map_err(DapError::from)?;
        self.start_runtime(config, true).await?;
        Ok(json!({}))
    }

    async fn start_runtime(
        self: &Arc<Self>,
        config: LaunchConfig,
        attach: bool,
    ) -> Result<(), DapError> {
        if let Some(overrides) = &config.source_map_path_overrides {
            let compiled = PathOverrides::new(overrides).map_err(DapError::from)?;
            self.sources.set_overrides(compiled);
        }
        *self.config.lock() = Some((config.clone(), attach));

        let runtime = if attach {
            launcher::attach_runtime(&config).await.map_err(DapError::from)?
        } else {
            match config.kind {
                RuntimeKind::Chrome => {
                    launcher::launch_browser(&config).await.map_err(DapError::from)?
                }
                RuntimeKind::Node => self.launch_node(&config).await.map_err(DapError::from)?,
            }
        };

        self.adopt_connection(Arc::clone(&runtime.connection), config.kind == RuntimeKind::Node)
            .await
            .map_err(DapError::from)?;
        *self.runtime.lock().await = Some(runtime);
        *self.state.lock() = SessionState::Launched;
        info!(target: "adapter", attach, "runtime connected");
        Ok(())
    }

    async fn launch_node(self: &Arc<Self>, config: &LaunchConfig) -> Result<LaunchedRuntime, AdapterError> {
        let server = NodeIpcServer::bind()?;
        let mut child = launcher::spawn_node(config, &server)?;
        self.forward_child_output(&mut child).await;

        let connection = timeout(config.connect_timeout(), server.accept())
            .await
            .map_err(|_| AdapterError::Launch("timed out waiting for the runtime to connect".into()))??;

        // Later children each dial in as their own CDP connection.
        let session = Arc::clone(self);
        let accept_loop = tokio::spawn(async move {
            loop {
                match server.accept().await {
                    Ok(connection) => {
                        if let Err(err) = session.adopt_connection(connection, true).await {
                            warn!(target: "adapter", %err, "failed to adopt node child");
                        }
                    }
                    Err(err) => {
                        debug!(target: "adapter", %err, "node ipc server closed");
                        break;
                    }
                }
            }
        });
        self.tasks.lock().await.push(accept_loop);

        Ok(LaunchedRuntime::from_parts(connection, Some(child)))
    }

    /// Pipe the child's stdio through as output events.
    async fn forward_child_output(self: &Arc<Self>, child: &mut tokio::process::Child) {
        let mut tasks = self.tasks.lock().await;
        if let Some(stdout) = child.stdout.take() {
            let dap = Arc::clone(&self.dap);
            tasks.push(tokio::spawn(async move {
                let mut lines = tokio::io::BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    dap.send_event(
                        "output",
                        Some(json!({ "category": "stdout", "output": format!("{line}\n") })),
                    );
                }
            }));
        }
        if let Some(stderr) = child.stderr.take() {
            let dap = Arc::clone(&self.dap);
            tasks.push(tokio::spawn(async move {
                let mut lines = tokio::io::BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    dap.send_event(
                        "output",
                        Some(json!({ "category": "stderr", "output": format!("{line}\n") })),
                    );
                }
            }));
        }
    }

    async fn adopt_connection(
        self: &Arc<Self>,
        connection: Arc<CdpConnection>,
        node_root: bool,
    ) -> Result<(), AdapterError> {
        let manager = TargetManager::new(
            Arc::clone(&connection),
            Arc::clone(&self.dap),
            Arc::clone(&self.sources),
            Arc::clone(&self.variables),
        );
        if node_root {
            manager.adopt_root_target("node").await?;
        } else {
            manager.start().await?;
        }
        self.managers.lock().push(Arc::clone(&manager));
        self.watch_connection(connection);
        Ok(())
    }

    /// When the CDP transport goes away underneath us, the debuggee is gone:
    /// exited(0), then terminated.
    fn watch_connection(self: &Arc<Self>, connection: Arc<CdpConnection>) {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            connection.closed_token().cancelled().await;
            if !session.terminated.load(Ordering::SeqCst) {
                session.dap.send_event("exited", Some(json!({ "exitCode": 0 })));
                session.finish(true).await;
            }
        });
    }

    async fn configuration_done(self: &Arc<Self>, _request: Request) -> Result<Value, DapError> {
        self.ensure_initialized()?;
        let mut state = self.state.lock();
        if *state == SessionState::Initialized {
            *state = SessionState::Configured;
        }
        Ok(json!({}))
    }

    async fn restart(self: &Arc<Self>, _request: Request) -> Result<Value, DapError> {
        self.ensure_initialized()?;
        let Some((config, attach)) = self.config.lock().clone() else {
            return Err(DapError::handler("nothing launched yet"));
        };
        self.shutdown_runtime().await;
        self.start_runtime(config, attach).await?;
        Ok(json!({}))
    }

    async fn terminate(self: &Arc<Self>, _request: Request) -> Result<Value, DapError> {
        self.finish(true).await;
        Ok(json!({}))
    }

    async fn disconnect(self: &Arc<Self>, request: Request) -> Result<Value, DapError> {
        let arguments: DisconnectArguments =
            serde_json::from_value(request.arguments).unwrap_or_default();
        let kill = arguments.terminate_debuggee.unwrap_or(true);
        self.finish(kill).await;
        Ok(json!({}))
    }

    /// Tear everything down and emit `terminated` exactly once.
    pub async fn finish(self: &Arc<Self>, kill_debuggee: bool) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown_runtime_inner(kill_debuggee).await;
        *self.state.lock() = SessionState::Terminated;
        self.dap.send_event("terminated", None);
    }

    async fn shutdown_runtime(self: &Arc<Self>) {
        self.shutdown_runtime_inner(true).await;
    }

    async fn shutdown_runtime_inner(self: &Arc<Self>, kill_debuggee: bool) {
        let managers: Vec<Arc<TargetManager>> = self.managers.lock().drain(..).collect();
        for manager in managers {
            manager.shutdown().await;
        }
        if let Some(mut runtime) = self.runtime.lock().await.take() {
            if kill_debuggee {
                runtime.kill().await;
            } else {
                runtime.connection.close();
            }
        }
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
        self.variables.clear();
    }

    // ---- inspection requests ----

    async fn set_breakpoints(self: &Arc<Self>, request: Request) -> Result<Value, DapError> {
        self.ensure_initialized()?;
        let arguments: SetBreakpointsArguments = parse_args(request.arguments)?;
        let sessions: Vec<_> = self
            .managers
            .lock()
            .iter()
            .flat_map(|manager| manager.debuggable_sessions())
            .collect();
        let breakpoints = self.breakpoints.set_breakpoints(&sessions, &arguments).await;
        Ok(json!({ "breakpoints": breakpoints }))
    }

    async fn threads(self: &Arc<Self>, _request: Request) -> Result<Value, DapError> {
        self.ensure_initialized()?;
        let threads: Vec<_> = self
            .managers
            .lock()
            .iter()
            .flat_map(|manager| manager.threads())
            .collect();
        Ok(json!({ "threads": threads }))
    }

    async fn stack_trace(self: &Arc<Self>, request: Request) -> Result<Value, DapError> {
        self.ensure_initialized()?;
        let arguments: StackTraceArguments = parse_args(request.arguments)?;
        let Some((_, thread)) = self.find_thread(arguments.thread_id) else {
            return Err(AdapterError::UnknownThread(arguments.thread_id).into());
        };
        let mut frames = thread.stack_trace(&self.sources);
        let total = frames.len();
        if let Some(start) = arguments.start_frame {
            frames = frames.split_off((start as usize).min(frames.len()));
        }
        if let Some(levels) = arguments.levels {
            if levels > 0 {
                frames.truncate(levels as usize);
            }
        }
        Ok(json!({ "stackFrames": frames, "totalFrames": total }))
    }

    async fn scopes(self: &Arc<Self>, request: Request) -> Result<Value, DapError> {
        self.ensure_initialized()?;
        let _arguments: ScopesArguments = parse_args(request.arguments)?;
        Ok(json!({ "scopes": [] }))
    }

    async fn variables(self: &Arc<Self>, request: Request) -> Result<Value, DapError> {
        self.ensure_initialized()?;
        let arguments: VariablesArguments = parse_args(request.arguments)?;
        let variables = self
            .variables
            .children(
                arguments.variables_reference,
                arguments.filter.as_deref(),
                arguments.start,
                arguments.count,
            )
            .await
            .map_err(DapError::from)?;
        Ok(json!({ "variables": variables }))
    }

    async fn continue_request(self: &Arc<Self>, request: Request) -> Result<Value, DapError> {
        self.ensure_initialized()?;
        let arguments: ContinueArguments = parse_args(request.arguments)?;
        let Some((manager, thread)) = self.find_thread(arguments.thread_id) else {
            return Err(AdapterError::UnknownThread(arguments.thread_id).into());
        };
        let session = manager
            .thread_session(thread.id)
            .ok_or_else(|| DapError::handler("thread has no live session"))?;
        session
            .send("Debugger.resume", json!({}))
            .await
            .map_err(AdapterError::from)
            .map_err(DapError::from)?;
        Ok(json!({ "allThreadsContinued": false }))
    }

    async fn pause(self: &Arc<Self>, request: Request) -> Result<Value, DapError> {
        self.ensure_initialized()?;
        let arguments: PauseArguments = parse_args(request.arguments)?;
        let Some((manager, thread)) = self.find_thread(arguments.thread_id) else {
            return Err(AdapterError::UnknownThread(arguments.thread_id).into());
        };
        let session = manager
            .thread_session(thread.id)
            .ok_or_else(|| DapError::handler("thread has no live session"))?;
        session
            .send("Debugger.pause", json!({}))
            .await
            .map_err(AdapterError::from)
            .map_err(DapError::from)?;
        Ok(json!({}))
    }

    async fn evaluate(self: &Arc<Self>, request: Request) -> Result<Value, DapError> {
        self.ensure_initialized()?;
        let arguments: EvaluateArguments = parse_args(request.arguments)?;
        let context = arguments.context.as_deref();

        let (manager, thread, response) = if let Some(frame_id) = arguments.frame_id {
            let found = self
                .managers
                .lock()
                .iter()
                .find_map(|manager| {
                    manager
                        .thread_for_frame(frame_id)
                        .map(|(thread, call_frame_id)| {
                            (Arc::clone(manager), thread, call_frame_id)
                        })
                });
            let Some((manager, thread, call_frame_id)) = found else {
                return Err(AdapterError::UnknownFrame(frame_id).into());
            };
            let session = manager
                .thread_session(thread.id)
                .ok_or_else(|| DapError::handler("thread has no live session"))?;
            let response = session
                .send(
                    "Debugger.evaluateOnCallFrame",
                    json!({
                        "callFrameId": call_frame_id,
                        "expression": arguments.expression,
                        "generatePreview": true,
                    }),
                )
                .await
                .map_err(AdapterError::from)?;
            (manager, thread, response)
        } else {
            let Some((manager, thread)) = self.main_thread() else {
                return Err(DapError::handler("no debuggable target"));
            };
            let session = manager
                .thread_session(thread.id)
                .ok_or_else(|| DapError::handler("thread has no live session"))?;
            let response = session
                .send(
                    "Runtime.evaluate",
                    json!({
                        "expression": arguments.expression,
                        "generatePreview": true,
                        "replMode": context == Some("repl"),
                    }),
                )
                .await
                .map_err(AdapterError::from)?;
            (manager, thread, response)
        };

        let evaluated: EvaluateResult =
            serde_json::from_value(response).map_err(AdapterError::from)?;
        if let Some(details) = evaluated.exception_details {
            let text = details
                .exception
                .and_then(|exception| exception.description)
                .unwrap_or(details.text);
            return Err(DapError::handler(text));
        }

        let session = manager
            .thread_session(thread.id)
            .ok_or_else(|| DapError::handler("thread has no live session"))?;
        let variable = self
            .variables
            .create(&session, thread.id, "", evaluated.result, context);
        Ok(json!({
            "result": variable.value,
            "type": variable.r#type,
            "variablesReference": variable.variables_reference,
            "namedVariables": variable.named_variables,
            "indexedVariables": variable.indexed_variables,
        }))
    }

    async fn completions(self: &Arc<Self>, request: Request) -> Result<Value, DapError> {
        self.ensure_initialized()?;
        let arguments: CompletionsArguments = parse_args(request.arguments)?;
        let Some((manager, thread)) = self.main_thread() else {
            return Ok(json!({ "targets": [] }));
        };
        let session = manager
            .thread_session(thread.id)
            .ok_or_else(|| DapError::handler("thread has no live session"))?;

        let mut names: Vec<String> = Vec::new();
        if let Ok(result) = session
            .send("Runtime.globalLexicalScopeNames", json!({}))
            .await
        {
            if let Some(list) = result.get("names").and_then(Value::as_array) {
                names.extend(list.iter().filter_map(Value::as_str).map(str::to_string));
            }
        }
        if let Ok(result) = session
            .send(
                "Runtime.evaluate",
                json!({
                    "expression": "Object.getOwnPropertyNames(globalThis)",
                    "returnByValue": true,
                }),
            )
            .await
        {
            if let Some(list) = result
                .pointer("/result/value")
                .and_then(Value::as_array)
            {
                names.extend(list.iter().filter_map(Value::as_str).map(str::to_string));
            }
        }

        names.sort();
        names.dedup();
        let targets: Vec<CompletionItem> = names
            .into_iter()
            .filter(|name| name.starts_with(&arguments.text))
            .map(|label| CompletionItem {
                label,
                r#type: Some("property".to_string()),
            })
            .collect();
        Ok(json!({ "targets": targets }))
    }

    async fn loaded_sources(self: &Arc<Self>, _request: Request) -> Result<Value, DapError> {
        self.ensure_initialized()?;
        Ok(json!({ "sources": self.sources.loaded_sources() }))
    }

    async fn source(self: &Arc<Self>, request: Request) -> Result<Value, DapError> {
        self.ensure_initialized()?;
        let arguments: SourceArguments = parse_args(request.arguments)?;
        let reference = arguments
            .source_reference
            .or_else(|| arguments.source.and_then(|source| source.source_reference))
            .ok_or_else(|| DapError::handler("source request without a sourceReference"))?;
        let (content, mime_type) = self
            .sources
            .content(reference)
            .await
            .map_err(DapError::from)?;
        Ok(json!({ "content": content, "mimeType": mime_type }))
    }
}

fn parse_args<T: serde::de::DeserializeOwned>(arguments: Value) -> Result<T, DapError> {
    serde_json::from_value(arguments).map_err(|err| DapError::handler(format!("bad arguments: {err}")))
}
