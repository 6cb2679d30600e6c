//! End-to-end scenarios over a scripted CDP endpoint: pause/resume
//! projection, nested teardown ordering, and the DAP lifecycle handshake.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{duplex, split, DuplexStream, ReadHalf};
use tokio::sync::{mpsc, Mutex};

use jsdbg_adapter::protocol::RemoteObject;
use jsdbg_adapter::sources::SourceContainer;
use jsdbg_adapter::targets::TargetManager;
use jsdbg_adapter::variables::VariableStore;
use jsdbg_adapter::DebugSession;
use jsdbg_cdp::{CdpConnection, CdpError, CdpTransport};
use jsdbg_dap::DapConnection;
use jsdbg_wire::{ContentLengthCodec, FramedReader, FramedWriter};

struct MockTransport {
    inbound: Mutex<mpsc::UnboundedReceiver<Value>>,
    sent: mpsc::UnboundedSender<Value>,
    alive: AtomicBool,
}

impl MockTransport {
    fn new() -> (
        Arc<Self>,
        mpsc::UnboundedSender<Value>,
        mpsc::UnboundedReceiver<Value>,
    ) {
        let (inject_tx, inject_rx) = mpsc::unbounded_channel();
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            inbound: Mutex::new(inject_rx),
            sent: sent_tx,
            alive: AtomicBool::new(true),
        });
        (transport, inject_tx, sent_rx)
    }
}

#[async_trait]
impl CdpTransport for MockTransport {
    async fn send(&self, message: Value) -> Result<(), CdpError> {
        if !self.is_alive() {
            return Err(CdpError::ConnectionClosed);
        }
        self.sent
            .send(message)
            .map_err(|_| CdpError::ConnectionClosed)
    }

    async fn next(&self) -> Option<Value> {
        let mut guard = self.inbound.lock().await;
        guard.recv().await
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    fn close(&self) {
        self.alive.store(false, Ordering::Relaxed);
    }
}

/// Acknowledge every CDP request with an empty result, echoing the
/// sessionId so responses route back to the right logical session.
fn spawn_auto_ack(
    mut sent: mpsc::UnboundedReceiver<Value>,
    inject: mpsc::UnboundedSender<Value>,
) {
    tokio::spawn(async move {
        while let Some(message) = sent.recv().await {
            let Some(id) = message.get("id") else { continue };
            let mut reply = json!({ "id": id, "result": {} });
            if let Some(session_id) = message.get("sessionId") {
                reply["sessionId"] = session_id.clone();
            }
            if inject.send(reply).is_err() {
                break;
            }
        }
    });
}

struct DapClient {
    reader: FramedReader<ReadHalf<DuplexStream>, ContentLengthCodec>,
    writer: FramedWriter<tokio::io::WriteHalf<DuplexStream>, ContentLengthCodec>,
    seq: u64,
    /// Messages read while scanning for something else.
    stashed: std::collections::VecDeque<Value>,
}

impl DapClient {
    fn new(
        reader: FramedReader<ReadHalf<DuplexStream>, ContentLengthCodec>,
        writer: FramedWriter<tokio::io::WriteHalf<DuplexStream>, ContentLengthCodec>,
    ) -> Self {
        Self {
            reader,
            writer,
            seq: 0,
            stashed: std::collections::VecDeque::new(),
        }
    }

    async fn request(&mut self, command: &str, arguments: Value) -> u64 {
        self.seq += 1;
        self.writer
            .send(&json!({
                "seq": self.seq,
                "type": "request",
                "command": command,
                "arguments": arguments,
            }))
            .await
            .unwrap();
        self.seq
    }

    async fn next_message(&mut self) -> Value {
        tokio::time::timeout(Duration::from_secs(5), self.reader.recv())
            .await
            .expect("timed out waiting for a DAP message")
            .unwrap()
            .expect("DAP stream ended")
    }

    /// Next message matching the predicate; everything read past is kept for
    /// later scans.
    async fn scan_for(&mut self, matches: impl Fn(&Value) -> bool) -> Value {
        if let Some(index) = self.stashed.iter().position(&matches) {
            return self.stashed.remove(index).unwrap();
        }
        loop {
            let message = self.next_message().await;
            if matches(&message) {
                return message;
            }
            self.stashed.push_back(message);
        }
    }

    async fn next_event(&mut self, event: &str) -> Value {
        self.scan_for(|message| message["type"] == "event" && message["event"] == event)
            .await
    }

    async fn response_for(&mut self, request_seq: u64) -> Value {
        self.scan_for(|message| {
            message["type"] == "response" && message["request_seq"] == request_seq
        })
        .await
    }
}

struct Fixture {
    connection: Arc<CdpConnection>,
    manager: Arc<TargetManager>,
    sources: Arc<SourceContainer>,
    variables: Arc<VariableStore>,
    inject: mpsc::UnboundedSender<Value>,
    client: DapClient,
}

async fn start_fixture() -> Fixture {
    let (transport, inject, sent) = MockTransport::new();
    spawn_auto_ack(sent, inject.clone());
    let connection = CdpConnection::new(transport);

    let (client_end, adapter_end) = duplex(16384);
    let (adapter_read, adapter_write) = split(adapter_end);
    let (client_read, client_write) = split(client_end);
    let dap = DapConnection::new(adapter_write);
    {
        let dap = Arc::clone(&dap);
        tokio::spawn(async move {
            let _ = dap.serve(adapter_read).await;
        });
    }

    let sources = SourceContainer::new();
    let variables = VariableStore::new();
    let manager = TargetManager::new(
        Arc::clone(&connection),
        Arc::clone(&dap),
        Arc::clone(&sources),
        Arc::clone(&variables),
    );
    manager.start().await.unwrap();

    Fixture {
        connection,
        manager,
        sources,
        variables,
        inject,
        client: DapClient::new(
            FramedReader::new(client_read, ContentLengthCodec::new()),
            FramedWriter::new(client_write, ContentLengthCodec::new()),
        ),
    }
}

fn attach_event(parent_session: Option<&str>, session_id: &str, target_id: &str, kind: &str) -> Value {
    let mut event = json!({
        "method": "Target.attachedToTarget",
        "params": {
            "sessionId": session_id,
            "targetInfo": {
                "targetId": target_id,
                "type": kind,
                "title": format!("{target_id} title"),
                "url": format!("http://app/{target_id}"),
                "attached": true,
            },
            "waitingForDebugger": false,
        }
    });
    if let Some(parent) = parent_session {
        event["sessionId"] = json!(parent);
    }
    event
}

fn object_with_children(id: &str) -> RemoteObject {
    RemoteObject {
        object_type: "object".into(),
        class_name: Some("Object".into()),
        object_id: Some(id.into()),
        ..Default::default()
    }
}

#[tokio::test]
async fn pause_projects_frames_and_resume_invalidates_references() {
    let mut fixture = start_fixture().await;

    fixture
        .inject
        .send(attach_event(None, "s1", "T", "page"))
        .unwrap();
    let started = fixture.client.next_event("thread").await;
    assert_eq!(started["body"]["reason"], "started");
    let thread_id = started["body"]["threadId"].as_u64().unwrap() as u32;

    fixture
        .inject
        .send(json!({
            "sessionId": "s1",
            "method": "Debugger.paused",
            "params": {
                "reason": "other",
                "callFrames": [{
                    "callFrameId": "frame-0",
                    "functionName": "f",
                    "location": {"scriptId": "10", "lineNumber": 3, "columnNumber": 0}
                }]
            }
        }))
        .unwrap();

    let stopped = fixture.client.next_event("stopped").await;
    assert_eq!(stopped["body"]["threadId"], thread_id);
    assert_eq!(stopped["body"]["allThreadsStopped"], false);

    let thread = fixture.manager.thread(thread_id).unwrap();
    let frames = thread.stack_trace(&fixture.sources);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].name, "f");
    assert_eq!(frames[0].line, 4);
    assert_eq!(frames[0].column, 1);

    // A reference allocated while paused...
    let session = fixture.connection.session("s1").unwrap();
    let variable =
        fixture
            .variables
            .create(&session, thread_id, "obj", object_with_children("obj-1"), None);
    assert!(variable.variables_reference > 0);

    fixture
        .inject
        .send(json!({ "sessionId": "s1", "method": "Debugger.resumed", "params": {} }))
        .unwrap();
    let continued = fixture.client.next_event("continued").await;
    assert_eq!(continued["body"]["threadId"], thread_id);
    assert_eq!(continued["body"]["allThreadsContinued"], false);

    // ...is dead after the resume: empty stack, empty children.
    assert!(thread.stack_trace(&fixture.sources).is_empty());
    let children = fixture
        .variables
        .children(variable.variables_reference, None, None, None)
        .await
        .unwrap();
    assert!(children.is_empty());
}

#[tokio::test]
async fn nested_targets_tear_down_children_first() {
    let mut fixture = start_fixture().await;

    fixture
        .inject
        .send(attach_event(None, "s-p", "P", "page"))
        .unwrap();
    let parent_started = fixture.client.next_event("thread").await;
    let parent_thread = parent_started["body"]["threadId"].as_u64().unwrap() as u32;

    fixture
        .inject
        .send(attach_event(Some("s-p"), "s-c1", "C1", "iframe"))
        .unwrap();
    let c1_thread =
        fixture.client.next_event("thread").await["body"]["threadId"].as_u64().unwrap() as u32;
    fixture
        .inject
        .send(attach_event(Some("s-p"), "s-c2", "C2", "worker"))
        .unwrap();
    let c2_thread =
        fixture.client.next_event("thread").await["body"]["threadId"].as_u64().unwrap() as u32;

    // One reference bound to each thread.
    let mut references = Vec::new();
    for (thread_id, session_id) in [
        (parent_thread, "s-p"),
        (c1_thread, "s-c1"),
        (c2_thread, "s-c2"),
    ] {
        let session = fixture.connection.session(session_id).unwrap();
        let variable = fixture.variables.create(
            &session,
            thread_id,
            "x",
            object_with_children(&format!("obj-{thread_id}")),
            None,
        );
        references.push(variable.variables_reference);
    }

    fixture
        .inject
        .send(json!({
            "method": "Target.detachedFromTarget",
            "params": { "sessionId": "s-p", "targetId": "P" }
        }))
        .unwrap();

    // Children exit first, in attach order; the parent goes last.
    let mut exited = Vec::new();
    while exited.len() < 3 {
        let event = fixture.client.next_event("thread").await;
        if event["body"]["reason"] == "exited" {
            exited.push(event["body"]["threadId"].as_u64().unwrap() as u32);
        }
    }
    assert_eq!(exited, vec![c1_thread, c2_thread, parent_thread]);

    for reference in references {
        let children = fixture
            .variables
            .children(reference, None, None, None)
            .await
            .unwrap();
        assert!(children.is_empty());
    }
    assert!(fixture.manager.threads().is_empty());
}

#[tokio::test]
async fn service_workers_are_tracked_without_threads() {
    let mut fixture = start_fixture().await;

    fixture
        .inject
        .send(attach_event(None, "s-p", "P", "page"))
        .unwrap();
    fixture.client.next_event("thread").await;
    fixture
        .inject
        .send(attach_event(Some("s-p"), "s-sw", "SW", "service_worker"))
        .unwrap();

    // Give the manager a beat; no second thread may appear.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fixture.manager.threads().len(), 1);
}

#[tokio::test]
async fn evaluate_results_wrap_primitives_without_references() {
    let fixture = start_fixture().await;
    let session = fixture.connection.root_session();

    let result = RemoteObject {
        object_type: "number".into(),
        value: Some(json!(3)),
        description: Some("3".into()),
        ..Default::default()
    };
    let variable = fixture
        .variables
        .create(&session, 1, "", result, Some("repl"));
    assert_eq!(variable.value, "3");
    assert_eq!(variable.variables_reference, 0);
}

#[tokio::test]
async fn initialize_handshake_and_lifecycle_requests() {
    let (client_end, adapter_end) = duplex(16384);
    let (adapter_read, adapter_write) = split(adapter_end);
    let (client_read, client_write) = split(client_end);
    let dap = DapConnection::new(adapter_write);
    {
        let dap = Arc::clone(&dap);
        tokio::spawn(async move {
            let _ = dap.serve(adapter_read).await;
        });
    }
    let _session = DebugSession::new(Arc::clone(&dap));
    let mut client = DapClient::new(
        FramedReader::new(client_read, ContentLengthCodec::new()),
        FramedWriter::new(client_write, ContentLengthCodec::new()),
    );

    // Requests before initialize are refused.
    let early = client.request("threads", json!({})).await;
    let refused = client.response_for(early).await;
    assert_eq!(refused["success"], false);

    let init = client.request("initialize", json!({"adapterID": "jsdbg"})).await;
    let response = client.response_for(init).await;
    assert_eq!(response["success"], true);
    assert_eq!(response["body"]["supportsLoadedSourcesRequest"], true);
    assert_eq!(response["body"]["supportsCompletionsRequest"], true);
    assert_eq!(response["body"]["supportsRestartRequest"], true);
    client.next_event("initialized").await;

    let done = client.request("configurationDone", json!({})).await;
    assert_eq!(client.response_for(done).await["success"], true);

    let threads = client.request("threads", json!({})).await;
    let response = client.response_for(threads).await;
    assert_eq!(response["success"], true);
    assert_eq!(response["body"]["threads"], json!([]));

    let scopes = client.request("scopes", json!({"frameId": 1})).await;
    let response = client.response_for(scopes).await;
    assert_eq!(response["body"]["scopes"], json!([]));

    // Bad launch configurations fail the request and surface one error.
    let launch = client
        .request("launch", json!({"type": "chrome", "bogus": true}))
        .await;
    let response = client.response_for(launch).await;
    assert_eq!(response["success"], false);
    assert_eq!(response["body"]["error"]["id"], 1104);

    let terminate = client.request("terminate", json!({})).await;
    assert_eq!(client.response_for(terminate).await["success"], true);
    client.next_event("terminated").await;
}
