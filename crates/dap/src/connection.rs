use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use jsdbg_wire::{ContentLengthCodec, FramedReader, FramedWriter, WireError};

use crate::error::DapError;
use crate::types::{ProtocolMessage, Request};

pub type HandlerResult = Result<Value, DapError>;
type Handler = Arc<dyn Fn(Request) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

enum Outbound {
    Response {
        request_seq: u64,
        command: String,
        result: HandlerResult,
    },
    Event {
        event: String,
        body: Option<Value>,
    },
}

/// Framed DAP endpoint: a dispatch table mapping commands to handler futures,
/// an outbound writer owning the `seq` counter, and the guarantee of exactly
/// one response per request.
pub struct DapConnection {
    outbound: mpsc::UnboundedSender<Outbound>,
    handlers: RwLock<HashMap<String, Handler>>,
    in_flight: DashMap<u64, ()>,
    shutdown: CancellationToken,
    writer_task: Mutex<Option<JoinHandle<()>>>,
}

impl DapConnection {
    pub fn new<W>(writer: W) -> Arc<Self>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();
        let writer_task = tokio::spawn(async move {
            let mut framed = FramedWriter::new(writer, ContentLengthCodec::new());
            let mut seq: u64 = 0;
            while let Some(message) = outbound_rx.recv().await {
                seq += 1;
                let value = match message {
                    Outbound::Response {
                        request_seq,
                        command,
                        result,
                    } => match result {
                        Ok(body) => json!({
                            "seq": seq,
                            "type": "response",
                            "request_seq": request_seq,
                            "command": command,
                            "success": true,
                            "body": body,
                        }),
                        Err(err) => json!({
                            "seq": seq,
                            "type": "response",
                            "request_seq": request_seq,
                            "command": command,
                            "success": false,
                            "message": err.format,
                            "body": err.to_body(),
                        }),
                    },
                    Outbound::Event { event, body } => {
                        let mut value = json!({
                            "seq": seq,
                            "type": "event",
                            "event": event,
                        });
                        if let Some(body) = body {
                            value["body"] = body;
                        }
                        value
                    }
                };
                if let Err(err) = framed.send(&value).await {
                    warn!(target: "dap", %err, "outbound write failed");
                    break;
                }
            }
        });

        Arc::new(Self {
            outbound: outbound_tx,
            handlers: RwLock::new(HashMap::new()),
            in_flight: DashMap::new(),
            shutdown: CancellationToken::new(),
            writer_task: Mutex::new(Some(writer_task)),
        })
    }

    /// Register the handler for a command. Later registrations replace
    /// earlier ones.
    pub fn on_request<F>(&self, command: &str, handler: F)
    where
        F: Fn(Request) -> BoxFuture<'static, HandlerResult> + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .insert(command.to_string(), Arc::new(handler));
    }

    /// Emit a protocol event. Events may be sent at any time, including while
    /// request handlers are in flight.
    pub fn send_event(&self, event: &str, body: Option<Value>) {
        let _ = self.outbound.send(Outbound::Event {
            event: event.to_string(),
            body,
        });
    }

    /// Read requests off the stream until it ends. Handlers run concurrently;
    /// responses may be written in any order.
    pub async fn serve<R>(self: &Arc<Self>, reader: R) -> Result<(), WireError>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let mut framed = FramedReader::new(reader, ContentLengthCodec::new());
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                message = framed.recv() => {
                    match message? {
                        Some(value) => self.accept(value),
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    fn accept(self: &Arc<Self>, value: Value) {
        match serde_json::from_value::<ProtocolMessage>(value) {
            Ok(ProtocolMessage::Request(request)) => self.dispatch(request),
            Ok(other) => {
                debug!(target: "dap", ?other, "non-request inbound message ignored");
            }
            Err(err) => {
                warn!(target: "dap", %err, "undecodable inbound message dropped");
            }
        }
    }

    fn dispatch(self: &Arc<Self>, request: Request) {
        let handler = self.handlers.read().get(&request.command).cloned();
        self.in_flight.insert(request.seq, ());

        let connection = Arc::clone(self);
        tokio::spawn(async move {
            let seq = request.seq;
            let command = request.command.clone();
            let result = match handler {
                Some(handler) => handler(request).await,
                None => {
                    warn!(target: "dap", command = %command, "unrecognized request");
                    Err(DapError::unrecognized(&command))
                }
            };
            connection.respond(seq, &command, result);
        });
    }

    /// Deliver the response for `request_seq` unless one was already sent.
    fn respond(&self, request_seq: u64, command: &str, result: HandlerResult) {
        if self.in_flight.remove(&request_seq).is_none() {
            debug!(target: "dap", request_seq, "response already delivered; dropped");
            return;
        }
        let _ = self.outbound.send(Outbound::Response {
            request_seq,
            command: command.to_string(),
            result,
        });
    }

    pub fn close(&self) {
        self.shutdown.cancel();
        if let Some(task) = self.writer_task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for DapConnection {
    fn drop(&mut self) {
        self.close();
    }
}
