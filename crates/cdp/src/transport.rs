use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use jsdbg_wire::{FrameCodec, FramedReader, FramedWriter, NullDelimitedCodec};

use crate::CdpError;

/// Byte-stream abstraction under a [`crate::CdpConnection`]. Implementations
/// own their pump tasks; `send` is safe to call from any task because writes
/// are serialized through a single writer.
#[async_trait]
pub trait CdpTransport: Send + Sync {
    async fn send(&self, message: Value) -> Result<(), CdpError>;
    /// Next inbound message, `None` once the stream has ended.
    async fn next(&self) -> Option<Value>;
    fn is_alive(&self) -> bool;
    fn close(&self);
}

/// Transport over any read/write byte-stream pair, framed by the codec the
/// peer speaks. Chromium's `--remote-debugging-pipe` uses `\0` delimiters.
pub struct StreamTransport {
    outbound: mpsc::Sender<Value>,
    inbound: Mutex<mpsc::Receiver<Value>>,
    alive: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl StreamTransport {
    /// Spawn reader/writer pumps over the given stream halves.
    pub fn spawn<R, W, CR, CW>(reader: R, writer: W, read_codec: CR, write_codec: CW) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
        CR: FrameCodec + 'static,
        CW: FrameCodec + 'static,
    {
        let (inbound_tx, inbound_rx) = mpsc::channel::<Value>(512);
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Value>(128);
        let alive = Arc::new(AtomicBool::new(true));

        let read_alive = alive.clone();
        let read_task = tokio::spawn(async move {
            let mut framed = FramedReader::new(reader, read_codec);
            loop {
                match framed.recv().await {
                    Ok(Some(message)) => {
                        if inbound_tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!(target: "cdp", %err, "transport read failed");
                        break;
                    }
                }
            }
            read_alive.store(false, Ordering::Relaxed);
        });

        let write_alive = alive.clone();
        let write_task = tokio::spawn(async move {
            let mut framed = FramedWriter::new(writer, write_codec);
            while let Some(message) = outbound_rx.recv().await {
                if let Err(err) = framed.send(&message).await {
                    warn!(target: "cdp", %err, "transport write failed");
                    break;
                }
            }
            write_alive.store(false, Ordering::Relaxed);
        });

        Self {
            outbound: outbound_tx,
            inbound: Mutex::new(inbound_rx),
            alive,
            tasks: vec![read_task, write_task],
        }
    }

    /// Pipe-mode transport: `\0`-delimited JSON in both directions.
    pub fn pipe<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::spawn(
            reader,
            writer,
            NullDelimitedCodec::new(),
            NullDelimitedCodec::new(),
        )
    }
}

#[async_trait]
impl CdpTransport for StreamTransport {
    async fn send(&self, message: Value) -> Result<(), CdpError> {
        if !self.is_alive() {
            return Err(CdpError::ConnectionClosed);
        }
        self.outbound
            .send(message)
            .await
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
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for StreamTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Transport over a WebSocket endpoint (`ws://.../devtools/browser/<id>`).
pub struct WebSocketTransport {
    outbound: mpsc::Sender<Value>,
    inbound: Mutex<mpsc::Receiver<Value>>,
    alive: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

#[async_trait]
impl CdpTransport for WebSocketTransport {
    async fn send(&self, message: Value) -> Result<(), CdpError> {
        if !self.is_alive() {
            return Err(CdpError::ConnectionClosed);
        }
        self.outbound
            .send(message)
            .await
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
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Dial a DevTools WebSocket endpoint.
pub async fn connect_websocket(ws_url: &str) -> Result<WebSocketTransport, CdpError> {
    let (socket, _response) = tokio_tungstenite::connect_async(ws_url)
        .await
        .map_err(CdpError::transport)?;
    info!(target: "cdp", url = %ws_url, "websocket connection established");

    let (mut sink, mut stream) = socket.split();
    let (inbound_tx, inbound_rx) = mpsc::channel::<Value>(512);
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Value>(128);
    let alive = Arc::new(AtomicBool::new(true));

    let read_alive = alive.clone();
    let read_task = tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(WsMessage::Text(text)) => match serde_json::from_str::<Value>(&text) {
                    Ok(message) => {
                        if inbound_tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(target: "cdp", %err, "malformed websocket frame dropped");
                    }
                },
                Ok(WsMessage::Close(_)) => break,
                Ok(_) => {
                    debug!(target: "cdp", "non-text websocket frame ignored");
                }
                Err(err) => {
                    warn!(target: "cdp", %err, "websocket read failed");
                    break;
                }
            }
        }
        read_alive.store(false, Ordering::Relaxed);
    });

    let write_alive = alive.clone();
    let write_task = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(err) => {
                    warn!(target: "cdp", %err, "unserializable outbound message dropped");
                    continue;
                }
            };
            if let Err(err) = sink.send(WsMessage::Text(text)).await {
                warn!(target: "cdp", %err, "websocket write failed");
                break;
            }
        }
        write_alive.store(false, Ordering::Relaxed);
    });

    Ok(WebSocketTransport {
        outbound: outbound_tx,
        inbound: Mutex::new(inbound_rx),
        alive,
        tasks: vec![read_task, write_task],
    })
}

/// Resolve the browser-level WebSocket URL by probing `/json/version` on the
/// DevTools HTTP endpoint.
pub async fn probe_websocket_url(host: &str, port: u16) -> Result<String, CdpError> {
    let probe_url = format!("http://{host}:{port}/json/version");
    let response = reqwest::get(&probe_url)
        .await
        .map_err(CdpError::transport)?
        .error_for_status()
        .map_err(CdpError::transport)?;
    let body: Value = response.json().await.map_err(CdpError::transport)?;
    body.get("webSocketDebuggerUrl")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| CdpError::Transport("missing webSocketDebuggerUrl in /json/version".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn pipe_transport_round_trips_null_delimited_frames() {
        let (ours, theirs) = tokio::io::duplex(1024);
        let (our_read, our_write) = tokio::io::split(ours);
        let (their_read, their_write) = tokio::io::split(theirs);

        let near = StreamTransport::pipe(our_read, our_write);
        let far = StreamTransport::pipe(their_read, their_write);

        near.send(json!({"id": 1, "method": "Target.getTargets"}))
            .await
            .unwrap();
        let received = far.next().await.unwrap();
        assert_eq!(received["method"], "Target.getTargets");

        far.send(json!({"id": 1, "result": {"targetInfos": []}}))
            .await
            .unwrap();
        let response = near.next().await.unwrap();
        assert_eq!(response["id"], 1);
    }

    #[tokio::test]
    async fn closed_transport_rejects_sends() {
        let (ours, _theirs) = tokio::io::duplex(64);
        let (read, write) = tokio::io::split(ours);
        let transport = StreamTransport::pipe(read, write);
        transport.close();
        let err = transport.send(json!({"id": 1})).await.unwrap_err();
        assert_eq!(err, CdpError::ConnectionClosed);
    }
}
