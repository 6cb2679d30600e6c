use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::session::CdpSession;
use crate::transport::CdpTransport;

/// The browser-level root session is keyed by the empty string.
pub const ROOT_SESSION: &str = "";

/// One physical CDP connection demultiplexed into logical sessions.
///
/// Inbound messages are routed by their optional `sessionId` field. Sessions
/// are created explicitly by the target manager in response to
/// `Target.attachedToTarget`; only the root session exists implicitly.
pub struct CdpConnection {
    transport: Arc<dyn CdpTransport>,
    sessions: DashMap<String, Arc<CdpSession>>,
    shutdown: CancellationToken,
    pump: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl CdpConnection {
    pub fn new(transport: Arc<dyn CdpTransport>) -> Arc<Self> {
        let connection = Arc::new(Self {
            transport: Arc::clone(&transport),
            sessions: DashMap::new(),
            shutdown: CancellationToken::new(),
            pump: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        connection.sessions.insert(
            ROOT_SESSION.to_string(),
            CdpSession::new(ROOT_SESSION.to_string(), transport),
        );

        let pump = tokio::spawn(Self::pump_loop(Arc::clone(&connection)));
        *connection.pump.lock() = Some(pump);
        connection
    }

    async fn pump_loop(connection: Arc<Self>) {
        loop {
            tokio::select! {
                _ = connection.shutdown.cancelled() => break,
                message = connection.transport.next() => {
                    match message {
                        Some(message) => connection.route(message),
                        None => {
                            debug!(target: "cdp", "transport ended");
                            connection.dispose_sessions();
                            break;
                        }
                    }
                }
            }
        }
    }

    fn route(&self, message: Value) {
        let session_id = message
            .get("sessionId")
            .and_then(Value::as_str)
            .unwrap_or(ROOT_SESSION);
        let Some(session) = self.sessions.get(session_id).map(|s| Arc::clone(s.value())) else {
            warn!(target: "cdp", session = %session_id, "message for unknown session dropped");
            return;
        };

        if let Some(method) = message.get("method").and_then(Value::as_str) {
            let params = message.get("params").cloned().unwrap_or(Value::Null);
            session.handle_event(method, params);
        } else if message.get("id").is_some() {
            session.handle_response(&message);
        } else {
            warn!(target: "cdp", "message with neither method nor id dropped");
        }
    }

    pub fn root_session(&self) -> Arc<CdpSession> {
        // The root entry is inserted in `new` and never removed.
        self.sessions
            .get(ROOT_SESSION)
            .map(|s| Arc::clone(s.value()))
            .unwrap_or_else(|| CdpSession::new(ROOT_SESSION.to_string(), Arc::clone(&self.transport)))
    }

    pub fn session(&self, session_id: &str) -> Option<Arc<CdpSession>> {
        self.sessions.get(session_id).map(|s| Arc::clone(s.value()))
    }

    /// Register the logical session announced by `Target.attachedToTarget`.
    pub fn create_session(&self, session_id: &str) -> Arc<CdpSession> {
        if let Some(existing) = self.session(session_id) {
            warn!(target: "cdp", session = %session_id, "session already registered");
            return existing;
        }
        let session = CdpSession::new(session_id.to_string(), Arc::clone(&self.transport));
        self.sessions.insert(session_id.to_string(), Arc::clone(&session));
        session
    }

    /// Reject the session's pending waiters and forget it.
    pub fn remove_session(&self, session_id: &str) {
        if session_id == ROOT_SESSION {
            return;
        }
        if let Some((_, session)) = self.sessions.remove(session_id) {
            session.dispose();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// Token cancelled once the connection is gone, however that happened.
    pub fn closed_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn dispose_sessions(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for entry in self.sessions.iter() {
            entry.value().dispose();
        }
        self.sessions.retain(|key, _| key == ROOT_SESSION);
        self.shutdown.cancel();
    }

    /// Tear down: every pending waiter on every session rejects with
    /// `ConnectionClosed`, then the transport closes.
    pub fn close(&self) {
        self.shutdown.cancel();
        self.dispose_sessions();
        self.transport.close();
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }
}

impl Drop for CdpConnection {
    fn drop(&mut self) {
        self.close();
    }
}
