use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::transport::CdpTransport;
use crate::CdpError;

/// A decoded CDP notification.
#[derive(Clone, Debug)]
pub struct CdpEvent {
    pub method: String,
    pub params: Value,
}

struct EventSink {
    id: u64,
    tx: mpsc::UnboundedSender<CdpEvent>,
}

#[derive(Default)]
struct Handlers {
    by_method: HashMap<String, Vec<EventSink>>,
    wildcard: Vec<EventSink>,
}

/// One logical debugging session multiplexed over the shared transport.
///
/// The empty-string session is the browser-level root; every other session is
/// created by the target manager when `Target.attachedToTarget` arrives.
pub struct CdpSession {
    session_id: String,
    next_id: AtomicU64,
    next_subscription: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<Value, CdpError>>>>,
    handlers: Mutex<Handlers>,
    transport: Arc<dyn CdpTransport>,
    closed: AtomicBool,
}

impl CdpSession {
    pub(crate) fn new(session_id: String, transport: Arc<dyn CdpTransport>) -> Arc<Self> {
        Arc::new(Self {
            session_id,
            next_id: AtomicU64::new(0),
            next_subscription: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            handlers: Mutex::new(Handlers::default()),
            transport,
            closed: AtomicBool::new(false),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// Issue a request and await its result. Resolves exactly once: with the
    /// response `result`, a [`CdpError::Protocol`] from the response `error`,
    /// or [`CdpError::ConnectionClosed`].
    pub async fn send(&self, method: &str, params: Value) -> Result<Value, CdpError> {
        if self.is_closed() {
            return Err(CdpError::ConnectionClosed);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        // A dispose may have drained the map between the check above and the
        // insert; the waiter would never resolve otherwise.
        if self.is_closed() {
            self.pending.lock().remove(&id);
            return Err(CdpError::ConnectionClosed);
        }

        let mut message = json!({ "id": id, "method": method, "params": params });
        if !self.session_id.is_empty() {
            message["sessionId"] = Value::String(self.session_id.clone());
        }

        if let Err(err) = self.transport.send(message).await {
            self.pending.lock().remove(&id);
            return Err(err);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(CdpError::ConnectionClosed),
        }
    }

    /// `send` bounded by a deadline.
    pub async fn send_with_timeout(
        &self,
        method: &str,
        params: Value,
        deadline: std::time::Duration,
    ) -> Result<Value, CdpError> {
        match tokio::time::timeout(deadline, self.send(method, params)).await {
            Ok(result) => result,
            Err(_) => Err(CdpError::Timeout),
        }
    }

    /// Issue a request without awaiting it; failures are logged.
    pub fn fire(self: &Arc<Self>, method: &str, params: Value) {
        let session = Arc::clone(self);
        let method = method.to_string();
        tokio::spawn(async move {
            if let Err(err) = session.send(&method, params).await {
                debug!(target: "cdp", method = %method, %err, "fire-and-forget request failed");
            }
        });
    }

    /// Subscribe to events of one method. Dropping the stream unsubscribes.
    pub fn on(self: &Arc<Self>, method: &str) -> EventStream {
        self.subscribe(Some(method.to_string()))
    }

    /// Subscribe to every event on this session, in transport order.
    pub fn events(self: &Arc<Self>) -> EventStream {
        self.subscribe(None)
    }

    fn subscribe(self: &Arc<Self>, method: Option<String>) -> EventStream {
        let id = self.next_subscription.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = EventSink { id, tx };
        {
            let mut handlers = self.handlers.lock();
            match &method {
                Some(name) => handlers.by_method.entry(name.clone()).or_default().push(sink),
                None => handlers.wildcard.push(sink),
            }
        }
        EventStream {
            rx,
            _guard: Subscription {
                session: Arc::downgrade(self),
                method,
                id,
            },
        }
    }

    pub(crate) fn handle_response(&self, message: &Value) {
        let Some(id) = message.get("id").and_then(Value::as_u64) else {
            warn!(target: "cdp", "response without id dropped");
            return;
        };
        let Some(waiter) = self.pending.lock().remove(&id) else {
            warn!(target: "cdp", id, session = %self.session_id, "spurious response dropped");
            return;
        };

        let result = if let Some(error) = message.get("error") {
            Err(CdpError::Protocol {
                code: error.get("code").and_then(Value::as_i64).unwrap_or(-1),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown cdp error")
                    .to_string(),
            })
        } else {
            Ok(message.get("result").cloned().unwrap_or(Value::Null))
        };
        let _ = waiter.send(result);
    }

    pub(crate) fn handle_event(&self, method: &str, params: Value) {
        let event = CdpEvent {
            method: method.to_string(),
            params,
        };
        let mut handlers = self.handlers.lock();
        if let Some(sinks) = handlers.by_method.get_mut(method) {
            sinks.retain(|sink| sink.tx.send(event.clone()).is_ok());
        }
        handlers
            .wildcard
            .retain(|sink| sink.tx.send(event.clone()).is_ok());
    }

    /// Reject every pending waiter and drop all subscriptions.
    pub(crate) fn dispose(&self) {
        self.closed.store(true, Ordering::Relaxed);
        let waiters: Vec<_> = self.pending.lock().drain().collect();
        for (_, waiter) in waiters {
            let _ = waiter.send(Err(CdpError::ConnectionClosed));
        }
        let mut handlers = self.handlers.lock();
        handlers.by_method.clear();
        handlers.wildcard.clear();
    }

    fn remove_subscription(&self, method: Option<&str>, id: u64) {
        let mut handlers = self.handlers.lock();
        match method {
            Some(name) => {
                if let Some(sinks) = handlers.by_method.get_mut(name) {
                    sinks.retain(|sink| sink.id != id);
                    if sinks.is_empty() {
                        handlers.by_method.remove(name);
                    }
                }
            }
            None => handlers.wildcard.retain(|sink| sink.id != id),
        }
    }
}

/// Disposer handle for an event subscription; deregisters on drop.
pub struct Subscription {
    session: Weak<CdpSession>,
    method: Option<String>,
    id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(session) = self.session.upgrade() {
            session.remove_subscription(self.method.as_deref(), self.id);
        }
    }
}

/// Stream of events for one subscription; ends when the session disposes.
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<CdpEvent>,
    _guard: Subscription,
}

impl EventStream {
    pub async fn recv(&mut self) -> Option<CdpEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<CdpEvent> {
        self.rx.try_recv().ok()
    }
}
