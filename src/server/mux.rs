//! JSON-RPC 2.0 multiplexer over a child's stdio.
//!
//! The child speaks line-delimited JSON. One reader task per child parses
//! each stdout line and dispatches it: responses are matched to pending calls
//! by id, notifications are routed to active stream sessions, anything else
//! is logged at debug and discarded (children may emit diagnostic text on
//! stdout; that is not fatal).
//!
//! Request ids are assigned by the gateway from a process-wide monotone
//! counter; writes to stdin are serialised under a short-duration lock while
//! replies may arrive out of order and are correlated by id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::GatewayError;

/// Queue depth per stream session; sized for the largest expected
/// notification burst so sessions do not block the reader.
pub const SESSION_QUEUE_DEPTH: usize = 64;

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<crate::Result<Value>>>>>;
type SessionMap = Arc<Mutex<HashMap<u64, mpsc::Sender<Value>>>>;

/// Correlates concurrent JSON-RPC calls onto a single child's stdio.
pub struct Multiplexer {
    server_id: String,
    stdin: tokio::sync::Mutex<ChildStdin>,
    pending: PendingMap,
    sessions: SessionMap,
    next_id: Arc<AtomicU64>,
    /// Set once stdin writes fail or the reader reaches EOF; later calls
    /// fail fast with a transport error.
    broken: AtomicBool,
}

/// Removes the pending entry when the calling task is dropped before a reply
/// arrives (client disconnect). The reader removes entries before fulfilling
/// them, so a completed call's guard is a no-op.
struct PendingGuard {
    pending: PendingMap,
    id: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let removed = self
            .pending
            .lock()
            .expect("pending lock poisoned")
            .remove(&self.id)
            .is_some();
        if removed {
            tracing::debug!(request_id = self.id, "pending call cancelled before reply");
        }
    }
}

impl Multiplexer {
    pub fn new(server_id: String, stdin: ChildStdin, next_id: Arc<AtomicU64>) -> Self {
        Multiplexer {
            server_id,
            stdin: tokio::sync::Mutex::new(stdin),
            pending: Arc::new(Mutex::new(HashMap::new())),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            next_id,
            broken: AtomicBool::new(false),
        }
    }

    /// Allocate the next gateway request id.
    pub fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Number of unresolved pending calls.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().expect("pending lock poisoned").len()
    }

    /// Send a request and await its correlated reply or the deadline.
    ///
    /// Returns the raw response frame; callers re-stamp the client-side id.
    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> crate::Result<Value> {
        let id = self.allocate_id();
        let (rx, _guard) = self.register_and_send(id, method, params).await?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            // Sender dropped: pending map was drained by a transport failure.
            Ok(Err(_)) => Err(GatewayError::Io(
                self.server_id.clone(),
                "child closed before replying".to_string(),
            )),
            Err(_) => Err(GatewayError::Timeout(self.server_id.clone())),
        }
    }

    /// Register a pending entry and write the framed request.
    ///
    /// Used by `call` and by the SSE bridge (which registers a session for
    /// the same id instead of awaiting the oneshot).
    async fn register_and_send(
        &self,
        id: u64,
        method: &str,
        params: Option<Value>,
    ) -> crate::Result<(oneshot::Receiver<crate::Result<Value>>, PendingGuard)> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(GatewayError::Io(
                self.server_id.clone(),
                "child transport is closed".to_string(),
            ));
        }
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .insert(id, tx);
        let guard = PendingGuard {
            pending: self.pending.clone(),
            id,
        };

        let mut frame = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
        });
        if let Some(params) = params {
            frame["params"] = params;
        }
        if let Err(e) = self.write_line(&frame).await {
            drop(guard); // unregister our own entry first
            self.fail_all_pending("stdin write failed");
            return Err(e);
        }
        Ok((rx, guard))
    }

    /// Send a request on behalf of a stream session: the session channel
    /// receives notifications and the terminal response; no oneshot is kept.
    pub async fn send_for_session(
        &self,
        correlation_id: u64,
        method: &str,
        params: Option<Value>,
        session_tx: mpsc::Sender<Value>,
    ) -> crate::Result<()> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(GatewayError::Io(
                self.server_id.clone(),
                "child transport is closed".to_string(),
            ));
        }
        self.sessions
            .lock()
            .expect("sessions lock poisoned")
            .insert(correlation_id, session_tx);

        let mut frame = json!({
            "jsonrpc": "2.0",
            "id": correlation_id,
            "method": method,
        });
        if let Some(params) = params {
            frame["params"] = params;
        }
        if let Err(e) = self.write_line(&frame).await {
            self.unregister_session(correlation_id);
            self.fail_all_pending("stdin write failed");
            return Err(e);
        }
        Ok(())
    }

    /// Fire-and-forget notification to the child (no id, no reply).
    pub async fn notify(&self, method: &str, params: Option<Value>) -> crate::Result<()> {
        let mut frame = json!({
            "jsonrpc": "2.0",
            "method": method,
        });
        if let Some(params) = params {
            frame["params"] = params;
        }
        self.write_line(&frame).await
    }

    pub fn unregister_session(&self, correlation_id: u64) {
        self.sessions
            .lock()
            .expect("sessions lock poisoned")
            .remove(&correlation_id);
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.lock().expect("sessions lock poisoned").len()
    }

    /// Serialise a frame and emit it with a terminating newline, holding the
    /// stdin lock only for the write.
    async fn write_line(&self, frame: &Value) -> crate::Result<()> {
        let mut line = frame.to_string();
        line.push('\n');
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(line.as_bytes()).await.map_err(|e| {
            self.broken.store(true, Ordering::SeqCst);
            GatewayError::Io(self.server_id.clone(), e.to_string())
        })?;
        stdin.flush().await.map_err(|e| {
            self.broken.store(true, Ordering::SeqCst);
            GatewayError::Io(self.server_id.clone(), e.to_string())
        })
    }

    /// Fulfil every pending call with a transport error and drop all stream
    /// sessions. Invoked on write failure, reader EOF, and child exit.
    pub fn fail_all_pending(&self, reason: &str) {
        self.broken.store(true, Ordering::SeqCst);
        let drained: Vec<(u64, oneshot::Sender<crate::Result<Value>>)> = self
            .pending
            .lock()
            .expect("pending lock poisoned")
            .drain()
            .collect();
        for (id, tx) in drained {
            tracing::debug!(server = %self.server_id, request_id = id, "failing pending call");
            let _ = tx.send(Err(GatewayError::Io(
                self.server_id.clone(),
                reason.to_string(),
            )));
        }
        // Dropping the senders closes each session's stream.
        self.sessions.lock().expect("sessions lock poisoned").clear();
    }

    /// Dispatch one parsed inbound frame from the child.
    async fn dispatch(&self, frame: Value) {
        if let Some(id) = frame.get("id").and_then(parse_frame_id) {
            let slot = self
                .pending
                .lock()
                .expect("pending lock poisoned")
                .remove(&id);
            if let Some(tx) = slot {
                let _ = tx.send(Ok(frame));
                return;
            }
            // Terminal response for a stream session.
            let session = self
                .sessions
                .lock()
                .expect("sessions lock poisoned")
                .get(&id)
                .cloned();
            if let Some(tx) = session {
                if tx.send(frame).await.is_err() {
                    self.unregister_session(id);
                }
                return;
            }
            tracing::debug!(
                server = %self.server_id,
                request_id = id,
                "late or unknown reply, dropping"
            );
            return;
        }

        if frame.get("method").is_some() {
            self.route_notification(frame).await;
            return;
        }

        tracing::debug!(server = %self.server_id, "unmatched frame, dropping");
    }

    /// Route a notification to the stream session it addresses.
    ///
    /// Addressing: a `params._meta.progressToken` (or `params.id`) matching a
    /// session's correlation id wins; otherwise a sole active session
    /// receives it; otherwise the frame is dropped.
    async fn route_notification(&self, frame: Value) {
        let token = notification_token(&frame);
        let target = {
            let sessions = self.sessions.lock().expect("sessions lock poisoned");
            match token.and_then(|t| sessions.get(&t).map(|tx| (t, tx.clone()))) {
                Some(hit) => Some(hit),
                None if sessions.len() == 1 => sessions
                    .iter()
                    .next()
                    .map(|(id, tx)| (*id, tx.clone())),
                None => None,
            }
        };
        match target {
            Some((id, tx)) => {
                if tx.send(frame).await.is_err() {
                    self.unregister_session(id);
                }
            }
            None => {
                tracing::debug!(
                    server = %self.server_id,
                    "notification with no addressable session, dropping"
                );
            }
        }
    }

    /// Run the single reader loop over the child's stdout.
    ///
    /// On EOF or read error every pending entry is fulfilled with a transport
    /// error; the exit watcher handles the state transition.
    pub async fn read_loop(self: Arc<Self>, stdout: ChildStdout, cancel: CancellationToken) {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            if line.trim().is_empty() {
                                continue;
                            }
                            match serde_json::from_str::<Value>(&line) {
                                Ok(frame) => self.dispatch(frame).await,
                                Err(_) => {
                                    tracing::debug!(
                                        server = %self.server_id,
                                        line = %line,
                                        "discarding non-JSON stdout line"
                                    );
                                }
                            }
                        }
                        Ok(None) | Err(_) => break,
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
        self.fail_all_pending("child stdout closed");
    }
}

/// Gateway-assigned ids are numeric; children echoing them as strings are
/// tolerated.
fn parse_frame_id(id: &Value) -> Option<u64> {
    if let Some(n) = id.as_u64() {
        return Some(n);
    }
    id.as_str().and_then(|s| s.parse().ok())
}

/// Correlation token carried by a notification, if any.
fn notification_token(frame: &Value) -> Option<u64> {
    let params = frame.get("params")?;
    let token = params
        .pointer("/_meta/progressToken")
        .or_else(|| params.get("id"))?;
    parse_frame_id(token)
}
