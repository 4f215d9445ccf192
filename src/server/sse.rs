//! SSE bridge: forwards a JSON-RPC request to a child and streams the
//! notifications addressed to the session back to the HTTP client.
//!
//! The session terminates on the child's terminal response (forwarded as a
//! final event followed by `[DONE]`), on client disconnect (the child is sent
//! a cancellation notification), or on the per-stream deadline. Failures are
//! emitted as a final `{error_kind, message}` frame so clients consuming a
//! partial response can tell clean completion from failure.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::mpsc;

use super::mux::{Multiplexer, SESSION_QUEUE_DEPTH};
use crate::telemetry::GatewayMetrics;

/// Sentinel emitted as the last `data:` payload of every completed stream.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Forward `method`/`params` to the child and return a receiver of `data:`
/// payloads for the HTTP layer to frame as SSE events.
///
/// `client_id` re-stamps the terminal response so the client sees its own
/// request id. Event order preserves the order frames arrived from the child.
pub async fn open_stream(
    server_id: String,
    mux: Arc<Multiplexer>,
    method: String,
    params: Option<Value>,
    client_id: Option<Value>,
    deadline: Duration,
    metrics: GatewayMetrics,
) -> crate::Result<mpsc::Receiver<String>> {
    let correlation_id = mux.allocate_id();
    let (session_tx, session_rx) = mpsc::channel(SESSION_QUEUE_DEPTH);
    mux.send_for_session(correlation_id, &method, params, session_tx)
        .await?;

    metrics.active_streams.add(&[&server_id], 1.0);
    let (event_tx, event_rx) = mpsc::channel(SESSION_QUEUE_DEPTH);
    tokio::spawn(run_session(
        server_id,
        mux,
        correlation_id,
        client_id,
        deadline,
        session_rx,
        event_tx,
        metrics,
    ));
    Ok(event_rx)
}

#[allow(clippy::too_many_arguments)]
async fn run_session(
    server_id: String,
    mux: Arc<Multiplexer>,
    correlation_id: u64,
    client_id: Option<Value>,
    deadline: Duration,
    mut session_rx: mpsc::Receiver<Value>,
    event_tx: mpsc::Sender<String>,
    metrics: GatewayMetrics,
) {
    let deadline_sleep = tokio::time::sleep(deadline);
    tokio::pin!(deadline_sleep);

    // completion_status label: completed | broken_pipe | timeout | error
    let status = loop {
        tokio::select! {
            frame = session_rx.recv() => {
                match frame {
                    None => {
                        // Transport failure dropped the session sender.
                        let payload = json!({
                            "error_kind": "io_error",
                            "message": "child transport closed",
                        });
                        let _ = event_tx.send(payload.to_string()).await;
                        break "error";
                    }
                    Some(mut frame) => {
                        let terminal = frame.get("id").is_some();
                        if terminal {
                            if let Some(ref id) = client_id {
                                frame["id"] = id.clone();
                            }
                        }
                        if event_tx.send(frame.to_string()).await.is_err() {
                            // Client went away mid-stream.
                            break "broken_pipe";
                        }
                        if terminal {
                            if event_tx.send(DONE_SENTINEL.to_string()).await.is_err() {
                                break "broken_pipe";
                            }
                            break "completed";
                        }
                    }
                }
            }
            _ = &mut deadline_sleep => {
                let payload = json!({
                    "error_kind": "timeout",
                    "message": format!("stream deadline of {:?} elapsed", deadline),
                });
                let _ = event_tx.send(payload.to_string()).await;
                break "timeout";
            }
        }
    };

    mux.unregister_session(correlation_id);
    if status != "completed" {
        // Best effort: tell the child its work is no longer wanted.
        let _ = mux
            .notify(
                "notifications/cancelled",
                Some(json!({ "requestId": correlation_id, "reason": status })),
            )
            .await;
    }
    metrics.active_streams.add(&[&server_id], -1.0);
    metrics
        .streaming_requests_total
        .inc(&[&server_id, status], 1.0);
    tracing::debug!(server = %server_id, correlation_id, status, "stream session closed");
}
