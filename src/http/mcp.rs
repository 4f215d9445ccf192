//! Per-server JSON-RPC and SSE endpoints.

use std::convert::Infallible;
use std::time::{Duration, Instant};

use axum::Json;
use axum::extract::{Path, State};
use axum::response::Sse;
use axum::response::sse::{Event, KeepAlive};
use futures::Stream;
use futures::StreamExt;
use serde_json::Value;
use tokio_stream::wrappers::ReceiverStream;
use tracing::Instrument as _;

use super::{ApiResult, AppState};
use crate::error::GatewayError;
use crate::server::sse;

/// Pieces of a client JSON-RPC request the gateway needs.
struct RpcRequest {
    method: String,
    params: Option<Value>,
    client_id: Option<Value>,
}

fn parse_rpc_request(server_id: &str, body: &Value) -> crate::Result<RpcRequest> {
    let method = body
        .get("method")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            GatewayError::InvalidConfig(
                server_id.to_string(),
                "body must be a JSON-RPC request with a 'method' field".to_string(),
            )
        })?
        .to_string();
    Ok(RpcRequest {
        method,
        params: body.get("params").cloned(),
        client_id: body.get("id").cloned(),
    })
}

/// Forward one request to the child and shape the reply, echoing the
/// client-provided id.
async fn dispatch_rpc(
    state: &AppState,
    server_id: &str,
    request: RpcRequest,
) -> crate::Result<Value> {
    let record = state.supervisor.get(server_id)?;
    let mux = record.mux().await?;
    let timeout = Duration::from_secs(record.config.call_timeout_secs);

    let span = tracing::info_span!("jsonrpc_call", server = %server_id, method = %request.method);
    state.metrics.active_requests.add(&[server_id], 1.0);
    let started = Instant::now();

    let result = mux
        .call(&request.method, request.params, timeout)
        .instrument(span)
        .await;

    state.metrics.active_requests.add(&[server_id], -1.0);
    state
        .metrics
        .request_duration_seconds
        .observe(&[server_id, &request.method], started.elapsed().as_secs_f64());
    let status = if result.is_ok() { "ok" } else { "error" };
    state
        .metrics
        .requests_total
        .inc(&[server_id, &request.method, status], 1.0);

    match result {
        Ok(mut frame) => {
            if let Some(id) = request.client_id {
                frame["id"] = id;
            }
            Ok(frame)
        }
        Err(e) => {
            state
                .metrics
                .errors_total
                .inc(&[server_id, e.kind()], 1.0);
            Err(e)
        }
    }
}

/// `POST /{serverId}/mcp` — synchronous JSON-RPC request/response.
pub async fn post_rpc(
    State(state): State<AppState>,
    Path(server_id): Path<String>,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    let request = parse_rpc_request(&server_id, &body)?;
    Ok(Json(dispatch_rpc(&state, &server_id, request).await?))
}

/// `GET /{serverId}/mcp/tools/list` — convenience shortcut.
pub async fn get_tools_list(
    State(state): State<AppState>,
    Path(server_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let request = RpcRequest {
        method: "tools/list".to_string(),
        params: None,
        client_id: None,
    };
    Ok(Json(dispatch_rpc(&state, &server_id, request).await?))
}

/// `POST /{serverId}/mcp/tools/call` — convenience shortcut; the body is the
/// `tools/call` params object.
pub async fn post_tools_call(
    State(state): State<AppState>,
    Path(server_id): Path<String>,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    let request = RpcRequest {
        method: "tools/call".to_string(),
        params: Some(body),
        client_id: None,
    };
    Ok(Json(dispatch_rpc(&state, &server_id, request).await?))
}

/// `POST /{serverId}/sse` — start a streaming session. The body is a
/// JSON-RPC request; the response is `text/event-stream`.
pub async fn post_sse(
    State(state): State<AppState>,
    Path(server_id): Path<String>,
    Json(body): Json<Value>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let request = parse_rpc_request(&server_id, &body)?;
    let record = state.supervisor.get(&server_id)?;
    let mux = record.mux().await?;
    let deadline = Duration::from_secs(record.config.stream_timeout_secs);

    let rx = sse::open_stream(
        server_id,
        mux,
        request.method,
        request.params,
        request.client_id,
        deadline,
        state.metrics.clone(),
    )
    .await?;

    let stream =
        ReceiverStream::new(rx).map(|payload| Ok(Event::default().data(payload)));
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}
