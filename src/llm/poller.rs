//! Prediction polling: create → poll → terminal state machine, plus the
//! local status store backing the prediction admin endpoint.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::replicate::{PredictionState, ReplicateClient};
use crate::error::GatewayError;
use crate::telemetry::GatewayMetrics;

/// Polling starts at one second and widens with elapsed time to this cap.
const POLL_INTERVAL_MAX: Duration = Duration::from_secs(5);

/// Latest known state of one prediction, kept for the duration of the
/// gateway process so the status endpoint answers without re-polling.
#[derive(Debug, Clone, Serialize)]
pub struct PredictionSnapshot {
    pub id: String,
    pub model: String,
    pub status: String,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub created_unix: u64,
    pub completed_unix: Option<u64>,
}

/// In-memory store of prediction snapshots.
#[derive(Default)]
pub struct PredictionStore {
    map: Mutex<HashMap<String, PredictionSnapshot>>,
}

impl PredictionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: &str, model: &str, status: &str) {
        let snapshot = PredictionSnapshot {
            id: id.to_string(),
            model: model.to_string(),
            status: status.to_string(),
            output: None,
            error: None,
            created_unix: unix_now(),
            completed_unix: None,
        };
        self.map
            .lock()
            .expect("prediction store lock poisoned")
            .insert(id.to_string(), snapshot);
    }

    pub fn update(&self, id: &str, status: &str, output: Option<Value>, error: Option<String>) {
        let mut map = self.map.lock().expect("prediction store lock poisoned");
        if let Some(snapshot) = map.get_mut(id) {
            snapshot.status = status.to_string();
            if output.is_some() {
                snapshot.output = output;
            }
            if error.is_some() {
                snapshot.error = error;
            }
            if matches!(status, "succeeded" | "failed" | "canceled" | "timeout") {
                snapshot.completed_unix = Some(unix_now());
            }
        }
    }

    pub fn get(&self, id: &str) -> crate::Result<PredictionSnapshot> {
        self.map
            .lock()
            .expect("prediction store lock poisoned")
            .get(id)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(id.to_string()))
    }
}

/// Poll interval for the given elapsed time: 1 s initially, widening to the
/// 5 s cap as the prediction ages.
fn poll_interval(elapsed: Duration) -> Duration {
    let secs = 1.0 + elapsed.as_secs_f64() / 10.0;
    Duration::from_secs_f64(secs.min(POLL_INTERVAL_MAX.as_secs_f64()))
}

/// Poll one prediction until a terminal state, the deadline, or cancellation.
///
/// On deadline the local view becomes "failed with timeout" without
/// cancelling upstream. Local cancellation records the prediction as
/// `canceled` and surfaces an `invalid_state` error, keeping it distinct
/// from a deadline timeout. Terminal transitions emit telemetry labelled by
/// model and status.
pub async fn poll_until_terminal(
    client: &ReplicateClient,
    store: &PredictionStore,
    metrics: &GatewayMetrics,
    model_id: &str,
    prediction_id: &str,
    deadline: Duration,
    cancel: CancellationToken,
) -> crate::Result<PredictionState> {
    let started = Instant::now();
    loop {
        let elapsed = started.elapsed();
        if elapsed >= deadline {
            store.update(prediction_id, "timeout", None, Some("deadline exceeded".into()));
            metrics.predictions_total.inc(&[model_id, "timeout"], 1.0);
            return Err(GatewayError::Timeout(model_id.to_string()));
        }
        let remaining = deadline - elapsed;
        let sleep = poll_interval(elapsed).min(remaining);
        tokio::select! {
            _ = tokio::time::sleep(sleep) => {}
            _ = cancel.cancelled() => {
                store.update(prediction_id, "canceled", None, Some("cancelled locally".into()));
                return Err(GatewayError::InvalidState(
                    model_id.to_string(),
                    format!("polling of prediction {prediction_id} was cancelled"),
                ));
            }
        }

        match client.get_prediction(prediction_id).await {
            Ok(state) => {
                store.update(
                    prediction_id,
                    state.status.as_str(),
                    state.output.clone(),
                    state.error.clone(),
                );
                if state.status.is_terminal() {
                    metrics
                        .predictions_total
                        .inc(&[model_id, state.status.as_str()], 1.0);
                    tracing::info!(
                        model = %model_id,
                        prediction = %prediction_id,
                        status = state.status.as_str(),
                        "prediction reached terminal state"
                    );
                    return Ok(state);
                }
            }
            Err(e) if e.is_retriable() => {
                // Transient poll failures ride the loop; the deadline bounds
                // how long we keep trying.
                tracing::debug!(
                    model = %model_id,
                    prediction = %prediction_id,
                    error = %e,
                    "poll attempt failed"
                );
            }
            Err(e) => {
                store.update(prediction_id, "failed", None, Some(e.to_string()));
                metrics.predictions_total.inc(&[model_id, "failed"], 1.0);
                return Err(e);
            }
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
