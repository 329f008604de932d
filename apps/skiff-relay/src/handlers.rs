use axum::{extract::State, response::Json};
use serde::Serialize;

use crate::RelayState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: &'static str,
    sessions: usize,
}

/// Liveness probe for load balancers; reports the number of joined sessions.
pub async fn health_check(State(state): State<RelayState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        sessions: state.registry.len(),
    })
}
