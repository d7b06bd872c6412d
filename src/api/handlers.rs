use std::sync::Arc;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::{OutcomeResponse, parse_parameters};

use super::AppState;
use super::errors::AppError;

// --- Request/Response types ---

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartFlowRequest {
    /// Caller-chosen idempotency key.
    pub client_id: String,
    pub flow_name: String,
    #[serde(default)]
    pub parameters: FlowParameters,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowParameters {
    /// Named flow parameters, as a JSON object encoded in a string.
    pub parameters_in_json: String,
}

impl Default for FlowParameters {
    fn default() -> Self {
        Self {
            parameters_in_json: "{}".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct FlowHandle {
    pub uuid: Uuid,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartFlowResponse {
    pub client_id: String,
    pub flow_id: FlowHandle,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

// --- Handlers ---

/// GET /flowstarter/registeredflows
pub async fn registered_flows(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<String>>, AppError> {
    Ok(Json(state.executor.registered_flows().await?))
}

/// POST /flowstarter/startflow
pub async fn start_flow(
    State(state): State<Arc<AppState>>,
    body: Result<Json<StartFlowRequest>, JsonRejection>,
) -> Result<Json<StartFlowResponse>, AppError> {
    let Json(req) = body.map_err(|e| AppError::BadRequest(e.body_text()))?;

    if req.client_id.trim().is_empty() {
        return Err(AppError::BadRequest("'clientId' must not be empty".to_string()));
    }
    if req.flow_name.trim().is_empty() {
        return Err(AppError::BadRequest("'flowName' must not be empty".to_string()));
    }

    let parameters = parse_parameters(&req.parameters.parameters_in_json)?;
    let started = state
        .executor
        .start_flow(&req.client_id, &req.flow_name, &parameters)
        .await?;

    Ok(Json(StartFlowResponse {
        client_id: started.idempotency_key,
        flow_id: FlowHandle {
            uuid: started.execution_id,
        },
    }))
}

/// GET /flowstarter/flowoutcomeforclientid/{clientid}
pub async fn flow_outcome_for_client_id(
    State(state): State<Arc<AppState>>,
    Path(client_id): Path<String>,
) -> Result<Json<OutcomeResponse>, AppError> {
    Ok(Json(state.outcomes.get_by_key(&client_id).await?))
}

/// GET /flowstarter/flowoutcome/{flowid}
pub async fn flow_outcome(
    State(state): State<Arc<AppState>>,
    Path(flow_id): Path<String>,
) -> Result<Json<OutcomeResponse>, AppError> {
    let flow_id = parse_flow_id(&flow_id)?;
    Ok(Json(state.outcomes.get_by_execution_id(flow_id).await?))
}

/// POST /flowmanagerrpcops/killflow/{flowid}
pub async fn kill_flow(
    State(state): State<Arc<AppState>>,
    Path(flow_id): Path<String>,
) -> Result<Json<bool>, AppError> {
    let flow_id = parse_flow_id(&flow_id)?;
    Ok(Json(state.outcomes.kill_flow(flow_id).await?))
}

/// GET /flowmanagerrpcops/listactive
pub async fn list_active(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Uuid>>, AppError> {
    Ok(Json(state.outcomes.list_active().await?))
}

/// GET /flowstarter/getprotocolversion, GET /flowmanagerrpcops/getprotocolversion
pub async fn protocol_version(
    State(state): State<Arc<AppState>>,
) -> Result<Json<i64>, AppError> {
    Ok(Json(state.executor.protocol_version().await?))
}

/// GET /health
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// --- Helpers ---

fn parse_flow_id(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw)
        .map_err(|e| AppError::BadRequest(format!("Invalid flow id '{}': {}", raw, e)))
}
