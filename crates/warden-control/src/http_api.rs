use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;

use warden_proto::commands::{
    CreateInstanceRequest, DeleteInstanceRequest, ServerTarget, CMD_INSTANCES_CREATE,
    CMD_INSTANCES_DELETE, CMD_INSTANCES_LIST, CMD_START, CMD_STATUS, CMD_STOP,
};
use warden_proto::Message;

use crate::registry::DEFAULT_COMMAND_TIMEOUT;
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/agents", get(list_agents))
        .route("/agents/{agent_id}", get(get_agent))
        .route("/agents/{agent_id}/servers/{server}/status", get(server_status))
        .route("/agents/{agent_id}/servers/{server}/start", post(server_start))
        .route("/agents/{agent_id}/servers/{server}/stop", post(server_stop))
        .route("/agents/{agent_id}/instances", get(instances_list))
        .route("/agents/{agent_id}/instances/create", post(instances_create))
        .route("/agents/{agent_id}/instances/delete", post(instances_delete))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state)
}

fn bad_request(body: serde_json::Value) -> Response {
    (StatusCode::BAD_REQUEST, Json(body)).into_response()
}

/// Relay conventions: agent errors come back as 400 with context, a
/// non-empty payload is forwarded verbatim, an empty one becomes a
/// generic ok.
fn relay_response(agent_id: &str, server: Option<&str>, resp: Message) -> Response {
    if !resp.error.is_empty() {
        let mut body = json!({ "agent_id": agent_id, "error": resp.error });
        if let Some(server) = server {
            body["server"] = json!(server);
        }
        return bad_request(body);
    }

    match resp.payload {
        Some(payload) if !payload.is_null() => (StatusCode::OK, Json(payload)).into_response(),
        _ => {
            let mut body = json!({ "agent_id": agent_id, "ok": true });
            if let Some(server) = server {
                body["server"] = json!(server);
            }
            (StatusCode::OK, Json(body)).into_response()
        }
    }
}

async fn list_agents(State(state): State<AppState>) -> Response {
    let agents = state.registry.list_agents().await;
    Json(json!({ "agents": agents })).into_response()
}

async fn get_agent(State(state): State<AppState>, Path(agent_id): Path<String>) -> Response {
    match state.registry.get_agent(&agent_id).await {
        Some(info) => Json(info).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "agent not connected" })),
        )
            .into_response(),
    }
}

async fn relay_server_command(
    state: AppState,
    agent_id: String,
    server: String,
    request_type: &str,
) -> Response {
    let target = ServerTarget {
        server: server.clone(),
    };
    match state
        .registry
        .send_command(&agent_id, request_type, &target, DEFAULT_COMMAND_TIMEOUT)
        .await
    {
        Ok(resp) => relay_response(&agent_id, Some(&server), resp),
        Err(err) => bad_request(json!({ "error": err.to_string() })),
    }
}

async fn server_status(
    State(state): State<AppState>,
    Path((agent_id, server)): Path<(String, String)>,
) -> Response {
    relay_server_command(state, agent_id, server, CMD_STATUS).await
}

async fn server_start(
    State(state): State<AppState>,
    Path((agent_id, server)): Path<(String, String)>,
) -> Response {
    relay_server_command(state, agent_id, server, CMD_START).await
}

async fn server_stop(
    State(state): State<AppState>,
    Path((agent_id, server)): Path<(String, String)>,
) -> Response {
    relay_server_command(state, agent_id, server, CMD_STOP).await
}

async fn instances_list(State(state): State<AppState>, Path(agent_id): Path<String>) -> Response {
    match state
        .registry
        .send_command(
            &agent_id,
            CMD_INSTANCES_LIST,
            &json!({}),
            DEFAULT_COMMAND_TIMEOUT,
        )
        .await
    {
        Ok(resp) => relay_response(&agent_id, None, resp),
        Err(err) => bad_request(json!({ "error": err.to_string() })),
    }
}

async fn instances_create(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    body: Result<Json<CreateInstanceRequest>, JsonRejection>,
) -> Response {
    let Ok(Json(req)) = body else {
        return bad_request(json!({ "error": "invalid json body" }));
    };
    match state
        .registry
        .send_command(&agent_id, CMD_INSTANCES_CREATE, &req, DEFAULT_COMMAND_TIMEOUT)
        .await
    {
        Ok(resp) => relay_response(&agent_id, None, resp),
        Err(err) => bad_request(json!({ "error": err.to_string() })),
    }
}

async fn instances_delete(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    body: Result<Json<DeleteInstanceRequest>, JsonRejection>,
) -> Response {
    let Ok(Json(req)) = body else {
        return bad_request(json!({ "error": "invalid json body" }));
    };
    match state
        .registry
        .send_command(&agent_id, CMD_INSTANCES_DELETE, &req, DEFAULT_COMMAND_TIMEOUT)
        .await
    {
        Ok(resp) => relay_response(&agent_id, None, resp),
        Err(err) => bad_request(json!({ "error": err.to_string() })),
    }
}
