use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use dbward_core::{evaluate, ActionKind};
use dbward_tools::{Adapter, DenialReason};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::wiring::AppState;

/// Reference HTTP transport. Contains no security logic of its own: it
/// deserializes the request and calls `ExecutionBoundary::execute_tool`,
/// nothing else. This is a concrete stand-in for the protocol transport,
/// which is otherwise an external collaborator out of scope.
pub fn router(state: Arc<AppState>, adapter: Arc<dyn Adapter>) -> Router {
    Router::new()
        .route("/v1/tools/call", post(call_tool))
        .route("/v1/tools", get(list_tools))
        .with_state((state, adapter))
}

#[derive(Debug, Deserialize)]
struct CallToolRequest {
    name: String,
    #[serde(default)]
    arguments: Value,
}

/// `POST /v1/tools/call`. Always returns HTTP 200 — the denial code lives
/// in the body, not the status line, since these are application-level
/// decisions rather than transport errors.
async fn call_tool(
    State((state, adapter)): State<(Arc<AppState>, Arc<dyn Adapter>)>,
    Json(req): Json<CallToolRequest>,
) -> Json<Value> {
    let outcome = state
        .boundary
        .execute_tool(&req.name, req.arguments, &state.session, adapter.as_ref())
        .await;

    match outcome {
        Ok(result) => Json(json!({ "ok": true, "content": result.content })),
        Err(denial) => {
            let details = match denial.reason {
                DenialReason::Authz(reason) => Some(json!({ "sub_reason": serde_json::to_value(reason).unwrap_or_default() })),
                DenialReason::Quota(reason) => Some(json!({ "sub_reason": serde_json::to_value(reason).unwrap_or_default() })),
                DenialReason::Tool(_) | DenialReason::None => None,
            };
            let code = serde_json::to_value(denial.code).unwrap_or_default();
            Json(json!({ "ok": false, "code": code, "details": details }))
        }
    }
}

/// `GET /v1/tools`. Goes through the capability evaluator per tool with
/// action `TOOL_LIST`; `target: "*"` is never implied — only tools the
/// caller actually holds a grant for are listed, matching the evaluator's
/// exact-match contract.
async fn list_tools(State((state, _adapter)): State<(Arc<AppState>, Arc<dyn Adapter>)>) -> Json<Value> {
    let Ok(capabilities) = state.session.capabilities() else {
        return Json(json!({ "ok": false, "code": "SESSION_CONTEXT_INVALID" }));
    };

    let visible: Vec<Value> = state
        .boundary
        .registry()
        .schemas()
        .into_iter()
        .filter(|schema| {
            let Some(name) = schema.get("name").and_then(Value::as_str) else {
                return false;
            };
            evaluate(capabilities, ActionKind::ToolList, name, chrono::Utc::now()).allowed
        })
        .collect();

    Json(json!({ "ok": true, "content": { "tools": visible } }))
}
