use std::{net::SocketAddr, sync::Arc};

use axum::{
    Router,
    body::Bytes,
    extract::State,
    http::{StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
    routing::post,
};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::net::TcpListener;

use crate::modules::defs::RpcRegistry;
use crate::runtime::follower::TipTracker;

const JSONRPC_VERSION: &str = "2.0";

// Built-in root method: the height the index has consumed.
const ROOT_METHOD_GET_INDEX_HEIGHT: &str = "getindexheight";

#[derive(Clone)]
pub struct RpcState {
    pub registry: RpcRegistry,
    pub tracker: Arc<TipTracker>,
}

#[derive(Serialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Serialize)]
struct JsonRpcResponse {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
    id: Value,
}

fn ok_response(id: Value, result: Value) -> JsonRpcResponse {
    JsonRpcResponse { jsonrpc: JSONRPC_VERSION, result: Some(result), error: None, id }
}

fn err_response(id: Value, code: i64, message: &str) -> JsonRpcResponse {
    JsonRpcResponse {
        jsonrpc: JSONRPC_VERSION,
        result: None,
        error: Some(JsonRpcError { code, message: message.to_string() }),
        id,
    }
}

async fn handle_request(state: &RpcState, obj: &serde_json::Map<String, Value>) -> JsonRpcResponse {
    let id = match obj.get("id") {
        Some(v @ (Value::String(_) | Value::Number(_) | Value::Null)) => v.clone(),
        _ => Value::Null,
    };

    match obj.get("jsonrpc") {
        Some(Value::String(s)) if s == JSONRPC_VERSION => {}
        _ => return err_response(id, -32600, "Invalid Request"),
    }

    let method = match obj.get("method") {
        Some(Value::String(m)) => m.as_str(),
        _ => return err_response(id, -32600, "Invalid Request"),
    };

    let params = match obj.get("params") {
        None => Value::Null,
        Some(v @ (Value::Array(_) | Value::Object(_))) => v.clone(),
        Some(_) => return err_response(id, -32602, "Invalid params"),
    };

    if method == ROOT_METHOD_GET_INDEX_HEIGHT {
        let height = state.tracker.indexed_height();
        return ok_response(id, json!({ "height": height }));
    }

    if !state.registry.has_method(method).await {
        return err_response(id, -32601, "Method not found");
    }

    let result = state.registry.call(method, params).await;
    ok_response(id, result)
}

async fn handle_rpc(State(state): State<Arc<RpcState>>, body: Bytes) -> Response {
    let value: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(_) => {
            return json_body(&err_response(Value::Null, -32700, "Parse error"));
        }
    };

    match value {
        Value::Object(obj) => json_body(&handle_request(&state, &obj).await),
        _ => json_body(&err_response(Value::Null, -32600, "Invalid Request")),
    }
}

#[inline]
fn json_body(resp: &JsonRpcResponse) -> Response {
    let body = serde_json::to_vec(resp).unwrap_or_else(|_| b"{}".to_vec());
    (StatusCode::OK, [(CONTENT_TYPE, "application/json")], body).into_response()
}

pub async fn run_rpc(
    registry: RpcRegistry,
    tracker: Arc<TipTracker>,
    addr: SocketAddr,
) -> anyhow::Result<()> {
    let state = Arc::new(RpcState { registry, tracker });
    let app = Router::new().route("/rpc", post(handle_rpc)).with_state(state);

    eprintln!("[rpc] listening on {addr}");
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}
