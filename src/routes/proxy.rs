use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures::StreamExt;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::gateway::selector::{self, SelectError, Selection};
use crate::gateway::tokens;
use crate::routes::error::ProblemDetails;
use crate::state::AppState;

const BUFFERED_TIMEOUT: Duration = Duration::from_secs(60);
const STREAMING_TIMEOUT: Duration = Duration::from_secs(90);
const DONE_SENTINEL: &str = "data: [DONE]";

/// Wraps an error text so callers always receive a completion-shaped JSON
/// body instead of a bare transport failure.
fn error_envelope(text: &str) -> Value {
    json!({"choices": [{"message": {"role": "assistant", "content": text}}]})
}

/// Outbound header rewrite: everything is forwarded except `Host`,
/// `Content-Length` and `Accept-Encoding`; the provider's key replaces any
/// client `Authorization`; `Content-Type` is forced to JSON.
fn build_outbound_headers(inbound: &HeaderMap, api_key: Option<&str>) -> HeaderMap {
    let mut outbound = HeaderMap::new();
    for (name, value) in inbound {
        if *name == header::HOST || *name == header::CONTENT_LENGTH || *name == header::ACCEPT_ENCODING {
            continue;
        }
        outbound.append(name.clone(), value.clone());
    }
    if let Some(key) = api_key {
        match HeaderValue::from_str(&format!("Bearer {}", key)) {
            Ok(value) => {
                outbound.insert(header::AUTHORIZATION, value);
            }
            Err(_) => tracing::warn!("⚠️ [Dispatcher] provider api_key is not a valid header value"),
        }
    }
    outbound.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    outbound
}

/// GET|POST /v1/models — synthetic listing: the `auto` sentinel plus every
/// configured logical model.
pub async fn models(State(state): State<Arc<AppState>>) -> Json<Value> {
    let created = chrono::Utc::now().timestamp();
    let mut data = vec![json!({
        "id": "auto",
        "object": "model",
        "created": created,
        "owned_by": "gateway",
    })];
    for name in state.registry.model_names() {
        let owned_by = state
            .registry
            .routes_for(&name)
            .and_then(|routes| routes.keys().next().cloned())
            .unwrap_or_else(|| "gateway".to_string());
        data.push(json!({
            "id": name,
            "object": "model",
            "created": created,
            "owned_by": owned_by,
        }));
    }
    Json(json!({"object": "list", "data": data}))
}

/// POST /v1/{path} — the proxied chat-completion entry point.
pub async fn completions(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_id = Uuid::new_v4().to_string();
    state.log.request(&request_id, &String::from_utf8_lossy(&body));

    let mut payload: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(e) => {
            return ProblemDetails::malformed(format!("request body is not valid JSON: {}", e))
                .into_response()
        }
    };
    let Some(model) = payload.get("model").and_then(Value::as_str).map(str::to_string) else {
        return ProblemDetails::malformed("request body is missing 'model'").into_response();
    };
    let wants_stream = payload.get("stream").and_then(Value::as_bool).unwrap_or(false);
    let token_count = tokens::estimate_tokens(&payload);

    let selection = match selector::select(&state.registry, &state.governor, &model, token_count) {
        Ok(selection) => selection,
        Err(e @ SelectError::UnknownModel(_)) => {
            return ProblemDetails::unknown_model(e.to_string()).into_response()
        }
        Err(e @ SelectError::NoCapacity(_)) => {
            return ProblemDetails::no_capacity(e.to_string()).into_response()
        }
    };
    let Some(provider) = state.registry.provider(&selection.provider_id).cloned() else {
        // the selector only hands out registered ids
        return ProblemDetails::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Provider Missing",
            format!("provider '{}' disappeared after selection", selection.provider_id),
        )
        .into_response();
    };

    if let Some(upstream_model) = &selection.upstream_model {
        payload["model"] = json!(upstream_model);
    }
    let url = format!("{}/{}", provider.base_url.trim_end_matches('/'), path);
    let outbound = build_outbound_headers(&headers, provider.api_key.as_deref());

    tracing::info!(
        "📡 [Dispatcher] {} → {} via {} ({} tokens, stream={})",
        selection.model, url, selection.provider_id, token_count, wants_stream
    );

    if wants_stream {
        stream_upstream(state, request_id, selection, url, outbound, payload).await
    } else {
        buffer_upstream(state, request_id, selection, url, outbound, payload).await
    }
}

/// Buffered mode: one POST, full response relayed with the upstream status.
/// Transport failures become a 500 with a completion-shaped envelope so the
/// caller never sees a bare exception.
async fn buffer_upstream(
    state: Arc<AppState>,
    request_id: String,
    selection: Selection,
    url: String,
    outbound: HeaderMap,
    payload: Value,
) -> Response {
    let sent = state
        .http_client
        .post(&url)
        .headers(outbound)
        .json(&payload)
        .timeout(BUFFERED_TIMEOUT)
        .send()
        .await;

    let upstream = match sent {
        Ok(response) => response,
        Err(e) => {
            tracing::error!("❌ [Dispatcher] transport failure via {}: {}", selection.provider_id, e);
            state
                .log
                .error(&request_id, &format!("transport failure via {}: {}", selection.provider_id, e));
            return json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                error_envelope(&format!("upstream request failed: {}", e)).to_string(),
            );
        }
    };

    let status = upstream.status();
    let body_text = match upstream.text().await {
        Ok(text) => text,
        Err(e) => {
            tracing::error!("❌ [Dispatcher] body read via {} failed: {}", selection.provider_id, e);
            state
                .log
                .error(&request_id, &format!("body read via {} failed: {}", selection.provider_id, e));
            return json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                error_envelope(&format!("upstream body read failed: {}", e)).to_string(),
            );
        }
    };

    if status.as_u16() >= 400 {
        state.governor.record_error(&selection.provider_id);
        tracing::error!("❌ [Dispatcher] upstream {} via {}: {}", status, selection.provider_id, body_text);
        state.log.error(
            &request_id,
            &format!("upstream {} via {}: {}", status, selection.provider_id, body_text),
        );
        return json_response(status, error_envelope(&body_text).to_string());
    }

    state.log.response(&request_id, status.as_u16(), &body_text);
    json_response(status, body_text)
}

fn json_response(status: StatusCode, body: String) -> Response {
    (status, [(header::CONTENT_TYPE, "application/json")], body).into_response()
}

/// Streaming mode: upstream bytes are relayed verbatim as an SSE body while
/// the accumulated transcript is kept for the interaction log. Once the
/// first byte is out, failures can only surface as an in-band JSON chunk.
async fn stream_upstream(
    state: Arc<AppState>,
    request_id: String,
    selection: Selection,
    url: String,
    outbound: HeaderMap,
    payload: Value,
) -> Response {
    let sent = state
        .http_client
        .post(&url)
        .headers(outbound)
        .json(&payload)
        .timeout(STREAMING_TIMEOUT)
        .send()
        .await;

    let upstream = match sent {
        Ok(response) => response,
        Err(e) => {
            tracing::error!("❌ [Dispatcher] transport failure via {}: {}", selection.provider_id, e);
            state
                .log
                .error(&request_id, &format!("transport failure via {}: {}", selection.provider_id, e));
            let chunk = json!({"error": {"message": format!("upstream request failed: {}", e)}});
            return sse_response(StatusCode::INTERNAL_SERVER_ERROR, Body::from(chunk.to_string()));
        }
    };

    let status = upstream.status();
    if status.as_u16() >= 400 {
        let text = upstream.text().await.unwrap_or_default();
        state.governor.record_error(&selection.provider_id);
        tracing::error!("❌ [Dispatcher] upstream {} via {}: {}", status, selection.provider_id, text);
        state
            .log
            .error(&request_id, &format!("upstream {} via {}: {}", status, selection.provider_id, text));
        // best-effort decode so a JSON error body passes through unmangled
        let envelope: Value =
            serde_json::from_str(&text).unwrap_or_else(|_| json!({"error": {"message": text}}));
        return sse_response(status, Body::from(envelope.to_string()));
    }

    let log = state.log.clone();
    let provider_id = selection.provider_id.clone();
    let body_stream = async_stream::stream! {
        let mut chunks = upstream.bytes_stream();
        let mut transcript = String::new();
        loop {
            match chunks.next().await {
                Some(Ok(bytes)) => {
                    transcript.push_str(&String::from_utf8_lossy(&bytes));
                    yield Ok::<Bytes, std::convert::Infallible>(bytes);
                }
                Some(Err(e)) => {
                    // headers are long gone: the failure rides in-band
                    tracing::error!("❌ [Dispatcher] stream via {} aborted: {}", provider_id, e);
                    log.error(&request_id, &format!("stream via {} aborted: {}", provider_id, e));
                    let chunk = json!({"error": {"message": format!("stream aborted: {}", e)}});
                    yield Ok(Bytes::from(chunk.to_string()));
                    return;
                }
                None => break,
            }
        }
        if !transcript.contains(DONE_SENTINEL) {
            tracing::warn!("⚠️ [Dispatcher] stream via {} ended without a [DONE] marker", provider_id);
        }
        log.response(&request_id, status.as_u16(), &transcript);
    };

    sse_response(status, Body::from_stream(body_stream))
}

fn sse_response(status: StatusCode, body: Body) -> Response {
    (status, [(header::CONTENT_TYPE, "text/event-stream")], body).into_response()
}
