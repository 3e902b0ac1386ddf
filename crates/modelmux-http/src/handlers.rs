use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, RawQuery, State};
use axum::response::Response;
use bytes::Bytes;
use futures_util::StreamExt;
use http::{HeaderMap, HeaderValue, StatusCode};
use http::header::CONTENT_TYPE;
use modelmux_core::{ErrorRecord, SourceFormat};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::HttpState;
use crate::envelope::error_response;

const SSE_CONTENT_TYPE: &str = "text/event-stream";
const JSON_CONTENT_TYPE: &str = "application/json";

pub async fn openai_chat(
    State(state): State<Arc<HttpState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dialect_call(state, SourceFormat::OpenAiChat, headers, body, String::new()).await
}

pub async fn openai_responses(
    State(state): State<Arc<HttpState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dialect_call(
        state,
        SourceFormat::OpenAiResponses,
        headers,
        body,
        String::new(),
    )
    .await
}

pub async fn claude_messages(
    State(state): State<Arc<HttpState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dialect_call(state, SourceFormat::Claude, headers, body, String::new()).await
}

pub async fn claude_count_tokens(
    State(state): State<Arc<HttpState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(record) = state.access.authenticate(&headers) {
        return error_response(SourceFormat::Claude, &record);
    }
    let Some(model) = model_from_body(&body) else {
        return missing_model(SourceFormat::Claude);
    };
    count_call(state, SourceFormat::Claude, model, body, String::new()).await
}

/// Gemini packs the operation into the path: `{model}:generateContent`,
/// `{model}:streamGenerateContent`, or `{model}:countTokens`.
pub async fn gemini_action(
    State(state): State<Arc<HttpState>>,
    Path(model_action): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(record) = state.access.authenticate(&headers) {
        return error_response(SourceFormat::Gemini, &record);
    }
    let alt = alt_from_query(query.as_deref());
    let (model, action) = match model_action.split_once(':') {
        Some((model, action)) => (model.to_string(), action),
        None => {
            return error_response(
                SourceFormat::Gemini,
                &ErrorRecord {
                    status: StatusCode::NOT_FOUND,
                    message: "missing model action".to_string(),
                    headers: None,
                },
            );
        }
    };
    match action {
        "generateContent" => unary_call(state, SourceFormat::Gemini, model, body, alt).await,
        "streamGenerateContent" => stream_call(state, SourceFormat::Gemini, model, body, alt).await,
        "countTokens" => count_call(state, SourceFormat::Gemini, model, body, alt).await,
        _ => error_response(
            SourceFormat::Gemini,
            &ErrorRecord {
                status: StatusCode::NOT_FOUND,
                message: format!("unknown action {action}"),
                headers: None,
            },
        ),
    }
}

/// Shared path for the body-driven dialects: authenticate, read `model` and
/// `stream` from the JSON body, then dispatch unary or streaming.
async fn dialect_call(
    state: Arc<HttpState>,
    source: SourceFormat,
    headers: HeaderMap,
    body: Bytes,
    alt: String,
) -> Response {
    if let Err(record) = state.access.authenticate(&headers) {
        return error_response(source, &record);
    }
    let parsed: Option<Value> = serde_json::from_slice(&body).ok();
    let Some(model) = parsed
        .as_ref()
        .and_then(|value| value.get("model"))
        .and_then(Value::as_str)
        .map(str::to_string)
    else {
        return missing_model(source);
    };
    let stream = parsed
        .as_ref()
        .and_then(|value| value.get("stream"))
        .and_then(Value::as_bool)
        .unwrap_or(false);

    if stream {
        stream_call(state, source, model, body, alt).await
    } else {
        unary_call(state, source, model, body, alt).await
    }
}

async fn unary_call(
    state: Arc<HttpState>,
    source: SourceFormat,
    model: String,
    body: Bytes,
    alt: String,
) -> Response {
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    match state
        .pipeline
        .execute(&cancel, source, &model, &body, &alt)
        .await
    {
        Ok(payload) => {
            capture_response(&state, &payload);
            json_response(payload)
        }
        Err(record) => error_response(source, &record),
    }
}

async fn count_call(
    state: Arc<HttpState>,
    source: SourceFormat,
    model: String,
    body: Bytes,
    alt: String,
) -> Response {
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    match state
        .pipeline
        .execute_count(&cancel, source, &model, &body, &alt)
        .await
    {
        Ok(payload) => {
            capture_response(&state, &payload);
            json_response(payload)
        }
        Err(record) => error_response(source, &record),
    }
}

async fn stream_call(
    state: Arc<HttpState>,
    source: SourceFormat,
    model: String,
    body: Bytes,
    alt: String,
) -> Response {
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let mut handles = state
        .pipeline
        .execute_stream(&cancel, source, &model, &body, &alt)
        .await;

    // Decide between an error response and a stream on the first event; once
    // the status line is out there is no way back.
    enum First {
        Chunk(Bytes),
        Error(ErrorRecord),
        Finished,
    }
    let first = tokio::select! {
        biased;
        record = handles.errors.recv() => match record {
            Some(record) => First::Error(record),
            None => match handles.data.recv().await {
                Some(chunk) => First::Chunk(chunk),
                None => First::Finished,
            },
        },
        chunk = handles.data.recv() => match chunk {
            Some(chunk) => First::Chunk(chunk),
            None => match handles.errors.recv().await {
                Some(record) => First::Error(record),
                None => First::Finished,
            },
        },
    };

    let content_type = if alt.is_empty() {
        SSE_CONTENT_TYPE
    } else {
        JSON_CONTENT_TYPE
    };
    match first {
        First::Error(record) => error_response(source, &record),
        First::Finished => {
            let mut response = Response::new(Body::empty());
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
            response
        }
        First::Chunk(chunk) => {
            // The drop guard rides inside the body stream: a disconnecting
            // client cancels the upstream call.
            let head = futures_util::stream::once(async move { Ok::<Bytes, Infallible>(chunk) });
            let rest = futures_util::stream::unfold(
                (handles.data, guard),
                |(mut data, guard)| async move {
                    data.recv()
                        .await
                        .map(|chunk| (Ok::<Bytes, Infallible>(chunk), (data, guard)))
                },
            );
            let mut response = Response::new(Body::from_stream(head.chain(rest)));
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
            response
        }
    }
}

fn json_response(payload: Bytes) -> Response {
    let mut response = Response::new(Body::from(payload));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT_TYPE));
    response
}

fn missing_model(source: SourceFormat) -> Response {
    error_response(
        source,
        &ErrorRecord {
            status: StatusCode::BAD_REQUEST,
            message: "missing model in request body".to_string(),
            headers: None,
        },
    )
}

fn capture_response(state: &HttpState, payload: &[u8]) {
    if state.request_log {
        debug!(
            bytes = payload.len(),
            body = %String::from_utf8_lossy(&payload[..payload.len().min(2048)]),
            "captured upstream response"
        );
    }
}

/// `alt` or `$alt` from the query string; `sse` is the default and maps to
/// the empty hint.
fn alt_from_query(query: Option<&str>) -> String {
    let Some(query) = query else {
        return String::new();
    };
    for pair in query.split('&') {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        if key == "alt" || key == "$alt" {
            if value == "sse" {
                return String::new();
            }
            return value.to_string();
        }
    }
    String::new()
}

fn model_from_body(body: &[u8]) -> Option<String> {
    serde_json::from_slice::<Value>(body)
        .ok()?
        .get("model")?
        .as_str()
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alt_query_parsing() {
        assert_eq!(alt_from_query(None), "");
        assert_eq!(alt_from_query(Some("alt=sse")), "");
        assert_eq!(alt_from_query(Some("alt=json")), "json");
        assert_eq!(alt_from_query(Some("$alt=media&key=abc")), "media");
        assert_eq!(alt_from_query(Some("key=abc")), "");
    }

    #[test]
    fn model_extraction_from_body() {
        assert_eq!(
            model_from_body(br#"{"model":"gpt-5","messages":[]}"#),
            Some("gpt-5".to_string())
        );
        assert_eq!(model_from_body(br#"{"messages":[]}"#), None);
        assert_eq!(model_from_body(b"not json"), None);
    }
}
