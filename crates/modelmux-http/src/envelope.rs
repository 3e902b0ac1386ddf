use axum::body::Body;
use axum::response::Response;
use http::StatusCode;
use http::header::CONTENT_TYPE;
use modelmux_core::{ErrorRecord, SourceFormat};
use serde_json::json;

/// Serializes an [`ErrorRecord`] into the dialect's error envelope, applying
/// the record's status and merging its passthrough headers verbatim.
pub fn error_response(source: SourceFormat, record: &ErrorRecord) -> Response {
    let payload = match source {
        SourceFormat::OpenAiChat | SourceFormat::OpenAiResponses => json!({
            "error": {
                "message": record.message,
                "type": openai_error_type(record.status),
                "code": record.status.as_u16(),
            }
        }),
        SourceFormat::Claude => json!({
            "type": "error",
            "error": {
                "type": claude_error_type(record.status),
                "message": record.message,
            }
        }),
        SourceFormat::Gemini => json!({
            "error": {
                "code": record.status.as_u16(),
                "message": record.message,
                "status": gemini_status(record.status),
            }
        }),
    };

    let mut response = Response::new(Body::from(payload.to_string()));
    *response.status_mut() = record.status;
    if let Some(headers) = &record.headers {
        response.headers_mut().extend(headers.clone());
    }
    response
        .headers_mut()
        .insert(CONTENT_TYPE, http::HeaderValue::from_static("application/json"));
    response
}

fn openai_error_type(status: StatusCode) -> &'static str {
    match status.as_u16() {
        401 | 403 => "authentication_error",
        404 => "not_found_error",
        429 => "rate_limit_error",
        400..=499 => "invalid_request_error",
        _ => "api_error",
    }
}

fn claude_error_type(status: StatusCode) -> &'static str {
    match status.as_u16() {
        400 => "invalid_request_error",
        401 => "authentication_error",
        403 => "permission_error",
        404 => "not_found_error",
        429 => "rate_limit_error",
        529 => "overloaded_error",
        _ => "api_error",
    }
}

fn gemini_status(status: StatusCode) -> &'static str {
    match status.as_u16() {
        400 => "INVALID_ARGUMENT",
        401 => "UNAUTHENTICATED",
        403 => "PERMISSION_DENIED",
        404 => "NOT_FOUND",
        429 => "RESOURCE_EXHAUSTED",
        500 => "INTERNAL",
        503 => "UNAVAILABLE",
        504 => "DEADLINE_EXCEEDED",
        _ => "UNKNOWN",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderMap;

    fn record(status: u16) -> ErrorRecord {
        ErrorRecord {
            status: StatusCode::from_u16(status).unwrap(),
            message: "boom".to_string(),
            headers: None,
        }
    }

    #[test]
    fn openai_envelope_shape() {
        let response = error_response(SourceFormat::OpenAiChat, &record(429));
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn passthrough_headers_are_merged() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", "12".parse().unwrap());
        let record = ErrorRecord {
            status: StatusCode::TOO_MANY_REQUESTS,
            message: "slow down".to_string(),
            headers: Some(headers),
        };
        let response = error_response(SourceFormat::Claude, &record);
        assert_eq!(response.headers().get("retry-after").unwrap(), "12");
    }

    #[test]
    fn gemini_status_names() {
        assert_eq!(gemini_status(StatusCode::TOO_MANY_REQUESTS), "RESOURCE_EXHAUSTED");
        assert_eq!(gemini_status(StatusCode::from_u16(418).unwrap()), "UNKNOWN");
    }
}
